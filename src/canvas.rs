//! The server capability handed to hooks.
//!
//! Hooks run on session tasks and on the render thread. They may touch the
//! framebuffer directly, but anything that needs the display (title, save)
//! is queued as a [`DisplayRequest`] and applied by the render loop at the
//! start of its next tick.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use crate::framebuffer::Framebuffer;

/// Work queued for the render thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisplayRequest {
    /// Change the window/terminal title.
    SetTitle(String),
    /// Write the current canvas to this path.
    Save(PathBuf),
}

/// Queue of display requests, drained once per tick.
pub type DisplayRequestQueue = Arc<Mutex<Vec<DisplayRequest>>>;

/// Process-wide counters, owned by the server and shared by reference.
#[derive(Debug, Default)]
pub struct ServerStats {
    ticks: AtomicU64,
    pixels: AtomicU64,
    pixels_per_second: AtomicU64,
    clients: AtomicUsize,
}

impl ServerStats {
    /// Render ticks since startup.
    pub fn ticks(&self) -> u64 {
        self.ticks.load(Ordering::Relaxed)
    }

    /// Advance the tick counter, returning the new value.
    pub fn next_tick(&self) -> u64 {
        self.ticks.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Pixel writes since startup, across all sessions.
    pub fn pixels(&self) -> u64 {
        self.pixels.load(Ordering::Relaxed)
    }

    /// Count one pixel write.
    pub fn record_pixel(&self) {
        self.pixels.fetch_add(1, Ordering::Relaxed);
    }

    /// Pixel writes during the last full second.
    pub fn pixels_per_second(&self) -> u64 {
        self.pixels_per_second.load(Ordering::Relaxed)
    }

    /// Store the pixel rate measured by the render loop.
    pub fn set_pixels_per_second(&self, rate: u64) {
        self.pixels_per_second.store(rate, Ordering::Relaxed);
    }

    /// Currently registered sessions.
    pub fn clients(&self) -> usize {
        self.clients.load(Ordering::Relaxed)
    }

    /// Set the registered session count.
    pub fn set_clients(&self, n: usize) {
        self.clients.store(n, Ordering::Relaxed);
    }
}

/// Shared canvas state: pixels, display requests and server counters.
#[derive(Debug)]
pub struct Canvas {
    framebuffer: Framebuffer,
    requests: DisplayRequestQueue,
    stats: Arc<ServerStats>,
    snapshot_dir: PathBuf,
    next_snapshot: AtomicU32,
}

impl Canvas {
    /// Create a canvas of the given size.
    pub fn new(width: u32, height: u32, stats: Arc<ServerStats>, snapshot_dir: PathBuf) -> Self {
        Self {
            framebuffer: Framebuffer::new(width, height),
            requests: Arc::new(Mutex::new(Vec::new())),
            stats,
            snapshot_dir,
            next_snapshot: AtomicU32::new(0),
        }
    }

    /// Pixel storage.
    pub fn framebuffer(&self) -> &Framebuffer {
        &self.framebuffer
    }

    /// Server counters.
    pub fn stats(&self) -> &Arc<ServerStats> {
        &self.stats
    }

    /// Current `(width, height)`.
    pub fn size(&self) -> (u32, u32) {
        self.framebuffer.size()
    }

    /// Ask the display to change its title.
    pub fn set_title(&self, title: impl Into<String>) {
        self.push(DisplayRequest::SetTitle(title.into()));
    }

    /// Ask the display to save the canvas.
    ///
    /// Without an explicit path the first free `screenNNNNN.ppm` in the
    /// snapshot directory is used. Returns the path that will be written.
    pub fn save(&self, path: Option<&Path>) -> PathBuf {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => self.reserve_snapshot_path(),
        };
        self.push(DisplayRequest::Save(path.clone()));
        path
    }

    fn reserve_snapshot_path(&self) -> PathBuf {
        loop {
            let i = self.next_snapshot.fetch_add(1, Ordering::Relaxed);
            let candidate = self.snapshot_dir.join(format!("screen{i:05}.ppm"));
            if !candidate.exists() {
                return candidate;
            }
        }
    }

    fn push(&self, request: DisplayRequest) {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(request);
    }

    /// Take all pending display requests in submission order.
    pub fn drain_requests(&self) -> Vec<DisplayRequest> {
        std::mem::take(&mut *self.requests.lock().unwrap_or_else(PoisonError::into_inner))
    }
}
