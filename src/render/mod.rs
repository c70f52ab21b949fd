//! Fixed-tick render loop.
//!
//! Runs on its own blocking thread. Each tick:
//!
//! 1. apply display requests queued by hooks (title, save);
//! 2. drain display input: resize the canvas and fire `RESIZE`, fire
//!    `KEYDOWN-<key>`, or stop on quit;
//! 3. fire `TICK` with the tick counter;
//! 4. once per second, publish the pixels-per-second figure;
//! 5. present the framebuffer.
//!
//! The remaining frame budget is slept off. An overrunning tick is followed
//! immediately by the next one; there is no catch-up.

pub mod display;
pub mod headless;
pub mod terminal;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use tokio_util::sync::CancellationToken;

use crate::canvas::DisplayRequest;
use crate::hooks::{self, EventHub};

pub use display::{Display, DisplayEvent};
pub use headless::{HeadlessControl, HeadlessDisplay};
pub use terminal::TerminalDisplay;

/// What the loop should do after a tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Keep going.
    Continue,
    /// The display asked to quit.
    Quit,
}

/// Drives a [`Display`] at a fixed frame rate.
pub struct RenderLoop<D: Display> {
    display: D,
    hub: Arc<EventHub>,
    frame_interval: Duration,
    shutdown: CancellationToken,
    quit_flag: Option<Arc<AtomicBool>>,
    rate_window_start: Instant,
    rate_window_pixels: u64,
}

impl<D: Display> std::fmt::Debug for RenderLoop<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RenderLoop")
            .field("frame_interval", &self.frame_interval)
            .finish_non_exhaustive()
    }
}

impl<D: Display> RenderLoop<D> {
    /// Create a loop presenting on `display` at `frame_rate` ticks per second.
    pub fn new(display: D, hub: Arc<EventHub>, frame_rate: u32, shutdown: CancellationToken) -> Self {
        let pixels = hub.canvas().stats().pixels();
        Self {
            display,
            hub,
            frame_interval: Duration::from_secs(1) / frame_rate.max(1),
            shutdown,
            quit_flag: None,
            rate_window_start: Instant::now(),
            rate_window_pixels: pixels,
        }
    }

    /// Also stop when `flag` becomes true (signal handlers set it).
    pub fn with_quit_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.quit_flag = Some(flag);
        self
    }

    /// The display being driven.
    pub fn display(&self) -> &D {
        &self.display
    }

    fn stop_requested(&self) -> bool {
        self.shutdown.is_cancelled()
            || self
                .quit_flag
                .as_ref()
                .is_some_and(|f| f.load(Ordering::Relaxed))
    }

    fn apply_requests(&mut self) {
        let canvas = Arc::clone(self.hub.canvas());
        for request in canvas.drain_requests() {
            match request {
                DisplayRequest::SetTitle(title) => {
                    if let Err(e) = self.display.set_title(&title) {
                        log::warn!("[Render] set_title failed: {e:#}");
                    }
                }
                DisplayRequest::Save(path) => {
                    let frame = canvas.framebuffer().snapshot();
                    match self.display.save(&frame, &path) {
                        Ok(()) => log::info!("[Render] Saved {}", path.display()),
                        Err(e) => log::warn!("[Render] Save failed: {e:#}"),
                    }
                }
            }
        }
    }

    fn update_pixel_rate(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.rate_window_start);
        if elapsed < Duration::from_secs(1) {
            return;
        }
        let stats = self.hub.canvas().stats();
        let pixels = stats.pixels();
        let delta = pixels.saturating_sub(self.rate_window_pixels);
        stats.set_pixels_per_second((delta as f64 / elapsed.as_secs_f64()) as u64);
        self.rate_window_start = now;
        self.rate_window_pixels = pixels;
    }

    /// Run one tick.
    ///
    /// # Errors
    ///
    /// Returns an error if the display fails to poll or present.
    pub fn tick(&mut self) -> Result<TickOutcome> {
        self.apply_requests();

        for event in self.display.poll_events()? {
            match event {
                DisplayEvent::Resize(w, h) => {
                    let (w, h) = (w.max(1), h.max(1));
                    self.hub.canvas().framebuffer().resize(w, h);
                    log::debug!("[Render] Resized to {}x{}", w, h);
                    self.hub.fire(hooks::RESIZE, None, &[w.to_string(), h.to_string()]);
                }
                DisplayEvent::KeyDown(key) => {
                    self.hub.fire(&hooks::keydown(&key), None, &[]);
                }
                DisplayEvent::Quit => return Ok(TickOutcome::Quit),
            }
        }

        let tick = self.hub.canvas().stats().next_tick();
        self.hub.fire(hooks::TICK, None, &[tick.to_string()]);
        self.update_pixel_rate(Instant::now());

        let frame = self.hub.canvas().framebuffer().snapshot();
        self.display.present(&frame)?;
        Ok(TickOutcome::Continue)
    }

    /// Tick until quit, signal or shutdown. Returns the display.
    ///
    /// # Errors
    ///
    /// Returns the first display error.
    pub fn run(mut self) -> Result<D> {
        log::info!("[Render] Loop starting at {:?} per frame", self.frame_interval);
        while !self.stop_requested() {
            let started = Instant::now();
            if self.tick()? == TickOutcome::Quit {
                log::info!("[Render] Display requested quit");
                self.hub.fire(hooks::QUIT, None, &[]);
                break;
            }
            if let Some(rest) = self.frame_interval.checked_sub(started.elapsed()) {
                std::thread::sleep(rest);
            }
        }
        log::info!("[Render] Loop exiting");
        Ok(self.display)
    }
}
