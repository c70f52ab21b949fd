//! Display that draws nothing.
//!
//! Used by `--headless` and by tests, which drive it through a
//! [`HeadlessControl`] handle: inject input events, observe presented
//! frames, title and saved files.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::Result;

use crate::framebuffer::Snapshot;

use super::display::{write_ppm, Display, DisplayEvent};

#[derive(Debug, Default)]
struct HeadlessState {
    pending: VecDeque<DisplayEvent>,
    frames: u64,
    last_frame_size: Option<(u32, u32)>,
    title: String,
    saved: Vec<PathBuf>,
}

fn lock(state: &Mutex<HeadlessState>) -> MutexGuard<'_, HeadlessState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A display with no output.
#[derive(Debug)]
pub struct HeadlessDisplay {
    size: (u32, u32),
    state: Arc<Mutex<HeadlessState>>,
}

/// Remote control for a [`HeadlessDisplay`].
#[derive(Debug, Clone)]
pub struct HeadlessControl {
    state: Arc<Mutex<HeadlessState>>,
}

impl HeadlessDisplay {
    /// Create a display of the given size and its control handle.
    pub fn new(width: u32, height: u32) -> (Self, HeadlessControl) {
        let state = Arc::new(Mutex::new(HeadlessState::default()));
        let control = HeadlessControl {
            state: Arc::clone(&state),
        };
        (
            Self {
                size: (width, height),
                state,
            },
            control,
        )
    }
}

impl Display for HeadlessDisplay {
    fn present(&mut self, frame: &Snapshot) -> Result<()> {
        let mut state = lock(&self.state);
        state.frames += 1;
        state.last_frame_size = Some((frame.width, frame.height));
        Ok(())
    }

    fn poll_events(&mut self) -> Result<Vec<DisplayEvent>> {
        let events: Vec<DisplayEvent> = lock(&self.state).pending.drain(..).collect();
        for event in &events {
            if let DisplayEvent::Resize(w, h) = event {
                self.size = (*w, *h);
            }
        }
        Ok(events)
    }

    fn size(&self) -> (u32, u32) {
        self.size
    }

    fn set_title(&mut self, title: &str) -> Result<()> {
        title.clone_into(&mut lock(&self.state).title);
        Ok(())
    }

    fn save(&mut self, frame: &Snapshot, path: &Path) -> Result<()> {
        write_ppm(frame, path)?;
        lock(&self.state).saved.push(path.to_path_buf());
        Ok(())
    }
}

impl HeadlessControl {
    /// Queue an input event for the next tick.
    pub fn push_event(&self, event: DisplayEvent) {
        lock(&self.state).pending.push_back(event);
    }

    /// Frames presented so far.
    pub fn frames(&self) -> u64 {
        lock(&self.state).frames
    }

    /// Size of the last presented frame.
    pub fn last_frame_size(&self) -> Option<(u32, u32)> {
        lock(&self.state).last_frame_size
    }

    /// Current title.
    pub fn title(&self) -> String {
        lock(&self.state).title.clone()
    }

    /// Files written by `save`, in order.
    pub fn saved(&self) -> Vec<PathBuf> {
        lock(&self.state).saved.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framebuffer::Framebuffer;

    #[test]
    fn test_control_observes_display() {
        let (mut display, control) = HeadlessDisplay::new(4, 4);
        let fb = Framebuffer::new(4, 4);
        display.present(&fb.snapshot()).unwrap();
        display.set_title("hello").unwrap();
        assert_eq!(control.frames(), 1);
        assert_eq!(control.last_frame_size(), Some((4, 4)));
        assert_eq!(control.title(), "hello");
    }

    #[test]
    fn test_resize_event_updates_size() {
        let (mut display, control) = HeadlessDisplay::new(4, 4);
        control.push_event(DisplayEvent::Resize(8, 2));
        control.push_event(DisplayEvent::KeyDown("c".into()));
        let events = display.poll_events().unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(display.size(), (8, 2));
        assert!(display.poll_events().unwrap().is_empty());
    }
}
