//! The display collaborator interface.

use std::path::Path;

use anyhow::{Context, Result};

use crate::framebuffer::Snapshot;

/// Input reported by a display.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisplayEvent {
    /// Output area changed to `(width, height)` pixels.
    Resize(u32, u32),
    /// A key was pressed. Named like `a`, `space`, `return`, `f1`.
    KeyDown(String),
    /// The user asked to close the display.
    Quit,
}

/// Something the render loop can present frames on.
///
/// All methods are called from the render thread only.
pub trait Display: Send {
    /// Show a frame.
    fn present(&mut self, frame: &Snapshot) -> Result<()>;

    /// Return pending input without blocking.
    fn poll_events(&mut self) -> Result<Vec<DisplayEvent>>;

    /// Current output size in pixels.
    fn size(&self) -> (u32, u32);

    /// Change the window or terminal title.
    fn set_title(&mut self, title: &str) -> Result<()>;

    /// Write `frame` to `path`. The default encodes binary PPM.
    fn save(&mut self, frame: &Snapshot, path: &Path) -> Result<()> {
        write_ppm(frame, path)
    }
}

/// Write `frame` as a PPM file, creating parent directories.
pub fn write_ppm(frame: &Snapshot, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    std::fs::write(path, frame.to_ppm())
        .with_context(|| format!("Failed to write snapshot: {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framebuffer::{Framebuffer, Rgba};

    #[test]
    fn test_write_ppm_creates_parent_dirs() {
        let tmp = tempfile::TempDir::new().unwrap();
        let fb = Framebuffer::new(2, 1);
        fb.set_pixel(1, 0, Rgba::opaque(1, 2, 3));
        let path = tmp.path().join("shots/a.ppm");

        write_ppm(&fb.snapshot(), &path).unwrap();
        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(bytes, b"P6\n2 1\n255\n\x00\x00\x00\x01\x02\x03");
    }
}
