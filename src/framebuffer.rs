//! Shared pixel storage and blending.
//!
//! The [`Framebuffer`] is written by every session task and read by the
//! render loop. Each pixel is a packed RGBA value in an `AtomicU32`, so a
//! single pixel is never observed half-written. The grid itself sits behind
//! an `RwLock`: pixel access takes the shared side, only [`Framebuffer::resize`]
//! takes the exclusive side.
//!
//! Stored pixels are always opaque. A blended write mixes the incoming color
//! into the existing one and keeps alpha at 255.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{PoisonError, RwLock, RwLockReadGuard};

/// An 8-bit-per-channel color.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Rgba {
    /// Red channel.
    pub r: u8,
    /// Green channel.
    pub g: u8,
    /// Blue channel.
    pub b: u8,
    /// Alpha channel (255 = opaque).
    pub a: u8,
}

impl Rgba {
    /// Opaque black, the content of fresh canvas area.
    pub const BLACK: Self = Self::opaque(0, 0, 0);

    /// Create a color with the given alpha.
    #[must_use]
    pub const fn new(r: u8, g: u8, b: u8, a: u8) -> Self {
        Self { r, g, b, a }
    }

    /// Create a fully opaque color.
    #[must_use]
    pub const fn opaque(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b, a: 255 }
    }

    fn pack(self) -> u32 {
        u32::from_be_bytes([self.r, self.g, self.b, self.a])
    }

    fn unpack(v: u32) -> Self {
        let [r, g, b, a] = v.to_be_bytes();
        Self { r, g, b, a }
    }

    /// Mix `src` over `self` using `src.a` as weight.
    ///
    /// `out = (old * (255 - a) + new * a) / 255`, truncating, per channel.
    #[must_use]
    pub fn blend(self, src: Self) -> Self {
        let a = u32::from(src.a);
        let mix = |old: u8, new: u8| -> u8 {
            ((u32::from(old) * (255 - a) + u32::from(new) * a) / 255) as u8
        };
        Self::opaque(mix(self.r, src.r), mix(self.g, src.g), mix(self.b, src.b))
    }
}

impl std::fmt::Display for Rgba {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:02X}{:02X}{:02X}{:02X}", self.r, self.g, self.b, self.a)
    }
}

/// A pixel read outside the canvas.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutOfBounds {
    /// Requested x coordinate.
    pub x: i64,
    /// Requested y coordinate.
    pub y: i64,
    /// Canvas width at the time of the read.
    pub width: u32,
    /// Canvas height at the time of the read.
    pub height: u32,
}

impl std::fmt::Display for OutOfBounds {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "coordinates ({}, {}) out of bounds for {}x{} canvas",
            self.x, self.y, self.width, self.height
        )
    }
}

impl std::error::Error for OutOfBounds {}

struct Grid {
    width: u32,
    height: u32,
    pixels: Box<[AtomicU32]>,
}

impl Grid {
    fn new(width: u32, height: u32) -> Self {
        let len = width as usize * height as usize;
        let black = Rgba::BLACK.pack();
        Self {
            width,
            height,
            pixels: (0..len).map(|_| AtomicU32::new(black)).collect(),
        }
    }

    fn index(&self, x: i64, y: i64) -> Option<usize> {
        if x < 0 || y < 0 || x >= i64::from(self.width) || y >= i64::from(self.height) {
            return None;
        }
        Some(y as usize * self.width as usize + x as usize)
    }
}

/// Width x height grid of RGBA pixels shared across threads.
pub struct Framebuffer {
    grid: RwLock<Grid>,
}

impl std::fmt::Debug for Framebuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (width, height) = self.size();
        f.debug_struct("Framebuffer")
            .field("width", &width)
            .field("height", &height)
            .finish_non_exhaustive()
    }
}

impl Framebuffer {
    /// Create a canvas cleared to opaque black.
    #[must_use]
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            grid: RwLock::new(Grid::new(width, height)),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Grid> {
        self.grid.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current `(width, height)`.
    pub fn size(&self) -> (u32, u32) {
        let grid = self.read();
        (grid.width, grid.height)
    }

    /// Write a pixel.
    ///
    /// `a == 0` is a no-op, `a == 255` overwrites, anything in between is
    /// blended into the current value. Out-of-bounds coordinates are
    /// silently dropped.
    pub fn set_pixel(&self, x: i64, y: i64, color: Rgba) {
        if color.a == 0 {
            return;
        }
        let grid = self.read();
        let Some(idx) = grid.index(x, y) else {
            return;
        };
        let cell = &grid.pixels[idx];
        if color.a == 255 {
            cell.store(color.pack(), Ordering::Relaxed);
            return;
        }
        // CAS loop so two concurrent blends onto one pixel both land.
        let _ = cell.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |old| {
            Some(Rgba::unpack(old).blend(color).pack())
        });
    }

    /// Read a pixel.
    pub fn get_pixel(&self, x: i64, y: i64) -> Result<Rgba, OutOfBounds> {
        let grid = self.read();
        match grid.index(x, y) {
            Some(idx) => Ok(Rgba::unpack(grid.pixels[idx].load(Ordering::Relaxed))),
            None => Err(OutOfBounds {
                x,
                y,
                width: grid.width,
                height: grid.height,
            }),
        }
    }

    /// Fill the whole canvas with an opaque color.
    pub fn clear(&self, r: u8, g: u8, b: u8) {
        let packed = Rgba::opaque(r, g, b).pack();
        let grid = self.read();
        for cell in grid.pixels.iter() {
            cell.store(packed, Ordering::Relaxed);
        }
    }

    /// Reallocate to new dimensions.
    ///
    /// The overlapping top-left region is preserved; newly exposed area is
    /// opaque black. Concurrent writers block for the duration of the copy.
    pub fn resize(&self, width: u32, height: u32) {
        let mut grid = self.grid.write().unwrap_or_else(PoisonError::into_inner);
        if grid.width == width && grid.height == height {
            return;
        }
        let fresh = Grid::new(width, height);
        let copy_w = grid.width.min(width) as usize;
        let copy_h = grid.height.min(height) as usize;
        for y in 0..copy_h {
            let src = y * grid.width as usize;
            let dst = y * width as usize;
            for x in 0..copy_w {
                let v = grid.pixels[src + x].load(Ordering::Relaxed);
                fresh.pixels[dst + x].store(v, Ordering::Relaxed);
            }
        }
        *grid = fresh;
    }

    /// Copy the current content out for presenting or saving.
    pub fn snapshot(&self) -> Snapshot {
        let grid = self.read();
        let mut rgba = Vec::with_capacity(grid.pixels.len() * 4);
        for cell in grid.pixels.iter() {
            rgba.extend_from_slice(&cell.load(Ordering::Relaxed).to_be_bytes());
        }
        Snapshot {
            width: grid.width,
            height: grid.height,
            rgba,
        }
    }
}

/// Owned copy of the canvas content, row-major RGBA.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
    /// `width * height * 4` bytes.
    pub rgba: Vec<u8>,
}

impl Snapshot {
    /// Pixel at `(x, y)`, or `None` outside the snapshot.
    pub fn pixel(&self, x: u32, y: u32) -> Option<Rgba> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let i = (y as usize * self.width as usize + x as usize) * 4;
        Some(Rgba::new(
            self.rgba[i],
            self.rgba[i + 1],
            self.rgba[i + 2],
            self.rgba[i + 3],
        ))
    }

    /// Encode as binary PPM (P6). Alpha is dropped; stored pixels are opaque.
    pub fn to_ppm(&self) -> Vec<u8> {
        let header = format!("P6\n{} {}\n255\n", self.width, self.height);
        let mut out = Vec::with_capacity(header.len() + self.rgba.len() / 4 * 3);
        out.extend_from_slice(header.as_bytes());
        for px in self.rgba.chunks_exact(4) {
            out.extend_from_slice(&px[..3]);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_canvas_is_opaque_black() {
        let fb = Framebuffer::new(4, 3);
        assert_eq!(fb.size(), (4, 3));
        assert_eq!(fb.get_pixel(3, 2), Ok(Rgba::BLACK));
    }

    #[test]
    fn test_opaque_write_reads_back_exactly() {
        let fb = Framebuffer::new(16, 16);
        for (x, y) in [(0, 0), (15, 15), (7, 3)] {
            fb.set_pixel(x, y, Rgba::opaque(0x12, 0x34, 0x56));
            assert_eq!(fb.get_pixel(x, y), Ok(Rgba::opaque(0x12, 0x34, 0x56)));
        }
    }

    #[test]
    fn test_zero_alpha_write_is_noop() {
        let fb = Framebuffer::new(2, 2);
        fb.set_pixel(1, 1, Rgba::opaque(10, 20, 30));
        fb.set_pixel(1, 1, Rgba::new(255, 255, 255, 0));
        assert_eq!(fb.get_pixel(1, 1), Ok(Rgba::opaque(10, 20, 30)));
    }

    #[test]
    fn test_blend_formula_truncates() {
        let fb = Framebuffer::new(1, 1);
        fb.set_pixel(0, 0, Rgba::opaque(100, 0, 255));
        fb.set_pixel(0, 0, Rgba::new(200, 255, 0, 128));
        // (100*127 + 200*128)/255 = 150, (0*127 + 255*128)/255 = 128, (255*127)/255 = 127
        assert_eq!(fb.get_pixel(0, 0), Ok(Rgba::opaque(150, 128, 127)));
    }

    #[test]
    fn test_blend_stays_between_old_and_new() {
        let old = Rgba::opaque(10, 200, 90);
        let new = Rgba::opaque(250, 5, 90);
        for a in 1..255u8 {
            let out = old.blend(Rgba { a, ..new });
            assert!(out.r >= old.r.min(new.r) && out.r <= old.r.max(new.r));
            assert!(out.g >= old.g.min(new.g) && out.g <= old.g.max(new.g));
            assert_eq!(out.b, 90);
            assert_eq!(out.a, 255);
        }
    }

    #[test]
    fn test_out_of_bounds_write_touches_nothing() {
        let fb = Framebuffer::new(3, 3);
        let before = fb.snapshot();
        for (x, y) in [(-1, 0), (0, -1), (3, 0), (0, 3), (i64::MAX, i64::MIN)] {
            fb.set_pixel(x, y, Rgba::opaque(255, 255, 255));
        }
        assert_eq!(fb.snapshot(), before);
    }

    #[test]
    fn test_out_of_bounds_read_fails() {
        let fb = Framebuffer::new(3, 2);
        let err = fb.get_pixel(3, 0).unwrap_err();
        assert_eq!(err.width, 3);
        assert_eq!(err.height, 2);
        assert!(fb.get_pixel(0, 2).is_err());
        assert!(fb.get_pixel(-1, -1).is_err());
    }

    #[test]
    fn test_resize_preserves_top_left_and_clears_rest() {
        let fb = Framebuffer::new(2, 2);
        fb.set_pixel(0, 0, Rgba::opaque(1, 2, 3));
        fb.set_pixel(1, 1, Rgba::opaque(4, 5, 6));
        fb.resize(3, 1);
        assert_eq!(fb.size(), (3, 1));
        assert_eq!(fb.get_pixel(0, 0), Ok(Rgba::opaque(1, 2, 3)));
        assert_eq!(fb.get_pixel(2, 0), Ok(Rgba::BLACK));
        assert!(fb.get_pixel(1, 1).is_err());

        fb.resize(4, 4);
        assert_eq!(fb.get_pixel(0, 0), Ok(Rgba::opaque(1, 2, 3)));
        assert_eq!(fb.get_pixel(1, 1), Ok(Rgba::BLACK));
    }

    #[test]
    fn test_clear_fills_opaque() {
        let fb = Framebuffer::new(2, 2);
        fb.clear(9, 8, 7);
        assert_eq!(fb.get_pixel(1, 0), Ok(Rgba::opaque(9, 8, 7)));
    }

    #[test]
    fn test_concurrent_writers_do_not_tear() {
        let fb = std::sync::Arc::new(Framebuffer::new(8, 8));
        let handles: Vec<_> = (0..4u8)
            .map(|i| {
                let fb = std::sync::Arc::clone(&fb);
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        fb.set_pixel(3, 3, Rgba::opaque(i, i, i));
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        let px = fb.get_pixel(3, 3).unwrap();
        assert!(px.r < 4 && px.r == px.g && px.g == px.b);
    }

    #[test]
    fn test_display_is_uppercase_hex() {
        assert_eq!(Rgba::new(0xff, 0x0a, 0, 0xff).to_string(), "FF0A00FF");
    }

    #[test]
    fn test_snapshot_ppm_layout() {
        let fb = Framebuffer::new(2, 1);
        fb.set_pixel(1, 0, Rgba::opaque(1, 2, 3));
        let snap = fb.snapshot();
        assert_eq!(snap.pixel(1, 0), Some(Rgba::opaque(1, 2, 3)));
        assert_eq!(snap.pixel(2, 0), None);
        let ppm = snap.to_ppm();
        assert!(ppm.starts_with(b"P6\n2 1\n255\n"));
        assert_eq!(&ppm[ppm.len() - 6..], &[0, 0, 0, 1, 2, 3]);
    }
}
