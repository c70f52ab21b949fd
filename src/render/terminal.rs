//! Terminal display.
//!
//! Draws the canvas with upper-half-block characters: each terminal cell
//! shows two vertically stacked pixels (foreground = top, background =
//! bottom), so a `cols x rows` terminal is a `cols x rows*2` pixel surface.
//! The top-left part of the canvas that fits is shown.

use std::io::{stdout, Stdout};
use std::time::Duration;

use anyhow::Result;
use crossterm::{
    event::{self, Event, KeyCode, KeyEventKind, KeyModifiers},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen, SetTitle},
};
use ratatui::{
    backend::CrosstermBackend,
    buffer::Buffer,
    layout::Rect,
    style::Color,
    widgets::Widget,
    Terminal,
};

use crate::framebuffer::Snapshot;

use super::display::{Display, DisplayEvent};

/// Guard that restores the terminal on drop (including panics).
///
/// Leaves the alternate screen, disables raw mode and shows the cursor.
#[derive(Debug)]
pub struct TerminalGuard;

impl TerminalGuard {
    /// Create a guard. The terminal is restored when it is dropped.
    pub fn new() -> Self {
        Self
    }
}

impl Default for TerminalGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for TerminalGuard {
    fn drop(&mut self) {
        // Best effort; nothing useful to do with errors here.
        let _ = disable_raw_mode();
        let _ = execute!(stdout(), LeaveAlternateScreen, crossterm::cursor::Show);
    }
}

/// Renders a frame into a ratatui buffer, two pixels per cell.
struct HalfBlocks<'a> {
    frame: &'a Snapshot,
}

impl Widget for HalfBlocks<'_> {
    fn render(self, area: Rect, buf: &mut Buffer) {
        let color = |x: u32, y: u32| {
            self.frame
                .pixel(x, y)
                .map_or(Color::Reset, |p| Color::Rgb(p.r, p.g, p.b))
        };
        for row in 0..area.height {
            for col in 0..area.width {
                let x = u32::from(col);
                let y = u32::from(row) * 2;
                if let Some(cell) = buf.cell_mut((area.x + col, area.y + row)) {
                    cell.set_char('▀').set_fg(color(x, y)).set_bg(color(x, y + 1));
                }
            }
        }
    }
}

/// Display that renders into the controlling terminal.
pub struct TerminalDisplay {
    terminal: Terminal<CrosstermBackend<Stdout>>,
    size: (u32, u32),
    _guard: TerminalGuard,
}

impl std::fmt::Debug for TerminalDisplay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TerminalDisplay")
            .field("size", &self.size)
            .finish_non_exhaustive()
    }
}

impl TerminalDisplay {
    /// Enter raw mode and the alternate screen.
    ///
    /// # Errors
    ///
    /// Returns an error if the terminal cannot be set up.
    pub fn new() -> Result<Self> {
        enable_raw_mode()?;
        let mut out = stdout();
        execute!(out, EnterAlternateScreen)?;
        let guard = TerminalGuard::new();

        let terminal = Terminal::new(CrosstermBackend::new(out))?;
        let area = terminal.size()?;
        Ok(Self {
            terminal,
            size: pixel_size(area.width, area.height),
            _guard: guard,
        })
    }

    /// Pixel surface of the current terminal, without entering raw mode.
    ///
    /// # Errors
    ///
    /// Returns an error if the terminal size cannot be queried.
    pub fn probe_size() -> Result<(u32, u32)> {
        let (cols, rows) = crossterm::terminal::size()?;
        Ok(pixel_size(cols, rows))
    }
}

fn pixel_size(cols: u16, rows: u16) -> (u32, u32) {
    (u32::from(cols).max(1), (u32::from(rows) * 2).max(1))
}

/// Map a key press to a display event.
fn key_event(code: KeyCode, modifiers: KeyModifiers) -> Option<DisplayEvent> {
    let name = match code {
        KeyCode::Esc => return Some(DisplayEvent::Quit),
        KeyCode::Char('c') if modifiers.contains(KeyModifiers::CONTROL) => {
            return Some(DisplayEvent::Quit)
        }
        KeyCode::Char(' ') => "space".to_string(),
        KeyCode::Char(c) => c.to_string(),
        KeyCode::Enter => "return".to_string(),
        KeyCode::Tab => "tab".to_string(),
        KeyCode::Backspace => "backspace".to_string(),
        KeyCode::Up => "up".to_string(),
        KeyCode::Down => "down".to_string(),
        KeyCode::Left => "left".to_string(),
        KeyCode::Right => "right".to_string(),
        KeyCode::F(n) => format!("f{n}"),
        _ => return None,
    };
    Some(DisplayEvent::KeyDown(name))
}

impl Display for TerminalDisplay {
    fn present(&mut self, frame: &Snapshot) -> Result<()> {
        self.terminal.draw(|f| {
            let area = f.area();
            f.render_widget(HalfBlocks { frame }, area);
        })?;
        Ok(())
    }

    fn poll_events(&mut self) -> Result<Vec<DisplayEvent>> {
        let mut events = Vec::new();
        while event::poll(Duration::ZERO)? {
            match event::read()? {
                Event::Resize(cols, rows) => {
                    self.size = pixel_size(cols, rows);
                    events.push(DisplayEvent::Resize(self.size.0, self.size.1));
                }
                Event::Key(key) if key.kind == KeyEventKind::Press => {
                    events.extend(key_event(key.code, key.modifiers));
                }
                _ => {}
            }
        }
        Ok(events)
    }

    fn size(&self) -> (u32, u32) {
        self.size
    }

    fn set_title(&mut self, title: &str) -> Result<()> {
        execute!(self.terminal.backend_mut(), SetTitle(title))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framebuffer::{Framebuffer, Rgba};

    #[test]
    fn test_key_mapping() {
        assert_eq!(key_event(KeyCode::Esc, KeyModifiers::NONE), Some(DisplayEvent::Quit));
        assert_eq!(
            key_event(KeyCode::Char('c'), KeyModifiers::CONTROL),
            Some(DisplayEvent::Quit)
        );
        assert_eq!(
            key_event(KeyCode::Char('c'), KeyModifiers::NONE),
            Some(DisplayEvent::KeyDown("c".into()))
        );
        assert_eq!(
            key_event(KeyCode::Char(' '), KeyModifiers::NONE),
            Some(DisplayEvent::KeyDown("space".into()))
        );
        assert_eq!(key_event(KeyCode::Home, KeyModifiers::NONE), None);
    }

    #[test]
    fn test_pixel_size_doubles_rows() {
        assert_eq!(pixel_size(80, 24), (80, 48));
        assert_eq!(pixel_size(0, 0), (1, 1));
    }

    #[test]
    fn test_half_blocks_render_two_pixels_per_cell() {
        let fb = Framebuffer::new(2, 2);
        fb.set_pixel(0, 0, Rgba::opaque(255, 0, 0));
        fb.set_pixel(0, 1, Rgba::opaque(0, 0, 255));
        let frame = fb.snapshot();

        let area = Rect::new(0, 0, 3, 1);
        let mut buf = Buffer::empty(area);
        HalfBlocks { frame: &frame }.render(area, &mut buf);

        let cell = &buf[(0, 0)];
        assert_eq!(cell.symbol(), "▀");
        assert_eq!(cell.fg, Color::Rgb(255, 0, 0));
        assert_eq!(cell.bg, Color::Rgb(0, 0, 255));
        // Beyond the canvas.
        assert_eq!(buf[(2, 0)].fg, Color::Reset);
    }
}
