//! Application-wide constants for the pixelflut server.
//!
//! This module centralizes the defaults that [`crate::config::Config`]
//! starts from, grouped by domain.
//!
//! # Categories
//!
//! - **Network**: Listener address and line framing limits
//! - **Rate limiting**: Per-session command budgets
//! - **Rendering**: Canvas size and frame cadence
//! - **Behavior**: Hot-reload polling

use std::time::Duration;

// ============================================================================
// Network
// ============================================================================

/// Default bind host (all interfaces).
pub const DEFAULT_HOST: &str = "0.0.0.0";

/// Default TCP port.
pub const DEFAULT_PORT: u16 = 1234;

/// Maximum accepted line length in bytes, newline excluded.
///
/// Longer lines are a protocol violation and close the session.
pub const DEFAULT_MAX_LINE_LENGTH: usize = 1024;

/// How long a new connection waits for the session it evicts to close its
/// socket before firing its own `CONNECT` hook.
pub const DEFAULT_EVICTION_TIMEOUT: Duration = Duration::from_millis(2000);

/// Delay before retrying after a failed `accept()`.
pub const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// How long shutdown waits for sessions to finish their teardown.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

// ============================================================================
// Rate limiting
// ============================================================================

/// Default per-session budget in commands per second.
pub const DEFAULT_RATE_BUDGET: f64 = 1000.0;

/// Elevated budget granted by `GODMODE on`.
pub const DEFAULT_GODMODE_BUDGET: f64 = 100_000.0;

// ============================================================================
// Rendering
// ============================================================================

/// Default canvas width in pixels.
pub const DEFAULT_WIDTH: u32 = 640;

/// Default canvas height in pixels.
pub const DEFAULT_HEIGHT: u32 = 480;

/// Default render loop frame rate.
pub const DEFAULT_FRAME_RATE: u32 = 30;

/// Default directory for `save` snapshots.
pub const DEFAULT_SNAPSHOT_DIR: &str = ".";

/// Window/terminal title set at startup.
pub const DEFAULT_TITLE: &str = "Pixelflut";

// ============================================================================
// Behavior
// ============================================================================

/// How often the behavior definition's modification time is checked.
pub const DEFAULT_RELOAD_INTERVAL: Duration = Duration::from_secs(1);
