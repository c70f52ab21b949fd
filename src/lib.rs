//! Pixelflut - a multi-client collaborative pixel canvas.
//!
//! Clients connect over TCP and draw on a shared framebuffer with a
//! line-based text protocol (`PX x y rrggbb`, `SIZE`, ...). A local render
//! loop continuously shows the canvas, and a Lua behavior file adds custom
//! commands and event handlers that are reloaded while the server runs.
//!
//! # Architecture
//!
//! - **Framebuffer** - shared pixel storage, per-pixel atomic
//! - **Sessions** - one task per connection, paced by a token bucket
//! - **Registry** - at most one session per client IP, reconnects evict
//! - **EventHub** - named hooks with atomically swappable custom table
//! - **RenderLoop** - fixed-tick driver for a [`render::Display`]
//! - **BehaviorLoader** - hot-reloads the Lua behavior file
//!
//! # Modules
//!
//! - [`framebuffer`] - pixels, blending, snapshots
//! - [`protocol`] - line parsing and reply formatting
//! - [`net`] - listener, sessions, registry
//! - [`hooks`] - hook dispatch
//! - [`render`] - render loop and displays
//! - [`behavior`] / [`lua`] - behavior definitions and hot reload
//! - [`server`] - composition and shutdown

pub mod behavior;
pub mod canvas;
pub mod config;
pub mod constants;
pub mod framebuffer;
pub mod hooks;
pub mod lua;
pub mod net;
pub mod protocol;
pub mod rate_limit;
pub mod render;
pub mod server;

pub use canvas::Canvas;
pub use config::Config;
pub use framebuffer::{Framebuffer, Rgba};
pub use hooks::EventHub;
pub use server::{Server, ServerHandle};
