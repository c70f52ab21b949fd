//! Network side: listener, per-connection sessions, session registry.

pub mod registry;
pub mod server;
pub mod session;

pub use registry::ConnectionRegistry;
pub use server::TcpServer;
pub use session::{ClientHandle, CloseReason, SessionContext, SessionSettings};
