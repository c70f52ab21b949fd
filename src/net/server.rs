//! TCP listener for pixelflut clients.
//!
//! Accepts connections and spawns one [`session::serve`] task per
//! connection on the shared [`TaskTracker`], so shutdown can wait for
//! in-flight sessions to finish their teardown.

use std::net::{SocketAddr, TcpListener as StdTcpListener, ToSocketAddrs};

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::task::TaskTracker;

use crate::constants::ACCEPT_RETRY_DELAY;

use super::session::{self, SessionContext};

/// Bind a listening socket without starting to accept.
///
/// # Errors
///
/// Returns an error if the address cannot be resolved or bound.
pub fn bind(addr: impl ToSocketAddrs + std::fmt::Debug) -> Result<StdTcpListener> {
    let listener =
        StdTcpListener::bind(&addr).with_context(|| format!("Failed to bind {addr:?}"))?;
    listener.set_nonblocking(true)?;
    Ok(listener)
}

/// Running accept loop.
#[derive(Debug)]
pub struct TcpServer {
    local_addr: SocketAddr,
    accept_handle: JoinHandle<()>,
}

impl TcpServer {
    /// Start accepting on `listener`.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns an error if the listener cannot be registered with the
    /// runtime.
    pub fn start(listener: StdTcpListener, ctx: SessionContext, tracker: TaskTracker) -> Result<Self> {
        let local_addr = listener.local_addr()?;
        let listener = TcpListener::from_std(listener)?;
        log::info!("[Net] Listening on {}", local_addr);
        let accept_handle = tokio::spawn(Self::accept_loop(listener, ctx, tracker));
        Ok(Self {
            local_addr,
            accept_handle,
        })
    }

    /// Accept loop, runs as a tokio task until shutdown.
    async fn accept_loop(listener: TcpListener, ctx: SessionContext, tracker: TaskTracker) {
        loop {
            tokio::select! {
                () = ctx.shutdown.cancelled() => {
                    log::info!("[Net] Shutdown requested, stopping accept loop");
                    break;
                }
                res = listener.accept() => match res {
                    Ok((stream, peer)) => {
                        tracker.spawn(session::serve(stream, peer, ctx.clone()));
                    }
                    Err(e) => {
                        log::error!("[Net] Accept error: {e}");
                        tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
                    }
                },
            }
        }
    }

    /// Address actually bound (useful with port 0).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Wait for the accept loop to exit.
    pub async fn join(self) {
        if let Err(e) = self.accept_handle.await {
            log::warn!("[Net] Accept loop ended abnormally: {e}");
        }
    }
}
