//! Per-connection session.
//!
//! Each accepted TCP connection is served by one task running
//! [`serve`]. The task owns all mutable session state (rate limiter,
//! outbound receiver, lifecycle state); everything else talks to it through
//! a cloneable [`ClientHandle`].
//!
//! # Lifecycle
//!
//! ```text
//! CONNECTING ──> ACTIVE ──> CLOSING ──> CLOSED
//!   register       read/pace/       socket closed,
//!   (evict old)    dispatch loop    DISCONNECT fired,
//!   CONNECT hook                    registry slot released
//! ```
//!
//! Teardown runs exactly once, whichever trigger comes first (QUIT, EOF,
//! socket error, protocol violation, eviction, hook-requested disconnect,
//! server shutdown, or the task being dropped).

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use tokio::io::{AsyncWrite, AsyncWriteExt, BufWriter};
use tokio::net::TcpStream;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::hooks::{self, EventHub, HookOutcome};
use crate::protocol::{self, Command, ParseError};
use crate::rate_limit::RateLimiter;

use super::registry::ConnectionRegistry;

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Accepted, registering.
    Connecting,
    /// Reading and dispatching commands.
    Active,
    /// Tearing down.
    Closing,
    /// Terminal.
    Closed,
}

/// Why a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// Client sent `QUIT`.
    Quit,
    /// Peer closed the connection.
    Eof,
    /// Line too long or not valid UTF-8.
    ProtocolViolation(String),
    /// Socket read/write failed.
    Io(String),
    /// A newer connection from the same address took over.
    Evicted,
    /// A hook asked for the disconnect.
    Disconnected,
    /// Server is shutting down.
    Shutdown,
    /// Session task was dropped before finishing.
    Aborted,
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Quit => write!(f, "quit"),
            Self::Eof => write!(f, "eof"),
            Self::ProtocolViolation(msg) => write!(f, "protocol violation: {msg}"),
            Self::Io(msg) => write!(f, "i/o error: {msg}"),
            Self::Evicted => write!(f, "evicted"),
            Self::Disconnected => write!(f, "disconnected"),
            Self::Shutdown => write!(f, "shutdown"),
            Self::Aborted => write!(f, "aborted"),
        }
    }
}

/// Session tunables derived from [`Config`].
#[derive(Debug, Clone)]
pub struct SessionSettings {
    /// Default commands per second.
    pub rate_budget: f64,
    /// Commands per second with `GODMODE on`.
    pub godmode_budget: f64,
    /// Maximum line length in bytes.
    pub max_line_length: usize,
    /// Answer malformed lines with `ERROR: ...` instead of ignoring them.
    pub reply_errors: bool,
    /// How long to wait for an evicted session to close its socket.
    pub eviction_timeout: Duration,
}

impl SessionSettings {
    /// Extract session settings from the server config.
    pub fn from_config(config: &Config) -> Self {
        Self {
            rate_budget: config.rate_budget,
            godmode_budget: config.godmode_budget,
            max_line_length: config.max_line_length,
            reply_errors: config.reply_errors,
            eviction_timeout: Duration::from_millis(config.eviction_timeout_ms),
        }
    }
}

/// Everything a session task needs from the server.
#[derive(Debug, Clone)]
pub struct SessionContext {
    /// Hook dispatch (also provides the canvas).
    pub hub: Arc<EventHub>,
    /// Identity -> session map.
    pub registry: Arc<ConnectionRegistry>,
    /// Tunables.
    pub settings: SessionSettings,
    /// Cancelled when the server shuts down.
    pub shutdown: CancellationToken,
}

struct HandleInner {
    peer: SocketAddr,
    generation: u64,
    connected_at: chrono::DateTime<chrono::Local>,
    outbound: UnboundedSender<String>,
    /// Cancelled to ask the session to stop at its next suspension point.
    cancel: CancellationToken,
    /// Cancelled once the socket is closed, DISCONNECT has fired and the
    /// registry slot is released.
    closed: CancellationToken,
    evicted: AtomicBool,
    pixels: AtomicU64,
}

/// Shared, cloneable view of a live session.
///
/// This is what the registry stores and what hooks receive as `client`.
#[derive(Clone)]
pub struct ClientHandle {
    inner: Arc<HandleInner>,
}

impl std::fmt::Debug for ClientHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientHandle")
            .field("peer", &self.inner.peer)
            .field("generation", &self.inner.generation)
            .finish_non_exhaustive()
    }
}

impl ClientHandle {
    /// Create a handle and the receiving end of its outbound queue.
    ///
    /// `cancel` should be a child of the server shutdown token.
    pub fn new(
        peer: SocketAddr,
        generation: u64,
        cancel: CancellationToken,
    ) -> (Self, UnboundedReceiver<String>) {
        let (outbound, rx) = mpsc::unbounded_channel();
        let handle = Self {
            inner: Arc::new(HandleInner {
                peer,
                generation,
                connected_at: chrono::Local::now(),
                outbound,
                cancel,
                closed: CancellationToken::new(),
                evicted: AtomicBool::new(false),
                pixels: AtomicU64::new(0),
            }),
        };
        (handle, rx)
    }

    /// De-duplication key: the peer IP, port ignored.
    pub fn identity(&self) -> IpAddr {
        self.inner.peer.ip()
    }

    /// Full peer address.
    pub fn peer(&self) -> SocketAddr {
        self.inner.peer
    }

    /// Registry generation; distinguishes reconnects from one address.
    pub fn generation(&self) -> u64 {
        self.inner.generation
    }

    /// When the connection was accepted.
    pub fn connected_at(&self) -> chrono::DateTime<chrono::Local> {
        self.inner.connected_at
    }

    /// Pixels written by this session.
    pub fn pixels(&self) -> u64 {
        self.inner.pixels.load(Ordering::Relaxed)
    }

    fn record_pixel(&self) {
        self.inner.pixels.fetch_add(1, Ordering::Relaxed);
    }

    /// Queue a reply line. Returns `false` once the session is gone.
    ///
    /// Lines are delivered in order and never dropped while the session is
    /// alive.
    pub fn send(&self, line: impl Into<String>) -> bool {
        self.inner.outbound.send(line.into()).is_ok()
    }

    /// Ask the session to close.
    pub fn disconnect(&self) {
        self.inner.cancel.cancel();
    }

    /// Close the session because a newer one took its identity.
    pub fn evict(&self) {
        self.inner.evicted.store(true, Ordering::SeqCst);
        self.inner.cancel.cancel();
    }

    /// Whether the session has finished closing.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.is_cancelled()
    }

    /// Wait until the session has finished closing.
    pub async fn wait_closed(&self) {
        self.inner.closed.cancelled().await;
    }

    /// Whether two handles refer to the same session.
    pub fn same_session(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    fn stop_reason(&self, shutdown: &CancellationToken) -> CloseReason {
        if self.inner.evicted.load(Ordering::SeqCst) {
            CloseReason::Evicted
        } else if shutdown.is_cancelled() {
            CloseReason::Shutdown
        } else {
            CloseReason::Disconnected
        }
    }
}

/// Outcome of handling one line.
enum Flow {
    Continue,
    Quit,
}

/// State owned by one session task.
struct ClientSession {
    handle: ClientHandle,
    state: SessionState,
    limiter: RateLimiter,
    outbound: UnboundedReceiver<String>,
    ctx: SessionContext,
}

impl ClientSession {
    fn transition(&mut self, next: SessionState) {
        log::trace!(
            "[Session] {} {:?} -> {:?}",
            self.handle.peer(),
            self.state,
            next
        );
        self.state = next;
    }

    /// Parse and dispatch one line.
    fn handle_line(&mut self, line: &str) -> Flow {
        let canvas = self.ctx.hub.canvas();
        match protocol::parse_line(line) {
            Err(ParseError::Empty) => {}
            Err(e) => {
                log::debug!("[Session] {} bad line {:?}: {}", self.handle.peer(), line, e);
                if self.ctx.settings.reply_errors {
                    self.handle.send(protocol::format_error(e));
                }
            }
            Ok(Command::PxSet { x, y, color }) => {
                canvas.framebuffer().set_pixel(x, y, color);
                self.handle.record_pixel();
                canvas.stats().record_pixel();
            }
            Ok(Command::PxGet { x, y }) => match canvas.framebuffer().get_pixel(x, y) {
                Ok(color) => {
                    self.handle.send(protocol::format_pixel(x, y, color));
                }
                Err(e) => {
                    log::debug!("[Session] {} {}", self.handle.peer(), e);
                    self.handle.send(protocol::format_error("coordinates out of bounds"));
                }
            },
            Ok(Command::Size) => {
                let (w, h) = canvas.size();
                self.handle.send(protocol::format_size(w, h));
            }
            Ok(Command::Quit) => return Flow::Quit,
            Ok(Command::GodMode(on)) => {
                let budget = if on {
                    self.ctx.settings.godmode_budget
                } else {
                    self.ctx.settings.rate_budget
                };
                self.limiter.set_budget(budget);
                log::info!("[Session] {} godmode {}", self.handle.peer(), if on { "on" } else { "off" });
            }
            Ok(Command::Other { verb, args }) => {
                let outcome = self.ctx.hub.fire(&hooks::command(&verb), Some(&self.handle), &args);
                if outcome == HookOutcome::Missing {
                    log::trace!("[Session] {} unhandled verb {}", self.handle.peer(), verb);
                }
            }
        }
        Flow::Continue
    }

    /// Write `first` and every other queued reply, then flush.
    async fn write_queued<W: AsyncWrite + Unpin>(
        &mut self,
        writer: &mut W,
        first: Option<String>,
    ) -> std::io::Result<()> {
        let mut next = first.or_else(|| self.outbound.try_recv().ok());
        if next.is_none() {
            return Ok(());
        }
        while let Some(line) = next {
            writer.write_all(line.as_bytes()).await?;
            writer.write_all(b"\n").await?;
            next = self.outbound.try_recv().ok();
        }
        writer.flush().await
    }

    /// [`Self::write_queued`], abandoned as soon as the session is asked to
    /// stop. A peer that never reads cannot hold the socket open.
    async fn send_queued<W: AsyncWrite + Unpin>(
        &mut self,
        writer: &mut W,
        first: Option<String>,
    ) -> Result<(), CloseReason> {
        let cancel = self.handle.inner.cancel.clone();
        tokio::select! {
            biased;
            () = cancel.cancelled() => Err(self.handle.stop_reason(&self.ctx.shutdown)),
            res = self.write_queued(writer, first) => res.map_err(|e| CloseReason::Io(e.to_string())),
        }
    }

    /// The ACTIVE phase. Returns when the session should close; the socket
    /// halves are dropped (closed) on return.
    async fn run(&mut self, stream: TcpStream) -> CloseReason {
        let (read_half, write_half) = stream.into_split();
        let mut lines = FramedRead::new(
            read_half,
            LinesCodec::new_with_max_length(self.ctx.settings.max_line_length),
        );
        let mut writer = BufWriter::new(write_half);
        let cancel = self.handle.inner.cancel.clone();

        loop {
            if let Err(reason) = self.send_queued(&mut writer, None).await {
                return reason;
            }

            tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    return self.handle.stop_reason(&self.ctx.shutdown);
                }
                Some(line) = self.outbound.recv() => {
                    // Reply queued while idle (e.g. by a hook on another task).
                    if let Err(reason) = self.send_queued(&mut writer, Some(line)).await {
                        return reason;
                    }
                }
                frame = lines.next() => match frame {
                    None => return CloseReason::Eof,
                    Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                        self.handle.send(protocol::format_error("line too long"));
                        let _ = self.send_queued(&mut writer, None).await;
                        return CloseReason::ProtocolViolation("line too long".to_string());
                    }
                    Some(Err(LinesCodecError::Io(e))) => {
                        if e.kind() == std::io::ErrorKind::InvalidData {
                            return CloseReason::ProtocolViolation(e.to_string());
                        }
                        return CloseReason::Io(e.to_string());
                    }
                    Some(Ok(line)) => {
                        tokio::select! {
                            biased;
                            () = cancel.cancelled() => {
                                return self.handle.stop_reason(&self.ctx.shutdown);
                            }
                            () = self.limiter.wait_for(1.0) => {}
                        }
                        if let Flow::Quit = self.handle_line(&line) {
                            let _ = self.send_queued(&mut writer, None).await;
                            return CloseReason::Quit;
                        }
                    }
                },
            }
        }
    }

    /// CLOSING -> CLOSED. Idempotent.
    fn close(&mut self, reason: &CloseReason) {
        if matches!(self.state, SessionState::Closing | SessionState::Closed) {
            return;
        }
        self.transition(SessionState::Closing);
        self.handle.inner.cancel.cancel();
        log::info!(
            "[Session] Client disconnected: {} ({}, {} px)",
            self.handle.peer(),
            reason,
            self.handle.pixels()
        );
        self.ctx.hub.fire(hooks::DISCONNECT, Some(&self.handle), &[]);
        self.ctx
            .registry
            .remove(self.handle.identity(), self.handle.generation());
        self.handle.inner.closed.cancel();
        self.transition(SessionState::Closed);
    }
}

impl Drop for ClientSession {
    fn drop(&mut self) {
        self.close(&CloseReason::Aborted);
    }
}

/// Serve one accepted connection until it closes.
pub async fn serve(stream: TcpStream, peer: SocketAddr, ctx: SessionContext) -> CloseReason {
    if let Err(e) = stream.set_nodelay(true) {
        log::debug!("[Session] set_nodelay failed for {}: {}", peer, e);
    }

    let generation = ctx.registry.next_generation();
    let (handle, outbound) = ClientHandle::new(peer, generation, ctx.shutdown.child_token());
    let mut session = ClientSession {
        handle: handle.clone(),
        state: SessionState::Connecting,
        limiter: RateLimiter::new(ctx.settings.rate_budget),
        outbound,
        ctx,
    };
    log::info!("[Session] Client connected: {}", peer);

    if let Some(previous) = session.ctx.registry.accept(handle.clone()) {
        log::info!("[Session] {} replaces session {}", peer, previous.generation());
        let timeout = session.ctx.settings.eviction_timeout;
        if tokio::time::timeout(timeout, previous.wait_closed()).await.is_err() {
            log::warn!("[Session] Evicted session for {} did not close within {:?}", peer, timeout);
        }
    }

    session.ctx.hub.fire(hooks::CONNECT, Some(&handle), &[]);
    session.transition(SessionState::Active);

    let reason = session.run(stream).await;
    session.close(&reason);
    reason
}
