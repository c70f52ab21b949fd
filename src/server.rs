//! Top-level composition.
//!
//! [`Server`] owns the listener and the process-wide state (canvas, hook
//! hub, session registry, counters) and wires up the three long-running
//! parts:
//!
//! - the accept loop, one task per session;
//! - the [`BehaviorLoader`] watch task (when a behavior file is configured);
//! - the [`RenderLoop`] on a blocking thread.
//!
//! [`Server::run`] returns when the render loop stops (display quit, signal
//! flag, or [`ServerHandle::shutdown`]). Shutdown stops accepting, lets
//! sessions finish the command they are handling, then waits for their
//! teardown.

use std::net::{SocketAddr, TcpListener as StdTcpListener};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::behavior::BehaviorLoader;
use crate::canvas::{Canvas, ServerStats};
use crate::config::Config;
use crate::constants::{DEFAULT_TITLE, SHUTDOWN_GRACE};
use crate::hooks::{self, EventHub, Hook};
use crate::net::{self, ClientHandle, ConnectionRegistry, SessionContext, SessionSettings, TcpServer};
use crate::protocol::HELP_TEXT;
use crate::render::{Display, RenderLoop};

/// Cloneable access to a server's shared state.
#[derive(Debug, Clone)]
pub struct ServerHandle {
    canvas: Arc<Canvas>,
    hub: Arc<EventHub>,
    registry: Arc<ConnectionRegistry>,
    shutdown: CancellationToken,
}

impl ServerHandle {
    /// The shared canvas.
    pub fn canvas(&self) -> &Arc<Canvas> {
        &self.canvas
    }

    /// Hook dispatch.
    pub fn hub(&self) -> &Arc<EventHub> {
        &self.hub
    }

    /// Live sessions.
    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Ask the server to stop.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Whether shutdown was requested.
    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}

/// A bound, not yet running pixelflut server.
#[derive(Debug)]
pub struct Server {
    config: Config,
    listener: StdTcpListener,
    local_addr: SocketAddr,
    handle: ServerHandle,
    quit_flag: Option<Arc<AtomicBool>>,
}

/// Base `COMMAND-HELP`; a behavior may shadow it.
fn help_hook() -> Arc<dyn Hook> {
    Arc::new(|_: &Arc<Canvas>, client: Option<&ClientHandle>, _: &[String]| -> Result<()> {
        if let Some(client) = client {
            client.send(HELP_TEXT);
        }
        Ok(())
    })
}

impl Server {
    /// Validate `config`, bind the listener and build the shared state.
    ///
    /// # Errors
    ///
    /// Returns an error if the config is invalid or the address cannot be
    /// bound.
    pub fn bind(config: Config) -> Result<Self> {
        config.validate()?;
        let listener = net::server::bind(config.bind_addr())?;
        let local_addr = listener.local_addr()?;

        let stats = Arc::new(ServerStats::default());
        let canvas = Arc::new(Canvas::new(
            config.width,
            config.height,
            Arc::clone(&stats),
            config.snapshot_dir.clone(),
        ));
        canvas.set_title(DEFAULT_TITLE);
        let hub = Arc::new(EventHub::new(Arc::clone(&canvas)));
        hub.register(hooks::command("HELP"), help_hook());

        Ok(Self {
            config,
            listener,
            local_addr,
            handle: ServerHandle {
                canvas,
                hub,
                registry: Arc::new(ConnectionRegistry::new(stats)),
                shutdown: CancellationToken::new(),
            },
            quit_flag: None,
        })
    }

    /// Also stop when `flag` becomes true (e.g. set by a signal handler).
    pub fn with_quit_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.quit_flag = Some(flag);
        self
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Shared-state handle, usable before and during [`run`](Self::run).
    pub fn handle(&self) -> ServerHandle {
        self.handle.clone()
    }

    /// Run until the render loop stops, then shut down. Returns the display.
    ///
    /// # Errors
    ///
    /// Returns an error if the listener cannot be started or the display
    /// fails.
    pub async fn run<D: Display + 'static>(self, display: D) -> Result<D> {
        let Self {
            config,
            listener,
            handle,
            quit_flag,
            ..
        } = self;
        let shutdown = handle.shutdown.clone();
        // Whatever way we leave, everything else stops too.
        let _stop_all = scopeguard::guard(shutdown.clone(), |token| token.cancel());

        let loader_task = match config.behavior.clone() {
            Some(path) => {
                let loader = BehaviorLoader::new(
                    path,
                    Arc::clone(&handle.hub),
                    Duration::from_millis(config.reload_interval_ms),
                );
                loader.load().await;
                Some(tokio::spawn(loader.run(shutdown.clone())))
            }
            None => None,
        };

        let tracker = TaskTracker::new();
        let ctx = SessionContext {
            hub: Arc::clone(&handle.hub),
            registry: Arc::clone(&handle.registry),
            settings: SessionSettings::from_config(&config),
            shutdown: shutdown.clone(),
        };
        let tcp = TcpServer::start(listener, ctx, tracker.clone())?;

        let mut render = RenderLoop::new(
            display,
            Arc::clone(&handle.hub),
            config.frame_rate,
            shutdown.clone(),
        );
        if let Some(flag) = quit_flag {
            render = render.with_quit_flag(flag);
        }
        let rendered = tokio::task::spawn_blocking(move || render.run()).await;

        log::info!("[Server] Shutting down");
        shutdown.cancel();
        tcp.join().await;
        tracker.close();
        if tokio::time::timeout(SHUTDOWN_GRACE, tracker.wait()).await.is_err() {
            log::warn!("[Server] {} sessions still closing after {:?}", tracker.len(), SHUTDOWN_GRACE);
        }
        if let Some(task) = loader_task {
            if let Err(e) = task.await {
                log::warn!("[Server] Behavior loader ended abnormally: {e}");
            }
        }
        log::info!("[Server] Stopped");

        rendered.map_err(|e| anyhow!("Render loop panicked: {e}"))?
    }
}
