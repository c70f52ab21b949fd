//! Pixelflut server binary.
//!
//! See the `pixelflut` library for the core functionality.

use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use mimalloc::MiMalloc;
use pixelflut::config::{parse_size, Config};
use pixelflut::render::{HeadlessDisplay, TerminalDisplay};
use pixelflut::Server;

/// mimalloc has better multi-threaded performance than the system allocator.
#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

/// Set by SIGINT/SIGTERM/SIGHUP; polled by the render loop.
static SHUTDOWN_FLAG: std::sync::LazyLock<Arc<AtomicBool>> =
    std::sync::LazyLock::new(|| Arc::new(AtomicBool::new(false)));

#[derive(Parser)]
#[command(name = "pixelflut")]
#[command(version)]
#[command(about = "Multi-client collaborative pixel canvas over TCP")]
struct Cli {
    /// Host to bind [env: PIXELFLUT_HOST]
    #[arg(long)]
    host: Option<String>,

    /// Port to bind [env: PIXELFLUT_PORT]
    #[arg(short, long)]
    port: Option<u16>,

    /// Lua behavior file, reloaded on change [env: PIXELFLUT_BEHAVIOR]
    #[arg(short, long)]
    behavior: Option<PathBuf>,

    /// JSON config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Canvas size as WIDTHxHEIGHT (default: terminal size, or 640x480 headless)
    #[arg(long, value_parser = parse_size)]
    size: Option<(u32, u32)>,

    /// Frames per second
    #[arg(long)]
    fps: Option<u32>,

    /// Run without drawing to the terminal
    #[arg(long)]
    headless: bool,
}

impl Cli {
    /// Layer CLI flags over the loaded config.
    fn apply(&self, config: &mut Config) {
        if let Some(host) = &self.host {
            config.host.clone_from(host);
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(behavior) = &self.behavior {
            config.behavior = Some(behavior.clone());
        }
        if let Some((width, height)) = self.size {
            config.width = width;
            config.height = height;
        }
        if let Some(fps) = self.fps {
            config.frame_rate = fps;
        }
    }
}

fn init_logging(headless: bool) -> Result<()> {
    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    builder.format_timestamp_secs();
    if !headless {
        // The terminal display owns stdout, so logs go to a file.
        let log_path = std::env::var("PIXELFLUT_LOG_FILE")
            .map_or_else(|_| PathBuf::from("/tmp/pixelflut.log"), PathBuf::from);
        let log_file = std::fs::File::create(&log_path)
            .with_context(|| format!("Failed to create log file at {}", log_path.display()))?;
        builder.target(env_logger::Target::Pipe(Box::new(log_file)));
    }
    builder.init();
    Ok(())
}

fn install_panic_hook() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        log::error!("PANIC: {:?}", panic_info);

        // Restore the terminal before the default handler prints.
        let _ = crossterm::terminal::disable_raw_mode();
        let _ = crossterm::execute!(
            std::io::stdout(),
            crossterm::terminal::LeaveAlternateScreen,
            crossterm::cursor::Show
        );

        default_hook(panic_info);
    }));
}

fn register_signals() -> Result<()> {
    use signal_hook::consts::signal::{SIGHUP, SIGINT, SIGTERM};
    use signal_hook::flag;
    flag::register(SIGINT, Arc::clone(&SHUTDOWN_FLAG))?;
    flag::register(SIGTERM, Arc::clone(&SHUTDOWN_FLAG))?;
    flag::register(SIGHUP, Arc::clone(&SHUTDOWN_FLAG))?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.headless)?;
    if !cli.headless {
        install_panic_hook();
    }

    let mut config = Config::load(cli.config.as_deref())?;
    cli.apply(&mut config);
    if !cli.headless && cli.size.is_none() && cli.config.is_none() {
        let (width, height) = TerminalDisplay::probe_size()?;
        config.width = width;
        config.height = height;
    }

    register_signals()?;
    let server = Server::bind(config.clone())?.with_quit_flag(Arc::clone(&SHUTDOWN_FLAG));
    log::info!(
        "Pixelflut v{} listening on {} ({}x{})",
        env!("CARGO_PKG_VERSION"),
        server.local_addr(),
        config.width,
        config.height
    );

    if cli.headless {
        println!("Pixelflut listening on {}", server.local_addr());
        let (display, _control) = HeadlessDisplay::new(config.width, config.height);
        server.run(display).await?;
    } else {
        let display = TerminalDisplay::new()?;
        server.run(display).await?;
    }
    Ok(())
}
