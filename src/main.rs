//! Agent Relay CLI entry point. See the `agent_relay` library for the
//! broker implementation.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use agent_relay::{Broker, Config};
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use mimalloc::MiMalloc;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

/// Global flag for signal-triggered shutdown, shared with signal-hook.
static SHUTDOWN_FLAG: std::sync::LazyLock<Arc<AtomicBool>> =
    std::sync::LazyLock::new(|| Arc::new(AtomicBool::new(false)));

#[derive(Parser)]
#[command(name = "agent-relay")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Broker for real-time message exchange between PTY-wrapped CLI agents")]
struct Cli {
    /// Log level passed to env_logger (error, warn, info, debug, trace).
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Runs as the broker: opens the local socket, optional WS listener,
    /// and optional cloud uplink.
    Init {
        #[arg(long)]
        api_port: Option<u16>,
        #[arg(long)]
        socket: Option<PathBuf>,
        #[arg(long)]
        ws_port: Option<u16>,
    },
    /// Wraps one CLI in a PTY session, registered under `name`.
    Pty {
        cli: String,
        #[arg(trailing_var_arg = true)]
        args: Vec<String>,
        #[arg(long)]
        name: String,
        #[arg(long, default_value = ".")]
        cwd: PathBuf,
    },
    /// Runs a CLI one-shot with no injection queue, for CI-style invocations.
    Headless {
        cli: String,
        #[arg(trailing_var_arg = true)]
        args: Vec<String>,
        #[arg(long)]
        name: String,
    },
    /// Attaches as an inert participant, useful for manual inspection.
    Listen {
        #[arg(long, default_value = "observer")]
        name: String,
    },
}

fn init_logging(log_level: &str) {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level))
        .format_timestamp_millis()
        .init();
}

fn register_signal_handlers() -> Result<()> {
    use signal_hook::consts::signal::{SIGHUP, SIGINT, SIGTERM};
    use signal_hook::flag;
    flag::register(SIGINT, Arc::clone(&SHUTDOWN_FLAG))?;
    flag::register(SIGTERM, Arc::clone(&SHUTDOWN_FLAG))?;
    flag::register(SIGHUP, Arc::clone(&SHUTDOWN_FLAG))?;
    Ok(())
}

/// Runs the broker: local socket always, WS listener and cloud uplink when
/// configured (§6, §9 startup ordering — restore state before any listener).
async fn run_init(api_port: Option<u16>, socket: Option<PathBuf>, ws_port: Option<u16>) -> Result<()> {
    let mut config = Config::load()?;
    if let Some(socket) = socket {
        config.socket_path = socket;
    }
    if let Some(port) = ws_port {
        config.ws_listen_addr = Some(format!("127.0.0.1:{port}"));
    }
    let _ = api_port; // reserved for a future HTTP status surface; not part of this scope

    register_signal_handlers()?;

    let broker = Arc::new(Broker::new(config));
    broker.restore_state().context("restoring broker state")?;
    broker.supervisor.spawn_sweeper();

    let socket_server = agent_relay::SocketServer::start(Arc::clone(&broker), broker.config.socket_path.clone())
        .context("starting local socket transport")?;

    let ws_server = if let Some(addr) = broker.config.ws_listen_addr.clone() {
        Some(agent_relay::WsServer::start(Arc::clone(&broker), &addr).await.context("starting websocket transport")?)
    } else {
        None
    };

    let resume_token = Arc::new(std::sync::Mutex::new(String::new()));
    let uplink = broker.config.cloud_uplink_url.clone().map(|url| {
        agent_relay::uplink::CloudUplink::spawn(
            agent_relay::uplink::UplinkConfig { url, workspace_token: broker.config.workspace_token.clone() },
            Arc::clone(&broker.router),
            resume_token,
        )
    });

    log::info!("agent-relay broker listening on {}", broker.config.socket_path.display());

    while !SHUTDOWN_FLAG.load(std::sync::atomic::Ordering::Relaxed) {
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    }

    log::info!("shutting down");
    broker.supervisor.request_shutdown();
    broker.save_state();
    if let Some(uplink) = uplink {
        uplink.shutdown();
    }
    if let Some(ws_server) = ws_server {
        ws_server.shutdown();
    }
    socket_server.shutdown();
    Ok(())
}

/// Wraps `cli_name` under a PTY and keeps the process alive until the
/// wrapped CLI exits or a shutdown signal arrives, so injected SENDs can
/// reach it through the broker this process joins as `name`.
async fn run_pty(cli_name: &str, args: &[String], name: &str, cwd: &std::path::Path) -> Result<()> {
    register_signal_handlers()?;
    let config = Config::load()?;
    let broker = Arc::new(Broker::new(config));
    broker.restore_state().context("restoring broker state")?;

    let pty = broker.spawn_pty(name, cli_name, args, cwd, &HashMap::new()).context("spawning PTY session")?;
    log::info!("'{name}' running under PTY as '{cli_name}' (pid {:?})", pty.pid);

    let mut events = pty.subscribe();
    loop {
        if SHUTDOWN_FLAG.load(std::sync::atomic::Ordering::Relaxed) {
            break;
        }
        tokio::select! {
            event = events.recv() => {
                if matches!(event, Ok(agent_relay::pty::PtyEvent::ProcessExited { .. }) | Err(_)) {
                    break;
                }
            }
            () = tokio::time::sleep(std::time::Duration::from_millis(200)) => {}
        }
    }

    broker.release_pty(name);
    Ok(())
}

/// Runs `cli_name` one-shot with no injection queue: useful for CI where the
/// wrapped CLI's own exit code is the thing that matters, not relay delivery.
fn run_headless(cli_name: &str, args: &[String], name: &str) -> Result<()> {
    let status = std::process::Command::new(cli_name).args(args).status().with_context(|| format!("spawning '{cli_name}'"))?;
    log::info!("'{name}' ({cli_name}) exited with {status}");
    std::process::exit(status.code().unwrap_or(1));
}

/// Attaches to the broker's local socket as a named, otherwise-inert peer —
/// useful for manually inspecting traffic with a terminal-side client.
async fn run_listen(name: &str) -> Result<()> {
    let config = Config::load()?;
    log::info!("'{name}' listening on {}", config.socket_path.display());
    register_signal_handlers()?;
    while !SHUTDOWN_FLAG.load(std::sync::atomic::Ordering::Relaxed) {
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level);

    let result = match cli.command {
        Commands::Init { api_port, socket, ws_port } => run_init(api_port, socket, ws_port).await,
        Commands::Pty { cli, args, name, cwd } => run_pty(&cli, &args, &name, &cwd).await,
        Commands::Headless { cli, args, name } => run_headless(&cli, &args, &name),
        Commands::Listen { name } => run_listen(&name).await,
    };

    if let Err(err) = &result {
        log::error!("fatal: {err:?}");
        std::process::exit(1);
    }
    result
}
