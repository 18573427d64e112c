//! DotLemor Relay - real-time event relay for stream overlays
//!
//! Fans chat, donation and walker events out to every connected overlay over
//! WebSocket, with periodic heartbeats and dead-connection sweeps.

mod api;
mod broadcast;
mod config;
mod handler;
mod intake;
mod models;
mod monitor;
mod registry;
mod transport;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::{json, Map, Value};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use crate::api::{AppState, IpcServer};
use crate::broadcast::BroadcastEngine;
use crate::config::Config;
use crate::handler::InboundConnectionHandler;
use crate::monitor::LivenessMonitor;
use crate::registry::ConnectionRegistry;

/// How long shutdown waits for subscriber sessions to send their close frames.
const SESSION_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

const LEMON: &str = "\x1b[38;5;227m";
const LEAF: &str = "\x1b[38;5;114m";
const ALERT: &str = "\x1b[38;5;196m";
const RESET: &str = "\x1b[0m";
const BOLD: &str = "\x1b[1m";
const DIM: &str = "\x1b[2m";

#[derive(Parser)]
#[command(name = "dotlemor-relay")]
#[command(about = "Real-time event relay for stream overlays")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Enable debug output
    #[arg(short, long, global = true)]
    debug: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the relay server
    Serve {
        /// Path to config file
        #[arg(short, long)]
        config: Option<String>,

        /// Host to bind to (overrides config)
        #[arg(short = 'H', long)]
        host: Option<String>,

        /// Port to bind to (overrides config)
        #[arg(short, long)]
        port: Option<u16>,

        /// Skip the startup banner
        #[arg(long)]
        no_banner: bool,
    },

    /// Publish an event through a running relay's IPC socket
    Emit {
        /// Event type (donation, walker, chat_message or a custom name)
        event_type: String,

        #[arg(short, long)]
        user: Option<String>,

        /// Chat message text
        #[arg(short, long)]
        text: Option<String>,

        /// Donation amount
        #[arg(short, long)]
        amount: Option<f64>,

        /// Donation message
        #[arg(short, long)]
        message: Option<String>,

        /// Path to the relay socket
        #[arg(short, long)]
        socket: Option<PathBuf>,
    },

    /// Manage configuration
    Config {
        /// Show current configuration
        #[arg(short, long)]
        show: bool,

        /// Initialize default configuration file
        #[arg(short, long)]
        init: bool,
    },

    /// Show version
    Version,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let (verbose, debug) = (cli.verbose, cli.debug);

    match cli.command {
        Commands::Serve {
            config,
            host,
            port,
            no_banner,
        } => {
            let config = Config::discover(config.as_deref())?;
            init_logging(verbose, debug, &config.log_level);
            run_serve(config, host, port, no_banner).await?;
        }
        Commands::Emit {
            event_type,
            user,
            text,
            amount,
            message,
            socket,
        } => {
            init_logging(verbose, debug, "warn");
            emit(&event_type, user, text, amount, message, socket).await?;
        }
        Commands::Config { show, init } => {
            init_logging(verbose, debug, "warn");
            manage_config(show, init)?;
        }
        Commands::Version => {
            print_version();
        }
    }

    Ok(())
}

/// `RUST_LOG` wins over the CLI flags, which win over `default_level`.
fn init_logging(verbose: bool, debug: bool, default_level: &str) {
    let level = if debug {
        "debug"
    } else if verbose {
        "info"
    } else {
        default_level
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let _ = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

fn print_version() {
    println!(
        "  {}●{} {}DotLemor Relay{} {}v{}{}",
        LEMON,
        RESET,
        BOLD,
        RESET,
        LEAF,
        env!("CARGO_PKG_VERSION"),
        RESET
    );
}

fn print_banner(config: &Config) {
    println!();
    println!("   {}{}░█▀▄░█▀█░▀█▀░█░░░█▀▀░█▄█░█▀█░█▀▄{}", BOLD, LEMON, RESET);
    println!("   {}{}░█░█░█░█░░█░░█░░░█▀▀░█░█░█░█░█▀▄{}", BOLD, LEMON, RESET);
    println!("   {}{}░▀▀░░▀▀▀░░▀░░▀▀▀░▀▀▀░▀░▀░▀▀▀░▀░▀{}", BOLD, LEMON, RESET);
    println!();
    println!("{}╭─────────────────────────────────────────────────────╮{}", LEAF, RESET);
    println!("{}│{} {}Relay v{}{}", LEAF, RESET, BOLD, env!("CARGO_PKG_VERSION"), RESET);
    println!(
        "{}│{} {}WebSocket:{} ws://{}:{}/ws",
        LEAF, RESET, DIM, RESET, config.host, config.port
    );
    println!(
        "{}│{} {}Publish:{}   http://{}:{}/simulate_donation",
        LEAF, RESET, DIM, RESET, config.host, config.port
    );
    println!("{}│{} {}Socket:{}    {:?}", LEAF, RESET, DIM, RESET, config.socket_path);
    println!(
        "{}│{} {}Inbound:{}   {:?}",
        LEAF, RESET, DIM, RESET, config.inbound_policy
    );
    println!("{}╰─────────────────────────────────────────────────────╯{}", LEAF, RESET);
    println!();
}

async fn run_serve(
    mut config: Config,
    host: Option<String>,
    port: Option<u16>,
    no_banner: bool,
) -> Result<()> {
    if let Some(host) = host {
        config.host = host;
    }
    if let Some(port) = port {
        config.port = port;
    }
    config.validate()?;

    if !no_banner {
        print_banner(&config);
    }
    let config = Arc::new(config);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let engine = BroadcastEngine::new(ConnectionRegistry::new(), config.publish_timeout());

    let monitor = LivenessMonitor::new(
        engine.clone(),
        config.sweep_interval(),
        config.heartbeat_interval(),
    )
    .spawn(shutdown_rx.clone());

    let ipc_server = IpcServer::new(config.socket_path.clone(), engine.clone(), config.limits.clone());
    let ipc_shutdown = shutdown_rx.clone();
    let ipc_task = tokio::spawn(async move {
        if let Err(e) = ipc_server.run(ipc_shutdown).await {
            error!(error = %e, "IPC server error");
        }
    });

    let handler = InboundConnectionHandler::new(
        engine.clone(),
        config.inbound_policy,
        config.limits.clone(),
        config.welcome(),
        shutdown_rx.clone(),
    );
    let sessions = handler.clone();
    let state = AppState::new(config.clone(), engine, handler);
    let server_config = config.clone();
    let mut server = tokio::spawn(async move {
        api::run_web_server(&server_config.host, server_config.port, state, shutdown_rx).await
    });

    info!(host = %config.host, port = config.port, "relay started");

    let finished = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            if let Err(e) = signal {
                warn!(error = %e, "failed to listen for ctrl-c");
            }
            None
        }
        joined = &mut server => Some(joined),
    };

    println!("  {}● Shutting down{}", LEMON, RESET);
    let _ = shutdown_tx.send(true);

    let served = match finished {
        Some(joined) => joined,
        None => server.await,
    };
    if tokio::time::timeout(SESSION_DRAIN_TIMEOUT, sessions.drain())
        .await
        .is_err()
    {
        warn!(open = sessions.active_sessions(), "sessions still open at shutdown");
    }
    monitor.join().await;
    if let Err(e) = ipc_task.await {
        error!(error = %e, "IPC task ended abnormally");
    }

    served??;
    info!("relay stopped");
    Ok(())
}

/// Build the event body sent by `emit`.
fn emit_body(
    event_type: &str,
    user: Option<String>,
    text: Option<String>,
    amount: Option<f64>,
    message: Option<String>,
) -> Value {
    let mut body = Map::new();
    body.insert("type".to_string(), json!(event_type));
    for (key, value) in [("user", user), ("text", text), ("message", message)] {
        if let Some(value) = value {
            body.insert(key.to_string(), json!(value));
        }
    }
    if let Some(amount) = amount {
        body.insert("amount".to_string(), json!(amount));
    }
    Value::Object(body)
}

async fn emit(
    event_type: &str,
    user: Option<String>,
    text: Option<String>,
    amount: Option<f64>,
    message: Option<String>,
    socket: Option<PathBuf>,
) -> Result<()> {
    let socket_path = match socket {
        Some(path) => path,
        None => Config::discover(None)?.socket_path,
    };

    let stream = UnixStream::connect(&socket_path)
        .await
        .with_context(|| format!("relay is not running at {:?}", socket_path))?;
    let (reader, mut writer) = stream.into_split();

    let body = emit_body(event_type, user, text, amount, message);
    let request = serde_json::to_string(&body)? + "\n";
    writer.write_all(request.as_bytes()).await?;

    let mut reply = String::new();
    BufReader::new(reader).read_line(&mut reply).await?;
    let reply: Value = serde_json::from_str(&reply).context("malformed reply from relay")?;

    if reply["status"] != "ok" {
        bail!(
            "relay rejected the event: {}",
            reply["message"].as_str().unwrap_or("unknown error")
        );
    }

    let delivered = reply["delivery"]["succeeded"].as_u64().unwrap_or(0);
    println!(
        "{}✓{} {} delivered to {} subscriber(s)",
        LEAF, RESET, event_type, delivered
    );
    Ok(())
}

fn manage_config(show: bool, init: bool) -> Result<()> {
    let config_path = Config::default_path();

    if init {
        if let Some(dir) = config_path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        Config::default().save(&config_path)?;
        println!("{}● Configuration created at {:?}{}", LEAF, config_path, RESET);
        return Ok(());
    }

    let config = if config_path.exists() {
        Config::load(&config_path)?
    } else {
        if !show {
            println!("{}No config file found, showing defaults{}", DIM, RESET);
        }
        Config::default()
    };

    if let Err(e) = config.validate() {
        eprintln!("{}✗ Invalid configuration:{} {}", ALERT, RESET, e);
    }
    println!("{}", serde_json::to_string_pretty(&config)?);
    Ok(())
}
