//! Relay Daemon - HTTP front end for the screenshot relay
//!
//! Serves the relay over HTTP for desktop clients that capture a screenshot
//! and ask a question about it.
//!
//! # Usage
//!
//! ```bash
//! # Start with defaults (127.0.0.1:8787, Ollama on 127.0.0.1:11434)
//! relay-daemon
//!
//! # Point at another Ollama and model
//! relay-daemon --ollama-host gpu-box:11434 --model llava:13b
//!
//! # With config file
//! relay-daemon --config ~/.config/screenshot-relay/relay.toml
//!
//! # Verbose logging
//! RUST_LOG=debug relay-daemon
//! ```
//!
//! # Signals
//!
//! - `SIGTERM` / `SIGINT`: Graceful shutdown (in-flight requests finish)

mod server;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

use relay_core::{
    default_config_path, load_config_from_path, ConfigOverrides, OllamaBackend, Relay,
    RelayBackend, RelayConfig,
};

/// Relay Daemon - Screenshot question answering over a local multimodal model
#[derive(Parser, Debug)]
#[command(name = "relay-daemon")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Configuration file path
    #[arg(short = 'c', long, env = "RELAY_CONFIG", value_name = "FILE")]
    config: Option<PathBuf>,

    /// Listen address
    #[arg(short = 'b', long, value_name = "ADDR")]
    bind: Option<String>,

    /// Ollama address (scheme optional)
    #[arg(long, value_name = "URL")]
    ollama_host: Option<String>,

    /// Model identifier
    #[arg(short = 'm', long)]
    model: Option<String>,

    /// Turns retained per session
    #[arg(long, value_name = "N")]
    max_turns: Option<usize>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long, env = "RELAY_LOG_LEVEL", default_value = "info")]
    log_level: String,
}

impl Args {
    fn overrides(&self) -> ConfigOverrides {
        let mut overrides = ConfigOverrides::new();
        if let Some(bind) = &self.bind {
            overrides = overrides.with_bind(bind.clone());
        }
        if let Some(host) = &self.ollama_host {
            overrides = overrides.with_ollama_host(host.clone());
        }
        if let Some(model) = &self.model {
            overrides = overrides.with_model(model.clone());
        }
        if let Some(max_turns) = self.max_turns {
            overrides = overrides.with_max_turns(max_turns);
        }
        overrides
    }
}

/// Initialize logging with the specified level
fn init_logging(level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(format!("relay_daemon={level},relay_core={level}"))
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_line_number(true)
        .init();
}

/// Load configuration: file and environment, then CLI overrides on top
fn load(args: &Args) -> Result<RelayConfig> {
    let path = args.config.clone().or_else(default_config_path);
    let mut config = load_config_from_path(path).context("Failed to load configuration")?;
    args.overrides().apply(&mut config);
    config.validate().context("Invalid configuration")?;
    Ok(config)
}

/// Periodically evict sessions idle longer than `idle`
fn spawn_session_sweeper<B: RelayBackend + 'static>(relay: Arc<Relay<B>>, idle: Duration) {
    let period = (idle / 4).clamp(Duration::from_secs(1), Duration::from_secs(60));
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            relay.sessions().evict_idle();
        }
    });
}

/// Resolve on Ctrl-C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("Received Ctrl-C, shutting down"),
        () = terminate => info!("Received SIGTERM, shutting down"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging first
    init_logging(&args.log_level);

    info!("Relay Daemon starting");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let config = load(&args)?;
    info!(
        source = %config.source(),
        config_file = ?config.config_file_path,
        ollama_host = %config.ollama_host,
        model = %config.model,
        max_turns = config.max_turns,
        max_sessions = config.max_sessions,
        "Configuration loaded"
    );

    let backend = OllamaBackend::from_config(&config).context("Failed to create backend")?;
    if !backend.health_check().await {
        warn!(
            address = backend.address(),
            "Ollama is not reachable yet; requests will fail until it is"
        );
    }

    let relay = Arc::new(Relay::from_config(backend, &config));
    spawn_session_sweeper(Arc::clone(&relay), config.session_idle);
    let app = server::router(relay, config.max_body_bytes);

    let listener = tokio::net::TcpListener::bind(&config.bind)
        .await
        .with_context(|| format!("Failed to bind {}", config.bind))?;
    info!(addr = %config.bind, "Listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    info!("Relay Daemon stopped");
    Ok(())
}
