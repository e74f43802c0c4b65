//! tundler-api - HTTP control plane for commercial VPN clients
//!
//! Loads the configuration, builds the provider registry, optionally logs
//! providers in, and serves the API until SIGINT or SIGTERM.

use anyhow::{Context, Result};
use clap::Parser;
use libtundler::config::{self, TundlerConfig};
use libtundler::provider::registry::default_registry;
use libtundler::{HttpTelemetry, Manager, NoopTelemetry, SystemRunner, Telemetry};
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "tundler-api")]
#[command(version)]
#[command(about = "HTTP API for driving VPN provider clients", long_about = None)]
struct Args {
    /// Configuration file (default: ~/.config/tundler/tundler.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Port to listen on
    #[arg(short, long, default_value_t = 4242)]
    listen: u16,

    /// Address to bind
    #[arg(long, default_value = "0.0.0.0")]
    bind: IpAddr,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Send anonymous connect events
    #[arg(long)]
    telemetry: bool,

    /// Providers to log in at startup: comma-separated names or "all"
    #[arg(long, value_name = "PROVIDERS")]
    login: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config_path = args.config.clone().or_else(config::default_path);
    let config = match &config_path {
        Some(path) => TundlerConfig::load(path)
            .with_context(|| format!("loading configuration from {}", path.display()))?,
        None => TundlerConfig::default(),
    };

    init_logging(args.debug || config.debug);

    info!("Starting tundler-api v{}", env!("CARGO_PKG_VERSION"));

    #[cfg(target_os = "linux")]
    {
        let uid = unsafe { libc::getuid() };
        if uid != 0 {
            warn!("Not running as root - some VPN clients may refuse to connect");
        }
    }

    let registry = default_registry(Arc::new(SystemRunner::from_env()));
    if registry.is_empty() {
        warn!("No VPN providers compiled in");
    }

    let allowed = config::resolve_locations(&config, &registry).await;

    let telemetry: Arc<dyn Telemetry> = if args.telemetry || config.telemetry {
        info!("Telemetry enabled");
        Arc::new(HttpTelemetry::default())
    } else {
        Arc::new(NoopTelemetry)
    };

    let manager = Arc::new(Manager::new(registry, allowed, telemetry));

    if let Some(login) = &args.login {
        startup_login(&manager, login).await;
    }

    let addr = SocketAddr::new(args.bind, args.listen);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {}", addr))?;
    info!("Listening on http://{}", addr);

    axum::serve(listener, libtundler::api::router(manager))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("serving HTTP API")?;

    info!("tundler-api stopped");
    Ok(())
}

fn init_logging(debug: bool) {
    let log_level = if debug { "debug" } else { "info" };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "tundler_api={},libtundler={},tower_http={}",
            log_level, log_level, log_level
        ))
    });

    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_ansi(atty::is(atty::Stream::Stdout))
        .init();
}

/// Log in the providers named by `--login`; failures are logged, not fatal
async fn startup_login(manager: &Manager, login: &str) {
    if login.trim() == "all" {
        if let Err(e) = manager.login("").await {
            error!("Login of all providers failed: {}", e);
        }
        return;
    }

    for name in login.split(',').map(str::trim).filter(|n| !n.is_empty()) {
        match manager.login(name).await {
            Ok(()) => info!("Logged in {}", name),
            Err(e) => error!("Login {} failed: {}", name, e),
        }
    }
}

/// Resolve on SIGTERM or SIGINT
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let (mut sigterm, mut sigint) = match (
            signal(SignalKind::terminate()),
            signal(SignalKind::interrupt()),
        ) {
            (Ok(term), Ok(int)) => (term, int),
            (Err(e), _) | (_, Err(e)) => {
                error!("Failed to register signal handlers: {}", e);
                return std::future::pending().await;
            }
        };

        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM, initiating graceful shutdown"),
            _ = sigint.recv() => info!("Received SIGINT (Ctrl+C), initiating graceful shutdown"),
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            return std::future::pending().await;
        }
        info!("Received Ctrl+C, initiating graceful shutdown");
    }
}
