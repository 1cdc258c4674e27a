mod config;
mod credentials;
mod error;
mod health;
mod http;
mod metrics;
mod route;
mod ssh;
mod wire;

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use tokio::signal;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::metrics::MetricsRegistry;
use crate::route::Resolver;
use crate::ssh::{Router, SshConnector};

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(name = "ssh-router", about = "Project-routing SSH front door")]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long, default_value = "/etc/ssh-router/config.yaml")]
    config: String,

    /// Log output format.
    #[arg(long, value_enum, default_value_t = LogFormat::Json)]
    log_format: LogFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Json,
    Text,
}

// ---------------------------------------------------------------------------
// Shared application state
// ---------------------------------------------------------------------------

/// Global state shared by the SSH listener and the admin HTTP handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub metrics: MetricsRegistry,
    pub resolver: Arc<dyn Resolver>,
    pub router: Arc<Router>,
    /// Set once the SSH listener is bound.
    pub ssh_ready: Arc<AtomicBool>,
}

// ---------------------------------------------------------------------------
// Tracing
// ---------------------------------------------------------------------------

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).init(),
    }
}

// ---------------------------------------------------------------------------
// HTTP server (axum)
// ---------------------------------------------------------------------------

async fn run_http_server(state: AppState, listen: String) -> Result<()> {
    let app = http::handler::create_router(Arc::new(state));

    let listen_addr: std::net::SocketAddr =
        listen.parse().context("invalid http_listen address")?;

    let listener = tokio::net::TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind HTTP listener on {listen_addr}"))?;

    tracing::info!(%listen_addr, "admin HTTP server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server error")?;

    Ok(())
}

// ---------------------------------------------------------------------------
// Graceful shutdown
// ---------------------------------------------------------------------------

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("received SIGINT"),
        () = terminate => tracing::info!("received SIGTERM"),
    }
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    // ---- CLI ----
    let cli = Cli::parse();

    // ---- Tracing ----
    init_tracing(cli.log_format);

    // ---- Config ----
    let config = config::load_config(&cli.config)?;
    let config = Arc::new(config);

    tracing::info!(config_path = %cli.config, "starting ssh-router");

    // ---- Metrics ----
    let metrics = MetricsRegistry::new();

    // ---- Routing ----
    let resolver = route::build_resolver(&config.resolver).context("failed to build resolver")?;

    let client_key = credentials::load_key_pair(&config.upstream.client_key)
        .context("failed to load upstream client key")?;
    let connector = SshConnector::new(
        &config.upstream,
        &config.ssh.username,
        &config.ssh.server_version,
        client_key,
    );

    let router = Arc::new(Router::new(
        Arc::clone(&resolver),
        Arc::new(connector),
        config.ssh.routing_env_var.clone(),
        config.ssh.env_timeout(),
        Arc::clone(&metrics.metrics),
    ));

    // ---- App state ----
    let state = AppState {
        config: Arc::clone(&config),
        metrics,
        resolver,
        router,
        ssh_ready: Arc::new(AtomicBool::new(false)),
    };

    // ---- Spawn services ----
    let http_handle = config.proxy.http_listen.clone().map(|listen| {
        let s = state.clone();
        tokio::spawn(async move {
            if let Err(e) = run_http_server(s, listen).await {
                tracing::error!(error = %e, "HTTP server failed");
            }
        })
    });

    let ssh_handle = tokio::spawn({
        let s = Arc::new(state.clone());
        async move { ssh::start_ssh_server(s).await }
    });

    // ---- Await shutdown ----
    // The SSH listener has no graceful drain; it ends with the process.
    let (result, signalled) = tokio::select! {
        joined = ssh_handle => match joined {
            Ok(Ok(())) => (Ok(()), false),
            Ok(Err(e)) => {
                tracing::error!(error = %e, "SSH server failed");
                (Err(e), false)
            }
            Err(e) => (Err(anyhow::anyhow!("SSH server task panicked: {e}")), false),
        },
        () = shutdown_signal() => (Ok(()), true),
    };

    // On a signal the admin listener drains on its own; otherwise stop it.
    if let Some(handle) = http_handle {
        if !signalled {
            handle.abort();
        }
        let _ = handle.await;
    }

    tracing::info!("ssh-router shut down");
    result
}
