mod auth;
mod cache;
mod config;
mod context;
mod http;
mod metrics;
mod repository;
mod router;
mod server;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::cache::{FsContentStore, start_cleanup_loop};
use crate::config::Config;
use crate::http::handler::{AppState, create_router};
use crate::metrics::{MetricsRegistry, metrics_router};
use crate::repository::Repository;
use crate::repository::caching::{CachingRepository, VersionCache};
use crate::repository::github::GitHubRepository;

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(name = "forgemod", about = "Terraform module registry backed by GitHub")]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long, default_value = "/etc/forgemod/config.yaml")]
    config: String,
}

// ---------------------------------------------------------------------------
// HTTP servers
// ---------------------------------------------------------------------------

/// Wait for `server` to drain after shutdown has been requested, giving up
/// after `grace`.  A server exiting on its own requests shutdown of the rest.
async fn drain(
    name: &'static str,
    server: tokio::task::JoinHandle<Result<()>>,
    shutdown: &CancellationToken,
    grace: Duration,
) {
    let abort = server.abort_handle();
    let outcome = tokio::select! {
        outcome = server => Some(outcome),
        () = async {
            shutdown.cancelled().await;
            tokio::time::sleep(grace).await;
        } => None,
    };
    shutdown.cancel();
    match outcome {
        Some(Ok(Ok(()))) => tracing::info!(server = name, "server stopped"),
        Some(Ok(Err(e))) => tracing::error!(server = name, error = %e, "server failed"),
        Some(Err(e)) => tracing::error!(server = name, error = %e, "server task panicked"),
        None => {
            tracing::warn!(server = name, ?grace, "shutdown timed out, aborting connections");
            abort.abort();
        }
    }
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
// Repository stack
// ---------------------------------------------------------------------------

fn build_repository(
    config: &Config,
    metrics: &MetricsRegistry,
) -> Result<(Arc<dyn Repository>, Option<Arc<VersionCache>>)> {
    let http_client = reqwest::Client::builder()
        .user_agent("forgemod/0.1")
        .timeout(config.github.request_timeout())
        .build()
        .context("failed to build reqwest client")?;

    let service_token = config.github.service_token();
    if service_token.is_none() {
        tracing::warn!(
            env = %config.github.token_env,
            "no service token configured; anonymous requests will be rate limited"
        );
    }

    let github = GitHubRepository::new(&config.github, service_token, http_client)
        .with_metrics(Arc::clone(&metrics.metrics));
    let github: Arc<dyn Repository> = Arc::new(github);

    if !config.cache.enabled {
        return Ok((github, None));
    }

    let versions = Arc::new(VersionCache::new(config.cache.expiration()));
    let store = FsContentStore::new(&config.cache.path);
    let caching = CachingRepository::new(github, Arc::clone(&versions))
        .with_store(Arc::new(store))
        .with_metrics(Arc::clone(&metrics.metrics));
    tracing::info!(
        path = %config.cache.path,
        expiration = ?config.cache.expiration(),
        "caching enabled"
    );
    Ok((Arc::new(caching), Some(versions)))
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    // ---- CLI ----
    let cli = Cli::parse();

    // ---- Config ----
    let config = config::load_config(&cli.config)?;

    // ---- Tracing ----
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    tracing::info!(config_path = %cli.config, "starting forgemod");

    // ---- Metrics ----
    let metrics = MetricsRegistry::new();

    // ---- Repository ----
    if config.cache.enabled {
        tokio::fs::create_dir_all(&config.cache.path)
            .await
            .with_context(|| format!("failed to create cache dir: {}", config.cache.path))?;
    }
    let (repository, version_cache) = build_repository(&config, &metrics)?;

    let sweeper = version_cache.map(|cache| {
        let metrics = Arc::clone(&metrics.metrics);
        start_cleanup_loop(cache, config.cache.cleanup_interval(), move |removed| {
            metrics.cache_swept_entries.inc_by(removed as u64);
        })
    });

    // ---- App state ----
    let state = AppState::new(repository, metrics.clone(), config.server.public_url.as_deref())
        .context("failed to build routes")?;

    // ---- Spawn services ----
    let shutdown = CancellationToken::new();

    let tls = config
        .server
        .tls
        .as_ref()
        .map(server::load_acceptor)
        .transpose()
        .context("failed to load TLS certificate")?;
    let header_read_timeout = config.server.header_read_timeout();

    let registry_listener = server::bind("registry", &config.server.listen).await?;
    let metrics_listener = if config.metrics.enabled {
        Some(server::bind("metrics", &config.metrics.listen).await?)
    } else {
        None
    };

    let http_handle = tokio::spawn(server::serve(
        "registry",
        registry_listener,
        create_router(state, config.server.handler_timeout()),
        tls,
        header_read_timeout,
        shutdown.clone(),
    ));
    let metrics_handle = metrics_listener.map(|listener| {
        tokio::spawn(server::serve(
            "metrics",
            listener,
            metrics_router(metrics.clone()),
            None,
            header_read_timeout,
            shutdown.clone(),
        ))
    });

    // ---- Await shutdown ----
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            shutdown_signal().await;
            shutdown.cancel();
        }
    });

    let grace = config.server.shutdown_timeout();
    let metrics_drain = async {
        if let Some(handle) = metrics_handle {
            drain("metrics", handle, &shutdown, grace).await;
        }
    };
    tokio::join!(drain("registry", http_handle, &shutdown, grace), metrics_drain);

    if let Some(sweeper) = sweeper {
        sweeper.stop().await;
    }

    tracing::info!("forgemod shut down cleanly");
    Ok(())
}
