use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::AppConfig;
use crate::metrics;
use crate::routes;
use crate::runtime::RuntimeHandle;
use crate::state::AppState;
use crate::store::build_stores;

#[derive(Parser, Debug)]
#[command(name = "sandcastle")]
#[command(about = "Ephemeral repository sandboxes with a browser terminal")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Run the HTTP/WebSocket service (default)
    Serve {
        /// Overrides SANDCASTLE_ADDR
        #[arg(long)]
        bind: Option<SocketAddr>,
    },
    /// Run one expiry sweep and orphan reconciliation, then exit
    Sweep,
    /// Check that the key/value store and the container engine are reachable
    Check,
}

impl Cli {
    pub fn command(&self) -> Command {
        self.command.clone().unwrap_or(Command::Serve { bind: None })
    }
}

pub async fn run(cli: Cli, cfg: AppConfig) -> Result<()> {
    match cli.command() {
        Command::Serve { bind } => serve(cfg, bind).await,
        Command::Sweep => sweep(cfg).await,
        Command::Check => check(cfg).await,
    }
}

async fn build_state(cfg: &AppConfig) -> AppState {
    let stores = build_stores(cfg.redis_url.as_deref(), cfg.task_retention).await;
    let runtime = Arc::new(RuntimeHandle::docker(cfg.docker_host.clone()));
    AppState::with_defaults(cfg, stores, runtime)
}

async fn serve(cfg: AppConfig, bind: Option<SocketAddr>) -> Result<()> {
    metrics::init();
    let state = build_state(&cfg).await;

    let warm = state.runtime().clone();
    tokio::spawn(async move {
        if let Err(err) = warm.get().await {
            warn!(error = %err, "container runtime not reachable at startup");
        }
    });

    let shutdown = CancellationToken::new();
    let sweeper = state.sweeper().spawn(shutdown.clone());

    let addr = bind.unwrap_or(cfg.bind_addr);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    info!(
        addr = %addr,
        store = state.store_backend(),
        docker_host = cfg.docker_host.as_deref().unwrap_or("default"),
        session_ttl_secs = cfg.session_ttl.as_secs(),
        sweep_interval_secs = cfg.sweep_interval.as_secs(),
        build_workers = cfg.build_workers,
        "starting sandcastle"
    );

    let app = routes::router(state);
    let stop = shutdown.clone();
    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(async move {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = %err, "ctrl-c handler failed; shutting down");
            }
            info!("shutdown requested");
            stop.cancel();
        })
        .await
        .context("server")?;

    shutdown.cancel();
    let _ = sweeper.await;
    info!("sandcastle stopped");
    Ok(())
}

async fn sweep(cfg: AppConfig) -> Result<()> {
    let state = build_state(&cfg).await;
    let report = state.sweeper().sweep_once(Utc::now()).await;
    println!("{}", serde_json::to_string_pretty(&report)?);
    if report.failures > 0 {
        bail!("{} teardown(s) failed during sweep", report.failures);
    }
    Ok(())
}

async fn check(cfg: AppConfig) -> Result<()> {
    let state = build_state(&cfg).await;
    let mut problems = Vec::new();

    if cfg.redis_url.is_some() && state.store_backend() != "redis" {
        problems.push("redis configured but unreachable".to_string());
    }
    match state.sessions().ping().await {
        Ok(()) => println!("store ({}): ok", state.store_backend()),
        Err(err) => problems.push(format!("store: {err}")),
    }
    match state.runtime().get().await {
        Ok(runtime) => match runtime.ping().await {
            Ok(()) => println!("container runtime: ok"),
            Err(err) => problems.push(format!("container runtime: {err}")),
        },
        Err(err) => problems.push(format!("container runtime: {err}")),
    }

    if problems.is_empty() {
        Ok(())
    } else {
        bail!(problems.join("; "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serve_is_the_default_command() {
        let cli = Cli::parse_from(["sandcastle"]);
        assert_eq!(cli.command(), Command::Serve { bind: None });
    }

    #[test]
    fn serve_accepts_a_bind_override() {
        let cli = Cli::parse_from(["sandcastle", "serve", "--bind", "127.0.0.1:9000"]);
        assert_eq!(
            cli.command(),
            Command::Serve {
                bind: Some("127.0.0.1:9000".parse().unwrap())
            }
        );
        assert_eq!(Cli::parse_from(["sandcastle", "check"]).command(), Command::Check);
    }
}
