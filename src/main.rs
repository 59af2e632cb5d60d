mod config;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use dockscope_docker::DockerHost;
use dockscope_web::{AppState, router};

use crate::config::Config;

/// Dockscope - Live Docker container logs over Server-Sent Events
#[derive(Parser, Debug)]
#[command(name = "dockscope")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file
    #[arg(short, long, default_value = "dockscope.toml")]
    config: PathBuf,

    /// Listen address, overrides the configuration file
    #[arg(long)]
    addr: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let result = run(args).await;

    if let Err(e) = &result {
        error!("{:#}", e);
    }

    result
}

async fn run(args: Args) -> Result<()> {
    let mut config = Config::load(&args.config)?;
    if let Some(addr) = args.addr {
        config.addr = addr;
    }

    let mut hosts = Vec::with_capacity(config.hosts.len());
    for host in &config.hosts {
        let docker = DockerHost::connect(host.name.clone(), host.endpoint.as_deref())
            .with_context(|| format!("failed to connect to host {}", host.name))?;

        // An unreachable engine only fails its own requests
        if let Err(e) = docker.ping().await {
            warn!("host {} is not answering: {}", host.name, e);
        }
        hosts.push(Arc::new(docker));
    }

    let shutdown = CancellationToken::new();
    let state = AppState::new(hosts, shutdown.clone())
        .with_settings(config.stream_settings())
        .with_membership_buffer(config.stream.membership_buffer);

    let listener = tokio::net::TcpListener::bind(&config.addr)
        .await
        .with_context(|| format!("failed to bind {}", config.addr))?;
    info!("listening on {}", listener.local_addr()?);

    tokio::spawn(wait_for_signal(shutdown.clone()));

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await?;

    info!("server stopped");
    Ok(())
}

/// Cancel every open stream on Ctrl-C
async fn wait_for_signal(shutdown: CancellationToken) {
    match tokio::signal::ctrl_c().await {
        Ok(()) => {
            info!("shutting down");
            shutdown.cancel();
        }
        Err(e) => error!("unable to listen for shutdown signal: {}", e),
    }
}
