//! colo-sim: a co-location echo server under simulated client load
//!
//! Starts a TCP echo server, launches a fleet of simulated clients against
//! it, and samples host CPU and memory usage on a fixed cadence.
//!
//! Features:
//! - One task per connection with a cap on concurrent connections
//! - Randomized client pacing
//! - Orderly shutdown on ctrl-c
//! - Configuration via CLI arguments or TOML file

mod client;
mod config;
mod echo;
mod environment;
mod metrics;
mod registry;
mod server;

use config::Config;
use environment::Environment;
use metrics::{MetricsSampler, ProcfsSource};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        listen = %config.server.listen,
        clients = config.clients.count,
        messages = config.clients.messages,
        max_connections = config.server.max_connections,
        metrics = config.metrics.enabled,
        "Starting co-location environment"
    );

    let mut environment = Environment::start(&config.server, &config.clients).await?;

    let sampler = config.metrics.enabled.then(|| {
        MetricsSampler::new(Arc::new(ProcfsSource::new()), config.metrics.interval).spawn()
    });

    tokio::signal::ctrl_c().await?;
    info!("Interrupt received, shutting down");

    environment.stop().await;
    if let Some(sampler) = sampler {
        sampler.abort();
    }

    let summary = environment.join_clients().await;
    let stats = environment.server().stats();
    info!(
        connections = stats.connections_accepted,
        messages = stats.messages_handled,
        active = stats.active_handlers,
        "Server totals"
    );
    info!(
        completed = summary.completed,
        failed = summary.failed,
        rounds = summary.rounds,
        matched = summary.matched,
        "All clients and server stopped"
    );

    Ok(())
}
