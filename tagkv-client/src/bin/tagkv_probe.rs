//! Connects a pool, pings every slot, and prints the health report as JSON.
//!
//! Usage: `tagkv-probe [config.json]`. Without a path the default config
//! (`127.0.0.1:6379`, 5 connections) is used. Log level follows `RUST_LOG`.

use anyhow::Context;
use tagkv_client::{CacheConfig, CacheDatabase};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = match std::env::args().nth(1) {
        Some(path) => {
            let raw = std::fs::read_to_string(&path)
                .with_context(|| format!("reading config file {path}"))?;
            CacheConfig::from_json_str(&raw).with_context(|| format!("parsing {path}"))?
        }
        None => CacheConfig::default(),
    };

    tracing::info!(
        address = %config.pool.endpoint.address,
        pool_size = config.pool.pool_size,
        strategy = ?config.pool.strategy,
        database = config.database,
        "probing endpoint"
    );

    let db = CacheDatabase::connect(&config)
        .await
        .context("opening connection pool")?;

    let samples = db.ping_slots().await.context("ping")?;
    for (slot, elapsed) in samples.iter().enumerate() {
        tracing::debug!(slot, elapsed_us = elapsed.as_micros() as u64, "slot ping");
    }
    let slowest = samples.iter().max().copied().unwrap_or_default();
    tracing::info!(pings = samples.len(), slowest_ms = slowest.as_millis() as u64, "ping ok");

    let report = db.health_report();
    tracing::info!(
        required = report.required_pool_size,
        active = report.active_connections,
        invalid = report.invalid_connections,
        "health report"
    );
    println!("{}", serde_json::to_string_pretty(&report)?);

    db.pool().dispose();
    Ok(())
}
