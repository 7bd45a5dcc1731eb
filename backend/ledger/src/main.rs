//! Trust & reward ledger — entry point.
//!
//! Serves the coin ledger, PCI scoring, and settlement webhook over an Axum
//! REST API, and runs the daily PCI recovery scheduler in the background.

mod api;
mod clock;
mod config;
mod db;
mod errors;
#[cfg(test)]
mod invariants;
mod ledger;
mod models;
mod pci;
mod recovery;
mod referral;
mod webhook;

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use clock::{Clock, SystemClock};
use config::Config;
use recovery::{IntervalTrigger, SchedulerState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialise structured logging (RUST_LOG controls verbosity).
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // Load optional .env file (ignored if missing).
    let _ = dotenvy::dotenv();

    let config = Config::from_env().map_err(|e| anyhow::anyhow!("{e}"))?;

    // Set up the SQLite connection pool and run migrations.
    let pool = db::init_pool(&config.database_url).await?;
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let shutdown = CancellationToken::new();

    // ─── Recovery scheduler ───────────────────────────────
    let scheduler_state = Arc::new(SchedulerState {
        pool: pool.clone(),
        config: config.clone(),
        clock: clock.clone(),
    });
    let trigger = IntervalTrigger::every(Duration::from_secs(config.recovery_interval_secs));
    let scheduler = tokio::spawn(recovery::run(scheduler_state, trigger, shutdown.clone()));

    // ─── REST API ─────────────────────────────────────────
    let api_state = Arc::new(api::ApiState {
        pool,
        config: config.clone(),
        clock,
    });
    let app = api::router(api_state);

    let addr = format!("0.0.0.0:{}", config.api_port);
    info!("API listening on http://{addr}");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let api_shutdown = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown signal received");
            api_shutdown.cancel();
        })
        .await?;

    shutdown.cancel();
    scheduler.await?;
    Ok(())
}
