//! faultline -- telemetry-to-resolution incident pipeline for industrial
//! machine fleets.
//!
//! Sensor readings are aggregated per stream, scored against the previous
//! window, deduplicated into incidents, investigated by analysis tools and
//! resolved by executing a plan exactly once. Every incident change lands in
//! an append-only audit trail. A forecast engine raises incidents before a
//! trend crosses a threshold.

pub mod audit;
pub mod config;
pub mod detect;
pub mod forecast;
pub mod investigate;
pub mod keyed;
pub mod model;
pub mod pipeline;
pub mod resolve;
pub mod simulate;
pub mod storage;
pub mod telemetry;

use anyhow::Result;
use std::sync::Arc;

/// Run the scheduled forecast scan until Ctrl-C.
pub async fn watch(config: &config::AppConfig) -> Result<()> {
    tracing::info!(db = %config.storage.db_path.display(), "Initializing database");
    let pipeline = pipeline::Pipeline::open(config)?;

    if !config.forecast.enabled {
        tracing::warn!("forecasting disabled in config, nothing to watch");
        return Ok(());
    }
    let schedule = forecast::parse_schedule(&config.forecast.schedule)?;
    let forecaster = Arc::clone(pipeline.forecaster());

    tracing::info!(schedule = %config.forecast.schedule, "faultline watching");
    tokio::select! {
        _ = forecast::run_forecast_loop(forecaster, schedule) => {}
        res = tokio::signal::ctrl_c() => {
            res?;
            tracing::info!("shutdown requested");
        }
    }
    Ok(())
}
