use super::{ForecastEngine, ForecastError};
use crate::storage::{ForecastStore, IncidentStore, TelemetryStore};
use chrono::Utc;
use cron::Schedule;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// Parse a six-field cron expression (seconds first).
pub fn parse_schedule(expr: &str) -> Result<Schedule, ForecastError> {
    Schedule::from_str(expr).map_err(|e| ForecastError::Schedule {
        expr: expr.to_string(),
        reason: e.to_string(),
    })
}

/// Run a forecast scan at every tick of `schedule`. Never returns; callers
/// select against their own shutdown signal.
pub async fn run_forecast_loop<S>(engine: Arc<ForecastEngine<S>>, schedule: Schedule)
where
    S: TelemetryStore + IncidentStore + ForecastStore + 'static,
{
    info!("Forecast scheduler started");

    loop {
        let Some(next) = schedule.upcoming(Utc).next() else {
            warn!("Forecast schedule has no upcoming runs, stopping");
            return;
        };
        let wait = (next - Utc::now()).to_std().unwrap_or(Duration::ZERO);
        tokio::time::sleep(wait).await;

        info!(due = %next, "Forecast scan due");
        if let Err(e) = engine.run_scan().await {
            error!("Forecast scan failed: {}", e);
        }
    }
}
