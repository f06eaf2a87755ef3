//! Least-squares trend over closed windows.

use crate::model::SensorAggregate;
use chrono::{DateTime, Duration, Utc};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Projection {
    pub forecast_time: DateTime<Utc>,
    pub predicted_value: f64,
    /// Goodness of fit scaled down for short histories, in `[0, 1]`.
    pub confidence: f64,
    pub slope_per_sec: f64,
}

fn midpoint(agg: &SensorAggregate) -> DateTime<Utc> {
    agg.window_start + (agg.window_end - agg.window_start) / 2
}

fn seconds(d: Duration) -> f64 {
    d.num_microseconds().map_or(d.num_milliseconds() as f64 / 1e3, |us| us as f64 / 1e6)
}

/// Fit window means against window midpoints and extrapolate to
/// `latest.window_end + horizon`. `history` is oldest first.
///
/// Returns `None` for fewer than two windows or when every window shares one
/// midpoint.
pub fn project(history: &[SensorAggregate], horizon: Duration) -> Option<Projection> {
    let first = history.first()?;
    let latest = history.last()?;
    if history.len() < 2 {
        return None;
    }

    let origin = midpoint(first);
    let points: Vec<(f64, f64)> = history
        .iter()
        .map(|a| (seconds(midpoint(a) - origin), a.rolling_avg))
        .collect();
    let n = points.len() as f64;
    let mean_x = points.iter().map(|p| p.0).sum::<f64>() / n;
    let mean_y = points.iter().map(|p| p.1).sum::<f64>() / n;

    let sxx: f64 = points.iter().map(|(x, _)| (x - mean_x).powi(2)).sum();
    if sxx <= f64::EPSILON {
        return None;
    }
    let sxy: f64 = points.iter().map(|(x, y)| (x - mean_x) * (y - mean_y)).sum();
    let slope = sxy / sxx;
    let intercept = mean_y - slope * mean_x;

    let ss_tot: f64 = points.iter().map(|(_, y)| (y - mean_y).powi(2)).sum();
    let ss_res: f64 = points
        .iter()
        .map(|(x, y)| (y - (intercept + slope * x)).powi(2))
        .sum();
    // A flat history is explained perfectly by a flat line.
    let r2 = if ss_tot <= f64::EPSILON { 1.0 } else { 1.0 - ss_res / ss_tot };

    let forecast_time = latest.window_end + horizon;
    let target = seconds(forecast_time - origin);
    Some(Projection {
        forecast_time,
        predicted_value: intercept + slope * target,
        confidence: r2.clamp(0.0, 1.0) * (n - 1.0) / n,
        slope_per_sec: slope,
    })
}
