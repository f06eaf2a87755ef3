use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictiveForecast {
    pub forecast_id: Uuid,
    pub machine_id: String,
    pub metric_name: String,
    pub forecast_time: DateTime<Utc>,
    pub predicted_value: f64,
    pub confidence: f64,
    pub created_at: DateTime<Utc>,
}
