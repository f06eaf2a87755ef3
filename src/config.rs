//! TOML configuration for faultline.
//!
//! Every section falls back to compiled-in defaults, so a partial file (or
//! no file at all) yields a working pipeline.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::detect::SeverityThresholds;
use crate::forecast::ForecastSettings;
use crate::investigate::InvestigationSettings;
use crate::resolve::ExecutorSettings;
use crate::telemetry::WindowPolicy;

/// Environment variable naming the config file.
pub const CONFIG_ENV: &str = "FAULTLINE_CONFIG";

/// Config file read when the environment variable is unset.
pub const SYSTEM_CONFIG_PATH: &str = "/etc/faultline/faultline.toml";

// Bounded so chrono never sees an out-of-range span.
fn seconds(secs: u64) -> chrono::Duration {
    chrono::Duration::seconds(secs.min(i64::MAX as u64 / 1000) as i64)
}

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
    #[serde(default)]
    pub detection: DetectionConfig,
    #[serde(default)]
    pub incidents: IncidentConfig,
    #[serde(default)]
    pub investigation: InvestigationConfig,
    #[serde(default)]
    pub resolution: ResolutionConfig,
    #[serde(default)]
    pub forecast: ForecastConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl AppConfig {
    /// Load and validate configuration from a TOML file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        config
            .validate()
            .with_context(|| format!("invalid config file: {}", path.display()))?;
        info!(path = %path.display(), "loaded faultline configuration");
        Ok(config)
    }

    /// Try to load configuration from, in order:
    /// 1. The path in `FAULTLINE_CONFIG`.
    /// 2. `/etc/faultline/faultline.toml`.
    /// 3. Compiled-in defaults.
    pub fn load_or_default() -> Self {
        if let Ok(env_path) = std::env::var(CONFIG_ENV) {
            let path = Path::new(&env_path);
            match Self::load(path) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "FAULTLINE_CONFIG set but file could not be loaded, trying fallback"
                    );
                }
            }
        }

        let system_path = Path::new(SYSTEM_CONFIG_PATH);
        if system_path.exists() {
            match Self::load(system_path) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %system_path.display(),
                        error = %e,
                        "system config file exists but could not be loaded, using defaults"
                    );
                }
            }
        }

        debug!("no config file found, using compiled-in defaults");
        Self::default()
    }

    /// Reject values the pipeline cannot run with.
    pub fn validate(&self) -> Result<()> {
        self.telemetry
            .window
            .validate()
            .map_err(anyhow::Error::msg)
            .context("[telemetry.window]")?;
        self.detection
            .thresholds
            .validate()
            .map_err(anyhow::Error::msg)
            .context("[detection.thresholds]")?;
        if self.detection.min_samples < 2 {
            bail!("[detection] min_samples must be at least 2 for a sample deviation");
        }
        let threshold = self.investigation.acceptance_threshold;
        if !(0.0..1.0).contains(&threshold) {
            bail!("[investigation] acceptance_threshold must be in [0, 1), got {threshold}");
        }
        if self.investigation.tool_timeout_ms == 0 || self.resolution.step_timeout_ms == 0 {
            bail!("tool and step timeouts must be positive");
        }
        if self.forecast.min_history < 2 || self.forecast.lookback < self.forecast.min_history {
            bail!(
                "[forecast] needs 2 <= min_history ({}) <= lookback ({})",
                self.forecast.min_history,
                self.forecast.lookback
            );
        }
        if !(0.0..=1.0).contains(&self.forecast.min_confidence) {
            bail!("[forecast] min_confidence must be in [0, 1]");
        }
        crate::forecast::parse_schedule(&self.forecast.schedule).context("[forecast] schedule")?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Storage
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// SQLite database file. Parent directories are created on open.
    pub db_path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("data/faultline.db"),
        }
    }
}

// ---------------------------------------------------------------------------
// Telemetry and detection
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub window: WindowPolicy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionConfig {
    /// Windows with fewer samples are never used as a baseline.
    pub min_samples: u64,
    pub thresholds: SeverityThresholds,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            min_samples: 3,
            thresholds: SeverityThresholds::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// Incidents
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IncidentConfig {
    /// An anomaly this soon after a key's incident finished reopens it.
    pub reopen_cooldown_sec: u64,
    /// Recorded as the auditor of detector-driven changes.
    pub auditor_id: String,
}

impl Default for IncidentConfig {
    fn default() -> Self {
        Self {
            reopen_cooldown_sec: 3600,
            auditor_id: "faultline-detector".to_string(),
        }
    }
}

impl IncidentConfig {
    pub fn reopen_cooldown(&self) -> chrono::Duration {
        seconds(self.reopen_cooldown_sec)
    }
}

// ---------------------------------------------------------------------------
// Investigation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InvestigationConfig {
    pub agent_id: String,
    pub acceptance_threshold: f64,
    pub tool_timeout_ms: u64,
    /// Recent windows, anomalies and chat messages handed to each tool.
    pub context_aggregates: usize,
    pub context_anomalies: usize,
    pub context_messages: usize,
    /// Built-in tools to register, by name.
    pub tools: Vec<String>,
}

impl Default for InvestigationConfig {
    fn default() -> Self {
        let settings = InvestigationSettings::default();
        Self {
            agent_id: settings.agent_id,
            acceptance_threshold: settings.acceptance_threshold,
            tool_timeout_ms: 30_000,
            context_aggregates: settings.aggregate_limit,
            context_anomalies: settings.anomaly_limit,
            context_messages: settings.message_limit,
            tools: vec![crate::investigate::BaselineShiftTool::NAME.to_string()],
        }
    }
}

impl InvestigationConfig {
    pub fn settings(&self) -> InvestigationSettings {
        InvestigationSettings {
            agent_id: self.agent_id.clone(),
            acceptance_threshold: self.acceptance_threshold,
            tool_timeout: std::time::Duration::from_millis(self.tool_timeout_ms),
            aggregate_limit: self.context_aggregates,
            anomaly_limit: self.context_anomalies,
            message_limit: self.context_messages,
        }
    }
}

// ---------------------------------------------------------------------------
// Resolution
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolutionConfig {
    pub actor_id: String,
    pub step_timeout_ms: u64,
}

impl Default for ResolutionConfig {
    fn default() -> Self {
        Self {
            actor_id: ExecutorSettings::default().actor_id,
            step_timeout_ms: 60_000,
        }
    }
}

impl ResolutionConfig {
    pub fn settings(&self) -> ExecutorSettings {
        ExecutorSettings {
            actor_id: self.actor_id.clone(),
            step_timeout: std::time::Duration::from_millis(self.step_timeout_ms),
        }
    }
}

// ---------------------------------------------------------------------------
// Forecast
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ForecastConfig {
    /// Whether `watch` runs the scheduled scan.
    pub enabled: bool,
    /// Six-field cron expression, seconds first.
    pub schedule: String,
    pub lookback: usize,
    pub min_history: usize,
    pub horizon_sec: u64,
    pub min_confidence: f64,
}

impl Default for ForecastConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            schedule: "0 */15 * * * *".to_string(),
            lookback: 12,
            min_history: 4,
            horizon_sec: 3600,
            min_confidence: 0.6,
        }
    }
}

impl ForecastConfig {
    pub fn settings(&self) -> ForecastSettings {
        ForecastSettings {
            lookback: self.lookback,
            min_history: self.min_history,
            horizon: seconds(self.horizon_sec),
            min_confidence: self.min_confidence,
        }
    }
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter when `RUST_LOG` is unset.
    pub level: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
