use crate::calibration::{CalibrationWindow, OrientationMode};
use crate::classifier::ClassifierConfig;
use crate::error::{Result, TelemetryError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Engine configuration, loaded from JSON. Missing fields take their defaults.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub classifier: ClassifierConfig,
    pub calibration: CalibrationWindow,
    /// Skip calibration and use this mounting orientation
    pub orientation_override: Option<OrientationMode>,
    pub flush_interval_secs: f64,
    /// Upper bound on waiting for in-flight deliveries when a session ends
    pub end_flush_timeout_secs: f64,
    /// Consecutive delivery failures between error-level alerts
    pub failure_alert_threshold: u32,
    /// Base URL of the logging server; local sinks are used when unset
    pub endpoint: Option<String>,
    pub request_timeout_secs: f64,
    /// Posted limit applied everywhere; speed violations are not evaluated when unset
    pub speed_limit_kmh: Option<f64>,
    pub status_path: Option<PathBuf>,
    pub sensor_channel_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            classifier: ClassifierConfig::default(),
            calibration: CalibrationWindow::default(),
            orientation_override: None,
            flush_interval_secs: 10.0,
            end_flush_timeout_secs: 5.0,
            failure_alert_threshold: 3,
            endpoint: None,
            request_timeout_secs: 10.0,
            speed_limit_kmh: None,
            status_path: None,
            sensor_channel_capacity: 512,
        }
    }
}

fn positive(name: &str, value: f64) -> Result<()> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(TelemetryError::InvalidConfig(format!(
            "{name} must be a positive number, got {value}"
        )))
    }
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            TelemetryError::InvalidConfig(format!("cannot read {}: {e}", path.display()))
        })?;
        let config: Config = serde_json::from_str(&text).map_err(|e| {
            TelemetryError::InvalidConfig(format!("cannot parse {}: {e}", path.display()))
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.classifier.validate()?;
        self.calibration.validate()?;
        positive("flush_interval_secs", self.flush_interval_secs)?;
        positive("end_flush_timeout_secs", self.end_flush_timeout_secs)?;
        positive("request_timeout_secs", self.request_timeout_secs)?;
        if let Some(limit) = self.speed_limit_kmh {
            positive("speed_limit_kmh", limit)?;
        }
        if self.failure_alert_threshold == 0 {
            return Err(TelemetryError::InvalidConfig(
                "failure_alert_threshold must be at least 1".to_string(),
            ));
        }
        if self.sensor_channel_capacity == 0 {
            return Err(TelemetryError::InvalidConfig(
                "sensor_channel_capacity must be at least 1".to_string(),
            ));
        }
        if let Some(endpoint) = &self.endpoint {
            if !(endpoint.starts_with("http://") || endpoint.starts_with("https://")) {
                return Err(TelemetryError::InvalidConfig(format!(
                    "endpoint must be an http(s) URL: {endpoint}"
                )));
            }
        }
        Ok(())
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs_f64(self.flush_interval_secs)
    }

    pub fn end_flush_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.end_flush_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.request_timeout_secs)
    }
}
