use crate::error::{Result, TelemetryError};
use crate::types::CalibrationSample;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Physical mounting orientation of the phone relative to the direction of travel
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrientationMode {
    #[default]
    Default,
    LandscapeLeft,
    LandscapeRight,
    FlatScreenUp,
    FlatScreenDown,
    UpsideDown,
}

impl OrientationMode {
    pub const ALL: [OrientationMode; 6] = [
        OrientationMode::Default,
        OrientationMode::LandscapeLeft,
        OrientationMode::LandscapeRight,
        OrientationMode::FlatScreenUp,
        OrientationMode::FlatScreenDown,
        OrientationMode::UpsideDown,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            OrientationMode::Default => "default",
            OrientationMode::LandscapeLeft => "landscape_left",
            OrientationMode::LandscapeRight => "landscape_right",
            OrientationMode::FlatScreenUp => "flat_screen_up",
            OrientationMode::FlatScreenDown => "flat_screen_down",
            OrientationMode::UpsideDown => "upside_down",
        }
    }

    /// Classify by the dominant axis of the mean gravity reading.
    ///
    /// Priority is Z, then X, then Y; ties go to the earlier axis. The sign picks the
    /// mode whose remapping puts gravity on +up.
    pub fn from_mean(mean: &CalibrationSample) -> Self {
        let abs_x = mean.x.abs();
        let abs_y = mean.y.abs();
        let abs_z = mean.z.abs();

        if abs_z >= abs_x && abs_z >= abs_y {
            if mean.z > 0.0 {
                OrientationMode::FlatScreenUp
            } else {
                OrientationMode::FlatScreenDown
            }
        } else if abs_x >= abs_y {
            if mean.x > 0.0 {
                OrientationMode::LandscapeRight
            } else {
                OrientationMode::LandscapeLeft
            }
        } else if mean.y < 0.0 {
            OrientationMode::Default
        } else {
            OrientationMode::UpsideDown
        }
    }
}

impl fmt::Display for OrientationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OrientationMode {
    type Err = TelemetryError;

    fn from_str(s: &str) -> Result<Self> {
        OrientationMode::ALL
            .iter()
            .copied()
            .find(|mode| mode.as_str() == s)
            .ok_or_else(|| TelemetryError::InvalidInput(format!("unknown orientation mode: {s}")))
    }
}

/// Fewest samples a duration window accepts before it may complete
pub const DEFAULT_MIN_SAMPLES: usize = 10;

fn default_min_samples() -> usize {
    DEFAULT_MIN_SAMPLES
}

/// How long the at-rest burst lasts
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum CalibrationWindow {
    /// Complete after a fixed number of samples
    Samples { count: usize },
    /// Complete once the collected samples span at least `secs` and number at least
    /// `min_samples`
    Duration {
        secs: f64,
        #[serde(default = "default_min_samples")]
        min_samples: usize,
    },
}

impl Default for CalibrationWindow {
    fn default() -> Self {
        CalibrationWindow::Duration {
            secs: 2.0,
            min_samples: DEFAULT_MIN_SAMPLES,
        }
    }
}

impl CalibrationWindow {
    pub fn validate(&self) -> Result<()> {
        match *self {
            CalibrationWindow::Samples { count } if count == 0 => Err(
                TelemetryError::InvalidConfig("calibration sample count must be > 0".to_string()),
            ),
            CalibrationWindow::Duration { secs, .. } if !secs.is_finite() || secs <= 0.0 => {
                Err(TelemetryError::InvalidConfig(
                    "calibration duration must be a positive number of seconds".to_string(),
                ))
            }
            CalibrationWindow::Duration { min_samples: 0, .. } => Err(
                TelemetryError::InvalidConfig("calibration min_samples must be > 0".to_string()),
            ),
            _ => Ok(()),
        }
    }

    /// Samples needed before an orientation is trusted
    pub fn min_samples(&self) -> usize {
        match *self {
            CalibrationWindow::Samples { count } => count.min(DEFAULT_MIN_SAMPLES),
            CalibrationWindow::Duration { min_samples, .. } => min_samples,
        }
    }
}

/// Collects the at-rest burst and derives the mounting orientation from it
#[derive(Clone, Debug)]
pub struct CalibrationEngine {
    window: CalibrationWindow,
    samples: Vec<CalibrationSample>,
    first_timestamp: Option<f64>,
    last_timestamp: Option<f64>,
}

impl CalibrationEngine {
    pub fn new(window: CalibrationWindow) -> Self {
        Self {
            window,
            samples: Vec::new(),
            first_timestamp: None,
            last_timestamp: None,
        }
    }

    /// Append a sample to the window; returns true once the window is complete
    pub fn collect(&mut self, sample: CalibrationSample, timestamp: f64) -> bool {
        self.samples.push(sample);
        self.first_timestamp.get_or_insert(timestamp);
        self.last_timestamp = Some(timestamp);
        self.is_complete()
    }

    pub fn is_complete(&self) -> bool {
        match self.window {
            CalibrationWindow::Samples { count } => self.samples.len() >= count,
            CalibrationWindow::Duration { secs, min_samples } => {
                match (self.first_timestamp, self.last_timestamp) {
                    (Some(first), Some(last)) => {
                        last - first >= secs && self.samples.len() >= min_samples
                    }
                    _ => false,
                }
            }
        }
    }

    /// Arithmetic mean of the collected samples
    pub fn mean(&self) -> Option<CalibrationSample> {
        if self.samples.is_empty() {
            return None;
        }

        let n = self.samples.len() as f64;
        let (sx, sy, sz) = self
            .samples
            .iter()
            .fold((0.0, 0.0, 0.0), |(x, y, z), s| (x + s.x, y + s.y, z + s.z));

        Some(CalibrationSample {
            x: sx / n,
            y: sy / n,
            z: sz / n,
        })
    }

    /// Pure function of the current window; fails below the window's sample minimum
    pub fn calibrate(&self) -> Result<OrientationMode> {
        if self.samples.len() < self.window.min_samples() {
            return Err(TelemetryError::InsufficientCalibrationData);
        }
        self.mean()
            .map(|mean| OrientationMode::from_mean(&mean))
            .ok_or(TelemetryError::InsufficientCalibrationData)
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn window(&self) -> CalibrationWindow {
        self.window
    }

    pub fn reset(&mut self) {
        self.samples.clear();
        self.first_timestamp = None;
        self.last_timestamp = None;
    }
}

impl Default for CalibrationEngine {
    fn default() -> Self {
        Self::new(CalibrationWindow::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn burst(x: f64, y: f64, z: f64, n: usize) -> CalibrationEngine {
        let mut engine = CalibrationEngine::new(CalibrationWindow::Samples { count: n });
        for i in 0..n {
            engine.collect(CalibrationSample { x, y, z }, i as f64 * 0.02);
        }
        engine
    }

    #[test]
    fn test_portrait_burst_is_default() {
        assert_eq!(burst(0.0, -9.8, 0.0, 20).calibrate().unwrap(), OrientationMode::Default);
    }

    #[test]
    fn test_flat_bursts() {
        assert_eq!(
            burst(0.0, 0.0, 9.8, 20).calibrate().unwrap(),
            OrientationMode::FlatScreenUp
        );
        assert_eq!(
            burst(0.0, 0.0, -9.8, 20).calibrate().unwrap(),
            OrientationMode::FlatScreenDown
        );
    }

    #[test]
    fn test_landscape_and_upside_down() {
        assert_eq!(
            burst(9.8, 0.5, 0.3, 10).calibrate().unwrap(),
            OrientationMode::LandscapeRight
        );
        assert_eq!(
            burst(-9.8, 0.5, 0.3, 10).calibrate().unwrap(),
            OrientationMode::LandscapeLeft
        );
        assert_eq!(
            burst(0.2, 9.8, 0.3, 10).calibrate().unwrap(),
            OrientationMode::UpsideDown
        );
    }

    #[test]
    fn test_ties_follow_axis_priority() {
        // Z beats X and Y on a tie, X beats Y
        assert_eq!(
            OrientationMode::from_mean(&CalibrationSample { x: 5.0, y: 5.0, z: 5.0 }),
            OrientationMode::FlatScreenUp
        );
        assert_eq!(
            OrientationMode::from_mean(&CalibrationSample { x: -5.0, y: 5.0, z: 1.0 }),
            OrientationMode::LandscapeLeft
        );
    }

    #[test]
    fn test_empty_window_fails() {
        let engine = CalibrationEngine::default();
        assert_eq!(
            engine.calibrate(),
            Err(TelemetryError::InsufficientCalibrationData)
        );
    }

    #[test]
    fn test_calibrate_is_idempotent() {
        let engine = burst(0.3, -9.6, 1.2, 15);
        let first = engine.calibrate().unwrap();
        let second = engine.calibrate().unwrap();
        assert_eq!(first, second);
        assert_eq!(engine.len(), 15);
    }

    #[test]
    fn test_noisy_mean() {
        let mut engine = CalibrationEngine::new(CalibrationWindow::Samples { count: 4 });
        engine.collect(CalibrationSample { x: 1.0, y: -9.0, z: 2.0 }, 0.0);
        engine.collect(CalibrationSample { x: -1.0, y: -10.0, z: -2.0 }, 0.1);
        engine.collect(CalibrationSample { x: 0.5, y: -9.5, z: 0.0 }, 0.2);
        assert!(!engine.is_complete());
        assert!(engine.collect(CalibrationSample { x: -0.5, y: -9.5, z: 0.0 }, 0.3));

        let mean = engine.mean().unwrap();
        assert!((mean.y + 9.5).abs() < 1e-9);
        assert_eq!(engine.calibrate().unwrap(), OrientationMode::Default);
    }

    #[test]
    fn test_duration_window() {
        let mut engine = CalibrationEngine::new(CalibrationWindow::Duration {
            secs: 1.0,
            min_samples: 3,
        });
        let sample = CalibrationSample { x: 0.0, y: -9.8, z: 0.0 };

        assert!(!engine.collect(sample, 10.0));
        assert!(!engine.collect(sample, 10.5));
        assert!(engine.collect(sample, 11.0));

        engine.reset();
        assert!(engine.is_empty());
        assert!(!engine.is_complete());
    }

    #[test]
    fn test_window_validation() {
        assert!(CalibrationWindow::Samples { count: 0 }.validate().is_err());
        assert!(CalibrationWindow::Duration {
            secs: 0.0,
            min_samples: 10
        }
        .validate()
        .is_err());
        assert!(CalibrationWindow::Duration {
            secs: 1.0,
            min_samples: 0
        }
        .validate()
        .is_err());
        assert!(CalibrationWindow::default().validate().is_ok());
    }

    #[test]
    fn test_sparse_duration_window_is_insufficient() {
        let mut engine = CalibrationEngine::new(CalibrationWindow::default());
        let sample = CalibrationSample { x: 0.0, y: 0.0, z: 9.8 };

        // Two samples spanning the whole duration do not complete the window
        assert!(!engine.collect(sample, 0.0));
        assert!(!engine.collect(sample, 2.5));
        assert_eq!(
            engine.calibrate(),
            Err(TelemetryError::InsufficientCalibrationData)
        );

        for i in 0..8 {
            engine.collect(sample, 2.6 + i as f64 * 0.1);
        }
        assert!(engine.is_complete());
        assert_eq!(engine.calibrate().unwrap(), OrientationMode::FlatScreenUp);
    }

    #[test]
    fn test_serde_window_defaults_min_samples() {
        let window: CalibrationWindow =
            serde_json::from_str(r#"{"policy":"duration","secs":1.5}"#).unwrap();
        assert_eq!(window.min_samples(), DEFAULT_MIN_SAMPLES);
        assert_eq!(CalibrationWindow::Samples { count: 3 }.min_samples(), 3);
    }

    #[test]
    fn test_mode_from_str() {
        for mode in OrientationMode::ALL {
            assert_eq!(mode.as_str().parse::<OrientationMode>().unwrap(), mode);
        }
        assert!("sideways".parse::<OrientationMode>().is_err());
    }
}
