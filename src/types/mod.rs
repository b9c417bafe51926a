use serde::{Deserialize, Serialize};

/// Standard gravity used for g-unit normalization (m/s²)
pub const GRAVITY: f64 = 9.8;

const KMH_PER_MS: f64 = 3.6;

/// Raw accelerometer reading, gravity included (m/s²), timestamp in seconds
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct RawMotion {
    pub timestamp: f64,
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl RawMotion {
    pub fn new(timestamp: f64, x: f64, y: f64, z: f64) -> Self {
        Self { timestamp, x, y, z }
    }
}

/// One at-rest reading collected during the calibration window
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct CalibrationSample {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl From<&RawMotion> for CalibrationSample {
    fn from(raw: &RawMotion) -> Self {
        Self {
            x: raw.x,
            y: raw.y,
            z: raw.z,
        }
    }
}

/// Vehicle-relative acceleration in g units
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MotionSample {
    pub timestamp: f64,
    pub forward_g: f64,
    pub side_g: f64,
    pub up_g: f64,
}

/// Position fix as reported by the positioning source
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct PositionFix {
    pub timestamp: f64,
    pub latitude: f64,
    pub longitude: f64,
    /// Instantaneous speed in m/s, absent when the source cannot report it
    #[serde(default)]
    pub speed: Option<f64>,
    /// Horizontal accuracy in meters
    #[serde(default)]
    pub accuracy: Option<f64>,
}

impl PositionFix {
    pub fn new(timestamp: f64, latitude: f64, longitude: f64, speed: Option<f64>) -> Self {
        Self {
            timestamp,
            latitude,
            longitude,
            speed,
            accuracy: None,
        }
    }

    /// Convert to a classifier sample; unknown or bogus speeds count as standing still
    pub fn to_sample(&self) -> PositionSample {
        let speed_kmh = match self.speed {
            Some(s) if s.is_finite() && s > 0.0 => s * KMH_PER_MS,
            _ => 0.0,
        };

        PositionSample {
            timestamp: self.timestamp,
            latitude: self.latitude,
            longitude: self.longitude,
            speed_kmh,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct PositionSample {
    pub timestamp: f64,
    pub latitude: f64,
    pub longitude: f64,
    pub speed_kmh: f64,
}

impl PositionSample {
    /// Fixes reported at exactly (0, 0) come from receivers without a lock
    pub fn is_null_island(&self) -> bool {
        self.latitude == 0.0 && self.longitude == 0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_speed_conversion() {
        let fix = PositionFix::new(1.0, 35.0, 139.0, Some(10.0));
        assert!((fix.to_sample().speed_kmh - 36.0).abs() < 1e-9);
    }

    #[test]
    fn test_unknown_speed_is_zero() {
        let unknown = PositionFix::new(1.0, 35.0, 139.0, None);
        assert_eq!(unknown.to_sample().speed_kmh, 0.0);

        // Some receivers report -1 when speed is unavailable
        let negative = PositionFix::new(1.0, 35.0, 139.0, Some(-1.0));
        assert_eq!(negative.to_sample().speed_kmh, 0.0);

        let nan = PositionFix::new(1.0, 35.0, 139.0, Some(f64::NAN));
        assert_eq!(nan.to_sample().speed_kmh, 0.0);
    }

    #[test]
    fn test_null_island() {
        assert!(PositionFix::new(0.0, 0.0, 0.0, None).to_sample().is_null_island());
        assert!(!PositionFix::new(0.0, 0.0, 139.0, None).to_sample().is_null_island());
    }

    #[test]
    fn test_fix_deserializes_without_optional_fields() {
        let fix: PositionFix =
            serde_json::from_str(r#"{"timestamp":1.5,"latitude":35.0,"longitude":139.0}"#)
                .unwrap();
        assert_eq!(fix.speed, None);
        assert_eq!(fix.accuracy, None);
    }
}
