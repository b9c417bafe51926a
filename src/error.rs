use thiserror::Error;

/// Drive telemetry error types
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TelemetryError {
    #[error("Insufficient calibration data: no samples collected")]
    InsufficientCalibrationData,

    #[error("Invalid sample ordering: timestamp {current} does not advance past {previous}")]
    InvalidSampleOrdering { previous: f64, current: f64 },

    #[error("Sink delivery failed: {0}")]
    SinkDeliveryFailure(String),

    #[error("Session already active: {0}")]
    SessionAlreadyActive(String),

    #[error("No active session")]
    NoActiveSession,

    #[error("Session open failed: {0}")]
    SessionOpenFailure(String),

    #[error("Session close failed: {0}")]
    SessionCloseFailure(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Engine stopped")]
    EngineStopped,
}

impl TelemetryError {
    /// Caller errors are rejected synchronously and never mutate session state.
    pub fn is_caller_error(&self) -> bool {
        matches!(
            self,
            TelemetryError::SessionAlreadyActive(_) | TelemetryError::NoActiveSession
        )
    }
}

/// Result type for telemetry operations
pub type Result<T> = std::result::Result<T, TelemetryError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let errors = vec![
            TelemetryError::InsufficientCalibrationData,
            TelemetryError::InvalidSampleOrdering {
                previous: 2.0,
                current: 1.0,
            },
            TelemetryError::SinkDeliveryFailure("timeout".to_string()),
            TelemetryError::SessionAlreadyActive("session_1".to_string()),
            TelemetryError::NoActiveSession,
            TelemetryError::SessionOpenFailure("503".to_string()),
            TelemetryError::SessionCloseFailure("503".to_string()),
            TelemetryError::InvalidConfig("bad".to_string()),
            TelemetryError::InvalidInput("bad".to_string()),
            TelemetryError::EngineStopped,
        ];

        for err in errors {
            assert!(!err.to_string().is_empty());
        }
    }

    #[test]
    fn test_caller_errors() {
        assert!(TelemetryError::NoActiveSession.is_caller_error());
        assert!(TelemetryError::SessionAlreadyActive("s".into()).is_caller_error());
        assert!(!TelemetryError::SinkDeliveryFailure("x".into()).is_caller_error());
    }
}
