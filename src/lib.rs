//! Driving telemetry: mounting calibration, vehicle-frame remapping, driving event
//! classification and at-least-once delivery of per-session telemetry.

pub mod buffer;
pub mod calibration;
pub mod classifier;
pub mod config;
pub mod engine;
pub mod error;
pub mod geo;
pub mod http;
pub mod live_status;
pub mod remap;
pub mod sensors;
pub mod session;
pub mod sink;
pub mod types;

pub use calibration::{CalibrationEngine, OrientationMode};
pub use classifier::{DrivingEvent, EventClassifier, EventCounters};
pub use config::Config;
pub use engine::{Engine, EngineHandle, SensorEvent};
pub use error::{Result, TelemetryError};
pub use remap::AxisRemapper;
pub use session::{SessionController, SessionSummary};
