use crate::buffer::DeliveryStats;
use crate::calibration::OrientationMode;
use crate::classifier::EventCounters;
use crate::session::SessionPhase;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct LiveStatus {
    pub timestamp: f64,
    pub phase: SessionPhase,
    pub session_id: Option<String>,
    pub orientation_mode: Option<OrientationMode>,
    pub calibrated: bool,
    pub counters: EventCounters,
    pub distance_km: f64,
    pub latest_speed_kmh: f64,
    pub motion_samples: u64,
    pub position_fixes: u64,
    // Outbound queues
    pub queued_motion: usize,
    pub queued_position: usize,
    pub retired_sessions: usize,
    pub retired_records: usize,
    pub delivery: DeliveryStats,
    pub uptime_seconds: u64,
}

impl LiveStatus {
    pub fn new() -> Self {
        Self {
            timestamp: current_timestamp(),
            phase: SessionPhase::Idle,
            session_id: None,
            orientation_mode: None,
            calibrated: false,
            counters: EventCounters::default(),
            distance_km: 0.0,
            latest_speed_kmh: 0.0,
            motion_samples: 0,
            position_fixes: 0,
            queued_motion: 0,
            queued_position: 0,
            retired_sessions: 0,
            retired_records: 0,
            delivery: DeliveryStats::default(),
            uptime_seconds: 0,
        }
    }

    pub fn save(&self, path: impl AsRef<Path>) -> std::io::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        Ok(())
    }
}

impl Default for LiveStatus {
    fn default() -> Self {
        Self::new()
    }
}

pub fn current_timestamp() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}
