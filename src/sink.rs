//! Collaborator seams: where telemetry goes, who issues session ids, and where speed
//! limits come from.

use crate::buffer::{RecordBatch, TelemetryBatch};
use crate::classifier::EventCounters;
use crate::error::{Result, TelemetryError};
use chrono::Utc;
use futures::future::BoxFuture;
use log::debug;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

/// Accepts a batch as a whole or rejects it as a whole
pub trait TelemetrySink: Send + Sync {
    fn deliver<'a>(&'a self, batch: &'a TelemetryBatch) -> BoxFuture<'a, Result<()>>;
}

/// Final figures reported when a session closes
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CloseRequest {
    pub session_id: String,
    pub distance_km: f64,
    pub counters: EventCounters,
    pub stability_score: u32,
    pub duration_secs: f64,
}

/// Issues session ids and records final session figures
pub trait SessionRegistry: Send + Sync {
    fn open(&self) -> BoxFuture<'_, Result<String>>;
    fn close<'a>(&'a self, request: &'a CloseRequest) -> BoxFuture<'a, Result<()>>;
}

pub trait SpeedLimitLookup: Send + Sync {
    /// Posted limit at a location in km/h, `None` when unknown
    fn limit_kmh(&self, latitude: f64, longitude: f64) -> Option<f64>;
}

/// Same limit everywhere
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FixedSpeedLimit(pub f64);

impl SpeedLimitLookup for FixedSpeedLimit {
    fn limit_kmh(&self, _latitude: f64, _longitude: f64) -> Option<f64> {
        Some(self.0)
    }
}

/// In-process sink, used for dry runs and tests
#[derive(Debug, Default)]
pub struct MemorySink {
    batches: Mutex<Vec<TelemetryBatch>>,
    failing: AtomicBool,
    attempts: AtomicU64,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// While set, every delivery is rejected
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn attempts(&self) -> u64 {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn batches(&self) -> Vec<TelemetryBatch> {
        self.batches
            .lock()
            .map(|guard| guard.clone())
            .unwrap_or_default()
    }

    pub fn motion_records(&self) -> usize {
        self.count(|batch| matches!(batch, RecordBatch::Motion(_)))
    }

    pub fn position_records(&self) -> usize {
        self.count(|batch| matches!(batch, RecordBatch::Position(_)))
    }

    fn count(&self, pred: impl Fn(&RecordBatch) -> bool) -> usize {
        self.batches()
            .iter()
            .filter(|b| pred(&b.records))
            .map(|b| b.records.len())
            .sum()
    }
}

impl TelemetrySink for MemorySink {
    fn deliver<'a>(&'a self, batch: &'a TelemetryBatch) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            if self.failing.load(Ordering::SeqCst) {
                return Err(TelemetryError::SinkDeliveryFailure(
                    "memory sink is failing".to_string(),
                ));
            }

            let mut guard = self
                .batches
                .lock()
                .map_err(|_| TelemetryError::SinkDeliveryFailure("sink lock poisoned".into()))?;
            debug!(
                "memory sink stored {} records for {}",
                batch.records.len(),
                batch.ticket.session_id
            );
            guard.push(batch.clone());
            Ok(())
        })
    }
}

/// Registry that mints ids locally (`session_<millis>`)
#[derive(Debug, Default)]
pub struct LocalRegistry {
    closed: Mutex<Vec<CloseRequest>>,
    opened: AtomicU64,
    fail_open: AtomicBool,
    fail_close: AtomicBool,
}

impl LocalRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail_open(&self, fail: bool) {
        self.fail_open.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_close(&self, fail: bool) {
        self.fail_close.store(fail, Ordering::SeqCst);
    }

    pub fn opened(&self) -> u64 {
        self.opened.load(Ordering::SeqCst)
    }

    /// Close requests received, including rejected ones
    pub fn closed(&self) -> Vec<CloseRequest> {
        self.closed
            .lock()
            .map(|guard| guard.clone())
            .unwrap_or_default()
    }
}

impl SessionRegistry for LocalRegistry {
    fn open(&self) -> BoxFuture<'_, Result<String>> {
        Box::pin(async move {
            if self.fail_open.load(Ordering::SeqCst) {
                return Err(TelemetryError::SessionOpenFailure(
                    "registry unavailable".to_string(),
                ));
            }
            // Sequence suffix keeps ids unique within the same millisecond
            let seq = self.opened.fetch_add(1, Ordering::SeqCst);
            Ok(format!("session_{}_{}", Utc::now().timestamp_millis(), seq))
        })
    }

    fn close<'a>(&'a self, request: &'a CloseRequest) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            if let Ok(mut guard) = self.closed.lock() {
                guard.push(request.clone());
            }
            if self.fail_close.load(Ordering::SeqCst) {
                return Err(TelemetryError::SessionCloseFailure(
                    "registry unavailable".to_string(),
                ));
            }
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_local_registry_ids_are_unique() {
        let registry = LocalRegistry::new();
        let a = registry.open().await.unwrap();
        let b = registry.open().await.unwrap();
        assert!(a.starts_with("session_"));
        assert_ne!(a, b);
        assert_eq!(registry.opened(), 2);
    }

    #[tokio::test]
    async fn test_local_registry_failures() {
        let registry = LocalRegistry::new();
        registry.set_fail_open(true);
        assert!(matches!(
            registry.open().await,
            Err(TelemetryError::SessionOpenFailure(_))
        ));

        registry.set_fail_close(true);
        let request = CloseRequest {
            session_id: "s".into(),
            distance_km: 1.0,
            counters: EventCounters::default(),
            stability_score: 100,
            duration_secs: 60.0,
        };
        assert!(registry.close(&request).await.is_err());
        assert_eq!(registry.closed().len(), 1);
    }

    #[test]
    fn test_fixed_speed_limit() {
        assert_eq!(FixedSpeedLimit(50.0).limit_kmh(35.0, 139.0), Some(50.0));
    }
}
