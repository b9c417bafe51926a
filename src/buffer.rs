use crate::classifier::DrivingEvent;
use crate::error::Result;
use crate::sink::TelemetrySink;
use crate::types::{MotionSample, PositionSample};
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Vehicle-frame acceleration record
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct MotionRecord {
    pub timestamp: f64,
    pub forward_g: f64,
    pub side_g: f64,
    pub up_g: f64,
}

impl From<MotionSample> for MotionRecord {
    fn from(sample: MotionSample) -> Self {
        Self {
            timestamp: sample.timestamp,
            forward_g: sample.forward_g,
            side_g: sample.side_g,
            up_g: sample.up_g,
        }
    }
}

/// Position record tagged with the event classified at this fix
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct PositionRecord {
    pub timestamp: f64,
    pub latitude: f64,
    pub longitude: f64,
    pub speed_kmh: f64,
    /// Latest motion components at the time of the fix
    pub forward_g: f64,
    pub side_g: f64,
    pub up_g: f64,
    pub event: DrivingEvent,
}

impl PositionRecord {
    pub fn new(position: &PositionSample, motion: Option<&MotionSample>, event: DrivingEvent) -> Self {
        let motion = motion.copied().unwrap_or_default();
        Self {
            timestamp: position.timestamp,
            latitude: position.latitude,
            longitude: position.longitude,
            speed_kmh: position.speed_kmh,
            forward_g: motion.forward_g,
            side_g: motion.side_g,
            up_g: motion.up_g,
            event,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TelemetryRecord {
    Motion(MotionRecord),
    Position(PositionRecord),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    Motion,
    Position,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Lease {
    flush_id: u64,
    len: usize,
}

/// FIFO queue whose head can be leased to an in-flight delivery.
///
/// Leased records stay at the head until the delivery settles, so a failure leaves them
/// ahead of anything appended in the meantime.
#[derive(Clone, Debug)]
pub struct RecordQueue<T> {
    records: VecDeque<T>,
    lease: Option<Lease>,
}

impl<T> Default for RecordQueue<T> {
    fn default() -> Self {
        Self {
            records: VecDeque::new(),
            lease: None,
        }
    }
}

impl<T: Clone> RecordQueue<T> {
    pub fn push(&mut self, record: T) {
        self.records.push_back(record);
    }

    /// Snapshot the current contents under `flush_id`; `None` when empty or already leased
    pub fn lease(&mut self, flush_id: u64) -> Option<Vec<T>> {
        if self.lease.is_some() || self.records.is_empty() {
            return None;
        }
        let len = self.records.len();
        self.lease = Some(Lease { flush_id, len });
        Some(self.records.iter().cloned().collect())
    }

    /// Close the lease. Returns the leased length, or `None` for a stale ticket.
    pub fn settle(&mut self, flush_id: u64, delivered: bool) -> Option<usize> {
        match self.lease {
            Some(lease) if lease.flush_id == flush_id => {
                self.lease = None;
                if delivered {
                    self.records.drain(..lease.len);
                }
                Some(lease.len)
            }
            _ => None,
        }
    }

    pub fn release(&mut self) {
        self.lease = None;
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn is_leased(&self) -> bool {
        self.lease.is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.records.iter()
    }
}

/// Identifies one leased batch so its outcome can be settled later
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FlushTicket {
    pub session_id: String,
    /// Local identity of the issuing buffer; server ids may repeat
    pub generation: u64,
    pub kind: RecordKind,
    pub flush_id: u64,
    pub len: usize,
}

#[derive(Clone, Debug, PartialEq)]
pub enum RecordBatch {
    Motion(Vec<MotionRecord>),
    Position(Vec<PositionRecord>),
}

impl RecordBatch {
    pub fn len(&self) -> usize {
        match self {
            RecordBatch::Motion(records) => records.len(),
            RecordBatch::Position(records) => records.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One all-or-nothing delivery unit
#[derive(Clone, Debug, PartialEq)]
pub struct TelemetryBatch {
    pub ticket: FlushTicket,
    pub records: RecordBatch,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DeliveryStats {
    pub delivered_batches: u64,
    pub delivered_records: u64,
    pub failed_attempts: u64,
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
    /// Largest combined queue depth seen
    pub high_water_mark: usize,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct FlushReport {
    pub delivered: usize,
    pub failed: usize,
    pub remaining: usize,
}

impl FlushReport {
    pub fn is_clean(&self) -> bool {
        self.failed == 0 && self.remaining == 0
    }
}

/// Per-session outbound queues with at-least-once delivery
#[derive(Clone, Debug)]
pub struct TelemetryBuffer {
    session_id: String,
    generation: u64,
    motion: RecordQueue<MotionRecord>,
    position: RecordQueue<PositionRecord>,
    next_flush_id: u64,
    stats: DeliveryStats,
    alert_threshold: u32,
}

impl TelemetryBuffer {
    pub fn new(session_id: impl Into<String>, generation: u64, alert_threshold: u32) -> Self {
        Self {
            session_id: session_id.into(),
            generation,
            motion: RecordQueue::default(),
            position: RecordQueue::default(),
            next_flush_id: 1,
            stats: DeliveryStats::default(),
            alert_threshold: alert_threshold.max(1),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn append(&mut self, record: TelemetryRecord) {
        match record {
            TelemetryRecord::Motion(r) => self.motion.push(r),
            TelemetryRecord::Position(r) => self.position.push(r),
        }
        let depth = self.len();
        if depth > self.stats.high_water_mark {
            self.stats.high_water_mark = depth;
        }
    }

    pub fn append_motion(&mut self, record: MotionRecord) {
        self.append(TelemetryRecord::Motion(record));
    }

    pub fn append_position(&mut self, record: PositionRecord) {
        self.append(TelemetryRecord::Position(record));
    }

    fn ticket(&mut self, kind: RecordKind, len: usize) -> FlushTicket {
        let flush_id = self.next_flush_id;
        self.next_flush_id += 1;
        FlushTicket {
            session_id: self.session_id.clone(),
            generation: self.generation,
            kind,
            flush_id,
            len,
        }
    }

    /// Lease every idle, non-empty queue and return one batch per queue
    pub fn begin_flush(&mut self) -> Vec<TelemetryBatch> {
        let mut batches = Vec::with_capacity(2);

        let motion_id = self.next_flush_id;
        if let Some(records) = self.motion.lease(motion_id) {
            let ticket = self.ticket(RecordKind::Motion, records.len());
            batches.push(TelemetryBatch {
                ticket,
                records: RecordBatch::Motion(records),
            });
        }

        let position_id = self.next_flush_id;
        if let Some(records) = self.position.lease(position_id) {
            let ticket = self.ticket(RecordKind::Position, records.len());
            batches.push(TelemetryBatch {
                ticket,
                records: RecordBatch::Position(records),
            });
        }

        for batch in &batches {
            debug!(
                "[{}] leased {} {:?} records (flush #{})",
                self.session_id, batch.ticket.len, batch.ticket.kind, batch.ticket.flush_id
            );
        }
        batches
    }

    /// Apply a delivery outcome. Returns false for tickets that no longer match a lease.
    pub fn settle(&mut self, ticket: &FlushTicket, result: &Result<()>) -> bool {
        if ticket.generation != self.generation {
            return false;
        }

        let delivered = result.is_ok();
        let settled = match ticket.kind {
            RecordKind::Motion => self.motion.settle(ticket.flush_id, delivered),
            RecordKind::Position => self.position.settle(ticket.flush_id, delivered),
        };
        let Some(len) = settled else {
            debug!(
                "[{}] ignoring stale completion for flush #{}",
                self.session_id, ticket.flush_id
            );
            return false;
        };

        match result {
            Ok(()) => {
                self.stats.delivered_batches += 1;
                self.stats.delivered_records += len as u64;
                self.stats.consecutive_failures = 0;
                debug!(
                    "[{}] delivered {} {:?} records",
                    self.session_id, len, ticket.kind
                );
            }
            Err(e) => {
                self.stats.failed_attempts += 1;
                self.stats.consecutive_failures += 1;
                self.stats.last_error = Some(e.to_string());
                warn!(
                    "[{}] delivery of {} {:?} records failed: {}",
                    self.session_id, len, ticket.kind, e
                );
                if self.stats.consecutive_failures % self.alert_threshold == 0 {
                    error!(
                        "[{}] {} consecutive delivery failures, {} records queued",
                        self.session_id,
                        self.stats.consecutive_failures,
                        self.len()
                    );
                }
            }
        }
        true
    }

    /// Deliver everything currently queued and wait for the outcome
    pub async fn flush_with(&mut self, sink: &dyn TelemetrySink) -> FlushReport {
        let mut report = FlushReport::default();

        for batch in self.begin_flush() {
            let result = sink.deliver(&batch).await;
            if result.is_ok() {
                report.delivered += batch.ticket.len;
            } else {
                report.failed += batch.ticket.len;
            }
            self.settle(&batch.ticket, &result);
        }

        report.remaining = self.len();
        if report.delivered > 0 || report.failed > 0 {
            info!(
                "[{}] flush: {} delivered, {} failed, {} remaining",
                self.session_id, report.delivered, report.failed, report.remaining
            );
        }
        report
    }

    /// Forget outstanding leases so the next flush re-sends their records
    pub fn release_leases(&mut self) {
        if self.motion.is_leased() || self.position.is_leased() {
            warn!("[{}] releasing unsettled leases", self.session_id);
        }
        self.motion.release();
        self.position.release();
    }

    pub fn motion_len(&self) -> usize {
        self.motion.len()
    }

    pub fn position_len(&self) -> usize {
        self.position.len()
    }

    pub fn len(&self) -> usize {
        self.motion.len() + self.position.len()
    }

    pub fn is_empty(&self) -> bool {
        self.motion.is_empty() && self.position.is_empty()
    }

    /// No delivery currently in flight
    pub fn is_idle(&self) -> bool {
        !self.motion.is_leased() && !self.position.is_leased()
    }

    pub fn stats(&self) -> &DeliveryStats {
        &self.stats
    }

    pub fn motion_records(&self) -> impl Iterator<Item = &MotionRecord> {
        self.motion.iter()
    }

    pub fn position_records(&self) -> impl Iterator<Item = &PositionRecord> {
        self.position.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TelemetryError;
    use crate::sink::MemorySink;

    fn motion(t: f64) -> MotionRecord {
        MotionRecord {
            timestamp: t,
            forward_g: 0.0,
            side_g: 0.0,
            up_g: 1.0,
        }
    }

    fn timestamps(buffer: &TelemetryBuffer) -> Vec<f64> {
        buffer.motion_records().map(|r| r.timestamp).collect()
    }

    #[test]
    fn test_queue_lease_and_settle() {
        let mut queue = RecordQueue::default();
        queue.push(1);
        queue.push(2);

        assert_eq!(queue.lease(7), Some(vec![1, 2]));
        // A second lease waits for the first to settle
        assert_eq!(queue.lease(8), None);
        queue.push(3);

        assert_eq!(queue.settle(99, true), None);
        assert_eq!(queue.settle(7, true), Some(2));
        assert_eq!(queue.iter().copied().collect::<Vec<_>>(), vec![3]);
    }

    #[test]
    fn test_failed_flush_keeps_order_without_duplicates() {
        let mut buffer = TelemetryBuffer::new("s1", 1, 3);
        for t in 0..3 {
            buffer.append_motion(motion(t as f64));
        }

        let batches = buffer.begin_flush();
        assert_eq!(batches.len(), 1);

        // Records arriving while the delivery is in flight go behind the leased ones
        buffer.append_motion(motion(3.0));
        buffer.append_motion(motion(4.0));

        let failure = Err(TelemetryError::SinkDeliveryFailure("503".into()));
        assert!(buffer.settle(&batches[0].ticket, &failure));
        assert_eq!(timestamps(&buffer), vec![0.0, 1.0, 2.0, 3.0, 4.0]);

        let retry = buffer.begin_flush();
        match &retry[0].records {
            RecordBatch::Motion(records) => assert_eq!(records.len(), 5),
            other => panic!("unexpected batch {other:?}"),
        }
        assert!(buffer.settle(&retry[0].ticket, &Ok(())));
        assert!(buffer.is_empty());
        assert_eq!(buffer.stats().delivered_records, 5);
        assert_eq!(buffer.stats().failed_attempts, 1);
    }

    #[test]
    fn test_success_removes_only_leased_prefix() {
        let mut buffer = TelemetryBuffer::new("s1", 1, 3);
        buffer.append_motion(motion(0.0));
        let batches = buffer.begin_flush();
        buffer.append_motion(motion(1.0));

        buffer.settle(&batches[0].ticket, &Ok(()));
        assert_eq!(timestamps(&buffer), vec![1.0]);
    }

    #[test]
    fn test_stale_and_foreign_tickets_are_ignored() {
        let mut buffer = TelemetryBuffer::new("s1", 1, 3);
        buffer.append_motion(motion(0.0));
        let batches = buffer.begin_flush();

        // Same server id and flush number, issued by another buffer
        let mut other = TelemetryBuffer::new("s1", 2, 3);
        other.append_motion(motion(5.0));
        let foreign = other.begin_flush().remove(0).ticket;
        assert_eq!(foreign.session_id, batches[0].ticket.session_id);
        assert_eq!(foreign.flush_id, batches[0].ticket.flush_id);
        assert!(!buffer.settle(&foreign, &Ok(())));
        assert!(!buffer.is_idle());

        buffer.release_leases();
        assert!(!buffer.settle(&batches[0].ticket, &Ok(())));
        assert_eq!(buffer.len(), 1);
    }

    #[test]
    fn test_motion_and_position_batches_are_separate() {
        let mut buffer = TelemetryBuffer::new("s1", 1, 3);
        buffer.append_motion(motion(0.0));
        let position = PositionSample {
            timestamp: 0.0,
            latitude: 35.0,
            longitude: 139.0,
            speed_kmh: 20.0,
        };
        buffer.append_position(PositionRecord::new(&position, None, DrivingEvent::Normal));

        let batches = buffer.begin_flush();
        assert_eq!(batches.len(), 2);
        assert_ne!(batches[0].ticket.flush_id, batches[1].ticket.flush_id);

        // Position delivery failing does not hold back motion
        buffer.settle(&batches[0].ticket, &Ok(()));
        buffer.settle(
            &batches[1].ticket,
            &Err(TelemetryError::SinkDeliveryFailure("timeout".into())),
        );
        assert_eq!(buffer.motion_len(), 0);
        assert_eq!(buffer.position_len(), 1);
        assert!(buffer.is_idle());
    }

    #[test]
    fn test_high_water_mark_and_failure_streak() {
        let mut buffer = TelemetryBuffer::new("s1", 1, 2);
        for t in 0..4 {
            buffer.append_motion(motion(t as f64));
        }
        assert_eq!(buffer.stats().high_water_mark, 4);

        for _ in 0..3 {
            let batches = buffer.begin_flush();
            buffer.settle(
                &batches[0].ticket,
                &Err(TelemetryError::SinkDeliveryFailure("down".into())),
            );
        }
        assert_eq!(buffer.stats().consecutive_failures, 3);
        assert_eq!(buffer.len(), 4);
    }

    #[tokio::test]
    async fn test_flush_with_sink() {
        let sink = MemorySink::new();
        let mut buffer = TelemetryBuffer::new("s1", 1, 3);
        buffer.append_motion(motion(0.0));
        buffer.append_motion(motion(1.0));

        sink.set_failing(true);
        let report = buffer.flush_with(&sink).await;
        assert_eq!(report.failed, 2);
        assert_eq!(report.remaining, 2);
        assert!(!report.is_clean());

        sink.set_failing(false);
        let report = buffer.flush_with(&sink).await;
        assert_eq!(report.delivered, 2);
        assert!(report.is_clean());
        assert_eq!(sink.motion_records(), 2);
    }
}
