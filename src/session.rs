use crate::buffer::{FlushTicket, PositionRecord, TelemetryBatch, TelemetryBuffer};
use crate::calibration::{CalibrationEngine, OrientationMode};
use crate::classifier::{CooldownClocks, DrivingEvent, EventClassifier, EventCounters};
use crate::config::Config;
use crate::error::{Result, TelemetryError};
use crate::geo::DistanceAccumulator;
use crate::live_status::{current_timestamp, LiveStatus};
use crate::remap::AxisRemapper;
use crate::sink::{CloseRequest, FixedSpeedLimit, SessionRegistry, SpeedLimitLookup, TelemetrySink};
use crate::types::{CalibrationSample, MotionSample, PositionFix, RawMotion};
use chrono::{DateTime, Utc};
use log::{debug, info, trace, warn};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;

/// Session state machine states
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    /// No session open
    #[default]
    Idle,
    /// Accepting samples
    Recording,
    /// Final flush and close in progress
    Ending,
}

/// Per-session figures, reset on every start
#[derive(Debug, Clone, PartialEq)]
pub struct SessionState {
    pub id: String,
    pub start_time: DateTime<Utc>,
    pub orientation_mode: OrientationMode,
    pub calibrated: bool,
    pub counters: EventCounters,
    pub cooldown_clocks: CooldownClocks,
    pub accumulated_distance_km: f64,
    pub motion_samples: u64,
    pub position_fixes: u64,
    pub latest_speed_kmh: f64,
}

impl SessionState {
    fn new(id: String) -> Self {
        Self {
            id,
            start_time: Utc::now(),
            orientation_mode: OrientationMode::Default,
            calibrated: false,
            counters: EventCounters::default(),
            cooldown_clocks: CooldownClocks::default(),
            accumulated_distance_km: 0.0,
            motion_samples: 0,
            position_fixes: 0,
            latest_speed_kmh: 0.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub start_time: String,
    pub distance_km: f64,
    pub counters: EventCounters,
    pub stability_score: u32,
    pub duration_secs: f64,
    pub orientation_mode: OrientationMode,
    /// Records the final flush could not deliver; retried on later flushes
    pub undelivered_records: usize,
    /// Set when the registry rejected the close call
    pub close_error: Option<String>,
}

impl fmt::Display for SessionSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Session {}", self.session_id)?;
        writeln!(f, "  Duration:        {}", format_duration(self.duration_secs))?;
        writeln!(f, "  Distance:        {:.2} km", self.distance_km)?;
        writeln!(f, "  Orientation:     {}", self.orientation_mode)?;
        writeln!(f, "  Sudden accels:   {}", self.counters.accel)?;
        writeln!(f, "  Sudden brakes:   {}", self.counters.brake)?;
        writeln!(f, "  Sharp turns:     {}", self.counters.turn)?;
        writeln!(f, "  Speed violations: {}", self.counters.violation)?;
        write!(f, "  Stability score: {}", self.stability_score)?;
        if self.undelivered_records > 0 {
            write!(f, "\n  Undelivered:     {} records", self.undelivered_records)?;
        }
        if let Some(err) = &self.close_error {
            write!(f, "\n  Close failed:    {err}")?;
        }
        Ok(())
    }
}

/// 100 minus 20 points per motion event per km, floored at 0.
/// Speed violations do not count; a session without distance scores 100.
pub fn stability_score(counters: &EventCounters, distance_km: f64) -> u32 {
    if !(distance_km > 0.0) {
        return 100;
    }
    let penalty = 20.0 * counters.motion_events() as f64 / distance_km;
    (100.0 - penalty).max(0.0).round() as u32
}

/// `MM:SS`, or `HH:MM:SS` from one hour up
pub fn format_duration(secs: f64) -> String {
    let total = if secs.is_finite() && secs > 0.0 {
        secs.floor() as u64
    } else {
        0
    };
    let (hours, minutes, seconds) = (total / 3600, (total % 3600) / 60, total % 60);
    if hours > 0 {
        format!("{hours:02}:{minutes:02}:{seconds:02}")
    } else {
        format!("{minutes:02}:{seconds:02}")
    }
}

/// Outcome of a spawned delivery, sent back to the controller
#[derive(Debug, Clone)]
pub struct FlushCompletion {
    pub ticket: FlushTicket,
    pub result: Result<()>,
}

/// Owns the session lifecycle and every per-session component.
///
/// All mutation happens through `&mut self`; deliveries run on spawned tasks and report
/// back through a channel drained with [`SessionController::next_completion`].
pub struct SessionController {
    config: Config,
    sink: Arc<dyn TelemetrySink>,
    registry: Arc<dyn SessionRegistry>,
    speed_limits: Option<Arc<dyn SpeedLimitLookup>>,
    phase: SessionPhase,
    state: Option<SessionState>,
    calibration: CalibrationEngine,
    calibrating: bool,
    remapper: AxisRemapper,
    classifier: EventClassifier,
    distance: DistanceAccumulator,
    latest_motion: Option<MotionSample>,
    /// First event fired by motion samples since the last buffered fix
    pending_event: Option<DrivingEvent>,
    buffer: Option<TelemetryBuffer>,
    next_generation: u64,
    /// Buffers of closed sessions that still hold undelivered records
    retired: Vec<TelemetryBuffer>,
    in_flight: usize,
    completion_tx: mpsc::UnboundedSender<FlushCompletion>,
    completion_rx: mpsc::UnboundedReceiver<FlushCompletion>,
    last_summary: Option<SessionSummary>,
    created: Instant,
}

impl SessionController {
    pub fn new(
        config: Config,
        sink: Arc<dyn TelemetrySink>,
        registry: Arc<dyn SessionRegistry>,
    ) -> Self {
        let (completion_tx, completion_rx) = mpsc::unbounded_channel();
        let speed_limits = config
            .speed_limit_kmh
            .map(|limit| Arc::new(FixedSpeedLimit(limit)) as Arc<dyn SpeedLimitLookup>);

        Self {
            calibration: CalibrationEngine::new(config.calibration),
            classifier: EventClassifier::new(config.classifier.clone()),
            config,
            sink,
            registry,
            speed_limits,
            phase: SessionPhase::Idle,
            state: None,
            calibrating: false,
            remapper: AxisRemapper::default(),
            distance: DistanceAccumulator::new(),
            latest_motion: None,
            pending_event: None,
            buffer: None,
            next_generation: 1,
            retired: Vec::new(),
            in_flight: 0,
            completion_tx,
            completion_rx,
            last_summary: None,
            created: Instant::now(),
        }
    }

    /// Replace the speed-limit source
    pub fn with_speed_limits(mut self, lookup: Arc<dyn SpeedLimitLookup>) -> Self {
        self.speed_limits = Some(lookup);
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    pub fn state(&self) -> Option<&SessionState> {
        self.state.as_ref()
    }

    pub fn last_summary(&self) -> Option<&SessionSummary> {
        self.last_summary.as_ref()
    }

    pub fn is_calibrating(&self) -> bool {
        self.calibrating
    }

    /// Deliveries dispatched whose completion has not been applied yet
    pub fn in_flight(&self) -> usize {
        self.in_flight
    }

    /// Records queued across the active and retired buffers
    pub fn pending_records(&self) -> usize {
        self.buffer.iter().chain(self.retired.iter()).map(|b| b.len()).sum()
    }

    pub fn retired_sessions(&self) -> usize {
        self.retired.len()
    }

    fn require_recording(&self) -> Result<()> {
        match (self.phase, &self.state) {
            (SessionPhase::Recording, Some(_)) => Ok(()),
            _ => Err(TelemetryError::NoActiveSession),
        }
    }

    /// Open a new session with the registry and begin calibration
    pub async fn start(&mut self) -> Result<String> {
        if let Some(state) = &self.state {
            return Err(TelemetryError::SessionAlreadyActive(state.id.clone()));
        }

        let id = self.registry.open().await.map_err(|e| match e {
            TelemetryError::SessionOpenFailure(_) => e,
            other => TelemetryError::SessionOpenFailure(other.to_string()),
        })?;

        let mut state = SessionState::new(id.clone());
        self.calibration = CalibrationEngine::new(self.config.calibration);
        match self.config.orientation_override {
            Some(mode) => {
                state.orientation_mode = mode;
                state.calibrated = true;
                self.remapper = AxisRemapper::new(mode);
                self.calibrating = false;
                info!("[{id}] using configured orientation {mode}");
            }
            None => {
                self.remapper = AxisRemapper::default();
                self.calibrating = true;
                info!("[{id}] calibrating, keep the device at rest");
            }
        }

        self.classifier = EventClassifier::new(self.config.classifier.clone());
        self.distance.reset();
        self.latest_motion = None;
        self.pending_event = None;
        let generation = self.next_generation;
        self.next_generation += 1;
        self.buffer = Some(TelemetryBuffer::new(
            id.clone(),
            generation,
            self.config.failure_alert_threshold,
        ));
        self.state = Some(state);
        self.phase = SessionPhase::Recording;

        info!("[{id}] session started");
        Ok(id)
    }

    /// Fix the orientation from the collected window, or fall back to default
    fn finish_calibration(&mut self) {
        let mode = match self.calibration.calibrate() {
            Ok(mode) => mode,
            Err(e) => {
                warn!("{e}; using default orientation");
                OrientationMode::Default
            }
        };

        self.calibrating = false;
        self.remapper = AxisRemapper::new(mode);
        if let Some(state) = self.state.as_mut() {
            state.orientation_mode = mode;
            state.calibrated = true;
            info!(
                "[{}] calibration complete: {} ({} samples)",
                state.id,
                mode,
                self.calibration.len()
            );
        }
    }

    /// Calibrate with, or remap, classify and buffer one motion sample
    pub fn on_motion_sample(&mut self, raw: RawMotion) -> Result<DrivingEvent> {
        self.require_recording()?;
        if ![raw.timestamp, raw.x, raw.y, raw.z].iter().all(|v| v.is_finite()) {
            return Err(TelemetryError::InvalidInput(format!(
                "non-finite motion sample at t={}",
                raw.timestamp
            )));
        }

        if let Some(state) = self.state.as_mut() {
            state.motion_samples += 1;
        }

        if self.calibrating {
            if self
                .calibration
                .collect(CalibrationSample::from(&raw), raw.timestamp)
            {
                self.finish_calibration();
            }
            return Ok(DrivingEvent::Normal);
        }

        let sample = self.remapper.remap(&raw);
        trace!(
            "motion t={:.3} fwd={:.3} side={:.3} up={:.3}",
            sample.timestamp,
            sample.forward_g,
            sample.side_g,
            sample.up_g
        );
        self.latest_motion = Some(sample);

        let Some(state) = self.state.as_mut() else {
            return Err(TelemetryError::NoActiveSession);
        };
        let classification = self.classifier.classify_motion(
            &sample,
            &mut state.counters,
            &mut state.cooldown_clocks,
        );
        if classification.event != DrivingEvent::Normal {
            self.pending_event.get_or_insert(classification.event);
        }

        if let Some(buffer) = self.buffer.as_mut() {
            buffer.append_motion(sample.into());
        }
        Ok(classification.event)
    }

    /// Accumulate distance, classify and buffer one position fix.
    ///
    /// The record is tagged with the first event since the previous fix, which may have
    /// fired on a motion sample in between.
    pub fn on_position_sample(&mut self, fix: PositionFix) -> Result<DrivingEvent> {
        self.require_recording()?;
        if ![fix.timestamp, fix.latitude, fix.longitude]
            .iter()
            .all(|v| v.is_finite())
        {
            return Err(TelemetryError::InvalidInput(format!(
                "non-finite position fix at t={}",
                fix.timestamp
            )));
        }

        let sample = fix.to_sample();
        if sample.is_null_island() {
            debug!("dropping fix at (0, 0), t={:.3}", sample.timestamp);
            return Ok(DrivingEvent::Normal);
        }

        self.distance.push(sample.latitude, sample.longitude);
        let limit = self
            .speed_limits
            .as_ref()
            .and_then(|lookup| lookup.limit_kmh(sample.latitude, sample.longitude));

        let Some(state) = self.state.as_mut() else {
            return Err(TelemetryError::NoActiveSession);
        };
        let classification = self.classifier.classify_position(
            &sample,
            self.latest_motion.as_ref(),
            limit,
            &mut state.counters,
            &mut state.cooldown_clocks,
        );

        state.accumulated_distance_km = self.distance.total_km();
        state.position_fixes += 1;
        state.latest_speed_kmh = sample.speed_kmh;

        let event = self.pending_event.take().unwrap_or(classification.event);
        if let Some(buffer) = self.buffer.as_mut() {
            buffer.append_position(PositionRecord::new(
                &sample,
                self.latest_motion.as_ref(),
                event,
            ));
        }
        trace!(
            "fix t={:.3} speed={:.1} km/h event={}",
            sample.timestamp,
            sample.speed_kmh,
            event
        );
        Ok(event)
    }

    /// Discard the current orientation and collect a new calibration window
    pub fn recalibrate(&mut self) -> Result<()> {
        self.require_recording()?;
        self.calibration.reset();
        self.calibrating = true;
        self.latest_motion = None;
        self.pending_event = None;
        if let Some(state) = self.state.as_mut() {
            state.calibrated = false;
            info!("[{}] recalibrating", state.id);
        }
        Ok(())
    }

    fn spawn_delivery(&mut self, batch: TelemetryBatch) {
        let sink = Arc::clone(&self.sink);
        let tx = self.completion_tx.clone();
        self.in_flight += 1;

        tokio::spawn(async move {
            let result = sink.deliver(&batch).await;
            // Receiver lives as long as the controller
            let _ = tx.send(FlushCompletion {
                ticket: batch.ticket,
                result,
            });
        });
    }

    /// Dispatch deliveries for every idle queue, active and retired.
    /// Returns the number of batches sent.
    pub fn flush(&mut self) -> usize {
        let mut batches = Vec::new();
        if let Some(buffer) = self.buffer.as_mut() {
            batches.extend(buffer.begin_flush());
        }
        for buffer in self.retired.iter_mut() {
            batches.extend(buffer.begin_flush());
        }

        let count = batches.len();
        for batch in batches {
            self.spawn_delivery(batch);
        }
        if count > 0 {
            debug!("dispatched {count} batches");
        }
        count
    }

    /// Settle a delivery outcome against whichever buffer issued it.
    /// Routing is by buffer generation, so a server that reuses ids cannot misroute.
    pub fn apply_completion(&mut self, completion: FlushCompletion) {
        self.in_flight = self.in_flight.saturating_sub(1);
        let generation = completion.ticket.generation;

        let target = self
            .buffer
            .iter_mut()
            .chain(self.retired.iter_mut())
            .find(|buffer| buffer.generation() == generation);

        match target {
            Some(buffer) => {
                buffer.settle(&completion.ticket, &completion.result);
            }
            None => debug!(
                "completion for closed buffer {} (generation {generation}) ignored",
                completion.ticket.session_id
            ),
        }

        self.retired.retain(|buffer| {
            let drained = buffer.is_empty() && buffer.is_idle();
            if drained {
                info!("[{}] backlog delivered", buffer.session_id());
            }
            !drained
        });
    }

    /// Wait for the next delivery outcome
    pub async fn next_completion(&mut self) -> Option<FlushCompletion> {
        self.completion_rx.recv().await
    }

    /// Apply completions until the active buffer has nothing in flight or the
    /// end timeout passes. Unsettled leases are released on timeout.
    async fn await_active_deliveries(&mut self) {
        let deadline = tokio::time::Instant::now() + self.config.end_flush_timeout();

        while self.buffer.as_ref().is_some_and(|b| !b.is_idle()) {
            match tokio::time::timeout_at(deadline, self.completion_rx.recv()).await {
                Ok(Some(completion)) => self.apply_completion(completion),
                Ok(None) => break,
                Err(_) => {
                    warn!("in-flight deliveries did not finish before session end");
                    if let Some(buffer) = self.buffer.as_mut() {
                        buffer.release_leases();
                    }
                    break;
                }
            }
        }
    }

    /// Flush, close with the registry and return to Idle
    pub async fn end(&mut self) -> Result<SessionSummary> {
        self.require_recording()?;
        self.phase = SessionPhase::Ending;

        if self.calibrating {
            self.finish_calibration();
        }

        self.await_active_deliveries().await;

        let undelivered_records = match self.buffer.as_mut() {
            Some(buffer) => buffer.flush_with(self.sink.as_ref()).await.remaining,
            None => 0,
        };

        let Some(state) = self.state.take() else {
            self.phase = SessionPhase::Idle;
            return Err(TelemetryError::NoActiveSession);
        };

        let distance_km = self.distance.total_km();
        let score = stability_score(&state.counters, distance_km);
        let duration_secs =
            Utc::now().signed_duration_since(state.start_time).num_milliseconds().max(0) as f64
                / 1000.0;

        let request = CloseRequest {
            session_id: state.id.clone(),
            distance_km,
            counters: state.counters,
            stability_score: score,
            duration_secs,
        };
        let close_error = match self.registry.close(&request).await {
            Ok(()) => None,
            Err(e) => {
                let err = match e {
                    TelemetryError::SessionCloseFailure(_) => e,
                    other => TelemetryError::SessionCloseFailure(other.to_string()),
                };
                warn!("[{}] {err}", state.id);
                Some(err.to_string())
            }
        };

        if let Some(buffer) = self.buffer.take() {
            if !buffer.is_empty() {
                warn!(
                    "[{}] {} records undelivered, retrying on later flushes",
                    state.id,
                    buffer.len()
                );
                self.retired.push(buffer);
            }
        }

        self.latest_motion = None;
        self.pending_event = None;
        self.calibrating = false;
        self.phase = SessionPhase::Idle;

        let summary = SessionSummary {
            session_id: state.id,
            start_time: state.start_time.to_rfc3339(),
            distance_km,
            counters: state.counters,
            stability_score: score,
            duration_secs,
            orientation_mode: state.orientation_mode,
            undelivered_records,
            close_error,
        };
        info!(
            "[{}] session ended: {:.2} km, stability {}",
            summary.session_id, summary.distance_km, summary.stability_score
        );
        self.last_summary = Some(summary.clone());
        Ok(summary)
    }

    pub fn status(&self) -> LiveStatus {
        let mut status = LiveStatus::new();
        status.timestamp = current_timestamp();
        status.phase = self.phase;
        status.uptime_seconds = self.created.elapsed().as_secs();

        if let Some(state) = &self.state {
            status.session_id = Some(state.id.clone());
            status.orientation_mode = state.calibrated.then_some(state.orientation_mode);
            status.calibrated = state.calibrated;
            status.counters = state.counters;
            status.distance_km = state.accumulated_distance_km;
            status.latest_speed_kmh = state.latest_speed_kmh;
            status.motion_samples = state.motion_samples;
            status.position_fixes = state.position_fixes;
        }
        if let Some(buffer) = &self.buffer {
            status.queued_motion = buffer.motion_len();
            status.queued_position = buffer.position_len();
            status.delivery = buffer.stats().clone();
        }
        status.retired_sessions = self.retired.len();
        status.retired_records = self.retired.iter().map(|b| b.len()).sum();
        status
    }
}
