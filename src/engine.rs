use crate::config::Config;
use crate::error::{Result, TelemetryError};
use crate::live_status::LiveStatus;
use crate::session::{SessionController, SessionPhase, SessionSummary};
use crate::types::{PositionFix, RawMotion};
use log::{debug, info, trace, warn};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Interval, MissedTickBehavior};

const COMMAND_CHANNEL_CAPACITY: usize = 32;

/// Control requests, each answered over its own oneshot
#[derive(Debug)]
pub enum Command {
    Start {
        reply: oneshot::Sender<Result<String>>,
    },
    End {
        reply: oneshot::Sender<Result<SessionSummary>>,
    },
    Recalibrate {
        reply: oneshot::Sender<Result<()>>,
    },
    Flush {
        reply: oneshot::Sender<usize>,
    },
    Status {
        reply: oneshot::Sender<LiveStatus>,
    },
    /// Ends an active session, then stops the loop
    Shutdown {
        reply: oneshot::Sender<Option<SessionSummary>>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SensorEvent {
    Motion(RawMotion),
    Position(PositionFix),
}

/// Single processing loop that owns the [`SessionController`]
pub struct Engine {
    controller: SessionController,
    commands: mpsc::Receiver<Command>,
    sensors: mpsc::Receiver<SensorEvent>,
    flush_interval: Duration,
    status_path: Option<PathBuf>,
}

/// Cloneable front door to a running [`Engine`]
#[derive(Clone, Debug)]
pub struct EngineHandle {
    commands: mpsc::Sender<Command>,
    sensors: mpsc::Sender<SensorEvent>,
    dropped: Arc<AtomicU64>,
}

impl Engine {
    pub fn new(controller: SessionController, config: &Config) -> (Engine, EngineHandle) {
        let (command_tx, command_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let (sensor_tx, sensor_rx) = mpsc::channel(config.sensor_channel_capacity.max(1));

        let engine = Engine {
            controller,
            commands: command_rx,
            sensors: sensor_rx,
            flush_interval: config.flush_interval(),
            status_path: config.status_path.clone(),
        };
        let handle = EngineHandle {
            commands: command_tx,
            sensors: sensor_tx,
            dropped: Arc::new(AtomicU64::new(0)),
        };
        (engine, handle)
    }

    pub async fn run(mut self) -> Result<()> {
        let mut ticker = tokio::time::interval(self.flush_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        ticker.reset();
        info!("engine running, flushing every {:?}", self.flush_interval);

        loop {
            tokio::select! {
                command = self.commands.recv() => {
                    match command {
                        Some(command) => {
                            if self.handle_command(command, &mut ticker).await {
                                break;
                            }
                        }
                        None => {
                            debug!("all handles dropped");
                            self.shutdown().await;
                            break;
                        }
                    }
                }
                Some(event) = self.sensors.recv() => self.handle_sensor(event),
                Some(completion) = self.controller.next_completion() => {
                    self.controller.apply_completion(completion);
                }
                _ = ticker.tick() => self.tick(),
            }
        }

        self.write_status();
        info!("engine stopped");
        Ok(())
    }

    fn handle_sensor(&mut self, event: SensorEvent) {
        let result = match event {
            SensorEvent::Motion(raw) => self.controller.on_motion_sample(raw),
            SensorEvent::Position(fix) => self.controller.on_position_sample(fix),
        };

        match result {
            Ok(_) => {}
            Err(TelemetryError::NoActiveSession) => trace!("sample ignored, no active session"),
            Err(e) => warn!("sample rejected: {e}"),
        }
    }

    /// Process samples already queued so commands see them in arrival order
    fn drain_sensors(&mut self) {
        while let Ok(event) = self.sensors.try_recv() {
            self.handle_sensor(event);
        }
    }

    fn tick(&mut self) {
        let dispatched = self.controller.flush();
        if dispatched > 0 {
            trace!("tick dispatched {dispatched} batches");
        }
        self.write_status();
    }

    fn write_status(&self) {
        if let Some(path) = &self.status_path {
            if let Err(e) = self.controller.status().save(path) {
                warn!("failed to write status to {}: {e}", path.display());
            }
        }
    }

    async fn shutdown(&mut self) -> Option<SessionSummary> {
        self.drain_sensors();
        if self.controller.phase() != SessionPhase::Recording {
            return None;
        }
        match self.controller.end().await {
            Ok(summary) => Some(summary),
            Err(e) => {
                warn!("failed to end session on shutdown: {e}");
                None
            }
        }
    }

    /// Returns true when the loop should stop
    async fn handle_command(&mut self, command: Command, ticker: &mut Interval) -> bool {
        match command {
            Command::Start { reply } => {
                let result = self.controller.start().await;
                if result.is_ok() {
                    ticker.reset();
                }
                let _ = reply.send(result);
            }
            Command::End { reply } => {
                self.drain_sensors();
                let result = self.controller.end().await;
                self.write_status();
                let _ = reply.send(result);
            }
            Command::Recalibrate { reply } => {
                self.drain_sensors();
                let _ = reply.send(self.controller.recalibrate());
            }
            Command::Flush { reply } => {
                self.drain_sensors();
                let _ = reply.send(self.controller.flush());
            }
            Command::Status { reply } => {
                let _ = reply.send(self.controller.status());
            }
            Command::Shutdown { reply } => {
                let summary = self.shutdown().await;
                let _ = reply.send(summary);
                return true;
            }
        }
        false
    }
}

impl EngineHandle {
    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(make(tx))
            .await
            .map_err(|_| TelemetryError::EngineStopped)?;
        rx.await.map_err(|_| TelemetryError::EngineStopped)
    }

    pub async fn start(&self) -> Result<String> {
        self.request(|reply| Command::Start { reply }).await?
    }

    pub async fn end(&self) -> Result<SessionSummary> {
        self.request(|reply| Command::End { reply }).await?
    }

    pub async fn recalibrate(&self) -> Result<()> {
        self.request(|reply| Command::Recalibrate { reply }).await?
    }

    /// Dispatch deliveries now; returns the number of batches sent
    pub async fn flush(&self) -> Result<usize> {
        self.request(|reply| Command::Flush { reply }).await
    }

    pub async fn status(&self) -> Result<LiveStatus> {
        self.request(|reply| Command::Status { reply }).await
    }

    pub async fn shutdown(&self) -> Result<Option<SessionSummary>> {
        self.request(|reply| Command::Shutdown { reply }).await
    }

    fn try_push(&self, event: SensorEvent) -> bool {
        match self.sensors.try_send(event) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                if dropped % 100 == 1 {
                    warn!("sensor channel full, {dropped} samples dropped so far");
                }
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Non-blocking; drops the sample when the engine is behind
    pub fn push_motion(&self, raw: RawMotion) -> bool {
        self.try_push(SensorEvent::Motion(raw))
    }

    /// Non-blocking; drops the fix when the engine is behind
    pub fn push_position(&self, fix: PositionFix) -> bool {
        self.try_push(SensorEvent::Position(fix))
    }

    /// Waits for channel capacity instead of dropping
    pub async fn send(&self, event: SensorEvent) -> Result<()> {
        self.sensors
            .send(event)
            .await
            .map_err(|_| TelemetryError::EngineStopped)
    }

    pub fn dropped_samples(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::CalibrationWindow;
    use crate::sink::{LocalRegistry, MemorySink};
    use crate::types::GRAVITY;

    fn spawn_engine(config: Config) -> (EngineHandle, Arc<MemorySink>, Arc<LocalRegistry>) {
        let sink = Arc::new(MemorySink::new());
        let registry = Arc::new(LocalRegistry::new());
        let controller = SessionController::new(config.clone(), sink.clone(), registry.clone());
        let (engine, handle) = Engine::new(controller, &config);
        tokio::spawn(engine.run());
        (handle, sink, registry)
    }

    fn test_config() -> Config {
        Config {
            calibration: CalibrationWindow::Samples { count: 3 },
            ..Config::default()
        }
    }

    #[tokio::test]
    async fn test_session_round_trip() {
        let (handle, sink, registry) = spawn_engine(test_config());

        handle.start().await.unwrap();
        for i in 0..5 {
            handle
                .send(SensorEvent::Motion(RawMotion::new(i as f64 * 0.1, 0.0, -GRAVITY, 0.0)))
                .await
                .unwrap();
        }
        handle
            .send(SensorEvent::Position(PositionFix::new(1.0, 35.0, 139.0, Some(10.0))))
            .await
            .unwrap();
        handle
            .send(SensorEvent::Position(PositionFix::new(2.0, 35.001, 139.0, Some(10.0))))
            .await
            .unwrap();

        let summary = handle.end().await.unwrap();
        assert!(summary.distance_km > 0.1);
        assert_eq!(summary.undelivered_records, 0);
        // Three calibration samples are not forwarded
        assert_eq!(sink.motion_records(), 2);
        assert_eq!(sink.position_records(), 2);
        assert_eq!(registry.closed().len(), 1);

        assert_eq!(handle.end().await, Err(TelemetryError::NoActiveSession));
        assert_eq!(handle.shutdown().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_shutdown_ends_active_session() {
        let (handle, _sink, registry) = spawn_engine(test_config());
        let id = handle.start().await.unwrap();

        let summary = handle.shutdown().await.unwrap().unwrap();
        assert_eq!(summary.session_id, id);
        assert_eq!(registry.closed().len(), 1);

        // Loop is gone
        assert_eq!(handle.start().await, Err(TelemetryError::EngineStopped));
    }

    #[tokio::test]
    async fn test_push_drops_when_full() {
        let config = Config {
            sensor_channel_capacity: 1,
            ..test_config()
        };
        let controller = SessionController::new(
            config.clone(),
            Arc::new(MemorySink::new()),
            Arc::new(LocalRegistry::new()),
        );
        // Engine not running, so nothing drains the channel
        let (_engine, handle) = Engine::new(controller, &config);

        assert!(handle.push_motion(RawMotion::new(0.0, 0.0, -GRAVITY, 0.0)));
        assert!(!handle.push_position(PositionFix::new(0.0, 35.0, 139.0, None)));
        assert_eq!(handle.dropped_samples(), 1);
    }

    #[tokio::test]
    async fn test_periodic_flush_delivers() {
        let config = Config {
            flush_interval_secs: 0.05,
            orientation_override: Some(crate::calibration::OrientationMode::Default),
            ..test_config()
        };
        let (handle, sink, _registry) = spawn_engine(config);

        handle.start().await.unwrap();
        handle
            .send(SensorEvent::Motion(RawMotion::new(0.0, 0.0, -GRAVITY, 0.0)))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(sink.motion_records(), 1);

        let status = handle.status().await.unwrap();
        assert_eq!(status.queued_motion, 0);
        assert_eq!(status.delivery.delivered_records, 1);
        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_samples_before_start_are_ignored() {
        let (handle, sink, _registry) = spawn_engine(test_config());
        handle
            .send(SensorEvent::Motion(RawMotion::new(0.0, 0.0, -GRAVITY, 0.0)))
            .await
            .unwrap();
        assert_eq!(handle.flush().await.unwrap(), 0);

        handle.start().await.unwrap();
        let status = handle.status().await.unwrap();
        assert_eq!(status.motion_samples, 0);
        handle.shutdown().await.unwrap();
        assert_eq!(sink.attempts(), 0);
    }
}
