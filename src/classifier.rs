use crate::error::{Result, TelemetryError};
use crate::types::{MotionSample, PositionSample, GRAVITY};
use log::{debug, info, trace, warn};
use serde::{Deserialize, Serialize};
use std::fmt;

const KMH_PER_MS: f64 = 3.6;

/// Tag attached to a position record
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DrivingEvent {
    #[default]
    Normal,
    SuddenAccel,
    SuddenBrake,
    SharpTurn,
    SpeedViolation,
}

impl DrivingEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            DrivingEvent::Normal => "normal",
            DrivingEvent::SuddenAccel => "sudden_accel",
            DrivingEvent::SuddenBrake => "sudden_brake",
            DrivingEvent::SharpTurn => "sharp_turn",
            DrivingEvent::SpeedViolation => "speed_violation",
        }
    }
}

impl fmt::Display for DrivingEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Event classes in evaluation order
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EventClass {
    Accel,
    Brake,
    Turn,
    Violation,
}

impl EventClass {
    pub const ORDER: [EventClass; 4] = [
        EventClass::Accel,
        EventClass::Brake,
        EventClass::Turn,
        EventClass::Violation,
    ];

    pub fn event(self) -> DrivingEvent {
        match self {
            EventClass::Accel => DrivingEvent::SuddenAccel,
            EventClass::Brake => DrivingEvent::SuddenBrake,
            EventClass::Turn => DrivingEvent::SharpTurn,
            EventClass::Violation => DrivingEvent::SpeedViolation,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventCounters {
    pub accel: u32,
    pub brake: u32,
    pub turn: u32,
    pub violation: u32,
}

impl EventCounters {
    pub fn get(&self, class: EventClass) -> u32 {
        match class {
            EventClass::Accel => self.accel,
            EventClass::Brake => self.brake,
            EventClass::Turn => self.turn,
            EventClass::Violation => self.violation,
        }
    }

    fn increment(&mut self, class: EventClass) {
        let slot = match class {
            EventClass::Accel => &mut self.accel,
            EventClass::Brake => &mut self.brake,
            EventClass::Turn => &mut self.turn,
            EventClass::Violation => &mut self.violation,
        };
        *slot = slot.saturating_add(1);
    }

    /// Events that count against the stability score (violations excluded)
    pub fn motion_events(&self) -> u32 {
        self.accel + self.brake + self.turn
    }
}

/// Last-fired timestamp per class; `None` means the class never fired
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct CooldownClocks {
    accel: Option<f64>,
    brake: Option<f64>,
    turn: Option<f64>,
    violation: Option<f64>,
}

impl CooldownClocks {
    pub fn last_fired(&self, class: EventClass) -> Option<f64> {
        match class {
            EventClass::Accel => self.accel,
            EventClass::Brake => self.brake,
            EventClass::Turn => self.turn,
            EventClass::Violation => self.violation,
        }
    }

    /// True when the class never fired or fired more than `cooldown_secs` ago
    pub fn is_ready(&self, class: EventClass, now: f64, cooldown_secs: f64) -> bool {
        match self.last_fired(class) {
            Some(last) => now - last > cooldown_secs,
            None => true,
        }
    }

    fn stamp(&mut self, class: EventClass, now: f64) {
        let slot = match class {
            EventClass::Accel => &mut self.accel,
            EventClass::Brake => &mut self.brake,
            EventClass::Turn => &mut self.turn,
            EventClass::Violation => &mut self.violation,
        };
        *slot = Some(now);
    }
}

/// Tunable thresholds
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierConfig {
    /// Longitudinal g that counts as sudden acceleration (both signals)
    pub accel_threshold_g: f64,
    /// Longitudinal g that counts as sudden braking (negative)
    pub brake_threshold_g: f64,
    /// Lateral g that counts as a sharp turn
    pub turn_threshold_g: f64,
    pub turn_min_speed_kmh: f64,
    /// Allowance over the posted limit
    pub violation_margin_kmh: f64,
    pub cooldown_secs: f64,
    /// How long after a fix its speed-delta g may corroborate motion samples
    pub speed_signal_max_age_secs: f64,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            accel_threshold_g: 0.3,
            brake_threshold_g: -0.3,
            turn_threshold_g: 0.4,
            turn_min_speed_kmh: 15.0,
            violation_margin_kmh: 5.0,
            cooldown_secs: 2.0,
            speed_signal_max_age_secs: 1.5,
        }
    }
}

impl ClassifierConfig {
    pub fn validate(&self) -> Result<()> {
        let values = [
            ("accel_threshold_g", self.accel_threshold_g),
            ("brake_threshold_g", self.brake_threshold_g),
            ("turn_threshold_g", self.turn_threshold_g),
            ("turn_min_speed_kmh", self.turn_min_speed_kmh),
            ("violation_margin_kmh", self.violation_margin_kmh),
            ("cooldown_secs", self.cooldown_secs),
            ("speed_signal_max_age_secs", self.speed_signal_max_age_secs),
        ];
        if let Some((name, _)) = values.iter().find(|(_, v)| !v.is_finite()) {
            return Err(TelemetryError::InvalidConfig(format!("{name} must be finite")));
        }
        if self.accel_threshold_g <= 0.0 {
            return Err(TelemetryError::InvalidConfig(
                "accel_threshold_g must be positive".to_string(),
            ));
        }
        if self.brake_threshold_g >= 0.0 {
            return Err(TelemetryError::InvalidConfig(
                "brake_threshold_g must be negative".to_string(),
            ));
        }
        if self.turn_threshold_g <= 0.0 || self.cooldown_secs < 0.0 {
            return Err(TelemetryError::InvalidConfig(
                "turn_threshold_g must be positive and cooldown_secs non-negative".to_string(),
            ));
        }
        if self.speed_signal_max_age_secs <= 0.0 {
            return Err(TelemetryError::InvalidConfig(
                "speed_signal_max_age_secs must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Result of evaluating one sample
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Classification {
    /// First class that fired, or `Normal`
    pub event: DrivingEvent,
    /// Every class that fired, in evaluation order
    pub fired: Vec<EventClass>,
    /// Speed-delta longitudinal acceleration used for this evaluation
    pub longitudinal_g: Option<f64>,
}

#[derive(Clone, Copy, Debug, PartialEq)]
struct SpeedPoint {
    timestamp: f64,
    speed_kmh: f64,
}

/// Longitudinal g from the latest well-ordered fix pair
#[derive(Clone, Copy, Debug, PartialEq)]
struct SpeedSignal {
    timestamp: f64,
    g: f64,
}

/// Inputs to one rule pass
struct Signals<'a> {
    now: f64,
    longitudinal_g: Option<f64>,
    motion: Option<&'a MotionSample>,
    speed_kmh: f64,
    speed_limit_kmh: Option<f64>,
}

/// Threshold + cooldown rule engine.
///
/// Turn, acceleration and braking are checked on every motion sample against the latest
/// fix speed and fix-pair g. Each fix refreshes those signals and checks acceleration,
/// braking and the speed limit. Counters and cooldown clocks belong to the session and
/// are passed in on every call.
#[derive(Clone, Debug, Default)]
pub struct EventClassifier {
    config: ClassifierConfig,
    previous: Option<SpeedPoint>,
    signal: Option<SpeedSignal>,
    speed_kmh: f64,
}

impl EventClassifier {
    pub fn new(config: ClassifierConfig) -> Self {
        Self {
            config,
            previous: None,
            signal: None,
            speed_kmh: 0.0,
        }
    }

    pub fn config(&self) -> &ClassifierConfig {
        &self.config
    }

    /// Forget speed history (session start)
    pub fn reset(&mut self) {
        self.previous = None;
        self.signal = None;
        self.speed_kmh = 0.0;
    }

    /// Longitudinal g derived from consecutive speeds.
    ///
    /// `Ok(None)` for the first fix of a session; an error when time does not advance.
    /// The previous point is replaced only for well-ordered fixes.
    fn speed_delta_g(&mut self, position: &PositionSample) -> Result<Option<f64>> {
        let current = SpeedPoint {
            timestamp: position.timestamp,
            speed_kmh: position.speed_kmh,
        };

        let Some(previous) = self.previous else {
            self.previous = Some(current);
            return Ok(None);
        };

        let dt = current.timestamp - previous.timestamp;
        if dt <= 0.0 || !dt.is_finite() {
            return Err(TelemetryError::InvalidSampleOrdering {
                previous: previous.timestamp,
                current: current.timestamp,
            });
        }

        self.previous = Some(current);
        let accel_ms2 = (current.speed_kmh - previous.speed_kmh) / KMH_PER_MS / dt;
        Ok(Some(accel_ms2 / GRAVITY))
    }

    /// Fix-pair g if the fix it came from is recent enough for `now`
    fn fresh_longitudinal_g(&self, now: f64) -> Option<f64> {
        self.signal
            .filter(|s| now - s.timestamp <= self.config.speed_signal_max_age_secs)
            .map(|s| s.g)
    }

    fn triggered(&self, class: EventClass, signals: &Signals) -> bool {
        let cfg = &self.config;
        match class {
            EventClass::Accel => match (signals.longitudinal_g, signals.motion) {
                (Some(g), Some(m)) => g > cfg.accel_threshold_g && m.forward_g > cfg.accel_threshold_g,
                _ => false,
            },
            EventClass::Brake => match (signals.longitudinal_g, signals.motion) {
                (Some(g), Some(m)) => g < cfg.brake_threshold_g && m.forward_g < cfg.brake_threshold_g,
                _ => false,
            },
            EventClass::Turn => signals.motion.is_some_and(|m| {
                m.side_g.abs() > cfg.turn_threshold_g && signals.speed_kmh > cfg.turn_min_speed_kmh
            }),
            EventClass::Violation => signals
                .speed_limit_kmh
                .is_some_and(|limit| signals.speed_kmh > limit + cfg.violation_margin_kmh),
        }
    }

    /// Run the enabled `classes` in evaluation order; every rule that fires bumps its
    /// counter and clock
    fn run_rules(
        &self,
        classes: &[EventClass],
        signals: &Signals,
        counters: &mut EventCounters,
        clocks: &mut CooldownClocks,
    ) -> Classification {
        let now = signals.now;
        let mut fired = Vec::new();

        for class in EventClass::ORDER.into_iter().filter(|c| classes.contains(c)) {
            if !self.triggered(class, signals) {
                continue;
            }
            if !clocks.is_ready(class, now, self.config.cooldown_secs) {
                trace!("{} suppressed by cooldown at t={:.3}", class.event(), now);
                continue;
            }

            counters.increment(class);
            clocks.stamp(class, now);
            fired.push(class);
            info!(
                "{} detected at t={:.3} (speed {:.1} km/h, count {})",
                class.event(),
                now,
                signals.speed_kmh,
                counters.get(class)
            );
        }

        Classification {
            event: fired
                .first()
                .map(|class| class.event())
                .unwrap_or(DrivingEvent::Normal),
            fired,
            longitudinal_g: signals.longitudinal_g,
        }
    }

    /// Evaluate accel, brake and turn for one motion sample
    pub fn classify_motion(
        &mut self,
        motion: &MotionSample,
        counters: &mut EventCounters,
        clocks: &mut CooldownClocks,
    ) -> Classification {
        let signals = Signals {
            now: motion.timestamp,
            longitudinal_g: self.fresh_longitudinal_g(motion.timestamp),
            motion: Some(motion),
            speed_kmh: self.speed_kmh,
            speed_limit_kmh: None,
        };
        self.run_rules(
            &[EventClass::Accel, EventClass::Brake, EventClass::Turn],
            &signals,
            counters,
            clocks,
        )
    }

    /// Refresh the speed signals from a fix, then evaluate accel, brake and violation.
    ///
    /// Accel and brake are skipped on the first fix of a session and on fixes whose
    /// timestamp does not advance.
    pub fn classify_position(
        &mut self,
        position: &PositionSample,
        motion: Option<&MotionSample>,
        speed_limit_kmh: Option<f64>,
        counters: &mut EventCounters,
        clocks: &mut CooldownClocks,
    ) -> Classification {
        let longitudinal_g = match self.speed_delta_g(position) {
            Ok(g) => g,
            Err(e) => {
                warn!("{e}; skipping accel/brake evaluation for this fix");
                None
            }
        };
        if let Some(g) = longitudinal_g {
            self.signal = Some(SpeedSignal {
                timestamp: position.timestamp,
                g,
            });
        }
        self.speed_kmh = position.speed_kmh;
        debug!(
            "fix t={:.3} speed={:.1} km/h g={:?}",
            position.timestamp, position.speed_kmh, longitudinal_g
        );

        let signals = Signals {
            now: position.timestamp,
            longitudinal_g,
            motion,
            speed_kmh: position.speed_kmh,
            speed_limit_kmh,
        };
        self.run_rules(
            &[EventClass::Accel, EventClass::Brake, EventClass::Violation],
            &signals,
            counters,
            clocks,
        )
    }
}
