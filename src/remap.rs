use crate::calibration::OrientationMode;
use crate::types::{MotionSample, RawMotion, GRAVITY};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Axis {
    X,
    Y,
    Z,
}

/// One device axis with the sign it contributes to a vehicle axis
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SignedAxis {
    pub axis: Axis,
    pub negated: bool,
}

const fn pos(axis: Axis) -> SignedAxis {
    SignedAxis { axis, negated: false }
}

const fn neg(axis: Axis) -> SignedAxis {
    SignedAxis { axis, negated: true }
}

impl SignedAxis {
    fn read(&self, ax: f64, ay: f64, az: f64) -> f64 {
        let value = match self.axis {
            Axis::X => ax,
            Axis::Y => ay,
            Axis::Z => az,
        };
        if self.negated {
            -value
        } else {
            value
        }
    }

    fn write(&self, value: f64, device: &mut [f64; 3]) {
        let slot = match self.axis {
            Axis::X => 0,
            Axis::Y => 1,
            Axis::Z => 2,
        };
        device[slot] = if self.negated { -value } else { value };
    }
}

/// Device axes feeding each vehicle axis
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AxisMapping {
    pub forward: SignedAxis,
    pub side: SignedAxis,
    pub up: SignedAxis,
}

impl OrientationMode {
    /// Mounting geometry for each orientation
    pub const fn axis_mapping(self) -> AxisMapping {
        use Axis::{X, Y, Z};
        match self {
            OrientationMode::Default => AxisMapping {
                forward: neg(Z),
                side: pos(X),
                up: neg(Y),
            },
            OrientationMode::LandscapeLeft => AxisMapping {
                forward: neg(Z),
                side: pos(Y),
                up: neg(X),
            },
            OrientationMode::LandscapeRight => AxisMapping {
                forward: neg(Z),
                side: neg(Y),
                up: pos(X),
            },
            OrientationMode::FlatScreenUp => AxisMapping {
                forward: pos(Y),
                side: pos(X),
                up: pos(Z),
            },
            OrientationMode::FlatScreenDown => AxisMapping {
                forward: pos(Y),
                side: pos(X),
                up: neg(Z),
            },
            OrientationMode::UpsideDown => AxisMapping {
                forward: neg(Z),
                side: neg(X),
                up: pos(Y),
            },
        }
    }
}

/// Raw device acceleration (m/s²) to vehicle-relative `(forward, side, up)` in g
pub fn remap(ax: f64, ay: f64, az: f64, mode: OrientationMode) -> (f64, f64, f64) {
    let mapping = mode.axis_mapping();
    (
        mapping.forward.read(ax, ay, az) / GRAVITY,
        mapping.side.read(ax, ay, az) / GRAVITY,
        mapping.up.read(ax, ay, az) / GRAVITY,
    )
}

/// Inverse of [`remap`]: vehicle-relative g back to device axes in m/s²
pub fn unmap(forward_g: f64, side_g: f64, up_g: f64, mode: OrientationMode) -> (f64, f64, f64) {
    let mapping = mode.axis_mapping();
    let mut device = [0.0; 3];
    mapping.forward.write(forward_g * GRAVITY, &mut device);
    mapping.side.write(side_g * GRAVITY, &mut device);
    mapping.up.write(up_g * GRAVITY, &mut device);
    (device[0], device[1], device[2])
}

/// Remaps raw readings for the orientation fixed at calibration
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AxisRemapper {
    mode: OrientationMode,
}

impl AxisRemapper {
    pub fn new(mode: OrientationMode) -> Self {
        Self { mode }
    }

    pub fn mode(&self) -> OrientationMode {
        self.mode
    }

    pub fn remap(&self, raw: &RawMotion) -> MotionSample {
        let (forward_g, side_g, up_g) = remap(raw.x, raw.y, raw.z, self.mode);
        MotionSample {
            timestamp: raw.timestamp,
            forward_g,
            side_g,
            up_g,
        }
    }
}
