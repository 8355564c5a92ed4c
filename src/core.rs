//! Core data types and port traits for the calibration engine.
//!
//! This module defines the foundational abstractions the rest of the crate is
//! built on: the three-channel control vector sent to the tube driver, the
//! voltage limits and their clamping policy, the measurement sample tying a
//! reading to the control vector that produced it, and the port traits behind
//! which the real hardware lives.
//!
//! # Ports
//!
//! The engine never touches hardware directly. Drivers for the digital I/O
//! card and the photometer are injected through [`ActuatorPort`] and
//! [`MeasurementPort`]; the stimulus monitor and the human operator are
//! likewise behind [`MonitorPort`] and [`OperatorInterface`]. There is
//! exactly one photometer and one tube rig, and all operations are strictly
//! sequential, so the ports take `&mut self` and implementations need no
//! internal locking.
//!
//! # Clamping
//!
//! A control value outside the device's voltage limits is never sent to
//! hardware. It is clamped, and clamping is observable: every clamped channel
//! produces a `log::warn!`, because a search that keeps running into a rail
//! is something the operator needs to see.

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::color::ColorTriple;
use crate::error::{AppResult, CalibError};

/// Number of bins in a photometer spectrum reading.
pub const SPECTRUM_SIZE: usize = 36;

// =============================================================================
// Channels
// =============================================================================

/// One of the three tube color channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Channel {
    /// Red tubes.
    Red,
    /// Green tubes.
    Green,
    /// Blue tubes.
    Blue,
}

/// All channels in control-vector order.
pub const CHANNELS: [Channel; 3] = [Channel::Red, Channel::Green, Channel::Blue];

impl Channel {
    /// Index of this channel within a control vector.
    pub fn index(self) -> usize {
        match self {
            Channel::Red => 0,
            Channel::Green => 1,
            Channel::Blue => 2,
        }
    }

    /// Lower-case channel name as used in logs and series files.
    pub fn name(self) -> &'static str {
        match self {
            Channel::Red => "red",
            Channel::Green => "green",
            Channel::Blue => "blue",
        }
    }
}

impl FromStr for Channel {
    type Err = CalibError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "red" => Ok(Channel::Red),
            "green" => Ok(Channel::Green),
            "blue" => Ok(Channel::Blue),
            other => Err(CalibError::InvalidChannel(other.to_string())),
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// =============================================================================
// Control vectors and voltage limits
// =============================================================================

/// Closed integer range of legal control values for the tube driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoltageLimits {
    /// Minimum control value the hardware accepts.
    pub low: i32,
    /// Maximum control value the hardware accepts.
    pub high: i32,
}

impl Default for VoltageLimits {
    fn default() -> Self {
        // The wasco card's usable range for the tube driver.
        Self {
            low: 0x400,
            high: 0xFFF,
        }
    }
}

impl VoltageLimits {
    /// Returns true if `value` lies within the closed range.
    pub fn contains(&self, value: i32) -> bool {
        value >= self.low && value <= self.high
    }
}

/// The three integer actuator set-points sent to the tube driver, in
/// (red, green, blue) order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ControlVector(pub [i32; 3]);

impl ControlVector {
    /// Creates a control vector from per-channel values.
    pub fn new(red: i32, green: i32, blue: i32) -> Self {
        Self([red, green, blue])
    }

    /// Value for one channel.
    pub fn get(&self, channel: Channel) -> i32 {
        self.0[channel.index()]
    }

    /// Returns a copy with one channel replaced.
    pub fn with_channel(&self, channel: Channel, value: i32) -> Self {
        let mut v = self.0;
        v[channel.index()] = value;
        Self(v)
    }

    /// Clamps every channel into `limits`, warning for each channel that had
    /// to be moved. Out-of-range requests are never sent silently.
    pub fn clamped(&self, limits: &VoltageLimits) -> Self {
        let mut out = self.0;
        for channel in CHANNELS {
            let v = out[channel.index()];
            if v < limits.low {
                log::warn!("{} channel is on minimum ({:#x})", channel, limits.low);
                out[channel.index()] = limits.low;
            } else if v > limits.high {
                log::warn!("{} channel is on maximum ({:#x})", channel, limits.high);
                out[channel.index()] = limits.high;
            }
        }
        Self(out)
    }
}

impl fmt::Display for ControlVector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {}, {})", self.0[0], self.0[1], self.0[2])
    }
}

// =============================================================================
// Measurement samples
// =============================================================================

/// One photometer reading tied to the control vector that produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeasurementSample {
    /// Control vector the tubes were set to for this reading.
    pub voltages: ControlVector,
    /// Measured tristimulus color.
    pub color: ColorTriple,
    /// Full spectrum reading, when one was requested.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub spectrum: Option<Vec<f64>>,
}

// =============================================================================
// Port traits
// =============================================================================

/// Actuator side of the tube rig: sets the control vector on the I/O card.
///
/// `set_control_vector` may block for a device-appropriate ramp time; real
/// drivers step the voltages gradually to avoid abrupt jumps, and that ramp
/// is entirely the implementor's concern. Values passed here are already
/// clamped into the legal range.
pub trait ActuatorPort {
    /// Drives the tubes to `voltages`, blocking until the ramp completes.
    fn set_control_vector(&mut self, voltages: ControlVector);
}

/// Measurement side of the rig: the photometer.
///
/// `trigger_measurement` reports device errors instead of panicking. Callers
/// in the search loops treat a failed trigger as "the reading may be stale,
/// proceed with it": the photometer keeps its last buffer, and aborting a
/// minutes-long search over a single flaky trigger is worse than one noisy
/// sample.
pub trait MeasurementPort {
    /// Triggers a measurement. An `Err` means the reading buffers may be
    /// stale.
    fn trigger_measurement(&mut self) -> AppResult<()>;

    /// Reads the last tristimulus (xyY) result.
    fn read_tristimulus(&mut self) -> ColorTriple;

    /// Reads the last spectrum result ([`SPECTRUM_SIZE`] bins).
    fn read_spectrum(&mut self) -> Vec<f64>;
}

/// The stimulus monitor: displays a nominal patch value for measurement.
pub trait MonitorPort {
    /// Shows the given nominal stimulus value full-screen.
    fn show_stimulus(&mut self, patch_stim_value: f64);
}

/// The human operator, who physically positions the photometer.
pub trait OperatorInterface {
    /// Blocks until the operator confirms the prompt (e.g. by pressing the
    /// photometer button). Returns an error only if confirmation is
    /// impossible (device gone, input closed).
    fn await_confirmation(&mut self, prompt: &str) -> AppResult<()>;
}

// =============================================================================
// Cancellation
// =============================================================================

/// Cooperative cancellation token checked at every search loop head.
///
/// The iteration budgets bound runtime on their own, but an unattended
/// neighborhood search with a large budget can run for a long while; this
/// token lets a supervising thread or signal handler stop it between
/// measurements.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    /// Creates a token in the not-cancelled state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation. Idempotent.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    /// Returns true once `cancel` has been called.
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }

    /// Returns `Err(CalibError::Cancelled)` once cancelled; used at loop
    /// heads with `?`.
    pub fn check(&self) -> AppResult<()> {
        if self.is_cancelled() {
            Err(CalibError::Cancelled)
        } else {
            Ok(())
        }
    }
}

// =============================================================================
// Measurement helper
// =============================================================================

/// Sets the tubes, waits the inter-measurement interval, and takes one
/// reading.
///
/// The settling delay gives the photometer time to adapt and reduces
/// carry-over between measurements. A failed trigger is logged and the
/// (possibly stale) reading is used as-is.
pub fn measure_once<A: ActuatorPort + ?Sized, M: MeasurementPort + ?Sized>(
    actuator: &mut A,
    photometer: &mut M,
    voltages: ControlVector,
    limits: &VoltageLimits,
    imi: Duration,
    with_spectrum: bool,
) -> MeasurementSample {
    let clamped = voltages.clamped(limits);
    actuator.set_control_vector(clamped);
    std::thread::sleep(imi);
    if let Err(e) = photometer.trigger_measurement() {
        log::warn!("Measurement failed for voltages {}: {}", clamped, e);
    }
    let color = photometer.read_tristimulus();
    let spectrum = with_spectrum.then(|| photometer.read_spectrum());
    MeasurementSample {
        voltages: clamped,
        color,
        spectrum,
    }
}
