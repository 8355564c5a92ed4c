//! Mock and simulated rigs for tests and dry runs.
//!
//! Three levels of fidelity:
//!
//! - [`FixedPhotometer`]: scripted readings, ignores the rig entirely. For
//!   exercising convergence and failure paths of the gradient matcher.
//! - [`LinearRigPhotometer`]: measured color is a simple deterministic
//!   function of the last control vector, shared with a [`CountingActuator`].
//!   For grid-search properties that need "measurement = f(voltages)".
//! - [`SimulatedLab`]: a full stand-in for the lab: tube response through a
//!   hidden curve parameter set, a monitor patch, optional Gaussian-ish
//!   measurement noise (`rand`), and an auto-confirming operator that
//!   repositions the simulated photometer based on the prompt text (prompts
//!   name TUBES or MONITOR, as the real ones do).

use std::cell::RefCell;
use std::rc::Rc;

use rand::Rng;

use crate::color::ColorTriple;
use crate::core::{
    ActuatorPort, ControlVector, MeasurementPort, MonitorPort, OperatorInterface, CHANNELS,
    SPECTRUM_SIZE,
};
use crate::curve::CurveParameterSet;
use crate::error::AppResult;

// =============================================================================
// Scripted photometer
// =============================================================================

/// A photometer returning scripted colors, independent of the rig.
#[derive(Debug, Clone)]
pub struct FixedPhotometer {
    base: ColorTriple,
    error: [f64; 3],
    decay: f64,
    /// Number of triggered measurements so far.
    pub trigger_count: usize,
}

impl FixedPhotometer {
    /// Always returns exactly `color`.
    pub fn new(color: ColorTriple) -> Self {
        Self {
            base: color,
            error: [0.0; 3],
            decay: 1.0,
            trigger_count: 0,
        }
    }

    /// Returns `base + error`, with the error multiplied by `decay` after
    /// every reading: a target that becomes reachable over time.
    pub fn decaying(base: ColorTriple, error: [f64; 3], decay: f64) -> Self {
        Self {
            base,
            error,
            decay,
            trigger_count: 0,
        }
    }
}

impl MeasurementPort for FixedPhotometer {
    fn trigger_measurement(&mut self) -> AppResult<()> {
        self.trigger_count += 1;
        Ok(())
    }

    fn read_tristimulus(&mut self) -> ColorTriple {
        let reading = self.base.shifted(self.error);
        for e in &mut self.error {
            *e *= self.decay;
        }
        reading
    }

    fn read_spectrum(&mut self) -> Vec<f64> {
        vec![0.0; SPECTRUM_SIZE]
    }
}

// =============================================================================
// Deterministic voltage-driven rig
// =============================================================================

type SharedVoltages = Rc<RefCell<ControlVector>>;

/// Actuator that records the last control vector and counts calls.
#[derive(Debug, Clone, Default)]
pub struct CountingActuator {
    /// Number of `set_control_vector` calls so far.
    pub set_count: usize,
    shared: SharedVoltages,
}

impl ActuatorPort for CountingActuator {
    fn set_control_vector(&mut self, voltages: ControlVector) {
        self.set_count += 1;
        *self.shared.borrow_mut() = voltages;
    }
}

/// Photometer whose reading is a fixed linear function of the control vector
/// last written by its paired [`CountingActuator`].
///
/// Red drives x, green drives y, and all channels contribute to Y, so
/// coordinate-wise search can localize each channel.
#[derive(Debug, Clone, Default)]
pub struct LinearRigPhotometer {
    shared: SharedVoltages,
    /// Number of triggered measurements so far.
    pub trigger_count: usize,
}

impl LinearRigPhotometer {
    /// Actuator sharing this photometer's rig state.
    pub fn actuator(&self) -> CountingActuator {
        CountingActuator {
            set_count: 0,
            shared: Rc::clone(&self.shared),
        }
    }

    /// The color this rig produces at `voltages`. Pure.
    pub fn color_for(&self, voltages: ControlVector) -> ColorTriple {
        let [r, g, b] = voltages.0;
        ColorTriple::new(
            0.20 + 3.0e-5 * r as f64,
            0.20 + 3.0e-5 * g as f64,
            0.01 * (r + g + b) as f64,
        )
    }
}

impl MeasurementPort for LinearRigPhotometer {
    fn trigger_measurement(&mut self) -> AppResult<()> {
        self.trigger_count += 1;
        Ok(())
    }

    fn read_tristimulus(&mut self) -> ColorTriple {
        let v = *self.shared.borrow();
        self.color_for(v)
    }

    fn read_spectrum(&mut self) -> Vec<f64> {
        vec![0.0; SPECTRUM_SIZE]
    }
}

// =============================================================================
// Simulated lab
// =============================================================================

/// What the simulated photometer is currently pointed at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pointing {
    Tubes,
    Monitor,
}

#[derive(Debug)]
struct LabState {
    voltages: ControlVector,
    monitor_value: f64,
    pointing: Pointing,
}

/// A software stand-in for the whole lab.
///
/// Constructed from the "true" tube response parameters; hands out the four
/// port implementations, all sharing one rig state. Single-threaded, like
/// the lab itself.
#[derive(Debug)]
pub struct SimulatedLab {
    state: Rc<RefCell<LabState>>,
    truth: CurveParameterSet,
    noise_sd: f64,
}

/// Chromaticity of each simulated tube channel (red, green, blue).
const CHANNEL_CHROMA: [(f64, f64); 3] = [(0.565, 0.350), (0.330, 0.550), (0.180, 0.130)];

impl SimulatedLab {
    /// Creates a simulated lab whose tubes follow `truth`, with optional
    /// per-component measurement noise (standard deviation on Y; scaled
    /// down for x and y).
    pub fn new(truth: CurveParameterSet, noise_sd: f64) -> Self {
        Self {
            state: Rc::new(RefCell::new(LabState {
                voltages: ControlVector::new(0xFFF, 0xFFF, 0xFFF),
                monitor_value: 0.0,
                pointing: Pointing::Tubes,
            })),
            truth,
            noise_sd,
        }
    }

    /// Actuator port for the simulated tubes.
    pub fn actuator(&self) -> SimActuator {
        SimActuator {
            state: Rc::clone(&self.state),
        }
    }

    /// Photometer port for the simulated rig.
    pub fn photometer(&self) -> SimPhotometer {
        SimPhotometer {
            state: Rc::clone(&self.state),
            truth: self.truth,
            noise_sd: self.noise_sd,
        }
    }

    /// Monitor port for the simulated stimulus display.
    pub fn monitor(&self) -> SimMonitor {
        SimMonitor {
            state: Rc::clone(&self.state),
        }
    }

    /// Operator that confirms immediately, repositioning the photometer
    /// according to the prompt.
    pub fn operator(&self) -> AutoOperator {
        AutoOperator {
            state: Rc::clone(&self.state),
        }
    }

    /// The noiseless color the simulated wall shows at `voltages`.
    pub fn wall_color(&self, voltages: ControlVector) -> ColorTriple {
        tube_color(&self.truth, voltages)
    }

    /// The noiseless color the simulated monitor shows for a patch value.
    pub fn monitor_color(patch_stim_value: f64) -> ColorTriple {
        monitor_color(patch_stim_value)
    }
}

fn tube_color(truth: &CurveParameterSet, voltages: ControlVector) -> ColorTriple {
    let mut total_y = 0.0;
    let mut x = 0.0;
    let mut y = 0.0;
    for channel in CHANNELS {
        let yc = truth
            .channel(channel)
            .evaluate(voltages.get(channel) as f64)
            .max(0.0);
        let (cx, cy) = CHANNEL_CHROMA[channel.index()];
        total_y += yc;
        x += cx * yc;
        y += cy * yc;
    }
    if total_y <= 0.0 {
        return ColorTriple::default();
    }
    ColorTriple::new(x / total_y, y / total_y, total_y)
}

fn monitor_color(patch_stim_value: f64) -> ColorTriple {
    // A gray-ish patch whose luminance scales with the nominal value. The
    // luminance range is chosen to lie within what the simulated tubes can
    // produce, so matching against it is meaningful.
    ColorTriple::new(
        0.305 + 0.01 * patch_stim_value,
        0.325,
        520.0 + 180.0 * patch_stim_value,
    )
}

/// Simulated tube actuator.
#[derive(Debug)]
pub struct SimActuator {
    state: Rc<RefCell<LabState>>,
}

impl ActuatorPort for SimActuator {
    fn set_control_vector(&mut self, voltages: ControlVector) {
        // The real driver ramps stepwise; the simulation jumps.
        self.state.borrow_mut().voltages = voltages;
    }
}

/// Simulated photometer.
#[derive(Debug)]
pub struct SimPhotometer {
    state: Rc<RefCell<LabState>>,
    truth: CurveParameterSet,
    noise_sd: f64,
}

impl SimPhotometer {
    fn noise(&self, scale: f64) -> f64 {
        if self.noise_sd == 0.0 {
            return 0.0;
        }
        // Sum of uniforms is close enough to Gaussian for simulation.
        let mut rng = rand::thread_rng();
        let u: f64 = (0..4).map(|_| rng.gen_range(-0.5..0.5)).sum();
        u * self.noise_sd * scale
    }
}

impl MeasurementPort for SimPhotometer {
    fn trigger_measurement(&mut self) -> AppResult<()> {
        Ok(())
    }

    fn read_tristimulus(&mut self) -> ColorTriple {
        let (pointing, voltages, monitor_value) = {
            let s = self.state.borrow();
            (s.pointing, s.voltages, s.monitor_value)
        };
        let clean = match pointing {
            Pointing::Tubes => tube_color(&self.truth, voltages),
            Pointing::Monitor => monitor_color(monitor_value),
        };
        ColorTriple::new(
            clean.x + self.noise(1e-4),
            clean.y + self.noise(1e-4),
            clean.yy + self.noise(1.0),
        )
    }

    fn read_spectrum(&mut self) -> Vec<f64> {
        let v = self.state.borrow().voltages;
        let base = tube_color(&self.truth, v).yy / SPECTRUM_SIZE as f64;
        (0..SPECTRUM_SIZE).map(|i| base + i as f64 * 1e-3).collect()
    }
}

/// Simulated stimulus monitor.
#[derive(Debug)]
pub struct SimMonitor {
    state: Rc<RefCell<LabState>>,
}

impl MonitorPort for SimMonitor {
    fn show_stimulus(&mut self, patch_stim_value: f64) {
        self.state.borrow_mut().monitor_value = patch_stim_value;
    }
}

/// Operator that confirms every prompt immediately.
///
/// Prompts that mention `TUBES` or `MONITOR` reposition the simulated
/// photometer, standing in for the human walking over and moving it.
#[derive(Debug)]
pub struct AutoOperator {
    state: Rc<RefCell<LabState>>,
}

impl OperatorInterface for AutoOperator {
    fn await_confirmation(&mut self, prompt: &str) -> AppResult<()> {
        log::debug!("operator prompt auto-confirmed: {prompt}");
        if prompt.contains("TUBES") {
            self.state.borrow_mut().pointing = Pointing::Tubes;
        } else if prompt.contains("MONITOR") {
            self.state.borrow_mut().pointing = Pointing::Monitor;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::curve::ChannelCurveParams;

    fn truth() -> CurveParameterSet {
        CurveParameterSet {
            red: ChannelCurveParams::new(278.04, -139.32, -6.60),
            green: ChannelCurveParams::new(272.88, -97.94, -6.85),
            blue: ChannelCurveParams::new(263.73, -187.05, -6.46),
        }
    }

    #[test]
    fn test_linear_rig_reads_last_set_voltages() {
        let mut photometer = LinearRigPhotometer::default();
        let mut actuator = photometer.actuator();
        actuator.set_control_vector(ControlVector::new(1000, 2000, 3000));
        let c = photometer.read_tristimulus();
        assert_eq!(c, photometer.color_for(ControlVector::new(1000, 2000, 3000)));
    }

    #[test]
    fn test_simulated_wall_brightens_with_voltage() {
        let lab = SimulatedLab::new(truth(), 0.0);
        let dim = lab.wall_color(ControlVector::new(0x500, 0x500, 0x500));
        let bright = lab.wall_color(ControlVector::new(0xF00, 0xF00, 0xF00));
        assert!(bright.yy > dim.yy);
    }

    #[test]
    fn test_operator_prompt_repositions_photometer() {
        let lab = SimulatedLab::new(truth(), 0.0);
        let mut operator = lab.operator();
        let mut photometer = lab.photometer();
        let mut monitor = lab.monitor();
        monitor.show_stimulus(0.5);

        operator
            .await_confirmation("Put the photometer in measurement position for the MONITOR.")
            .unwrap();
        let on_monitor = photometer.read_tristimulus();
        assert_eq!(on_monitor, monitor_color(0.5));

        operator
            .await_confirmation("Put the photometer in measurement position for the TUBES.")
            .unwrap();
        let on_tubes = photometer.read_tristimulus();
        assert_ne!(on_monitor, on_tubes);
    }

    #[test]
    fn test_noiseless_photometer_is_deterministic() {
        let lab = SimulatedLab::new(truth(), 0.0);
        let mut photometer = lab.photometer();
        let mut actuator = lab.actuator();
        actuator.set_control_vector(ControlVector::new(0x800, 0x900, 0xA00));
        let a = photometer.read_tristimulus();
        let b = photometer.read_tristimulus();
        assert_eq!(a, b);
    }
}
