//! Gradient-style iterative color matcher.
//!
//! Given a target xyY color, this search finds tube voltages whose measured
//! color lies within `epsilon` (weighted distance) of the target. It works in
//! color space: the commanded color starts at the target, and after every
//! measurement the command is shifted by a damped fraction of the remaining
//! error. The commanded color is turned into voltages through the fitted
//! response model on every iteration.
//!
//! # Sign convention
//!
//! The correction is `dilation · (target − measured)`, *added* to the
//! commanded color. The response curve is monotone increasing in commanded
//! intensity (decay toward the asymptote from below), so a measurement that
//! comes out low must push the command up. The dilation factor in (0, 1]
//! damps the correction to avoid overshoot and oscillation.
//!
//! # Failure semantics
//!
//! A device error during a measurement is logged and the stale sample is used
//! as-is for that iteration; the search never retries and never panics. When
//! the iteration budget is exhausted the search reports
//! [`MatchOutcome::NotConverged`] carrying the last sample. Failure is a
//! value the caller must inspect, not an exception.

use std::time::Duration;

use crate::color::ColorTriple;
use crate::config::SearchSettings;
use crate::core::{
    measure_once, ActuatorPort, CancelToken, ControlVector, MeasurementPort, MeasurementSample,
};
use crate::curve::TubeCurveModel;
use crate::error::AppResult;

/// Result of a gradient match: statically distinguishable success/failure.
#[derive(Debug, Clone, PartialEq)]
pub enum MatchOutcome {
    /// The measured color came within epsilon of the target.
    Converged {
        /// Voltages corresponding to the final commanded color.
        voltages: ControlVector,
        /// The last measured color.
        color: ColorTriple,
    },
    /// The iteration budget ran out before reaching epsilon.
    NotConverged {
        /// The last sample taken, for diagnosis. `None` if no measurement
        /// happened at all (budget of zero).
        last: Option<MeasurementSample>,
    },
}

impl MatchOutcome {
    /// True for the converged variant.
    pub fn is_converged(&self) -> bool {
        matches!(self, MatchOutcome::Converged { .. })
    }
}

/// The gradient-style iterative matcher.
#[derive(Debug, Clone)]
pub struct ColorMatchSearch {
    /// Weighted-distance threshold for convergence.
    pub epsilon: f64,
    /// Damping factor applied to each correction, in (0, 1].
    pub dilation: f64,
    /// Settling delay between setting voltages and trusting a measurement.
    pub imi: Duration,
    /// Iteration budget.
    pub max_iterations: usize,
    /// Down-weighting of luminance in the match distance.
    pub luminance_weight: f64,
}

impl ColorMatchSearch {
    /// Builds the search from configuration.
    pub fn from_settings(settings: &SearchSettings) -> Self {
        Self {
            epsilon: settings.epsilon,
            dilation: settings.dilation,
            imi: settings.imi,
            max_iterations: settings.max_iterations,
            luminance_weight: settings.luminance_weight,
        }
    }

    /// Runs the matcher against the rig.
    ///
    /// Returns `Err` only for conditions that stop the search outright
    /// (uncalibrated model, cancellation); non-convergence is reported
    /// through [`MatchOutcome`].
    pub fn run<A, M>(
        &self,
        model: &TubeCurveModel,
        actuator: &mut A,
        photometer: &mut M,
        target: &ColorTriple,
        cancel: &CancelToken,
    ) -> AppResult<MatchOutcome>
    where
        A: ActuatorPort + ?Sized,
        M: MeasurementPort + ?Sized,
    {
        let mut input_color = *target;
        // Sentinel so the loop body always executes at least once.
        let mut diff = [f64::INFINITY; 3];
        let mut last: Option<MeasurementSample> = None;
        let mut iteration = 0usize;

        log::info!("Color match target: {}", target);

        while ColorTriple::new(diff[0], diff[1], diff[2]).weighted_norm(self.luminance_weight)
            > self.epsilon
        {
            if iteration == self.max_iterations {
                log::warn!(
                    "Color match for {} not converged after {} iterations",
                    target,
                    self.max_iterations
                );
                return Ok(MatchOutcome::NotConverged { last });
            }
            cancel.check()?;

            let voltages = model.control_guess(&input_color)?;
            let sample = measure_once(
                actuator,
                photometer,
                voltages,
                model.limits(),
                self.imi,
                false,
            );
            let measured = sample.color;
            log::debug!(
                "iteration {}: commanded {} measured {}",
                iteration,
                input_color,
                measured
            );
            last = Some(sample);

            let raw = measured.diff(target);
            diff = [
                self.dilation * raw[0],
                self.dilation * raw[1],
                self.dilation * raw[2],
            ];
            input_color = input_color.shifted(diff);
            iteration += 1;
        }

        // The loop exits only after at least one measurement, so `last` is
        // populated here.
        let color = last.map(|s| s.color).unwrap_or_default();
        let voltages = model.control_guess(&input_color)?;
        log::info!(
            "Color match converged after {} iterations: {} measured {}",
            iteration,
            voltages,
            color
        );
        Ok(MatchOutcome::Converged { voltages, color })
    }
}
