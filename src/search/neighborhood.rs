//! Coordinate-wise neighborhood tuning search.
//!
//! The robust matcher of the two: it operates directly in control-vector
//! space and never trusts the response model beyond the starting point. Each
//! outer round works one channel at a time:
//!
//! 1. Holding the other two channels at the current best, measure a coarse
//!    series of `series_quantity` samples stepped by `stepsize` and centered
//!    on the current value.
//! 2. Persist the series to the diagnostics sink (this search has no
//!    convergence proof, so its raw data must be inspectable offline).
//! 3. Pick the series sample closest to the target (weighted distance) as
//!    the channel's coarse best.
//! 4. Re-measure at every integer control step within ±stepsize/2 of the
//!    coarse best (the fine pass).
//!
//! The fine passes of all three channels are pooled and the single globally
//! closest sample becomes the new current best. After the fixed number of
//! rounds the best sample found is returned. The result is always a sample
//! that was actually measured, never an interpolated or extrapolated value,
//! and it is reported as *final*, not as converged: the iteration budget is
//! the only termination condition and callers must not assume optimality.

use std::time::Duration;

use crate::color::ColorTriple;
use crate::config::TuningSettings;
use crate::core::{
    measure_once, ActuatorPort, CancelToken, Channel, ControlVector, MeasurementPort,
    MeasurementSample, VoltageLimits, CHANNELS,
};
use crate::error::AppResult;
use crate::storage::SeriesSink;

/// The best sample found by a tuning run. Always an actually measured point.
#[derive(Debug, Clone, PartialEq)]
pub struct TuningResult {
    /// Control vector of the best sample.
    pub voltages: ControlVector,
    /// Color measured at those voltages.
    pub color: ColorTriple,
    /// Weighted distance of that color to the target.
    pub distance: f64,
}

/// The coordinate-wise grid/neighborhood matcher.
#[derive(Debug, Clone)]
pub struct NeighborhoodTuningSearch {
    /// Fixed number of outer rounds; the only termination condition.
    pub iterations: usize,
    /// Coarse samples per channel per round.
    pub series_quantity: usize,
    /// Control-value step between coarse samples; also the span of the fine
    /// pass.
    pub stepsize: i32,
    /// Settling delay between measurements.
    pub imi: Duration,
    /// Down-weighting of luminance in the match distance.
    pub luminance_weight: f64,
}

impl NeighborhoodTuningSearch {
    /// Builds the search from configuration.
    pub fn from_settings(settings: &TuningSettings, luminance_weight: f64) -> Self {
        Self {
            iterations: settings.iterations,
            series_quantity: settings.series_quantity,
            stepsize: settings.stepsize,
            imi: settings.imi,
            luminance_weight,
        }
    }

    /// Runs the tuning search starting from `start_voltages`.
    #[allow(clippy::too_many_arguments)]
    pub fn run<A, M>(
        &self,
        actuator: &mut A,
        photometer: &mut M,
        limits: &VoltageLimits,
        target: &ColorTriple,
        start_voltages: ControlVector,
        sink: &mut dyn SeriesSink,
        cancel: &CancelToken,
    ) -> AppResult<TuningResult>
    where
        A: ActuatorPort + ?Sized,
        M: MeasurementPort + ?Sized,
    {
        log::info!(
            "Tuning toward {} from {} ({} rounds)",
            target,
            start_voltages,
            self.iterations
        );
        let mut current = start_voltages;
        let mut best: Option<MeasurementSample> = None;

        for round in 1..=self.iterations {
            cancel.check()?;
            let mut fine_pool: Vec<MeasurementSample> = Vec::new();

            for channel in CHANNELS {
                cancel.check()?;
                let series =
                    self.measurement_series(actuator, photometer, limits, current, channel);
                let label = format!(
                    "tune_x{:.3}y{:.3}Y{:.1}_iteration{}_ch{}",
                    target.x,
                    target.y,
                    target.yy,
                    round,
                    channel.name()
                );
                sink.record_series(&label, &series)?;

                let Some(coarse_best) = self.best_sample(&series, target) else {
                    continue;
                };
                let fine = self.measure_around(
                    actuator,
                    photometer,
                    limits,
                    coarse_best.voltages,
                    channel,
                    self.stepsize,
                    1,
                );
                fine_pool.extend(fine);
            }

            if let Some(round_best) = self.best_sample(&fine_pool, target) {
                current = round_best.voltages;
                log::info!(
                    "round {}: best {} measured {} (distance {:.4})",
                    round,
                    round_best.voltages,
                    round_best.color,
                    round_best.color.distance_to(target, self.luminance_weight)
                );
                best = Some(round_best.clone());
            }
        }

        let Some(best) = best else {
            // Zero rounds or zero-size series: nothing was ever measured.
            return Ok(TuningResult {
                voltages: current,
                color: ColorTriple::default(),
                distance: f64::INFINITY,
            });
        };
        let distance = best.color.distance_to(target, self.luminance_weight);
        log::info!(
            "Final voltages after {} rounds: {} (distance {:.4})",
            self.iterations,
            best.voltages,
            distance
        );
        Ok(TuningResult {
            voltages: best.voltages,
            color: best.color,
            distance,
        })
    }

    /// Measures the coarse series for one channel: `series_quantity` samples
    /// stepped by `stepsize`, centered on `center`, with the other channels
    /// held fixed.
    pub fn measurement_series<A, M>(
        &self,
        actuator: &mut A,
        photometer: &mut M,
        limits: &VoltageLimits,
        center: ControlVector,
        channel: Channel,
    ) -> Vec<MeasurementSample>
    where
        A: ActuatorPort + ?Sized,
        M: MeasurementPort + ?Sized,
    {
        let start =
            center.get(channel) - (0.5 * self.series_quantity as f64 * self.stepsize as f64) as i32;
        (0..self.series_quantity)
            .map(|i| {
                let v = center.with_channel(channel, start + i as i32 * self.stepsize);
                measure_once(actuator, photometer, v, limits, self.imi, false)
            })
            .collect()
    }

    /// Fine pass: measures at every `stepsize`-spaced control step within
    /// ±span/2 of `around` on the given channel, `span + 1` samples in total.
    pub fn measure_around<A, M>(
        &self,
        actuator: &mut A,
        photometer: &mut M,
        limits: &VoltageLimits,
        around: ControlVector,
        channel: Channel,
        span: i32,
        stepsize: i32,
    ) -> Vec<MeasurementSample>
    where
        A: ActuatorPort + ?Sized,
        M: MeasurementPort + ?Sized,
    {
        let start = around.get(channel) - (0.5 * span as f64 * stepsize as f64) as i32;
        (0..=span)
            .map(|i| {
                let v = around.with_channel(channel, start + i * stepsize);
                measure_once(actuator, photometer, v, limits, self.imi, false)
            })
            .collect()
    }

    /// The sample closest to the target by weighted distance, if any.
    fn best_sample<'a>(
        &self,
        samples: &'a [MeasurementSample],
        target: &ColorTriple,
    ) -> Option<&'a MeasurementSample> {
        samples.iter().min_by(|a, b| {
            let da = a.color.distance_to(target, self.luminance_weight);
            let db = b.color.distance_to(target, self.luminance_weight);
            da.partial_cmp(&db).unwrap_or(std::cmp::Ordering::Equal)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock::{CountingActuator, LinearRigPhotometer};
    use crate::storage::NullSeriesSink;

    fn search(iterations: usize) -> NeighborhoodTuningSearch {
        NeighborhoodTuningSearch {
            iterations,
            series_quantity: 20,
            stepsize: 10,
            imi: Duration::ZERO,
            luminance_weight: 0.01,
        }
    }

    #[test]
    fn test_measure_around_sample_layout() {
        // span=10, stepsize=1 around (1000, 1000, 1000) on red: exactly 11
        // samples with red voltages 995..=1005, other channels untouched.
        // Limits must admit the whole window or clamping collapses it onto
        // the low rail.
        let mut photometer = LinearRigPhotometer::default();
        let mut actuator = photometer.actuator();
        let limits = VoltageLimits { low: 0, high: 0xFFF };
        let samples = search(1).measure_around(
            &mut actuator,
            &mut photometer,
            &limits,
            ControlVector::new(1000, 1000, 1000),
            Channel::Red,
            10,
            1,
        );
        assert_eq!(samples.len(), 11);
        for (i, s) in samples.iter().enumerate() {
            assert_eq!(s.voltages.get(Channel::Red), 995 + i as i32);
            assert_eq!(s.voltages.get(Channel::Green), 1000);
            assert_eq!(s.voltages.get(Channel::Blue), 1000);
        }
    }

    #[test]
    fn test_measure_around_clamps_window_below_low_rail() {
        // Under the device defaults (low = 0x400) a fine pass centered at
        // 1000 lies entirely below the low threshold: every sample clamps to
        // the rail instead of walking 995..=1005.
        let mut photometer = LinearRigPhotometer::default();
        let mut actuator = photometer.actuator();
        let limits = VoltageLimits::default();
        let samples = search(1).measure_around(
            &mut actuator,
            &mut photometer,
            &limits,
            ControlVector::new(1000, 1000, 1000),
            Channel::Red,
            10,
            1,
        );
        assert_eq!(samples.len(), 11);
        for s in &samples {
            assert_eq!(s.voltages.get(Channel::Red), limits.low);
        }
    }

    #[test]
    fn test_series_is_centered_on_current() {
        let mut photometer = LinearRigPhotometer::default();
        let mut actuator = photometer.actuator();
        let limits = VoltageLimits::default();
        let s = search(1);
        let series = s.measurement_series(
            &mut actuator,
            &mut photometer,
            &limits,
            ControlVector::new(2000, 2000, 2000),
            Channel::Green,
        );
        assert_eq!(series.len(), 20);
        // Offsets -100..=+90 in steps of 10 around the center.
        assert_eq!(series[0].voltages.get(Channel::Green), 1900);
        assert_eq!(series[10].voltages.get(Channel::Green), 2000);
        assert_eq!(series[19].voltages.get(Channel::Green), 2090);
    }

    #[test]
    fn test_distance_is_non_increasing_across_rounds() {
        // Deterministic rig: measured color is a known function of the
        // control vector, so each round's pooled best can only improve on the
        // previous best (which is re-measured identically at offset 0).
        let limits = VoltageLimits::default();
        let mut photometer = LinearRigPhotometer::default();
        let mut actuator = photometer.actuator();
        let target = photometer.color_for(ControlVector::new(2222, 2222, 2222));
        let start = ControlVector::new(2000, 2000, 2000);
        let token = CancelToken::new();

        let mut previous = f64::INFINITY;
        for rounds in 1..=3 {
            let mut sink = NullSeriesSink;
            let result = search(rounds)
                .run(
                    &mut actuator,
                    &mut photometer,
                    &limits,
                    &target,
                    start,
                    &mut sink,
                    &token,
                )
                .unwrap();
            assert!(
                result.distance <= previous + 1e-12,
                "round {rounds}: {} > {previous}",
                result.distance
            );
            previous = result.distance;
        }
    }

    #[test]
    fn test_result_is_a_measured_sample() {
        let limits = VoltageLimits::default();
        let mut photometer = LinearRigPhotometer::default();
        let mut actuator = photometer.actuator();
        let target = photometer.color_for(ControlVector::new(2100, 2050, 1980));
        let mut sink = NullSeriesSink;

        let result = search(2)
            .run(
                &mut actuator,
                &mut photometer,
                &limits,
                &target,
                ControlVector::new(2000, 2000, 2000),
                &mut sink,
                &CancelToken::new(),
            )
            .unwrap();

        // The reported color must be exactly what the rig produces at the
        // reported voltages: no interpolation.
        assert_eq!(result.color, photometer.color_for(result.voltages));
    }
}
