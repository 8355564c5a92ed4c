//! Calibration orchestration: tubes sweep, then the color table.
//!
//! [`Calibrator`] owns the sequencing of a full calibration session. It does
//! two jobs:
//!
//! - [`Calibrator::calibrate_tubes`]: sweep each tube channel across its
//!   voltage range (the operator switches the other tubes off between
//!   sweeps), persist the raw sweep, and fit the response model. The raw
//!   data is on disk *before* fitting starts, so a failed fit never costs
//!   the measurement run.
//! - [`Calibrator::calibrate_table`]: for every named color entry, measure
//!   the monitor color, resolve tube voltages with the gradient matcher,
//!   refine them with the neighborhood search against the measured monitor
//!   color (the actual goal: make the wall match the monitor), and
//!   re-measure the tubes at the final voltages.
//!
//! The table procedure is a non-branching pipeline per entry with one hard
//! gate: if the tube model is not calibrated, nothing is measured at all. A
//! stage failure (the gradient matcher not converging) leaves the entry with
//! whatever fields earlier stages filled in (partial state stays visible,
//! there is no rollback) and the orchestrator moves on to the next entry.

use crate::color::{mean_and_population_variance, ColorTriple};
use crate::config::Settings;
use crate::core::{
    measure_once, ActuatorPort, CancelToken, Channel, ControlVector, MeasurementPort,
    MeasurementSample, MonitorPort, OperatorInterface, VoltageLimits, CHANNELS,
};
use crate::curve::{default_start, ChannelCurveParams, CurveFitter, CurveParameterSet, TubeCurveModel};
use crate::error::{AppResult, CalibError};
use crate::search::{ColorMatchSearch, MatchOutcome, NeighborhoodTuningSearch};
use crate::storage::SeriesSink;
use crate::table::ColorTable;

/// Sequences tube calibration and color-table calibration over the injected
/// ports. Exactly one search routine is active at a time; the ports are
/// exclusively borrowed for the whole session.
pub struct Calibrator<'a> {
    model: &'a mut TubeCurveModel,
    actuator: &'a mut dyn ActuatorPort,
    photometer: &'a mut dyn MeasurementPort,
    monitor: &'a mut dyn MonitorPort,
    operator: &'a mut dyn OperatorInterface,
    sink: &'a mut dyn SeriesSink,
    settings: &'a Settings,
    cancel: CancelToken,
}

impl<'a> Calibrator<'a> {
    /// Wires up a calibration session.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        model: &'a mut TubeCurveModel,
        actuator: &'a mut dyn ActuatorPort,
        photometer: &'a mut dyn MeasurementPort,
        monitor: &'a mut dyn MonitorPort,
        operator: &'a mut dyn OperatorInterface,
        sink: &'a mut dyn SeriesSink,
        settings: &'a Settings,
        cancel: CancelToken,
    ) -> Self {
        Self {
            model,
            actuator,
            photometer,
            monitor,
            operator,
            sink,
            settings,
            cancel,
        }
    }

    // =========================================================================
    // Tube calibration (sweep + fit)
    // =========================================================================

    /// Sweeps all three channels, persists the raw data, fits the response
    /// model, and saves the fitted parameters.
    ///
    /// On fit failure the error is returned and the model stays
    /// uncalibrated, but every sweep series is already on disk for offline
    /// refitting.
    pub fn calibrate_tubes(&mut self, fitter: &dyn CurveFitter) -> AppResult<()> {
        let limits = *self.model.limits();
        let all_max = ControlVector::new(limits.high, limits.high, limits.high);

        self.operator.await_confirmation(
            "Please put the photometer in measurement position for the TUBES \
             and confirm to start the calibration sweep.",
        )?;

        let mut sweeps: Vec<Vec<(f64, f64)>> = Vec::with_capacity(3);
        for channel in CHANNELS {
            self.cancel.check()?;
            let others: Vec<&str> = CHANNELS
                .iter()
                .filter(|c| **c != channel)
                .map(|c| c.name())
                .collect();
            self.operator.await_confirmation(&format!(
                "Turn off the {} and {} tubes! Confirm to start the sweep of the {} tubes.",
                others[0],
                others[1],
                channel.name()
            ))?;

            let samples = self.sweep_channel(channel, all_max, &limits)?;
            let label = format!("calibration_tubes_raw_ch{}", channel.name());
            self.sink.record_series(&label, &samples)?;
            sweeps.push(
                samples
                    .iter()
                    .map(|s| (s.voltages.get(channel) as f64, s.color.yy))
                    .collect(),
            );
        }

        // Signal the end of the sweep before the (fast) fitting step.
        self.actuator
            .set_control_vector(ControlVector::new(limits.low, limits.low, limits.low));

        let mut fitted: Vec<ChannelCurveParams> = Vec::with_capacity(3);
        for channel in CHANNELS {
            match fitter.fit(&sweeps[channel.index()], default_start(channel)) {
                Ok(p) => {
                    log::info!(
                        "{} channel fitted: p1={:.3} p2={:.3} p3={:.3}",
                        channel,
                        p.p1,
                        p.p2,
                        p.p3
                    );
                    fitted.push(p);
                }
                Err(e) => {
                    log::error!(
                        "FAILED to estimate parameters of the {} tubes: {}. \
                         The raw sweep series are on disk for offline refitting.",
                        channel,
                        e
                    );
                    return Err(e);
                }
            }
        }

        self.model.set_params(CurveParameterSet {
            red: fitted[0],
            green: fitted[1],
            blue: fitted[2],
        });
        if let Some(parent) = self.settings.tubes.parameter_file.parent() {
            std::fs::create_dir_all(parent)?;
        }
        self.model.save_params(&self.settings.tubes.parameter_file)?;
        log::info!("Calibration of tubes finished.");
        Ok(())
    }

    /// One channel's sweep: low→high threshold in `sweep_steps` steps, the
    /// other channels held at maximum, `each` readings per step, spectrum
    /// included.
    fn sweep_channel(
        &mut self,
        channel: Channel,
        hold: ControlVector,
        limits: &VoltageLimits,
    ) -> AppResult<Vec<MeasurementSample>> {
        let n = self.settings.measurement.sweep_steps;
        // Settings::validate covers the load path; hand-built settings can
        // still reach here with a step count that would divide by zero.
        if n < 2 {
            return Err(CalibError::Configuration(
                "measurement.sweep_steps must be at least 2".to_string(),
            ));
        }
        let step = (limits.high - limits.low) / (n as i32 - 1);
        let mut samples = Vec::with_capacity(n * self.settings.measurement.each);
        for i in 0..n {
            self.cancel.check()?;
            let v = hold.with_channel(channel, limits.low + step * i as i32);
            for _ in 0..self.settings.measurement.each {
                samples.push(measure_once(
                    self.actuator,
                    self.photometer,
                    v,
                    limits,
                    self.settings.measurement.imi,
                    true,
                ));
            }
        }
        Ok(samples)
    }

    // =========================================================================
    // Color-table calibration
    // =========================================================================

    /// Calibrates every entry of the table in place.
    ///
    /// Hard precondition: the tube model must be calibrated. Per-entry stage
    /// failures are logged and leave partial fields; they do not abort the
    /// table run.
    pub fn calibrate_table(&mut self, table: &mut ColorTable) -> AppResult<()> {
        if !self.model.is_calibrated() {
            return Err(CalibError::NotCalibrated(
                "please calibrate the tubes first, or load a saved parameter file".to_string(),
            ));
        }

        let search = ColorMatchSearch::from_settings(&self.settings.search);
        let tuning = NeighborhoodTuningSearch::from_settings(
            &self.settings.tuning,
            self.settings.search.luminance_weight,
        );
        let n = self.settings.measurement.repeats;

        for i in 0..table.len() {
            self.cancel.check()?;
            let (name, patch_stim_value, previous_voltages) = {
                let e = &table.entries()[i];
                (e.name.clone(), e.patch_stim_value, e.voltages)
            };
            log::info!("Calibrating color entry '{}'", name);

            // Stage A: monitor measurement.
            self.operator.await_confirmation(&format!(
                "Please put the photometer in measurement position for the MONITOR \
                 and confirm to measure '{}'.",
                name
            ))?;
            self.monitor.show_stimulus(patch_stim_value);
            let readings = self.repeat_monitor_readings(n);
            let Some((mean, var)) = mean_and_population_variance(&readings) else {
                log::warn!("no monitor readings for '{}'; skipping entry", name);
                continue;
            };
            {
                let e = &mut table.entries_mut()[i];
                e.monitor_xyy = Some(mean);
                e.monitor_xyy_sd = Some(var);
            }

            // Stage B: coarse voltage resolution against the monitor color.
            self.operator.await_confirmation(
                "Please put the photometer in measurement position for the TUBES and confirm.",
            )?;
            let coarse = search.run(
                self.model,
                self.actuator,
                self.photometer,
                &mean,
                &self.cancel,
            )?;
            let seed = match coarse {
                MatchOutcome::Converged { voltages, color } => {
                    let e = &mut table.entries_mut()[i];
                    e.voltages = Some(voltages);
                    e.tubes_xyy = Some(color);
                    voltages
                }
                MatchOutcome::NotConverged { ref last } => {
                    log::warn!(
                        "coarse match for '{}' did not converge; seeding fine tuning from {}",
                        name,
                        last.as_ref()
                            .map(|s| s.voltages.to_string())
                            .unwrap_or_else(|| "model guess".to_string())
                    );
                    match last {
                        Some(s) => s.voltages,
                        None => match previous_voltages {
                            Some(v) => v,
                            None => self.model.control_guess(&mean)?,
                        },
                    }
                }
            };

            // Stage C: fine tuning toward the measured monitor color.
            let refined = tuning.run(
                self.actuator,
                self.photometer,
                self.model.limits(),
                &mean,
                seed,
                self.sink,
                &self.cancel,
            )?;
            table.entries_mut()[i].voltages = Some(refined.voltages);

            // Stage D: repeat measurement at the final voltages.
            let tube_readings = self.repeat_tube_readings(refined.voltages, n);
            if let Some((tube_mean, tube_var)) = mean_and_population_variance(&tube_readings) {
                let e = &mut table.entries_mut()[i];
                e.tubes_xyy = Some(tube_mean);
                e.tubes_xyy_sd = Some(tube_var);
            }
            log::info!(
                "entry '{}' calibrated: voltages {} (distance {:.4})",
                name,
                refined.voltages,
                refined.distance
            );
        }
        Ok(())
    }

    /// Takes `n` photometer readings of whatever the photometer points at,
    /// with the configured settling interval between them.
    fn repeat_monitor_readings(&mut self, n: usize) -> Vec<ColorTriple> {
        let imi = self.settings.measurement.imi;
        (0..n)
            .map(|_| {
                std::thread::sleep(imi);
                if let Err(e) = self.photometer.trigger_measurement() {
                    log::warn!("monitor measurement failed: {}", e);
                }
                self.photometer.read_tristimulus()
            })
            .collect()
    }

    /// Takes `n` tube readings at fixed voltages.
    fn repeat_tube_readings(&mut self, voltages: ControlVector, n: usize) -> Vec<ColorTriple> {
        let limits = *self.model.limits();
        let imi = self.settings.measurement.imi;
        (0..n)
            .map(|_| {
                measure_once(
                    self.actuator,
                    self.photometer,
                    voltages,
                    &limits,
                    imi,
                    false,
                )
                .color
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::hardware::mock::{CountingActuator, FixedPhotometer, LinearRigPhotometer};
    use crate::storage::NullSeriesSink;
    use crate::table::ColorEntry;

    struct NoopMonitor;
    impl MonitorPort for NoopMonitor {
        fn show_stimulus(&mut self, _v: f64) {}
    }

    struct NoopOperator;
    impl OperatorInterface for NoopOperator {
        fn await_confirmation(&mut self, _prompt: &str) -> AppResult<()> {
            Ok(())
        }
    }

    fn close(a: &ColorTriple, b: &ColorTriple) -> bool {
        (a.x - b.x).abs() < 1e-9 && (a.y - b.y).abs() < 1e-9 && (a.yy - b.yy).abs() < 1e-6
    }

    fn fast_settings() -> Settings {
        let mut s = Settings::default();
        s.search.imi = Duration::ZERO;
        s.search.max_iterations = 3;
        s.tuning.imi = Duration::ZERO;
        s.tuning.iterations = 1;
        s.measurement.imi = Duration::ZERO;
        s.measurement.repeats = 3;
        s
    }

    #[test]
    fn test_uncalibrated_model_aborts_before_any_measurement() {
        let mut model = TubeCurveModel::uncalibrated(VoltageLimits::default());
        let mut photometer = FixedPhotometer::new(ColorTriple::new(0.3, 0.3, 40.0));
        let mut actuator = CountingActuator::default();
        let mut monitor = NoopMonitor;
        let mut operator = NoopOperator;
        let mut sink = NullSeriesSink;
        let settings = fast_settings();
        let mut table = ColorTable::new();
        table.push(ColorEntry::new("c1", 0.5));

        let mut calibrator = Calibrator::new(
            &mut model,
            &mut actuator,
            &mut photometer,
            &mut monitor,
            &mut operator,
            &mut sink,
            &settings,
            CancelToken::new(),
        );
        let err = calibrator.calibrate_table(&mut table).unwrap_err();
        assert!(matches!(err, CalibError::NotCalibrated(_)));
        assert_eq!(photometer.trigger_count, 0);
        assert_eq!(actuator.set_count, 0);
        assert!(table.entries()[0].monitor_xyy.is_none());
    }

    #[test]
    fn test_tube_sweep_rejects_single_step_settings() {
        // sweep_steps = 1 would make the step width division degenerate;
        // hand-built settings bypass Settings::validate, so the sweep has to
        // reject them itself.
        let mut model = TubeCurveModel::uncalibrated(VoltageLimits::default());
        let mut photometer = FixedPhotometer::new(ColorTriple::new(0.3, 0.3, 40.0));
        let mut actuator = CountingActuator::default();
        let mut monitor = NoopMonitor;
        let mut operator = NoopOperator;
        let mut sink = NullSeriesSink;
        let mut settings = fast_settings();
        settings.measurement.sweep_steps = 1;

        let mut calibrator = Calibrator::new(
            &mut model,
            &mut actuator,
            &mut photometer,
            &mut monitor,
            &mut operator,
            &mut sink,
            &settings,
            CancelToken::new(),
        );
        let fitter = crate::curve::LevenbergMarquardtFitter::default();
        let err = calibrator.calibrate_tubes(&fitter).unwrap_err();
        assert!(matches!(err, CalibError::Configuration(_)));
        assert_eq!(photometer.trigger_count, 0);
    }

    /// Returns one color for the first `switch_after` readings (the monitor
    /// stage) and a different one afterwards, so the coarse matcher can
    /// never close the gap.
    struct SplitPhotometer {
        monitor: ColorTriple,
        tubes: ColorTriple,
        switch_after: usize,
        reads: usize,
    }

    impl MeasurementPort for SplitPhotometer {
        fn trigger_measurement(&mut self) -> AppResult<()> {
            Ok(())
        }
        fn read_tristimulus(&mut self) -> ColorTriple {
            self.reads += 1;
            if self.reads <= self.switch_after {
                self.monitor
            } else {
                self.tubes
            }
        }
        fn read_spectrum(&mut self) -> Vec<f64> {
            Vec::new()
        }
    }

    #[test]
    fn test_coarse_failure_leaves_partial_entry_visible() {
        // The tubes never measure anything near the monitor color, so the
        // coarse matcher exhausts its budget; Stage A results must survive
        // and the later stages still run from the fallback seed.
        let monitor_color = ColorTriple::new(0.30, 0.30, 40.0);
        let tube_color = ColorTriple::new(0.40, 0.40, 80.0);
        let mut model = TubeCurveModel::from_params(
            CurveParameterSet {
                red: ChannelCurveParams::new(278.04, -139.32, -6.60),
                green: ChannelCurveParams::new(272.88, -97.94, -6.85),
                blue: ChannelCurveParams::new(263.73, -187.05, -6.46),
            },
            VoltageLimits::default(),
        );
        let mut photometer = SplitPhotometer {
            monitor: monitor_color,
            tubes: tube_color,
            switch_after: 3,
            reads: 0,
        };
        let mut actuator = CountingActuator::default();
        let mut monitor = NoopMonitor;
        let mut operator = NoopOperator;
        let mut sink = NullSeriesSink;
        let settings = fast_settings();
        let mut table = ColorTable::new();
        table.push(ColorEntry::new("c1", 0.5));

        let mut calibrator = Calibrator::new(
            &mut model,
            &mut actuator,
            &mut photometer,
            &mut monitor,
            &mut operator,
            &mut sink,
            &settings,
            CancelToken::new(),
        );
        calibrator.calibrate_table(&mut table).unwrap();

        let e = &table.entries()[0];
        // Stage A succeeded: the monitor color with (numerically) zero
        // variance.
        let mean = e.monitor_xyy.expect("monitor mean");
        assert!(close(&mean, &monitor_color), "{mean} vs {monitor_color}");
        let sd = e.monitor_xyy_sd.expect("monitor variance");
        assert!(sd.x < 1e-20 && sd.y < 1e-20 && sd.yy < 1e-20);
        // The later stages still ran from the fallback seed, so voltages
        // exist and the tube color is what the tubes actually measure.
        assert!(e.voltages.is_some());
        let tube_mean = e.tubes_xyy.expect("tube mean");
        assert!(close(&tube_mean, &tube_color), "{tube_mean} vs {tube_color}");
    }

    #[test]
    fn test_table_run_populates_entries_with_linear_rig() {
        let mut photometer = LinearRigPhotometer::default();
        let mut actuator = photometer.actuator();
        let mut model = TubeCurveModel::from_params(
            CurveParameterSet {
                red: ChannelCurveParams::new(278.04, -139.32, -6.60),
                green: ChannelCurveParams::new(272.88, -97.94, -6.85),
                blue: ChannelCurveParams::new(263.73, -187.05, -6.46),
            },
            VoltageLimits::default(),
        );
        let mut monitor = NoopMonitor;
        let mut operator = NoopOperator;
        let mut sink = NullSeriesSink;
        let settings = fast_settings();
        let mut table = ColorTable::new();
        table.push(ColorEntry::new("c1", 0.25));
        table.push(ColorEntry::new("c2", 0.75));

        let mut calibrator = Calibrator::new(
            &mut model,
            &mut actuator,
            &mut photometer,
            &mut monitor,
            &mut operator,
            &mut sink,
            &settings,
            CancelToken::new(),
        );
        calibrator.calibrate_table(&mut table).unwrap();

        for e in table.entries() {
            assert!(e.monitor_xyy.is_some(), "{} lacks monitor color", e.name);
            assert!(e.voltages.is_some(), "{} lacks voltages", e.name);
            assert!(e.tubes_xyy.is_some(), "{} lacks tube color", e.name);
            let v = e.voltages.unwrap();
            for channel in CHANNELS {
                assert!(model.limits().contains(v.get(channel)));
            }
        }
    }
}
