//! Configuration loading for the calibration engine.
//!
//! Settings come from a TOML file (`config/default.toml` by default) with
//! environment-variable overrides prefixed `COLORLAB_` (double underscore as
//! the section separator, e.g. `COLORLAB_SEARCH__EPSILON=0.02`). Every field
//! has a default matching the values the lab has run with for years, so an
//! empty configuration is valid and the mock/simulation paths work out of
//! the box.

use std::path::PathBuf;
use std::time::Duration;

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};

use crate::core::VoltageLimits;
use crate::error::{AppResult, CalibError};

/// Top-level settings for the engine.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    /// Tube rig limits and parameter persistence.
    #[serde(default)]
    pub tubes: TubeSettings,
    /// Gradient matcher tunables.
    #[serde(default)]
    pub search: SearchSettings,
    /// Neighborhood tuning tunables.
    #[serde(default)]
    pub tuning: TuningSettings,
    /// Repeat-measurement settings for the orchestrator.
    #[serde(default)]
    pub measurement: MeasurementSettings,
    /// Where raw measurement data lands.
    #[serde(default)]
    pub storage: StorageSettings,
}

/// Tube rig configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TubeSettings {
    /// Where fitted curve parameters are persisted.
    #[serde(default = "default_parameter_file")]
    pub parameter_file: PathBuf,
    /// Legal control-value range of the tube driver.
    #[serde(default)]
    pub limits: VoltageLimits,
}

impl Default for TubeSettings {
    fn default() -> Self {
        Self {
            parameter_file: default_parameter_file(),
            limits: VoltageLimits::default(),
        }
    }
}

/// Tunables for the gradient-style matcher.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchSettings {
    /// Weighted-distance threshold below which the match counts as converged.
    #[serde(default = "default_epsilon")]
    pub epsilon: f64,
    /// Damping applied to each correction, in (0, 1].
    #[serde(default = "default_dilation")]
    pub dilation: f64,
    /// Inter-measurement settling interval.
    #[serde(with = "humantime_serde", default = "default_imi")]
    pub imi: Duration,
    /// Iteration budget before the search gives up.
    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,
    /// Down-weighting of luminance in the match distance.
    #[serde(default = "default_luminance_weight")]
    pub luminance_weight: f64,
}

impl Default for SearchSettings {
    fn default() -> Self {
        Self {
            epsilon: default_epsilon(),
            dilation: default_dilation(),
            imi: default_imi(),
            max_iterations: default_max_iterations(),
            luminance_weight: default_luminance_weight(),
        }
    }
}

/// Tunables for the neighborhood tuning search.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TuningSettings {
    /// Fixed number of outer rounds (the only termination condition).
    #[serde(default = "default_tuning_iterations")]
    pub iterations: usize,
    /// Coarse samples per channel per round.
    #[serde(default = "default_series_quantity")]
    pub series_quantity: usize,
    /// Control-value step between coarse samples.
    #[serde(default = "default_stepsize")]
    pub stepsize: i32,
    /// Inter-measurement settling interval.
    #[serde(with = "humantime_serde", default = "default_imi")]
    pub imi: Duration,
}

impl Default for TuningSettings {
    fn default() -> Self {
        Self {
            iterations: default_tuning_iterations(),
            series_quantity: default_series_quantity(),
            stepsize: default_stepsize(),
            imi: default_imi(),
        }
    }
}

/// Repeat-measurement settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeasurementSettings {
    /// Repeated readings per color entry (mean/variance statistics).
    #[serde(default = "default_repeats")]
    pub repeats: usize,
    /// Measurements per sweep step during tube calibration.
    #[serde(default = "default_each")]
    pub each: usize,
    /// Sweep steps per channel during tube calibration.
    #[serde(default = "default_sweep_steps")]
    pub sweep_steps: usize,
    /// Inter-measurement settling interval.
    #[serde(with = "humantime_serde", default = "default_imi")]
    pub imi: Duration,
}

impl Default for MeasurementSettings {
    fn default() -> Self {
        Self {
            repeats: default_repeats(),
            each: default_each(),
            sweep_steps: default_sweep_steps(),
            imi: default_imi(),
        }
    }
}

/// Storage locations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageSettings {
    /// Directory for raw measurement series and calibration data.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
        }
    }
}

fn default_parameter_file() -> PathBuf {
    PathBuf::from("calibdata/tube_parameters.json")
}
fn default_epsilon() -> f64 {
    0.01
}
fn default_dilation() -> f64 {
    1.0
}
fn default_imi() -> Duration {
    Duration::from_millis(500)
}
fn default_max_iterations() -> usize {
    50
}
fn default_luminance_weight() -> f64 {
    crate::color::DEFAULT_LUMINANCE_WEIGHT
}
fn default_tuning_iterations() -> usize {
    2
}
fn default_series_quantity() -> usize {
    20
}
fn default_stepsize() -> i32 {
    10
}
fn default_repeats() -> usize {
    10
}
fn default_each() -> usize {
    1
}
fn default_sweep_steps() -> usize {
    50
}
fn default_data_dir() -> PathBuf {
    PathBuf::from("calibdata/measurements")
}

impl Settings {
    /// Loads settings from `config/default.toml` (if present) and the
    /// environment, then validates them.
    pub fn load() -> AppResult<Self> {
        Self::load_from("config/default")
    }

    /// Loads settings from a specific base name (without extension).
    pub fn load_from(base: &str) -> AppResult<Self> {
        let settings: Settings = Config::builder()
            .add_source(File::with_name(base).required(false))
            .add_source(Environment::with_prefix("COLORLAB").separator("__"))
            .build()?
            .try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Semantic validation beyond what deserialization catches.
    pub fn validate(&self) -> AppResult<()> {
        if self.tubes.limits.low >= self.tubes.limits.high {
            return Err(CalibError::Configuration(format!(
                "tube voltage limits are inverted: low {:#x} >= high {:#x}",
                self.tubes.limits.low, self.tubes.limits.high
            )));
        }
        if self.search.epsilon <= 0.0 {
            return Err(CalibError::Configuration(
                "search.epsilon must be positive".to_string(),
            ));
        }
        if self.search.dilation <= 0.0 || self.search.dilation > 1.0 {
            return Err(CalibError::Configuration(
                "search.dilation must lie in (0, 1]".to_string(),
            ));
        }
        if self.tuning.stepsize <= 0 {
            return Err(CalibError::Configuration(
                "tuning.stepsize must be positive".to_string(),
            ));
        }
        if self.measurement.repeats == 0 || self.measurement.each == 0 {
            return Err(CalibError::Configuration(
                "measurement.repeats and measurement.each must be at least 1".to_string(),
            ));
        }
        if self.measurement.sweep_steps < 2 {
            return Err(CalibError::Configuration(
                "measurement.sweep_steps must be at least 2".to_string(),
            ));
        }
        Ok(())
    }
}
