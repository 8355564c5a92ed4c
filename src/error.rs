//! Custom error types for the calibration engine.
//!
//! This module defines the primary error type, `CalibError`, for the entire
//! crate. Using the `thiserror` crate, it provides a centralized and
//! consistent way to handle the different kinds of failures that can occur,
//! from configuration and I/O issues to device and curve-fit problems.
//!
//! Expected operational conditions (a device read that failed, a search that
//! did not converge) are *not* errors here: they are reported through result
//! values and log output, matching the loud-diagnostics style of the lab
//! software this crate grew out of. `CalibError` is reserved for conditions
//! that stop an operation outright: an uncalibrated rig, a fit that cannot
//! converge, a cancelled run, or plain programmer misuse such as an invalid
//! channel selector.

use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type AppResult<T> = std::result::Result<T, CalibError>;

/// Primary error type for the calibration engine.
#[derive(Error, Debug)]
pub enum CalibError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Configuration validation error: {0}")]
    Configuration(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Device error: {0}")]
    Device(String),

    #[error("Tubes are not calibrated: {0}")]
    NotCalibrated(String),

    #[error("Curve fit failed: {0}")]
    FitFailed(String),

    #[error("Invalid channel selector '{0}': channel must be one of 'red', 'green' or 'blue'")]
    InvalidChannel(String),

    #[error("Operation cancelled")]
    Cancelled,
}
