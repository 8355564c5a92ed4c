//! Core library for the colorlab calibration engine.
//!
//! This library drives a two-actuator color-matching rig: a set of
//! voltage-controlled fluorescent tubes and a calibrated monitor, both
//! measured with a single photometer. Its job is to find tube voltages whose
//! measured wall color matches a color displayed on the monitor.
//!
//! The moving parts, leaf first:
//!
//! - [`color`]: xyY color triples, xyY→RGB conversion, weighted distance.
//! - [`core`]: control vectors, clamping, and the port traits for the
//!   photometer, tube actuator, monitor, and operator.
//! - [`curve`]: the per-channel voltage→luminance response model, its
//!   least-squares fitter, and the inversion used to seed searches.
//! - [`search`]: the two closed-loop matchers (gradient-style correction and
//!   coordinate-wise neighborhood tuning).
//! - [`calibrate`]: the orchestrator that sequences a full calibration of a
//!   table of named colors.
//! - [`table`]: named color entries with monitor-side and tube-side results.
//! - [`storage`]: append-only measurement series logs for offline diagnosis.
//! - [`hardware`]: mock and simulated rigs for tests and dry runs.
//!
//! Everything is single-threaded, synchronous, and blocking: each measurement
//! is a round trip to physical hardware with a mandatory settling delay, and
//! some steps wait on the human operator repositioning the photometer.

pub mod calibrate;
pub mod color;
pub mod config;
pub mod core;
pub mod curve;
pub mod error;
pub mod hardware;
pub mod search;
pub mod storage;
pub mod table;
