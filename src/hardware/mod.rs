//! Hardware implementations of the port traits.
//!
//! Real drivers for the lab's I/O card and photometer live outside this
//! crate; what lives here are the mock and simulated rigs used by the test
//! suite and by dry runs of the calibration procedure. The simulated rig
//! reproduces the tube response curves and basic measurement noise well
//! enough to exercise every code path of the searches and the orchestrator
//! without hardware attached.

pub mod mock;
