//! The two closed-loop matchers that drive measured color toward a target.
//!
//! [`gradient`] holds the model-based correction loop: it commands the rig in
//! color space and nudges the commanded color by a damped fraction of the
//! measured error until the match is within epsilon or the iteration budget
//! runs out. It is fast when the response model is good, and it can fail.
//!
//! [`neighborhood`] holds the coordinate-wise grid search used in practice in
//! preference to the gradient loop: it works directly in control-vector
//! space, measures a local series around the current best on each channel,
//! and only ever returns a sample that was actually measured, never an
//! extrapolated value. It has no convergence criterion, only a budget, and
//! its result is "final", not "converged".

pub mod gradient;
pub mod neighborhood;

pub use gradient::{ColorMatchSearch, MatchOutcome};
pub use neighborhood::{NeighborhoodTuningSearch, TuningResult};
