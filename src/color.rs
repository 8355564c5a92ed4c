//! Color math for the calibration loops.
//!
//! Colors travel through the engine as CIE xyY triples: chromaticity
//! coordinates (x, y) plus luminance Y, which is what the photometer reports
//! directly. This module provides the small amount of color math the searches
//! need: component-wise arithmetic, the weighted distance used as the match
//! criterion, the xyY→RGB conversion used to seed a search from a target
//! color, and repeat-measurement statistics.
//!
//! # Distance weighting
//!
//! Y has a much larger numeric range (tens to hundreds of cd/m²) than the
//! chromaticity coordinates (0..1). An unweighted Euclidean norm would let
//! luminance error swamp chromaticity error, so Y is down-weighted by
//! [`DEFAULT_LUMINANCE_WEIGHT`] before the norm is taken. The weight is a
//! tunable, not a law; both searches take it as a parameter.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Default down-weighting applied to Y when computing color distances.
pub const DEFAULT_LUMINANCE_WEIGHT: f64 = 1e-2;

/// A color in CIE xyY space: chromaticity (x, y) and luminance Y.
///
/// No invariants are enforced. Physically `Y >= 0`, but photometer noise can
/// produce slightly negative readings and the searches must cope with them.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ColorTriple {
    /// Chromaticity x coordinate.
    pub x: f64,
    /// Chromaticity y coordinate.
    pub y: f64,
    /// Luminance Y in cd/m².
    #[serde(rename = "Y")]
    pub yy: f64,
}

impl ColorTriple {
    /// Creates a color from its three components.
    pub fn new(x: f64, y: f64, yy: f64) -> Self {
        Self { x, y, yy }
    }

    /// Component-wise difference `other - self`.
    pub fn diff(&self, other: &ColorTriple) -> [f64; 3] {
        [other.x - self.x, other.y - self.y, other.yy - self.yy]
    }

    /// Returns this color shifted by a component-wise correction.
    pub fn shifted(&self, correction: [f64; 3]) -> ColorTriple {
        ColorTriple::new(
            self.x + correction[0],
            self.y + correction[1],
            self.yy + correction[2],
        )
    }

    /// Weighted norm of this color treated as an error vector.
    ///
    /// `sqrt(x² + y² + (w·Y)²)` with `w` the luminance weight.
    pub fn weighted_norm(&self, luminance_weight: f64) -> f64 {
        let z = luminance_weight * self.yy;
        (self.x * self.x + self.y * self.y + z * z).sqrt()
    }

    /// Weighted distance between two colors.
    pub fn distance_to(&self, other: &ColorTriple, luminance_weight: f64) -> f64 {
        let [dx, dy, dz] = self.diff(other);
        ColorTriple::new(dx, dy, dz).weighted_norm(luminance_weight)
    }
}

impl fmt::Display for ColorTriple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "xyY({:.4}, {:.4}, {:.2})", self.x, self.y, self.yy)
    }
}

/// Converts xyY to XYZ tristimulus values.
///
/// A zero y chromaticity (no light) maps to XYZ (0, 0, 0).
pub fn xyy_to_xyz(color: &ColorTriple) -> [f64; 3] {
    if color.y == 0.0 {
        return [0.0, 0.0, 0.0];
    }
    let xx = color.x * color.yy / color.y;
    let zz = (1.0 - color.x - color.y) * color.yy / color.y;
    [xx, color.yy, zz]
}

/// XYZ→RGB conversion matrix: sRGB working space, reference white D50,
/// Bradford-adapted (Lindbloom). Linear RGB, no gamma companding; the tube
/// response model is fit against linear intensities.
const XYZ_TO_RGB: [[f64; 3]; 3] = [
    [3.133_856_1, -1.616_866_7, -0.490_614_6],
    [-0.978_768_4, 1.916_141_5, 0.033_454_0],
    [0.071_945_3, -0.228_991_4, 1.405_242_7],
];

/// Converts XYZ to linear RGB intensities (not clipped to any range).
pub fn xyz_to_rgb(xyz: [f64; 3]) -> [f64; 3] {
    let mut rgb = [0.0; 3];
    for (row, out) in XYZ_TO_RGB.iter().zip(rgb.iter_mut()) {
        *out = row[0] * xyz[0] + row[1] * xyz[1] + row[2] * xyz[2];
    }
    rgb
}

/// Converts xyY straight to linear RGB intensities.
pub fn xyy_to_rgb(color: &ColorTriple) -> [f64; 3] {
    xyz_to_rgb(xyy_to_xyz(color))
}

/// Mean and uncorrected population variance of repeated readings, per xyY
/// component.
///
/// The variance is `(1/n)·Σ(x−mean)²`, not the `1/(n−1)` sample variance;
/// that is what the lab's downstream analysis expects. Returns `None` for an
/// empty slice.
pub fn mean_and_population_variance(
    readings: &[ColorTriple],
) -> Option<(ColorTriple, ColorTriple)> {
    if readings.is_empty() {
        return None;
    }
    let n = readings.len() as f64;
    let mut mean = [0.0; 3];
    for c in readings {
        mean[0] += c.x;
        mean[1] += c.y;
        mean[2] += c.yy;
    }
    for m in &mut mean {
        *m /= n;
    }
    let mut var = [0.0; 3];
    for c in readings {
        var[0] += (c.x - mean[0]) * (c.x - mean[0]);
        var[1] += (c.y - mean[1]) * (c.y - mean[1]);
        var[2] += (c.yy - mean[2]) * (c.yy - mean[2]);
    }
    for v in &mut var {
        *v /= n;
    }
    Some((
        ColorTriple::new(mean[0], mean[1], mean[2]),
        ColorTriple::new(var[0], var[1], var[2]),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_weighted_norm_downweights_luminance() {
        let err = ColorTriple::new(0.0, 0.0, 100.0);
        let n = err.weighted_norm(DEFAULT_LUMINANCE_WEIGHT);
        assert!((n - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_distance_is_symmetric() {
        let a = ColorTriple::new(0.31, 0.33, 50.0);
        let b = ColorTriple::new(0.35, 0.30, 60.0);
        let d1 = a.distance_to(&b, DEFAULT_LUMINANCE_WEIGHT);
        let d2 = b.distance_to(&a, DEFAULT_LUMINANCE_WEIGHT);
        assert!((d1 - d2).abs() < 1e-12);
    }

    #[test]
    fn test_xyy_to_xyz_zero_chromaticity() {
        let black = ColorTriple::new(0.0, 0.0, 0.0);
        assert_eq!(xyy_to_xyz(&black), [0.0, 0.0, 0.0]);
    }

    #[test]
    fn test_xyy_to_xyz_roundtrip_y() {
        // Y passes through unchanged.
        let c = ColorTriple::new(0.31, 0.33, 50.0);
        let xyz = xyy_to_xyz(&c);
        assert!((xyz[1] - 50.0).abs() < 1e-12);
    }

    #[test]
    fn test_diff_and_shift_are_inverse() {
        let a = ColorTriple::new(0.3, 0.3, 40.0);
        let b = ColorTriple::new(0.32, 0.28, 55.0);
        let d = a.diff(&b);
        let shifted = a.shifted(d);
        assert!((shifted.x - b.x).abs() < 1e-12);
        assert!((shifted.y - b.y).abs() < 1e-12);
        assert!((shifted.yy - b.yy).abs() < 1e-12);
    }

    #[test]
    fn test_mean_and_population_variance() {
        let readings = vec![
            ColorTriple::new(0.30, 0.30, 40.0),
            ColorTriple::new(0.32, 0.34, 60.0),
        ];
        let (mean, var) = mean_and_population_variance(&readings).unwrap();
        assert!((mean.x - 0.31).abs() < 1e-12);
        assert!((mean.y - 0.32).abs() < 1e-12);
        assert!((mean.yy - 50.0).abs() < 1e-12);
        // Population variance: (1/2)·((40-50)² + (60-50)²) = 100.
        assert!((var.yy - 100.0).abs() < 1e-9);
        assert!((var.x - 0.0001).abs() < 1e-12);
    }

    #[test]
    fn test_statistics_of_empty_slice() {
        assert!(mean_and_population_variance(&[]).is_none());
    }
}
