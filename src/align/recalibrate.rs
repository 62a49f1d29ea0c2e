//! Retention-time and mass recalibration: fitting a correction function from
//! matched (sample coordinate, consensus coordinate) pairs.
//!
//! Sparse samples get a single linear correction (median-robust below 500
//! points, least squares above). Dense samples additionally get a smoothed
//! local-regression curve; whichever model leaves the lower mean absolute
//! residual on the calibration points wins. The smoothed model always
//! carries the linear fit as its extrapolation anchor.

use nalgebra::{Matrix2, Vector2};
use serde::{Deserialize, Serialize};

use crate::stats::{dedupe_monotonic, median};

/// Calibration point count from which the smoothed model is attempted.
pub const DENSE_THRESHOLD: usize = 25;
/// Below this many points the median-robust linear fit is used; above it,
/// ordinary least squares (the median fit is quadratic in the point count).
pub const MEDIAN_FIT_LIMIT: usize = 500;

/// A fitted correction from a sample's raw coordinate to the consensus
/// coordinate system. Cheap to clone and safe to share across worker threads.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub enum RecalibrationFunction {
    /// No correction.
    #[default]
    Identity,
    Linear {
        slope: f64,
        intercept: f64,
    },
    /// Smoothed local-regression curve, evaluated by linear interpolation
    /// between knots. Outside the knot domain the linear anchor applies.
    Loess {
        knots_x: Vec<f64>,
        knots_y: Vec<f64>,
        anchor_slope: f64,
        anchor_intercept: f64,
    },
}

impl RecalibrationFunction {
    pub fn apply(&self, x: f64) -> f64 {
        match self {
            RecalibrationFunction::Identity => x,
            RecalibrationFunction::Linear { slope, intercept } => slope * x + intercept,
            RecalibrationFunction::Loess {
                knots_x,
                knots_y,
                anchor_slope,
                anchor_intercept,
            } => {
                let n = knots_x.len();
                if n == 0 || x < knots_x[0] || x > knots_x[n - 1] {
                    return anchor_slope * x + anchor_intercept;
                }
                let upper = knots_x.partition_point(|&k| k < x);
                if upper == 0 {
                    return knots_y[0];
                }
                if upper >= n {
                    return knots_y[n - 1];
                }
                let (x0, x1) = (knots_x[upper - 1], knots_x[upper]);
                let (y0, y1) = (knots_y[upper - 1], knots_y[upper]);
                if x1 == x0 {
                    return y0;
                }
                y0 + (y1 - y0) * (x - x0) / (x1 - x0)
            }
        }
    }

    pub fn is_identity(&self) -> bool {
        matches!(self, RecalibrationFunction::Identity)
    }
}

/// The RT and mass corrections for one sample.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SampleRecalibration {
    pub rt: RecalibrationFunction,
    pub mass: RecalibrationFunction,
}

impl SampleRecalibration {
    pub fn is_identity(&self) -> bool {
        self.rt.is_identity() && self.mass.is_identity()
    }
}

/// Result of a fit: the selected function and its mean absolute residual on
/// the calibration points, kept for diagnostics.
#[derive(Clone, Debug)]
pub struct FittedRecalibration {
    pub function: RecalibrationFunction,
    pub residual: f64,
}

impl FittedRecalibration {
    fn identity() -> Self {
        FittedRecalibration {
            function: RecalibrationFunction::Identity,
            residual: 0.0,
        }
    }
}

/// Fit a correction from `(sample coordinate, consensus coordinate)` pairs.
///
/// `min_region_count` is the smallest per-region calibration point count over
/// the sample's temporal regions; it gates the fit so that a sample whose
/// calibration points all sit in one corner of the gradient does not get
/// extrapolated corrections. Fewer than 2 points per region: identity.
pub fn fit_recalibration(xs: &[f64], ys: &[f64], min_region_count: usize) -> FittedRecalibration {
    debug_assert_eq!(xs.len(), ys.len());
    if min_region_count < 2 || xs.len() < 2 {
        return FittedRecalibration::identity();
    }
    if min_region_count < DENSE_THRESHOLD {
        let Some(linear) = fit_linear(xs, ys) else {
            return FittedRecalibration::identity();
        };
        let residual = mean_abs_residual(&linear, xs, ys);
        return FittedRecalibration {
            function: linear,
            residual,
        };
    }
    // dense case: compare linear against the smoothed curve
    let (x, y) = dedupe_monotonic(xs, ys);
    let Some(linear) = fit_linear(&x, &y) else {
        return FittedRecalibration::identity();
    };
    let bandwidth = (200.0 / x.len() as f64).clamp(0.1, 0.3);
    let Some(fitted) = loess_fit(&x, &y, bandwidth) else {
        let residual = mean_abs_residual(&linear, &x, &y);
        return FittedRecalibration {
            function: linear,
            residual,
        };
    };
    let (anchor_slope, anchor_intercept) = match linear {
        RecalibrationFunction::Linear { slope, intercept } => (slope, intercept),
        _ => unreachable!("fit_linear only returns linear functions"),
    };
    let loess = RecalibrationFunction::Loess {
        knots_x: x.clone(),
        knots_y: fitted,
        anchor_slope,
        anchor_intercept,
    };
    let linear_residual = mean_abs_residual(&linear, &x, &y);
    let loess_residual = mean_abs_residual(&loess, &x, &y);
    if linear_residual < loess_residual {
        FittedRecalibration {
            function: linear,
            residual: linear_residual,
        }
    } else {
        FittedRecalibration {
            function: loess,
            residual: loess_residual,
        }
    }
}

/// Mean absolute residual of a function on calibration points.
pub fn mean_abs_residual(f: &RecalibrationFunction, xs: &[f64], ys: &[f64]) -> f64 {
    if xs.is_empty() {
        return 0.0;
    }
    let sum: f64 = xs
        .iter()
        .zip(ys.iter())
        .map(|(&x, &y)| (f.apply(x) - y).abs())
        .sum();
    sum / xs.len() as f64
}

fn fit_linear(xs: &[f64], ys: &[f64]) -> Option<RecalibrationFunction> {
    if xs.len() < MEDIAN_FIT_LIMIT {
        median_linear(xs, ys)
    } else {
        ols_linear(xs, ys)
    }
}

/// Ordinary least-squares line via the 2x2 normal equations.
fn ols_linear(xs: &[f64], ys: &[f64]) -> Option<RecalibrationFunction> {
    let n = xs.len() as f64;
    if xs.len() < 2 {
        return None;
    }
    let sx: f64 = xs.iter().sum();
    let sy: f64 = ys.iter().sum();
    let sxx: f64 = xs.iter().map(|x| x * x).sum();
    let sxy: f64 = xs.iter().zip(ys.iter()).map(|(x, y)| x * y).sum();
    let normal = Matrix2::new(n, sx, sx, sxx);
    let rhs = Vector2::new(sy, sxy);
    let solution = normal.try_inverse()? * rhs;
    let (intercept, slope) = (solution[0], solution[1]);
    if !slope.is_finite() || !intercept.is_finite() {
        return None;
    }
    Some(RecalibrationFunction::Linear { slope, intercept })
}

/// Median-of-pairwise-slopes (Theil-Sen) line; robust against a minority of
/// mismatched calibration pairs.
fn median_linear(xs: &[f64], ys: &[f64]) -> Option<RecalibrationFunction> {
    let mut slopes: Vec<f64> = Vec::new();
    for i in 0..xs.len() {
        for j in (i + 1)..xs.len() {
            let dx = xs[j] - xs[i];
            if dx != 0.0 {
                slopes.push((ys[j] - ys[i]) / dx);
            }
        }
    }
    if slopes.is_empty() {
        return None;
    }
    let slope = median(&mut slopes);
    let mut intercepts: Vec<f64> = xs
        .iter()
        .zip(ys.iter())
        .map(|(&x, &y)| y - slope * x)
        .collect();
    let intercept = median(&mut intercepts);
    Some(RecalibrationFunction::Linear { slope, intercept })
}

/// Tricube-weighted local linear regression, evaluated at every input x.
/// Requires strictly increasing x. `bandwidth` is the fraction of points in
/// each local window.
fn loess_fit(xs: &[f64], ys: &[f64], bandwidth: f64) -> Option<Vec<f64>> {
    let n = xs.len();
    if n < 3 {
        return None;
    }
    let window = ((bandwidth * n as f64).ceil() as usize).clamp(3, n);
    let mut fitted = Vec::with_capacity(n);
    let mut lo = 0usize;
    for i in 0..n {
        // slide the window so it holds the `window` points nearest to xs[i]
        while lo + window < n
            && (xs[lo + window] - xs[i]).abs() < (xs[i] - xs[lo]).abs()
        {
            lo += 1;
        }
        let hi = lo + window;
        let d_max = (xs[i] - xs[lo]).abs().max((xs[hi - 1] - xs[i]).abs());
        let mut sw = 0.0;
        let mut swx = 0.0;
        let mut swy = 0.0;
        let mut swxx = 0.0;
        let mut swxy = 0.0;
        for k in lo..hi {
            let d = if d_max > 0.0 {
                ((xs[k] - xs[i]).abs() / d_max).min(1.0)
            } else {
                0.0
            };
            let w = {
                let t = 1.0 - d * d * d;
                t * t * t
            };
            sw += w;
            swx += w * xs[k];
            swy += w * ys[k];
            swxx += w * xs[k] * xs[k];
            swxy += w * xs[k] * ys[k];
        }
        let denom = sw * swxx - swx * swx;
        let value = if denom.abs() > 1e-12 {
            let slope = (sw * swxy - swx * swy) / denom;
            let intercept = (swy - slope * swx) / sw;
            slope * xs[i] + intercept
        } else if sw > 0.0 {
            swy / sw
        } else {
            ys[i]
        };
        if !value.is_finite() {
            return None;
        }
        fitted.push(value);
    }
    Some(fitted)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_point_yields_identity() {
        let fit = fit_recalibration(&[100.0], &[101.0], 1);
        assert!(fit.function.is_identity());
        assert_eq!(fit.residual, 0.0);
    }

    #[test]
    fn too_sparse_regions_yield_identity() {
        let xs: Vec<f64> = (0..10).map(|i| i as f64).collect();
        let fit = fit_recalibration(&xs, &xs, 1);
        assert!(fit.function.is_identity());
    }

    #[test]
    fn linear_shift_is_recovered() {
        let xs: Vec<f64> = (0..20).map(|i| i as f64 * 10.0).collect();
        let ys: Vec<f64> = xs.iter().map(|x| x + 2.0).collect();
        let fit = fit_recalibration(&xs, &ys, 5);
        match fit.function {
            RecalibrationFunction::Linear { slope, intercept } => {
                assert!((slope - 1.0).abs() < 1e-9);
                assert!((intercept - 2.0).abs() < 1e-9);
            }
            other => panic!("expected linear fit, got {other:?}"),
        }
        assert!(fit.residual < 1e-9);
    }

    #[test]
    fn median_fit_shrugs_off_outliers() {
        let mut xs: Vec<f64> = (0..30).map(|i| i as f64).collect();
        let mut ys: Vec<f64> = xs.iter().map(|x| 2.0 * x + 1.0).collect();
        xs.push(15.5);
        ys.push(500.0); // one badly matched pair
        let fit = fit_recalibration(&xs, &ys, 5);
        match fit.function {
            RecalibrationFunction::Linear { slope, .. } => {
                assert!((slope - 2.0).abs() < 0.05, "slope {slope}");
            }
            other => panic!("expected linear fit, got {other:?}"),
        }
    }

    #[test]
    fn dense_curved_data_selects_loess() {
        let xs: Vec<f64> = (0..120).map(|i| i as f64).collect();
        let ys: Vec<f64> = xs.iter().map(|x| x + 0.002 * x * x).collect();
        let fit = fit_recalibration(&xs, &ys, DENSE_THRESHOLD);
        assert!(
            matches!(fit.function, RecalibrationFunction::Loess { .. }),
            "curved drift should pick the smoothed model"
        );
        // selected model must beat the linear alternative
        let (x, y) = crate::stats::dedupe_monotonic(&xs, &ys);
        let linear = super::fit_linear(&x, &y).unwrap();
        assert!(fit.residual <= mean_abs_residual(&linear, &x, &y));
    }

    #[test]
    fn selected_model_never_loses_to_discarded_one() {
        // straight data: linear must win against loess
        let xs: Vec<f64> = (0..200).map(|i| i as f64 * 3.0).collect();
        let ys: Vec<f64> = xs.iter().map(|x| 0.98 * x + 5.0).collect();
        let fit = fit_recalibration(&xs, &ys, DENSE_THRESHOLD);
        let (x, y) = crate::stats::dedupe_monotonic(&xs, &ys);
        let bandwidth = (200.0 / x.len() as f64).clamp(0.1, 0.3);
        let fitted = super::loess_fit(&x, &y, bandwidth).unwrap();
        let loess = RecalibrationFunction::Loess {
            knots_x: x.clone(),
            knots_y: fitted,
            anchor_slope: 0.98,
            anchor_intercept: 5.0,
        };
        assert!(fit.residual <= mean_abs_residual(&loess, &x, &y) + 1e-12);
    }

    #[test]
    fn noisy_linear_drift_is_recovered() {
        use rand::{rngs::StdRng, Rng, SeedableRng};
        let mut rng = StdRng::seed_from_u64(42);
        let xs: Vec<f64> = (0..40).map(|i| i as f64 * 5.0).collect();
        let ys: Vec<f64> = xs
            .iter()
            .map(|x| 1.01 * x + 3.0 + rng.gen_range(-0.25..0.25))
            .collect();
        let fit = fit_recalibration(&xs, &ys, 5);
        match fit.function {
            RecalibrationFunction::Linear { slope, .. } => {
                assert!((slope - 1.01).abs() < 0.05, "slope {slope}");
            }
            other => panic!("expected linear fit, got {other:?}"),
        }
        assert!(fit.residual < 0.5);
    }

    #[test]
    fn loess_extrapolates_with_anchor() {
        let f = RecalibrationFunction::Loess {
            knots_x: vec![10.0, 20.0, 30.0],
            knots_y: vec![11.0, 21.0, 31.0],
            anchor_slope: 2.0,
            anchor_intercept: 0.0,
        };
        assert!((f.apply(15.0) - 16.0).abs() < 1e-9); // interpolated
        assert!((f.apply(5.0) - 10.0).abs() < 1e-9); // anchored
        assert!((f.apply(40.0) - 80.0).abs() < 1e-9); // anchored
    }

    #[test]
    fn duplicate_x_values_are_averaged_before_dense_fit() {
        let mut xs: Vec<f64> = Vec::new();
        let mut ys: Vec<f64> = Vec::new();
        for i in 0..60 {
            xs.push(i as f64);
            ys.push(i as f64 + 1.0);
            xs.push(i as f64);
            ys.push(i as f64 + 3.0);
        }
        let fit = fit_recalibration(&xs, &ys, DENSE_THRESHOLD);
        // averaged offset is +2
        assert!((fit.function.apply(30.0) - 32.0).abs() < 0.3);
    }
}
