//! POI interval from a likelihood scan.
//!
//! `2*deltaNLL` near its minimum is fitted with a polynomial in `x - x_min`
//! (quadratic, or cubic for asymmetric errors); the 68% interval is where the
//! fitted curve rises by one above its minimum. With fewer than
//! [`ParabolaOptions::min_points`] points around the minimum the interval is
//! read off the scan directly: the first grid point on each side exceeding
//! the minimum by one.

use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};
use tau_core::{Error, Measurement, Result};

/// How the interval was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IntervalMethod {
    /// Polynomial fit near the minimum.
    Parabola,
    /// First scan points above `min + 1`.
    Crossing,
}

/// Options of [`fit_parabola`].
#[derive(Debug, Clone)]
pub struct ParabolaOptions {
    /// Add a cubic term for asymmetric errors.
    pub asymmetric: bool,
    /// Largest `2*deltaNLL` above the minimum of points entering the fit.
    pub window: f64,
    /// Fewest points needed for the polynomial fit.
    pub min_points: usize,
}

impl Default for ParabolaOptions {
    fn default() -> Self {
        Self { asymmetric: false, window: 4.0, min_points: 4 }
    }
}

/// Result of a scan interval.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParabolaResult {
    /// Best fit and asymmetric errors.
    pub measurement: Measurement,
    /// Expansion point (the lowest scan point).
    pub x0: f64,
    /// Polynomial coefficients in `x - x0`, constant first; empty for crossings.
    pub coefficients: Vec<f64>,
    /// The lowest scan point is the first or last one.
    pub at_boundary: bool,
    /// Points entering the estimate.
    pub n_points: usize,
    /// Method used.
    pub method: IntervalMethod,
}

impl ParabolaResult {
    /// Value of the fitted curve at `x`, relative to its minimum.
    pub fn curve(&self, x: f64) -> Option<f64> {
        if self.coefficients.is_empty() {
            return None;
        }
        let d_min = self.measurement.value - self.x0;
        Some(poly(&self.coefficients, x - self.x0) - poly(&self.coefficients, d_min))
    }
}

fn poly(c: &[f64], d: f64) -> f64 {
    c.iter().rev().fold(0.0, |acc, ck| acc * d + ck)
}

/// Sort by POI and keep the lowest value of duplicated points.
fn clean(points: &[(f64, f64)]) -> Vec<(f64, f64)> {
    let mut pts: Vec<(f64, f64)> = points.iter().copied().filter(|(x, y)| x.is_finite() && y.is_finite()).collect();
    pts.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.total_cmp(&b.1)));
    pts.dedup_by(|a, b| a.0 == b.0);
    pts
}

fn argmin(pts: &[(f64, f64)]) -> usize {
    pts.iter().enumerate().min_by(|a, b| a.1.1.total_cmp(&b.1.1)).map_or(0, |(i, _)| i)
}

/// Interval from the first points on each side exceeding the minimum by one.
///
/// A side without such a point uses the outermost scan point.
pub fn measure_crossings(points: &[(f64, f64)]) -> Result<ParabolaResult> {
    let pts = clean(points);
    if pts.len() < 2 {
        return Err(Error::PostFit(format!("need at least two scan points, got {}", pts.len())));
    }
    let i = argmin(&pts);
    let (x_min, y_min) = pts[i];
    let left = pts[..i].iter().rev().find(|(_, y)| *y > y_min + 1.0).map_or(pts[0].0, |p| p.0);
    let right = pts[i + 1..].iter().find(|(_, y)| *y > y_min + 1.0).map_or(pts[pts.len() - 1].0, |p| p.0);
    Ok(ParabolaResult {
        measurement: Measurement::new(x_min, x_min - left, right - x_min),
        x0: x_min,
        coefficients: Vec::new(),
        at_boundary: i == 0 || i == pts.len() - 1,
        n_points: pts.len(),
        method: IntervalMethod::Crossing,
    })
}

/// Fit `2*deltaNLL` points `(poi, value)` near their minimum.
pub fn fit_parabola(points: &[(f64, f64)], opts: &ParabolaOptions) -> Result<ParabolaResult> {
    let pts = clean(points);
    if pts.len() < 2 {
        return Err(Error::PostFit(format!("need at least two scan points, got {}", pts.len())));
    }
    let i_min = argmin(&pts);
    let (x0, y0) = pts[i_min];
    let at_boundary = i_min == 0 || i_min == pts.len() - 1;
    if at_boundary {
        tracing::warn!(poi = x0, "scan minimum at the grid boundary");
    }

    let mut lo = i_min;
    while lo > 0 && pts[lo - 1].1 - y0 <= opts.window {
        lo -= 1;
    }
    let mut hi = i_min;
    while hi + 1 < pts.len() && pts[hi + 1].1 - y0 <= opts.window {
        hi += 1;
    }
    let used = &pts[lo..=hi];
    let degree = if opts.asymmetric { 3 } else { 2 };
    if used.len() < opts.min_points.max(degree + 1) {
        tracing::debug!(points = used.len(), "too few points near the minimum, using crossings");
        return measure_crossings(&pts);
    }

    let a = DMatrix::from_fn(used.len(), degree + 1, |r, c| (used[r].0 - x0).powi(c as i32));
    let b = DVector::from_iterator(used.len(), used.iter().map(|p| p.1));
    let coef = a
        .svd(true, true)
        .solve(&b, 1e-14)
        .map_err(|e| Error::Computation(format!("parabola least squares failed: {e}")))?;
    let c: Vec<f64> = coef.iter().copied().collect();
    if c[2] <= 0.0 {
        tracing::warn!(curvature = c[2], "scan is not convex near its minimum, using crossings");
        return measure_crossings(&pts);
    }

    let d_min = stationary_point(&c);
    let f_min = poly(&c, d_min);
    let sigma = 1.0 / c[2].sqrt();
    let mut errors = [sigma, sigma];
    if opts.asymmetric {
        for (side, dir) in [(0usize, -1.0f64), (1, 1.0)] {
            if let Some(d) = crossing(&c, d_min, f_min, dir, sigma) {
                errors[side] = (d - d_min).abs();
            }
        }
    }

    Ok(ParabolaResult {
        measurement: Measurement::new(x0 + d_min, errors[0], errors[1]),
        x0,
        coefficients: c,
        at_boundary,
        n_points: used.len(),
        method: IntervalMethod::Parabola,
    })
}

/// Minimum of the fitted polynomial closest to the expansion point.
fn stationary_point(c: &[f64]) -> f64 {
    let (c1, c2) = (c[1], c[2]);
    let c3 = c.get(3).copied().unwrap_or(0.0);
    if c3.abs() < 1e-12 * c2.abs() {
        return -c1 / (2.0 * c2);
    }
    let disc = 4.0 * c2 * c2 - 12.0 * c3 * c1;
    if disc < 0.0 {
        return -c1 / (2.0 * c2);
    }
    [(-2.0 * c2 + disc.sqrt()) / (6.0 * c3), (-2.0 * c2 - disc.sqrt()) / (6.0 * c3)]
        .into_iter()
        .filter(|d| 2.0 * c2 + 6.0 * c3 * d > 0.0)
        .min_by(|a, b| a.abs().total_cmp(&b.abs()))
        .unwrap_or(-c1 / (2.0 * c2))
}

/// Where the polynomial rises by one above `f_min` on side `dir`.
fn crossing(c: &[f64], d_min: f64, f_min: f64, dir: f64, sigma: f64) -> Option<f64> {
    let rise = |d: f64| poly(c, d) - f_min - 1.0;
    let mut inside = d_min;
    let mut outside = None;
    for k in 1..=20 {
        let d = d_min + dir * 0.25 * sigma * k as f64;
        if rise(d) >= 0.0 {
            outside = Some(d);
            break;
        }
        inside = d;
    }
    let mut outside = outside?;
    for _ in 0..60 {
        let mid = 0.5 * (inside + outside);
        if rise(mid) >= 0.0 {
            outside = mid;
        } else {
            inside = mid;
        }
    }
    Some(0.5 * (inside + outside))
}

/// Range for the next scan when the minimum sits at a boundary: the grid
/// extended by half its span on that side.
pub fn widened_range(points: &[(f64, f64)], result: &ParabolaResult) -> Option<(f64, f64)> {
    if !result.at_boundary {
        return None;
    }
    let pts = clean(points);
    let (first, last) = (pts.first()?.0, pts.last()?.0);
    let half = 0.5 * (last - first);
    if (result.x0 - first).abs() <= (last - result.x0).abs() {
        Some((first - half, last))
    } else {
        Some((first, last + half))
    }
}
