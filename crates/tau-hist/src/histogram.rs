//! 1D and 2D histograms with identical-binning checks.
//!
//! A [`Hist1D`] is the template type of the whole pipeline; [`Hist2D`] is used
//! by the unfolding engine and linearizes to a `Hist1D` through the fixed
//! flattening rule `k(i, j) = (i - 1) * ny + j` (1-indexed).

use serde::{Deserialize, Serialize};
use tau_core::{Error, Result};

/// Relative tolerance used when comparing bin edges.
const EDGE_TOLERANCE: f64 = 1e-9;

/// A 1D histogram without under/overflow bins (flows are folded on fill).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hist1D {
    /// Histogram name.
    pub name: String,
    /// Bin edges (length = n_bins + 1).
    pub edges: Vec<f64>,
    /// Bin contents (sum of weights).
    pub content: Vec<f64>,
    /// Sum of weights squared per bin.
    pub sumw2: Vec<f64>,
    /// Number of filled entries.
    #[serde(default)]
    pub entries: f64,
}

impl Hist1D {
    /// Create an empty histogram with the given edges.
    pub fn new(name: impl Into<String>, edges: Vec<f64>) -> Result<Self> {
        validate_edges(&edges)?;
        let n = edges.len() - 1;
        Ok(Self { name: name.into(), edges, content: vec![0.0; n], sumw2: vec![0.0; n], entries: 0.0 })
    }

    /// Create a histogram with `n` uniform bins on `[lo, hi)`.
    pub fn uniform(name: impl Into<String>, n: usize, lo: f64, hi: f64) -> Result<Self> {
        if n == 0 || hi <= lo {
            return Err(Error::Validation(format!("invalid uniform binning ({n}, {lo}, {hi})")));
        }
        let w = (hi - lo) / n as f64;
        Self::new(name, (0..=n).map(|i| lo + w * i as f64).collect())
    }

    /// Create a histogram from explicit contents. `sumw2` defaults to `content`
    /// (Poisson errors for unweighted counts).
    pub fn from_content(
        name: impl Into<String>,
        edges: Vec<f64>,
        content: Vec<f64>,
        sumw2: Option<Vec<f64>>,
    ) -> Result<Self> {
        validate_edges(&edges)?;
        let n = edges.len() - 1;
        if content.len() != n {
            return Err(Error::Validation(format!(
                "content length {} does not match {} bins",
                content.len(),
                n
            )));
        }
        let sumw2 = sumw2.unwrap_or_else(|| content.iter().map(|c| c.abs()).collect());
        if sumw2.len() != n {
            return Err(Error::Validation(format!("sumw2 length {} does not match {} bins", sumw2.len(), n)));
        }
        let entries = content.iter().sum();
        Ok(Self { name: name.into(), edges, content, sumw2, entries })
    }

    /// Number of visible bins.
    pub fn n_bins(&self) -> usize {
        self.content.len()
    }

    /// Sum of bin contents.
    pub fn integral(&self) -> f64 {
        self.content.iter().sum()
    }

    /// Statistical error of bin `i`.
    pub fn error(&self, i: usize) -> f64 {
        self.sumw2[i].max(0.0).sqrt()
    }

    /// Statistical error of the integral.
    pub fn integral_error(&self) -> f64 {
        self.sumw2.iter().sum::<f64>().max(0.0).sqrt()
    }

    /// Index of the visible bin containing `x`, or `None` outside the range.
    pub fn find_bin(&self, x: f64) -> Option<usize> {
        find_bin(&self.edges, x)
    }

    /// Fill `x` with weight `w`, folding under/overflow into the first/last bin.
    /// NaN values are dropped.
    pub fn fill(&mut self, x: f64, w: f64) {
        if let Some(b) = fold_bin(&self.edges, x) {
            self.content[b] += w;
            self.sumw2[b] += w * w;
            self.entries += 1.0;
        }
    }

    /// Whether both histograms have identical bin edges.
    pub fn same_binning(&self, other: &Hist1D) -> bool {
        same_edges(&self.edges, &other.edges)
    }

    /// Error unless both histograms share identical binning.
    pub fn check_binning(&self, other: &Hist1D) -> Result<()> {
        if self.same_binning(other) {
            Ok(())
        } else {
            Err(Error::Validation(format!(
                "binning of '{}' ({} bins, {:?}) differs from '{}' ({} bins, {:?})",
                other.name,
                other.n_bins(),
                other.edges,
                self.name,
                self.n_bins(),
                self.edges
            )))
        }
    }

    /// Add `scale * other` bin by bin. Errors on binning mismatch.
    pub fn add_scaled(&mut self, other: &Hist1D, scale: f64) -> Result<()> {
        self.check_binning(other)?;
        for i in 0..self.content.len() {
            self.content[i] += scale * other.content[i];
            self.sumw2[i] += scale * scale * other.sumw2[i];
        }
        self.entries += other.entries;
        Ok(())
    }

    /// Add another histogram bin by bin.
    pub fn add(&mut self, other: &Hist1D) -> Result<()> {
        self.add_scaled(other, 1.0)
    }

    /// Subtract another histogram bin by bin (errors add in quadrature).
    pub fn subtract(&mut self, other: &Hist1D) -> Result<()> {
        self.add_scaled(other, -1.0)
    }

    /// Multiply contents by `s` (sumw2 by `s^2`).
    pub fn scale(&mut self, s: f64) {
        for c in &mut self.content {
            *c *= s;
        }
        for e in &mut self.sumw2 {
            *e *= s * s;
        }
    }

    /// Set negative bin contents to zero. Returns the number of clipped bins.
    pub fn clip_negative(&mut self) -> usize {
        let mut n = 0;
        for c in &mut self.content {
            if *c < 0.0 {
                *c = 0.0;
                n += 1;
            }
        }
        n
    }

    /// Copy with a different name.
    pub fn renamed(&self, name: impl Into<String>) -> Hist1D {
        let mut h = self.clone();
        h.name = name.into();
        h
    }

    /// Empty copy (same binning, zero content) with a new name.
    pub fn empty_like(&self, name: impl Into<String>) -> Hist1D {
        let n = self.n_bins();
        Hist1D {
            name: name.into(),
            edges: self.edges.clone(),
            content: vec![0.0; n],
            sumw2: vec![0.0; n],
            entries: 0.0,
        }
    }
}

/// A 2D histogram, contents stored row-major with `x` as the slow index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hist2D {
    /// Histogram name.
    pub name: String,
    /// Bin edges along x.
    pub x_edges: Vec<f64>,
    /// Bin edges along y.
    pub y_edges: Vec<f64>,
    /// Contents, `content[(ix) * ny + iy]` with 0-based indices.
    pub content: Vec<f64>,
    /// Sum of weights squared, same layout as `content`.
    pub sumw2: Vec<f64>,
    /// Number of filled entries.
    #[serde(default)]
    pub entries: f64,
}

impl Hist2D {
    /// Create an empty 2D histogram.
    pub fn new(name: impl Into<String>, x_edges: Vec<f64>, y_edges: Vec<f64>) -> Result<Self> {
        validate_edges(&x_edges)?;
        validate_edges(&y_edges)?;
        let n = (x_edges.len() - 1) * (y_edges.len() - 1);
        Ok(Self {
            name: name.into(),
            x_edges,
            y_edges,
            content: vec![0.0; n],
            sumw2: vec![0.0; n],
            entries: 0.0,
        })
    }

    /// Number of x bins.
    pub fn nx(&self) -> usize {
        self.x_edges.len() - 1
    }

    /// Number of y bins.
    pub fn ny(&self) -> usize {
        self.y_edges.len() - 1
    }

    /// Content of bin (ix, iy), 0-based.
    pub fn get(&self, ix: usize, iy: usize) -> f64 {
        self.content[ix * self.ny() + iy]
    }

    /// Set content of bin (ix, iy), 0-based.
    pub fn set(&mut self, ix: usize, iy: usize, value: f64) {
        let ny = self.ny();
        self.content[ix * ny + iy] = value;
    }

    /// Fill (x, y) with weight `w`, folding flows into the edge bins.
    pub fn fill(&mut self, x: f64, y: f64, w: f64) {
        let (Some(ix), Some(iy)) = (fold_bin(&self.x_edges, x), fold_bin(&self.y_edges, y)) else {
            return;
        };
        let k = ix * self.ny() + iy;
        self.content[k] += w;
        self.sumw2[k] += w * w;
        self.entries += 1.0;
    }

    /// Sum of all contents.
    pub fn integral(&self) -> f64 {
        self.content.iter().sum()
    }

    /// Whether both histograms share x and y binning.
    pub fn same_binning(&self, other: &Hist2D) -> bool {
        same_edges(&self.x_edges, &other.x_edges) && same_edges(&self.y_edges, &other.y_edges)
    }

    /// Subtract another 2D histogram bin by bin.
    pub fn subtract(&mut self, other: &Hist2D) -> Result<()> {
        if !self.same_binning(other) {
            return Err(Error::Validation(format!(
                "2D binning of '{}' differs from '{}'",
                other.name, self.name
            )));
        }
        for k in 0..self.content.len() {
            self.content[k] -= other.content[k];
            self.sumw2[k] += other.sumw2[k];
        }
        Ok(())
    }

    /// Unroll into a 1D histogram with `nx * ny` unit-width bins on `[0, nx*ny)`.
    ///
    /// Visible 1D bin `k - 1` holds 2D bin `(i, j)` with `k = (i - 1) * ny + j`.
    pub fn flatten(&self) -> Hist1D {
        let n = self.content.len();
        Hist1D {
            name: format!("{}_unrolled", self.name),
            edges: (0..=n).map(|k| k as f64).collect(),
            content: self.content.clone(),
            sumw2: self.sumw2.clone(),
            entries: self.entries,
        }
    }

    /// Roll a flat vector back up into a 2D histogram with this binning.
    pub fn roll_up(&self, name: impl Into<String>, flat: &[f64]) -> Result<Hist2D> {
        if flat.len() != self.content.len() {
            return Err(Error::Validation(format!(
                "cannot roll {} values into {}x{} bins",
                flat.len(),
                self.nx(),
                self.ny()
            )));
        }
        Ok(Hist2D {
            name: name.into(),
            x_edges: self.x_edges.clone(),
            y_edges: self.y_edges.clone(),
            content: flat.to_vec(),
            sumw2: vec![0.0; flat.len()],
            entries: 0.0,
        })
    }

    /// Projection on the x axis.
    pub fn projection_x(&self) -> Hist1D {
        let mut h = Hist1D {
            name: format!("{}_px", self.name),
            edges: self.x_edges.clone(),
            content: vec![0.0; self.nx()],
            sumw2: vec![0.0; self.nx()],
            entries: self.entries,
        };
        for ix in 0..self.nx() {
            for iy in 0..self.ny() {
                let k = ix * self.ny() + iy;
                h.content[ix] += self.content[k];
                h.sumw2[ix] += self.sumw2[k];
            }
        }
        h
    }
}

/// 1-indexed flat bin `k = (i - 1) * ny + j` of 2D bin `(i, j)`.
pub fn flat_index(i: usize, j: usize, ny: usize) -> usize {
    (i - 1) * ny + j
}

/// Inverse of [`flat_index`]: 1-indexed `k` to 1-indexed `(i, j)`.
pub fn unflat_index(k: usize, ny: usize) -> (usize, usize) {
    ((k - 1) / ny + 1, (k - 1) % ny + 1)
}

fn validate_edges(edges: &[f64]) -> Result<()> {
    if edges.len() < 2 {
        return Err(Error::Validation(format!("need at least 2 bin edges, got {}", edges.len())));
    }
    if edges.iter().any(|e| !e.is_finite()) {
        return Err(Error::Validation("bin edges must be finite".into()));
    }
    if edges.windows(2).any(|w| w[1] <= w[0]) {
        return Err(Error::Validation(format!("bin edges must be strictly increasing: {edges:?}")));
    }
    Ok(())
}

fn same_edges(a: &[f64], b: &[f64]) -> bool {
    a.len() == b.len()
        && a.iter().zip(b).all(|(x, y)| (x - y).abs() <= EDGE_TOLERANCE * x.abs().max(y.abs()).max(1.0))
}

/// Find the bin index for a value given sorted bin edges.
///
/// Returns `None` for underflow/overflow and NaN.
pub fn find_bin(edges: &[f64], val: f64) -> Option<usize> {
    if val.is_nan() || val < edges[0] || val >= edges[edges.len() - 1] {
        return None;
    }
    Some(edges.partition_point(|e| *e <= val) - 1)
}

/// Bin index with under/overflow folded into the first/last bin.
pub fn fold_bin(edges: &[f64], val: f64) -> Option<usize> {
    if val.is_nan() {
        return None;
    }
    if val < edges[0] {
        return Some(0);
    }
    if val >= edges[edges.len() - 1] {
        return Some(edges.len() - 2);
    }
    find_bin(edges, val)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use proptest::prelude::*;

    #[test]
    fn fill_folds_flows() {
        let mut h = Hist1D::new("h", vec![0.0, 1.0, 2.0]).unwrap();
        for x in [-1.0, 0.2, 1.2, 3.0, f64::NAN] {
            h.fill(x, 1.0);
        }
        assert_eq!(h.content, vec![2.0, 2.0]);
        assert_relative_eq!(h.entries, 4.0);
    }

    #[test]
    fn find_bin_edge_cases() {
        let edges = vec![0.0, 1.0, 2.0, 3.0];
        assert_eq!(find_bin(&edges, -0.5), None);
        assert_eq!(find_bin(&edges, 3.0), None);
        assert_eq!(find_bin(&edges, 0.0), Some(0));
        assert_eq!(find_bin(&edges, 1.0), Some(1));
        assert_eq!(find_bin(&edges, 2.99), Some(2));
    }

    #[test]
    fn add_rejects_different_binning() {
        let mut a = Hist1D::uniform("a", 4, 0.0, 4.0).unwrap();
        let b = Hist1D::uniform("b", 2, 0.0, 4.0).unwrap();
        assert!(a.add(&b).is_err());
    }

    #[test]
    fn subtract_and_clip() {
        let mut a = Hist1D::from_content("a", vec![0.0, 1.0, 2.0], vec![5.0, 1.0], None).unwrap();
        let b = Hist1D::from_content("b", vec![0.0, 1.0, 2.0], vec![2.0, 3.0], None).unwrap();
        a.subtract(&b).unwrap();
        assert_eq!(a.content, vec![3.0, -2.0]);
        assert_eq!(a.sumw2, vec![7.0, 4.0]);
        assert_eq!(a.clip_negative(), 1);
        assert_eq!(a.content, vec![3.0, 0.0]);
    }

    #[test]
    fn invalid_edges() {
        assert!(Hist1D::new("h", vec![0.0]).is_err());
        assert!(Hist1D::new("h", vec![0.0, 2.0, 1.0]).is_err());
    }

    #[test]
    fn flatten_uses_row_major_rule() {
        let mut h = Hist2D::new("h", vec![0.0, 1.0, 2.0], vec![0.0, 1.0, 2.0, 3.0]).unwrap();
        // (i, j) = (2, 3) in 1-indexed bins
        h.fill(1.5, 2.5, 7.0);
        let flat = h.flatten();
        assert_eq!(flat.n_bins(), 6);
        let k = flat_index(2, 3, 3);
        assert_eq!(k, 6);
        assert_relative_eq!(flat.content[k - 1], 7.0);
    }

    #[test]
    fn roll_up_inverts_flatten() {
        let mut h = Hist2D::new("h", vec![0.0, 1.0, 2.0], vec![0.0, 1.0, 2.0]).unwrap();
        h.fill(0.5, 1.5, 2.0);
        h.fill(1.5, 0.5, 3.0);
        let back = h.roll_up("r", &h.flatten().content).unwrap();
        assert_eq!(back.content, h.content);
        assert_relative_eq!(back.get(0, 1), 2.0);
        assert_relative_eq!(back.get(1, 0), 3.0);
    }

    #[test]
    fn projection_x_sums_over_y() {
        let mut h = Hist2D::new("h", vec![0.0, 1.0, 2.0], vec![0.0, 1.0, 2.0]).unwrap();
        h.fill(0.5, 0.5, 1.0);
        h.fill(0.5, 1.5, 2.0);
        h.fill(1.5, 1.5, 4.0);
        assert_eq!(h.projection_x().content, vec![3.0, 4.0]);
    }

    proptest! {
        #[test]
        fn flat_index_roundtrip(nx in 1usize..20, ny in 1usize..20, i0 in 0usize..20, j0 in 0usize..20) {
            let i = i0 % nx + 1;
            let j = j0 % ny + 1;
            let k = flat_index(i, j, ny);
            prop_assert!(k >= 1 && k <= nx * ny);
            prop_assert_eq!(unflat_index(k, ny), (i, j));
        }
    }
}
