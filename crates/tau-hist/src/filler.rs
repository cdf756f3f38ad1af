//! Single-pass histogram filling from column data with selections and weights.

use std::collections::HashMap;

use tau_core::{Error, Result};

use crate::expr::CompiledExpr;
use crate::histogram::Hist1D;
use crate::source::ColumnTable;

/// Specification for filling one histogram.
#[derive(Debug, Clone)]
pub struct HistogramSpec {
    /// Histogram name.
    pub name: String,
    /// Expression for the variable to histogram.
    pub variable: CompiledExpr,
    /// Optional weight expression.
    pub weight: Option<CompiledExpr>,
    /// Optional selection expression (entries passing if > 0).
    pub selection: Option<CompiledExpr>,
    /// Bin edges (must be sorted, length = n_bins + 1).
    pub bin_edges: Vec<f64>,
}

impl HistogramSpec {
    /// Compile a spec from expression strings. An empty weight or selection means none.
    pub fn new(
        name: impl Into<String>,
        variable: &str,
        selection: &str,
        weight: &str,
        bin_edges: Vec<f64>,
    ) -> Result<Self> {
        let opt = |s: &str| -> Result<Option<CompiledExpr>> {
            if s.trim().is_empty() { Ok(None) } else { CompiledExpr::compile(s).map(Some) }
        };
        Ok(Self {
            name: name.into(),
            variable: CompiledExpr::compile(variable)?,
            weight: opt(weight)?,
            selection: opt(selection)?,
            bin_edges,
        })
    }
}

/// Result of filling a histogram.
#[derive(Debug, Clone)]
pub struct FilledHistogram {
    /// Filled histogram, under/overflow already folded into the edge bins.
    pub histogram: Hist1D,
    /// Sum of weights that fell below the first edge (before folding).
    pub underflow: f64,
    /// Sum of weights at or above the last edge (before folding).
    pub overflow: f64,
    /// Selected entries with a negative weight.
    pub negative_weight_entries: u64,
}

/// Fill several histograms in a single pass over `table`.
///
/// Expressions shared between specs (the same selection under several
/// weights, for example) are evaluated once.
pub fn fill_histograms(specs: &[HistogramSpec], table: &ColumnTable) -> Result<Vec<FilledHistogram>> {
    let mut cache: HashMap<String, Vec<f64>> = HashMap::new();
    let mut evaluate = |e: &CompiledExpr| -> Result<()> {
        if !cache.contains_key(e.source()) {
            cache.insert(e.source().to_string(), e.eval_table(table)?);
        }
        Ok(())
    };
    for spec in specs {
        evaluate(&spec.variable)?;
        if let Some(w) = &spec.weight {
            evaluate(w)?;
        }
        if let Some(s) = &spec.selection {
            evaluate(s)?;
        }
    }

    let n = table.n_rows();
    let mut out = Vec::with_capacity(specs.len());
    for spec in specs {
        let mut h = Hist1D::new(spec.name.clone(), spec.bin_edges.clone()).map_err(|e| {
            Error::input("fill", spec.name.clone(), format!("invalid binning: {e}"))
        })?;
        let lo = h.edges[0];
        let hi = h.edges[h.n_bins()];
        let var = &cache[spec.variable.source()];
        let weight = spec.weight.as_ref().map(|w| &cache[w.source()]);
        let sel = spec.selection.as_ref().map(|s| &cache[s.source()]);

        let (mut underflow, mut overflow, mut negative) = (0.0, 0.0, 0u64);
        for i in 0..n {
            if let Some(sel) = sel
                && sel[i] <= 0.0
            {
                continue;
            }
            let w = weight.map_or(1.0, |w| w[i]);
            let x = var[i];
            if w < 0.0 {
                negative += 1;
            }
            if x < lo {
                underflow += w;
            } else if x >= hi {
                overflow += w;
            }
            h.fill(x, w);
        }
        out.push(FilledHistogram { histogram: h, underflow, overflow, negative_weight_entries: negative });
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn table() -> ColumnTable {
        ColumnTable::from_columns(
            "t",
            vec![
                ("x".into(), vec![0.5, 1.5, 2.5, 0.5, -1.0, 3.5]),
                ("w".into(), vec![2.0, 3.0, 1.0, 1.0, 1.0, -1.0]),
            ],
        )
        .unwrap()
    }

    #[test]
    fn fill_folds_flows() {
        let spec = HistogramSpec::new("h", "x", "", "", vec![0.0, 1.0, 2.0, 3.0]).unwrap();
        let r = fill_histograms(&[spec], &table()).unwrap();
        assert_eq!(r[0].histogram.content, vec![3.0, 1.0, 2.0]);
        assert_relative_eq!(r[0].underflow, 1.0);
        assert_relative_eq!(r[0].overflow, 1.0);
        assert_relative_eq!(r[0].histogram.entries, 6.0);
    }

    #[test]
    fn fill_with_weight_and_selection() {
        let specs = vec![
            HistogramSpec::new("a", "x", "x > 1.0", "w", vec![0.0, 1.0, 2.0, 3.0]).unwrap(),
            HistogramSpec::new("b", "x", "x > 1.0", "2*w", vec![0.0, 1.0, 2.0, 3.0]).unwrap(),
        ];
        let r = fill_histograms(&specs, &table()).unwrap();
        assert_eq!(r[0].histogram.content, vec![0.0, 3.0, 0.0]);
        assert_eq!(r[0].histogram.sumw2, vec![0.0, 9.0, 2.0]);
        assert_eq!(r[0].negative_weight_entries, 1);
        assert_eq!(r[1].histogram.content, vec![0.0, 6.0, 0.0]);
    }

    #[test]
    fn missing_branch_is_input_error() {
        let spec = HistogramSpec::new("h", "m_2", "", "", vec![0.0, 1.0]).unwrap();
        assert!(matches!(fill_histograms(&[spec], &table()), Err(Error::Input { .. })));
    }

    #[test]
    fn empty_table_gives_empty_histograms() {
        let t = ColumnTable::from_columns("e", vec![("x".into(), vec![])]).unwrap();
        let spec = HistogramSpec::new("h", "x", "", "", vec![0.0, 1.0]).unwrap();
        let r = fill_histograms(&[spec], &t).unwrap();
        assert_relative_eq!(r[0].histogram.integral(), 0.0);
    }
}
