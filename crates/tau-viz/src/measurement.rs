//! Per-category POI measurements and their combination.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tau_core::{Error, Measurement, Result};

const HEADER: &str = "# category value errDown errUp";

/// Measurements keyed by category (`DM0`, `DM1_pt20to40`, ...), in insertion order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MeasurementTable {
    /// POI name.
    pub poi: String,
    /// `(category, measurement)` rows.
    pub rows: Vec<(String, Measurement)>,
}

impl MeasurementTable {
    /// Empty table for `poi`.
    pub fn new(poi: impl Into<String>) -> Self {
        Self { poi: poi.into(), rows: Vec::new() }
    }

    /// Insert or replace the measurement of `category`.
    pub fn insert(&mut self, category: impl Into<String>, m: Measurement) {
        let category = category.into();
        match self.rows.iter_mut().find(|(c, _)| *c == category) {
            Some(slot) => slot.1 = m,
            None => self.rows.push((category, m)),
        }
    }

    /// Measurement of `category`.
    pub fn get(&self, category: &str) -> Option<Measurement> {
        self.rows.iter().find(|(c, _)| c == category).map(|(_, m)| *m)
    }

    /// Inverse-variance weighted average, using the symmetrized errors.
    pub fn combine(&self) -> Result<Measurement> {
        let (mut sw, mut swx) = (0.0, 0.0);
        for (category, m) in &self.rows {
            let e = m.symmetric_error();
            if !(e.is_finite() && e > 0.0) {
                tracing::warn!(category = %category, "measurement without error left out of the combination");
                continue;
            }
            let w = 1.0 / (e * e);
            sw += w;
            swx += w * m.value;
        }
        if sw <= 0.0 {
            return Err(Error::PostFit(format!("no measurement of {} to combine", self.poi)));
        }
        let err = 1.0 / sw.sqrt();
        Ok(Measurement::new(swx / sw, err, err))
    }

    /// Text form: a header then `<category> value errDown errUp` per line.
    pub fn render(&self) -> String {
        let mut out = format!("{HEADER} ({})\n", self.poi);
        for (category, m) in &self.rows {
            out.push_str(&format!("{category} {:.6} {:.6} {:.6}\n", m.value, m.err_down, m.err_up));
        }
        out
    }

    /// Parse the text form; comment lines other than the header are ignored.
    pub fn parse(text: &str) -> Result<Self> {
        let mut table = Self::default();
        for (lineno, line) in text.lines().enumerate() {
            let line = line.trim();
            if let Some(rest) = line.strip_prefix(HEADER) {
                table.poi = rest.trim().trim_start_matches('(').trim_end_matches(')').to_string();
                continue;
            }
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 4 {
                return Err(Error::PostFit(format!("measurement line {}: expected 4 columns", lineno + 1)));
            }
            let num = |s: &str| {
                s.parse::<f64>()
                    .map_err(|_| Error::PostFit(format!("measurement line {}: bad number '{s}'", lineno + 1)))
            };
            table.insert(fields[0], Measurement::new(num(fields[1])?, num(fields[2])?, num(fields[3])?));
        }
        Ok(table)
    }

    /// Write the text form.
    pub fn write(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, self.render())?;
        Ok(())
    }

    /// Read the text form.
    pub fn read(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            Error::input("postfit", path.display().to_string(), format!("cannot read measurement table: {e}"))
        })?;
        Self::parse(&text)
    }
}
