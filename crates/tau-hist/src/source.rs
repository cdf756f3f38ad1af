//! Event sources: the seam to the external event-loop engine.
//!
//! Events arrive as columnar tables (`branch -> values`). A source is opened
//! by input name, so every worker can re-open its own copy.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tau_core::{Error, Result};

/// Columnar event table (one `Vec<f64>` per branch, all of equal length).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ColumnTable {
    #[serde(default)]
    name: String,
    columns: BTreeMap<String, Vec<f64>>,
}

impl ColumnTable {
    /// Build a table from named columns. All columns must have equal length.
    pub fn from_columns(name: impl Into<String>, columns: Vec<(String, Vec<f64>)>) -> Result<Self> {
        let table = Self { name: name.into(), columns: columns.into_iter().collect() };
        table.validate()?;
        Ok(table)
    }

    fn validate(&self) -> Result<()> {
        let mut lens = self.columns.iter().map(|(k, v)| (k, v.len()));
        if let Some((first, n)) = lens.next()
            && let Some((bad, m)) = lens.find(|(_, m)| *m != n)
        {
            return Err(Error::input(
                "source",
                self.name.clone(),
                format!("column '{bad}' has {m} rows, '{first}' has {n}"),
            ));
        }
        Ok(())
    }

    /// Table name (the input it was read from).
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of events.
    pub fn n_rows(&self) -> usize {
        self.columns.values().next().map_or(0, Vec::len)
    }

    /// Column by branch name.
    pub fn column(&self, branch: &str) -> Option<&[f64]> {
        self.columns.get(branch).map(Vec::as_slice)
    }

    /// Branch names in sorted order.
    pub fn branches(&self) -> impl Iterator<Item = &str> {
        self.columns.keys().map(String::as_str)
    }

    /// Copy of the table with the listed branches multiplied by `factor`.
    ///
    /// Used for energy-scale shifts of the tau four-momentum components.
    pub fn scaled(&self, branches: &[String], factor: f64) -> Result<ColumnTable> {
        let mut out = self.clone();
        for b in branches {
            let col = out.columns.get_mut(b).ok_or_else(|| {
                Error::input("source", self.name.clone(), format!("cannot shift missing branch '{b}'"))
            })?;
            for v in col.iter_mut() {
                *v *= factor;
            }
        }
        Ok(out)
    }

    /// Read a JSON table (`{"columns": {"branch": [..]}}` or a bare `{"branch": [..]}` map).
    pub fn read_json(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            Error::input("source", path.display().to_string(), format!("cannot read: {e}"))
        })?;
        let value: serde_json::Value = serde_json::from_str(&text)?;
        let mut table: ColumnTable = if value.get("columns").is_some() {
            serde_json::from_value(value)?
        } else {
            ColumnTable { name: String::new(), columns: serde_json::from_value(value)? }
        };
        if table.name.is_empty() {
            table.name = stem(path);
        }
        table.validate()?;
        Ok(table)
    }

    /// Read a CSV table with a header row of branch names.
    pub fn read_csv(path: &Path) -> Result<Self> {
        let name = stem(path);
        let csv_err = |e: csv::Error| Error::input("source", name.clone(), format!("CSV error: {e}"));
        let mut rdr = csv::ReaderBuilder::new().has_headers(true).trim(csv::Trim::All).from_path(path).map_err(csv_err)?;
        let headers: Vec<String> = rdr.headers().map_err(csv_err)?.iter().map(str::to_string).collect();
        let mut cols: Vec<Vec<f64>> = vec![Vec::new(); headers.len()];
        for (row, record) in rdr.records().enumerate() {
            let record = record.map_err(csv_err)?;
            for (j, field) in record.iter().enumerate().take(headers.len()) {
                let v = field.parse::<f64>().map_err(|_| {
                    Error::input("source", name.clone(), format!("row {row}: '{field}' is not a number"))
                })?;
                cols[j].push(v);
            }
        }
        Self::from_columns(name.clone(), headers.into_iter().zip(cols).collect())
    }

    /// Write the table as JSON.
    pub fn write_json(&self, path: &Path) -> Result<()> {
        std::fs::write(path, serde_json::to_string(self)?)?;
        Ok(())
    }
}

fn stem(path: &Path) -> String {
    path.file_stem().map(|s| s.to_string_lossy().into_owned()).unwrap_or_default()
}

/// Source of event tables, addressed by input name (e.g. `DYJetsToLL_M-50_TES0p970`).
pub trait EventSource: Send + Sync {
    /// Open an input. A missing input is an [`Error::Input`].
    fn open(&self, input: &str) -> Result<ColumnTable>;

    /// Whether `input` exists, without reading it.
    fn exists(&self, input: &str) -> bool;
}

/// Reads `<dir>/<input>.json` or `<dir>/<input>.csv`.
#[derive(Debug, Clone)]
pub struct DirectorySource {
    dir: PathBuf,
}

impl DirectorySource {
    /// Source rooted at `dir`.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn resolve(&self, input: &str) -> Option<PathBuf> {
        ["json", "csv"].iter().map(|ext| self.dir.join(format!("{input}.{ext}"))).find(|p| p.is_file())
    }
}

impl EventSource for DirectorySource {
    fn open(&self, input: &str) -> Result<ColumnTable> {
        let path = self.resolve(input).ok_or_else(|| {
            Error::input("source", input, format!("no {input}.json or {input}.csv in {}", self.dir.display()))
        })?;
        tracing::debug!(input, path = %path.display(), "opening event table");
        match path.extension().and_then(|e| e.to_str()) {
            Some("csv") => ColumnTable::read_csv(&path),
            _ => ColumnTable::read_json(&path),
        }
    }

    fn exists(&self, input: &str) -> bool {
        self.resolve(input).is_some()
    }
}

/// In-memory source, mainly for tests and for tables produced upstream.
#[derive(Debug, Clone, Default)]
pub struct MemorySource {
    tables: HashMap<String, ColumnTable>,
}

impl MemorySource {
    /// Empty source.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a table under `input`.
    pub fn insert(&mut self, input: impl Into<String>, table: ColumnTable) {
        self.tables.insert(input.into(), table);
    }
}

impl EventSource for MemorySource {
    fn open(&self, input: &str) -> Result<ColumnTable> {
        self.tables
            .get(input)
            .cloned()
            .ok_or_else(|| Error::input("source", input, "input not registered"))
    }

    fn exists(&self, input: &str) -> bool {
        self.tables.contains_key(input)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tmp_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("tau_hist_source_{tag}_{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn unequal_columns_rejected() {
        let err = ColumnTable::from_columns("t", vec![("a".into(), vec![1.0]), ("b".into(), vec![1.0, 2.0])])
            .unwrap_err();
        assert!(matches!(err, Error::Input { .. }));
    }

    #[test]
    fn scaled_multiplies_listed_branches() {
        let t = ColumnTable::from_columns("t", vec![("m_2".into(), vec![1.0, 2.0]), ("w".into(), vec![3.0, 3.0])])
            .unwrap();
        let s = t.scaled(&["m_2".to_string()], 0.97).unwrap();
        assert_eq!(s.column("m_2").unwrap(), &[0.97, 1.94]);
        assert_eq!(s.column("w").unwrap(), &[3.0, 3.0]);
        assert!(t.scaled(&["pt_2".to_string()], 1.0).is_err());
    }

    #[test]
    fn directory_source_reads_json_and_csv() {
        let dir = tmp_dir("dir");
        std::fs::write(dir.join("DY.json"), r#"{"m_2": [0.5, 1.0], "w": [1.0, 2.0]}"#).unwrap();
        std::fs::write(dir.join("TT.csv"), "m_2, w\n0.7, 1.0\n1.3, 0.5\n").unwrap();
        let src = DirectorySource::new(&dir);
        let dy = src.open("DY").unwrap();
        assert_eq!(dy.n_rows(), 2);
        assert_eq!(dy.name(), "DY");
        let tt = src.open("TT").unwrap();
        assert_eq!(tt.column("w").unwrap(), &[1.0, 0.5]);
        assert!(!src.exists("WJ"));
        assert!(matches!(src.open("WJ"), Err(Error::Input { .. })));
    }

    #[test]
    fn memory_source() {
        let mut src = MemorySource::new();
        src.insert("Data", ColumnTable::from_columns("Data", vec![("x".into(), vec![1.0])]).unwrap());
        assert!(src.exists("Data"));
        assert_eq!(src.open("Data").unwrap().n_rows(), 1);
        assert!(src.open("Nope").is_err());
    }
}
