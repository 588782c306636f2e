//! Dense zone-indexed accessibility table
//!
//! Rows cover every id in `[0, max_zone]`; ids outside the valid-zone set hold
//! all-zero rows. Persisted as delimited text with header
//! `<index label>,<alternative names...>` and one row per id.

use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::Path;

use butterfly_common::{Error, Result};

/// Default header for the zone id column
pub const DEFAULT_INDEX_LABEL: &str = "zone";

#[derive(Debug, Clone, PartialEq)]
pub struct AccessibilityTable {
    index_label: String,
    alternative_names: Vec<String>,
    max_zone: u32,
    values: Vec<f32>,
}

impl AccessibilityTable {
    /// All-zero table with generated alternative names (`alt_0`, `alt_1`, ...)
    pub fn zeros(max_zone: u32, n_alternatives: usize) -> Self {
        Self {
            index_label: DEFAULT_INDEX_LABEL.to_string(),
            alternative_names: (0..n_alternatives).map(|i| format!("alt_{i}")).collect(),
            max_zone,
            values: vec![0.0; (max_zone as usize + 1) * n_alternatives],
        }
    }

    /// Replace the header labels; the name count must match the table width
    pub fn with_labels(
        mut self,
        index_label: impl Into<String>,
        alternative_names: Vec<String>,
    ) -> Result<Self> {
        if alternative_names.len() != self.alternative_names.len() {
            return Err(Error::Configuration(format!(
                "{} alternative names for a table with {} alternatives",
                alternative_names.len(),
                self.alternative_names.len()
            )));
        }
        self.index_label = index_label.into();
        self.alternative_names = alternative_names;
        Ok(self)
    }

    pub fn index_label(&self) -> &str {
        &self.index_label
    }

    pub fn alternative_names(&self) -> &[String] {
        &self.alternative_names
    }

    pub fn n_alternatives(&self) -> usize {
        self.alternative_names.len()
    }

    pub fn max_zone(&self) -> u32 {
        self.max_zone
    }

    pub fn row(&self, zone: u32) -> Option<&[f32]> {
        if zone > self.max_zone {
            return None;
        }
        let n = self.n_alternatives();
        let start = zone as usize * n;
        Some(&self.values[start..start + n])
    }

    pub(crate) fn row_mut(&mut self, zone: u32) -> Option<&mut [f32]> {
        if zone > self.max_zone {
            return None;
        }
        let n = self.n_alternatives();
        let start = zone as usize * n;
        Some(&mut self.values[start..start + n])
    }

    pub fn get(&self, zone: u32, alternative: usize) -> Option<f32> {
        self.row(zone)?.get(alternative).copied()
    }

    /// Write the table, replacing `path` only once the file is complete
    pub fn write_csv<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let staging = path.with_extension("partial");
        let written = File::create(&staging)
            .map_err(Error::from)
            .and_then(|file| self.write_to(file))
            .and_then(|()| fs::rename(&staging, path).map_err(Error::from));
        if written.is_err() {
            // Absent when File::create failed
            let _ = fs::remove_file(&staging);
        }
        written
    }

    pub fn write_to<W: Write>(&self, writer: W) -> Result<()> {
        let mut csv = csv::Writer::from_writer(writer);
        let to_io = |e: csv::Error| Error::IoError(e.into());

        let mut header = Vec::with_capacity(self.n_alternatives() + 1);
        header.push(self.index_label.clone());
        header.extend(self.alternative_names.iter().cloned());
        csv.write_record(&header).map_err(to_io)?;

        let mut record = Vec::with_capacity(header.len());
        for zone in 0..=self.max_zone {
            record.clear();
            record.push(zone.to_string());
            if let Some(row) = self.row(zone) {
                record.extend(row.iter().map(|v| v.to_string()));
            }
            csv.write_record(&record).map_err(to_io)?;
        }
        csv.flush()?;
        Ok(())
    }

    pub fn read_csv<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        Self::from_reader(File::open(path)?).map_err(|e| match e {
            Error::InvalidInput(msg) => Error::InvalidInput(format!("{}: {msg}", path.display())),
            other => other,
        })
    }

    pub fn from_reader<R: Read>(reader: R) -> Result<Self> {
        let mut csv = csv::Reader::from_reader(reader);
        let headers = csv
            .headers()
            .map_err(|e| Error::InvalidInput(format!("table header: {e}")))?
            .clone();
        let mut columns = headers.iter();
        let index_label = columns
            .next()
            .ok_or_else(|| Error::InvalidInput("table header is empty".to_string()))?
            .to_string();
        let alternative_names: Vec<String> = columns.map(str::to_string).collect();
        let n = alternative_names.len();

        let mut values = Vec::new();
        let mut expected_zone: u32 = 0;
        for record in csv.records() {
            let record = record.map_err(|e| Error::InvalidInput(format!("table row: {e}")))?;
            let zone: u32 = record
                .get(0)
                .and_then(|z| z.parse().ok())
                .ok_or_else(|| {
                    Error::InvalidInput(format!("row {expected_zone}: bad zone id"))
                })?;
            if zone != expected_zone {
                return Err(Error::InvalidInput(format!(
                    "expected zone {expected_zone}, found {zone}"
                )));
            }
            for field in record.iter().skip(1) {
                let value: f32 = field.parse().map_err(|_| {
                    Error::InvalidInput(format!("zone {zone}: '{field}' is not a number"))
                })?;
                values.push(value);
            }
            expected_zone += 1;
        }
        if expected_zone == 0 {
            return Err(Error::InvalidInput("table has no rows".to_string()));
        }
        if values.len() != expected_zone as usize * n {
            return Err(Error::InvalidInput(format!(
                "{} values for {expected_zone} rows of {n} alternatives",
                values.len()
            )));
        }

        Ok(Self {
            index_label,
            alternative_names,
            max_zone: expected_zone - 1,
            values,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn table() -> AccessibilityTable {
        let mut table = AccessibilityTable::zeros(3, 2)
            .with_labels("mgra", vec!["work".into(), "school".into()])
            .unwrap();
        table.row_mut(1).unwrap().copy_from_slice(&[1.5, -0.25]);
        table.row_mut(3).unwrap().copy_from_slice(&[0.1, 7.0]);
        table
    }

    #[test]
    fn test_header_and_zero_rows() {
        let mut out = Vec::new();
        table().write_to(&mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(
            lines,
            vec!["mgra,work,school", "0,0,0", "1,1.5,-0.25", "2,0,0", "3,0.1,7"]
        );
    }

    #[test]
    fn test_write_then_read_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("acc.csv");
        let original = table();
        original.write_csv(&path).unwrap();

        assert!(!path.with_extension("partial").exists());
        let loaded = AccessibilityTable::read_csv(&path).unwrap();
        assert_eq!(loaded, original);
    }

    #[test]
    fn test_gap_in_rows_rejected() {
        let input = "zone,a\n0,1\n2,1\n";
        let err = AccessibilityTable::from_reader(input.as_bytes()).unwrap_err();
        assert!(err.to_string().contains("expected zone 1"));
    }

    #[test]
    fn test_label_count_checked() {
        let result = AccessibilityTable::zeros(1, 2).with_labels("zone", vec!["only".into()]);
        assert!(matches!(result, Err(Error::Configuration(_))));
    }

    #[test]
    fn test_row_bounds() {
        let t = table();
        assert!(t.row(4).is_none());
        assert_eq!(t.get(3, 1), Some(7.0));
        assert_eq!(t.get(3, 2), None);
    }

    #[test]
    fn test_failed_write_removes_staging_file() {
        let dir = tempdir().unwrap();
        // A directory in the way makes the final rename fail
        let path = dir.path().join("acc.csv");
        std::fs::create_dir(&path).unwrap();

        assert!(table().write_csv(&path).is_err());
        assert!(!dir.path().join("acc.partial").exists());
        assert!(path.is_dir());
    }
}
