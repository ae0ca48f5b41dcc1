//! The merged training table (`shrubs2ml_{method}.csv`).

use crate::error::{Error, Result};
use std::path::Path;
use tracing::debug;

/// Feature matrix and target of the merged statistics table.
#[derive(Debug, Clone, PartialEq)]
pub struct MlTable {
    pub ids: Vec<u32>,
    pub feature_names: Vec<String>,
    /// Row-major: `features[row][feature]`.
    pub features: Vec<Vec<f64>>,
    pub target: Vec<Option<f64>>,
}

fn parse_cell(s: &str) -> Option<f64> {
    s.trim().parse::<f64>().ok().filter(|v| v.is_finite())
}

impl MlTable {
    /// Every column other than `id` and `target` is a feature. Rows with a
    /// missing feature value are dropped; a missing target is kept.
    pub fn from_reader<R: std::io::Read>(reader: R, target: &str) -> Result<Self> {
        let mut reader = csv::Reader::from_reader(reader);
        let headers = reader.headers()?.clone();
        let find = |name: &str| {
            headers.iter().position(|h| h == name).ok_or_else(|| Error::MissingAttribute {
                attribute: name.to_string(),
                feature: 0,
            })
        };
        let id_col = find("id")?;
        let target_col = find(target)?;
        let feature_cols: Vec<usize> = (0..headers.len()).filter(|&c| c != id_col && c != target_col).collect();

        let mut table = MlTable {
            ids: Vec::new(),
            feature_names: feature_cols.iter().map(|&c| headers[c].to_string()).collect(),
            features: Vec::new(),
            target: Vec::new(),
        };
        let mut dropped = 0;
        for (i, row) in reader.records().enumerate() {
            let row = row?;
            let id = row
                .get(id_col)
                .and_then(parse_cell)
                .filter(|v| *v >= 0.0 && v.fract() == 0.0)
                .ok_or_else(|| Error::MissingAttribute {
                    attribute: "id".into(),
                    feature: i,
                })? as u32;
            let values: Option<Vec<f64>> = feature_cols.iter().map(|&c| row.get(c).and_then(parse_cell)).collect();
            let Some(values) = values else {
                dropped += 1;
                continue;
            };
            table.ids.push(id);
            table.features.push(values);
            table.target.push(row.get(target_col).and_then(parse_cell));
        }
        if dropped > 0 {
            debug!("{} rows dropped for missing feature values", dropped);
        }
        Ok(table)
    }

    pub fn read<P: AsRef<Path>>(path: P, target: &str) -> Result<Self> {
        Self::from_reader(std::fs::File::open(path)?, target)
    }

    pub fn n_rows(&self) -> usize {
        self.ids.len()
    }

    pub fn n_features(&self) -> usize {
        self.feature_names.len()
    }

    pub fn has_missing_target(&self) -> bool {
        self.target.iter().any(Option::is_none)
    }

    /// Feature matrix restricted to the given columns.
    pub fn select(&self, columns: &[usize]) -> Vec<Vec<f64>> {
        self.features
            .iter()
            .map(|row| columns.iter().map(|&c| row[c]).collect())
            .collect()
    }

    pub fn column(&self, c: usize) -> Vec<f64> {
        self.features.iter().map(|row| row[c]).collect()
    }
}
