//! Labelled feature tables, `features.csv` I/O and stratified partitioning.

mod split;

use crate::emotion::Emotion;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub use split::{split_stratified, Partition, SplitDataset, SplitRatios};

pub const LABEL_COLUMN: &str = "label";
pub const SOURCE_COLUMN: &str = "source_id";

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct LabeledVector {
    pub features: Vec<f64>,
    pub label: Emotion,
    pub source_id: String,
}

#[derive(thiserror::Error, Debug)]
pub enum DatasetError {
    #[error("class {emotion} has {count} samples, too few to populate train, validation and test")]
    InsufficientData { emotion: Emotion, count: usize },

    #[error("dataset is empty")]
    Empty,

    #[error("row {index} has {found} features, expected {expected}")]
    DimensionMismatch {
        index: usize,
        expected: usize,
        found: usize,
    },

    #[error("csv error in {path}: {source}")]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },

    #[error("malformed row at line {line}: {reason}")]
    MalformedRow { line: u64, reason: String },

    #[error("csv header must end with `{LABEL_COLUMN},{SOURCE_COLUMN}`")]
    MissingColumns,
}

/// All labelled vectors of one corpus, with their column names.
#[derive(Clone, Debug, PartialEq)]
pub struct FeatureTable {
    pub feature_names: Vec<String>,
    pub rows: Vec<LabeledVector>,
}

impl FeatureTable {
    pub fn new(feature_names: Vec<String>, rows: Vec<LabeledVector>) -> Result<Self, DatasetError> {
        let expected = feature_names.len();
        if let Some((index, row)) = rows
            .iter()
            .enumerate()
            .find(|(_, r)| r.features.len() != expected)
        {
            return Err(DatasetError::DimensionMismatch {
                index,
                expected,
                found: row.features.len(),
            });
        }
        Ok(Self {
            feature_names,
            rows,
        })
    }

    pub fn dimension(&self) -> usize {
        self.feature_names.len()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Sample count per class in [`Emotion::ALL`] order.
    pub fn class_counts(&self) -> [usize; crate::emotion::NUM_CLASSES] {
        class_counts(&self.rows)
    }

    pub fn write_csv(&self, path: &Path) -> Result<(), DatasetError> {
        let csv_err = |source| DatasetError::Csv {
            path: path.to_path_buf(),
            source,
        };
        let mut writer = csv::Writer::from_path(path).map_err(csv_err)?;

        let mut header: Vec<&str> = self.feature_names.iter().map(String::as_str).collect();
        header.push(LABEL_COLUMN);
        header.push(SOURCE_COLUMN);
        writer.write_record(&header).map_err(csv_err)?;

        for row in &self.rows {
            let mut record: Vec<String> = row.features.iter().map(|v| format!("{v:?}")).collect();
            record.push(row.label.id().to_string());
            record.push(row.source_id.clone());
            writer.write_record(&record).map_err(csv_err)?;
        }

        writer
            .flush()
            .map_err(|e| csv_err(csv::Error::from(e)))?;
        Ok(())
    }

    pub fn read_csv(path: &Path) -> Result<Self, DatasetError> {
        let csv_err = |source| DatasetError::Csv {
            path: path.to_path_buf(),
            source,
        };
        let mut reader = csv::Reader::from_path(path).map_err(csv_err)?;

        let headers = reader.headers().map_err(csv_err)?.clone();
        let n = headers.len();
        if n < 2 || &headers[n - 2] != LABEL_COLUMN || &headers[n - 1] != SOURCE_COLUMN {
            return Err(DatasetError::MissingColumns);
        }
        let feature_names: Vec<String> = headers.iter().take(n - 2).map(str::to_owned).collect();

        let mut rows = Vec::new();
        for record in reader.records() {
            let record = record.map_err(csv_err)?;
            let line = record.position().map(|p| p.line()).unwrap_or(0);
            let malformed = |reason: String| DatasetError::MalformedRow { line, reason };

            let features = record
                .iter()
                .take(n - 2)
                .map(|field| match field.trim().parse::<f64>() {
                    Ok(v) if v.is_finite() => Ok(v),
                    Ok(_) => Err(malformed(format!("non-finite value: {field:?}"))),
                    Err(_) => Err(malformed(format!("not a number: {field:?}"))),
                })
                .collect::<Result<Vec<f64>, _>>()?;
            let label_id: u8 = record[n - 2]
                .trim()
                .parse()
                .map_err(|_| malformed(format!("bad label {:?}", &record[n - 2])))?;
            let label = Emotion::from_id(label_id).map_err(|e| malformed(e.to_string()))?;

            rows.push(LabeledVector {
                features,
                label,
                source_id: record[n - 1].to_owned(),
            });
        }

        Self::new(feature_names, rows)
    }
}

pub fn class_counts(rows: &[LabeledVector]) -> [usize; crate::emotion::NUM_CLASSES] {
    let mut counts = [0usize; crate::emotion::NUM_CLASSES];
    for row in rows {
        counts[row.label.index()] += 1;
    }
    counts
}

/// Splits rows into a feature matrix and a label vector.
pub fn to_xy(rows: &[LabeledVector]) -> (Vec<Vec<f64>>, Vec<Emotion>) {
    rows.iter()
        .map(|r| (r.features.clone(), r.label))
        .unzip()
}
