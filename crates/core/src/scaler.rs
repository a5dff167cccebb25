use serde::{Deserialize, Serialize};

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum ScalerError {
    #[error("scaler used before fit")]
    NotFitted,

    #[error("cannot fit scaler on an empty set")]
    Empty,

    #[error("expected {expected} features, got {found}")]
    DimensionMismatch { expected: usize, found: usize },

    #[error("non-finite value in row {row}, feature {feature}")]
    NonFinite { row: usize, feature: usize },
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
struct ScalerParams {
    mean: Vec<f64>,
    std: Vec<f64>,
}

/// Per-feature standardisation `(x - mean) / std`.
///
/// Parameters are learned once by [`StandardScaler::fit`] and only replayed
/// afterwards. Features with zero variance keep a std of 1.0.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct StandardScaler {
    params: Option<ScalerParams>,
}

impl StandardScaler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_fitted(&self) -> bool {
        self.params.is_some()
    }

    pub fn dimension(&self) -> Option<usize> {
        self.params.as_ref().map(|p| p.mean.len())
    }

    pub fn mean(&self) -> Option<&[f64]> {
        self.params.as_ref().map(|p| p.mean.as_slice())
    }

    pub fn std(&self) -> Option<&[f64]> {
        self.params.as_ref().map(|p| p.std.as_slice())
    }

    pub fn fit(&mut self, rows: &[Vec<f64>]) -> Result<(), ScalerError> {
        let first = rows.first().ok_or(ScalerError::Empty)?;
        let dim = first.len();
        if let Some(bad) = rows.iter().find(|r| r.len() != dim) {
            return Err(ScalerError::DimensionMismatch {
                expected: dim,
                found: bad.len(),
            });
        }
        for (row, values) in rows.iter().enumerate() {
            if let Some(feature) = values.iter().position(|v| !v.is_finite()) {
                return Err(ScalerError::NonFinite { row, feature });
            }
        }

        let n = rows.len() as f64;
        let mut mean = vec![0.0; dim];
        for row in rows {
            for (m, v) in mean.iter_mut().zip(row) {
                *m += v;
            }
        }
        mean.iter_mut().for_each(|m| *m /= n);

        let mut std = vec![0.0; dim];
        for row in rows {
            for ((s, v), m) in std.iter_mut().zip(row).zip(&mean) {
                *s += (v - m).powi(2);
            }
        }
        for s in std.iter_mut() {
            *s = (*s / n).sqrt();
            if *s == 0.0 || !s.is_finite() {
                *s = 1.0;
            }
        }

        self.params = Some(ScalerParams { mean, std });
        Ok(())
    }

    pub fn transform_one(&self, row: &[f64]) -> Result<Vec<f64>, ScalerError> {
        let params = self.params.as_ref().ok_or(ScalerError::NotFitted)?;
        if row.len() != params.mean.len() {
            return Err(ScalerError::DimensionMismatch {
                expected: params.mean.len(),
                found: row.len(),
            });
        }
        Ok(row
            .iter()
            .zip(&params.mean)
            .zip(&params.std)
            .map(|((v, m), s)| (v - m) / s)
            .collect())
    }

    pub fn transform(&self, rows: &[Vec<f64>]) -> Result<Vec<Vec<f64>>, ScalerError> {
        rows.iter().map(|r| self.transform_one(r)).collect()
    }

    pub fn fit_transform(&mut self, rows: &[Vec<f64>]) -> Result<Vec<Vec<f64>>, ScalerError> {
        self.fit(rows)?;
        self.transform(rows)
    }
}
