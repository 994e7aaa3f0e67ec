use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::errors::StrategyError;

/// One time step of the feature table: engineered macro features plus the
/// simple return of every asset over that step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObservationRow {
    pub date: NaiveDate,
    pub features: Vec<f64>,
    pub returns: Vec<f64>,
}

/// Time-ordered table produced by the feature stage.
/// Rows are validated once at construction and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureFrame {
    feature_names: Vec<String>,
    assets: Vec<String>,
    rows: Vec<ObservationRow>,
}

impl FeatureFrame {
    pub fn new(
        feature_names: Vec<String>,
        assets: Vec<String>,
        rows: Vec<ObservationRow>,
    ) -> Result<Self, StrategyError> {
        if feature_names.is_empty() {
            return Err(StrategyError::data("at least one feature column is required"));
        }

        for (i, row) in rows.iter().enumerate() {
            if row.features.len() != feature_names.len() {
                return Err(StrategyError::data(format!(
                    "row {} ({}) has {} features, expected {}",
                    i, row.date, row.features.len(), feature_names.len()
                )));
            }
            if row.returns.len() != assets.len() {
                return Err(StrategyError::data(format!(
                    "row {} ({}) has {} returns, expected {}",
                    i, row.date, row.returns.len(), assets.len()
                )));
            }
            if row.features.iter().chain(row.returns.iter()).any(|v| !v.is_finite()) {
                return Err(StrategyError::data(format!(
                    "row {} ({}) contains a non-finite value",
                    i, row.date
                )));
            }
            if i > 0 && rows[i - 1].date >= row.date {
                return Err(StrategyError::unordered(rows[i - 1].date, row.date));
            }
        }

        Ok(Self {
            feature_names,
            assets,
            rows,
        })
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn rows(&self) -> &[ObservationRow] {
        &self.rows
    }

    pub fn row(&self, index: usize) -> Option<&ObservationRow> {
        self.rows.get(index)
    }

    pub fn feature_names(&self) -> &[String] {
        &self.feature_names
    }

    pub fn n_features(&self) -> usize {
        self.feature_names.len()
    }

    pub fn assets(&self) -> &[String] {
        &self.assets
    }

    /// Copy of the frame with the rows at and after `from` replaced.
    /// Used to check that nothing before `from` depends on the replaced rows.
    #[cfg(test)]
    pub fn with_rows_from(&self, from: usize, replacement: Vec<ObservationRow>) -> Result<Self, StrategyError> {
        let mut rows = self.rows[..from.min(self.rows.len())].to_vec();
        rows.extend(replacement);
        Self::new(self.feature_names.clone(), self.assets.clone(), rows)
    }
}
