//! Feature table loading
//!
//! Reads the output of the feature stage from CSV (`date,<features...>,<returns...>`)
//! or from a JSON array of `{"date": ..., "<column>": value, ...}` objects.

use anyhow::{anyhow, Context, Result};
use chrono::NaiveDate;
use csv::{ReaderBuilder, StringRecord};
use serde::Deserialize;
use std::collections::HashMap;
use std::io::Read;
use std::path::Path;
use tracing::info;

use crate::types::{FeatureFrame, ObservationRow};

const DATE_COLUMN: &str = "date";
const DATE_FORMAT: &str = "%Y-%m-%d";

#[derive(Debug, Deserialize)]
struct JsonRow {
    date: NaiveDate,
    #[serde(flatten)]
    values: HashMap<String, f64>,
}

/// Builds a `FeatureFrame` from the configured feature columns and asset tickers
pub struct FrameLoader {
    features: Vec<String>,
    assets: Vec<String>,
}

impl FrameLoader {
    pub fn new(features: Vec<String>, assets: Vec<String>) -> Self {
        Self { features, assets }
    }

    /// Parse a CSV table with a header row
    pub fn parse_csv<R: Read>(&self, reader: R) -> Result<FeatureFrame> {
        let mut reader = ReaderBuilder::new().trim(csv::Trim::All).from_reader(reader);
        let headers = reader.headers().context("Failed to read CSV header")?.clone();

        let date_idx = column(&headers, DATE_COLUMN)?;
        let feature_idx = self
            .features
            .iter()
            .map(|f| column(&headers, f))
            .collect::<Result<Vec<_>>>()?;
        let asset_idx = self
            .assets
            .iter()
            .map(|a| column(&headers, a))
            .collect::<Result<Vec<_>>>()?;

        let mut rows = Vec::new();
        for (line, record) in reader.records().enumerate() {
            let record = record.with_context(|| format!("Failed to read CSV record {}", line + 1))?;
            let raw_date = record.get(date_idx).unwrap_or_default();
            let date = NaiveDate::parse_from_str(raw_date, DATE_FORMAT)
                .with_context(|| format!("Invalid date '{}' in record {}", raw_date, line + 1))?;

            let values = |indices: &[usize], names: &[String]| -> Result<Vec<f64>> {
                indices
                    .iter()
                    .zip(names)
                    .map(|(&i, name)| parse_value(&record, i, name, date))
                    .collect()
            };

            rows.push(ObservationRow {
                date,
                features: values(&feature_idx, &self.features)?,
                returns: values(&asset_idx, &self.assets)?,
            });
        }

        Ok(FeatureFrame::new(self.features.clone(), self.assets.clone(), rows)?)
    }

    /// Parse a JSON array of row objects
    pub fn parse_json(&self, text: &str) -> Result<FeatureFrame> {
        let parsed: Vec<JsonRow> = serde_json::from_str(text).context("Failed to parse JSON rows")?;

        let pick = |row: &JsonRow, names: &[String]| -> Result<Vec<f64>> {
            names
                .iter()
                .map(|name| {
                    row.values
                        .get(name)
                        .copied()
                        .ok_or_else(|| anyhow!("Missing value for '{}' on {}", name, row.date))
                })
                .collect()
        };

        let rows = parsed
            .iter()
            .map(|row| {
                Ok(ObservationRow {
                    date: row.date,
                    features: pick(row, &self.features)?,
                    returns: pick(row, &self.assets)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(FeatureFrame::new(self.features.clone(), self.assets.clone(), rows)?)
    }
}

/// Read a feature table, choosing the format from the file extension
pub async fn load_frame(path: &Path, features: &[String], assets: &[String]) -> Result<FeatureFrame> {
    let text = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to open file: {:?}", path))?;

    let loader = FrameLoader::new(features.to_vec(), assets.to_vec());
    let frame = match path.extension().and_then(|e| e.to_str()) {
        Some("json") => loader.parse_json(&text)?,
        _ => loader.parse_csv(text.as_bytes())?,
    };

    info!(
        "Loaded {} rows ({} features, {} assets) from {}",
        frame.len(),
        frame.n_features(),
        frame.assets().len(),
        path.display()
    );
    Ok(frame)
}

fn column(headers: &StringRecord, name: &str) -> Result<usize> {
    headers
        .iter()
        .position(|h| h == name)
        .ok_or_else(|| anyhow!("Column '{}' not found in header", name))
}

fn parse_value(record: &StringRecord, index: usize, name: &str, date: NaiveDate) -> Result<f64> {
    let raw = record.get(index).unwrap_or_default();
    if raw.is_empty() {
        return Err(anyhow!("Missing value for '{}' on {}", name, date));
    }
    raw.parse::<f64>()
        .with_context(|| format!("Invalid number '{}' for '{}' on {}", raw, name, date))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn loader() -> FrameLoader {
        FrameLoader::new(vec!["vix_mom".into(), "tech_mom".into()], vec!["SPY".into(), "TLT".into()])
    }

    const CSV: &str = "date,SPY,vix_mom,TLT,tech_mom,unused\n\
                       2020-01-02,0.01,0.5,-0.002,1.5,x\n\
                       2020-01-03,-0.02,0.7,0.004,1.1,y\n";

    #[test]
    fn test_csv_columns_are_selected_by_name() {
        let frame = loader().parse_csv(CSV.as_bytes()).unwrap();
        assert_eq!(frame.len(), 2);
        let row = frame.row(1).unwrap();
        assert_eq!(row.features, vec![0.7, 1.1]);
        assert_eq!(row.returns, vec![-0.02, 0.004]);
    }

    #[test]
    fn test_csv_rejects_missing_value() {
        let csv = "date,vix_mom,tech_mom,SPY,TLT\n2020-01-02,0.5,,0.01,0.0\n";
        let err = loader().parse_csv(csv.as_bytes()).unwrap_err();
        assert!(err.to_string().contains("tech_mom"));
    }

    #[test]
    fn test_csv_rejects_unordered_dates() {
        let csv = "date,vix_mom,tech_mom,SPY,TLT\n\
                   2020-01-03,0.5,1.0,0.01,0.0\n\
                   2020-01-02,0.5,1.0,0.01,0.0\n";
        assert!(loader().parse_csv(csv.as_bytes()).is_err());
    }

    #[test]
    fn test_csv_rejects_missing_column() {
        let csv = "date,vix_mom,SPY,TLT\n2020-01-02,0.5,0.01,0.0\n";
        let err = loader().parse_csv(csv.as_bytes()).unwrap_err();
        assert!(err.to_string().contains("tech_mom"));
    }

    #[test]
    fn test_json_rows() {
        let json = r#"[
            {"date": "2020-01-02", "vix_mom": 0.5, "tech_mom": 1.5, "SPY": 0.01, "TLT": -0.002},
            {"date": "2020-01-03", "vix_mom": 0.7, "tech_mom": 1.1, "SPY": -0.02, "TLT": 0.004}
        ]"#;
        let frame = loader().parse_json(json).unwrap();
        assert_eq!(frame.row(0).unwrap().features, vec![0.5, 1.5]);
        assert_eq!(frame.row(1).unwrap().returns, vec![-0.02, 0.004]);
    }

    #[test]
    fn test_load_frame_from_file() {
        let mut file = tempfile::Builder::new().suffix(".csv").tempfile().unwrap();
        file.write_all(CSV.as_bytes()).unwrap();

        let features = vec!["vix_mom".to_string(), "tech_mom".to_string()];
        let assets = vec!["SPY".to_string(), "TLT".to_string()];
        let frame = tokio_test::block_on(load_frame(file.path(), &features, &assets)).unwrap();
        assert_eq!(frame.len(), 2);
        assert_eq!(frame.assets(), assets.as_slice());
    }
}
