use anyhow::{anyhow, Result};
use ndarray::{Array1, Array2, ArrayView1, Axis};

/// Below this standard deviation a feature counts as constant
const MIN_STD: f64 = 1e-12;

/// Z-score transform fitted on a training window only
#[derive(Debug, Clone, PartialEq)]
pub struct Standardizer {
    pub mean: Array1<f64>,
    pub std: Array1<f64>,
}

impl Standardizer {
    /// Fit on the rows of `window` (population std).
    /// Fails when a feature is constant over the window.
    pub fn fit(window: &Array2<f64>) -> Result<Self> {
        let n = window.shape()[0];
        if n < 2 {
            return Err(anyhow!("Need at least 2 rows to standardize, got {}", n));
        }

        let mean = window
            .mean_axis(Axis(0))
            .ok_or_else(|| anyhow!("Empty training window"))?;
        let std = window.std_axis(Axis(0), 0.0);

        if let Some(j) = std.iter().position(|s| !(*s > MIN_STD) || !s.is_finite()) {
            return Err(anyhow!("Feature {} is constant over the training window", j));
        }

        Ok(Self { mean, std })
    }

    pub fn transform(&self, window: &Array2<f64>) -> Array2<f64> {
        (window - &self.mean) / &self.std
    }

    pub fn transform_row(&self, row: ArrayView1<f64>) -> Array1<f64> {
        (&row - &self.mean) / &self.std
    }

    /// Map standardized state means back to raw feature units
    pub fn inverse_means(&self, means: &Array2<f64>) -> Array2<f64> {
        means * &self.std + &self.mean
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::arr2;

    #[test]
    fn test_standardizer_round_trip() {
        let window = arr2(&[[1.0, 10.0], [2.0, 20.0], [3.0, 30.0], [4.0, 40.0]]);
        let scaler = Standardizer::fit(&window).unwrap();
        let z = scaler.transform(&window);

        let col_mean = z.mean_axis(Axis(0)).unwrap();
        assert!(col_mean.iter().all(|m| m.abs() < 1e-12));
        assert!((z.std_axis(Axis(0), 0.0)[1] - 1.0).abs() < 1e-12);

        let back = scaler.inverse_means(&z);
        assert!((back[[2, 1]] - 30.0).abs() < 1e-9);
    }

    #[test]
    fn test_constant_feature_is_rejected() {
        let window = arr2(&[[1.0, 5.0], [2.0, 5.0], [3.0, 5.0]]);
        let err = Standardizer::fit(&window).unwrap_err();
        assert!(err.to_string().contains("Feature 1"));
    }
}
