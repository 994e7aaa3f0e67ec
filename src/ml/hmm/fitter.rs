use anyhow::Result;
use ndarray::{Array1, Array2, ArrayView1};
use std::time::{Duration, Instant};
use tracing::warn;

use super::gaussian_hmm::{FitReport, GaussianHMM};
use super::scaler::Standardizer;
use crate::config::WalkForwardSettings;

/// Share of the training window above which one state is considered dominant
const DOMINANT_STATE_SHARE: f64 = 0.95;

/// A model trained on one walk-forward window together with its feature scaling
#[derive(Debug, Clone)]
pub struct FittedModel {
    pub hmm: GaussianHMM,
    pub scaler: Standardizer,
    pub report: FitReport,
}

impl FittedModel {
    /// State means in raw feature units (raw state x feature)
    pub fn raw_means(&self) -> Array2<f64> {
        self.scaler.inverse_means(&self.hmm.means)
    }

    /// Filtered log posterior after the last row of the (raw) training window
    pub fn log_posterior_after(&self, window: &Array2<f64>) -> Option<Array1<f64>> {
        self.hmm.filtered_log_posterior(&self.scaler.transform(window))
    }

    /// Advance the filter by one raw observation
    pub fn step(&self, prev: Option<&Array1<f64>>, observation: ArrayView1<f64>) -> Array1<f64> {
        let scaled = self.scaler.transform_row(observation);
        self.hmm.filter_step(prev, scaled.view())
    }
}

/// Trains a regime model on a raw training window
#[cfg_attr(test, mockall::automock)]
pub trait ModelFitter {
    fn fit(&self, window: &Array2<f64>) -> Result<FittedModel>;
}

/// Gaussian HMM fitted with Baum-Welch on z-scored features
#[derive(Debug, Clone)]
pub struct GaussianHmmFitter {
    pub n_states: usize,
    pub max_iter: usize,
    pub tolerance: f64,
    /// Feature seeding the k-means initialization
    pub init_feature: usize,
    pub timeout: Option<Duration>,
}

impl GaussianHmmFitter {
    pub fn from_settings(settings: &WalkForwardSettings, init_feature: usize) -> Self {
        Self {
            n_states: settings.n_states,
            max_iter: settings.max_iter,
            tolerance: settings.tolerance,
            init_feature,
            timeout: settings.fit_timeout_ms.map(Duration::from_millis),
        }
    }
}

impl ModelFitter for GaussianHmmFitter {
    fn fit(&self, window: &Array2<f64>) -> Result<FittedModel> {
        let scaler = Standardizer::fit(window)?;
        let observations = scaler.transform(window);

        let deadline = self.timeout.map(|t| Instant::now() + t);
        let mut hmm = GaussianHMM::new(self.n_states, window.shape()[1])
            .with_init_feature(self.init_feature);
        let report = hmm.fit(&observations, self.max_iter, self.tolerance, deadline)?;

        // Check for degenerate solution (all same state)
        if report.converged {
            let states = hmm.predict(&observations)?;
            let mut counts = vec![0usize; self.n_states];
            for s in &states {
                counts[*s] += 1;
            }
            let max_share = counts.iter().copied().max().unwrap_or(0) as f64 / states.len().max(1) as f64;
            if max_share > DOMINANT_STATE_SHARE {
                warn!(
                    "HMM on {} rows: one state holds {:.1}% of the Viterbi path",
                    states.len(),
                    max_share * 100.0
                );
            }
        }

        Ok(FittedModel { hmm, scaler, report })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn window(n: usize) -> Array2<f64> {
        Array2::from_shape_fn((n, 2), |(i, j)| {
            let level = if i < n / 2 { -1.0 } else { 1.0 };
            let noise = ((i * 31 + j * 17) % 7) as f64 / 7.0 - 0.5;
            level * (j as f64 + 1.0) + 0.2 * noise
        })
    }

    #[test]
    fn test_fitter_produces_usable_model() {
        let fitter = GaussianHmmFitter {
            n_states: 2,
            max_iter: 100,
            tolerance: 1e-6,
            init_feature: 0,
            timeout: None,
        };
        let data = window(120);
        let model = fitter.fit(&data).unwrap();
        assert!(model.report.converged);

        let means = model.raw_means();
        let lo = means[[0, 0]].min(means[[1, 0]]);
        let hi = means[[0, 0]].max(means[[1, 0]]);
        assert!((lo + 1.0).abs() < 0.2);
        assert!((hi - 1.0).abs() < 0.2);

        let post = model.log_posterior_after(&data).unwrap();
        let total: f64 = post.iter().map(|v| v.exp()).sum();
        assert!((total - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_constant_window_is_rejected() {
        let fitter = GaussianHmmFitter {
            n_states: 2,
            max_iter: 10,
            tolerance: 1e-4,
            init_feature: 0,
            timeout: None,
        };
        let data = Array2::from_elem((50, 2), 0.3);
        assert!(fitter.fit(&data).is_err());
    }
}
