use anyhow::{anyhow, Result};
use ndarray::{Array1, Array2, ArrayView1};
use std::f64::consts::PI;
use std::time::Instant;

/// Diagonal regularization added to every covariance estimate
pub const COVARIANCE_FLOOR: f64 = 1e-6;

/// Minimum expected number of observations assigned to a state
const MIN_STATE_OCCUPANCY: f64 = 1e-3;

/// Hidden Markov Model with full-covariance Gaussian emissions
#[derive(Debug, Clone)]
pub struct GaussianHMM {
    pub n_states: usize,
    /// Number of features (observation dimensions)
    pub n_features: usize,
    /// State transition matrix (n_states x n_states), rows sum to 1
    pub transition: Array2<f64>,
    pub start_prob: Array1<f64>,
    /// Mean vectors for each state (n_states x n_features)
    pub means: Array2<f64>,
    pub covars: Vec<Array2<f64>>,
    /// Lower Cholesky factor of each covariance (computed whenever a covariance is set)
    covar_chols: Vec<Array2<f64>>,
    log_dets: Vec<f64>,
    /// Feature used to seed the k-means initialization
    pub init_feature: usize,
}

/// Outcome of a Baum-Welch run
#[derive(Debug, Clone, PartialEq)]
pub struct FitReport {
    pub log_likelihood: f64,
    pub iterations: usize,
    pub converged: bool,
    pub timed_out: bool,
}

impl GaussianHMM {
    /// Create an HMM with uniform start probabilities and sticky transitions
    pub fn new(n_states: usize, n_features: usize) -> Self {
        let start_prob = Array1::from_elem(n_states, 1.0 / n_states as f64);

        // Slightly prefer staying in the same state
        let off_diag = if n_states > 1 { 0.5 / (n_states - 1) as f64 } else { 0.0 };
        let mut transition = Array2::from_elem((n_states, n_states), off_diag);
        for i in 0..n_states {
            transition[[i, i]] = if n_states > 1 { 0.5 } else { 1.0 };
        }

        // Spread means along the diagonal so states start distinguishable
        let mut means = Array2::zeros((n_states, n_features));
        for state in 0..n_states {
            let offset = state as f64 - (n_states as f64 - 1.0) / 2.0;
            for j in 0..n_features {
                means[[state, j]] = offset;
            }
        }

        Self {
            n_states,
            n_features,
            transition,
            start_prob,
            means,
            covars: vec![Array2::eye(n_features); n_states],
            covar_chols: vec![Array2::eye(n_features); n_states],
            log_dets: vec![0.0; n_states],
            init_feature: 0,
        }
    }

    pub fn with_init_feature(mut self, feature: usize) -> Self {
        self.init_feature = feature.min(self.n_features.saturating_sub(1));
        self
    }

    /// Minimum number of observations needed to estimate every parameter
    pub fn min_observations(&self) -> usize {
        self.n_states * (self.n_features + 1) * 2
    }

    /// Initialize with K-means clustering.
    /// Seeds clusters from quantiles of `init_feature`, so the result is deterministic.
    pub fn init_with_kmeans(&mut self, observations: &Array2<f64>) -> Result<()> {
        if observations.shape()[1] != self.n_features {
            return Err(anyhow!("Observation features mismatch"));
        }

        let n_obs = observations.shape()[0];
        if n_obs < self.n_states {
            return Err(anyhow!("Need at least {} observations to seed {} states", self.n_states, self.n_states));
        }

        // Initial labels: quantile buckets of the seed feature
        let mut order: Vec<usize> = (0..n_obs).collect();
        order.sort_by(|&a, &b| {
            observations[[a, self.init_feature]]
                .partial_cmp(&observations[[b, self.init_feature]])
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.cmp(&b))
        });
        let mut labels = vec![0; n_obs];
        for (rank, &i) in order.iter().enumerate() {
            labels[i] = (rank * self.n_states) / n_obs;
        }

        // K-means iterations
        for _ in 0..10 {
            let mut sums = Array2::<f64>::zeros((self.n_states, self.n_features));
            let mut counts = vec![0usize; self.n_states];

            for (i, &label) in labels.iter().enumerate() {
                for j in 0..self.n_features {
                    sums[[label, j]] += observations[[i, j]];
                }
                counts[label] += 1;
            }

            // Empty clusters keep their previous mean
            for state in 0..self.n_states {
                if counts[state] > 0 {
                    for j in 0..self.n_features {
                        self.means[[state, j]] = sums[[state, j]] / counts[state] as f64;
                    }
                }
            }

            let mut changed = false;
            for i in 0..n_obs {
                let obs = observations.row(i);
                let mut min_dist = f64::INFINITY;
                let mut best_state = 0;

                for state in 0..self.n_states {
                    let mean = self.means.row(state);
                    let dist: f64 = obs.iter()
                        .zip(mean.iter())
                        .map(|(o, m)| (o - m).powi(2))
                        .sum();

                    if dist < min_dist {
                        min_dist = dist;
                        best_state = state;
                    }
                }
                if labels[i] != best_state {
                    labels[i] = best_state;
                    changed = true;
                }
            }
            if !changed {
                break;
            }
        }

        // Cluster covariances; small clusters borrow the pooled covariance
        let pooled = weighted_covariance(observations, &Array1::ones(n_obs), &column_means(observations));
        for state in 0..self.n_states {
            let members: Vec<usize> = (0..n_obs).filter(|&i| labels[i] == state).collect();
            let cov = if members.len() > self.n_features {
                let weights = Array1::from_iter((0..n_obs).map(|i| if labels[i] == state { 1.0 } else { 0.0 }));
                weighted_covariance(observations, &weights, &self.means.row(state).to_owned())
            } else {
                pooled.clone()
            };
            self.set_covariance(state, cov)?;
        }

        Ok(())
    }

    /// Store a covariance (plus diagonal floor) and its Cholesky factor
    pub fn set_covariance(&mut self, state: usize, mut cov: Array2<f64>) -> Result<()> {
        for j in 0..self.n_features {
            cov[[j, j]] += COVARIANCE_FLOOR;
        }
        let chol = cholesky(&cov)
            .ok_or_else(|| anyhow!("Covariance of state {} is not positive definite", state))?;
        let log_det = 2.0 * chol.diag().iter().map(|d| d.ln()).sum::<f64>();
        if !log_det.is_finite() {
            return Err(anyhow!("Covariance of state {} has a non-finite determinant", state));
        }

        self.covars[state] = cov;
        self.covar_chols[state] = chol;
        self.log_dets[state] = log_det;
        Ok(())
    }

    /// Compute log probability of observation given state
    fn log_emission_prob(&self, obs: ArrayView1<f64>, state: usize) -> f64 {
        let diff: Array1<f64> = &obs - &self.means.row(state);

        // (x-μ)ᵀ Σ⁻¹ (x-μ) = |L⁻¹(x-μ)|² with Σ = L Lᵀ
        let y = forward_substitution(&self.covar_chols[state], &diff);
        let mahal: f64 = y.iter().map(|v| v * v).sum();

        -0.5 * (self.n_features as f64 * (2.0 * PI).ln() + self.log_dets[state] + mahal)
    }

    /// Forward algorithm: compute forward probabilities in log space
    pub fn forward(&self, observations: &Array2<f64>) -> (Array2<f64>, f64) {
        let n_obs = observations.shape()[0];
        let mut log_alpha = Array2::from_elem((n_obs, self.n_states), f64::NEG_INFINITY);
        if n_obs == 0 {
            return (log_alpha, f64::NEG_INFINITY);
        }

        // Initialization
        for state in 0..self.n_states {
            log_alpha[[0, state]] = self.start_prob[state].ln()
                + self.log_emission_prob(observations.row(0), state);
        }

        // Recursion
        let mut terms = vec![0.0; self.n_states];
        for t in 1..n_obs {
            let obs = observations.row(t);
            for j in 0..self.n_states {
                for i in 0..self.n_states {
                    terms[i] = log_alpha[[t - 1, i]] + self.transition[[i, j]].ln();
                }
                log_alpha[[t, j]] = log_sum_exp(&terms) + self.log_emission_prob(obs, j);
            }
        }

        // Termination
        let log_prob = log_sum_exp(&log_alpha.row(n_obs - 1).to_vec());

        (log_alpha, log_prob)
    }

    /// Backward algorithm: compute backward probabilities in log space
    fn backward(&self, observations: &Array2<f64>) -> Array2<f64> {
        let n_obs = observations.shape()[0];
        let mut log_beta = Array2::from_elem((n_obs, self.n_states), f64::NEG_INFINITY);
        if n_obs == 0 {
            return log_beta;
        }

        for state in 0..self.n_states {
            log_beta[[n_obs - 1, state]] = 0.0; // log(1)
        }

        let mut terms = vec![0.0; self.n_states];
        for t in (0..n_obs - 1).rev() {
            let obs_next = observations.row(t + 1);
            let emissions: Vec<f64> = (0..self.n_states)
                .map(|j| self.log_emission_prob(obs_next, j))
                .collect();
            for i in 0..self.n_states {
                for j in 0..self.n_states {
                    terms[j] = self.transition[[i, j]].ln() + emissions[j] + log_beta[[t + 1, j]];
                }
                log_beta[[t, i]] = log_sum_exp(&terms);
            }
        }

        log_beta
    }

    /// One step of the forward recursion.
    /// Takes the previous normalized log posterior (None at the series start)
    /// and returns the normalized log posterior after observing `obs`.
    pub fn filter_step(&self, prev_log_post: Option<&Array1<f64>>, obs: ArrayView1<f64>) -> Array1<f64> {
        let mut log_alpha = Array1::from_elem(self.n_states, f64::NEG_INFINITY);
        let mut terms = vec![0.0; self.n_states];

        for j in 0..self.n_states {
            let prior = match prev_log_post {
                Some(prev) => {
                    for i in 0..self.n_states {
                        terms[i] = prev[i] + self.transition[[i, j]].ln();
                    }
                    log_sum_exp(&terms)
                }
                None => self.start_prob[j].ln(),
            };
            log_alpha[j] = prior + self.log_emission_prob(obs, j);
        }

        let norm = log_sum_exp(&log_alpha.to_vec());
        log_alpha.mapv(|v| v - norm)
    }

    /// Normalized log posterior of the last observation given the whole sequence
    pub fn filtered_log_posterior(&self, observations: &Array2<f64>) -> Option<Array1<f64>> {
        let n_obs = observations.shape()[0];
        if n_obs == 0 {
            return None;
        }
        let (log_alpha, log_prob) = self.forward(observations);
        if !log_prob.is_finite() {
            return None;
        }
        Some(log_alpha.row(n_obs - 1).mapv(|v| v - log_prob))
    }

    /// Train HMM using Baum-Welch EM algorithm.
    /// Stops early (not converged) when `deadline` passes.
    pub fn fit(
        &mut self,
        observations: &Array2<f64>,
        n_iter: usize,
        tol: f64,
        deadline: Option<Instant>,
    ) -> Result<FitReport> {
        if observations.shape()[1] != self.n_features {
            return Err(anyhow!("Observation features mismatch"));
        }

        let n_obs = observations.shape()[0];
        if n_obs < self.min_observations() {
            return Err(anyhow!(
                "Training window too short: need at least {} observations, got {}",
                self.min_observations(),
                n_obs
            ));
        }

        self.init_with_kmeans(observations)?;

        let mut prev_log_prob = f64::NEG_INFINITY;

        for iteration in 0..n_iter {
            if deadline.map_or(false, |d| Instant::now() >= d) {
                return Ok(FitReport {
                    log_likelihood: prev_log_prob,
                    iterations: iteration,
                    converged: false,
                    timed_out: true,
                });
            }

            // E-step: compute forward-backward
            let (log_alpha, log_prob) = self.forward(observations);
            if !log_prob.is_finite() {
                return Err(anyhow!("Log-likelihood is not finite at iteration {}", iteration + 1));
            }
            let log_beta = self.backward(observations);

            // Check convergence
            if (log_prob - prev_log_prob).abs() < tol {
                return Ok(FitReport {
                    log_likelihood: log_prob,
                    iterations: iteration + 1,
                    converged: true,
                    timed_out: false,
                });
            }
            prev_log_prob = log_prob;

            // State occupation probabilities
            let mut gamma = Array2::zeros((n_obs, self.n_states));
            for t in 0..n_obs {
                for state in 0..self.n_states {
                    gamma[[t, state]] = (log_alpha[[t, state]] + log_beta[[t, state]] - log_prob).exp();
                }
            }

            // Expected transition counts
            let mut xi_sum = Array2::<f64>::zeros((self.n_states, self.n_states));
            for t in 0..n_obs - 1 {
                let obs_next = observations.row(t + 1);
                let emissions: Vec<f64> = (0..self.n_states)
                    .map(|j| self.log_emission_prob(obs_next, j))
                    .collect();
                for i in 0..self.n_states {
                    for j in 0..self.n_states {
                        let log_xi = log_alpha[[t, i]]
                            + self.transition[[i, j]].ln()
                            + emissions[j]
                            + log_beta[[t + 1, j]]
                            - log_prob;
                        xi_sum[[i, j]] += log_xi.exp();
                    }
                }
            }

            // M-step: update parameters
            for state in 0..self.n_states {
                self.start_prob[state] = gamma[[0, state]];
            }

            for i in 0..self.n_states {
                let row_sum: f64 = xi_sum.row(i).sum();
                if row_sum > 0.0 {
                    for j in 0..self.n_states {
                        self.transition[[i, j]] = xi_sum[[i, j]] / row_sum;
                    }
                }
            }

            for state in 0..self.n_states {
                let weights = gamma.column(state).to_owned();
                let gamma_sum: f64 = weights.sum();
                if gamma_sum < MIN_STATE_OCCUPANCY {
                    return Err(anyhow!("State {} has no occupancy after iteration {}", state, iteration + 1));
                }

                let mut mean = Array1::zeros(self.n_features);
                for t in 0..n_obs {
                    mean.scaled_add(weights[t], &observations.row(t));
                }
                mean /= gamma_sum;
                self.means.row_mut(state).assign(&mean);

                let cov = weighted_covariance(observations, &weights, &mean);
                self.set_covariance(state, cov)?;
            }
        }

        // Did not converge within n_iter iterations
        Ok(FitReport {
            log_likelihood: prev_log_prob,
            iterations: n_iter,
            converged: false,
            timed_out: false,
        })
    }

    /// Predict most likely state sequence using Viterbi algorithm
    pub fn predict(&self, observations: &Array2<f64>) -> Result<Vec<usize>> {
        if observations.shape()[1] != self.n_features {
            return Err(anyhow!("Observation features mismatch"));
        }

        let n_obs = observations.shape()[0];
        if n_obs == 0 {
            return Ok(Vec::new());
        }
        let mut log_delta = Array2::from_elem((n_obs, self.n_states), f64::NEG_INFINITY);
        let mut psi = Array2::<usize>::zeros((n_obs, self.n_states));

        for state in 0..self.n_states {
            log_delta[[0, state]] = self.start_prob[state].ln()
                + self.log_emission_prob(observations.row(0), state);
        }

        for t in 1..n_obs {
            let obs = observations.row(t);
            for j in 0..self.n_states {
                let mut max_val = f64::NEG_INFINITY;
                let mut max_state = 0;

                for i in 0..self.n_states {
                    let val = log_delta[[t - 1, i]] + self.transition[[i, j]].ln();
                    if val > max_val {
                        max_val = val;
                        max_state = i;
                    }
                }

                log_delta[[t, j]] = max_val + self.log_emission_prob(obs, j);
                psi[[t, j]] = max_state;
            }
        }

        // Backtracking
        let mut states = vec![0; n_obs];
        let mut max_val = f64::NEG_INFINITY;
        for state in 0..self.n_states {
            if log_delta[[n_obs - 1, state]] > max_val {
                max_val = log_delta[[n_obs - 1, state]];
                states[n_obs - 1] = state;
            }
        }

        for t in (0..n_obs - 1).rev() {
            states[t] = psi[[t + 1, states[t + 1]]];
        }

        Ok(states)
    }
}

fn column_means(observations: &Array2<f64>) -> Array1<f64> {
    let n = observations.shape()[0].max(1) as f64;
    observations.sum_axis(ndarray::Axis(0)) / n
}

/// Σ_t w_t (x_t - μ)(x_t - μ)ᵀ / Σ_t w_t
fn weighted_covariance(observations: &Array2<f64>, weights: &Array1<f64>, mean: &Array1<f64>) -> Array2<f64> {
    let n_features = observations.shape()[1];
    let mut cov = Array2::zeros((n_features, n_features));
    let total: f64 = weights.sum();
    if total <= 0.0 {
        return cov;
    }

    for (t, row) in observations.outer_iter().enumerate() {
        let w = weights[t];
        if w == 0.0 {
            continue;
        }
        let diff = &row - mean;
        for i in 0..n_features {
            for j in 0..=i {
                cov[[i, j]] += w * diff[i] * diff[j];
            }
        }
    }
    for i in 0..n_features {
        for j in 0..i {
            cov[[j, i]] = cov[[i, j]];
        }
    }
    cov / total
}

/// Lower-triangular Cholesky factor, None if the matrix is not positive definite
pub fn cholesky(mat: &Array2<f64>) -> Option<Array2<f64>> {
    let n = mat.shape()[0];
    let mut l = Array2::<f64>::zeros((n, n));

    for i in 0..n {
        for j in 0..=i {
            let mut sum = mat[[i, j]];
            for k in 0..j {
                sum -= l[[i, k]] * l[[j, k]];
            }
            if i == j {
                if !(sum > 0.0) || !sum.is_finite() {
                    return None;
                }
                l[[i, i]] = sum.sqrt();
            } else {
                l[[i, j]] = sum / l[[j, j]];
            }
        }
    }

    Some(l)
}

/// Solve L y = b for lower-triangular L
fn forward_substitution(l: &Array2<f64>, b: &Array1<f64>) -> Array1<f64> {
    let n = b.len();
    let mut y = Array1::zeros(n);
    for i in 0..n {
        let mut sum = b[i];
        for k in 0..i {
            sum -= l[[i, k]] * y[k];
        }
        y[i] = sum / l[[i, i]];
    }
    y
}

/// Log-sum-exp trick for numerical stability
pub fn log_sum_exp(log_values: &[f64]) -> f64 {
    if log_values.is_empty() {
        return f64::NEG_INFINITY;
    }

    let max_val = log_values.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    if max_val == f64::NEG_INFINITY {
        return f64::NEG_INFINITY;
    }

    let sum_exp: f64 = log_values.iter().map(|&v| (v - max_val).exp()).sum();
    max_val + sum_exp.ln()
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Two well separated clusters in 2D, first half then second half
    fn two_regime_observations(n: usize) -> Array2<f64> {
        let mut data = Array2::zeros((n, 2));
        for i in 0..n {
            let wiggle = ((i * 7919) % 13) as f64 / 13.0 - 0.5;
            let wiggle2 = ((i * 104729) % 11) as f64 / 11.0 - 0.5;
            let (a, b) = if i < n / 2 { (-2.0, 1.0) } else { (2.0, -1.0) };
            data[[i, 0]] = a + 0.3 * wiggle;
            data[[i, 1]] = b + 0.3 * wiggle2;
        }
        data
    }

    #[test]
    fn test_hmm_creation() {
        let hmm = GaussianHMM::new(4, 6);
        assert_eq!(hmm.n_states, 4);
        assert_eq!(hmm.n_features, 6);
        assert_eq!(hmm.transition.shape(), &[4, 4]);
        assert_eq!(hmm.means.shape(), &[4, 6]);
        assert_eq!(hmm.covars.len(), 4);
        for row in hmm.transition.outer_iter() {
            assert!((row.sum() - 1.0).abs() < 1e-12);
        }
    }

    #[test]
    fn test_log_sum_exp() {
        let values = vec![-1.0, -2.0, -3.0];
        let result = log_sum_exp(&values);
        assert!(result > -1.0 && result < 0.0);
        assert_eq!(log_sum_exp(&[]), f64::NEG_INFINITY);
    }

    #[test]
    fn test_cholesky_rejects_singular() {
        let singular = ndarray::arr2(&[[1.0, 1.0], [1.0, 1.0]]);
        assert!(cholesky(&singular).is_none());

        let spd = ndarray::arr2(&[[4.0, 2.0], [2.0, 3.0]]);
        let l = cholesky(&spd).unwrap();
        let rebuilt = l.dot(&l.t());
        assert!((rebuilt[[0, 1]] - 2.0).abs() < 1e-12);
        assert!((rebuilt[[1, 1]] - 3.0).abs() < 1e-12);
    }

    #[test]
    fn test_fit_separates_two_regimes() {
        let obs = two_regime_observations(200);
        let mut hmm = GaussianHMM::new(2, 2);
        let report = hmm.fit(&obs, 100, 1e-6, None).unwrap();

        assert!(report.converged);
        assert!(report.log_likelihood.is_finite());

        let states = hmm.predict(&obs).unwrap();
        assert_ne!(states[10], states[190]);
        assert!(states[..100].iter().all(|&s| s == states[0]));
        assert!(states[100..].iter().all(|&s| s == states[199]));
    }

    #[test]
    fn test_filter_step_matches_forward() {
        let obs = two_regime_observations(80);
        let mut hmm = GaussianHMM::new(2, 2);
        hmm.fit(&obs, 50, 1e-6, None).unwrap();

        let mut post = None;
        for t in 0..obs.shape()[0] {
            post = Some(hmm.filter_step(post.as_ref(), obs.row(t)));
        }
        let incremental = post.unwrap();
        let batch = hmm.filtered_log_posterior(&obs).unwrap();
        for s in 0..2 {
            assert!((incremental[s] - batch[s]).abs() < 1e-8);
        }
        let total: f64 = incremental.iter().map(|v| v.exp()).sum();
        assert!((total - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_fit_rejects_short_window() {
        let obs = two_regime_observations(6);
        let mut hmm = GaussianHMM::new(3, 2);
        assert!(hmm.fit(&obs, 10, 1e-4, None).is_err());
    }

    #[test]
    fn test_expired_deadline_stops_fit() {
        let obs = two_regime_observations(100);
        let mut hmm = GaussianHMM::new(2, 2);
        let report = hmm.fit(&obs, 100, 1e-6, Some(Instant::now())).unwrap();
        assert!(report.timed_out);
        assert!(!report.converged);
        assert_eq!(report.iterations, 0);
    }
}
