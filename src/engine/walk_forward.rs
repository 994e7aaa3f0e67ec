use anyhow::{anyhow, Result};
use chrono::NaiveDate;
use ndarray::{Array1, Array2, ArrayView1};
use tracing::{debug, info, warn};

use crate::config::{StrategyConfig, WalkForwardSettings};
use crate::errors::StrategyError;
use crate::ml::hmm::{FittedModel, GaussianHmmFitter, ModelFitter, StateRegistry};
use crate::types::{
    FeatureFrame, ObservationRow, RefitOutcome, RefitRecord, RegimeDiagnostic, RegimeFrame,
    RegimeLabel, RegimeRow,
};

/// Model currently used to label rows, with its filter state
struct ActiveModel {
    model: FittedModel,
    /// permutation[raw_state] = canonical regime id
    permutation: Vec<usize>,
    log_posterior: Option<Array1<f64>>,
}

/// Expanding-window regime labeller.
///
/// Row `t` is labelled by a model trained on rows `[0, c)` where `c <= t` is the
/// latest refit cutoff, filtered forward through row `t`. Cutoffs are
/// `min_train + k * cadence`. The engine only ever sees rows it has already
/// been stepped with, so no label can depend on a later row.
pub struct WalkForwardEngine<F: ModelFitter = GaussianHmmFitter> {
    settings: WalkForwardSettings,
    features: Vec<String>,
    min_train: usize,
    fitter: F,
    registry: StateRegistry,
    /// Row-major feature history of every row stepped so far
    history: Vec<f64>,
    n_seen: usize,
    active: Option<ActiveModel>,
    /// Diagnostics for the first row labelled after a refit
    pending: Vec<RegimeDiagnostic>,
    /// Set while the current cycle's refit has failed
    failure: Option<RegimeDiagnostic>,
    last_valid: Option<(NaiveDate, RegimeLabel)>,
    refits: Vec<RefitRecord>,
}

impl WalkForwardEngine<GaussianHmmFitter> {
    pub fn new(config: &StrategyConfig) -> Result<Self, StrategyError> {
        let ordering = ordering_index(config)?;
        let fitter = GaussianHmmFitter::from_settings(&config.walk_forward, ordering);
        Self::with_fitter(config, fitter)
    }
}

impl<F: ModelFitter> WalkForwardEngine<F> {
    pub fn with_fitter(config: &StrategyConfig, fitter: F) -> Result<Self, StrategyError> {
        let ordering = ordering_index(config)?;
        let settings = config.walk_forward.clone();
        let registry = StateRegistry::new(settings.n_states, ordering, settings.alignment_tie_tolerance);

        Ok(Self {
            min_train: config.min_train_periods(),
            features: config.features.clone(),
            settings,
            fitter,
            registry,
            history: Vec::new(),
            n_seen: 0,
            active: None,
            pending: Vec::new(),
            failure: None,
            last_valid: None,
            refits: Vec::new(),
        })
    }

    /// Forget every row and fitted model
    pub fn reset(&mut self) {
        self.registry = StateRegistry::new(
            self.settings.n_states,
            self.registry_ordering(),
            self.settings.alignment_tie_tolerance,
        );
        self.history.clear();
        self.n_seen = 0;
        self.active = None;
        self.pending.clear();
        self.failure = None;
        self.last_valid = None;
        self.refits.clear();
    }

    fn registry_ordering(&self) -> usize {
        self.features
            .iter()
            .position(|f| *f == self.settings.ordering_feature)
            .unwrap_or(0)
    }

    /// Label every row of `frame`.
    /// Rows before the first cutoff get no label.
    pub fn walk_forward_training(&mut self, frame: FeatureFrame) -> Result<RegimeFrame, StrategyError> {
        if frame.feature_names() != self.features.as_slice() {
            return Err(StrategyError::data(format!(
                "frame features {:?} do not match configured features {:?}",
                frame.feature_names(),
                self.features
            )));
        }
        if frame.len() <= self.min_train {
            return Err(StrategyError::InsufficientHistory {
                required: self.min_train,
                actual: frame.len(),
            });
        }

        self.reset();
        if let Some(first) = frame.row(self.min_train) {
            info!(
                "Walk-forward: {} rows, first prediction at row {} ({}), refit every {} rows",
                frame.len(),
                self.min_train,
                first.date,
                self.settings.cadence()
            );
        }

        let regimes: Vec<RegimeRow> = frame.rows().iter().map(|row| self.step(row)).collect();

        let degenerate = self
            .refits
            .iter()
            .filter(|r| matches!(r.outcome, RefitOutcome::Degenerate { .. }))
            .count();
        let flagged = regimes.iter().filter(|r| r.is_flagged()).count();
        info!(
            "Walk-forward complete: {} refits ({} degenerate), {} flagged rows",
            self.refits.len(),
            degenerate,
            flagged
        );

        Ok(RegimeFrame {
            frame,
            regimes,
            first_prediction: self.min_train,
            n_states: self.settings.n_states,
            refits: self.refits.clone(),
        })
    }

    /// Consume one row and return its out-of-sample label
    pub fn step(&mut self, row: &ObservationRow) -> RegimeRow {
        let t = self.n_seen;

        if t >= self.min_train && (t - self.min_train) % self.settings.cadence() == 0 {
            self.refit(t);
        }

        self.history.extend_from_slice(&row.features);
        self.n_seen += 1;

        if t < self.min_train {
            return RegimeRow {
                date: row.date,
                label: None,
                diagnostics: Vec::new(),
            };
        }

        self.label(row)
    }

    fn training_window(&self, cutoff: usize) -> Result<Array2<f64>> {
        let width = self.features.len();
        Array2::from_shape_vec((cutoff, width), self.history[..cutoff * width].to_vec())
            .map_err(|e| anyhow!("Cannot shape training window: {}", e))
    }

    /// Fit on rows [0, cutoff) and prepare the filter for row `cutoff`
    fn refit(&mut self, cutoff: usize) {
        self.pending.clear();
        self.failure = None;

        let fitted = self.training_window(cutoff).and_then(|window| {
            let model = self.fitter.fit(&window)?;
            if !model.report.converged {
                return Err(if model.report.timed_out {
                    anyhow!("fit exceeded its time budget after {} iterations", model.report.iterations)
                } else {
                    anyhow!("did not converge within {} iterations", model.report.iterations)
                });
            }
            let posterior = model
                .log_posterior_after(&window)
                .ok_or_else(|| anyhow!("training window has zero likelihood"))?;
            if posterior.iter().any(|v| v.is_nan()) {
                return Err(anyhow!("filtered posterior is not finite"));
            }
            Ok((model, posterior))
        });

        match fitted {
            Ok((model, posterior)) => {
                let alignment = self.registry.align(&model.raw_means());
                let report = model.report.clone();

                let outcome = match alignment.ambiguity {
                    Some((best, runner_up)) => {
                        let err = StrategyError::LabelAlignmentAmbiguity { cutoff, best, runner_up };
                        warn!("{}", err);
                        self.pending.push(RegimeDiagnostic::LabelAlignmentAmbiguity { cutoff, best, runner_up });
                        RefitOutcome::Ambiguous { best, runner_up }
                    }
                    None => RefitOutcome::Accepted,
                };
                self.pending.insert(0, RegimeDiagnostic::Refit {
                    cutoff,
                    iterations: report.iterations,
                });

                debug!(
                    "Refit at {}: log-likelihood {:.3} after {} iterations, permutation {:?}",
                    cutoff, report.log_likelihood, report.iterations, alignment.permutation
                );

                self.refits.push(RefitRecord {
                    cutoff,
                    log_likelihood: Some(report.log_likelihood),
                    iterations: report.iterations,
                    converged: report.converged,
                    permutation: Some(alignment.permutation.clone()),
                    outcome,
                });
                self.active = Some(ActiveModel {
                    model,
                    permutation: alignment.permutation,
                    log_posterior: Some(posterior),
                });
            }
            Err(e) => self.degrade(cutoff, e.to_string()),
        }
    }

    /// Record a failed refit and drop the model until the next cutoff
    fn degrade(&mut self, cutoff: usize, reason: String) {
        self.invalidate(cutoff, reason.clone());
        self.refits.push(RefitRecord {
            cutoff,
            log_likelihood: None,
            iterations: 0,
            converged: false,
            permutation: None,
            outcome: RefitOutcome::Degenerate { reason },
        });
    }

    /// Rows up to the next refit carry forward the last valid label
    fn invalidate(&mut self, cutoff: usize, reason: String) {
        let err = StrategyError::ModelFitDegenerate {
            cutoff,
            reason: reason.clone(),
        };
        warn!("{}; carrying forward the last valid label", err);

        self.active = None;
        self.pending.clear();
        self.failure = Some(RegimeDiagnostic::ModelFitDegenerate { cutoff, reason });
    }

    fn label(&mut self, row: &ObservationRow) -> RegimeRow {
        if let Some(active) = self.active.as_mut() {
            let observation = ArrayView1::from(&row.features[..]);
            let log_post = active.model.step(active.log_posterior.as_ref(), observation);

            if log_post.iter().all(|v| !v.is_nan()) {
                let mut probabilities = vec![0.0; log_post.len()];
                for (raw, &canonical) in active.permutation.iter().enumerate() {
                    probabilities[canonical] = log_post[raw].exp();
                }
                active.log_posterior = Some(log_post);

                let label = RegimeLabel::from_probabilities(probabilities);
                self.last_valid = Some((row.date, label.clone()));
                return RegimeRow {
                    date: row.date,
                    label: Some(label),
                    diagnostics: std::mem::take(&mut self.pending),
                };
            }

            let cutoff = self.refits.last().map(|r| r.cutoff).unwrap_or(self.min_train);
            self.invalidate(cutoff, format!("posterior became non-finite at {}", row.date));
        }

        self.carry_forward(row.date)
    }

    fn carry_forward(&self, date: NaiveDate) -> RegimeRow {
        let mut diagnostics: Vec<RegimeDiagnostic> = self.failure.iter().cloned().collect();
        diagnostics.push(RegimeDiagnostic::CarryForward {
            from: self.last_valid.as_ref().map(|(d, _)| *d),
        });

        RegimeRow {
            date,
            label: self.last_valid.as_ref().map(|(_, l)| l.clone()),
            diagnostics,
        }
    }
}

fn ordering_index(config: &StrategyConfig) -> Result<usize, StrategyError> {
    config
        .features
        .iter()
        .position(|f| *f == config.walk_forward.ordering_feature)
        .ok_or_else(|| {
            StrategyError::FilterConfiguration(vec![format!(
                "walk_forward.ordering_feature '{}' is not one of the configured features",
                config.walk_forward.ordering_feature
            )])
        })
}
