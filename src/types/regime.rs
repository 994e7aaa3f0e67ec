use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use super::FeatureFrame;

/// Canonical regime id. Stable across refits once aligned by the state registry.
pub type RegimeId = usize;

/// Out-of-sample regime estimate for one step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegimeLabel {
    pub regime: RegimeId,
    /// Filtered state posterior, indexed by canonical regime id
    pub probabilities: Vec<f64>,
}

impl RegimeLabel {
    pub fn from_probabilities(probabilities: Vec<f64>) -> Self {
        let regime = argmax(&probabilities);
        Self {
            regime,
            probabilities,
        }
    }
}

/// Index of the largest value; the lowest index wins ties
pub fn argmax(values: &[f64]) -> usize {
    let mut best = 0;
    for (i, v) in values.iter().enumerate() {
        if *v > values[best] {
            best = i;
        }
    }
    best
}

/// Audit flags attached to a regime row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RegimeDiagnostic {
    /// The model was refit on rows [0, cutoff) before labelling this row
    Refit { cutoff: usize, iterations: usize },
    /// The refit covering this row failed
    ModelFitDegenerate { cutoff: usize, reason: String },
    /// Label and probabilities were carried from the last valid row
    CarryForward { from: Option<NaiveDate> },
    /// State matching at the covering refit was a near-tie
    LabelAlignmentAmbiguity { cutoff: usize, best: f64, runner_up: f64 },
}

impl RegimeDiagnostic {
    /// True when the row used a fallback or approximation
    pub fn is_fallback(&self) -> bool {
        !matches!(self, RegimeDiagnostic::Refit { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegimeRow {
    pub date: NaiveDate,
    /// Absent for rows inside the initial training window
    pub label: Option<RegimeLabel>,
    pub diagnostics: Vec<RegimeDiagnostic>,
}

impl RegimeRow {
    pub fn regime(&self) -> Option<RegimeId> {
        self.label.as_ref().map(|l| l.regime)
    }

    pub fn is_flagged(&self) -> bool {
        self.diagnostics.iter().any(|d| d.is_fallback())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RefitOutcome {
    Accepted,
    Ambiguous { best: f64, runner_up: f64 },
    Degenerate { reason: String },
}

/// Summary of one refit of the walk-forward engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefitRecord {
    /// Training window is rows [0, cutoff)
    pub cutoff: usize,
    pub log_likelihood: Option<f64>,
    pub iterations: usize,
    pub converged: bool,
    /// permutation[raw_state] = canonical regime id
    pub permutation: Option<Vec<usize>>,
    pub outcome: RefitOutcome,
}

/// Feature frame augmented with one regime row per input row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegimeFrame {
    pub frame: FeatureFrame,
    pub regimes: Vec<RegimeRow>,
    /// Index of the first row that can carry a prediction
    pub first_prediction: usize,
    pub n_states: usize,
    pub refits: Vec<RefitRecord>,
}

impl RegimeFrame {
    pub fn predicted_rows(&self) -> &[RegimeRow] {
        &self.regimes[self.first_prediction.min(self.regimes.len())..]
    }

    pub fn flagged_count(&self) -> usize {
        self.regimes.iter().filter(|r| r.is_flagged()).count()
    }
}

/// Hysteresis-smoothed regime
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SmoothedRegime {
    pub regime: RegimeId,
    /// Consecutive steps this regime has been held, including the current one
    pub persistence: usize,
    /// Raw posterior of the held regime at the current step
    pub confidence: f64,
    /// Challenger label and how many consecutive steps it has been observed
    pub pending: Option<(RegimeId, usize)>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_label_from_probabilities() {
        let label = RegimeLabel::from_probabilities(vec![0.2, 0.7, 0.1]);
        assert_eq!(label.regime, 1);
        assert_eq!(label.probabilities.len(), 3);
    }

    #[test]
    fn test_argmax_prefers_lowest_index_on_tie() {
        assert_eq!(argmax(&[0.5, 0.5]), 0);
        assert_eq!(argmax(&[0.1, 0.45, 0.45]), 1);
    }

    #[test]
    fn test_refit_is_not_a_fallback() {
        let row = RegimeRow {
            date: NaiveDate::from_ymd_opt(2021, 3, 1).unwrap(),
            label: None,
            diagnostics: vec![RegimeDiagnostic::Refit { cutoff: 10, iterations: 4 }],
        };
        assert!(!row.is_flagged());

        let flagged = RegimeRow {
            diagnostics: vec![RegimeDiagnostic::CarryForward { from: None }],
            ..row
        };
        assert!(flagged.is_flagged());
    }
}
