use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::errors::StrategyError;
use crate::types::{AssetUniverse, AssetWeight, RegimeId};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StrategyConfig {
    /// Feature columns fed to the HMM, in order
    pub features: Vec<String>,
    pub walk_forward: WalkForwardSettings,
    pub stabilizer: StabilizerSettings,
    pub filters: FilterSettings,
    pub universe: AssetUniverse,
    pub allocation: AllocationSettings,
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            features: vec![
                "credit_spread_mom".to_string(),
                "vix_mom".to_string(),
                "tech_mom".to_string(),
            ],
            walk_forward: WalkForwardSettings::default(),
            stabilizer: StabilizerSettings::default(),
            filters: FilterSettings::default(),
            universe: AssetUniverse::default(),
            allocation: AllocationSettings::default(),
        }
    }
}

impl StrategyConfig {
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        // Features
        if self.features.is_empty() {
            errors.push("at least one feature must be configured".to_string());
        }
        let unique: BTreeSet<&String> = self.features.iter().collect();
        if unique.len() != self.features.len() {
            errors.push("features must not contain duplicates".to_string());
        }
        if !self.features.contains(&self.walk_forward.ordering_feature) {
            errors.push(format!(
                "walk_forward.ordering_feature '{}' is not one of the configured features",
                self.walk_forward.ordering_feature
            ));
        }

        // Walk-forward
        let wf = &self.walk_forward;
        if wf.min_train_years == 0 {
            errors.push("walk_forward.min_train_years must be >= 1".to_string());
        }
        if wf.periods_per_year == 0 {
            errors.push("walk_forward.periods_per_year must be >= 1".to_string());
        }
        if wf.refit_cadence == RefitCadence::Periodic && wf.refit_every == 0 {
            errors.push("walk_forward.refit_every must be >= 1 for periodic refits".to_string());
        }
        if wf.n_states < 2 || wf.n_states > MAX_STATES {
            errors.push(format!("walk_forward.n_states must be between 2 and {}", MAX_STATES));
        }
        if wf.max_iter == 0 {
            errors.push("walk_forward.max_iter must be >= 1".to_string());
        }
        if wf.tolerance <= 0.0 {
            errors.push("walk_forward.tolerance must be > 0".to_string());
        }
        if wf.alignment_tie_tolerance < 0.0 {
            errors.push("walk_forward.alignment_tie_tolerance must be >= 0".to_string());
        }

        // Stabilizer
        if self.stabilizer.hysteresis_k == 0 {
            errors.push("stabilizer.hysteresis_k must be >= 1".to_string());
        }

        // Filters
        let trend = &self.filters.trend;
        if trend.ma_window < 2 {
            errors.push("filters.trend.ma_window must be >= 2".to_string());
        }
        if !(0.0..=1.0).contains(&trend.unfavorable_scale) {
            errors.push("filters.trend.unfavorable_scale must be between 0 and 1".to_string());
        }

        let corr = &self.filters.correlation;
        if corr.correlation_threshold <= 0.0 || corr.correlation_threshold >= 1.0 {
            errors.push("filters.correlation.correlation_threshold must be in (0, 1)".to_string());
        }
        if corr.window < 3 {
            errors.push("filters.correlation.window must be >= 3".to_string());
        }
        if corr.max_cluster_weight <= 0.0 || corr.max_cluster_weight > 1.0 {
            errors.push("filters.correlation.max_cluster_weight must be in (0, 1]".to_string());
        }

        let vol = &self.filters.volatility;
        if vol.target_volatility <= 0.0 {
            errors.push("filters.volatility.target_volatility must be > 0".to_string());
        }
        if vol.max_leverage < 1.0 {
            errors.push("filters.volatility.max_leverage must be >= 1".to_string());
        }
        if vol.window < 2 {
            errors.push("filters.volatility.window must be >= 2".to_string());
        }

        // Universe
        if self.universe.is_empty() {
            errors.push("asset universe is empty".to_string());
        }
        for ticker in &self.universe.risk_on {
            if self.universe.risk_off.contains(ticker) {
                errors.push(format!("{} is listed as both risk-on and risk-off", ticker));
            }
        }
        if let Some(cash) = &self.universe.cash_asset {
            if self.universe.group_of(cash).is_none() {
                errors.push(format!("cash asset {} is not part of the universe", cash));
            }
        }

        // Regime -> weights table
        let mut seen = BTreeSet::new();
        for row in &self.allocation.regimes {
            if row.state >= wf.n_states {
                errors.push(format!(
                    "allocation: state {} is out of range for {} states",
                    row.state, wf.n_states
                ));
            }
            if !seen.insert(row.state) {
                errors.push(format!("allocation: state {} is listed twice", row.state));
            }
            let mut assets = BTreeSet::new();
            for AssetWeight { asset, weight } in &row.weights {
                if self.universe.group_of(asset).is_none() {
                    errors.push(format!("allocation: {} is not part of the universe", asset));
                }
                if !assets.insert(asset.as_str()) {
                    errors.push(format!(
                        "allocation: {} is listed twice in state {}",
                        asset, row.state
                    ));
                }
                if !weight.is_finite() || (*weight < 0.0 && !vol.allow_short) {
                    errors.push(format!(
                        "allocation: weight {} for {} in state {} is not allowed",
                        weight, asset, row.state
                    ));
                }
            }
            let gross: f64 = row.weights.iter().map(|w| w.weight.abs()).sum();
            if gross > 1.0 + 1e-9 {
                errors.push(format!(
                    "allocation: state {} has gross weight {:.4} > 1",
                    row.state, gross
                ));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Validate and convert problems into the fatal configuration error
    pub fn validated(self) -> Result<Self, StrategyError> {
        self.validate().map_err(StrategyError::FilterConfiguration)?;
        Ok(self)
    }

    pub fn min_train_periods(&self) -> usize {
        self.walk_forward.min_train_years * self.walk_forward.periods_per_year
    }
}

pub const MAX_STATES: usize = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RefitCadence {
    EveryStep,
    Periodic,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WalkForwardSettings {
    pub min_train_years: usize,
    pub periods_per_year: usize,
    pub refit_cadence: RefitCadence,
    /// Periods between refits when the cadence is periodic
    pub refit_every: usize,
    pub n_states: usize,
    pub max_iter: usize,
    pub tolerance: f64,
    /// Feature whose emission mean orders the states of the first fit
    pub ordering_feature: String,
    /// Relative cost gap under which two state matchings count as tied
    pub alignment_tie_tolerance: f64,
    /// Wall-clock budget per refit; unlimited when absent
    pub fit_timeout_ms: Option<u64>,
}

impl Default for WalkForwardSettings {
    fn default() -> Self {
        Self {
            min_train_years: 5,
            periods_per_year: 252,
            refit_cadence: RefitCadence::Periodic,
            refit_every: 21,
            n_states: 3,
            max_iter: 100,
            tolerance: 1e-4,
            ordering_feature: "vix_mom".to_string(),
            alignment_tie_tolerance: 1e-3,
            fit_timeout_ms: None,
        }
    }
}

impl WalkForwardSettings {
    /// Number of rows between two refits
    pub fn cadence(&self) -> usize {
        match self.refit_cadence {
            RefitCadence::EveryStep => 1,
            RefitCadence::Periodic => self.refit_every.max(1),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StabilizerSettings {
    pub hysteresis_k: usize,
}

impl Default for StabilizerSettings {
    fn default() -> Self {
        Self { hysteresis_k: 3 }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterSettings {
    pub trend: TrendFilterParams,
    pub correlation: CorrelationFilterParams,
    pub volatility: VolatilityControlParams,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrendFilterParams {
    pub enabled: bool,
    pub ma_window: usize,
    /// Multiplier applied to an asset trading below its moving average
    pub unfavorable_scale: f64,
}

impl Default for TrendFilterParams {
    fn default() -> Self {
        Self {
            enabled: true,
            ma_window: 200,
            unfavorable_scale: 0.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CorrelationFilterParams {
    pub enabled: bool,
    pub window: usize,
    pub correlation_threshold: f64,
    /// Cap on the combined weight of one correlated cluster
    pub max_cluster_weight: f64,
}

impl Default for CorrelationFilterParams {
    fn default() -> Self {
        Self {
            enabled: true,
            window: 60,
            correlation_threshold: 0.8,
            max_cluster_weight: 0.6,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VolatilityControlParams {
    pub enabled: bool,
    pub window: usize,
    /// Annualized
    pub target_volatility: f64,
    pub max_leverage: f64,
    pub allow_short: bool,
}

impl Default for VolatilityControlParams {
    fn default() -> Self {
        Self {
            enabled: true,
            window: 20,
            target_volatility: 0.12,
            max_leverage: 1.5,
            allow_short: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegimeWeights {
    pub state: RegimeId,
    pub weights: Vec<AssetWeight>,
}

impl RegimeWeights {
    pub fn new(state: RegimeId, weights: &[(&str, f64)]) -> Self {
        Self {
            state,
            weights: weights
                .iter()
                .map(|(asset, weight)| AssetWeight {
                    asset: asset.to_string(),
                    weight: *weight,
                })
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AllocationSettings {
    pub regimes: Vec<RegimeWeights>,
}

impl Default for AllocationSettings {
    fn default() -> Self {
        let row = RegimeWeights::new;

        // States are ordered by ascending vix momentum: 0 is the calmest
        Self {
            regimes: vec![
                row(0, &[("QQQ", 0.6), ("SPY", 0.4)]),
                row(1, &[("SPY", 0.5), ("TLT", 0.25), ("GLD", 0.25)]),
                row(2, &[("TLT", 0.4), ("GLD", 0.3), ("BIL", 0.3)]),
            ],
        }
    }
}

impl AllocationSettings {
    pub fn weights_for(&self, regime: RegimeId) -> Option<&[AssetWeight]> {
        self.regimes.iter().find(|r| r.state == regime).map(|r| r.weights.as_slice())
    }
}
