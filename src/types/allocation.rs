use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use super::RegimeId;

/// Weights below this magnitude are treated as flat
pub const WEIGHT_EPSILON: f64 = 1e-12;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssetGroup {
    RiskOn,
    RiskOff,
}

impl fmt::Display for AssetGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AssetGroup::RiskOn => write!(f, "risk-on"),
            AssetGroup::RiskOff => write!(f, "risk-off"),
        }
    }
}

/// Tradable tickers partitioned into risk-on and risk-off groups
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssetUniverse {
    pub risk_on: Vec<String>,
    pub risk_off: Vec<String>,
    /// Receives weight released by the filters (e.g. a T-bill ETF)
    pub cash_asset: Option<String>,
}

impl Default for AssetUniverse {
    fn default() -> Self {
        Self {
            risk_on: vec!["QQQ".to_string(), "SPY".to_string()],
            risk_off: vec!["TLT".to_string(), "GLD".to_string(), "BIL".to_string()],
            cash_asset: Some("BIL".to_string()),
        }
    }
}

impl AssetUniverse {
    pub fn is_empty(&self) -> bool {
        self.risk_on.is_empty() && self.risk_off.is_empty()
    }

    pub fn group_of(&self, ticker: &str) -> Option<AssetGroup> {
        if self.risk_on.iter().any(|t| t == ticker) {
            Some(AssetGroup::RiskOn)
        } else if self.risk_off.iter().any(|t| t == ticker) {
            Some(AssetGroup::RiskOff)
        } else {
            None
        }
    }

    pub fn members(&self, group: AssetGroup) -> &[String] {
        match group {
            AssetGroup::RiskOn => &self.risk_on,
            AssetGroup::RiskOff => &self.risk_off,
        }
    }

    pub fn all(&self) -> Vec<String> {
        self.risk_on.iter().chain(self.risk_off.iter()).cloned().collect()
    }
}

/// Tickers are carried as values, never as table keys: config layering
/// lowercases keys.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssetWeight {
    pub asset: String,
    pub weight: f64,
}

/// Target weight per asset for one step.
/// Unallocated weight (1 - net exposure) is held as uninvested cash.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AllocationVector {
    pub weights: BTreeMap<String, f64>,
    /// Smoothed regime the seed weights came from
    pub regime: Option<RegimeId>,
    /// Close of the step at which this allocation was decided
    pub decided_at: Option<NaiveDate>,
}

impl AllocationVector {
    pub fn new(regime: Option<RegimeId>, decided_at: Option<NaiveDate>) -> Self {
        Self {
            weights: BTreeMap::new(),
            regime,
            decided_at,
        }
    }

    pub fn with_weights(mut self, weights: &[AssetWeight]) -> Self {
        for w in weights {
            self.set(&w.asset, w.weight);
        }
        self
    }

    pub fn weight(&self, asset: &str) -> f64 {
        self.weights.get(asset).copied().unwrap_or(0.0)
    }

    pub fn set(&mut self, asset: &str, weight: f64) {
        if weight.abs() <= WEIGHT_EPSILON {
            self.weights.remove(asset);
        } else {
            self.weights.insert(asset.to_string(), weight);
        }
    }

    pub fn add(&mut self, asset: &str, delta: f64) {
        let current = self.weight(asset);
        self.set(asset, current + delta);
    }

    pub fn scale(&mut self, factor: f64) {
        let assets: Vec<String> = self.weights.keys().cloned().collect();
        for asset in assets {
            let w = self.weight(&asset);
            self.set(&asset, w * factor);
        }
    }

    pub fn is_flat(&self) -> bool {
        self.weights.is_empty()
    }

    pub fn gross_exposure(&self) -> f64 {
        self.weights.values().map(|w| w.abs()).sum()
    }

    pub fn net_exposure(&self) -> f64 {
        self.weights.values().sum()
    }

    pub fn invested(&self) -> impl Iterator<Item = (&String, &f64)> {
        self.weights.iter().filter(|(_, w)| **w > WEIGHT_EPSILON)
    }

    /// Portfolio return for one step; `returns` is aligned with `assets`
    pub fn portfolio_return(&self, assets: &[String], returns: &[f64]) -> f64 {
        assets
            .iter()
            .zip(returns.iter())
            .map(|(asset, r)| self.weight(asset) * r)
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_universe_groups() {
        let universe = AssetUniverse::default();
        assert_eq!(universe.group_of("QQQ"), Some(AssetGroup::RiskOn));
        assert_eq!(universe.group_of("GLD"), Some(AssetGroup::RiskOff));
        assert_eq!(universe.group_of("HYG"), None);
        assert_eq!(universe.all().len(), 5);
    }

    #[test]
    fn test_allocation_set_drops_zero_weights() {
        let mut alloc = AllocationVector::new(Some(0), None);
        alloc.set("SPY", 0.5);
        alloc.set("QQQ", 0.0);
        assert_eq!(alloc.weights.len(), 1);

        alloc.add("SPY", -0.5);
        assert!(alloc.is_flat());
    }

    #[test]
    fn test_portfolio_return_is_weighted_sum() {
        let mut alloc = AllocationVector::new(Some(1), None);
        alloc.set("SPY", 0.6);
        alloc.set("TLT", 0.4);
        let assets = vec!["SPY".to_string(), "QQQ".to_string(), "TLT".to_string()];
        let r = alloc.portfolio_return(&assets, &[0.01, 0.05, -0.02]);
        assert!((r - (0.006 - 0.008)).abs() < 1e-12);
    }

    #[test]
    fn test_scale_and_exposure() {
        let mut alloc = AllocationVector::new(None, None);
        alloc.set("SPY", 0.5);
        alloc.set("TLT", 0.25);
        alloc.scale(2.0);
        assert!((alloc.gross_exposure() - 1.5).abs() < 1e-12);
        assert!((alloc.net_exposure() - 1.5).abs() < 1e-12);
    }
}
