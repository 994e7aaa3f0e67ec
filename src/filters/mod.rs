pub mod correlation;
pub mod trend;
pub mod volatility;

pub use correlation::CorrelationFilter;
pub use trend::TrendFilter;
pub use volatility::VolatilityControl;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tracing::debug;

use crate::config::StrategyConfig;
use crate::indicators::{Indicator, RollingWindow};
use crate::types::AllocationVector;

/// What a filter did to the allocation passing through it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FilterAction {
    /// Asset trades below its moving average
    TrendScaled {
        asset: String,
        from: f64,
        to: f64,
        moved_to: Option<String>,
    },
    /// Combined weight of a correlated cluster was capped
    ClusterCapped {
        members: Vec<String>,
        weight_before: f64,
        cap: f64,
        excess: f64,
        /// None when no eligible asset could absorb the excess
        recipient: Option<String>,
    },
    VolatilityScaled { realized_vol: f64, multiplier: f64 },
    /// Not enough return history to estimate volatility
    VolatilityWarmup { observations: usize, required: usize },
    ShortsClamped { assets: Vec<String> },
    LeverageCapped { gross_before: f64, cap: f64 },
}

impl FilterAction {
    /// True when the step fell back to a degraded behaviour
    pub fn is_flag(&self) -> bool {
        match self {
            FilterAction::VolatilityWarmup { .. } => true,
            FilterAction::ClusterCapped { recipient, .. } => recipient.is_none(),
            _ => false,
        }
    }
}

/// State handed down the chain for one decision
#[derive(Debug, Clone)]
pub struct FilterContext {
    pub date: NaiveDate,
    /// Assets an earlier stage judged unfavorable
    pub vetoed: BTreeSet<String>,
    pub actions: Vec<FilterAction>,
}

impl FilterContext {
    pub fn new(date: NaiveDate) -> Self {
        Self {
            date,
            vetoed: BTreeSet::new(),
            actions: Vec::new(),
        }
    }

    pub fn veto(&mut self, asset: &str) {
        self.vetoed.insert(asset.to_string());
    }

    pub fn is_vetoed(&self, asset: &str) -> bool {
        self.vetoed.contains(asset)
    }

    pub fn record(&mut self, action: FilterAction) {
        self.actions.push(action);
    }
}

/// One stage of the allocation filter chain.
///
/// `observe` is called once per step with that step's asset returns (aligned
/// with the frame's asset list). `apply` must not depend on anything but the
/// buffers filled by `observe`.
pub trait SignalFilter: Send {
    fn name(&self) -> &'static str;
    fn observe(&mut self, returns: &[f64]);
    fn apply(&self, allocation: AllocationVector, ctx: &mut FilterContext) -> AllocationVector;
}

/// Trailing per-asset return buffers
#[derive(Debug, Clone)]
pub struct ReturnHistory {
    assets: Vec<String>,
    windows: Vec<RollingWindow>,
}

impl ReturnHistory {
    pub fn new(assets: &[String], window: usize) -> Self {
        Self {
            assets: assets.to_vec(),
            windows: vec![RollingWindow::new(window); assets.len()],
        }
    }

    pub fn push(&mut self, returns: &[f64]) {
        for (window, r) in self.windows.iter_mut().zip(returns) {
            window.push(*r);
        }
    }

    /// Full window of returns for `asset`, None while warming up
    pub fn series(&self, asset: &str) -> Option<Vec<f64>> {
        let idx = self.assets.iter().position(|a| a == asset)?;
        let window = &self.windows[idx];
        window.is_ready().then(|| window.to_vec())
    }

    pub fn observations(&self) -> usize {
        self.windows.iter().map(|w| w.len()).min().unwrap_or(0)
    }

    pub fn capacity(&self) -> usize {
        self.windows.first().map(|w| w.capacity()).unwrap_or(0)
    }
}

/// Trend, correlation and volatility stages in that fixed order
pub struct FilterChain {
    filters: Vec<Box<dyn SignalFilter>>,
}

impl FilterChain {
    pub fn new(filters: Vec<Box<dyn SignalFilter>>) -> Self {
        Self { filters }
    }

    /// Enabled stages for the frame's asset list
    pub fn from_config(config: &StrategyConfig, assets: &[String]) -> Self {
        let settings = &config.filters;
        let mut filters: Vec<Box<dyn SignalFilter>> = Vec::new();

        if settings.trend.enabled {
            filters.push(Box::new(TrendFilter::new(
                settings.trend.clone(),
                assets,
                config.universe.cash_asset.clone(),
            )));
        }
        if settings.correlation.enabled {
            filters.push(Box::new(CorrelationFilter::new(
                settings.correlation.clone(),
                assets,
                config.universe.clone(),
            )));
        }
        if settings.volatility.enabled {
            filters.push(Box::new(VolatilityControl::new(
                settings.volatility.clone(),
                assets,
                config.walk_forward.periods_per_year,
            )));
        }

        Self::new(filters)
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.filters.iter().map(|f| f.name()).collect()
    }

    pub fn observe(&mut self, returns: &[f64]) {
        for filter in &mut self.filters {
            filter.observe(returns);
        }
    }

    pub fn apply(&self, seed: AllocationVector, date: NaiveDate) -> (AllocationVector, Vec<FilterAction>) {
        let mut ctx = FilterContext::new(date);
        let mut allocation = seed;
        for filter in &self.filters {
            allocation = filter.apply(allocation, &mut ctx);
        }
        if !ctx.actions.is_empty() {
            debug!("{}: {} filter actions", date, ctx.actions.len());
        }
        (allocation, ctx.actions)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2022, 6, 1).unwrap()
    }

    pub(crate) fn tickers(names: &[&str]) -> Vec<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    pub(crate) fn allocation(weights: &[(&str, f64)]) -> AllocationVector {
        let mut alloc = AllocationVector::new(Some(0), Some(date()));
        for (asset, w) in weights {
            alloc.set(asset, *w);
        }
        alloc
    }

    #[test]
    fn test_chain_order_and_disabled_stages() {
        let mut config = StrategyConfig::default();
        let assets = config.universe.all();
        assert_eq!(
            FilterChain::from_config(&config, &assets).names(),
            vec!["trend", "correlation", "volatility"]
        );

        config.filters.correlation.enabled = false;
        assert_eq!(
            FilterChain::from_config(&config, &assets).names(),
            vec!["trend", "volatility"]
        );
    }

    #[test]
    fn test_empty_chain_passes_through() {
        let chain = FilterChain::new(Vec::new());
        let seed = allocation(&[("SPY", 0.7), ("TLT", 0.3)]);
        let (out, actions) = chain.apply(seed.clone(), date());
        assert_eq!(out, seed);
        assert!(actions.is_empty());
    }

    #[test]
    fn test_return_history_warmup() {
        let mut history = ReturnHistory::new(&tickers(&["SPY", "TLT"]), 3);
        history.push(&[0.01, 0.0]);
        history.push(&[0.02, 0.0]);
        assert!(history.series("SPY").is_none());
        history.push(&[0.03, 0.0]);
        history.push(&[0.04, 0.0]);
        assert_eq!(history.series("SPY").unwrap(), vec![0.02, 0.03, 0.04]);
        assert_eq!(history.observations(), 3);
        assert!(history.series("QQQ").is_none());
    }

    #[test]
    fn test_flags() {
        assert!(FilterAction::VolatilityWarmup { observations: 3, required: 20 }.is_flag());
        assert!(!FilterAction::LeverageCapped { gross_before: 2.0, cap: 1.5 }.is_flag());
    }
}
