use super::{FilterAction, FilterContext, SignalFilter};
use crate::config::TrendFilterParams;
use crate::indicators::{Indicator, RollingWindow};
use crate::types::{AllocationVector, WEIGHT_EPSILON};

/// Scales down assets whose price index is below its simple moving average
pub struct TrendFilter {
    params: TrendFilterParams,
    assets: Vec<String>,
    cash_asset: Option<String>,
    /// Compounded price index per asset, starting at 1
    levels: Vec<f64>,
    windows: Vec<RollingWindow>,
}

impl TrendFilter {
    pub fn new(params: TrendFilterParams, assets: &[String], cash_asset: Option<String>) -> Self {
        Self {
            windows: vec![RollingWindow::new(params.ma_window); assets.len()],
            levels: vec![1.0; assets.len()],
            assets: assets.to_vec(),
            cash_asset,
            params,
        }
    }

    /// Some(true) below the average, None while warming up
    pub fn is_unfavorable(&self, asset: &str) -> Option<bool> {
        let idx = self.assets.iter().position(|a| a == asset)?;
        let window = &self.windows[idx];
        if !window.is_ready() {
            return None;
        }
        let average = window.mean()?;
        Some(self.levels[idx] < average)
    }

    fn is_cash(&self, asset: &str) -> bool {
        self.cash_asset.as_deref() == Some(asset)
    }
}

impl SignalFilter for TrendFilter {
    fn name(&self) -> &'static str {
        "trend"
    }

    fn observe(&mut self, returns: &[f64]) {
        for (idx, r) in returns.iter().enumerate().take(self.levels.len()) {
            self.levels[idx] *= 1.0 + r;
            self.windows[idx].push(self.levels[idx]);
        }
    }

    fn apply(&self, mut allocation: AllocationVector, ctx: &mut FilterContext) -> AllocationVector {
        for asset in &self.assets {
            if self.is_cash(asset) || self.is_unfavorable(asset) != Some(true) {
                continue;
            }
            ctx.veto(asset);

            let weight = allocation.weight(asset);
            if weight <= WEIGHT_EPSILON {
                continue;
            }

            let scaled = weight * self.params.unfavorable_scale;
            let freed = weight - scaled;
            allocation.set(asset, scaled);

            let moved_to = self.cash_asset.clone();
            if let Some(cash) = &moved_to {
                allocation.add(cash, freed);
            }

            ctx.record(FilterAction::TrendScaled {
                asset: asset.clone(),
                from: weight,
                to: scaled,
                moved_to,
            });
        }

        allocation
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filters::tests::{allocation, date, tickers};

    fn params(ma_window: usize, unfavorable_scale: f64) -> TrendFilterParams {
        TrendFilterParams {
            enabled: true,
            ma_window,
            unfavorable_scale,
        }
    }

    #[test]
    fn test_passes_through_while_warming_up() {
        let mut filter = TrendFilter::new(params(5, 0.0), &tickers(&["SPY", "BIL"]), Some("BIL".into()));
        for _ in 0..4 {
            filter.observe(&[-0.02, 0.0]);
        }
        let seed = allocation(&[("SPY", 1.0)]);
        let mut ctx = FilterContext::new(date());
        assert_eq!(filter.apply(seed.clone(), &mut ctx), seed);
        assert!(ctx.vetoed.is_empty());
    }

    #[test]
    fn test_downtrend_moves_weight_to_cash() {
        let mut filter = TrendFilter::new(params(5, 0.0), &tickers(&["SPY", "TLT", "BIL"]), Some("BIL".into()));
        for _ in 0..10 {
            filter.observe(&[-0.01, 0.01, -0.001]);
        }

        let mut ctx = FilterContext::new(date());
        let out = filter.apply(allocation(&[("SPY", 0.6), ("TLT", 0.4)]), &mut ctx);

        assert_eq!(out.weight("SPY"), 0.0);
        assert!((out.weight("BIL") - 0.6).abs() < 1e-12);
        assert!((out.weight("TLT") - 0.4).abs() < 1e-12);
        assert!(ctx.is_vetoed("SPY"));
        // Cash is never trend filtered even in its own downtrend
        assert!(!ctx.is_vetoed("BIL"));
        assert_eq!(ctx.actions.len(), 1);
    }

    #[test]
    fn test_partial_scale_without_cash_leaves_weight_uninvested() {
        let mut filter = TrendFilter::new(params(3, 0.5), &tickers(&["QQQ", "SPY"]), None);
        for _ in 0..5 {
            filter.observe(&[-0.01, -0.01]);
        }

        let mut ctx = FilterContext::new(date());
        let out = filter.apply(allocation(&[("QQQ", 0.8)]), &mut ctx);
        assert!((out.weight("QQQ") - 0.4).abs() < 1e-12);
        assert!((out.net_exposure() - 0.4).abs() < 1e-12);
        // Unheld assets in a downtrend are still vetoed
        assert!(ctx.is_vetoed("SPY"));
    }
}
