use tracing::{debug, info};

use super::results::{MetricsCalculator, StrategyResult, StrategyRow};
use crate::config::StrategyConfig;
use crate::filters::{FilterAction, FilterChain};
use crate::strategies::{RegimeAllocator, RegimeStabilizer};
use crate::types::{AllocationVector, ObservationRow, RegimeFrame, RegimeRow};

/// Turns regime labels into held allocations and realized returns.
///
/// The allocation decided at the close of step `t` is only held during
/// `t + 1`, so a step's own return never influences what is held over it.
pub struct StrategyExecutor {
    stabilizer: RegimeStabilizer,
    allocator: RegimeAllocator,
    chain: FilterChain,
    assets: Vec<String>,
    periods_per_year: usize,
    held: AllocationVector,
    held_actions: Vec<FilterAction>,
}

impl StrategyExecutor {
    pub fn new(config: &StrategyConfig, assets: &[String]) -> Self {
        Self::with_chain(config, assets, FilterChain::from_config(config, assets))
    }

    pub fn with_chain(config: &StrategyConfig, assets: &[String], chain: FilterChain) -> Self {
        info!(
            "Executor: hysteresis {}, filters {:?}, {} assets",
            config.stabilizer.hysteresis_k,
            chain.names(),
            assets.len()
        );
        Self {
            stabilizer: RegimeStabilizer::new(config.stabilizer.hysteresis_k),
            allocator: RegimeAllocator::new(config.allocation.clone()),
            chain,
            assets: assets.to_vec(),
            periods_per_year: config.walk_forward.periods_per_year,
            held: AllocationVector::default(),
            held_actions: Vec::new(),
        }
    }

    /// Process one row and return what was held during it
    pub fn step(&mut self, row: &ObservationRow, regime: &RegimeRow) -> StrategyRow {
        let held = std::mem::take(&mut self.held);
        let held_actions = std::mem::take(&mut self.held_actions);
        let realized_return = held.portfolio_return(&self.assets, &row.returns);

        self.chain.observe(&row.returns);
        let smoothed = self.stabilizer.step(regime.label.as_ref());

        let seed = self.allocator.seed(smoothed.as_ref(), row.date);
        let (next, actions) = self.chain.apply(seed, row.date);
        if next.regime != held.regime {
            debug!(
                "{}: smoothed regime {:?} -> {:?}, next allocation {:?} (net {:.2})",
                row.date, held.regime, next.regime, next.weights, next.net_exposure()
            );
        }
        self.held = next;
        self.held_actions = actions;

        StrategyRow {
            date: row.date,
            held,
            realized_return,
            raw_regime: regime.label.clone(),
            smoothed_regime: smoothed,
            regime_diagnostics: regime.diagnostics.clone(),
            filter_actions: held_actions,
        }
    }

    /// Run the whole frame. Buffers warm up on every row; rows are emitted from
    /// the first predicted row on.
    pub fn execute_strategy(&mut self, regimes: &RegimeFrame) -> StrategyResult {
        let rows = regimes.frame.rows();
        let mut emitted = Vec::with_capacity(rows.len().saturating_sub(regimes.first_prediction));

        for (t, (row, regime)) in rows.iter().zip(&regimes.regimes).enumerate() {
            let out = self.step(row, regime);
            if t >= regimes.first_prediction {
                emitted.push(out);
            }
        }

        let result = MetricsCalculator::calculate(emitted, self.periods_per_year);
        info!(
            "Strategy: {} steps, total return {:.2}%, Sharpe {:.2}, {} regime switches, {} flagged steps",
            result.periods,
            result.total_return_pct,
            result.sharpe_ratio,
            result.regime_switches,
            result.flagged_rows
        );
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RegimeWeights;
    use crate::engine::walk_forward::tests::{synthetic_frame, test_config};
    use crate::engine::WalkForwardEngine;
    use crate::types::{FeatureFrame, RegimeLabel};
    use chrono::NaiveDate;

    /// Frame with hand-written labels: regime 0 then regime 1 from row 30
    fn labelled_frame(n: usize, first_prediction: usize) -> RegimeFrame {
        let start = NaiveDate::from_ymd_opt(2015, 3, 2).unwrap();
        let rows: Vec<ObservationRow> = (0..n)
            .map(|i| ObservationRow {
                date: start + chrono::Duration::days(i as i64),
                features: vec![i as f64],
                returns: vec![0.001 * ((i % 5) as f64 - 2.0), 0.0005 * ((i % 3) as f64 - 1.0)],
            })
            .collect();
        let regimes = rows
            .iter()
            .enumerate()
            .map(|(i, r)| RegimeRow {
                date: r.date,
                label: (i >= first_prediction).then(|| {
                    let regime = if i < 30 { 0 } else { 1 };
                    let mut p = vec![0.05, 0.05];
                    p[regime] = 0.95;
                    RegimeLabel::from_probabilities(p)
                }),
                diagnostics: Vec::new(),
            })
            .collect();

        RegimeFrame {
            frame: FeatureFrame::new(vec!["x".into()], vec!["SPY".into(), "TLT".into()], rows).unwrap(),
            regimes,
            first_prediction,
            n_states: 2,
            refits: Vec::new(),
        }
    }

    fn plain_config() -> StrategyConfig {
        let mut config = StrategyConfig::default();
        config.filters.trend.enabled = false;
        config.filters.correlation.enabled = false;
        config.filters.volatility.enabled = false;
        config.stabilizer.hysteresis_k = 2;
        config.allocation.regimes = vec![
            RegimeWeights::new(0, &[("SPY", 1.0)]),
            RegimeWeights::new(1, &[("TLT", 1.0)]),
        ];
        config
    }

    #[test]
    fn test_first_emitted_row_holds_nothing() {
        let config = plain_config();
        let frame = labelled_frame(40, 10);
        let mut executor = StrategyExecutor::new(&config, frame.frame.assets());
        let result = executor.execute_strategy(&frame);

        assert_eq!(result.periods, 30);
        let first = &result.rows[0];
        assert!(first.held.is_flat());
        assert_eq!(first.realized_return, 0.0);

        // Row 11 holds what was decided at the close of row 10
        let second = &result.rows[1];
        assert_eq!(second.held.decided_at, Some(frame.frame.rows()[10].date));
        assert_eq!(second.held.weight("SPY"), 1.0);
        assert_eq!(second.realized_return, frame.frame.rows()[11].returns[0]);
    }

    #[test]
    fn test_regime_change_is_smoothed_and_lagged() {
        let config = plain_config();
        let frame = labelled_frame(40, 10);
        let mut executor = StrategyExecutor::new(&config, frame.frame.assets());
        let result = executor.execute_strategy(&frame);

        // Raw label flips at row 30, K = 2 accepts it at row 31, held from row 32
        let at = |t: usize| &result.rows[t - 10];
        assert_eq!(at(30).smoothed_regime.unwrap().regime, 0);
        assert_eq!(at(31).smoothed_regime.unwrap().regime, 1);
        assert_eq!(at(31).held.regime, Some(0));
        assert_eq!(at(32).held.regime, Some(1));
        assert_eq!(at(32).held.weight("TLT"), 1.0);
        assert_eq!(result.regime_switches, 1);
    }

    #[test]
    fn test_return_at_t_does_not_change_allocation_held_at_t() {
        let mut config = plain_config();
        config.filters.volatility.enabled = true;
        config.filters.volatility.window = 5;

        let frame = labelled_frame(40, 10);
        let t = 25;
        let mut perturbed = frame.clone();
        let mut replacement = frame.frame.rows()[t..].to_vec();
        replacement[0].returns = vec![0.08, -0.05];
        perturbed.frame = frame.frame.with_rows_from(t, replacement).unwrap();

        let base = StrategyExecutor::new(&config, frame.frame.assets()).execute_strategy(&frame);
        let moved = StrategyExecutor::new(&config, frame.frame.assets()).execute_strategy(&perturbed);

        let idx = t - 10;
        assert_eq!(base.rows[idx].held, moved.rows[idx].held);
        assert_ne!(base.rows[idx].realized_return, moved.rows[idx].realized_return);
        assert_eq!(base.rows[..idx], moved.rows[..idx]);
    }

    #[test]
    fn test_end_to_end_on_synthetic_regimes() {
        let mut config = test_config();
        config.universe = crate::types::AssetUniverse {
            risk_on: vec!["SPY".into()],
            risk_off: vec!["TLT".into()],
            cash_asset: None,
        };
        config.allocation.regimes = vec![
            RegimeWeights::new(0, &[("SPY", 1.0)]),
            RegimeWeights::new(1, &[("TLT", 1.0)]),
        ];
        config.filters.trend.ma_window = 20;

        let frame = synthetic_frame(260);
        let assets = frame.assets().to_vec();
        let regimes = WalkForwardEngine::new(&config).unwrap().walk_forward_training(frame).unwrap();
        let result = StrategyExecutor::new(&config, &assets).execute_strategy(&regimes);

        assert_eq!(result.periods, 160);
        assert_eq!(result.equity_curve.len(), 160);
        for row in &result.rows {
            assert!(row.held.gross_exposure() <= config.filters.volatility.max_leverage + 1e-9);
            if let Some(decided) = row.held.decided_at {
                assert!(decided < row.date);
            }
        }
        assert!(result.regime_switches >= 2);
    }
}
