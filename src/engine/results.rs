use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::filters::FilterAction;
use crate::types::{AllocationVector, RegimeDiagnostic, RegimeId, RegimeLabel, SmoothedRegime};

/// One emitted step of the strategy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyRow {
    pub date: NaiveDate,
    /// Allocation held during this step, decided at the previous close
    pub held: AllocationVector,
    /// held · returns(date)
    pub realized_return: f64,
    pub raw_regime: Option<RegimeLabel>,
    pub smoothed_regime: Option<SmoothedRegime>,
    pub regime_diagnostics: Vec<RegimeDiagnostic>,
    /// Actions of the filter chain that produced `held`
    pub filter_actions: Vec<FilterAction>,
}

impl StrategyRow {
    pub fn is_flagged(&self) -> bool {
        self.regime_diagnostics.iter().any(|d| d.is_fallback())
            || self.filter_actions.iter().any(|a| a.is_flag())
    }
}

/// Point on the equity curve
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EquityPoint {
    pub date: NaiveDate,
    pub equity: f64,
    pub drawdown_pct: f64,
}

/// Per smoothed-regime statistics
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegimeStats {
    pub regime: RegimeId,
    pub periods: usize,
    pub share_pct: f64,
    pub mean_return: f64,
}

/// Executor output: per-step rows plus summary metrics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyResult {
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
    pub periods: usize,

    // Performance
    pub total_return_pct: f64,
    pub annualized_return_pct: f64,
    pub annualized_volatility_pct: f64,

    // Risk
    pub max_drawdown_pct: f64,
    pub sharpe_ratio: f64,
    pub sortino_ratio: f64,
    pub calmar_ratio: f64,

    // Regimes
    pub regime_switches: usize,
    pub regime_stats: BTreeMap<RegimeId, RegimeStats>,
    pub flagged_rows: usize,

    pub equity_curve: Vec<EquityPoint>,
    pub rows: Vec<StrategyRow>,
}

impl StrategyResult {
    /// Pretty print results to console
    pub fn print_summary(&self) {
        println!("\n{}", "=".repeat(60));
        println!("                 REGIME STRATEGY RESULTS");
        println!("{}", "=".repeat(60));
        match (self.start_date, self.end_date) {
            (Some(start), Some(end)) => println!("Period:             {} to {} ({} steps)", start, end, self.periods),
            _ => println!("Period:             (empty)"),
        }
        println!("{}", "-".repeat(60));
        println!("PERFORMANCE");
        println!("  Total Return:       {:.2}%", self.total_return_pct);
        println!("  Annualized Return:  {:.2}%", self.annualized_return_pct);
        println!("  Annualized Vol:     {:.2}%", self.annualized_volatility_pct);
        println!("  Max Drawdown:       {:.2}%", self.max_drawdown_pct);
        println!("  Sharpe Ratio:       {:.2}", self.sharpe_ratio);
        println!("  Sortino Ratio:      {:.2}", self.sortino_ratio);
        println!("  Calmar Ratio:       {:.2}", self.calmar_ratio);
        println!("{}", "-".repeat(60));
        println!("REGIMES");
        println!("  Regime Switches:    {}", self.regime_switches);
        println!("  Flagged Steps:      {}", self.flagged_rows);
        for stats in self.regime_stats.values() {
            println!(
                "  Regime {}: {} steps ({:.1}%), mean step return {:.4}%",
                stats.regime,
                stats.periods,
                stats.share_pct,
                stats.mean_return * 100.0
            );
        }
        println!("{}", "=".repeat(60));
    }
}

/// Calculator for strategy metrics
pub struct MetricsCalculator;

impl MetricsCalculator {
    pub fn calculate(rows: Vec<StrategyRow>, periods_per_year: usize) -> StrategyResult {
        let periods = rows.len();
        let returns: Vec<f64> = rows.iter().map(|r| r.realized_return).collect();
        let ppy = periods_per_year.max(1) as f64;

        // Equity curve and drawdown
        let mut equity = 1.0;
        let mut peak: f64 = 1.0;
        let mut equity_curve = Vec::with_capacity(periods);
        for row in &rows {
            equity *= 1.0 + row.realized_return;
            peak = peak.max(equity);
            let drawdown_pct = if peak > 0.0 { (peak - equity) / peak * 100.0 } else { 0.0 };
            equity_curve.push(EquityPoint {
                date: row.date,
                equity,
                drawdown_pct,
            });
        }

        let total_return_pct = (equity - 1.0) * 100.0;
        let years = periods as f64 / ppy;
        let annualized_return_pct = if years > 0.0 && equity > 0.0 {
            (equity.powf(1.0 / years) - 1.0) * 100.0
        } else {
            0.0
        };

        let max_drawdown_pct = equity_curve
            .iter()
            .map(|e| e.drawdown_pct)
            .fold(0.0, f64::max);

        let (sharpe_ratio, sortino_ratio, annualized_volatility_pct) = Self::calculate_ratios(&returns, ppy);

        let calmar_ratio = if max_drawdown_pct > 0.0 {
            annualized_return_pct / max_drawdown_pct
        } else if annualized_return_pct > 0.0 {
            100.0
        } else {
            0.0
        };

        // Regime statistics
        let smoothed: Vec<Option<RegimeId>> = rows
            .iter()
            .map(|r| r.smoothed_regime.map(|s| s.regime))
            .collect();
        let regime_switches = smoothed
            .windows(2)
            .filter(|w| matches!(w, [Some(a), Some(b)] if a != b))
            .count();

        let mut regime_stats: BTreeMap<RegimeId, RegimeStats> = BTreeMap::new();
        for (row, regime) in rows.iter().zip(&smoothed) {
            if let Some(regime) = regime {
                let stats = regime_stats.entry(*regime).or_insert(RegimeStats {
                    regime: *regime,
                    periods: 0,
                    share_pct: 0.0,
                    mean_return: 0.0,
                });
                stats.periods += 1;
                stats.mean_return += row.realized_return;
            }
        }
        for stats in regime_stats.values_mut() {
            stats.mean_return /= stats.periods as f64;
            stats.share_pct = stats.periods as f64 / periods.max(1) as f64 * 100.0;
        }

        let flagged_rows = rows.iter().filter(|r| r.is_flagged()).count();

        StrategyResult {
            start_date: rows.first().map(|r| r.date),
            end_date: rows.last().map(|r| r.date),
            periods,
            total_return_pct,
            annualized_return_pct,
            annualized_volatility_pct,
            max_drawdown_pct,
            sharpe_ratio,
            sortino_ratio,
            calmar_ratio,
            regime_switches,
            regime_stats,
            flagged_rows,
            equity_curve,
            rows,
        }
    }

    /// Annualized Sharpe, Sortino (rf = 0) and volatility in percent
    fn calculate_ratios(returns: &[f64], periods_per_year: f64) -> (f64, f64, f64) {
        if returns.len() < 2 {
            return (0.0, 0.0, 0.0);
        }

        let n = returns.len() as f64;
        let mean_return = returns.iter().sum::<f64>() / n;
        let variance = returns.iter().map(|r| (r - mean_return).powi(2)).sum::<f64>() / (n - 1.0);
        let std_dev = variance.sqrt();

        let sharpe = if std_dev > 0.0 {
            (mean_return / std_dev) * periods_per_year.sqrt()
        } else {
            0.0
        };

        // Downside deviation (for Sortino)
        let negative_returns: Vec<f64> = returns.iter().filter(|&&r| r < 0.0).copied().collect();
        let downside_dev = if negative_returns.is_empty() {
            0.0
        } else {
            (negative_returns.iter().map(|r| r.powi(2)).sum::<f64>() / negative_returns.len() as f64).sqrt()
        };

        let sortino = if downside_dev > 0.0 {
            (mean_return / downside_dev) * periods_per_year.sqrt()
        } else if mean_return > 0.0 {
            100.0
        } else {
            0.0
        };

        (sharpe, sortino, std_dev * periods_per_year.sqrt() * 100.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(day: u32, ret: f64, regime: Option<RegimeId>) -> StrategyRow {
        StrategyRow {
            date: NaiveDate::from_ymd_opt(2021, 1, day).unwrap(),
            held: AllocationVector::default(),
            realized_return: ret,
            raw_regime: None,
            smoothed_regime: regime.map(|regime| SmoothedRegime {
                regime,
                persistence: 1,
                confidence: 1.0,
                pending: None,
            }),
            regime_diagnostics: Vec::new(),
            filter_actions: Vec::new(),
        }
    }

    #[test]
    fn test_drawdown_and_total_return() {
        let rows = vec![
            row(1, 0.10, Some(0)),
            row(2, -0.20, Some(0)),
            row(3, 0.05, Some(1)),
        ];
        let result = MetricsCalculator::calculate(rows, 252);

        let expected_equity = 1.10 * 0.80 * 1.05;
        assert!((result.total_return_pct - (expected_equity - 1.0) * 100.0).abs() < 1e-9);
        assert!((result.max_drawdown_pct - 20.0).abs() < 1e-9);
        assert_eq!(result.regime_switches, 1);
        assert_eq!(result.regime_stats[&0].periods, 2);
        assert!((result.regime_stats[&1].share_pct - 100.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_missing_regimes_do_not_count_as_switches() {
        let rows = vec![row(1, 0.0, Some(0)), row(2, 0.0, None), row(3, 0.0, Some(0))];
        let result = MetricsCalculator::calculate(rows, 252);
        assert_eq!(result.regime_switches, 0);
        assert_eq!(result.sharpe_ratio, 0.0);
    }

    #[test]
    fn test_empty_result() {
        let result = MetricsCalculator::calculate(Vec::new(), 252);
        assert_eq!(result.periods, 0);
        assert!(result.start_date.is_none());
        assert_eq!(result.total_return_pct, 0.0);
    }
}
