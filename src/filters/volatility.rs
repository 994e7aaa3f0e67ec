use super::{FilterAction, FilterContext, ReturnHistory, SignalFilter};
use crate::config::VolatilityControlParams;
use crate::indicators::annualized_volatility;
use crate::types::{AllocationVector, WEIGHT_EPSILON};

/// Below this annualized volatility the portfolio is treated as riskless
const MIN_VOLATILITY: f64 = 1e-12;

/// Scales the allocation toward a target annualized volatility
pub struct VolatilityControl {
    params: VolatilityControlParams,
    periods_per_year: usize,
    history: ReturnHistory,
}

impl VolatilityControl {
    pub fn new(params: VolatilityControlParams, assets: &[String], periods_per_year: usize) -> Self {
        Self {
            history: ReturnHistory::new(assets, params.window),
            periods_per_year,
            params,
        }
    }

    /// Annualized volatility the allocation would have had over the trailing window
    pub fn ex_ante_volatility(&self, allocation: &AllocationVector) -> Option<f64> {
        let mut portfolio = vec![0.0; self.params.window];
        for (asset, w) in &allocation.weights {
            let series = self.history.series(asset)?;
            for (p, r) in portfolio.iter_mut().zip(series) {
                *p += w * r;
            }
        }
        annualized_volatility(&portfolio, self.periods_per_year as f64)
    }

    pub fn multiplier(&self, realized_vol: f64) -> f64 {
        if realized_vol < MIN_VOLATILITY {
            return self.params.max_leverage;
        }
        (self.params.target_volatility / realized_vol).clamp(0.0, self.params.max_leverage)
    }
}

impl SignalFilter for VolatilityControl {
    fn name(&self) -> &'static str {
        "volatility"
    }

    fn observe(&mut self, returns: &[f64]) {
        self.history.push(returns);
    }

    fn apply(&self, mut allocation: AllocationVector, ctx: &mut FilterContext) -> AllocationVector {
        if !self.params.allow_short {
            let shorts: Vec<String> = allocation
                .weights
                .iter()
                .filter(|(_, w)| **w < -WEIGHT_EPSILON)
                .map(|(a, _)| a.clone())
                .collect();
            if !shorts.is_empty() {
                for asset in &shorts {
                    allocation.set(asset, 0.0);
                }
                ctx.record(FilterAction::ShortsClamped { assets: shorts });
            }
        }

        if allocation.is_flat() {
            return allocation;
        }

        match self.ex_ante_volatility(&allocation) {
            Some(realized_vol) => {
                let multiplier = self.multiplier(realized_vol);
                allocation.scale(multiplier);
                ctx.record(FilterAction::VolatilityScaled {
                    realized_vol,
                    multiplier,
                });
            }
            None => ctx.record(FilterAction::VolatilityWarmup {
                observations: self.history.observations(),
                required: self.history.capacity(),
            }),
        }

        let gross = allocation.gross_exposure();
        if gross > self.params.max_leverage + WEIGHT_EPSILON {
            allocation.scale(self.params.max_leverage / gross);
            ctx.record(FilterAction::LeverageCapped {
                gross_before: gross,
                cap: self.params.max_leverage,
            });
        }

        allocation
    }
}
