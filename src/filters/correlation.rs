use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

use super::{FilterAction, FilterContext, ReturnHistory, SignalFilter};
use crate::config::CorrelationFilterParams;
use crate::indicators::correlation;
use crate::types::{AllocationVector, AssetGroup, AssetUniverse, WEIGHT_EPSILON};

/// Caps the combined weight of highly correlated assets within a group
pub struct CorrelationFilter {
    params: CorrelationFilterParams,
    universe: AssetUniverse,
    history: ReturnHistory,
}

impl CorrelationFilter {
    pub fn new(params: CorrelationFilterParams, assets: &[String], universe: AssetUniverse) -> Self {
        Self {
            history: ReturnHistory::new(assets, params.window),
            params,
            universe,
        }
    }

    /// Trailing correlation, None while either asset is warming up or flat
    pub fn pair_correlation(&self, a: &str, b: &str) -> Option<f64> {
        let x = self.history.series(a)?;
        let y = self.history.series(b)?;
        correlation(&x, &y)
    }

    fn is_linked(&self, a: &str, b: &str) -> bool {
        self.pair_correlation(a, b)
            .map_or(false, |c| c > self.params.correlation_threshold)
    }

    /// Connected components (size >= 2) of invested assets of one group
    fn clusters(&self, allocation: &AllocationVector, group: AssetGroup) -> Vec<Vec<String>> {
        let invested: Vec<String> = allocation
            .invested()
            .filter(|(asset, _)| self.universe.group_of(asset) == Some(group))
            .map(|(asset, _)| asset.clone())
            .collect();

        let mut seen = BTreeSet::new();
        let mut clusters = Vec::new();
        for start in &invested {
            if !seen.insert(start.clone()) {
                continue;
            }
            let mut component = vec![start.clone()];
            let mut frontier = vec![start.clone()];
            while let Some(current) = frontier.pop() {
                for other in &invested {
                    if !seen.contains(other) && self.is_linked(&current, other) {
                        seen.insert(other.clone());
                        component.push(other.clone());
                        frontier.push(other.clone());
                    }
                }
            }
            if component.len() > 1 {
                component.sort();
                clusters.push(component);
            }
        }
        clusters
    }

    /// Same-group asset outside the cluster with the lowest maximum correlation to it
    fn best_candidate(&self, cluster: &[String], group: AssetGroup, ctx: &FilterContext) -> Option<String> {
        let mut best: Option<(f64, &String)> = None;

        let mut members: Vec<&String> = self.universe.members(group).iter().collect();
        members.sort();
        for candidate in members {
            if cluster.contains(candidate) || ctx.is_vetoed(candidate) {
                continue;
            }

            let mut max_corr = f64::NEG_INFINITY;
            let mut eligible = true;
            for member in cluster {
                match self.pair_correlation(candidate, member) {
                    Some(c) if c <= self.params.correlation_threshold => max_corr = max_corr.max(c),
                    _ => {
                        eligible = false;
                        break;
                    }
                }
            }

            if eligible && best.map_or(true, |(score, _)| max_corr < score) {
                best = Some((max_corr, candidate));
            }
        }

        best.map(|(_, asset)| asset.clone())
    }
}

impl SignalFilter for CorrelationFilter {
    fn name(&self) -> &'static str {
        "correlation"
    }

    fn observe(&mut self, returns: &[f64]) {
        self.history.push(returns);
    }

    fn apply(&self, mut allocation: AllocationVector, ctx: &mut FilterContext) -> AllocationVector {
        let cap = self.params.max_cluster_weight;

        for group in [AssetGroup::RiskOn, AssetGroup::RiskOff] {
            for cluster in self.clusters(&allocation, group) {
                let before: BTreeMap<&String, f64> =
                    cluster.iter().map(|a| (a, allocation.weight(a))).collect();
                let total: f64 = before.values().sum();
                if total <= cap + WEIGHT_EPSILON {
                    continue;
                }

                let factor = cap / total;
                for (asset, w) in &before {
                    allocation.set(asset, w * factor);
                }
                let excess = total - cap;

                let recipient = self.best_candidate(&cluster, group, ctx).or_else(|| {
                    self.universe
                        .cash_asset
                        .clone()
                        .filter(|cash| !cluster.contains(cash))
                });
                if let Some(asset) = &recipient {
                    allocation.add(asset, excess);
                } else {
                    debug!("{}: no uncorrelated {} asset for {:.4} excess of {:?}", ctx.date, group, excess, cluster);
                }

                ctx.record(FilterAction::ClusterCapped {
                    members: cluster,
                    weight_before: total,
                    cap,
                    excess,
                    recipient,
                });
            }
        }

        allocation
    }
}
