use ndarray::{Array2, ArrayView1};
use tracing::debug;

/// Result of matching a freshly fitted model's states to canonical regime ids
#[derive(Debug, Clone, PartialEq)]
pub struct Alignment {
    /// permutation[raw_state] = canonical regime id
    pub permutation: Vec<usize>,
    /// Total Euclidean distance between matched means (0 for the first fit)
    pub cost: f64,
    /// (best, runner-up) costs when the match was a near-tie
    pub ambiguity: Option<(f64, f64)>,
}

/// Remembers one mean vector per canonical regime and keeps ids stable across refits.
///
/// The first fit orders states by ascending mean of the ordering feature.
/// Later fits use the permutation that minimizes the summed distance between
/// new means and the registered ones, in raw feature units.
#[derive(Debug, Clone)]
pub struct StateRegistry {
    n_states: usize,
    ordering_feature: usize,
    tie_tolerance: f64,
    signatures: Option<Array2<f64>>,
}

impl StateRegistry {
    pub fn new(n_states: usize, ordering_feature: usize, tie_tolerance: f64) -> Self {
        Self {
            n_states,
            ordering_feature,
            tie_tolerance,
            signatures: None,
        }
    }

    /// Registered means, indexed by canonical regime id
    pub fn signatures(&self) -> Option<&Array2<f64>> {
        self.signatures.as_ref()
    }

    /// Match `means` (raw state x feature, raw units) and register them
    pub fn align(&mut self, means: &Array2<f64>) -> Alignment {
        let alignment = match &self.signatures {
            None => self.canonical_order(means),
            Some(signatures) => self.best_permutation(signatures, means),
        };

        let mut updated = means.clone();
        for (raw, &canonical) in alignment.permutation.iter().enumerate() {
            updated.row_mut(canonical).assign(&means.row(raw));
        }
        self.signatures = Some(updated);

        alignment
    }

    fn canonical_order(&self, means: &Array2<f64>) -> Alignment {
        let mut raw_states: Vec<usize> = (0..self.n_states).collect();
        raw_states.sort_by(|&a, &b| {
            means[[a, self.ordering_feature]]
                .partial_cmp(&means[[b, self.ordering_feature]])
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.cmp(&b))
        });

        let mut permutation = vec![0; self.n_states];
        for (rank, &raw) in raw_states.iter().enumerate() {
            permutation[raw] = rank;
        }

        Alignment {
            permutation,
            cost: 0.0,
            ambiguity: None,
        }
    }

    fn best_permutation(&self, signatures: &Array2<f64>, means: &Array2<f64>) -> Alignment {
        let candidates: Vec<(Vec<usize>, f64)> = permutations(self.n_states)
            .into_iter()
            .map(|perm| {
                let cost = perm
                    .iter()
                    .enumerate()
                    .map(|(raw, &canonical)| euclidean(means.row(raw), signatures.row(canonical)))
                    .sum();
                (perm, cost)
            })
            .collect();

        let mut costs: Vec<f64> = candidates.iter().map(|(_, c)| *c).collect();
        costs.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let best = costs.first().copied().unwrap_or(0.0);
        let runner_up = costs.get(1).copied().unwrap_or(f64::INFINITY);

        let margin = self.tie_tolerance * best.max(f64::EPSILON);
        let ambiguous = runner_up - best <= margin;

        // Candidates are in lexicographic order, so the first within the margin
        // is the lexicographically smallest of the tied permutations.
        let (permutation, cost) = candidates
            .into_iter()
            .find(|(_, cost)| *cost - best <= margin)
            .unwrap_or_else(|| ((0..self.n_states).collect(), best));

        if ambiguous {
            debug!(
                "State matching near-tie: best {:.6}, runner-up {:.6}, chose {:?}",
                best, runner_up, permutation
            );
        }

        Alignment {
            permutation,
            cost,
            ambiguity: ambiguous.then_some((best, runner_up)),
        }
    }
}

fn euclidean(a: ArrayView1<f64>, b: ArrayView1<f64>) -> f64 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| (x - y).powi(2))
        .sum::<f64>()
        .sqrt()
}

/// All permutations of 0..n in lexicographic order
fn permutations(n: usize) -> Vec<Vec<usize>> {
    fn extend(prefix: &mut Vec<usize>, used: &mut [bool], out: &mut Vec<Vec<usize>>) {
        if prefix.len() == used.len() {
            out.push(prefix.clone());
            return;
        }
        for i in 0..used.len() {
            if !used[i] {
                used[i] = true;
                prefix.push(i);
                extend(prefix, used, out);
                prefix.pop();
                used[i] = false;
            }
        }
    }

    let mut out = Vec::new();
    extend(&mut Vec::with_capacity(n), &mut vec![false; n], &mut out);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::arr2;

    #[test]
    fn test_permutations_are_lexicographic() {
        let perms = permutations(3);
        assert_eq!(perms.len(), 6);
        assert_eq!(perms[0], vec![0, 1, 2]);
        assert_eq!(perms[1], vec![0, 2, 1]);
        assert_eq!(perms[5], vec![2, 1, 0]);
    }

    #[test]
    fn test_first_fit_orders_by_feature() {
        let mut registry = StateRegistry::new(3, 1, 1e-3);
        // Raw state 0 has the highest value of feature 1
        let means = arr2(&[[0.0, 5.0], [1.0, -1.0], [2.0, 2.0]]);
        let alignment = registry.align(&means);
        assert_eq!(alignment.permutation, vec![2, 0, 1]);
        assert!(alignment.ambiguity.is_none());

        let signatures = registry.signatures().unwrap();
        assert_eq!(signatures[[0, 1]], -1.0);
        assert_eq!(signatures[[2, 1]], 5.0);
    }

    #[test]
    fn test_refit_follows_nearest_means() {
        let mut registry = StateRegistry::new(3, 0, 1e-3);
        registry.align(&arr2(&[[-1.0, 0.0], [0.0, 0.0], [1.0, 0.0]]));

        // Same states, shuffled and slightly moved
        let alignment = registry.align(&arr2(&[[1.1, 0.0], [-0.9, 0.1], [0.05, 0.0]]));
        assert_eq!(alignment.permutation, vec![2, 0, 1]);
        assert!(alignment.ambiguity.is_none());
        assert!(alignment.cost < 0.5);
    }

    #[test]
    fn test_near_tie_is_flagged_and_deterministic() {
        let mut registry = StateRegistry::new(2, 0, 1e-3);
        registry.align(&arr2(&[[-1.0], [1.0]]));

        // Both new states sit at the midpoint: every matching costs the same
        let alignment = registry.align(&arr2(&[[0.0], [0.0]]));
        assert_eq!(alignment.permutation, vec![0, 1]);
        let (best, runner_up) = alignment.ambiguity.unwrap();
        assert!((best - runner_up).abs() < 1e-12);
    }
}
