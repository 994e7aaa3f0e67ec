pub mod stabilizer;

pub use stabilizer::RegimeStabilizer;

use chrono::NaiveDate;
use tracing::debug;

use crate::config::AllocationSettings;
use crate::types::{AllocationVector, SmoothedRegime};

/// Maps a smoothed regime to its seed weights from the configured table
#[derive(Debug, Clone)]
pub struct RegimeAllocator {
    table: AllocationSettings,
}

impl RegimeAllocator {
    pub fn new(table: AllocationSettings) -> Self {
        Self { table }
    }

    /// Seed allocation decided at `date`.
    /// No regime, or a regime without a table row, is a flat (cash) allocation.
    pub fn seed(&self, regime: Option<&SmoothedRegime>, date: NaiveDate) -> AllocationVector {
        let regime_id = regime.map(|r| r.regime);
        let allocation = AllocationVector::new(regime_id, Some(date));

        match regime_id {
            Some(id) => match self.table.weights_for(id) {
                Some(weights) => allocation.with_weights(weights),
                None => {
                    debug!("{}: regime {} has no weights, holding cash", date, id);
                    allocation
                }
            },
            None => allocation,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn smoothed(regime: usize) -> SmoothedRegime {
        SmoothedRegime {
            regime,
            persistence: 1,
            confidence: 0.9,
            pending: None,
        }
    }

    #[test]
    fn test_seed_uses_table_row() {
        let allocator = RegimeAllocator::new(AllocationSettings::default());
        let date = NaiveDate::from_ymd_opt(2020, 5, 4).unwrap();
        let seed = allocator.seed(Some(&smoothed(2)), date);

        assert_eq!(seed.regime, Some(2));
        assert_eq!(seed.decided_at, Some(date));
        assert!((seed.weight("TLT") - 0.4).abs() < 1e-12);
        assert!((seed.net_exposure() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_unknown_or_missing_regime_is_cash() {
        let allocator = RegimeAllocator::new(AllocationSettings::default());
        let date = NaiveDate::from_ymd_opt(2020, 5, 4).unwrap();
        assert!(allocator.seed(Some(&smoothed(5)), date).is_flat());
        assert!(allocator.seed(None, date).is_flat());
    }
}
