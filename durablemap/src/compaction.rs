use crate::config::CompactionConfig;
use crate::error::Result;

/// Share of dead records among `total`, in `[0, 1]`.
///
/// Small storages report at most `config.score_floor`, their ratio is too noisy
/// to justify a rewrite.
pub fn compaction_score(live: u64, total: u64, config: &CompactionConfig) -> f64 {
    if total == 0 {
        return 0.0;
    }
    let score = (1.0 - live as f64 / total as f64).clamp(0.0, 1.0);
    if total < config.min_records_for_stable_score as u64 {
        score.min(config.score_floor)
    } else {
        score
    }
}

/// A map that accumulates garbage and can be rewritten without it
pub trait Compactable: Sized {
    fn compaction_score(&self) -> Result<f64>;

    /// Copies every live entry into the map created by `factory` and returns it.
    /// `self` is left untouched, swapping and disposing of it is up to the caller.
    fn compact<F>(&self, factory: F) -> Result<Self>
    where
        F: FnOnce() -> Result<Self>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn stable() -> CompactionConfig {
        CompactionConfig::default().with_min_records_for_stable_score(0)
    }

    #[test]
    fn test_empty_storage() {
        assert_eq!(compaction_score(0, 0, &stable()), 0.0);
    }

    #[test]
    fn test_score() {
        assert_eq!(compaction_score(10, 10, &stable()), 0.0);
        assert_eq!(compaction_score(25, 100, &stable()), 0.75);
        assert_eq!(compaction_score(0, 100, &stable()), 1.0);
    }

    #[test]
    fn test_small_storage_is_capped() {
        let config = CompactionConfig::default()
            .with_min_records_for_stable_score(1000)
            .with_score_floor(0.1);
        assert_eq!(compaction_score(1, 100, &config), 0.1);
        assert_eq!(compaction_score(100, 100, &config), 0.0);
        assert_eq!(compaction_score(100, 1000, &config), 0.9);
    }

    proptest! {
        #[test]
        fn prop_score_in_unit_range(live in 0u64..10_000, extra in 0u64..10_000) {
            let score = compaction_score(live, live + extra, &stable());
            prop_assert!((0.0..=1.0).contains(&score));
        }
    }
}
