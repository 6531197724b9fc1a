/// How much room a storage reserves for a record of a given payload size
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocationStrategy {
    /// Minimum capacity of any new record
    pub default_capacity: usize,
    /// Extra room on top of the payload, so small appends can grow records in place
    pub percent_on_top: usize,
}

impl Default for AllocationStrategy {
    fn default() -> Self {
        Self {
            default_capacity: 64,
            percent_on_top: 30,
        }
    }
}

impl AllocationStrategy {
    pub fn new(default_capacity: usize, percent_on_top: usize) -> Self {
        Self {
            default_capacity,
            percent_on_top,
        }
    }

    /// Capacity for a payload of `size` bytes, never more than `max_capacity`
    pub fn capacity_for(&self, size: usize, max_capacity: usize) -> usize {
        let with_slack = size.saturating_add(size / 100 * self.percent_on_top);
        with_slack
            .max(self.default_capacity)
            .min(max_capacity)
            .max(size)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CompactionConfig {
    /// Below this many records the score is capped at `score_floor`
    pub min_records_for_stable_score: usize,
    pub score_floor: f64,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            min_records_for_stable_score: 1024,
            score_floor: 0.05,
        }
    }
}

impl CompactionConfig {
    pub fn with_min_records_for_stable_score(mut self, records: usize) -> Self {
        self.min_records_for_stable_score = records;
        self
    }

    pub fn with_score_floor(mut self, floor: f64) -> Self {
        self.score_floor = floor;
        self
    }
}

/// Tuning shared by both map variants
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DurableMapConfig {
    pub index_initial_capacity: usize,
    /// Initial size of a freshly created storage file
    pub storage_initial_size: usize,
    pub allocation: AllocationStrategy,
    /// Largest payload a single record may carry, bigger ones are a caller bug
    pub max_payload: usize,
    pub compaction: CompactionConfig,
}

impl Default for DurableMapConfig {
    fn default() -> Self {
        Self {
            index_initial_capacity: 1024,
            storage_initial_size: 64 * 1024,
            allocation: AllocationStrategy::default(),
            max_payload: 16 * 1024 * 1024,
            compaction: CompactionConfig::default(),
        }
    }
}

impl DurableMapConfig {
    pub fn with_index_initial_capacity(mut self, capacity: usize) -> Self {
        self.index_initial_capacity = capacity;
        self
    }

    pub fn with_storage_initial_size(mut self, size: usize) -> Self {
        self.storage_initial_size = size;
        self
    }

    pub fn with_allocation(mut self, allocation: AllocationStrategy) -> Self {
        self.allocation = allocation;
        self
    }

    pub fn with_max_payload(mut self, max_payload: usize) -> Self {
        self.max_payload = max_payload;
        self
    }

    pub fn with_compaction(mut self, compaction: CompactionConfig) -> Self {
        self.compaction = compaction;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capacity_for() {
        let strategy = AllocationStrategy::new(64, 50);
        assert_eq!(strategy.capacity_for(10, 1 << 20), 64);
        assert_eq!(strategy.capacity_for(200, 1 << 20), 300);
        // clamped, but never below the payload itself
        assert_eq!(strategy.capacity_for(200, 250), 250);
        assert_eq!(strategy.capacity_for(300, 250), 300);
    }

    #[test]
    fn test_builders() {
        let config = DurableMapConfig::default()
            .with_index_initial_capacity(32)
            .with_compaction(CompactionConfig::default().with_score_floor(0.0));
        assert_eq!(config.index_initial_capacity, 32);
        assert_eq!(config.compaction.score_floor, 0.0);
        assert_eq!(config.max_payload, DurableMapConfig::default().max_payload);
    }
}
