const MINUTE_MS: u64 = 60_000;
const HOUR_MS: u64 = 3_600_000;
const DAY_MS: u64 = 86_400_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RollupGranularity {
    Minute,
    Hour,
    Day,
}

impl RollupGranularity {
    /// Coarsest rollup that still resolves buckets of `interval_ms`.
    pub fn for_interval(interval_ms: u64) -> Self {
        if interval_ms < HOUR_MS {
            RollupGranularity::Minute
        } else if interval_ms < DAY_MS {
            RollupGranularity::Hour
        } else {
            RollupGranularity::Day
        }
    }

    pub fn width_ms(&self) -> u64 {
        match self {
            RollupGranularity::Minute => MINUTE_MS,
            RollupGranularity::Hour => HOUR_MS,
            RollupGranularity::Day => DAY_MS,
        }
    }

    pub fn bucket_start(&self, ts: u64) -> u64 {
        ts - ts % self.width_ms()
    }

    pub fn all() -> [RollupGranularity; 3] {
        [RollupGranularity::Minute, RollupGranularity::Hour, RollupGranularity::Day]
    }
}
