use std::collections::HashMap;
use parking_lot::RwLock;

/// Decides which query shapes keep a persistent cache entry.
pub trait QueryPersistenceTracker: Send + Sync {
    fn record_usage(&self, pqid: &str);

    fn is_persistent(&self, pqid: &str) -> bool;
}

/// A query hash becomes persistent once it has been executed `threshold` times.
pub struct QueryUsageTracker {
    pub threshold: u64,
    usage: RwLock<HashMap<String, u64>>,
}

impl QueryUsageTracker {
    pub fn new(threshold: u64) -> Self {
        QueryUsageTracker {
            threshold: threshold.max(1),
            usage: RwLock::new(HashMap::new()),
        }
    }

    pub fn usage_count(&self, pqid: &str) -> u64 {
        self.usage.read().get(pqid).copied().unwrap_or(0)
    }
}

impl QueryPersistenceTracker for QueryUsageTracker {
    fn record_usage(&self, pqid: &str) {
        *self.usage.write().entry(pqid.to_string()).or_insert(0) += 1;
    }

    fn is_persistent(&self, pqid: &str) -> bool {
        self.usage_count(pqid) >= self.threshold
    }
}
