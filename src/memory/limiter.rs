use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;
use tracing::warn;
use crate::core::error::{Error, ErrorKind, Result};

/// Process-wide budget for raw-search working memory.
pub struct MemoryBudget {
    pub usage: AtomicUsize,
    pub limit: usize,
}

impl MemoryBudget {
    pub fn new(limit: usize) -> Arc<Self> {
        Arc::new(MemoryBudget {
            usage: AtomicUsize::new(0),
            limit,
        })
    }

    pub fn allocate(&self, size: usize) -> Result<()> {
        let new_usage = self.usage.fetch_add(size, Ordering::SeqCst) + size;
        if new_usage > self.limit {
            self.usage.fetch_sub(size, Ordering::SeqCst);
            return Err(Error::new(ErrorKind::OutOfMemory, "search memory limit exceeded".to_string()));
        }
        Ok(())
    }

    pub fn deallocate(&self, size: usize) {
        self.usage.fetch_sub(size, Ordering::SeqCst);
    }

    pub fn current_usage(&self) -> usize {
        self.usage.load(Ordering::Acquire)
    }

    /// Reserves `size` bytes, retrying with a fixed backoff. The reservation is released on drop.
    pub fn reserve_with_backoff(
        self: &Arc<Self>,
        size: usize,
        retries: usize,
        backoff: Duration,
        qid: u64,
    ) -> Result<MemoryReservation> {
        if size > self.limit {
            return Err(Error::new(
                ErrorKind::ResourceExhausted,
                format!("request of {} bytes exceeds search memory limit {}", size, self.limit),
            ));
        }
        for attempt in 0..=retries {
            if self.allocate(size).is_ok() {
                return Ok(MemoryReservation { budget: self.clone(), size });
            }
            if attempt < retries {
                thread::sleep(backoff);
            }
        }
        warn!(target: "segsearch::search", qid, size, usage = self.current_usage(), "search memory unavailable");
        Err(Error::new(
            ErrorKind::ResourceExhausted,
            format!("{} bytes of search memory unavailable after {} retries", size, retries),
        ))
    }
}

/// Bytes held against a `MemoryBudget` until dropped.
pub struct MemoryReservation {
    budget: Arc<MemoryBudget>,
    size: usize,
}

impl MemoryReservation {
    pub fn size(&self) -> usize {
        self.size
    }
}

impl Drop for MemoryReservation {
    fn drop(&mut self) {
        self.budget.deallocate(self.size);
    }
}

/// Working memory of one segment search: every block worker may hold a bitset and
/// per-record state for a full block.
pub fn estimate_search_memory(records_per_block: usize, parallelism: usize, per_record_bytes: usize) -> usize {
    let bitset_bytes = records_per_block.div_ceil(8);
    parallelism.max(1) * (records_per_block * per_record_bytes + bitset_bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_respects_limit() {
        let budget = MemoryBudget::new(100);
        budget.allocate(60).unwrap();
        assert_eq!(budget.allocate(50).unwrap_err().kind, ErrorKind::OutOfMemory);
        assert_eq!(budget.current_usage(), 60);
        budget.deallocate(60);
        assert_eq!(budget.current_usage(), 0);
    }

    #[test]
    fn reservation_released_on_drop() {
        let budget = MemoryBudget::new(100);
        {
            let r = budget.reserve_with_backoff(80, 0, Duration::from_millis(1), 1).unwrap();
            assert_eq!(r.size(), 80);
            assert!(budget.reserve_with_backoff(30, 1, Duration::from_millis(1), 1).is_err());
        }
        assert_eq!(budget.current_usage(), 0);
        assert!(budget.reserve_with_backoff(100, 0, Duration::from_millis(1), 1).is_ok());
    }

    #[test]
    fn oversized_request_fails_fast() {
        let budget = MemoryBudget::new(10);
        let err = budget.reserve_with_backoff(11, 100, Duration::from_secs(1), 1).err().unwrap();
        assert_eq!(err.kind, ErrorKind::ResourceExhausted);
    }

    #[test]
    fn estimate_scales_with_parallelism() {
        let one = estimate_search_memory(15_000, 1, 64);
        assert_eq!(estimate_search_memory(15_000, 4, 64), one * 4);
        assert_eq!(estimate_search_memory(15_000, 0, 64), one);
    }
}
