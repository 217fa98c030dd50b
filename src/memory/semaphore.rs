use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;
use tracing::debug;
use crate::core::error::{Error, ErrorKind, Result};

/// Weighted counting semaphore with non-blocking acquisition and bounded retry.
pub struct WeightedSemaphore {
    pub name: String,
    pub capacity: usize,
    pub in_use: AtomicUsize,
}

impl WeightedSemaphore {
    pub fn new(name: &str, capacity: usize) -> Arc<Self> {
        Arc::new(WeightedSemaphore {
            name: name.to_string(),
            capacity: capacity.max(1),
            in_use: AtomicUsize::new(0),
        })
    }

    pub fn try_acquire(self: &Arc<Self>, weight: usize) -> Option<SemaphorePermit> {
        let mut current = self.in_use.load(Ordering::Acquire);
        loop {
            if current + weight > self.capacity {
                return None;
            }
            match self.in_use.compare_exchange_weak(current, current + weight, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => {
                    return Some(SemaphorePermit {
                        semaphore: self.clone(),
                        weight,
                    });
                }
                Err(actual) => current = actual,
            }
        }
    }

    /// Tries once plus `retries` more times, sleeping `backoff` between attempts.
    pub fn try_acquire_with_backoff(
        self: &Arc<Self>,
        weight: usize,
        retries: usize,
        backoff: Duration,
        qid: u64,
    ) -> Result<SemaphorePermit> {
        if weight > self.capacity {
            return Err(Error::new(
                ErrorKind::InvalidArgument,
                format!("{}: weight {} exceeds capacity {}", self.name, weight, self.capacity),
            ));
        }
        for attempt in 0..=retries {
            if let Some(permit) = self.try_acquire(weight) {
                return Ok(permit);
            }
            if attempt < retries {
                debug!(target: "segsearch::search", qid, semaphore = %self.name, attempt, "permit unavailable, backing off");
                thread::sleep(backoff);
            }
        }
        Err(Error::new(
            ErrorKind::ResourceExhausted,
            format!("{}: no permit after {} retries", self.name, retries),
        ))
    }

    pub fn available(&self) -> usize {
        self.capacity - self.in_use.load(Ordering::Acquire)
    }

    fn release(&self, weight: usize) {
        self.in_use.fetch_sub(weight, Ordering::AcqRel);
    }
}

/// Returns its weight to the semaphore when dropped.
pub struct SemaphorePermit {
    semaphore: Arc<WeightedSemaphore>,
    weight: usize,
}

impl Drop for SemaphorePermit {
    fn drop(&mut self) {
        self.semaphore.release(self.weight);
    }
}
