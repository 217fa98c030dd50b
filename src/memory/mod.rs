pub mod limiter;
pub mod semaphore;

pub use limiter::{estimate_search_memory, MemoryBudget, MemoryReservation};
pub use semaphore::{SemaphorePermit, WeightedSemaphore};
