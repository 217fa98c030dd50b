use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct SearchConfig {
    pub data_dir: PathBuf,
    pub pqs_enabled: bool,
    pub timestamp_key: String,

    // Raw search scheduling
    pub block_batch_size: usize,                 // Blocks handed to workers per batch
    pub pqmr_initial_size: usize,                // Universe of the shared all-matched seed
    pub dict_fast_path_max_entries: usize,       // Largest dictionary evaluated without touching records

    // Resource gates
    pub raw_search_permits: usize,               // Segments raw-searched concurrently, process wide
    pub acquire_retries: usize,
    pub acquire_backoff: Duration,
    pub max_search_memory_bytes: usize,
    pub search_memory_per_record_bytes: usize,   // Per record, per block worker

    // Persistent query cache
    pub pqmr_cache_capacity: usize,              // Decoded entries kept in memory
    pub upload_queue_capacity: usize,

    pub max_reported_errors: usize,
}

impl SearchConfig {
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        SearchConfig {
            data_dir: data_dir.into(),
            ..SearchConfig::default()
        }
    }
}

impl Default for SearchConfig {
    fn default() -> Self {
        SearchConfig {
            data_dir: PathBuf::from("./data"),
            pqs_enabled: true,
            timestamp_key: "timestamp".to_string(),

            block_batch_size: 100,
            pqmr_initial_size: 15_000,
            dict_fast_path_max_entries: 1024,

            raw_search_permits: (num_cpus::get() / 2).max(1),
            acquire_retries: 5,
            acquire_backoff: Duration::from_millis(500),
            max_search_memory_bytes: 512 * 1024 * 1024,   // 512MB
            search_memory_per_record_bytes: 64,

            pqmr_cache_capacity: 256,
            upload_queue_capacity: 64,

            max_reported_errors: 100,
        }
    }
}
