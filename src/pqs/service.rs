use std::collections::{HashMap, HashSet};
use std::fs;
use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};
use crossbeam::channel::{bounded, Sender};
use lru::LruCache;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, info, warn};
use crate::core::config::SearchConfig;
use crate::core::error::{Error, Result};
use crate::pqs::layout::PqsLayout;
use crate::pqs::meta::{read_empty_results, write_empty_results, EmptyResults};
use crate::pqs::pqmr::{read_pqmr_file, write_pqmr_file, SegmentPqmrResults};
use crate::segment::blob::BlobStore;

type CacheKey = (String, String);  // (segment key, pqid)

#[derive(Debug, Clone)]
pub struct CacheStats {
    pub hit_count: usize,
    pub miss_count: usize,
    pub size: usize,
    pub capacity: usize,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hit_count + self.miss_count;
        if total == 0 {
            0.0
        } else {
            self.hit_count as f64 / total as f64
        }
    }
}

/// Persistent query results: which (segment, query hash) pairs have a pqmr file, a small
/// LRU of decoded files, the per-query empty-segment maps and the asynchronous uploader.
pub struct PersistentQueryService {
    pub enabled: bool,
    pub layout: PqsLayout,
    pub capacity: usize,
    index: RwLock<HashMap<String, HashSet<String>>>,  // segment key -> pqids
    decoded: Mutex<LruCache<CacheKey, Arc<SegmentPqmrResults>>>,
    empty_results: RwLock<HashMap<String, EmptyResults>>,  // pqid -> segments, loaded lazily
    blob_store: Arc<dyn BlobStore>,
    upload_tx: Mutex<Option<Sender<PathBuf>>>,
    upload_worker: Mutex<Option<JoinHandle<()>>>,
    hit_count: AtomicUsize,
    miss_count: AtomicUsize,
}

impl PersistentQueryService {
    pub fn new(config: &SearchConfig, blob_store: Arc<dyn BlobStore>) -> Result<Arc<Self>> {
        let layout = PqsLayout::new(config.data_dir.clone())?;
        let capacity = config.pqmr_cache_capacity.max(1);
        let cap = NonZeroUsize::new(capacity).ok_or_else(|| Error::invalid_argument("pqmr cache capacity must be positive"))?;

        let (upload_tx, upload_rx) = bounded::<PathBuf>(config.upload_queue_capacity.max(1));
        let uploader = blob_store.clone();
        let worker = thread::Builder::new()
            .name("pqs-upload".to_string())
            .spawn(move || {
                while let Ok(path) = upload_rx.recv() {
                    if let Err(e) = uploader.upload(&path) {
                        error!(target: "segsearch::pqs", path = %path.display(), error = %e, "pqmr upload failed");
                    }
                }
            })?;

        Ok(Arc::new(PersistentQueryService {
            enabled: config.pqs_enabled,
            layout,
            capacity,
            index: RwLock::new(HashMap::new()),
            decoded: Mutex::new(LruCache::new(cap)),
            empty_results: RwLock::new(HashMap::new()),
            blob_store,
            upload_tx: Mutex::new(Some(upload_tx)),
            upload_worker: Mutex::new(Some(worker)),
            hit_count: AtomicUsize::new(0),
            miss_count: AtomicUsize::new(0),
        }))
    }

    pub fn does_pqmr_exist(&self, segment_key: &str, pqid: &str) -> bool {
        self.enabled && self.index.read().get(segment_key).is_some_and(|q| q.contains(pqid))
    }

    /// Registers pqmr files already on disk for a segment, e.g. after a restart.
    pub fn load_segment_index(&self, segment_key: &str) -> Result<usize> {
        let dir = self.layout.pqmr_dir(segment_key);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };
        let mut found = 0;
        let mut index = self.index.write();
        for entry in entries {
            let path = entry?.path();
            if path.extension().is_some_and(|ext| ext == "pqmr") {
                if let Some(pqid) = path.file_stem().and_then(|s| s.to_str()) {
                    index.entry(segment_key.to_string()).or_default().insert(pqid.to_string());
                    found += 1;
                }
            }
        }
        Ok(found)
    }

    /// Every cached block bitset of the segment for this query. Callers fall back to a raw
    /// search on any error.
    pub fn get_all_persistent_query_results(&self, segment_key: &str, pqid: &str) -> Result<Arc<SegmentPqmrResults>> {
        if !self.does_pqmr_exist(segment_key, pqid) {
            self.miss_count.fetch_add(1, Ordering::Relaxed);
            return Err(Error::not_found(format!("no pqmr for {} in {}", pqid, segment_key)));
        }
        let key = (segment_key.to_string(), pqid.to_string());
        if let Some(results) = self.decoded.lock().get(&key) {
            self.hit_count.fetch_add(1, Ordering::Relaxed);
            return Ok(results.clone());
        }

        let path = self.layout.pqmr_path(segment_key, pqid);
        if !path.exists() {
            self.blob_store.download(&path)?;
        }
        let results = Arc::new(read_pqmr_file(&path)?);
        self.decoded.lock().put(key, results.clone());
        self.hit_count.fetch_add(1, Ordering::Relaxed);
        Ok(results)
    }

    /// Persists a segment's full results for a query and queues the file for upload.
    /// Segments still being written to are skipped.
    pub fn write_results(&self, segment_key: &str, pqid: &str, results: Arc<SegmentPqmrResults>) -> Result<()> {
        if !self.enabled || segment_key.contains("/active/") {
            return Ok(());
        }
        let path = self.layout.pqmr_path(segment_key, pqid);
        write_pqmr_file(&path, &results)?;
        self.index
            .write()
            .entry(segment_key.to_string())
            .or_default()
            .insert(pqid.to_string());
        self.decoded.lock().put((segment_key.to_string(), pqid.to_string()), results);

        let tx = self.upload_tx.lock().clone();
        match tx {
            Some(tx) => {
                if tx.send(path).is_err() {
                    warn!(target: "segsearch::pqs", segment = segment_key, "upload worker gone, pqmr stays local");
                }
            }
            None => warn!(target: "segsearch::pqs", segment = segment_key, "pqs shut down, pqmr stays local"),
        }
        debug!(target: "segsearch::pqs", segment = segment_key, pqid, "pqmr written");
        Ok(())
    }

    fn with_empty_results<R>(&self, pqid: &str, f: impl FnOnce(&mut EmptyResults) -> R) -> R {
        if let Some(existing) = self.empty_results.write().get_mut(pqid) {
            return f(existing);
        }
        let loaded = read_empty_results(&self.layout.meta_path(pqid)).unwrap_or_else(|e| {
            warn!(target: "segsearch::pqs", pqid, error = %e, "ignoring unreadable pqmeta file");
            EmptyResults::new()
        });
        let mut map = self.empty_results.write();
        let entry = map.entry(pqid.to_string()).or_insert(loaded);
        f(entry)
    }

    /// Records that the segment has no match for the query.
    pub fn add_empty_results(&self, pqid: &str, segment_key: &str) {
        if !self.enabled || segment_key.contains("/active/") {
            return;
        }
        let snapshot = self.with_empty_results(pqid, |m| {
            if m.insert(segment_key.to_string(), true).is_some() {
                None
            } else {
                Some(m.clone())
            }
        });
        if let Some(snapshot) = snapshot {
            if let Err(e) = write_empty_results(&self.layout.meta_path(pqid), &snapshot) {
                error!(target: "segsearch::pqs", pqid, error = %e, "pqmeta write failed");
            }
        }
    }

    pub fn is_empty_result(&self, pqid: &str, segment_key: &str) -> bool {
        self.enabled && self.with_empty_results(pqid, |m| m.contains_key(segment_key))
    }

    /// Drops everything cached for a deleted or rewritten segment.
    pub fn delete_segment(&self, segment_key: &str) -> Result<()> {
        let pqids = self.index.write().remove(segment_key).unwrap_or_default();
        {
            let mut decoded = self.decoded.lock();
            for pqid in &pqids {
                decoded.pop(&(segment_key.to_string(), pqid.clone()));
            }
        }
        for pqid in &pqids {
            let path = self.layout.pqmr_path(segment_key, pqid);
            if let Err(e) = self.blob_store.delete(&path) {
                warn!(target: "segsearch::pqs", segment = segment_key, error = %e, "remote pqmr delete failed");
            }
        }
        let dir = self.layout.pqmr_dir(segment_key);
        if dir.exists() {
            fs::remove_dir_all(&dir)?;
        }

        let touched: Vec<(String, EmptyResults)> = {
            let mut maps = self.empty_results.write();
            maps.iter_mut()
                .filter_map(|(pqid, m)| m.remove(segment_key).map(|_| (pqid.clone(), m.clone())))
                .collect()
        };
        for (pqid, snapshot) in touched {
            write_empty_results(&self.layout.meta_path(&pqid), &snapshot)?;
        }
        info!(target: "segsearch::pqs", segment = segment_key, entries = pqids.len(), "segment removed from pqs");
        Ok(())
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hit_count: self.hit_count.load(Ordering::Relaxed),
            miss_count: self.miss_count.load(Ordering::Relaxed),
            size: self.decoded.lock().len(),
            capacity: self.capacity,
        }
    }

    /// Stops accepting uploads and waits for queued ones to finish.
    pub fn shutdown(&self) {
        self.upload_tx.lock().take();
        if let Some(worker) = self.upload_worker.lock().take() {
            if worker.join().is_err() {
                error!(target: "segsearch::pqs", "upload worker panicked");
            }
        }
    }
}

impl Drop for PersistentQueryService {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bitset::MatchBitset;
    use crate::core::error::ErrorKind;
    use crate::segment::blob::{LocalBlobStore, MirrorBlobStore};
    use tempfile::TempDir;

    fn service(dir: &TempDir) -> Arc<PersistentQueryService> {
        let config = SearchConfig::with_data_dir(dir.path());
        PersistentQueryService::new(&config, Arc::new(LocalBlobStore)).unwrap()
    }

    fn sample() -> Arc<SegmentPqmrResults> {
        let r = SegmentPqmrResults::new();
        r.set_block_results(0, MatchBitset::from_indices(10, [1, 3]));
        r.set_block_results(1, MatchBitset::new(10));
        Arc::new(r)
    }

    #[test]
    fn write_then_read_hits() {
        let dir = TempDir::new().unwrap();
        let pqs = service(&dir);
        assert_eq!(pqs.get_all_persistent_query_results("seg-0", "q").unwrap_err().kind, ErrorKind::NotFound);

        pqs.write_results("seg-0", "q", sample()).unwrap();
        assert!(pqs.does_pqmr_exist("seg-0", "q"));
        assert!(dir.path().join("seg-0/pqmr/q.pqmr").exists());

        let read = pqs.get_all_persistent_query_results("seg-0", "q").unwrap();
        assert_eq!(read.total_matched(), 2);
        assert!(read.contains_block(1));
        let stats = pqs.stats();
        assert_eq!((stats.hit_count, stats.miss_count), (1, 1));
        assert_eq!(stats.hit_rate(), 0.5);
    }

    #[test]
    fn active_segments_are_never_cached() {
        let dir = TempDir::new().unwrap();
        let pqs = service(&dir);
        pqs.write_results("tbl/active/seg-1", "q", sample()).unwrap();
        assert!(!pqs.does_pqmr_exist("tbl/active/seg-1", "q"));
    }

    #[test]
    fn index_reloads_from_disk() {
        let dir = TempDir::new().unwrap();
        service(&dir).write_results("seg-0", "q", sample()).unwrap();
        let fresh = service(&dir);
        assert!(!fresh.does_pqmr_exist("seg-0", "q"));
        assert_eq!(fresh.load_segment_index("seg-0").unwrap(), 1);
        assert_eq!(fresh.get_all_persistent_query_results("seg-0", "q").unwrap().num_blocks(), 2);
    }

    #[test]
    fn empty_results_persist_and_invalidate() {
        let dir = TempDir::new().unwrap();
        let pqs = service(&dir);
        pqs.add_empty_results("q", "seg-7");
        assert!(pqs.is_empty_result("q", "seg-7"));
        assert!(!pqs.is_empty_result("q", "seg-8"));

        let reloaded = service(&dir);
        assert!(reloaded.is_empty_result("q", "seg-7"));

        reloaded.write_results("seg-7", "other", sample()).unwrap();
        reloaded.delete_segment("seg-7").unwrap();
        assert!(!reloaded.is_empty_result("q", "seg-7"));
        assert!(!reloaded.does_pqmr_exist("seg-7", "other"));
        assert!(!dir.path().join("seg-7/pqmr").exists());
        assert!(!service(&dir).is_empty_result("q", "seg-7"));
    }

    #[test]
    fn remote_copy_is_fetched_when_local_file_is_gone() {
        let local = TempDir::new().unwrap();
        let remote = TempDir::new().unwrap();
        let config = SearchConfig::with_data_dir(local.path());
        let store = Arc::new(MirrorBlobStore::new(local.path().to_path_buf(), remote.path().to_path_buf()).unwrap());
        let pqs = PersistentQueryService::new(&config, store).unwrap();
        pqs.write_results("seg-0", "q", sample()).unwrap();
        pqs.shutdown();
        assert!(remote.path().join("seg-0/pqmr/q.pqmr").exists());

        // evict the decoded copy and the local file
        pqs.decoded.lock().clear();
        fs::remove_file(local.path().join("seg-0/pqmr/q.pqmr")).unwrap();
        assert_eq!(pqs.get_all_persistent_query_results("seg-0", "q").unwrap().total_matched(), 2);
    }

    #[test]
    fn disabled_service_is_inert() {
        let dir = TempDir::new().unwrap();
        let mut config = SearchConfig::with_data_dir(dir.path());
        config.pqs_enabled = false;
        let pqs = PersistentQueryService::new(&config, Arc::new(LocalBlobStore)).unwrap();
        pqs.write_results("seg-0", "q", sample()).unwrap();
        pqs.add_empty_results("q", "seg-0");
        assert!(!pqs.does_pqmr_exist("seg-0", "q"));
        assert!(!pqs.is_empty_result("q", "seg-0"));
    }
}
