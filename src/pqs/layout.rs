use std::fs;
use std::path::PathBuf;
use crate::core::error::Result;

/// Where cache files live. Segment keys are paths; relative ones resolve under `base_dir`.
#[derive(Debug, Clone)]
pub struct PqsLayout {
    pub base_dir: PathBuf,
    pub pqmeta_dir: PathBuf,  // per-query empty-results maps
}

impl PqsLayout {
    pub fn new(base_dir: PathBuf) -> Result<Self> {
        let pqmeta_dir = base_dir.join("pqmeta");
        fs::create_dir_all(&pqmeta_dir)?;
        Ok(PqsLayout { base_dir, pqmeta_dir })
    }

    pub fn segment_dir(&self, segment_key: &str) -> PathBuf {
        self.base_dir.join(segment_key)
    }

    pub fn pqmr_dir(&self, segment_key: &str) -> PathBuf {
        self.segment_dir(segment_key).join("pqmr")
    }

    /// `<segmentKey>/pqmr/<pqid>.pqmr`
    pub fn pqmr_path(&self, segment_key: &str, pqid: &str) -> PathBuf {
        self.pqmr_dir(segment_key).join(format!("{}.pqmr", pqid))
    }

    pub fn meta_path(&self, pqid: &str) -> PathBuf {
        self.pqmeta_dir.join(format!("{}.meta", pqid))
    }
}
