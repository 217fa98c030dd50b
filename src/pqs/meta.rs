use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use crate::core::error::Result;

/// Segment keys known to have no match for one query hash.
pub type EmptyResults = BTreeMap<String, bool>;

/// A missing file is an empty map.
pub fn read_empty_results(path: &Path) -> Result<EmptyResults> {
    match fs::read(path) {
        Ok(data) if data.is_empty() => Ok(EmptyResults::new()),
        Ok(data) => Ok(serde_json::from_slice(&data)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(EmptyResults::new()),
        Err(e) => Err(e.into()),
    }
}

pub fn write_empty_results(path: &Path, results: &EmptyResults) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("meta.tmp");
    fs::write(&tmp, serde_json::to_vec(results)?)?;
    fs::rename(&tmp, path)?;
    Ok(())
}
