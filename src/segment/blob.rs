use std::fs;
use std::path::{Path, PathBuf};
use crate::core::error::{Error, ErrorKind, Result};

/// Remote copy of local data files. Implementations must be idempotent and safe to retry.
pub trait BlobStore: Send + Sync {
    fn upload(&self, local_path: &Path) -> Result<()>;

    /// Ensures `local_path` exists locally.
    fn download(&self, local_path: &Path) -> Result<()>;

    fn delete(&self, local_path: &Path) -> Result<()>;
}

/// Single node deployments: the local disk is the source of truth.
#[derive(Debug, Default, Clone)]
pub struct LocalBlobStore;

impl BlobStore for LocalBlobStore {
    fn upload(&self, _local_path: &Path) -> Result<()> {
        Ok(())
    }

    fn download(&self, local_path: &Path) -> Result<()> {
        if local_path.exists() {
            Ok(())
        } else {
            Err(Error::not_found(format!("{} not present locally", local_path.display())))
        }
    }

    fn delete(&self, _local_path: &Path) -> Result<()> {
        Ok(())
    }
}

/// Mirrors files under `local_root` into `remote_root`, keeping relative paths.
#[derive(Debug, Clone)]
pub struct MirrorBlobStore {
    pub local_root: PathBuf,
    pub remote_root: PathBuf,
}

impl MirrorBlobStore {
    pub fn new(local_root: PathBuf, remote_root: PathBuf) -> Result<Self> {
        fs::create_dir_all(&remote_root)?;
        Ok(MirrorBlobStore { local_root, remote_root })
    }

    fn remote_path(&self, local_path: &Path) -> Result<PathBuf> {
        let rel = local_path.strip_prefix(&self.local_root).map_err(|_| {
            Error::new(
                ErrorKind::InvalidArgument,
                format!("{} is outside {}", local_path.display(), self.local_root.display()),
            )
        })?;
        Ok(self.remote_root.join(rel))
    }
}

impl BlobStore for MirrorBlobStore {
    fn upload(&self, local_path: &Path) -> Result<()> {
        let remote = self.remote_path(local_path)?;
        if let Some(parent) = remote.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::copy(local_path, remote)?;
        Ok(())
    }

    fn download(&self, local_path: &Path) -> Result<()> {
        if local_path.exists() {
            return Ok(());
        }
        let remote = self.remote_path(local_path)?;
        if !remote.exists() {
            return Err(Error::not_found(format!("{} not in blob store", remote.display())));
        }
        if let Some(parent) = local_path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::copy(remote, local_path)?;
        Ok(())
    }

    fn delete(&self, local_path: &Path) -> Result<()> {
        let remote = self.remote_path(local_path)?;
        match fs::remove_file(remote) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
