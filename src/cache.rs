//! Persisted embedding cache: one binary artifact plus a sibling lock file.
//!
//! The artifact carries the embedding model identifier, vector
//! dimensionality, the `content_hash → vector` map, and the fingerprints
//! of the sessions that were live when it was written. The model
//! identifier is a guard: a mismatch with the configured model discards
//! the whole artifact and triggers a rebuild.
//!
//! Writers serialise on an advisory OS file lock (flock) held on the lock
//! file, write the full new state to a temporary sibling, and atomically
//! rename it over the canonical path. Readers never take the lock: the
//! rename guarantees they observe either the complete previous state or
//! the complete new state.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::path::Path;
use tracing::warn;

/// On-disk cache state, serialised with bincode.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CacheArtifact {
    /// Embedding model identifier the vectors were produced with.
    pub model: String,
    /// Vector dimensionality.
    pub dims: usize,
    /// Content-addressed vectors: `content_hash → unit-norm embedding`.
    pub vectors: HashMap<String, Vec<f32>>,
    /// Fingerprints of the sessions live at last persist.
    pub fingerprints: HashMap<String, String>,
}

impl CacheArtifact {
    pub fn empty(model: &str, dims: usize) -> CacheArtifact {
        CacheArtifact {
            model: model.to_string(),
            dims,
            vectors: HashMap::new(),
            fingerprints: HashMap::new(),
        }
    }
}

/// Load the persisted cache, discarding it on corruption or model mismatch.
///
/// Both failure modes cost one rebuild and are deliberately silent beyond
/// a warning: the cache is derived state.
pub fn load(cache_file: &Path, model: &str, dims: usize) -> CacheArtifact {
    let bytes = match std::fs::read(cache_file) {
        Ok(bytes) => bytes,
        Err(_) => return CacheArtifact::empty(model, dims),
    };

    let artifact: CacheArtifact = match bincode::deserialize(&bytes) {
        Ok(artifact) => artifact,
        Err(e) => {
            warn!(path = %cache_file.display(), error = %e, "Discarding corrupt embedding cache");
            return CacheArtifact::empty(model, dims);
        }
    };

    if artifact.model != model || artifact.dims != dims {
        warn!(
            cached_model = %artifact.model,
            configured_model = %model,
            "Embedding model changed, discarding cache"
        );
        return CacheArtifact::empty(model, dims);
    }

    artifact
}

/// Persist the full cache state atomically under the advisory lock.
pub fn save(cache_file: &Path, lock_file: &Path, artifact: &CacheArtifact) -> Result<()> {
    if let Some(parent) = cache_file.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create cache directory: {}", parent.display()))?;
    }

    let _lock = FileLock::acquire(lock_file)
        .with_context(|| format!("Failed to lock cache: {}", lock_file.display()))?;

    let bytes = bincode::serialize(artifact).context("Failed to encode embedding cache")?;

    let temp_file = cache_file.with_extension(format!("tmp.{}", std::process::id()));
    let write_result = (|| -> Result<()> {
        std::fs::write(&temp_file, &bytes)?;
        // Flush file contents before the rename makes them canonical.
        File::open(&temp_file)?.sync_all()?;
        std::fs::rename(&temp_file, cache_file)?;
        Ok(())
    })();

    if write_result.is_err() {
        let _ = std::fs::remove_file(&temp_file);
    }
    write_result.with_context(|| format!("Failed to persist cache: {}", cache_file.display()))
}

/// Advisory exclusive lock on a dedicated lock file, released on drop.
struct FileLock {
    _file: File,
}

impl FileLock {
    fn acquire(path: &Path) -> Result<FileLock> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        lock_exclusive(&file)?;
        Ok(FileLock { _file: file })
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        let _ = unlock(&self._file);
    }
}

#[cfg(unix)]
fn lock_exclusive(file: &File) -> std::io::Result<()> {
    use std::os::fd::AsRawFd;
    const LOCK_EX: i32 = 2;
    let fd = file.as_raw_fd();
    // SAFETY: flock is called with a valid file descriptor and constant flags.
    let rc = unsafe { flock(fd, LOCK_EX) };
    if rc == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

#[cfg(unix)]
fn unlock(file: &File) -> std::io::Result<()> {
    use std::os::fd::AsRawFd;
    const LOCK_UN: i32 = 8;
    let fd = file.as_raw_fd();
    // SAFETY: flock is called with a valid file descriptor and constant flags.
    let rc = unsafe { flock(fd, LOCK_UN) };
    if rc == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

#[cfg(unix)]
extern "C" {
    fn flock(fd: i32, operation: i32) -> i32;
}

#[cfg(not(unix))]
fn lock_exclusive(_file: &File) -> std::io::Result<()> {
    // Atomic rename alone keeps readers consistent on non-Unix hosts.
    Ok(())
}

#[cfg(not(unix))]
fn unlock(_file: &File) -> std::io::Result<()> {
    Ok(())
}
