// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The on-disk content store.
//!
//! Blobs are keyed by content hash and written atomically: a fresh temp
//! file in the cache directory, renamed into place. A pre-existing
//! destination means the store already has the value. Failures never
//! propagate; callers degrade to a cache miss.

use std::io::Write as _;
use std::path::{Path, PathBuf};

use tracing::debug;

/// Environment variable overriding the cache root, for test isolation.
pub const CACHE_ROOT_ENV: &str = "SOLDER_CACHE_DIR";

const CACHE_DIR_NAME: &str = "solder-cache";

/// File metadata used to validate cached content.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStat {
    pub size: u64,
    pub mtime_nanos: i64,
}

/// File-system access used by the cache layer.
///
/// The cache never touches `std::fs` directly; the facade injects this
/// handle so tests can redirect the cache root or inject faults without
/// process-global state.
pub trait CacheFs: Send + Sync {
    fn cache_root(&self) -> PathBuf;
    fn read(&self, path: &Path) -> std::io::Result<Vec<u8>>;
    fn stat(&self, path: &Path) -> std::io::Result<FileStat>;
    fn mkdir_all(&self, path: &Path) -> std::io::Result<()>;
    fn remove_all(&self, path: &Path) -> std::io::Result<()>;
    fn write_atomic(
        &self,
        dir: &Path,
        temp_prefix: &str,
        dest: &Path,
        data: &[u8],
        no_clobber: bool,
    ) -> std::io::Result<()>;
}

/// The real file system.
#[derive(Default)]
pub struct RealFs {
    root_override: Option<PathBuf>,
}

impl RealFs {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Pins the cache root, bypassing the environment lookup.
    #[must_use]
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root_override: Some(root.into()),
        }
    }
}

impl CacheFs for RealFs {
    fn cache_root(&self) -> PathBuf {
        if let Some(root) = &self.root_override {
            return root.clone();
        }
        match std::env::var_os(CACHE_ROOT_ENV) {
            Some(root) if !root.is_empty() => PathBuf::from(root),
            _ => std::env::temp_dir(),
        }
    }

    fn read(&self, path: &Path) -> std::io::Result<Vec<u8>> {
        std::fs::read(path)
    }

    fn stat(&self, path: &Path) -> std::io::Result<FileStat> {
        let meta = std::fs::metadata(path)?;
        let modified = meta.modified()?;
        let mtime_nanos = match modified.duration_since(std::time::UNIX_EPOCH) {
            Ok(d) => i64::try_from(d.as_nanos()).unwrap_or(i64::MAX),
            Err(e) => -i64::try_from(e.duration().as_nanos()).unwrap_or(i64::MAX),
        };
        Ok(FileStat {
            size: meta.len(),
            mtime_nanos,
        })
    }

    fn mkdir_all(&self, path: &Path) -> std::io::Result<()> {
        std::fs::create_dir_all(path)
    }

    fn remove_all(&self, path: &Path) -> std::io::Result<()> {
        std::fs::remove_dir_all(path)
    }

    fn write_atomic(
        &self,
        dir: &Path,
        temp_prefix: &str,
        dest: &Path,
        data: &[u8],
        no_clobber: bool,
    ) -> std::io::Result<()> {
        let mut tmp = tempfile::Builder::new().prefix(temp_prefix).tempfile_in(dir)?;
        tmp.write_all(data)?;
        tmp.flush()?;
        if no_clobber {
            match tmp.persist_noclobber(dest) {
                Ok(_) => Ok(()),
                // The store already has this value; dropping the temp file
                // removes it.
                Err(e) if e.error.kind() == std::io::ErrorKind::AlreadyExists => Ok(()),
                Err(e) => Err(e.error),
            }
        } else {
            tmp.persist(dest).map(|_| ()).map_err(|e| e.error)
        }
    }
}

/// The base directory for cache files.
pub(crate) fn dir(fs: &dyn CacheFs) -> PathBuf {
    fs.cache_root().join(CACHE_DIR_NAME)
}

/// Removes all cached data. Missing directory counts as success.
pub(crate) fn clear(fs: &dyn CacheFs) -> std::io::Result<()> {
    match fs.remove_all(&dir(fs)) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

fn blob_path(fs: &dyn CacheFs, key: &str) -> PathBuf {
    dir(fs).join(format!("{key}.bin"))
}

/// Reads a content blob by key.
pub(crate) fn read_cache(fs: &dyn CacheFs, key: &str) -> Option<Vec<u8>> {
    fs.read(&blob_path(fs, key)).ok()
}

/// Persists a content blob. Errors degrade to a miss on the next lookup.
pub(crate) fn write_cache(fs: &dyn CacheFs, key: &str, content: &[u8]) {
    let dir = dir(fs);
    if let Err(e) = fs.mkdir_all(&dir) {
        debug!(error = %e, "cache dir create failed");
        return;
    }
    let dest = blob_path(fs, key);
    if let Err(e) = fs.write_atomic(&dir, &format!("{key}.tmp-"), &dest, content, true) {
        debug!(error = %e, key, "cache blob write failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn blob_round_trip() {
        let tmp = TempDir::new().unwrap();
        let fs = RealFs::with_root(tmp.path());
        assert!(read_cache(&fs, "deadbeef").is_none());
        write_cache(&fs, "deadbeef", b"content");
        assert_eq!(read_cache(&fs, "deadbeef").unwrap(), b"content");
    }

    #[test]
    fn existing_blob_is_not_clobbered() {
        let tmp = TempDir::new().unwrap();
        let fs = RealFs::with_root(tmp.path());
        write_cache(&fs, "k", b"first");
        write_cache(&fs, "k", b"second");
        assert_eq!(read_cache(&fs, "k").unwrap(), b"first");
    }

    #[test]
    fn clear_removes_everything_and_tolerates_absence() {
        let tmp = TempDir::new().unwrap();
        let fs = RealFs::with_root(tmp.path());
        write_cache(&fs, "k", b"v");
        assert!(dir(&fs).exists());
        clear(&fs).unwrap();
        assert!(!dir(&fs).exists());
        clear(&fs).unwrap();
    }

    #[test]
    fn no_temp_files_left_behind() {
        let tmp = TempDir::new().unwrap();
        let fs = RealFs::with_root(tmp.path());
        write_cache(&fs, "k", b"v");
        let leftovers: Vec<_> = std::fs::read_dir(dir(&fs))
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains(".tmp-"))
            .collect();
        assert!(leftovers.is_empty());
    }
}
