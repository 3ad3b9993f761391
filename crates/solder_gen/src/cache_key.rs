// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Per-package content keys.
//!
//! The content hash covers the generator version, the package path, the
//! generation options, and the sorted transitive source closure of the
//! package, so any input perturbation produces a different key. A metadata
//! fast path keyed by `(version, package, options)` trusts a stored hash
//! when every file's path, size, and mtime still match and a fresh hash of
//! just the root package's files agrees; the root-hash check defeats edits
//! that preserve both size and timestamp.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::cache_store::{self, CacheFs};
use crate::error::Error;
use crate::loader::Package;
use crate::GenerateOptions;

/// Schema/version identifier for cache entries.
pub const CACHE_VERSION: &str = "solder-cache-v1";

/// File metadata used to validate cached content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheFile {
    pub path: String,
    pub size: u64,
    pub mod_time: i64,
}

/// Inputs and outputs of a single package cache entry.
#[derive(Debug, Serialize, Deserialize)]
pub struct CacheMeta {
    pub version: String,
    pub pkg_path: String,
    pub tags: String,
    pub prefix: String,
    pub header_hash: String,
    pub files: Vec<CacheFile>,
    pub content_hash: String,
    pub root_hash: String,
}

/// Returns the content hash for a package, if cacheable.
pub fn cache_key_for_package(
    fs: &dyn CacheFs,
    pkg: &Arc<Package>,
    opts: &GenerateOptions,
) -> Result<Option<String>, Error> {
    let mut files = package_files(pkg);
    if files.is_empty() {
        return Ok(None);
    }
    files.sort();
    let meta_key = cache_meta_key(&pkg.pkg_path, opts);
    if let Some(meta) = read_cache_meta(fs, &meta_key) {
        if cache_meta_matches(fs, &meta, pkg, opts, &files) {
            debug!(package = %pkg.pkg_path, "cache metadata fast path hit");
            return Ok(Some(meta.content_hash));
        }
    }
    let content_hash = content_hash_for_paths(fs, &pkg.pkg_path, opts, &files)?;
    let mut root_files = root_package_files(pkg);
    root_files.sort();
    let root_hash = hash_files(fs, &root_files)?;
    let meta_files = build_cache_files(fs, &files)?;
    let meta = CacheMeta {
        version: CACHE_VERSION.to_string(),
        pkg_path: pkg.pkg_path.clone(),
        tags: opts.tags.clone(),
        prefix: opts.prefix_output_file.clone(),
        header_hash: header_hash(&opts.header),
        files: meta_files,
        content_hash: content_hash.clone(),
        root_hash,
    };
    write_cache_meta(fs, &meta_key, &meta);
    Ok(Some(content_hash))
}

/// Returns the transitive source files for a package graph.
pub fn package_files(root: &Arc<Package>) -> Vec<String> {
    let mut seen = std::collections::BTreeSet::new();
    let mut files = Vec::new();
    let mut stack = vec![root.clone()];
    while let Some(pkg) = stack.pop() {
        if !seen.insert(pkg.pkg_path.clone()) {
            continue;
        }
        files.extend(pkg.file_paths());
        for imp in pkg.imports.values() {
            stack.push(imp.clone());
        }
    }
    files
}

/// Returns the direct source files of the root package only.
pub fn root_package_files(pkg: &Arc<Package>) -> Vec<String> {
    pkg.file_paths()
}

/// Builds the key for a package's cache metadata entry.
fn cache_meta_key(pkg_path: &str, opts: &GenerateOptions) -> String {
    let mut h = Sha256::new();
    h.update(CACHE_VERSION.as_bytes());
    h.update([0u8]);
    h.update(pkg_path.as_bytes());
    h.update([0u8]);
    h.update(opts.tags.as_bytes());
    h.update([0u8]);
    h.update(opts.prefix_output_file.as_bytes());
    h.update([0u8]);
    h.update(header_hash(&opts.header).as_bytes());
    format!("{:x}", h.finalize())
}

fn cache_meta_path(fs: &dyn CacheFs, key: &str) -> std::path::PathBuf {
    cache_store::dir(fs).join(format!("{key}.json"))
}

fn read_cache_meta(fs: &dyn CacheFs, key: &str) -> Option<CacheMeta> {
    let data = fs.read(&cache_meta_path(fs, key)).ok()?;
    serde_json::from_slice(&data).ok()
}

fn write_cache_meta(fs: &dyn CacheFs, key: &str, meta: &CacheMeta) {
    let dir = cache_store::dir(fs);
    if fs.mkdir_all(&dir).is_err() {
        return;
    }
    let Ok(data) = serde_json::to_vec(meta) else {
        return;
    };
    let dest = cache_meta_path(fs, key);
    if let Err(e) = fs.write_atomic(&dir, &format!("{key}.meta-"), &dest, &data, false) {
        debug!(error = %e, key, "cache metadata write failed");
    }
}

/// Reports whether stored metadata matches the current package inputs.
fn cache_meta_matches(
    fs: &dyn CacheFs,
    meta: &CacheMeta,
    pkg: &Arc<Package>,
    opts: &GenerateOptions,
    files: &[String],
) -> bool {
    if meta.version != CACHE_VERSION {
        return false;
    }
    if meta.pkg_path != pkg.pkg_path
        || meta.tags != opts.tags
        || meta.prefix != opts.prefix_output_file
    {
        return false;
    }
    if meta.header_hash != header_hash(&opts.header) {
        return false;
    }
    if meta.files.len() != files.len() {
        return false;
    }
    let Ok(current) = build_cache_files(fs, files) else {
        return false;
    };
    if meta.files != current {
        return false;
    }
    let mut root_files = root_package_files(pkg);
    if root_files.is_empty() || meta.root_hash.is_empty() {
        return false;
    }
    root_files.sort();
    match hash_files(fs, &root_files) {
        Ok(root_hash) if root_hash == meta.root_hash => {}
        _ => return false,
    }
    !meta.content_hash.is_empty()
}

/// Converts file paths into cache metadata entries.
pub fn build_cache_files(fs: &dyn CacheFs, files: &[String]) -> Result<Vec<CacheFile>, Error> {
    let mut out = Vec::with_capacity(files.len());
    for name in files {
        let stat = fs.stat(name.as_ref()).map_err(|e| Error::Io {
            path: name.into(),
            source: e,
        })?;
        out.push(CacheFile {
            path: name.clone(),
            size: stat.size,
            mod_time: stat.mtime_nanos,
        });
    }
    Ok(out)
}

/// Stable hash of the generated header content; empty headers hash to "".
pub fn header_hash(header: &[u8]) -> String {
    if header.is_empty() {
        return String::new();
    }
    format!("{:x}", Sha256::digest(header))
}

/// Hashes the current package inputs: version, identifying metadata, then
/// sorted `(path, bytes)` pairs with `0x00` delimiters.
pub fn content_hash_for_paths(
    fs: &dyn CacheFs,
    pkg_path: &str,
    opts: &GenerateOptions,
    files: &[String],
) -> Result<String, Error> {
    let mut h = Sha256::new();
    h.update(CACHE_VERSION.as_bytes());
    h.update([0u8]);
    h.update(pkg_path.as_bytes());
    h.update([0u8]);
    h.update(opts.tags.as_bytes());
    h.update([0u8]);
    h.update(opts.prefix_output_file.as_bytes());
    h.update([0u8]);
    h.update(header_hash(&opts.header).as_bytes());
    h.update([0u8]);
    for name in files {
        h.update(name.as_bytes());
        h.update([0u8]);
        let data = fs.read(name.as_ref()).map_err(|e| Error::Io {
            path: name.into(),
            source: e,
        })?;
        h.update(&data);
        h.update([0u8]);
    }
    Ok(format!("{:x}", h.finalize()))
}

/// Combined content hash over the provided paths; "" for an empty list.
pub fn hash_files(fs: &dyn CacheFs, files: &[String]) -> Result<String, Error> {
    if files.is_empty() {
        return Ok(String::new());
    }
    let mut h = Sha256::new();
    for name in files {
        h.update(name.as_bytes());
        h.update([0u8]);
        let data = fs.read(name.as_ref()).map_err(|e| Error::Io {
            path: name.into(),
            source: e,
        })?;
        h.update(&data);
        h.update([0u8]);
    }
    Ok(format!("{:x}", h.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache_store::RealFs;
    use crate::ctx::Ctx;
    use crate::loader::{FsLoader, PackageLoader};
    use std::path::Path;
    use tempfile::TempDir;

    fn write(dir: &Path, name: &str, contents: &str) {
        let path = dir.join(name);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(path, contents).unwrap();
    }

    fn load(tmp: &TempDir) -> Arc<Package> {
        FsLoader::new(tmp.path(), "")
            .load_package(&Ctx::new(), ".")
            .unwrap()
    }

    #[test]
    fn key_is_stable_and_sensitive_to_inputs() {
        let tmp = TempDir::new().unwrap();
        write(tmp.path(), "lib.rs", "pub struct A;\n");
        write(tmp.path(), "dep/lib.rs", "pub struct B;\n");
        let cache = TempDir::new().unwrap();
        let fs = RealFs::with_root(cache.path());
        let opts = GenerateOptions::default();

        let pkg = load(&tmp);
        let first = cache_key_for_package(&fs, &pkg, &opts).unwrap().unwrap();
        let again = cache_key_for_package(&fs, &pkg, &opts).unwrap().unwrap();
        assert_eq!(first, again);

        // Any option perturbation changes the key.
        let tagged = GenerateOptions {
            tags: "extra".into(),
            ..GenerateOptions::default()
        };
        assert_ne!(
            first,
            cache_key_for_package(&fs, &pkg, &tagged).unwrap().unwrap()
        );
        let with_header = GenerateOptions {
            header: b"// x\n".to_vec(),
            ..GenerateOptions::default()
        };
        assert_ne!(
            first,
            cache_key_for_package(&fs, &pkg, &with_header)
                .unwrap()
                .unwrap()
        );
        let prefixed = GenerateOptions {
            prefix_output_file: "p_".into(),
            ..GenerateOptions::default()
        };
        assert_ne!(
            first,
            cache_key_for_package(&fs, &pkg, &prefixed)
                .unwrap()
                .unwrap()
        );

        // A transitive file edit changes the key.
        write(tmp.path(), "dep/lib.rs", "pub struct B; // changed\n");
        let reloaded = load(&tmp);
        assert_ne!(
            first,
            cache_key_for_package(&fs, &reloaded, &opts)
                .unwrap()
                .unwrap()
        );
    }

    #[test]
    fn metadata_fast_path_rejects_same_stat_content_edit() {
        let tmp = TempDir::new().unwrap();
        write(tmp.path(), "lib.rs", "pub struct Alpha;\n");
        let cache = TempDir::new().unwrap();
        let fs = RealFs::with_root(cache.path());
        let opts = GenerateOptions::default();
        let pkg = load(&tmp);
        let first = cache_key_for_package(&fs, &pkg, &opts).unwrap().unwrap();

        // Same length, same mtime, different bytes.
        let path = tmp.path().join("lib.rs");
        let mtime = std::fs::metadata(&path).unwrap().modified().unwrap();
        std::fs::write(&path, "pub struct Alpho;\n").unwrap();
        let file = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
        file.set_modified(mtime).unwrap();
        drop(file);

        let reloaded = load(&tmp);
        let second = cache_key_for_package(&fs, &reloaded, &opts).unwrap().unwrap();
        assert_ne!(first, second);
    }

    #[test]
    fn unreadable_files_surface_as_errors() {
        let tmp = TempDir::new().unwrap();
        write(tmp.path(), "lib.rs", "pub struct A;\n");
        let cache = TempDir::new().unwrap();
        let fs = RealFs::with_root(cache.path());
        let pkg = load(&tmp);
        std::fs::remove_file(tmp.path().join("lib.rs")).unwrap();
        let err = cache_key_for_package(&fs, &pkg, &GenerateOptions::default()).unwrap_err();
        assert!(matches!(err, Error::Io { .. }));
    }
}
