// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The run-level manifest cache.
//!
//! A manifest maps one run configuration (working directory, environment,
//! options, patterns) to the content hashes and file-metadata snapshots that
//! produced it. A valid manifest lets a repeated run skip loading entirely:
//! results are synthesized by reading each package's blob from the content
//! store. Validation re-stats every recorded file and re-hashes each
//! package's root files, so a same-size same-mtime edit still invalidates.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::cache_key::{
    build_cache_files, cache_key_for_package, hash_files, header_hash, package_files,
    root_package_files, CacheFile, CACHE_VERSION,
};
use crate::cache_store::{self, CacheFs};
use crate::codegen::OUTPUT_FILE_NAME;
use crate::loader::Package;
use crate::{GenerateOptions, GenerateResult};

/// Toolchain manifests that affect builds; discovered by walking the working
/// directory and every ancestor.
pub const EXTRA_FILE_NAMES: &[&str] = &["Cargo.toml", "Cargo.lock", "rust-toolchain.toml"];

/// Per-run cache metadata for generated packages.
#[derive(Debug, Serialize, Deserialize)]
pub struct CacheManifest {
    pub version: String,
    pub wd: String,
    pub tags: String,
    pub prefix: String,
    pub header_hash: String,
    pub env_hash: String,
    pub patterns: Vec<String>,
    pub packages: Vec<ManifestPackage>,
    pub extra_files: Vec<CacheFile>,
    /// Content hash over the extra files, recomputed during validation so a
    /// same-size same-mtime edit to a toolchain manifest still invalidates.
    pub extra_hash: String,
}

/// Cached output for a single package.
#[derive(Debug, Serialize, Deserialize)]
pub struct ManifestPackage {
    pub pkg_path: String,
    pub output_path: String,
    pub files: Vec<CacheFile>,
    pub content_hash: String,
    pub root_files: Vec<CacheFile>,
    pub root_hash: String,
}

/// Loads cached generation results if the manifest for this run is still
/// valid and every content blob is present.
pub fn read_manifest_results(
    fs: &dyn CacheFs,
    wd: &Path,
    env: &[String],
    patterns: &[String],
    opts: &GenerateOptions,
) -> Option<Vec<GenerateResult>> {
    let key = manifest_key(wd, env, patterns, opts);
    let manifest = read_manifest(fs, &key)?;
    if !manifest_valid(fs, &manifest) {
        return None;
    }
    let mut results = Vec::with_capacity(manifest.packages.len());
    for pkg in &manifest.packages {
        let content = cache_store::read_cache(fs, &pkg.content_hash)?;
        results.push(GenerateResult {
            pkg_path: pkg.pkg_path.clone(),
            output_path: PathBuf::from(&pkg.output_path),
            content,
            errs: Vec::new(),
        });
    }
    debug!(packages = results.len(), "manifest cache hit");
    Some(results)
}

/// Persists cache metadata after a fully successful run.
pub fn write_manifest(
    fs: &dyn CacheFs,
    wd: &Path,
    env: &[String],
    patterns: &[String],
    opts: &GenerateOptions,
    pkgs: &[Arc<Package>],
) {
    if pkgs.is_empty() {
        return;
    }
    let key = manifest_key(wd, env, patterns, opts);
    let mut manifest = CacheManifest {
        version: CACHE_VERSION.to_string(),
        wd: wd.to_string_lossy().into_owned(),
        tags: opts.tags.clone(),
        prefix: opts.prefix_output_file.clone(),
        header_hash: header_hash(&opts.header),
        env_hash: env_hash(env),
        patterns: sorted_strings(patterns),
        packages: Vec::new(),
        extra_files: extra_cache_files(fs, wd),
        extra_hash: String::new(),
    };
    let mut extra_paths: Vec<String> = manifest.extra_files.iter().map(|f| f.path.clone()).collect();
    extra_paths.sort();
    manifest.extra_hash = hash_files(fs, &extra_paths).unwrap_or_default();
    for pkg in pkgs {
        let mut files = package_files(pkg);
        if files.is_empty() {
            continue;
        }
        files.sort();
        let Ok(Some(content_hash)) = cache_key_for_package(fs, pkg, opts) else {
            continue;
        };
        let output_path = pkg
            .dir
            .join(format!("{}{}", opts.prefix_output_file, OUTPUT_FILE_NAME));
        let Ok(meta_files) = build_cache_files(fs, &files) else {
            continue;
        };
        let mut root_files = root_package_files(pkg);
        root_files.sort();
        let Ok(root_meta) = build_cache_files(fs, &root_files) else {
            continue;
        };
        let Ok(root_hash) = hash_files(fs, &root_files) else {
            continue;
        };
        manifest.packages.push(ManifestPackage {
            pkg_path: pkg.pkg_path.clone(),
            output_path: output_path.to_string_lossy().into_owned(),
            files: meta_files,
            content_hash,
            root_files: root_meta,
            root_hash,
        });
    }
    write_manifest_file(fs, &key, &manifest);
}

/// Builds the cache key for a run configuration.
fn manifest_key(wd: &Path, env: &[String], patterns: &[String], opts: &GenerateOptions) -> String {
    let mut h = Sha256::new();
    h.update(CACHE_VERSION.as_bytes());
    h.update([0u8]);
    h.update(wd.to_string_lossy().as_bytes());
    h.update([0u8]);
    h.update(env_hash(env).as_bytes());
    h.update([0u8]);
    h.update(opts.tags.as_bytes());
    h.update([0u8]);
    h.update(opts.prefix_output_file.as_bytes());
    h.update([0u8]);
    h.update(header_hash(&opts.header).as_bytes());
    h.update([0u8]);
    for p in sorted_strings(patterns) {
        h.update(p.as_bytes());
        h.update([0u8]);
    }
    format!("{:x}", h.finalize())
}

fn manifest_path(fs: &dyn CacheFs, key: &str) -> PathBuf {
    cache_store::dir(fs).join(format!("{key}.manifest.json"))
}

fn read_manifest(fs: &dyn CacheFs, key: &str) -> Option<CacheManifest> {
    let data = fs.read(&manifest_path(fs, key)).ok()?;
    serde_json::from_slice(&data).ok()
}

fn write_manifest_file(fs: &dyn CacheFs, key: &str, manifest: &CacheManifest) {
    let dir = cache_store::dir(fs);
    if fs.mkdir_all(&dir).is_err() {
        return;
    }
    let Ok(data) = serde_json::to_vec(manifest) else {
        return;
    };
    let dest = manifest_path(fs, key);
    if let Err(e) = fs.write_atomic(&dir, &format!("{key}.manifest-"), &dest, &data, false) {
        debug!(error = %e, key, "manifest write failed");
    }
}

/// Reports whether the manifest still matches current inputs.
fn manifest_valid(fs: &dyn CacheFs, manifest: &CacheManifest) -> bool {
    if manifest.version != CACHE_VERSION {
        return false;
    }
    if manifest.env_hash.is_empty() || manifest.packages.is_empty() {
        return false;
    }
    if !manifest.extra_files.is_empty() {
        let Ok(current) = build_cache_files_from_meta(fs, &manifest.extra_files) else {
            return false;
        };
        if current != manifest.extra_files {
            return false;
        }
        let mut extra_paths: Vec<String> =
            manifest.extra_files.iter().map(|f| f.path.clone()).collect();
        extra_paths.sort();
        match hash_files(fs, &extra_paths) {
            Ok(extra_hash) if extra_hash == manifest.extra_hash => {}
            _ => return false,
        }
    }
    for pkg in &manifest.packages {
        if pkg.content_hash.is_empty() {
            return false;
        }
        if pkg.root_files.is_empty() || pkg.root_hash.is_empty() {
            return false;
        }
        let Ok(current) = build_cache_files_from_meta(fs, &pkg.files) else {
            return false;
        };
        if current != pkg.files {
            return false;
        }
        let Ok(root_current) = build_cache_files_from_meta(fs, &pkg.root_files) else {
            return false;
        };
        if root_current != pkg.root_files {
            return false;
        }
        // Same-timestamp edits keep size and mtime; only re-hashing the root
        // file contents catches them.
        let mut root_paths: Vec<String> = pkg.root_files.iter().map(|f| f.path.clone()).collect();
        root_paths.sort();
        match hash_files(fs, &root_paths) {
            Ok(root_hash) if root_hash == pkg.root_hash => {}
            _ => return false,
        }
    }
    true
}

/// Re-stats recorded files for comparison against stored metadata.
fn build_cache_files_from_meta(
    fs: &dyn CacheFs,
    files: &[CacheFile],
) -> Result<Vec<CacheFile>, crate::error::Error> {
    let paths: Vec<String> = files.iter().map(|f| f.path.clone()).collect();
    build_cache_files(fs, &paths)
}

/// Collects toolchain manifests affecting builds for a working directory.
fn extra_cache_files(fs: &dyn CacheFs, wd: &Path) -> Vec<CacheFile> {
    let mut out = Vec::new();
    for path in extra_cache_paths(wd) {
        let Ok(stat) = fs.stat(&path) else { continue };
        out.push(CacheFile {
            path: path.to_string_lossy().into_owned(),
            size: stat.size,
            mod_time: stat.mtime_nanos,
        });
    }
    out.sort_by(|a, b| a.path.cmp(&b.path));
    out
}

/// Walks the working directory and every ancestor collecting existing
/// toolchain manifest files.
fn extra_cache_paths(wd: &Path) -> Vec<PathBuf> {
    let mut paths = Vec::new();
    let mut seen = std::collections::BTreeSet::new();
    let mut dir = Some(wd.to_path_buf());
    while let Some(current) = dir {
        for name in EXTRA_FILE_NAMES {
            let full = current.join(name);
            if !seen.insert(full.clone()) {
                continue;
            }
            if full.is_file() {
                paths.push(full);
            }
        }
        dir = current.parent().map(Path::to_path_buf);
    }
    paths
}

/// Sorted copy of the input list.
fn sorted_strings(values: &[String]) -> Vec<String> {
    let mut out = values.to_vec();
    out.sort();
    out
}

/// Stable hash of the sorted environment-variable list; "" when empty.
pub fn env_hash(env: &[String]) -> String {
    if env.is_empty() {
        return String::new();
    }
    let mut h = Sha256::new();
    for v in sorted_strings(env) {
        h.update(v.as_bytes());
        h.update([0u8]);
    }
    format!("{:x}", h.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_hash_is_order_independent() {
        let a = env_hash(&["A=1".to_string(), "B=2".to_string()]);
        let b = env_hash(&["B=2".to_string(), "A=1".to_string()]);
        assert_eq!(a, b);
        assert_ne!(a, env_hash(&["A=1".to_string()]));
        assert_eq!(env_hash(&[]), "");
    }

    #[test]
    fn manifest_key_ignores_pattern_order() {
        let opts = GenerateOptions::default();
        let env = vec!["A=1".to_string()];
        let k1 = manifest_key(
            Path::new("/w"),
            &env,
            &["a".to_string(), "b".to_string()],
            &opts,
        );
        let k2 = manifest_key(
            Path::new("/w"),
            &env,
            &["b".to_string(), "a".to_string()],
            &opts,
        );
        assert_eq!(k1, k2);
        let k3 = manifest_key(Path::new("/w"), &env, &["a".to_string()], &opts);
        assert_ne!(k1, k3);
    }

    #[test]
    fn extra_paths_walk_ancestors() {
        let tmp = tempfile::TempDir::new().unwrap();
        let nested = tmp.path().join("a/b");
        std::fs::create_dir_all(&nested).unwrap();
        std::fs::write(tmp.path().join("Cargo.toml"), "[workspace]\n").unwrap();
        std::fs::write(nested.join("Cargo.toml"), "[package]\n").unwrap();
        let paths = extra_cache_paths(&nested);
        assert!(paths.contains(&nested.join("Cargo.toml")));
        assert!(paths.contains(&tmp.path().join("Cargo.toml")));
    }
}
