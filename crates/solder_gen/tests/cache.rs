// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Incremental-cache behavior: manifest hits, invalidation, and on-disk
//! layout.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use solder_gen::{Ctx, GenerateOptions, GenerateResult, RealFs};
use tempfile::TempDir;

struct Workspace {
    wd: TempDir,
    cache: TempDir,
}

impl Workspace {
    fn new() -> Self {
        Self {
            wd: TempDir::new().unwrap(),
            cache: TempDir::new().unwrap(),
        }
    }

    fn write(&self, name: &str, contents: &str) {
        let path = self.wd.path().join(name);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(path, contents).unwrap();
    }

    fn write_injectable(&self) {
        self.write("lib.rs", "pub fn answer() -> u32 { 42 }\n");
        self.write(
            "inject.rs",
            r#"#![cfg(solderinject)]
use solder::build;

pub fn init() -> u32 {
    build!(answer)
}
"#,
        );
    }

    /// Runs generate, recording every timing label the core reports.
    fn generate_traced(
        &self,
        opts: &GenerateOptions,
    ) -> (Vec<GenerateResult>, Vec<String>) {
        let labels: Arc<Mutex<Vec<String>>> = Arc::default();
        let seen = labels.clone();
        let ctx = Ctx::new()
            .with_fs(Arc::new(RealFs::with_root(self.cache.path())))
            .with_timing(move |label, _| seen.lock().unwrap().push(label.to_string()));
        let env = vec!["SOLDER_TEST=1".to_string()];
        let (results, errs) = solder_gen::generate(&ctx, self.wd.path(), &env, &[], opts);
        assert!(errs.is_empty(), "{errs:?}");
        let labels = labels.lock().unwrap().clone();
        (results, labels)
    }

    fn cache_dir(&self) -> PathBuf {
        self.cache.path().join("solder-cache")
    }

    fn cache_entries(&self, suffix: &str) -> Vec<String> {
        let mut out: Vec<String> = std::fs::read_dir(self.cache_dir())
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .filter(|name| name.ends_with(suffix))
            .collect();
        out.sort();
        out
    }
}

/// Rewrites a file with different bytes of the same length, restoring the
/// original modification time.
fn same_stat_edit(path: &Path, contents: &str) {
    let original = std::fs::metadata(path).unwrap();
    assert_eq!(
        original.len(),
        contents.len() as u64,
        "edit must preserve file size"
    );
    let mtime = original.modified().unwrap();
    std::fs::write(path, contents).unwrap();
    let file = std::fs::OpenOptions::new().write(true).open(path).unwrap();
    file.set_modified(mtime).unwrap();
}

#[test]
fn second_run_hits_the_manifest_without_loading() {
    let ws = Workspace::new();
    ws.write_injectable();
    let opts = GenerateOptions::default();

    let (first, labels) = ws.generate_traced(&opts);
    assert!(labels.iter().any(|l| l == "load.packages"), "{labels:?}");

    let (second, labels) = ws.generate_traced(&opts);
    assert!(
        !labels.iter().any(|l| l == "load.packages"),
        "manifest hit must not invoke the loader: {labels:?}"
    );
    assert!(labels.iter().any(|l| l == "generate.manifest_hit"));
    assert_eq!(first[0].content, second[0].content);
    assert_eq!(first[0].output_path, second[0].output_path);
}

#[test]
fn cache_layout_after_one_successful_run() {
    let ws = Workspace::new();
    ws.write_injectable();
    ws.generate_traced(&GenerateOptions::default());

    let manifests = ws.cache_entries(".manifest.json");
    assert_eq!(manifests.len(), 1, "{manifests:?}");
    let blobs = ws.cache_entries(".bin");
    assert!(!blobs.is_empty());
    let metas: Vec<String> = ws
        .cache_entries(".json")
        .into_iter()
        .filter(|name| !name.ends_with(".manifest.json"))
        .collect();
    assert!(!metas.is_empty());
    // No transient temp files survive a healthy run.
    for name in std::fs::read_dir(ws.cache_dir())
        .unwrap()
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().into_owned())
    {
        assert!(
            !name.contains(".tmp-") && !name.contains(".meta-") && !name.contains(".manifest-"),
            "leftover temp file {name}"
        );
    }
}

#[test]
fn source_edit_invalidates_and_regenerates() {
    let ws = Workspace::new();
    ws.write_injectable();
    let opts = GenerateOptions::default();
    let (first, _) = ws.generate_traced(&opts);

    ws.write("lib.rs", "pub fn answer_v2() -> u32 { 42 }\n");
    ws.write(
        "inject.rs",
        r#"#![cfg(solderinject)]
use solder::build;

pub fn init() -> u32 {
    build!(answer_v2)
}
"#,
    );
    let (second, labels) = ws.generate_traced(&opts);
    assert!(labels.iter().any(|l| l == "load.packages"), "{labels:?}");
    assert_ne!(first[0].content, second[0].content);
    assert!(String::from_utf8(second[0].content.clone())
        .unwrap()
        .contains("answer_v2()"));
}

#[test]
fn same_stat_source_edit_invalidates_the_manifest() {
    let ws = Workspace::new();
    ws.write("lib.rs", "pub fn answer() -> u32 { 41 }\n");
    ws.write(
        "inject.rs",
        r#"#![cfg(solderinject)]
use solder::build;

pub fn init() -> u32 {
    build!(answer)
}
"#,
    );
    let opts = GenerateOptions::default();
    ws.generate_traced(&opts);

    // Same size, same mtime, different content: only the root-hash
    // recomputation can catch this.
    same_stat_edit(
        &ws.wd.path().join("lib.rs"),
        "pub fn answer() -> u32 { 43 }\n",
    );
    let (_, labels) = ws.generate_traced(&opts);
    assert!(
        labels.iter().any(|l| l == "load.packages"),
        "same-stat edit must invalidate the manifest: {labels:?}"
    );
}

#[test]
fn same_stat_toolchain_manifest_edit_invalidates() {
    let ws = Workspace::new();
    ws.write_injectable();
    ws.write("Cargo.toml", "[package]\nname = \"scratch-a\"\n");
    let opts = GenerateOptions::default();
    ws.generate_traced(&opts);

    same_stat_edit(
        &ws.wd.path().join("Cargo.toml"),
        "[package]\nname = \"scratch-b\"\n",
    );
    let (_, labels) = ws.generate_traced(&opts);
    assert!(
        labels.iter().any(|l| l == "load.packages"),
        "toolchain manifest edit must invalidate: {labels:?}"
    );
}

#[test]
fn option_changes_miss_the_manifest() {
    let ws = Workspace::new();
    ws.write_injectable();
    let (first, _) = ws.generate_traced(&GenerateOptions::default());

    let tagged = GenerateOptions {
        tags: "integration".to_string(),
        ..GenerateOptions::default()
    };
    let (second, labels) = ws.generate_traced(&tagged);
    assert!(labels.iter().any(|l| l == "load.packages"), "{labels:?}");
    assert_ne!(first[0].content, second[0].content);
    assert!(String::from_utf8(second[0].content.clone())
        .unwrap()
        .contains("#![cfg(not(any(solderinject, integration)))]"));
}

#[test]
fn environment_changes_miss_the_manifest() {
    let ws = Workspace::new();
    ws.write_injectable();
    let opts = GenerateOptions::default();
    let run = |env: Vec<String>| {
        let labels: Arc<Mutex<Vec<String>>> = Arc::default();
        let seen = labels.clone();
        let ctx = Ctx::new()
            .with_fs(Arc::new(RealFs::with_root(ws.cache.path())))
            .with_timing(move |label, _| seen.lock().unwrap().push(label.to_string()));
        let (results, errs) = solder_gen::generate(&ctx, ws.wd.path(), &env, &[], &opts);
        assert!(errs.is_empty(), "{errs:?}");
        let labels = labels.lock().unwrap().clone();
        (results, labels)
    };
    run(vec!["A=1".to_string()]);
    let (_, labels) = run(vec!["A=2".to_string()]);
    assert!(labels.iter().any(|l| l == "load.packages"), "{labels:?}");
}

#[test]
fn missing_blob_invalidates_the_manifest() {
    let ws = Workspace::new();
    ws.write_injectable();
    let opts = GenerateOptions::default();
    ws.generate_traced(&opts);

    for blob in ws.cache_entries(".bin") {
        std::fs::remove_file(ws.cache_dir().join(blob)).unwrap();
    }
    let (results, labels) = ws.generate_traced(&opts);
    assert!(labels.iter().any(|l| l == "load.packages"), "{labels:?}");
    assert!(!results[0].content.is_empty());
}

#[test]
fn injector_less_packages_round_trip_through_the_manifest() {
    let ws = Workspace::new();
    ws.write("lib.rs", "pub struct Quiet;\n");
    let opts = GenerateOptions::default();
    let (first, _) = ws.generate_traced(&opts);
    assert!(first[0].content.is_empty());

    let (second, labels) = ws.generate_traced(&opts);
    assert!(
        !labels.iter().any(|l| l == "load.packages"),
        "{labels:?}"
    );
    assert!(second[0].content.is_empty());
}

#[test]
fn content_blobs_are_content_addressed_across_runs() {
    let ws = Workspace::new();
    ws.write_injectable();
    let opts = GenerateOptions::default();
    ws.generate_traced(&opts);
    let blobs_before = ws.cache_entries(".bin");

    // Forcing a regeneration of identical inputs adds no new blobs.
    for manifest in ws.cache_entries(".manifest.json") {
        std::fs::remove_file(ws.cache_dir().join(manifest)).unwrap();
    }
    ws.generate_traced(&opts);
    assert_eq!(blobs_before, ws.cache_entries(".bin"));
}
