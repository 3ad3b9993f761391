// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Core of the solder compile-time dependency-injection code generator.
//!
//! Solder reads packages (directories of source files) containing provider
//! set declarations and injector stubs, solves the dependency graph of each
//! injector, and produces a drop-in generated file per package with the
//! fully elaborated initialization code. The generated file is ordinary
//! source that the normal compiler builds; there is no runtime component.
//!
//! The pipeline is: load packages, consult the run-level manifest cache,
//! and on a miss parse provider sets, resolve each injector, synthesize and
//! format the output, then persist it to the content-addressed cache.
//!
//! # Example
//!
//! ```no_run
//! use std::path::Path;
//!
//! let ctx = solder_gen::Ctx::new();
//! let opts = solder_gen::GenerateOptions::default();
//! let (results, errs) = solder_gen::generate(
//!     &ctx,
//!     Path::new("."),
//!     &[],
//!     &["...".to_string()],
//!     &opts,
//! );
//! for err in &errs {
//!     eprintln!("solder: {err}");
//! }
//! for result in &results {
//!     if result.errs.is_empty() && !result.content.is_empty() {
//!         result.commit().expect("write generated file");
//!     }
//! }
//! ```

mod cache_key;
mod cache_manifest;
mod cache_store;
mod codegen;
mod ctx;
mod error;
mod loader;
mod model;
mod object_cache;
mod parse;
mod solve;
mod types;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use tracing::debug;

pub use crate::cache_store::{CacheFs, FileStat, RealFs, CACHE_ROOT_ENV};
pub use crate::codegen::{GENERATED_MARKER, OUTPUT_FILE_NAME};
pub use crate::ctx::{CancelToken, Ctx};
pub use crate::error::{Error, Pos, Result};
pub use crate::loader::{
    FnDecl, FsLoader, Package, PackageLoader, SourceFile, StaticDecl, StructDef, StructField,
    SymbolIndex, INJECT_CFG,
};
pub use crate::model::{
    FieldOut, FieldsGroup, Info, Injector, InjectorArg, InjectorSig, InterfaceBinding,
    ProvidedItem, Provider, ProviderInput, ProviderSet, ValueExpr,
};
pub use crate::types::TypeKey;

use crate::object_cache::ObjectCache;

/// Options controlling one generation run.
#[derive(Debug, Default, Clone)]
pub struct GenerateOptions {
    /// Verbatim prefix written below the generated marker, if non-empty.
    pub header: Vec<u8>,
    /// Prepended to the generated file name.
    pub prefix_output_file: String,
    /// Extra build tags, comma separated, widening the stub tag.
    pub tags: String,
}

/// The outcome of generating one package.
///
/// Empty `content` means the package has no injectors and nothing should be
/// written. The caller commits by writing `content` to `output_path`.
#[derive(Debug)]
pub struct GenerateResult {
    pub pkg_path: String,
    pub output_path: PathBuf,
    pub content: Vec<u8>,
    pub errs: Vec<Error>,
}

impl GenerateResult {
    /// Writes the generated content to its output path.
    pub fn commit(&self) -> std::io::Result<()> {
        if self.content.is_empty() {
            return Ok(());
        }
        std::fs::write(&self.output_path, &self.content)
    }
}

/// Parses the matched packages without generating anything.
///
/// Returns every named provider set and injector found, plus all
/// diagnostics. There are no side effects.
pub fn load(
    ctx: &Ctx,
    wd: &Path,
    _env: &[String],
    tags: &str,
    patterns: &[String],
) -> (Option<Info>, Vec<Error>) {
    let patterns = normalize_patterns(patterns);
    let loader = FsLoader::new(wd, tags);
    let start = Instant::now();
    let (pkgs, mut errs) = loader.load(ctx, &patterns);
    ctx.log_timing("load.packages", start);
    if pkgs.is_empty() {
        return (None, errs);
    }
    let oc = ObjectCache::new(ctx, &loader, &pkgs);
    let mut info = Info::default();
    for pkg in &pkgs {
        let (pkg_info, mut pkg_errs) = parse::package_info(&oc, pkg);
        errs.append(&mut pkg_errs);
        info.sets.extend(pkg_info.sets);
        info.injectors.extend(pkg_info.injectors);
    }
    info.injectors
        .sort_by(|a, b| (&a.pkg_path, &a.fn_name).cmp(&(&b.pkg_path, &b.fn_name)));
    (Some(info), errs)
}

/// Runs the full pipeline over the matched packages.
///
/// Load errors come back in the second return value; per-package resolution
/// and synthesis errors ride in each [`GenerateResult`]. One package's
/// failures never stop generation of the others.
pub fn generate(
    ctx: &Ctx,
    wd: &Path,
    env: &[String],
    patterns: &[String],
    opts: &GenerateOptions,
) -> (Vec<GenerateResult>, Vec<Error>) {
    let total = Instant::now();
    let patterns = normalize_patterns(patterns);
    let fs = ctx.fs.clone();
    let manifest_start = Instant::now();
    if let Some(results) = cache_manifest::read_manifest_results(fs.as_ref(), wd, env, &patterns, opts)
    {
        ctx.log_timing("generate.manifest_hit", manifest_start);
        ctx.log_timing("generate.total", total);
        return (results, Vec::new());
    }
    let loader = FsLoader::new(wd, &opts.tags);
    let load_start = Instant::now();
    let (pkgs, errs) = loader.load(ctx, &patterns);
    ctx.log_timing("load.packages", load_start);
    if !errs.is_empty() {
        return (Vec::new(), errs);
    }
    let mut results = Vec::with_capacity(pkgs.len());
    for pkg in &pkgs {
        if ctx.check_canceled().is_err() {
            return (results, vec![Error::Canceled]);
        }
        results.push(generate_for_package(ctx, &loader, pkg, opts));
    }
    if !results.is_empty() && results.iter().all(|r| r.errs.is_empty()) {
        cache_manifest::write_manifest(fs.as_ref(), wd, env, &patterns, opts, &pkgs);
    }
    ctx.log_timing("generate.total", total);
    (results, Vec::new())
}

/// Runs generation for a single loaded package.
fn generate_for_package(
    ctx: &Ctx,
    loader: &dyn PackageLoader,
    pkg: &Arc<Package>,
    opts: &GenerateOptions,
) -> GenerateResult {
    let pkg_start = Instant::now();
    let fs = ctx.fs.clone();
    let mut res = GenerateResult {
        pkg_path: pkg.pkg_path.clone(),
        output_path: pkg
            .dir
            .join(format!("{}{}", opts.prefix_output_file, OUTPUT_FILE_NAME)),
        content: Vec::new(),
        errs: Vec::new(),
    };
    let cache_key = match cache_key::cache_key_for_package(fs.as_ref(), pkg, opts) {
        Ok(key) => key,
        Err(e) => {
            res.errs.push(e);
            return res;
        }
    };
    if let Some(key) = &cache_key {
        let hit_start = Instant::now();
        if let Some(cached) = cache_store::read_cache(fs.as_ref(), key) {
            debug!(package = %pkg.pkg_path, "content cache hit");
            res.content = cached;
            ctx.log_timing(
                &format!("generate.package.{}.cache_hit", pkg.pkg_path),
                hit_start,
            );
            ctx.log_timing(&format!("generate.package.{}.total", pkg.pkg_path), pkg_start);
            return res;
        }
    }

    let oc = ObjectCache::new(ctx, loader, std::slice::from_ref(pkg));
    let parse_start = Instant::now();
    let (info, errs) = parse::package_info(&oc, pkg);
    if !errs.is_empty() {
        res.errs = errs;
        return res;
    }
    if info.injectors.is_empty() {
        debug!(package = %pkg.pkg_path, "no injectors");
        // Cache the empty outcome so a manifest covering this package can
        // still round-trip.
        if let Some(key) = &cache_key {
            cache_store::write_cache(fs.as_ref(), key, &[]);
        }
        return res;
    }

    let mut pairs = Vec::with_capacity(info.injectors.len());
    let mut solve_errs = Vec::new();
    for inj in &info.injectors {
        match solve::solve(inj) {
            Ok(solution) => pairs.push((inj, solution)),
            Err(mut e) => solve_errs.append(&mut e),
        }
    }
    ctx.log_timing(
        &format!("generate.package.{}.injectors", pkg.pkg_path),
        parse_start,
    );
    if !solve_errs.is_empty() {
        res.errs = solve_errs;
        return res;
    }

    let frame_start = Instant::now();
    let raw = codegen::emit_package(pkg, &pairs, &opts.tags);
    ctx.log_timing(&format!("generate.package.{}.frame", pkg.pkg_path), frame_start);

    let format_start = Instant::now();
    let code = match codegen::format_source(&raw) {
        Ok(formatted) => formatted,
        Err(e) => {
            // Likely a synthesis bug; report it but still hand back the raw
            // source so the user can inspect the output.
            res.errs.push(Error::Format(e.to_string()));
            raw
        }
    };
    ctx.log_timing(&format!("generate.package.{}.format", pkg.pkg_path), format_start);

    let mut content = Vec::new();
    content.extend_from_slice(GENERATED_MARKER.as_bytes());
    content.extend_from_slice(b"\n\n");
    if !opts.header.is_empty() {
        content.extend_from_slice(&opts.header);
        if !opts.header.ends_with(b"\n") {
            content.push(b'\n');
        }
        content.push(b'\n');
    }
    content.extend_from_slice(code.as_bytes());
    res.content = content;

    if res.errs.is_empty() {
        if let Some(key) = &cache_key {
            cache_store::write_cache(fs.as_ref(), key, &res.content);
        }
    }
    ctx.log_timing(&format!("generate.package.{}.total", pkg.pkg_path), pkg_start);
    res
}

/// The directory used for solder's cache.
#[must_use]
pub fn cache_dir() -> PathBuf {
    cache_store::dir(&RealFs::new())
}

/// Removes all cached data.
pub fn clear_cache() -> std::io::Result<()> {
    cache_store::clear(&RealFs::new())
}

fn normalize_patterns(patterns: &[String]) -> Vec<String> {
    if patterns.is_empty() {
        vec![".".to_string()]
    } else {
        patterns.to_vec()
    }
}
