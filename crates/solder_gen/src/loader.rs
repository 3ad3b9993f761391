// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Loading packages from disk.
//!
//! A package is a directory of `.rs` files, all files forming one package.
//! The loader parses each file with `syn`, builds a per-package symbol index
//! (the "resolved types" the rest of the core works against), discovers
//! `use crate::…` imports, loads the transitive closure, and rejects cyclic
//! package imports.
//!
//! Files of the target packages are parsed fully; files of transitive
//! dependencies have function bodies stripped after parsing, since only
//! their signatures matter downstream.

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use petgraph::algo::tarjan_scc;
use petgraph::graph::DiGraph;
use tracing::debug;

use crate::ctx::Ctx;
use crate::error::{Error, Pos, Result};
use crate::types::{pkg_mod_path, TypeCx, TypeKey};

/// The build tag that gates injector stub files.
pub const INJECT_CFG: &str = "solderinject";

/// One parsed source file of a package.
#[derive(Debug)]
pub struct SourceFile {
    pub path: PathBuf,
    pub ast: syn::File,
    /// `use` imports: bound name to full path.
    pub uses: BTreeMap<String, String>,
    /// Whether the file carries the stub build tag.
    pub is_stub: bool,
}

/// A struct field as seen by `construct!`.
#[derive(Debug, Clone)]
pub struct StructField {
    pub name: String,
    pub ty: TypeKey,
    /// Marked `#[solder(skip)]`; never filled by a struct provider.
    pub skip: bool,
}

#[derive(Debug)]
pub struct StructDef {
    pub pos: Pos,
    /// Named fields in declaration order; empty for tuple and unit structs.
    pub fields: Vec<StructField>,
    pub has_named_fields: bool,
}

#[derive(Debug)]
pub struct FnDecl {
    pub pos: Pos,
    pub file: usize,
    pub sig: syn::Signature,
}

#[derive(Debug)]
pub struct StaticDecl {
    pub pos: Pos,
    pub file: usize,
    pub ty: TypeKey,
    pub expr: syn::Expr,
}

/// The symbol index of one package.
#[derive(Default, Debug)]
pub struct SymbolIndex {
    /// Names of all top-level items, used for canonical type rendering.
    pub names: BTreeSet<String>,
    pub structs: BTreeMap<String, StructDef>,
    /// Canonical paths of traits declared in this package.
    pub traits: BTreeSet<String>,
    /// `(canonical trait path, canonical self type)` pairs.
    pub impls: BTreeSet<(String, String)>,
    pub fns: BTreeMap<String, FnDecl>,
    pub statics: BTreeMap<String, StaticDecl>,
}

/// A loaded package with its transitive imports.
#[derive(Debug)]
pub struct Package {
    pub pkg_path: String,
    pub dir: PathBuf,
    pub files: Vec<SourceFile>,
    pub imports: BTreeMap<String, Arc<Package>>,
    pub index: SymbolIndex,
}

impl Package {
    /// Name-resolution context for one of this package's files.
    #[must_use]
    pub fn cx(&self, file: usize) -> TypeCx<'_> {
        TypeCx {
            pkg_path: &self.pkg_path,
            uses: &self.files[file].uses,
            locals: &self.index.names,
        }
    }

    /// Paths of this package's direct files.
    #[must_use]
    pub fn file_paths(&self) -> Vec<String> {
        self.files
            .iter()
            .map(|f| f.path.to_string_lossy().into_owned())
            .collect()
    }
}

/// The package-loader collaborator interface.
pub trait PackageLoader {
    /// Loads the packages matched by the patterns, in pattern order.
    fn load(&self, ctx: &Ctx, patterns: &[String]) -> (Vec<Arc<Package>>, Vec<Error>);

    /// Loads a single package by path, reusing prior work.
    fn load_package(&self, ctx: &Ctx, pkg_path: &str)
        -> std::result::Result<Arc<Package>, Vec<Error>>;
}

struct RawPackage {
    pkg_path: String,
    dir: PathBuf,
    files: Vec<SourceFile>,
    deps: BTreeSet<String>,
    full: bool,
}

#[derive(Default)]
struct LoaderState {
    raw: BTreeMap<String, RawPackage>,
    linked: BTreeMap<String, Arc<Package>>,
}

/// The default file-system loader.
pub struct FsLoader {
    wd: PathBuf,
    tags: Vec<String>,
    state: RefCell<LoaderState>,
}

impl FsLoader {
    /// Creates a loader rooted at the working directory. `tags` widens the
    /// stub build tag, comma separated, mirroring the generator option.
    #[must_use]
    pub fn new(wd: impl Into<PathBuf>, tags: &str) -> Self {
        let mut all = vec![INJECT_CFG.to_string()];
        all.extend(
            tags.split(',')
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .map(str::to_string),
        );
        Self {
            wd: wd.into(),
            tags: all,
            state: RefCell::new(LoaderState::default()),
        }
    }

    fn pkg_dir(&self, pkg_path: &str) -> PathBuf {
        if pkg_path == "." {
            self.wd.clone()
        } else {
            self.wd.join(pkg_path)
        }
    }

    /// Expands a pattern into package paths. A trailing `/...` walks the
    /// subtree for directories containing source files.
    fn expand_pattern(&self, pattern: &str) -> Result<Vec<String>> {
        let cleaned = pattern.strip_prefix("./").unwrap_or(pattern);
        if let Some(base) = cleaned.strip_suffix("...") {
            let base = base.strip_suffix('/').unwrap_or(base);
            let base = if base.is_empty() { "." } else { base };
            let mut found = Vec::new();
            self.walk_packages(&self.pkg_dir(base), base, &mut found)?;
            return Ok(found);
        }
        Ok(vec![if cleaned.is_empty() { "." } else { cleaned }.to_string()])
    }

    fn walk_packages(&self, dir: &Path, pkg_path: &str, out: &mut Vec<String>) -> Result<()> {
        let entries = std::fs::read_dir(dir).map_err(|e| Error::Io {
            path: dir.to_path_buf(),
            source: e,
        })?;
        let mut subdirs = Vec::new();
        let mut has_source = false;
        for entry in entries {
            let entry = entry.map_err(|e| Error::Io {
                path: dir.to_path_buf(),
                source: e,
            })?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') {
                continue;
            }
            let path = entry.path();
            if path.is_dir() {
                subdirs.push(name);
            } else if name.ends_with(".rs") {
                has_source = true;
            }
        }
        if has_source {
            out.push(pkg_path.to_string());
        }
        subdirs.sort();
        for name in subdirs {
            let child = if pkg_path == "." {
                name.clone()
            } else {
                format!("{pkg_path}/{name}")
            };
            self.walk_packages(&dir.join(&name), &child, out)?;
        }
        Ok(())
    }

    fn ensure_raw(&self, pkg_path: &str, full: bool) -> std::result::Result<(), Vec<Error>> {
        let needs_parse = {
            let state = self.state.borrow();
            // Already-linked packages keep stub files fully parsed either
            // way, so they never need a re-parse.
            if state.linked.contains_key(pkg_path) {
                false
            } else {
                match state.raw.get(pkg_path) {
                    Some(raw) => full && !raw.full,
                    None => true,
                }
            }
        };
        if !needs_parse {
            return Ok(());
        }
        let raw = self.parse_dir(pkg_path, full)?;
        let deps: Vec<String> = raw.deps.iter().cloned().collect();
        self.state.borrow_mut().raw.insert(pkg_path.to_string(), raw);
        for dep in deps {
            self.ensure_raw(&dep, false)?;
        }
        Ok(())
    }

    fn parse_dir(&self, pkg_path: &str, full: bool) -> std::result::Result<RawPackage, Vec<Error>> {
        let dir = self.pkg_dir(pkg_path);
        debug!(package = pkg_path, full, "parsing package");
        let entries = std::fs::read_dir(&dir).map_err(|e| {
            vec![Error::Loader(format!(
                "package {pkg_path}: {}: {e}",
                dir.display()
            ))]
        })?;
        let mut names: Vec<String> = Vec::new();
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.ends_with(".rs") && entry.path().is_file() {
                names.push(name);
            }
        }
        names.sort();

        let mut errs = Vec::new();
        let mut files = Vec::new();
        let mut deps = BTreeSet::new();
        for name in names {
            let path = dir.join(&name);
            let src = match std::fs::read_to_string(&path) {
                Ok(src) => src,
                Err(e) => {
                    errs.push(Error::Io { path, source: e });
                    continue;
                }
            };
            let mut ast = match syn::parse_file(&src) {
                Ok(ast) => ast,
                Err(e) => {
                    errs.push(Error::Loader(format!("{}: {e}", path.display())));
                    continue;
                }
            };
            match self.classify_file(&ast) {
                FileKind::Generated => continue,
                FileKind::Stub => {
                    let uses = collect_file_uses(&ast);
                    self.collect_deps(pkg_path, &uses, &mut deps);
                    files.push(SourceFile {
                        path,
                        ast,
                        uses,
                        is_stub: true,
                    });
                }
                FileKind::Plain => {
                    if !full {
                        strip_fn_bodies(&mut ast);
                    }
                    let uses = collect_file_uses(&ast);
                    self.collect_deps(pkg_path, &uses, &mut deps);
                    files.push(SourceFile {
                        path,
                        ast,
                        uses,
                        is_stub: false,
                    });
                }
            }
        }
        if !errs.is_empty() {
            return Err(errs);
        }
        if files.is_empty() {
            return Err(vec![Error::Loader(format!(
                "package {pkg_path}: no source files in {}",
                dir.display()
            ))]);
        }
        Ok(RawPackage {
            pkg_path: pkg_path.to_string(),
            dir,
            files,
            deps,
            full,
        })
    }

    fn classify_file(&self, ast: &syn::File) -> FileKind {
        for attr in &ast.attrs {
            if !matches!(attr.style, syn::AttrStyle::Inner(_)) || !attr.path().is_ident("cfg") {
                continue;
            }
            let Ok(list) = attr.meta.require_list() else {
                continue;
            };
            let text = crate::types::compact_tokens(list.tokens.clone());
            let mentions_tag = self.tags.iter().any(|t| text.contains(t.as_str()));
            if !mentions_tag {
                continue;
            }
            if text.starts_with("not(") {
                return FileKind::Generated;
            }
            return FileKind::Stub;
        }
        FileKind::Plain
    }

    /// Records package dependencies discovered through `use crate::…` paths.
    fn collect_deps(&self, pkg_path: &str, uses: &BTreeMap<String, String>, deps: &mut BTreeSet<String>) {
        for full in uses.values() {
            let Some(rest) = full.strip_prefix("crate::") else {
                continue;
            };
            // `use crate::a::b;` binds the package itself; `use
            // crate::a::b::Item;` binds an item of it. Prefer the longest
            // prefix that names an existing directory.
            let segments: Vec<&str> = rest.split("::").collect();
            let mut candidate = None;
            for end in (1..=segments.len()).rev() {
                let dir_path = segments[..end].join("/");
                if self.pkg_dir(&dir_path).is_dir() {
                    candidate = Some(dir_path);
                    break;
                }
            }
            let dep = candidate.unwrap_or_else(|| ".".to_string());
            if dep != pkg_path {
                deps.insert(dep);
            }
        }
    }

    /// Verifies the raw package graph is acyclic and links it bottom-up.
    fn link_all(&self) -> std::result::Result<(), Vec<Error>> {
        let order = {
            let state = self.state.borrow();
            let mut graph = DiGraph::<String, ()>::new();
            let mut nodes = BTreeMap::new();
            for path in state.raw.keys() {
                let idx = graph.add_node(path.clone());
                nodes.insert(path.clone(), idx);
            }
            for (path, raw) in &state.raw {
                for dep in &raw.deps {
                    if let Some(&to) = nodes.get(dep) {
                        graph.add_edge(nodes[path], to, ());
                    }
                }
            }
            let sccs = tarjan_scc(&graph);
            for scc in &sccs {
                if scc.len() > 1 {
                    let mut names: Vec<String> =
                        scc.iter().map(|&idx| graph[idx].clone()).collect();
                    names.sort();
                    let first = names[0].clone();
                    return Err(vec![Error::Loader(format!(
                        "package import cycle: {} -> {first}",
                        names.join(" -> ")
                    ))]);
                }
            }
            // Tarjan yields strongly connected components in reverse
            // topological order, so dependencies link before dependents.
            sccs.into_iter()
                .map(|scc| graph[scc[0]].clone())
                .collect::<Vec<String>>()
        };
        for path in order {
            let already = self.state.borrow().linked.contains_key(&path);
            if already {
                continue;
            }
            let mut state = self.state.borrow_mut();
            let raw = state.raw.remove(&path).expect("raw package disappeared");
            let mut imports = BTreeMap::new();
            for dep in &raw.deps {
                if let Some(p) = state.linked.get(dep) {
                    imports.insert(dep.clone(), p.clone());
                }
            }
            let pkg = Arc::new(finish_package(raw, imports));
            state.linked.insert(path, pkg);
        }
        Ok(())
    }
}

enum FileKind {
    Plain,
    Stub,
    Generated,
}

impl PackageLoader for FsLoader {
    fn load(&self, ctx: &Ctx, patterns: &[String]) -> (Vec<Arc<Package>>, Vec<Error>) {
        let mut errs = Vec::new();
        let mut roots: Vec<String> = Vec::new();
        for pattern in patterns {
            match self.expand_pattern(pattern) {
                Ok(paths) => {
                    for p in paths {
                        if !roots.contains(&p) {
                            roots.push(p);
                        }
                    }
                }
                Err(e) => errs.push(e),
            }
        }
        let mut pkgs = Vec::new();
        for root in &roots {
            if let Err(e) = ctx.check_canceled() {
                errs.push(e);
                return (pkgs, errs);
            }
            match self.load_package(ctx, root) {
                Ok(pkg) => pkgs.push(pkg),
                Err(mut e) => errs.append(&mut e),
            }
        }
        (pkgs, errs)
    }

    fn load_package(
        &self,
        _ctx: &Ctx,
        pkg_path: &str,
    ) -> std::result::Result<Arc<Package>, Vec<Error>> {
        let cleaned = pkg_path.strip_prefix("./").unwrap_or(pkg_path);
        let cleaned = if cleaned.is_empty() { "." } else { cleaned };
        if let Some(pkg) = self.state.borrow().linked.get(cleaned) {
            return Ok(pkg.clone());
        }
        self.ensure_raw(cleaned, true)?;
        self.link_all()?;
        self.state
            .borrow()
            .linked
            .get(cleaned)
            .cloned()
            .ok_or_else(|| vec![Error::Loader(format!("package {cleaned} failed to load"))])
    }
}

fn strip_fn_bodies(ast: &mut syn::File) {
    for item in &mut ast.items {
        if let syn::Item::Fn(f) = item {
            f.block.stmts.clear();
        }
    }
}

fn collect_file_uses(ast: &syn::File) -> BTreeMap<String, String> {
    let mut uses = BTreeMap::new();
    for item in &ast.items {
        if let syn::Item::Use(u) = item {
            collect_use_tree(&u.tree, String::new(), &mut uses);
        }
    }
    uses
}

fn collect_use_tree(tree: &syn::UseTree, prefix: String, out: &mut BTreeMap<String, String>) {
    let join = |prefix: &str, ident: &syn::Ident| {
        if prefix.is_empty() {
            ident.to_string()
        } else {
            format!("{prefix}::{ident}")
        }
    };
    match tree {
        syn::UseTree::Path(p) => collect_use_tree(&p.tree, join(&prefix, &p.ident), out),
        syn::UseTree::Name(n) => {
            out.insert(n.ident.to_string(), join(&prefix, &n.ident));
        }
        syn::UseTree::Rename(r) => {
            out.insert(r.rename.to_string(), join(&prefix, &r.ident));
        }
        syn::UseTree::Group(g) => {
            for tree in &g.items {
                collect_use_tree(tree, prefix.clone(), out);
            }
        }
        syn::UseTree::Glob(_) => {}
    }
}

fn finish_package(raw: RawPackage, imports: BTreeMap<String, Arc<Package>>) -> Package {
    let mut index = SymbolIndex::default();
    for file in &raw.files {
        for item in &file.ast.items {
            let name = match item {
                syn::Item::Struct(s) => Some(s.ident.to_string()),
                syn::Item::Enum(e) => Some(e.ident.to_string()),
                syn::Item::Trait(t) => Some(t.ident.to_string()),
                syn::Item::Fn(f) => Some(f.sig.ident.to_string()),
                syn::Item::Static(s) => Some(s.ident.to_string()),
                syn::Item::Const(c) => Some(c.ident.to_string()),
                syn::Item::Type(t) => Some(t.ident.to_string()),
                _ => None,
            };
            if let Some(name) = name {
                index.names.insert(name);
            }
        }
    }
    for (file_idx, file) in raw.files.iter().enumerate() {
        let cx = TypeCx {
            pkg_path: &raw.pkg_path,
            uses: &file.uses,
            locals: &index.names,
        };
        for item in &file.ast.items {
            match item {
                syn::Item::Struct(s) => {
                    let pos = Pos::new(&file.path, s.ident.span());
                    let mut fields = Vec::new();
                    let has_named_fields = matches!(s.fields, syn::Fields::Named(_));
                    if let syn::Fields::Named(named) = &s.fields {
                        for field in &named.named {
                            let name = field
                                .ident
                                .as_ref()
                                .expect("named field without identifier")
                                .to_string();
                            fields.push(StructField {
                                name,
                                ty: cx.type_key(&field.ty),
                                skip: field_skipped(&field.attrs),
                            });
                        }
                    }
                    index.structs.insert(
                        s.ident.to_string(),
                        StructDef {
                            pos,
                            fields,
                            has_named_fields,
                        },
                    );
                }
                syn::Item::Trait(t) => {
                    index
                        .traits
                        .insert(format!("{}::{}", pkg_mod_path(&raw.pkg_path), t.ident));
                }
                syn::Item::Impl(imp) => {
                    if let Some((_, trait_path, _)) = &imp.trait_ {
                        index
                            .impls
                            .insert((cx.path_string(trait_path), cx.type_key(&imp.self_ty).as_str().to_string()));
                    }
                }
                syn::Item::Fn(f) => {
                    index.fns.insert(
                        f.sig.ident.to_string(),
                        FnDecl {
                            pos: Pos::new(&file.path, f.sig.ident.span()),
                            file: file_idx,
                            sig: f.sig.clone(),
                        },
                    );
                }
                syn::Item::Static(s) => {
                    index.statics.insert(
                        s.ident.to_string(),
                        StaticDecl {
                            pos: Pos::new(&file.path, s.ident.span()),
                            file: file_idx,
                            ty: cx.type_key(&s.ty),
                            expr: (*s.expr).clone(),
                        },
                    );
                }
                _ => {}
            }
        }
    }
    Package {
        pkg_path: raw.pkg_path,
        dir: raw.dir,
        files: raw.files,
        imports,
        index,
    }
}

fn field_skipped(attrs: &[syn::Attribute]) -> bool {
    for attr in attrs {
        if attr.path().is_ident("solder") {
            if let Ok(list) = attr.meta.require_list() {
                if crate::types::compact_tokens(list.tokens.clone()) == "skip" {
                    return true;
                }
            }
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write(dir: &Path, name: &str, contents: &str) {
        let path = dir.join(name);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(path, contents).unwrap();
    }

    #[test]
    fn loads_transitive_imports_and_index() {
        let tmp = TempDir::new().unwrap();
        write(
            tmp.path(),
            "db/lib.rs",
            "pub struct Pool { pub size: u32 }\npub fn new_pool() -> Pool { Pool { size: 4 } }\n",
        );
        write(
            tmp.path(),
            "app/lib.rs",
            "use crate::db::Pool;\npub struct App { pub pool: Pool }\n",
        );
        let loader = FsLoader::new(tmp.path(), "");
        let ctx = Ctx::new();
        let pkg = loader.load_package(&ctx, "app").unwrap();
        assert_eq!(pkg.pkg_path, "app");
        assert!(pkg.imports.contains_key("db"));
        let app = &pkg.index.structs["App"];
        assert_eq!(app.fields[0].ty.as_str(), "crate::db::Pool");
        let db = &pkg.imports["db"];
        assert!(db.index.fns.contains_key("new_pool"));
    }

    #[test]
    fn detects_package_import_cycle() {
        let tmp = TempDir::new().unwrap();
        write(tmp.path(), "a/lib.rs", "use crate::b::B;\npub struct A { pub b: B }\n");
        write(tmp.path(), "b/lib.rs", "use crate::a::A;\npub struct B { pub a: A }\n");
        let loader = FsLoader::new(tmp.path(), "");
        let errs = loader.load_package(&Ctx::new(), "a").unwrap_err();
        assert!(errs[0].to_string().contains("package import cycle"));
    }

    #[test]
    fn stub_and_generated_file_classification() {
        let tmp = TempDir::new().unwrap();
        write(tmp.path(), "lib.rs", "pub struct App;\n");
        write(
            tmp.path(),
            "inject.rs",
            "#![cfg(solderinject)]\nfn stub() {}\n",
        );
        write(
            tmp.path(),
            "solder_gen.rs",
            "#![cfg(not(any(solderinject)))]\nfn generated() {}\n",
        );
        let loader = FsLoader::new(tmp.path(), "");
        let pkg = loader.load_package(&Ctx::new(), ".").unwrap();
        let names: Vec<(String, bool)> = pkg
            .files
            .iter()
            .map(|f| {
                (
                    f.path.file_name().unwrap().to_string_lossy().into_owned(),
                    f.is_stub,
                )
            })
            .collect();
        assert_eq!(
            names,
            vec![("inject.rs".to_string(), true), ("lib.rs".to_string(), false)]
        );
    }

    #[test]
    fn dependency_fn_bodies_are_stripped() {
        let tmp = TempDir::new().unwrap();
        write(
            tmp.path(),
            "dep/lib.rs",
            "pub fn helper() -> u32 { let x = 1; x + 1 }\n",
        );
        write(tmp.path(), "lib.rs", "use crate::dep::helper;\npub fn top() -> u32 { helper() }\n");
        let loader = FsLoader::new(tmp.path(), "");
        let pkg = loader.load_package(&Ctx::new(), ".").unwrap();
        let dep = &pkg.imports["dep"];
        let syn::Item::Fn(f) = &dep.files[0].ast.items[0] else {
            panic!("expected fn item");
        };
        assert!(f.block.stmts.is_empty());
        // The root package keeps bodies.
        let root_fn = pkg
            .files
            .iter()
            .flat_map(|f| &f.ast.items)
            .find_map(|item| match item {
                syn::Item::Fn(f) if f.sig.ident == "top" => Some(f),
                _ => None,
            })
            .unwrap();
        assert!(!root_fn.block.stmts.is_empty());
    }

    #[test]
    fn pattern_walks_subtree() {
        let tmp = TempDir::new().unwrap();
        write(tmp.path(), "a/lib.rs", "pub struct A;\n");
        write(tmp.path(), "a/inner/lib.rs", "pub struct Inner;\n");
        write(tmp.path(), "b/lib.rs", "pub struct B;\n");
        let loader = FsLoader::new(tmp.path(), "");
        let (pkgs, errs) = loader.load(&Ctx::new(), &["...".to_string()]);
        assert!(errs.is_empty(), "{errs:?}");
        let paths: Vec<&str> = pkgs.iter().map(|p| p.pkg_path.as_str()).collect();
        assert_eq!(paths, ["a", "a/inner", "b"]);
    }
}
