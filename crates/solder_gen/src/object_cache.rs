// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Memoizes parsed provider sets across packages and fronts the package
//! loader so repeated requests coalesce.
//!
//! Named sets are parsed lazily on first request. A parse in progress is
//! tracked on a stack so that provider sets importing one another cyclically
//! are rejected with the full cycle named.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::ctx::Ctx;
use crate::error::{Error, Pos};
use crate::loader::{Package, PackageLoader};
use crate::model::ProviderSet;
use crate::parse::SetParser;

#[derive(Clone)]
enum SetState {
    Done(Arc<ProviderSet>),
    Failed(Vec<String>),
}

pub struct ObjectCache<'a> {
    ctx: &'a Ctx,
    loader: &'a dyn PackageLoader,
    packages: RefCell<BTreeMap<String, Arc<Package>>>,
    sets: RefCell<BTreeMap<(String, String), SetState>>,
    parsing: RefCell<Vec<(String, String)>>,
}

impl<'a> ObjectCache<'a> {
    pub fn new(ctx: &'a Ctx, loader: &'a dyn PackageLoader, roots: &[Arc<Package>]) -> Self {
        let oc = Self {
            ctx,
            loader,
            packages: RefCell::default(),
            sets: RefCell::default(),
            parsing: RefCell::default(),
        };
        for root in roots {
            oc.seed(root);
        }
        oc
    }

    fn seed(&self, pkg: &Arc<Package>) {
        let mut packages = self.packages.borrow_mut();
        let mut stack = vec![pkg.clone()];
        while let Some(p) = stack.pop() {
            if packages.contains_key(&p.pkg_path) {
                continue;
            }
            for imp in p.imports.values() {
                stack.push(imp.clone());
            }
            packages.insert(p.pkg_path.clone(), p);
        }
    }

    /// Returns the package for `pkg_path`, loading it on first use.
    pub fn package(&self, pkg_path: &str) -> Result<Arc<Package>, Vec<Error>> {
        if let Some(pkg) = self.packages.borrow().get(pkg_path) {
            return Ok(pkg.clone());
        }
        let pkg = self.loader.load_package(self.ctx, pkg_path)?;
        self.seed(&pkg);
        Ok(pkg)
    }

    /// Returns the named provider set, parsing it lazily the first time.
    pub fn named_set(
        &self,
        pkg_path: &str,
        name: &str,
    ) -> Result<Arc<ProviderSet>, Vec<Error>> {
        let key = (pkg_path.to_string(), name.to_string());
        if let Some(state) = self.sets.borrow().get(&key) {
            return match state {
                SetState::Done(set) => Ok(set.clone()),
                SetState::Failed(msgs) => {
                    Err(msgs.iter().map(|m| Error::Loader(m.clone())).collect())
                }
            };
        }
        if self.parsing.borrow().contains(&key) {
            let mut chain: Vec<String> = self
                .parsing
                .borrow()
                .iter()
                .map(|(p, n)| format!("{p}::{n}"))
                .collect();
            chain.push(format!("{pkg_path}::{name}"));
            return Err(vec![Error::ImportCycle {
                cycle: chain.join(" -> "),
            }]);
        }
        self.parsing.borrow_mut().push(key.clone());
        let result = self.parse_named_set(pkg_path, name);
        self.parsing.borrow_mut().pop();
        match result {
            Ok(set) => {
                self.sets
                    .borrow_mut()
                    .insert(key, SetState::Done(set.clone()));
                Ok(set)
            }
            Err(errs) => {
                self.sets.borrow_mut().insert(
                    key,
                    SetState::Failed(errs.iter().map(ToString::to_string).collect()),
                );
                Err(errs)
            }
        }
    }

    fn parse_named_set(
        &self,
        pkg_path: &str,
        name: &str,
    ) -> Result<Arc<ProviderSet>, Vec<Error>> {
        let pkg = self.package(pkg_path)?;
        let Some(decl) = pkg.index.statics.get(name) else {
            return Err(vec![Error::Loader(format!(
                "no provider set {name} in package {pkg_path}"
            ))]);
        };
        if !decl.ty.is_provider_set() {
            return Err(vec![Error::InvalidSetDeclaration {
                pos: decl.pos.clone(),
                msg: format!("{name} is not a solder::ProviderSet"),
            }]);
        }
        let (tokens, pos) = new_set_tokens(&pkg, decl.file, &decl.expr, &decl.pos)?;
        let parser = SetParser::new(self, &pkg, decl.file);
        let set = parser.parse_items(tokens, name, pos)?;
        Ok(Arc::new(set))
    }

    /// Whether `canon` names a trait declared in any loaded package.
    pub fn is_trait(&self, canon: &str) -> bool {
        self.packages
            .borrow()
            .values()
            .any(|p| p.index.traits.contains(canon))
    }

    /// Whether an `impl <iface> for <concrete>` exists in any loaded package.
    pub fn has_impl(&self, iface: &str, concrete: &str) -> bool {
        let key = (iface.to_string(), concrete.to_string());
        self.packages
            .borrow()
            .values()
            .any(|p| p.index.impls.contains(&key))
    }
}

/// Extracts the token list of a `new_set!` initializer expression.
fn new_set_tokens(
    pkg: &Arc<Package>,
    file: usize,
    expr: &syn::Expr,
    decl_pos: &Pos,
) -> Result<(proc_macro2::TokenStream, Pos), Vec<Error>> {
    if let syn::Expr::Macro(m) = expr {
        let canon = pkg.cx(file).path_string(&m.mac.path);
        if canon == "solder::new_set" {
            let pos = Pos::new(&pkg.files[file].path, m.mac.path.segments[0].ident.span());
            return Ok((m.mac.tokens.clone(), pos));
        }
    }
    Err(vec![Error::InvalidSetDeclaration {
        pos: decl_pos.clone(),
        msg: "provider set statics must be initialized with solder::new_set!".to_string(),
    }])
}
