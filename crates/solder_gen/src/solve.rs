// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The per-injector graph resolver.
//!
//! Walks the injector's declared output type through the flattened provider
//! map, selecting a producer for every required type, and emits a
//! topologically ordered call plan annotated with error and cleanup
//! obligations. Cycles use the classic in-progress mark; missing providers
//! report the full demand chain back to the injector root.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::{Error, Pos};
use crate::model::{
    FieldsGroup, Injector, InterfaceBinding, ProvidedItem, Provider, ValueExpr,
};
use crate::types::TypeKey;

/// Which output of a call a reference names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutForm {
    Value,
    Arc,
}

/// A reference to a produced local: either an injector argument or the
/// output of an earlier call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeRef {
    Given(usize),
    Call { index: usize, form: OutForm },
}

/// One resolved input of a call.
#[derive(Debug, Clone)]
pub struct CallArg {
    pub node: NodeRef,
    pub by_ref: bool,
}

/// One step of the ordered plan.
#[derive(Debug)]
pub enum Call {
    Fn {
        provider: Arc<Provider>,
        args: Vec<CallArg>,
    },
    Construct {
        provider: Arc<Provider>,
        args: Vec<CallArg>,
        want_value: bool,
        want_arc: bool,
    },
    Value(Arc<ValueExpr>),
    Widen {
        binding: Arc<InterfaceBinding>,
        from: CallArg,
    },
    Field {
        group: Arc<FieldsGroup>,
        index: usize,
        parent: NodeRef,
    },
}

impl Call {
    /// Whether this step registers a cleanup.
    #[must_use]
    pub fn has_cleanup(&self) -> bool {
        matches!(self, Call::Fn { provider, .. } if provider.has_cleanup)
    }

    /// Whether this step can fail.
    #[must_use]
    pub fn has_err(&self) -> bool {
        matches!(self, Call::Fn { provider, .. } if provider.has_err)
    }
}

/// The ordered plan for one injector: every call's inputs are produced by
/// earlier calls or by injector arguments.
#[derive(Debug)]
pub struct Solution {
    pub calls: Vec<Call>,
    pub root: NodeRef,
}

/// Solves the dependency graph of one injector.
///
/// All resolution errors are collected and returned together.
pub fn solve(inj: &Injector) -> Result<Solution, Vec<Error>> {
    let mut state = SolveState {
        inj,
        index: BTreeMap::new(),
        calls: Vec::new(),
        visiting: Vec::new(),
        errs: Vec::new(),
    };
    for (i, arg) in inj.sig.args.iter().enumerate() {
        if state.index.contains_key(&arg.ty) {
            state.errs.push(Error::InvalidSetDeclaration {
                pos: inj.pos.clone(),
                msg: format!(
                    "injector {} has two arguments of type {}",
                    inj.fn_name, arg.ty
                ),
            });
            continue;
        }
        state.index.insert(arg.ty.clone(), NodeRef::Given(i));
    }
    let mut chain = vec![format!("injector {}", inj.fn_name)];
    let root = state.resolve(&inj.sig.out, &inj.pos, &mut chain);
    if !state.errs.is_empty() {
        return Err(state.errs);
    }
    Ok(Solution {
        calls: state.calls,
        root: root.expect("root resolved without errors"),
    })
}

struct SolveState<'a> {
    inj: &'a Injector,
    index: BTreeMap<TypeKey, NodeRef>,
    calls: Vec<Call>,
    visiting: Vec<TypeKey>,
    errs: Vec<Error>,
}

impl SolveState<'_> {
    fn resolve(&mut self, ty: &TypeKey, demander: &Pos, chain: &mut Vec<String>) -> Option<NodeRef> {
        if let Some(node) = self.index.get(ty).copied() {
            self.mark_want(node);
            return Some(node);
        }
        if self.visiting.contains(ty) {
            let start = self.visiting.iter().position(|t| t == ty).expect("cycle member");
            let mut cycle: Vec<String> = self.visiting[start..]
                .iter()
                .map(ToString::to_string)
                .collect();
            cycle.push(ty.to_string());
            self.errs.push(Error::ProviderCycle {
                pos: demander.clone(),
                cycle: cycle.join(" -> "),
            });
            return None;
        }
        let Some(item) = self.inj.set.provider_map.get(ty).cloned() else {
            self.errs.push(Error::MissingProvider {
                ty: ty.to_string(),
                pos: demander.clone(),
                chain: chain.iter().rev().cloned().collect(),
            });
            return None;
        };
        self.visiting.push(ty.clone());
        let node = match item {
            ProvidedItem::Provider(provider) => self.resolve_provider(ty, &provider, chain),
            ProvidedItem::Value(value) => {
                self.calls.push(Call::Value(value.clone()));
                Some(self.register_output(&value.out, OutForm::Value))
            }
            ProvidedItem::Binding(binding) => self.resolve_binding(&binding, chain),
            ProvidedItem::Fields(group, index) => self.resolve_field(&group, index, chain),
        };
        self.visiting.pop();
        node.map(|n| self.demanded_form(n, ty))
    }

    fn resolve_provider(
        &mut self,
        _demanded: &TypeKey,
        provider: &Arc<Provider>,
        chain: &mut Vec<String>,
    ) -> Option<NodeRef> {
        self.check_obligations(provider);
        chain.push(format!(
            "{} (provider {})",
            provider.out, provider.name
        ));
        let mut args = Vec::with_capacity(provider.inputs.len());
        let mut failed = false;
        for input in &provider.inputs {
            match self.resolve(&input.ty, &provider.pos, chain) {
                Some(node) => args.push(CallArg {
                    node,
                    by_ref: input.by_ref,
                }),
                None => failed = true,
            }
        }
        chain.pop();
        if failed {
            return None;
        }
        if provider.is_struct {
            self.calls.push(Call::Construct {
                provider: provider.clone(),
                args,
                want_value: false,
                want_arc: false,
            });
        } else {
            self.calls.push(Call::Fn {
                provider: provider.clone(),
                args,
            });
        }
        let index = self.calls.len() - 1;
        let node = NodeRef::Call {
            index,
            form: OutForm::Value,
        };
        self.index.insert(provider.out.clone(), node);
        if let Some(arc_out) = &provider.arc_out {
            self.index.insert(
                arc_out.clone(),
                NodeRef::Call {
                    index,
                    form: OutForm::Arc,
                },
            );
        }
        Some(node)
    }

    fn resolve_binding(
        &mut self,
        binding: &Arc<InterfaceBinding>,
        chain: &mut Vec<String>,
    ) -> Option<NodeRef> {
        chain.push(format!("{} (binding)", binding.boxed));
        let from = self.resolve(&binding.concrete, &binding.pos, chain);
        chain.pop();
        let from = from?;
        self.calls.push(Call::Widen {
            binding: binding.clone(),
            from: CallArg {
                node: from,
                by_ref: false,
            },
        });
        Some(self.register_output(&binding.boxed, OutForm::Value))
    }

    fn resolve_field(
        &mut self,
        group: &Arc<FieldsGroup>,
        index: usize,
        chain: &mut Vec<String>,
    ) -> Option<NodeRef> {
        let field = &group.fields[index];
        chain.push(format!("{} (field {} of {})", field.ty, field.name, group.parent));
        let parent = self.resolve(&group.parent, &group.pos, chain);
        chain.pop();
        let parent = parent?;
        self.calls.push(Call::Field {
            group: group.clone(),
            index,
            parent,
        });
        Some(self.register_output(&field.ty, OutForm::Value))
    }

    fn register_output(&mut self, ty: &TypeKey, form: OutForm) -> NodeRef {
        let node = NodeRef::Call {
            index: self.calls.len() - 1,
            form,
        };
        self.index.insert(ty.clone(), node);
        node
    }

    /// Records cleanup/error obligations the injector signature must honor.
    fn check_obligations(&mut self, provider: &Arc<Provider>) {
        if provider.has_cleanup && !self.inj.sig.has_cleanup {
            self.errs.push(Error::CleanupRequired {
                pos: self.inj.pos.clone(),
                injector: self.inj.fn_name.clone(),
                provider: provider.name.clone(),
            });
        }
        if provider.has_err && self.inj.sig.err.is_none() {
            self.errs.push(Error::ErrorRequired {
                pos: self.inj.pos.clone(),
                injector: self.inj.fn_name.clone(),
                provider: provider.name.clone(),
            });
        }
    }

    /// Flags which construct outputs are actually consumed.
    fn mark_want(&mut self, node: NodeRef) {
        if let NodeRef::Call { index, form } = node {
            if let Call::Construct {
                want_value,
                want_arc,
                ..
            } = &mut self.calls[index]
            {
                match form {
                    OutForm::Value => *want_value = true,
                    OutForm::Arc => *want_arc = true,
                }
            }
        }
    }

    /// Maps a freshly created node to the form the demand asked for.
    fn demanded_form(&mut self, node: NodeRef, demanded: &TypeKey) -> NodeRef {
        let adjusted = match node {
            NodeRef::Call { index, .. } => {
                let form = match &self.calls[index] {
                    Call::Construct { provider, .. }
                        if provider.arc_out.as_ref() == Some(demanded) =>
                    {
                        OutForm::Arc
                    }
                    _ => match node {
                        NodeRef::Call { form, .. } => form,
                        NodeRef::Given(_) => OutForm::Value,
                    },
                };
                NodeRef::Call { index, form }
            }
            given => given,
        };
        self.mark_want(adjusted);
        adjusted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ctx::Ctx;
    use crate::loader::{FsLoader, PackageLoader};
    use crate::object_cache::ObjectCache;
    use crate::parse::package_info;
    use std::path::Path;
    use tempfile::TempDir;

    fn write(dir: &Path, name: &str, contents: &str) {
        let path = dir.join(name);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(path, contents).unwrap();
    }

    fn solve_single(tmp: &TempDir) -> Result<Solution, Vec<Error>> {
        let ctx = Ctx::new();
        let loader = FsLoader::new(tmp.path(), "");
        let root = loader.load_package(&ctx, ".").unwrap();
        let oc = ObjectCache::new(&ctx, &loader, &[root.clone()]);
        let (info, errs) = package_info(&oc, &root);
        assert!(errs.is_empty(), "{errs:?}");
        assert_eq!(info.injectors.len(), 1);
        solve(&info.injectors[0])
    }

    #[test]
    fn orders_calls_topologically() {
        let tmp = TempDir::new().unwrap();
        write(
            tmp.path(),
            "lib.rs",
            r#"
pub struct Db;
pub struct Cache;
pub struct App;
pub fn new_db() -> Db { Db }
pub fn new_cache(db: &Db) -> Cache { Cache }
pub fn new_app(db: Db, cache: Cache) -> App { App }
"#,
        );
        write(
            tmp.path(),
            "inject.rs",
            r#"#![cfg(solderinject)]
use solder::build;

pub fn init() -> App {
    build!(new_db, new_cache, new_app)
}
"#,
        );
        let solution = solve_single(&tmp).unwrap();
        let names: Vec<&str> = solution
            .calls
            .iter()
            .map(|c| match c {
                Call::Fn { provider, .. } => provider.name.as_str(),
                other => panic!("unexpected call {other:?}"),
            })
            .collect();
        assert_eq!(names, ["new_db", "new_cache", "new_app"]);
        let Call::Fn { args, .. } = &solution.calls[1] else {
            unreachable!()
        };
        assert!(args[0].by_ref);
    }

    #[test]
    fn missing_provider_reports_chain() {
        let tmp = TempDir::new().unwrap();
        write(
            tmp.path(),
            "lib.rs",
            r#"
pub struct Db;
pub struct App;
pub fn new_app(db: Db) -> App { App }
"#,
        );
        write(
            tmp.path(),
            "inject.rs",
            r#"#![cfg(solderinject)]
use solder::build;

pub fn init() -> App {
    build!(new_app)
}
"#,
        );
        let errs = solve_single(&tmp).unwrap_err();
        let Error::MissingProvider { ty, chain, .. } = &errs[0] else {
            panic!("expected missing provider, got {errs:?}");
        };
        assert_eq!(ty, "crate::Db");
        assert_eq!(
            chain,
            &vec![
                "crate::App (provider new_app)".to_string(),
                "injector init".to_string(),
            ]
        );
    }

    #[test]
    fn detects_provider_cycle() {
        let tmp = TempDir::new().unwrap();
        write(
            tmp.path(),
            "lib.rs",
            r#"
pub struct A;
pub struct B;
pub fn new_a(b: B) -> A { A }
pub fn new_b(a: A) -> B { B }
"#,
        );
        write(
            tmp.path(),
            "inject.rs",
            r#"#![cfg(solderinject)]
use solder::build;

pub fn init() -> A {
    build!(new_a, new_b)
}
"#,
        );
        let errs = solve_single(&tmp).unwrap_err();
        assert!(
            errs.iter().any(|e| matches!(
                e,
                Error::ProviderCycle { cycle, .. }
                    if cycle.contains("crate::A -> crate::B -> crate::A")
            )),
            "{errs:?}"
        );
    }

    #[test]
    fn injector_argument_wins_over_provider() {
        let tmp = TempDir::new().unwrap();
        write(
            tmp.path(),
            "lib.rs",
            r#"
pub struct Config;
pub struct App;
pub fn new_app(cfg: Config) -> App { App }
"#,
        );
        write(
            tmp.path(),
            "inject.rs",
            r#"#![cfg(solderinject)]
use solder::build;

pub fn init(cfg: Config) -> App {
    build!(new_app)
}
"#,
        );
        let solution = solve_single(&tmp).unwrap();
        let Call::Fn { args, .. } = &solution.calls[0] else {
            unreachable!()
        };
        assert_eq!(args[0].node, NodeRef::Given(0));
    }

    #[test]
    fn cleanup_and_error_obligations() {
        let tmp = TempDir::new().unwrap();
        write(
            tmp.path(),
            "lib.rs",
            r#"
pub struct Db;
pub struct DbError;
pub fn new_db() -> Result<(Db, solder::Cleanup), DbError> { todo!() }
"#,
        );
        write(
            tmp.path(),
            "inject.rs",
            r#"#![cfg(solderinject)]
use solder::build;

pub fn init() -> Db {
    build!(new_db)
}
"#,
        );
        let errs = solve_single(&tmp).unwrap_err();
        assert!(errs
            .iter()
            .any(|e| matches!(e, Error::CleanupRequired { provider, .. } if provider == "new_db")));
        assert!(errs
            .iter()
            .any(|e| matches!(e, Error::ErrorRequired { provider, .. } if provider == "new_db")));
    }

    #[test]
    fn binding_resolves_through_concrete_provider() {
        let tmp = TempDir::new().unwrap();
        write(
            tmp.path(),
            "lib.rs",
            r#"
pub trait Greeter { fn greet(&self) -> String; }
pub struct Nice;
impl Greeter for Nice { fn greet(&self) -> String { String::from("hi") } }
pub struct App;
pub fn new_nice() -> Nice { Nice }
pub fn new_app(g: Box<dyn Greeter>) -> App { App }
"#,
        );
        write(
            tmp.path(),
            "inject.rs",
            r#"#![cfg(solderinject)]
use solder::{bind, build};

pub fn init() -> App {
    build!(new_nice, new_app, bind!(dyn Greeter, Nice))
}
"#,
        );
        let solution = solve_single(&tmp).unwrap();
        assert!(matches!(solution.calls[0], Call::Fn { .. }));
        assert!(matches!(solution.calls[1], Call::Widen { .. }));
        assert!(matches!(solution.calls[2], Call::Fn { .. }));
    }
}
