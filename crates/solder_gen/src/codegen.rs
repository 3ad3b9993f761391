// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The code synthesizer.
//!
//! Consumes the resolver's call plans and the package's syntax and emits the
//! generated source: one function per injector with the ordered provider
//! calls and error/cleanup plumbing, a verbatim copy of the non-injector
//! declarations from the stub files, and synthesized `use` items for every
//! symbol the generated bodies reference.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write as _;

use quote::ToTokens;
use syn::visit_mut::VisitMut;

use crate::loader::{Package, INJECT_CFG};
use crate::model::Injector;
use crate::solve::{Call, CallArg, NodeRef, OutForm, Solution};
use crate::types::{compact_tokens, pkg_mod_path, TypeKey};

/// The machine-readable first line of every generated file.
pub const GENERATED_MARKER: &str = "// Code generated by solder. DO NOT EDIT.";

/// Name of the generated file, prefixed by the caller-chosen prefix.
pub const OUTPUT_FILE_NAME: &str = "solder_gen.rs";

/// Emits the body of the generated file (everything below the marker and
/// user header) for one package.
pub fn emit_package(pkg: &Package, injectors: &[(&Injector, Solution)], tags: &str) -> String {
    let mut imports = Imports::new(pkg);

    // Stub files that declared at least one injector contribute their
    // non-injector declarations; the stub file is invisible to production
    // builds, so anything declared alongside the stubs must be carried over.
    let mut stub_files: BTreeSet<usize> = BTreeSet::new();
    let mut injector_names: BTreeSet<String> = BTreeSet::new();
    for (inj, _) in injectors {
        stub_files.insert(inj.file_idx);
        injector_names.insert(inj.fn_name.clone());
    }
    let mut copied: Vec<&syn::Item> = Vec::new();
    for &file_idx in &stub_files {
        for item in &pkg.files[file_idx].ast.items {
            match item {
                syn::Item::Use(_) => {}
                syn::Item::Fn(f) if injector_names.contains(&f.sig.ident.to_string()) => {}
                other => copied.push(other),
            }
        }
    }

    // Keep the stub files' imports that copied declarations or injector
    // signatures still reference; generated bodies add their own below.
    let mut referenced: BTreeSet<String> = BTreeSet::new();
    for item in &copied {
        collect_idents(item.to_token_stream(), &mut referenced);
    }
    for (inj, _) in injectors {
        collect_idents(inj.syn_sig.to_token_stream(), &mut referenced);
    }
    for &file_idx in &stub_files {
        for (name, full) in &pkg.files[file_idx].uses {
            if referenced.contains(name) {
                imports.keep(name, full);
            }
        }
    }

    let mut fns = String::new();
    for (inj, solution) in injectors {
        let text = emit_injector(inj, solution, &mut imports);
        fns.push_str(&text);
        fns.push('\n');
    }

    let mut out = String::new();
    let mut cfg_tags = vec![INJECT_CFG.to_string()];
    cfg_tags.extend(
        tags.split(',')
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_string),
    );
    let _ = writeln!(out, "#![cfg(not(any({})))]", cfg_tags.join(", "));
    out.push('\n');
    for (name, full) in imports.bound() {
        if full == name {
            continue;
        }
        let last = full.rsplit("::").next().unwrap_or(full);
        if last == name {
            let _ = writeln!(out, "use {full};");
        } else {
            let _ = writeln!(out, "use {full} as {name};");
        }
    }
    out.push('\n');
    out.push_str(&fns);
    for item in copied {
        out.push_str(&compact_tokens(item.to_token_stream()));
        out.push('\n');
    }
    out
}

/// Formats raw generated source by re-parsing and pretty-printing it.
pub fn format_source(raw: &str) -> Result<String, syn::Error> {
    let file = syn::parse_file(raw)?;
    Ok(prettyplease::unparse(&file))
}

/// Tracks `use` lines for the generated file and shortens paths through
/// them. A short name already bound to a different path falls back to the
/// full path inline.
struct Imports {
    own_mod: String,
    bound: BTreeMap<String, String>,
}

impl Imports {
    fn new(pkg: &Package) -> Self {
        Self {
            own_mod: pkg_mod_path(&pkg.pkg_path),
            bound: BTreeMap::new(),
        }
    }

    fn keep(&mut self, name: &str, full: &str) {
        self.bound
            .entry(name.to_string())
            .or_insert_with(|| full.to_string());
    }

    fn bound(&self) -> &BTreeMap<String, String> {
        &self.bound
    }

    /// Returns the emitted spelling of a fully-qualified path, binding a
    /// `use` line when needed.
    fn name_for(&mut self, full: &str) -> String {
        if let Some(rest) = full.strip_prefix(&format!("{}::", self.own_mod)) {
            if !rest.contains("::") {
                return rest.to_string();
            }
        }
        let short = full.rsplit("::").next().unwrap_or(full).to_string();
        if short == full {
            return short;
        }
        match self.bound.get(&short) {
            Some(bound) if bound == full => short,
            Some(_) => full.to_string(),
            None => {
                self.bound.insert(short.clone(), full.to_string());
                short
            }
        }
    }

    /// Renders a canonical type with paths shortened through the imports.
    fn type_text(&mut self, key: &TypeKey) -> String {
        let Ok(mut ty) = syn::parse_str::<syn::Type>(key.as_str()) else {
            return key.as_str().to_string();
        };
        Shortener { imports: self }.visit_type_mut(&mut ty);
        compact_tokens(ty.to_token_stream())
    }

    /// Renders an expression with canonical `crate::` paths shortened.
    fn expr_text(&mut self, expr: &syn::Expr) -> String {
        let mut expr = expr.clone();
        Shortener { imports: self }.visit_expr_mut(&mut expr);
        compact_tokens(expr.to_token_stream())
    }
}

struct Shortener<'a> {
    imports: &'a mut Imports,
}

impl VisitMut for Shortener<'_> {
    fn visit_path_mut(&mut self, path: &mut syn::Path) {
        syn::visit_mut::visit_path_mut(self, path);
        if path.leading_colon.is_some() {
            return;
        }
        let first = match path.segments.first() {
            Some(seg) => seg.ident.to_string(),
            None => return,
        };
        if first != "crate" && first != "std" {
            return;
        }
        // Only plain paths are rewritten; generic arguments were already
        // visited above and non-empty ones keep the path as-is.
        if path
            .segments
            .iter()
            .any(|s| !matches!(s.arguments, syn::PathArguments::None))
        {
            return;
        }
        let full = path
            .segments
            .iter()
            .map(|s| s.ident.to_string())
            .collect::<Vec<_>>()
            .join("::");
        if first == "std" && full != "std::sync::Arc" {
            return;
        }
        let spelled = self.imports.name_for(&full);
        if let Ok(new_path) = syn::parse_str::<syn::Path>(&spelled) {
            *path = new_path;
        }
    }
}

fn collect_idents(tokens: proc_macro2::TokenStream, out: &mut BTreeSet<String>) {
    for tree in tokens {
        match tree {
            proc_macro2::TokenTree::Ident(ident) => {
                out.insert(ident.to_string());
            }
            proc_macro2::TokenTree::Group(group) => collect_idents(group.stream(), out),
            _ => {}
        }
    }
}

/// Per-call local bindings chosen by the namer.
#[derive(Default, Clone)]
struct CallLocals {
    value: Option<String>,
    arc: Option<String>,
    cleanup: Option<String>,
}

struct Emitter<'a> {
    inj: &'a Injector,
    solution: &'a Solution,
    locals: Vec<CallLocals>,
    /// Remaining by-value consumptions per node; non-final uses clone.
    remaining: BTreeMap<(usize, bool), usize>,
    given_remaining: BTreeMap<usize, usize>,
}

fn emit_injector(inj: &Injector, solution: &Solution, imports: &mut Imports) -> String {
    let mut emitter = Emitter::new(inj, solution);
    emitter.emit(imports)
}

impl<'a> Emitter<'a> {
    fn new(inj: &'a Injector, solution: &'a Solution) -> Self {
        let mut used: BTreeSet<String> = inj.sig.args.iter().map(|a| a.name.clone()).collect();
        used.insert("cleanup".to_string());
        let mut locals = Vec::with_capacity(solution.calls.len());
        for call in &solution.calls {
            let mut entry = CallLocals::default();
            match call {
                Call::Fn { provider, .. } => {
                    let name = alloc_name(&provider.out.var_name(), &mut used);
                    if provider.has_cleanup {
                        entry.cleanup = Some(alloc_name(&format!("{name}_cleanup"), &mut used));
                    }
                    entry.value = Some(name);
                }
                Call::Construct {
                    provider,
                    want_value,
                    want_arc,
                    ..
                } => {
                    let base = provider.out.var_name();
                    if *want_value || !*want_arc {
                        entry.value = Some(alloc_name(&base, &mut used));
                    }
                    if *want_arc {
                        entry.arc = Some(alloc_name(&format!("{base}_arc"), &mut used));
                    }
                }
                Call::Value(value) => {
                    entry.value = Some(alloc_name(&value.out.var_name(), &mut used));
                }
                Call::Widen { binding, .. } => {
                    entry.value = Some(alloc_name(&binding.boxed.var_name(), &mut used));
                }
                Call::Field { group, index, .. } => {
                    entry.value = Some(alloc_name(&group.fields[*index].name, &mut used));
                }
            }
            locals.push(entry);
        }

        let mut emitter = Self {
            inj,
            solution,
            locals,
            remaining: BTreeMap::new(),
            given_remaining: BTreeMap::new(),
        };
        emitter.count_consumptions();
        emitter
    }

    fn count_consumptions(&mut self) {
        let solution = self.solution;
        let remaining = &mut self.remaining;
        let given_remaining = &mut self.given_remaining;
        let mut count = |node: NodeRef| match node {
            NodeRef::Given(i) => {
                *given_remaining.entry(i).or_insert(0) += 1;
            }
            NodeRef::Call { index, form } => {
                *remaining
                    .entry((index, matches!(form, OutForm::Arc)))
                    .or_insert(0) += 1;
            }
        };
        for (index, call) in solution.calls.iter().enumerate() {
            match call {
                Call::Fn { args, .. } | Call::Construct { args, .. } => {
                    for arg in args {
                        if !arg.by_ref {
                            count(arg.node);
                        }
                    }
                }
                Call::Widen { from, .. } => count(from.node),
                Call::Field { parent, .. } => count(*parent),
                Call::Value(_) => {}
            }
            // A construct emitting both forms builds the Arc out of the value.
            if let Call::Construct {
                want_value: true,
                want_arc: true,
                ..
            } = call
            {
                count(NodeRef::Call {
                    index,
                    form: OutForm::Value,
                });
            }
        }
        count(solution.root);
    }

    /// Spells a by-value use of a node, cloning all but the last one.
    fn consume(&mut self, node: NodeRef) -> String {
        let (name, remaining) = match node {
            NodeRef::Given(i) => (
                self.inj.sig.args[i].name.clone(),
                self.given_remaining.get_mut(&i).expect("counted"),
            ),
            NodeRef::Call { index, form } => {
                let locals = &self.locals[index];
                let name = match form {
                    OutForm::Value => locals.value.clone().expect("value local"),
                    OutForm::Arc => locals.arc.clone().expect("arc local"),
                };
                (
                    name,
                    self.remaining
                        .get_mut(&(index, matches!(form, OutForm::Arc)))
                        .expect("counted"),
                )
            }
        };
        *remaining -= 1;
        if *remaining > 0 {
            format!("{name}.clone()")
        } else {
            name
        }
    }

    fn borrow(&self, node: NodeRef) -> String {
        let name = match node {
            NodeRef::Given(i) => self.inj.sig.args[i].name.clone(),
            NodeRef::Call { index, form } => match form {
                OutForm::Value => self.locals[index].value.clone().expect("value local"),
                OutForm::Arc => self.locals[index].arc.clone().expect("arc local"),
            },
        };
        format!("&{name}")
    }

    fn arg_text(&mut self, arg: &CallArg) -> String {
        if arg.by_ref {
            self.borrow(arg.node)
        } else {
            self.consume(arg.node)
        }
    }

    fn emit(&mut self, imports: &mut Imports) -> String {
        let mut body = String::new();
        let mut cleanups: Vec<String> = Vec::new();
        for index in 0..self.solution.calls.len() {
            self.emit_call(index, imports, &mut cleanups, &mut body);
        }

        if self.inj.sig.has_cleanup {
            body.push_str("    let cleanup: solder::Cleanup = Box::new(move || {\n");
            for name in cleanups.iter().rev() {
                let _ = writeln!(body, "        {name}();");
            }
            body.push_str("    });\n");
        }
        let root = self.consume(self.solution.root);
        let ret = match (self.inj.sig.err.is_some(), self.inj.sig.has_cleanup) {
            (true, true) => format!("Ok(({root}, cleanup))"),
            (true, false) => format!("Ok({root})"),
            (false, true) => format!("({root}, cleanup)"),
            (false, false) => root,
        };
        let _ = writeln!(body, "    {ret}");

        let vis = compact_tokens(self.inj.syn_vis.to_token_stream());
        let sig = compact_tokens(self.inj.syn_sig.to_token_stream());
        let mut out = String::new();
        if vis.is_empty() {
            let _ = writeln!(out, "{sig} {{");
        } else {
            let _ = writeln!(out, "{vis} {sig} {{");
        }
        out.push_str(&body);
        out.push_str("}\n");
        out
    }

    fn emit_call(
        &mut self,
        index: usize,
        imports: &mut Imports,
        cleanups: &mut Vec<String>,
        body: &mut String,
    ) {
        let solution = self.solution;
        match &solution.calls[index] {
            Call::Fn { provider, args } => {
                let callee = imports.name_for(&format!(
                    "{}::{}",
                    pkg_mod_path(&provider.pkg_path),
                    provider.name
                ));
                let rendered: Vec<String> = args.iter().map(|a| self.arg_text(a)).collect();
                let invocation = format!("{callee}({})", rendered.join(", "));
                let locals = self.locals[index].clone();
                let value = locals.value.expect("fn call local");
                let binding = match &locals.cleanup {
                    Some(cleanup) => format!("let ({value}, {cleanup})"),
                    None => format!("let {value}"),
                };
                if provider.has_err {
                    let _ = writeln!(body, "    {binding} = match {invocation} {{");
                    body.push_str("        Ok(value) => value,\n");
                    body.push_str("        Err(e) => {\n");
                    for name in cleanups.iter().rev() {
                        let _ = writeln!(body, "            {name}();");
                    }
                    body.push_str("            return Err(e.into());\n");
                    body.push_str("        }\n");
                    body.push_str("    };\n");
                } else {
                    let _ = writeln!(body, "    {binding} = {invocation};");
                }
                if let Some(cleanup) = locals.cleanup {
                    cleanups.push(cleanup);
                }
            }
            Call::Construct {
                provider,
                args,
                want_value,
                want_arc,
            } => {
                let (want_value, want_arc) = (*want_value, *want_arc);
                let path = imports.name_for(provider.out.as_str());
                let mut fields = Vec::new();
                for (input, arg) in provider.inputs.iter().zip(args) {
                    let field = input.field_name.as_deref().expect("struct provider field");
                    let value = self.arg_text(arg);
                    if field == value {
                        fields.push(field.to_string());
                    } else {
                        fields.push(format!("{field}: {value}"));
                    }
                }
                let literal = format!("{path} {{ {} }}", fields.join(", "));
                let locals = self.locals[index].clone();
                if want_value || !want_arc {
                    let value = locals.value.expect("construct value local");
                    let _ = writeln!(body, "    let {value} = {literal};");
                    if want_arc {
                        let arc_local = locals.arc.expect("construct arc local");
                        let arc = imports.name_for("std::sync::Arc");
                        let inner = self.consume(NodeRef::Call {
                            index,
                            form: OutForm::Value,
                        });
                        let _ = writeln!(body, "    let {arc_local} = {arc}::new({inner});");
                    }
                } else {
                    let arc_local = locals.arc.expect("construct arc local");
                    let arc = imports.name_for("std::sync::Arc");
                    let _ = writeln!(body, "    let {arc_local} = {arc}::new({literal});");
                }
            }
            Call::Value(value) => {
                let local = self.locals[index].value.clone().expect("value local");
                let expr = imports.expr_text(&value.expr);
                if value.is_interface {
                    let ty = imports.type_text(&value.out);
                    let _ = writeln!(body, "    let {local}: {ty} = Box::new({expr});");
                } else {
                    let _ = writeln!(body, "    let {local} = {expr};");
                }
            }
            Call::Widen { binding, from } => {
                let local = self.locals[index].value.clone().expect("widen local");
                let ty = imports.type_text(&binding.boxed);
                let inner = self.arg_text(from);
                let _ = writeln!(body, "    let {local}: {ty} = Box::new({inner});");
            }
            Call::Field {
                group,
                index: field_idx,
                parent,
            } => {
                let field = group.fields[*field_idx].name.clone();
                let parent = *parent;
                let local = self.locals[index].value.clone().expect("field local");
                let access = self.consume(parent);
                // Cloning a parent for a projection clones just the field.
                let access = match access.strip_suffix(".clone()") {
                    Some(base) => format!("{base}.{field}.clone()"),
                    None => format!("{access}.{field}"),
                };
                let _ = writeln!(body, "    let {local} = {access};");
            }
        }
    }
}

fn alloc_name(base: &str, used: &mut BTreeSet<String>) -> String {
    let base = if base.is_empty() { "value" } else { base };
    let mut candidate = base.to_string();
    let mut n = 2;
    while used.contains(&candidate) {
        candidate = format!("{base}{n}");
        n += 1;
    }
    used.insert(candidate.clone());
    candidate
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_name_dedups() {
        let mut used = BTreeSet::new();
        assert_eq!(alloc_name("db", &mut used), "db");
        assert_eq!(alloc_name("db", &mut used), "db2");
        assert_eq!(alloc_name("db", &mut used), "db3");
    }

    #[test]
    fn collect_idents_walks_groups() {
        let tokens: proc_macro2::TokenStream = "fn demo(a: Config) -> App { inner(a) }"
            .parse()
            .unwrap();
        let mut out = BTreeSet::new();
        collect_idents(tokens, &mut out);
        assert!(out.contains("Config"));
        assert!(out.contains("App"));
        assert!(out.contains("inner"));
    }

    #[test]
    fn format_source_normalizes() {
        let formatted = format_source("fn demo() -> u32 {   7 }").unwrap();
        assert_eq!(formatted, "fn demo() -> u32 {\n    7\n}\n");
    }

    #[test]
    fn format_source_rejects_invalid() {
        assert!(format_source("fn demo( {").is_err());
    }
}
