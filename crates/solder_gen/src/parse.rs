// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The provider-set parser.
//!
//! Recognizes the companion crate's primitives in parsed source, resolved by
//! fully-qualified macro path: `new_set!` initializers of `ProviderSet`
//! statics, `build!` bodies of injector stubs, and the `bind!`/`value!`/
//! `interface_value!`/`construct!`/`fields_of!` items inside them. Produces
//! the immutable model of `crate::model` with a flattened provider map.

use std::sync::Arc;

use syn::parse::Parser;
use syn::punctuated::Punctuated;
use syn::visit_mut::VisitMut;

use crate::error::{Error, Pos};
use crate::loader::{FnDecl, Package, StructField};
use crate::model::{
    FieldOut, FieldsGroup, Injector, InjectorArg, InjectorSig, Info, InterfaceBinding,
    ProvidedItem, Provider, ProviderInput, ProviderSet, ValueExpr,
};
use crate::object_cache::ObjectCache;
use crate::types::{split_crate_path, TypeCx, TypeKey};

/// Parses every named set and injector of a package into `Info` slices.
///
/// All errors are collected; one declaration's failure never hides another's.
pub fn package_info(
    oc: &ObjectCache<'_>,
    pkg: &Arc<Package>,
) -> (Info, Vec<Error>) {
    let mut info = Info::default();
    let mut errs = Vec::new();
    for (name, decl) in &pkg.index.statics {
        if !decl.ty.is_provider_set() {
            continue;
        }
        match oc.named_set(&pkg.pkg_path, name) {
            Ok(set) => {
                info.sets
                    .insert((pkg.pkg_path.clone(), name.clone()), set);
            }
            Err(mut e) => errs.append(&mut e),
        }
    }
    for (file_idx, file) in pkg.files.iter().enumerate() {
        if !file.is_stub {
            continue;
        }
        for item in &file.ast.items {
            let syn::Item::Fn(f) = item else { continue };
            match injector_shape(pkg, file_idx, f) {
                InjectorShape::Not => {}
                InjectorShape::Invalid(pos) => errs.push(Error::InvalidInjectorShape {
                    pos,
                    injector: f.sig.ident.to_string(),
                }),
                InjectorShape::Build(tokens, pos) => {
                    match parse_injector(oc, pkg, file_idx, f, tokens, pos) {
                        Ok(injector) => info.injectors.push(injector),
                        Err(mut e) => errs.append(&mut e),
                    }
                }
            }
        }
    }
    info.injectors
        .sort_by(|a, b| (&a.pkg_path, &a.fn_name).cmp(&(&b.pkg_path, &b.fn_name)));
    (info, errs)
}

enum InjectorShape {
    Not,
    Invalid(Pos),
    Build(proc_macro2::TokenStream, Pos),
}

/// Classifies a function as an injector stub, a non-injector, or a stub with
/// an invalid body shape.
fn injector_shape(pkg: &Arc<Package>, file_idx: usize, f: &syn::ItemFn) -> InjectorShape {
    let cx = pkg.cx(file_idx);
    let path = &pkg.files[file_idx].path;
    let build_of = |mac: &syn::Macro| -> Option<(proc_macro2::TokenStream, Pos)> {
        if cx.path_string(&mac.path) == "solder::build" {
            Some((
                mac.tokens.clone(),
                Pos::new(path, mac.path.segments[0].ident.span()),
            ))
        } else {
            None
        }
    };
    if f.block.stmts.len() == 1 {
        let found = match &f.block.stmts[0] {
            syn::Stmt::Macro(sm) => build_of(&sm.mac),
            syn::Stmt::Expr(expr, _) => match expr {
                syn::Expr::Macro(m) => build_of(&m.mac),
                syn::Expr::Return(r) => match r.expr.as_deref() {
                    Some(syn::Expr::Macro(m)) => build_of(&m.mac),
                    _ => None,
                },
                _ => None,
            },
            syn::Stmt::Local(_) | syn::Stmt::Item(_) => None,
        };
        if let Some((tokens, pos)) = found {
            return InjectorShape::Build(tokens, pos);
        }
    }
    // A build! call mixed with other statements (or nested somewhere it does
    // not belong) makes the function an invalid stub rather than a plain
    // function.
    if stmts_mention_build(&f.block.stmts, &cx) {
        return InjectorShape::Invalid(Pos::new(path, f.sig.ident.span()));
    }
    InjectorShape::Not
}

fn stmts_mention_build(stmts: &[syn::Stmt], cx: &TypeCx<'_>) -> bool {
    struct Finder<'a, 'b> {
        cx: &'a TypeCx<'b>,
        found: bool,
    }
    impl syn::visit_mut::VisitMut for Finder<'_, '_> {
        fn visit_macro_mut(&mut self, mac: &mut syn::Macro) {
            if self.cx.path_string(&mac.path) == "solder::build" {
                self.found = true;
            }
        }
    }
    let mut finder = Finder { cx, found: false };
    for stmt in stmts {
        let mut stmt = stmt.clone();
        finder.visit_stmt_mut(&mut stmt);
        if finder.found {
            return true;
        }
    }
    false
}

fn parse_injector(
    oc: &ObjectCache<'_>,
    pkg: &Arc<Package>,
    file_idx: usize,
    f: &syn::ItemFn,
    tokens: proc_macro2::TokenStream,
    pos: Pos,
) -> Result<Injector, Vec<Error>> {
    let cx = pkg.cx(file_idx);
    let fn_name = f.sig.ident.to_string();
    let mut errs = Vec::new();
    if !f.sig.generics.params.is_empty() {
        errs.push(Error::InvalidSetDeclaration {
            pos: pos.clone(),
            msg: format!("injector {fn_name} must not be generic"),
        });
    }
    let mut args = Vec::new();
    for input in &f.sig.inputs {
        match input {
            syn::FnArg::Typed(pt) => match pt.pat.as_ref() {
                syn::Pat::Ident(ident) => args.push(InjectorArg {
                    name: ident.ident.to_string(),
                    ty: cx.type_key(&pt.ty),
                }),
                _ => errs.push(Error::InvalidSetDeclaration {
                    pos: pos.clone(),
                    msg: format!("injector {fn_name} arguments must be named"),
                }),
            },
            syn::FnArg::Receiver(_) => errs.push(Error::InvalidSetDeclaration {
                pos: pos.clone(),
                msg: format!("injector {fn_name} must be a free function"),
            }),
        }
    }
    let shape = match parse_output(&cx, &f.sig.output) {
        Ok(shape) => Some(shape),
        Err(msg) => {
            errs.push(Error::InvalidSetDeclaration {
                pos: pos.clone(),
                msg: format!("injector {fn_name}: {msg}"),
            });
            None
        }
    };
    if !errs.is_empty() {
        return Err(errs);
    }
    let shape = shape.expect("output shape present without errors");
    let parser = SetParser::new(oc, pkg, file_idx);
    let set = parser.parse_items(tokens, "", pos.clone())?;
    Ok(Injector {
        pkg_path: pkg.pkg_path.clone(),
        fn_name,
        file_idx,
        pos,
        sig: InjectorSig {
            out: shape.out,
            err: shape.err,
            has_cleanup: shape.has_cleanup,
            args,
        },
        set,
        syn_vis: f.vis.clone(),
        syn_sig: f.sig.clone(),
    })
}

struct OutputShape {
    out: TypeKey,
    err: Option<TypeKey>,
    has_cleanup: bool,
}

/// Parses a provider or injector return type into its `(T[, cleanup][, error])`
/// shape: `T`, `Result<T, E>`, `(T, Cleanup)`, or `Result<(T, Cleanup), E>`.
fn parse_output(cx: &TypeCx<'_>, ret: &syn::ReturnType) -> Result<OutputShape, String> {
    let syn::ReturnType::Type(_, ty) = ret else {
        return Err("a value must be returned".to_string());
    };
    let (payload, err) = split_result(cx, ty)?;
    let (out, has_cleanup) = split_cleanup(cx, payload);
    Ok(OutputShape {
        out,
        err,
        has_cleanup,
    })
}

fn split_result<'a>(
    cx: &TypeCx<'_>,
    ty: &'a syn::Type,
) -> Result<(&'a syn::Type, Option<TypeKey>), String> {
    let syn::Type::Path(tp) = ty else {
        return Ok((ty, None));
    };
    let last = tp.path.segments.last().expect("type path has segments");
    if last.ident != "Result" {
        return Ok((ty, None));
    }
    let syn::PathArguments::AngleBracketed(args) = &last.arguments else {
        return Err("Result must name its value and error types".to_string());
    };
    let types: Vec<&syn::Type> = args
        .args
        .iter()
        .filter_map(|a| match a {
            syn::GenericArgument::Type(t) => Some(t),
            _ => None,
        })
        .collect();
    if types.len() != 2 {
        return Err("Result must name its value and error types".to_string());
    }
    Ok((types[0], Some(cx.type_key(types[1]))))
}

fn split_cleanup(cx: &TypeCx<'_>, ty: &syn::Type) -> (TypeKey, bool) {
    if let syn::Type::Tuple(tup) = ty {
        if tup.elems.len() == 2 && cx.type_key(&tup.elems[1]).is_cleanup() {
            return (cx.type_key(&tup.elems[0]), true);
        }
    }
    (cx.type_key(ty), false)
}

/// Parses the item list of one `new_set!` or `build!` invocation.
pub struct SetParser<'a, 'b> {
    oc: &'a ObjectCache<'b>,
    pkg: &'a Arc<Package>,
    file: usize,
}

impl<'a, 'b> SetParser<'a, 'b> {
    pub fn new(oc: &'a ObjectCache<'b>, pkg: &'a Arc<Package>, file: usize) -> Self {
        Self { oc, pkg, file }
    }

    fn cx(&self) -> TypeCx<'_> {
        self.pkg.cx(self.file)
    }

    fn pos(&self, span: proc_macro2::Span) -> Pos {
        Pos::new(&self.pkg.files[self.file].path, span)
    }

    pub fn parse_items(
        &self,
        tokens: proc_macro2::TokenStream,
        var_name: &str,
        pos: Pos,
    ) -> Result<ProviderSet, Vec<Error>> {
        let mut builder = SetBuilder::new(self.pkg.pkg_path.clone(), var_name.to_string(), pos.clone());
        let items = match Punctuated::<syn::Expr, syn::Token![,]>::parse_terminated.parse2(tokens)
        {
            Ok(items) => items,
            Err(e) => {
                return Err(vec![Error::InvalidSetDeclaration {
                    pos,
                    msg: format!("malformed provider set items: {e}"),
                }]);
            }
        };
        for item in &items {
            match item {
                syn::Expr::Path(p) => self.path_item(&mut builder, p),
                syn::Expr::Macro(m) => self.macro_item(&mut builder, m),
                other => builder.errs.push(Error::InvalidSetDeclaration {
                    pos: self.pos(span_of(other)),
                    msg: "provider set items must be paths or solder macros".to_string(),
                }),
            }
        }
        builder.finish()
    }

    fn path_item(&self, builder: &mut SetBuilder, expr: &syn::ExprPath) {
        let pos = self.pos(expr.path.segments[0].ident.span());
        let canon = self.cx().path_string(&expr.path);
        let Some((pkg_path, item)) = split_crate_path(&canon) else {
            builder.errs.push(Error::InvalidSetDeclaration {
                pos,
                msg: format!("{canon} does not resolve to a workspace item"),
            });
            return;
        };
        let target = if pkg_path == self.pkg.pkg_path {
            self.pkg.clone()
        } else {
            match self.oc.package(&pkg_path) {
                Ok(pkg) => pkg,
                Err(mut e) => {
                    builder.errs.append(&mut e);
                    return;
                }
            }
        };
        if let Some(decl) = target.index.fns.get(&item) {
            match self.fn_provider(&target, &item, decl) {
                Ok(p) => builder.add_provider(p),
                Err(e) => builder.errs.push(e),
            }
            return;
        }
        if let Some(decl) = target.index.statics.get(&item) {
            if decl.ty.is_provider_set() {
                match self.oc.named_set(&pkg_path, &item) {
                    Ok(set) => builder.merge_import(&pkg_path, &item, &set),
                    Err(mut e) => builder.errs.append(&mut e),
                }
                return;
            }
        }
        if target.index.structs.contains_key(&item) {
            match self.struct_provider(&target, &item, Selection::All, pos) {
                Ok(p) => builder.add_provider(p),
                Err(e) => builder.errs.push(e),
            }
            return;
        }
        builder.errs.push(Error::InvalidSetDeclaration {
            pos,
            msg: format!("{canon} is not a provider function, provider set, or struct"),
        });
    }

    fn macro_item(&self, builder: &mut SetBuilder, expr: &syn::ExprMacro) {
        let pos = self.pos(expr.mac.path.segments[0].ident.span());
        let canon = self.cx().path_string(&expr.mac.path);
        let tokens = expr.mac.tokens.clone();
        let result = match canon.as_str() {
            "solder::bind" => self.bind_item(builder, tokens, &pos),
            "solder::value" => self.value_item(builder, tokens, &pos, false),
            "solder::interface_value" => self.value_item(builder, tokens, &pos, true),
            "solder::construct" => self.construct_item(builder, tokens, &pos),
            "solder::fields_of" => self.fields_of_item(builder, tokens, &pos),
            "solder::new_set" => Err("nested new_set! is not allowed; declare a named set".to_string()),
            "solder::build" => Err("build! may only form an injector body".to_string()),
            other => Err(format!("unknown provider set item {other}!")),
        };
        if let Err(msg) = result {
            builder.errs.push(Error::InvalidSetDeclaration { pos, msg });
        }
    }

    fn bind_item(
        &self,
        builder: &mut SetBuilder,
        tokens: proc_macro2::TokenStream,
        pos: &Pos,
    ) -> Result<(), String> {
        let types = Punctuated::<syn::Type, syn::Token![,]>::parse_terminated
            .parse2(tokens)
            .map_err(|e| format!("bind! expects an interface and a concrete type: {e}"))?;
        if types.len() != 2 {
            return Err("bind! expects exactly two arguments".to_string());
        }
        let iface = self.iface_key(&types[0])?;
        let concrete = self.cx().type_key(&types[1]);
        let trait_path = iface.as_str()["dyn ".len()..].to_string();
        if !self.oc.has_impl(&trait_path, concrete.as_str()) {
            builder.errs.push(Error::BindingTypeMismatch {
                pos: pos.clone(),
                iface: iface.to_string(),
                concrete: concrete.to_string(),
            });
            return Ok(());
        }
        let boxed = TypeKey::from_canon(format!("Box<{iface}>"));
        builder.add_binding(Arc::new(InterfaceBinding {
            iface,
            boxed,
            concrete,
            pos: pos.clone(),
        }));
        Ok(())
    }

    /// Normalizes the first argument of `bind!`/`interface_value!` to a
    /// `dyn Trait` key and verifies it names a trait.
    fn iface_key(&self, ty: &syn::Type) -> Result<TypeKey, String> {
        let key = self.cx().type_key(ty);
        let canon = match key.as_str().strip_prefix("dyn ") {
            Some(path) => path.to_string(),
            None => key.as_str().to_string(),
        };
        if !self.oc.is_trait(&canon) {
            return Err(format!("{canon} is not a trait"));
        }
        Ok(TypeKey::from_canon(format!("dyn {canon}")))
    }

    fn value_item(
        &self,
        builder: &mut SetBuilder,
        tokens: proc_macro2::TokenStream,
        pos: &Pos,
        is_interface: bool,
    ) -> Result<(), String> {
        let parsed: TypeAndExpr = syn::parse2(tokens).map_err(|e| {
            format!("value! expects a type and an expression: {e}")
        })?;
        let out = if is_interface {
            let iface = self.iface_key(&parsed.ty)?;
            TypeKey::from_canon(format!("Box<{iface}>"))
        } else {
            self.cx().type_key(&parsed.ty)
        };
        let mut expr = parsed.expr;
        canonicalize_expr(&mut expr, &self.cx());
        builder.add_value(Arc::new(ValueExpr {
            out,
            expr,
            pos: pos.clone(),
            is_interface,
        }));
        Ok(())
    }

    fn construct_item(
        &self,
        builder: &mut SetBuilder,
        tokens: proc_macro2::TokenStream,
        pos: &Pos,
    ) -> Result<(), String> {
        let parsed: TypeAndSelection = syn::parse2(tokens)
            .map_err(|e| format!("construct! expects a struct type and field names: {e}"))?;
        let (target, item) = self.resolve_struct(&parsed.ty)?;
        let provider = self
            .struct_provider(&target, &item, parsed.selection, pos.clone())
            .map_err(|e| e.to_string())?;
        builder.add_provider(provider);
        Ok(())
    }

    fn fields_of_item(
        &self,
        builder: &mut SetBuilder,
        tokens: proc_macro2::TokenStream,
        pos: &Pos,
    ) -> Result<(), String> {
        let parsed: TypeAndSelection = syn::parse2(tokens)
            .map_err(|e| format!("fields_of! expects a struct type and field names: {e}"))?;
        let Selection::Named(names) = parsed.selection else {
            return Err("fields_of! requires explicit field names".to_string());
        };
        let (target, item) = self.resolve_struct(&parsed.ty)?;
        let def = target
            .index
            .structs
            .get(&item)
            .expect("struct resolved above");
        let parent = self.cx().type_key(&parsed.ty);
        let mut fields = Vec::new();
        for name in &names {
            let Some(field) = def.fields.iter().find(|f| &f.name == name) else {
                return Err(format!("{item} has no field {name}"));
            };
            fields.push(FieldOut {
                name: field.name.clone(),
                ty: field.ty.clone(),
            });
        }
        builder.add_fields(Arc::new(FieldsGroup {
            parent,
            fields,
            pos: pos.clone(),
        }));
        Ok(())
    }

    fn resolve_struct(&self, ty: &syn::Type) -> Result<(Arc<Package>, String), String> {
        let key = self.cx().type_key(ty);
        let Some((pkg_path, item)) = split_crate_path(key.as_str()) else {
            return Err(format!("{key} does not resolve to a workspace struct"));
        };
        let target = if pkg_path == self.pkg.pkg_path {
            self.pkg.clone()
        } else {
            self.oc
                .package(&pkg_path)
                .map_err(|e| e.first().map_or_else(String::new, ToString::to_string))?
        };
        if !target.index.structs.contains_key(&item) {
            return Err(format!("{key} is not a struct"));
        }
        Ok((target, item))
    }

    fn fn_provider(
        &self,
        pkg: &Arc<Package>,
        name: &str,
        decl: &FnDecl,
    ) -> Result<Arc<Provider>, Error> {
        let cx = pkg.cx(decl.file);
        let fail = |msg: String| Error::InvalidSetDeclaration {
            pos: decl.pos.clone(),
            msg,
        };
        if !decl.sig.generics.params.is_empty() {
            return Err(fail(format!("provider {name} must not be generic")));
        }
        let mut inputs: Vec<ProviderInput> = Vec::new();
        for input in &decl.sig.inputs {
            let syn::FnArg::Typed(pt) = input else {
                return Err(fail(format!("provider {name} must be a free function")));
            };
            let raw = cx.type_key(&pt.ty);
            let (ty, by_ref) = match raw.strip_ref() {
                Some(inner) => (inner, true),
                None => (raw, false),
            };
            if inputs.iter().any(|i| i.ty == ty) {
                return Err(fail(format!(
                    "provider {name} has two inputs of type {ty}"
                )));
            }
            inputs.push(ProviderInput {
                ty,
                by_ref,
                field_name: None,
            });
        }
        let shape = parse_output(&cx, &decl.sig.output)
            .map_err(|msg| fail(format!("provider {name}: {msg}")))?;
        Ok(Arc::new(Provider {
            pkg_path: pkg.pkg_path.clone(),
            name: name.to_string(),
            pos: decl.pos.clone(),
            out: shape.out,
            arc_out: None,
            inputs,
            has_err: shape.err.is_some(),
            has_cleanup: shape.has_cleanup,
            is_struct: false,
        }))
    }

    fn struct_provider(
        &self,
        pkg: &Arc<Package>,
        name: &str,
        selection: Selection,
        pos: Pos,
    ) -> Result<Arc<Provider>, Error> {
        let fail = |msg: String| Error::InvalidSetDeclaration {
            pos: pos.clone(),
            msg,
        };
        let def = pkg
            .index
            .structs
            .get(name)
            .expect("caller resolved the struct");
        if !def.has_named_fields {
            return Err(fail(format!("{name} is not a struct with named fields")));
        }
        let selected: Vec<&StructField> = match &selection {
            Selection::All => def.fields.iter().filter(|f| !f.skip).collect(),
            Selection::Named(names) => {
                let mut out = Vec::new();
                for field_name in names {
                    let Some(field) = def.fields.iter().find(|f| &f.name == field_name) else {
                        return Err(fail(format!("{name} has no field {field_name}")));
                    };
                    if field.skip {
                        return Err(fail(format!(
                            "field {field_name} of {name} is marked #[solder(skip)]"
                        )));
                    }
                    out.push(field);
                }
                out
            }
        };
        let mut inputs: Vec<ProviderInput> = Vec::new();
        for field in selected {
            if inputs.iter().any(|i| i.ty == field.ty) {
                return Err(fail(format!(
                    "{name} selects two fields of type {}",
                    field.ty
                )));
            }
            inputs.push(ProviderInput {
                ty: field.ty.clone(),
                by_ref: false,
                field_name: Some(field.name.clone()),
            });
        }
        let out = TypeKey::from_canon(format!(
            "{}::{name}",
            crate::types::pkg_mod_path(&pkg.pkg_path)
        ));
        let arc_out = TypeKey::arc(&out);
        Ok(Arc::new(Provider {
            pkg_path: pkg.pkg_path.clone(),
            name: name.to_string(),
            pos,
            out,
            arc_out: Some(arc_out),
            inputs,
            has_err: false,
            has_cleanup: false,
            is_struct: true,
        }))
    }
}

enum Selection {
    All,
    Named(Vec<String>),
}

struct TypeAndExpr {
    ty: syn::Type,
    expr: syn::Expr,
}

impl syn::parse::Parse for TypeAndExpr {
    fn parse(input: syn::parse::ParseStream<'_>) -> syn::Result<Self> {
        let ty = input.parse()?;
        input.parse::<syn::Token![,]>()?;
        let expr = input.parse()?;
        Ok(Self { ty, expr })
    }
}

struct TypeAndSelection {
    ty: syn::Type,
    selection: Selection,
}

impl syn::parse::Parse for TypeAndSelection {
    fn parse(input: syn::parse::ParseStream<'_>) -> syn::Result<Self> {
        let ty = input.parse()?;
        input.parse::<syn::Token![,]>()?;
        if input.peek(syn::Token![*]) {
            input.parse::<syn::Token![*]>()?;
            return Ok(Self {
                ty,
                selection: Selection::All,
            });
        }
        let names = Punctuated::<syn::Ident, syn::Token![,]>::parse_terminated(input)?;
        if names.is_empty() {
            return Err(input.error("expected field names or *"));
        }
        Ok(Self {
            ty,
            selection: Selection::Named(names.iter().map(ToString::to_string).collect()),
        })
    }
}

/// Rewrites resolvable path heads in an embedded expression to their
/// canonical `crate::…` form, so values declared in one package remain
/// meaningful when inlined into another package's generated file.
fn canonicalize_expr(expr: &mut syn::Expr, cx: &TypeCx<'_>) {
    struct Rewriter<'a, 'b> {
        cx: &'a TypeCx<'b>,
    }
    impl VisitMut for Rewriter<'_, '_> {
        fn visit_path_mut(&mut self, path: &mut syn::Path) {
            syn::visit_mut::visit_path_mut(self, path);
            if path.leading_colon.is_some() || path.segments.is_empty() {
                return;
            }
            let head = path.segments[0].ident.to_string();
            let known = self.cx.uses.contains_key(&head)
                || (head != "crate" && self.cx.locals.contains(&head));
            if !known {
                return;
            }
            let canon = self.cx.path_string(path);
            if let Ok(new_path) = syn::parse_str::<syn::Path>(&canon) {
                *path = new_path;
            }
        }
    }
    Rewriter { cx }.visit_expr_mut(expr);
}

fn span_of(expr: &syn::Expr) -> proc_macro2::Span {
    use quote::ToTokens;
    expr.to_token_stream()
        .into_iter()
        .next()
        .map_or_else(proc_macro2::Span::call_site, |t| t.span())
}

/// Accumulates one provider set, reporting duplicate output types as they
/// appear.
struct SetBuilder {
    set: ProviderSet,
    errs: Vec<Error>,
}

impl SetBuilder {
    fn new(pkg_path: String, var_name: String, pos: Pos) -> Self {
        Self {
            set: ProviderSet {
                pkg_path,
                var_name,
                pos,
                ..ProviderSet::default()
            },
            errs: Vec::new(),
        }
    }

    fn add_entry(&mut self, key: TypeKey, item: ProvidedItem, pos: Pos) {
        if let Some(existing) = self.set.provider_map.get(&key) {
            self.errs.push(Error::DuplicateBinding {
                ty: key.to_string(),
                first: self.set.src_map[&key].clone(),
                first_desc: existing.describe(),
                second: pos,
            });
            return;
        }
        self.set.provider_map.insert(key.clone(), item);
        self.set.src_map.insert(key, pos);
    }

    fn add_provider(&mut self, provider: Arc<Provider>) {
        let pos = provider.pos.clone();
        self.add_entry(
            provider.out.clone(),
            ProvidedItem::Provider(provider.clone()),
            pos.clone(),
        );
        if let Some(arc_out) = &provider.arc_out {
            self.add_entry(arc_out.clone(), ProvidedItem::Provider(provider.clone()), pos);
        }
        self.set.providers.push(provider);
    }

    fn add_value(&mut self, value: Arc<ValueExpr>) {
        self.add_entry(
            value.out.clone(),
            ProvidedItem::Value(value.clone()),
            value.pos.clone(),
        );
        self.set.values.push(value);
    }

    fn add_binding(&mut self, binding: Arc<InterfaceBinding>) {
        self.add_entry(
            binding.boxed.clone(),
            ProvidedItem::Binding(binding.clone()),
            binding.pos.clone(),
        );
        self.set.bindings.push(binding);
    }

    fn add_fields(&mut self, group: Arc<FieldsGroup>) {
        for (i, field) in group.fields.iter().enumerate() {
            self.add_entry(
                field.ty.clone(),
                ProvidedItem::Fields(group.clone(), i),
                group.pos.clone(),
            );
        }
        self.set.fields.push(group);
    }

    fn merge_import(&mut self, pkg_path: &str, name: &str, imported: &Arc<ProviderSet>) {
        self.set
            .imports
            .push((pkg_path.to_string(), name.to_string()));
        for (key, item) in &imported.provider_map {
            self.add_entry(key.clone(), item.clone(), imported.src_map[key].clone());
        }
    }

    fn finish(self) -> Result<ProviderSet, Vec<Error>> {
        if self.errs.is_empty() {
            Ok(self.set)
        } else {
            Err(self.errs)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
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

    fn load_info(tmp: &TempDir, pkg: &str) -> (Info, Vec<Error>) {
        let ctx = Ctx::new();
        let loader = FsLoader::new(tmp.path(), "");
        let root = loader.load_package(&ctx, pkg).unwrap();
        let oc = ObjectCache::new(&ctx, &loader, &[root.clone()]);
        package_info(&oc, &root)
    }

    #[test]
    fn parses_named_set_and_injector() {
        let tmp = TempDir::new().unwrap();
        write(
            tmp.path(),
            "lib.rs",
            r#"
pub struct Db { pub dsn: String }
pub struct App { pub db: Db }
pub fn new_db() -> Db { Db { dsn: String::new() } }
pub fn new_app(db: Db) -> App { App { db } }
"#,
        );
        write(
            tmp.path(),
            "inject.rs",
            r#"#![cfg(solderinject)]
use solder::{build, new_set};

static APP_SET: solder::ProviderSet = new_set!(new_db, new_app);

pub fn init_app() -> App {
    build!(APP_SET)
}
"#,
        );
        let (info, errs) = load_info(&tmp, ".");
        assert!(errs.is_empty(), "{errs:?}");
        assert_eq!(info.sets.len(), 1);
        let set = &info.sets[&(".".to_string(), "APP_SET".to_string())];
        assert_eq!(set.providers.len(), 2);
        assert!(set
            .provider_map
            .contains_key(&TypeKey::from_canon("crate::App".into())));
        assert_eq!(info.injectors.len(), 1);
        let inj = &info.injectors[0];
        assert_eq!(inj.fn_name, "init_app");
        assert_eq!(inj.sig.out.as_str(), "crate::App");
        assert_eq!(inj.set.imports, vec![(".".to_string(), "APP_SET".to_string())]);
    }

    #[test]
    fn duplicate_output_types_are_reported() {
        let tmp = TempDir::new().unwrap();
        write(
            tmp.path(),
            "lib.rs",
            r#"
pub struct Db;
pub fn new_db() -> Db { Db }
pub fn other_db() -> Db { Db }
"#,
        );
        write(
            tmp.path(),
            "inject.rs",
            r#"#![cfg(solderinject)]
use solder::{build, new_set};

static SET: solder::ProviderSet = new_set!(new_db, other_db);

pub fn init() -> Db {
    build!(SET)
}
"#,
        );
        let (_, errs) = load_info(&tmp, ".");
        assert!(
            errs.iter()
                .any(|e| matches!(e, Error::DuplicateBinding { ty, .. } if ty == "crate::Db")),
            "{errs:?}"
        );
    }

    #[test]
    fn mixed_build_statement_is_invalid_shape() {
        let tmp = TempDir::new().unwrap();
        write(tmp.path(), "lib.rs", "pub struct Db;\npub fn new_db() -> Db { Db }\n");
        write(
            tmp.path(),
            "inject.rs",
            r#"#![cfg(solderinject)]
use solder::build;

pub fn init() -> Db {
    let _noise = 1;
    build!(new_db)
}
"#,
        );
        let (info, errs) = load_info(&tmp, ".");
        assert!(info.injectors.is_empty());
        assert!(
            errs.iter()
                .any(|e| matches!(e, Error::InvalidInjectorShape { injector, .. } if injector == "init")),
            "{errs:?}"
        );
    }

    #[test]
    fn bind_requires_impl() {
        let tmp = TempDir::new().unwrap();
        write(
            tmp.path(),
            "lib.rs",
            r#"
pub trait Greeter { fn greet(&self) -> String; }
pub struct Silent;
pub fn new_silent() -> Silent { Silent }
"#,
        );
        write(
            tmp.path(),
            "inject.rs",
            r#"#![cfg(solderinject)]
use solder::{bind, build};

pub fn init() -> Box<dyn Greeter> {
    build!(new_silent, bind!(dyn Greeter, Silent))
}
"#,
        );
        let (_, errs) = load_info(&tmp, ".");
        assert!(
            errs.iter().any(|e| matches!(
                e,
                Error::BindingTypeMismatch { iface, concrete, .. }
                    if iface == "dyn crate::Greeter" && concrete == "crate::Silent"
            )),
            "{errs:?}"
        );
    }

    #[test]
    fn set_import_cycle_is_reported() {
        let tmp = TempDir::new().unwrap();
        write(
            tmp.path(),
            "lib.rs",
            r#"
use solder::new_set;
pub struct Db;
pub static SET_A: solder::ProviderSet = new_set!(SET_B);
pub static SET_B: solder::ProviderSet = new_set!(SET_A);
pub fn new_db() -> Db { Db }
"#,
        );
        write(
            tmp.path(),
            "inject.rs",
            r#"#![cfg(solderinject)]
use solder::build;

pub fn init() -> Db {
    build!(SET_A, new_db)
}
"#,
        );
        let (_, errs) = load_info(&tmp, ".");
        assert!(
            errs.iter()
                .any(|e| matches!(e, Error::ImportCycle { cycle } if cycle.contains("SET_A"))),
            "{errs:?}"
        );
    }

    #[test]
    fn construct_skips_marked_fields() {
        let tmp = TempDir::new().unwrap();
        write(
            tmp.path(),
            "lib.rs",
            r#"
pub struct Db;
pub struct App {
    pub db: Db,
    #[solder(skip)]
    pub started: bool,
}
pub fn new_db() -> Db { Db }
"#,
        );
        write(
            tmp.path(),
            "inject.rs",
            r#"#![cfg(solderinject)]
use solder::{build, construct};

pub fn init() -> App {
    build!(new_db, construct!(App, *))
}
"#,
        );
        let (info, errs) = load_info(&tmp, ".");
        assert!(errs.is_empty(), "{errs:?}");
        let inj = &info.injectors[0];
        let item = &inj.set.provider_map[&TypeKey::from_canon("crate::App".into())];
        let provider = item.provider();
        assert!(provider.is_struct);
        assert_eq!(provider.inputs.len(), 1);
        assert_eq!(provider.inputs[0].field_name.as_deref(), Some("db"));
        assert!(inj
            .set
            .provider_map
            .contains_key(&TypeKey::from_canon("std::sync::Arc<crate::App>".into())));
    }
}
