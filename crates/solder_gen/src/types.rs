// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Canonical type rendering.
//!
//! Providers are matched to demands by comparing types, so every type that
//! enters the model is first rendered to a canonical string: path heads are
//! expanded through the file's `use` map (or to the current package for
//! locally declared items), and token text is normalized so that spelling
//! differences in the source never split one type into two.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// A canonically rendered type, the key of every provider map.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TypeKey(String);

impl TypeKey {
    pub(crate) fn from_canon(canon: String) -> Self {
        Self(canon)
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// For `&T` (or `&mut T`) returns `T`.
    #[must_use]
    pub fn strip_ref(&self) -> Option<TypeKey> {
        if let Some(rest) = self.0.strip_prefix("&mut ") {
            return Some(TypeKey(rest.to_string()));
        }
        self.0.strip_prefix('&').map(|rest| TypeKey(rest.to_string()))
    }

    /// For `Box<dyn Trait>` returns the `dyn Trait` key.
    #[must_use]
    pub fn boxed_dyn_inner(&self) -> Option<TypeKey> {
        let inner = self.0.strip_prefix("Box<")?.strip_suffix('>')?;
        if inner.starts_with("dyn ") {
            Some(TypeKey(inner.to_string()))
        } else {
            None
        }
    }

    /// Wraps a key in the shared-ownership form used by struct providers.
    #[must_use]
    pub fn arc(inner: &TypeKey) -> TypeKey {
        TypeKey(format!("std::sync::Arc<{}>", inner.0))
    }

    #[must_use]
    pub fn is_provider_set(&self) -> bool {
        self.0 == "solder::ProviderSet"
    }

    #[must_use]
    pub fn is_cleanup(&self) -> bool {
        self.0 == "solder::Cleanup"
    }

    /// Derives a local variable name from the type, e.g.
    /// `Box<dyn crate::greet::Greeter>` becomes `greeter`.
    #[must_use]
    pub fn var_name(&self) -> String {
        let mut s = self.0.as_str();
        if let Some(stripped) = s.strip_prefix("&mut ") {
            s = stripped;
        } else if let Some(stripped) = s.strip_prefix('&') {
            s = stripped;
        }
        if let Some(inner) = TypeKey(s.to_string()).boxed_dyn_inner() {
            return TypeKey(inner.0["dyn ".len()..].to_string()).var_name();
        }
        if let Some(inner) = s.strip_prefix("std::sync::Arc<").and_then(|r| r.strip_suffix('>')) {
            return format!("{}_arc", TypeKey(inner.to_string()).var_name());
        }
        if let Some(stripped) = s.strip_prefix("dyn ") {
            s = stripped;
        }
        let head = s.split('<').next().unwrap_or(s);
        let last = head.rsplit("::").next().unwrap_or(head);
        let name = to_snake_case(last);
        if name.is_empty() || name.starts_with(|c: char| c.is_ascii_digit()) {
            return "value".to_string();
        }
        if is_reserved(&name) {
            return format!("{name}_value");
        }
        name
    }
}

impl fmt::Display for TypeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn to_snake_case(name: &str) -> String {
    let mut out = String::with_capacity(name.len() + 4);
    let mut prev_lower = false;
    for c in name.chars() {
        if !c.is_ascii_alphanumeric() && c != '_' {
            continue;
        }
        if c.is_ascii_uppercase() {
            if prev_lower {
                out.push('_');
            }
            out.push(c.to_ascii_lowercase());
            prev_lower = false;
        } else {
            prev_lower = c.is_ascii_lowercase() || c.is_ascii_digit();
            out.push(c);
        }
    }
    out
}

fn is_reserved(name: &str) -> bool {
    matches!(
        name,
        "as" | "box" | "break" | "const" | "continue" | "crate" | "dyn" | "else" | "enum"
            | "fn" | "for" | "if" | "impl" | "in" | "let" | "loop" | "match" | "mod" | "move"
            | "mut" | "pub" | "ref" | "return" | "self" | "static" | "struct" | "trait"
            | "type" | "use" | "where" | "while"
    )
}

/// Converts a package path (`a/b`, or `.` for the root) to its module path.
#[must_use]
pub fn pkg_mod_path(pkg_path: &str) -> String {
    if pkg_path == "." || pkg_path.is_empty() {
        return "crate".to_string();
    }
    format!("crate::{}", pkg_path.replace('/', "::"))
}

/// Converts a `crate::`-rooted module path back to `(package path, item)`.
///
/// `crate::a::b::Item` splits into (`a/b`, `Item`); `crate::Item` into
/// (`.`, `Item`). Returns `None` for paths outside the loaded workspace.
#[must_use]
pub fn split_crate_path(path: &str) -> Option<(String, String)> {
    let rest = path.strip_prefix("crate::")?;
    let segments: Vec<&str> = rest.split("::").collect();
    let (item, pkg) = segments.split_last()?;
    let pkg_path = if pkg.is_empty() {
        ".".to_string()
    } else {
        pkg.join("/")
    };
    Some((pkg_path, (*item).to_string()))
}

/// Name-resolution context for one source file.
pub struct TypeCx<'a> {
    /// Package path of the file being resolved.
    pub pkg_path: &'a str,
    /// `use` imports of the file: bound name to full path.
    pub uses: &'a BTreeMap<String, String>,
    /// Names of items declared at the top level of the package.
    pub locals: &'a BTreeSet<String>,
}

impl TypeCx<'_> {
    /// Renders a type to its canonical key.
    #[must_use]
    pub fn type_key(&self, ty: &syn::Type) -> TypeKey {
        let mut out = String::new();
        self.render_type(ty, &mut out);
        TypeKey(out)
    }

    /// Renders a path with heads resolved, e.g. for macro and item lookup.
    #[must_use]
    pub fn path_string(&self, path: &syn::Path) -> String {
        let mut out = String::new();
        self.render_path(path, &mut out);
        out
    }

    fn render_type(&self, ty: &syn::Type, out: &mut String) {
        match ty {
            syn::Type::Path(tp) if tp.qself.is_none() => self.render_path(&tp.path, out),
            syn::Type::Reference(r) => {
                out.push('&');
                if r.mutability.is_some() {
                    out.push_str("mut ");
                }
                self.render_type(&r.elem, out);
            }
            syn::Type::TraitObject(obj) => {
                out.push_str("dyn ");
                let mut first = true;
                for bound in &obj.bounds {
                    if let syn::TypeParamBound::Trait(t) = bound {
                        if !first {
                            out.push_str(" + ");
                        }
                        first = false;
                        self.render_path(&t.path, out);
                    }
                }
            }
            syn::Type::ImplTrait(imp) => {
                out.push_str("impl ");
                let mut first = true;
                for bound in &imp.bounds {
                    if let syn::TypeParamBound::Trait(t) = bound {
                        if !first {
                            out.push_str(" + ");
                        }
                        first = false;
                        self.render_path(&t.path, out);
                    }
                }
            }
            syn::Type::Tuple(tup) => {
                out.push('(');
                for (i, elem) in tup.elems.iter().enumerate() {
                    if i > 0 {
                        out.push_str(", ");
                    }
                    self.render_type(elem, out);
                }
                out.push(')');
            }
            syn::Type::Slice(s) => {
                out.push('[');
                self.render_type(&s.elem, out);
                out.push(']');
            }
            syn::Type::Array(a) => {
                out.push('[');
                self.render_type(&a.elem, out);
                out.push_str("; ");
                out.push_str(&compact_tokens(quote::ToTokens::to_token_stream(&a.len)));
                out.push(']');
            }
            syn::Type::Ptr(p) => {
                out.push('*');
                out.push_str(if p.mutability.is_some() { "mut " } else { "const " });
                self.render_type(&p.elem, out);
            }
            syn::Type::Paren(p) => self.render_type(&p.elem, out),
            syn::Type::Group(g) => self.render_type(&g.elem, out),
            other => out.push_str(&compact_tokens(quote::ToTokens::to_token_stream(other))),
        }
    }

    fn render_path(&self, path: &syn::Path, out: &mut String) {
        let segments: Vec<&syn::PathSegment> = path.segments.iter().collect();
        if segments.is_empty() {
            return;
        }
        let head = segments[0].ident.to_string();
        let mut start = 0;
        let mut head_args_pending = false;
        if path.leading_colon.is_none() {
            if let Some(full) = self.uses.get(&head) {
                out.push_str(full);
                head_args_pending = true;
                start = 1;
            } else if head != "crate" && self.locals.contains(&head) {
                out.push_str(&pkg_mod_path(self.pkg_path));
                out.push_str("::");
                out.push_str(&head);
                self.render_args(&segments[0].arguments, out);
                start = 1;
            }
        }
        for (i, seg) in segments.iter().enumerate().skip(start) {
            if i > 0 || start > 0 {
                out.push_str("::");
            }
            out.push_str(&seg.ident.to_string());
            self.render_args(&seg.arguments, out);
        }
        // A use-map hit on a lone segment still carries its generic args.
        if head_args_pending && segments.len() == 1 {
            self.render_args(&segments[0].arguments, out);
        }
    }

    fn render_args(&self, args: &syn::PathArguments, out: &mut String) {
        match args {
            syn::PathArguments::None => {}
            syn::PathArguments::AngleBracketed(ab) => {
                let mut rendered = Vec::new();
                for arg in &ab.args {
                    match arg {
                        syn::GenericArgument::Type(ty) => {
                            let mut s = String::new();
                            self.render_type(ty, &mut s);
                            rendered.push(s);
                        }
                        syn::GenericArgument::Const(expr) => {
                            rendered.push(compact_tokens(quote::ToTokens::to_token_stream(expr)));
                        }
                        syn::GenericArgument::Lifetime(_) => {}
                        other => {
                            rendered.push(compact_tokens(quote::ToTokens::to_token_stream(other)));
                        }
                    }
                }
                if !rendered.is_empty() {
                    out.push('<');
                    out.push_str(&rendered.join(", "));
                    out.push('>');
                }
            }
            syn::PathArguments::Parenthesized(p) => {
                out.push_str(&compact_tokens(quote::ToTokens::to_token_stream(p)));
            }
        }
    }
}

/// Renders a token stream with the noise spacing of `TokenStream::to_string`
/// squeezed out, without ever touching the inside of literals.
///
/// Words (idents and literals) are separated by one space; an `Alone` punct
/// is separated from a following punct so distinct operators never fuse.
pub(crate) fn compact_tokens(tokens: proc_macro2::TokenStream) -> String {
    let mut out = String::new();
    render_stream(tokens, &mut out);
    out
}

fn render_stream(tokens: proc_macro2::TokenStream, out: &mut String) {
    use proc_macro2::{Delimiter, Spacing, TokenTree};

    let trees: Vec<TokenTree> = tokens.into_iter().collect();
    let is_word = |tree: &TokenTree| {
        matches!(tree, TokenTree::Ident(_) | TokenTree::Literal(_))
    };
    let mut prev: Option<&TokenTree> = None;
    for tree in &trees {
        match (prev, tree) {
            (Some(p), t) if is_word(p) && is_word(t) => out.push(' '),
            (Some(TokenTree::Punct(p)), TokenTree::Punct(_)) if p.spacing() == Spacing::Alone => {
                out.push(' ');
            }
            _ => {}
        }
        match tree {
            TokenTree::Ident(ident) => out.push_str(&ident.to_string()),
            TokenTree::Literal(lit) => out.push_str(&lit.to_string()),
            TokenTree::Punct(punct) => out.push(punct.as_char()),
            TokenTree::Group(group) => {
                let (open, close) = match group.delimiter() {
                    Delimiter::Parenthesis => ("(", ")"),
                    Delimiter::Brace => ("{", "}"),
                    Delimiter::Bracket => ("[", "]"),
                    Delimiter::None => ("", ""),
                };
                out.push_str(open);
                render_stream(group.stream(), out);
                out.push_str(close);
            }
        }
        prev = Some(tree);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cx<'a>(
        pkg: &'a str,
        uses: &'a BTreeMap<String, String>,
        locals: &'a BTreeSet<String>,
    ) -> TypeCx<'a> {
        TypeCx {
            pkg_path: pkg,
            uses,
            locals,
        }
    }

    #[test]
    fn resolves_local_struct_to_package_path() {
        let uses = BTreeMap::new();
        let locals = BTreeSet::from(["Database".to_string()]);
        let ty: syn::Type = syn::parse_str("Database").unwrap();
        assert_eq!(cx("app/db", &uses, &locals).type_key(&ty).as_str(), "crate::app::db::Database");
    }

    #[test]
    fn resolves_through_use_map() {
        let uses = BTreeMap::from([("Pool".to_string(), "crate::db::Pool".to_string())]);
        let locals = BTreeSet::new();
        let ty: syn::Type = syn::parse_str("Pool").unwrap();
        assert_eq!(cx(".", &uses, &locals).type_key(&ty).as_str(), "crate::db::Pool");
    }

    #[test]
    fn renders_boxed_trait_object() {
        let uses = BTreeMap::new();
        let locals = BTreeSet::from(["Greeter".to_string()]);
        let ty: syn::Type = syn::parse_str("Box<dyn Greeter>").unwrap();
        let key = cx(".", &uses, &locals).type_key(&ty);
        assert_eq!(key.as_str(), "Box<dyn crate::Greeter>");
        assert_eq!(key.boxed_dyn_inner().unwrap().as_str(), "dyn crate::Greeter");
    }

    #[test]
    fn reference_and_generic_arguments() {
        let uses = BTreeMap::from([("Arc".to_string(), "std::sync::Arc".to_string())]);
        let locals = BTreeSet::from(["Config".to_string()]);
        let ty: syn::Type = syn::parse_str("&Arc<Config>").unwrap();
        let key = cx("svc", &uses, &locals).type_key(&ty);
        assert_eq!(key.as_str(), "&std::sync::Arc<crate::svc::Config>");
        assert_eq!(
            key.strip_ref().unwrap().as_str(),
            "std::sync::Arc<crate::svc::Config>"
        );
    }

    #[test]
    fn var_names() {
        assert_eq!(TypeKey("crate::db::PoolConfig".into()).var_name(), "pool_config");
        assert_eq!(TypeKey("Box<dyn crate::Greeter>".into()).var_name(), "greeter");
        assert_eq!(TypeKey("std::sync::Arc<crate::App>".into()).var_name(), "app_arc");
        assert_eq!(TypeKey("&crate::Config".into()).var_name(), "config");
        assert_eq!(TypeKey("String".into()).var_name(), "string");
    }

    #[test]
    fn split_crate_paths() {
        assert_eq!(
            split_crate_path("crate::a::b::Item"),
            Some(("a/b".to_string(), "Item".to_string()))
        );
        assert_eq!(
            split_crate_path("crate::Item"),
            Some((".".to_string(), "Item".to_string()))
        );
        assert_eq!(split_crate_path("std::sync::Arc"), None);
    }

    #[test]
    fn pkg_mod_paths() {
        assert_eq!(pkg_mod_path("."), "crate");
        assert_eq!(pkg_mod_path("a/b"), "crate::a::b");
    }
}
