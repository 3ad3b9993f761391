// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The provider model: immutable descriptions of providers, values,
//! interface bindings, struct-field groups, and injector stubs.
//!
//! Everything here is created by the provider-set parser and never mutated
//! afterwards; the graph resolver and code synthesizer only read it.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::Pos;
use crate::types::TypeKey;

/// One input of a provider.
#[derive(Debug, Clone)]
pub struct ProviderInput {
    /// Canonical type of the input, with any `&` stripped.
    pub ty: TypeKey,
    /// Whether the provider takes this input by shared reference.
    pub by_ref: bool,
    /// For struct providers, the field this input fills.
    pub field_name: Option<String>,
}

/// A function or struct-literal provider.
#[derive(Debug)]
pub struct Provider {
    pub pkg_path: String,
    /// Function name, or the struct name for struct providers.
    pub name: String,
    pub pos: Pos,
    /// Primary output type.
    pub out: TypeKey,
    /// For struct providers, the shared-ownership output (`Arc<T>`).
    pub arc_out: Option<TypeKey>,
    pub inputs: Vec<ProviderInput>,
    pub has_err: bool,
    pub has_cleanup: bool,
    pub is_struct: bool,
}

/// A textually embedded producer declared with `value!` or
/// `interface_value!`.
#[derive(Debug)]
pub struct ValueExpr {
    pub out: TypeKey,
    pub expr: syn::Expr,
    pub pos: Pos,
    /// Set when declared with `interface_value!`; the synthesizer boxes the
    /// expression.
    pub is_interface: bool,
}

/// A `bind!(dyn Iface, Concrete)` declaration.
#[derive(Debug)]
pub struct InterfaceBinding {
    /// The bare `dyn Iface` key the binding is registered under.
    pub iface: TypeKey,
    /// The boxed request type the binding satisfies.
    pub boxed: TypeKey,
    pub concrete: TypeKey,
    pub pos: Pos,
}

/// One output of a `fields_of!` group.
#[derive(Debug)]
pub struct FieldOut {
    pub name: String,
    pub ty: TypeKey,
}

/// A `fields_of!(Parent, a, b)` declaration: a virtual provider whose input
/// is the parent value and whose outputs are the selected fields.
#[derive(Debug)]
pub struct FieldsGroup {
    pub parent: TypeKey,
    pub fields: Vec<FieldOut>,
    pub pos: Pos,
}

/// What produces a given type in a flattened provider set.
///
/// The variants mirror the four producer kinds; accessors panic on a
/// wrong-variant call because a mismatch is always a resolver bug, not a
/// user error.
#[derive(Debug, Clone)]
pub enum ProvidedItem {
    Provider(Arc<Provider>),
    Value(Arc<ValueExpr>),
    Binding(Arc<InterfaceBinding>),
    Fields(Arc<FieldsGroup>, usize),
}

impl ProvidedItem {
    #[must_use]
    pub fn provider(&self) -> &Arc<Provider> {
        match self {
            Self::Provider(p) => p,
            other => panic!("provided item is not a provider: {other:?}"),
        }
    }

    #[must_use]
    pub fn value(&self) -> &Arc<ValueExpr> {
        match self {
            Self::Value(v) => v,
            other => panic!("provided item is not a value: {other:?}"),
        }
    }

    #[must_use]
    pub fn binding(&self) -> &Arc<InterfaceBinding> {
        match self {
            Self::Binding(b) => b,
            other => panic!("provided item is not a binding: {other:?}"),
        }
    }

    /// Short description for duplicate-binding diagnostics.
    #[must_use]
    pub fn describe(&self) -> String {
        match self {
            Self::Provider(p) if p.is_struct => format!("struct provider {}", p.name),
            Self::Provider(p) => format!("provider {}", p.name),
            Self::Value(_) => "value".to_string(),
            Self::Binding(b) => format!("binding to {}", b.concrete),
            Self::Fields(g, i) => format!("field {} of {}", g.fields[*i].name, g.parent),
        }
    }

    #[must_use]
    pub fn pos(&self) -> &Pos {
        match self {
            Self::Provider(p) => &p.pos,
            Self::Value(v) => &v.pos,
            Self::Binding(b) => &b.pos,
            Self::Fields(g, _) => &g.pos,
        }
    }
}

/// A named (or injector-inline) immutable collection of providers.
///
/// `provider_map` is the flattened view: imports are already merged, and
/// each output type has exactly one producer. `src_map` remembers where each
/// entry came from for diagnostics.
#[derive(Debug, Default)]
pub struct ProviderSet {
    pub pkg_path: String,
    /// Static name; empty for the inline set of an injector.
    pub var_name: String,
    pub pos: Pos,
    pub providers: Vec<Arc<Provider>>,
    pub values: Vec<Arc<ValueExpr>>,
    pub bindings: Vec<Arc<InterfaceBinding>>,
    pub fields: Vec<Arc<FieldsGroup>>,
    /// Imported named sets, as `(pkg path, static name)`.
    pub imports: Vec<(String, String)>,
    pub provider_map: BTreeMap<TypeKey, ProvidedItem>,
    pub src_map: BTreeMap<TypeKey, Pos>,
}

/// Parsed signature of an injector stub.
#[derive(Debug)]
pub struct InjectorSig {
    pub out: TypeKey,
    /// The declared error type, if any.
    pub err: Option<TypeKey>,
    pub has_cleanup: bool,
    pub args: Vec<InjectorArg>,
}

/// A positional argument of an injector stub; a root input of the graph.
#[derive(Debug)]
pub struct InjectorArg {
    pub name: String,
    pub ty: TypeKey,
}

/// A declared injector stub and its inline provider set.
pub struct Injector {
    pub pkg_path: String,
    pub fn_name: String,
    /// Index of the stub file within its package.
    pub file_idx: usize,
    pub pos: Pos,
    pub sig: InjectorSig,
    pub set: ProviderSet,
    /// The stub's syntactic signature and visibility, reused verbatim by the
    /// synthesizer.
    pub syn_vis: syn::Visibility,
    pub syn_sig: syn::Signature,
}

impl std::fmt::Debug for Injector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Injector")
            .field("pkg_path", &self.pkg_path)
            .field("fn_name", &self.fn_name)
            .field("sig", &self.sig)
            .finish_non_exhaustive()
    }
}

/// The result of parsing a patterned set of packages.
#[derive(Debug, Default)]
pub struct Info {
    /// Named sets keyed by `(package path, static name)`, deterministic.
    pub sets: BTreeMap<(String, String), Arc<ProviderSet>>,
    pub injectors: Vec<Injector>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_provider() -> ProvidedItem {
        ProvidedItem::Provider(Arc::new(Provider {
            pkg_path: ".".into(),
            name: "new_db".into(),
            pos: Pos::default(),
            out: TypeKey::from_canon("crate::Db".into()),
            arc_out: None,
            inputs: Vec::new(),
            has_err: false,
            has_cleanup: false,
            is_struct: false,
        }))
    }

    #[test]
    fn accessor_returns_matching_variant() {
        let item = sample_provider();
        assert_eq!(item.provider().name, "new_db");
        assert_eq!(item.describe(), "provider new_db");
    }

    #[test]
    #[should_panic(expected = "not a value")]
    fn accessor_panics_on_wrong_variant() {
        let item = sample_provider();
        let _ = item.value();
    }
}
