// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Marker macros and types for the solder code generator.
//!
//! Solder is a compile-time dependency-injection tool: you describe what your
//! application needs with provider sets and injector stubs, and `cargo solder`
//! writes the initialization code for you as an ordinary source file.
//!
//! Nothing in this crate does anything at runtime. The macros exist so that
//! stub files (gated behind the `solderinject` cfg) compile on their own; the
//! generator recognizes the macro invocations by name and replaces the stubs
//! with real code in a generated `solder_gen.rs` file carrying the opposite
//! cfg.
//!
//! # Example
//!
//! ```ignore
//! #![cfg(solderinject)]
//!
//! use solder::{build, new_set};
//!
//! static APP_SET: solder::ProviderSet = new_set!(new_db, new_greeter, App);
//!
//! fn init_app(cfg: Config) -> Result<App, AppError> {
//!     build!(APP_SET)
//! }
//! ```

/// An opaque handle naming a collection of providers.
///
/// Declare one as a `static` initialized with [`new_set!`]; reference it from
/// other sets or from [`build!`] calls by its path.
pub struct ProviderSet {
    _priv: (),
}

impl ProviderSet {
    /// Returns the inert placeholder value that [`new_set!`] expands to.
    #[must_use]
    pub const fn new() -> Self {
        Self { _priv: () }
    }
}

/// A deferred teardown action returned alongside a resource.
///
/// Providers that acquire resources return `(T, Cleanup)`; the generated
/// injector combines them into one closure that releases everything in
/// reverse acquisition order.
pub type Cleanup = Box<dyn FnOnce()>;

/// Declares a provider set from a list of items.
///
/// Items may be function paths, struct type paths, other set statics, or the
/// [`bind!`], [`value!`], [`interface_value!`], [`construct!`], and
/// [`fields_of!`] markers. The generator interprets the item list; the macro
/// itself only produces a [`ProviderSet`] placeholder.
#[macro_export]
macro_rules! new_set {
    ($($item:tt)*) => {
        $crate::ProviderSet::new()
    };
}

/// The body of an injector stub.
///
/// An injector is a function whose body is exactly one `build!` call. The
/// macro diverges so the stub typechecks with any signature; the generator
/// replaces it with the real initialization sequence.
#[macro_export]
macro_rules! build {
    ($($item:tt)*) => {
        ::core::panic!("this injector stub was not replaced by generated code")
    };
}

/// Binds an interface to a concrete provider: `bind!(dyn Greeter, NiceGreeter)`.
///
/// Only meaningful inside [`new_set!`] or [`build!`].
#[macro_export]
macro_rules! bind {
    ($($item:tt)*) => {
        ()
    };
}

/// Embeds an expression as the provider of a type: `value!(Config, Config::default())`.
///
/// Only meaningful inside [`new_set!`] or [`build!`].
#[macro_export]
macro_rules! value {
    ($($item:tt)*) => {
        ()
    };
}

/// Embeds an expression as the provider of a boxed interface:
/// `interface_value!(dyn Write, std::io::sink())`.
///
/// Only meaningful inside [`new_set!`] or [`build!`].
#[macro_export]
macro_rules! interface_value {
    ($($item:tt)*) => {
        ()
    };
}

/// Declares a struct provider filling the named fields from the graph:
/// `construct!(App, db, greeter)`, or `construct!(App, *)` for all fields.
///
/// Fields annotated `#[solder(skip)]` are never filled. Only meaningful
/// inside [`new_set!`] or [`build!`].
#[macro_export]
macro_rules! construct {
    ($($item:tt)*) => {
        ()
    };
}

/// Projects named fields out of a parent value: `fields_of!(Config, host, port)`.
///
/// Only meaningful inside [`new_set!`] or [`build!`].
#[macro_export]
macro_rules! fields_of {
    ($($item:tt)*) => {
        ()
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_set_is_const_constructible() {
        static SET: ProviderSet = ProviderSet::new();
        let _ = &SET;
    }

    #[test]
    fn markers_expand_to_placeholders() {
        static SET: ProviderSet = new_set!(a, b, c);
        let _ = &SET;
        let _: () = bind!(dyn Greeter, NiceGreeter);
        let _: () = value!(u32, 7);
        let _: () = construct!(App, *);
    }
}
