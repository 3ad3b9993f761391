// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

/// A position in a loaded source file, used to anchor diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct Pos {
    pub file: PathBuf,
    pub line: usize,
    pub column: usize,
}

impl Pos {
    /// Builds a position from a span inside the named file.
    pub fn new(file: impl Into<PathBuf>, span: proc_macro2::Span) -> Self {
        let start = span.start();
        Self {
            file: file.into(),
            line: start.line,
            column: start.column + 1,
        }
    }
}

impl fmt::Display for Pos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.file.display(), self.line, self.column)
    }
}

/// Any error reported by the generator core.
///
/// All resolution errors for one injector are collected and returned
/// together; one injector's failures never mask another's. Cache I/O never
/// produces an `Error` at all, it silently degrades to a cache miss.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// The package loader could not produce a usable package.
    #[error("load: {0}")]
    Loader(String),

    /// A malformed `new_set!`/`construct!`/`fields_of!`/`bind!`/`value!`
    /// declaration.
    #[error("{pos}: {msg}")]
    InvalidSetDeclaration { pos: Pos, msg: String },

    /// Two providers in one set produce the same output type.
    #[error("{second}: duplicate provider for {ty}; already provided by {first_desc} at {first}")]
    DuplicateBinding {
        ty: String,
        first: Pos,
        first_desc: String,
        second: Pos,
    },

    /// Provider sets import one another cyclically.
    #[error("provider set import cycle: {cycle}")]
    ImportCycle { cycle: String },

    /// A required type has no producer; the chain walks from the missing
    /// type back to the injector root.
    #[error("{pos}: no provider found for {ty}{demand}", demand = format_chain(.chain))]
    MissingProvider {
        ty: String,
        pos: Pos,
        chain: Vec<String>,
    },

    /// Providers form a dependency cycle.
    #[error("{pos}: cycle in providers: {cycle}")]
    ProviderCycle { pos: Pos, cycle: String },

    /// A selected provider returns a cleanup but the injector signature does
    /// not declare one.
    #[error("{pos}: injector {injector} needs a cleanup return because provider {provider} returns one")]
    CleanupRequired {
        pos: Pos,
        injector: String,
        provider: String,
    },

    /// A selected provider returns an error but the injector signature does
    /// not declare one.
    #[error("{pos}: injector {injector} needs an error return because provider {provider} returns one")]
    ErrorRequired {
        pos: Pos,
        injector: String,
        provider: String,
    },

    /// The concrete type of a `bind!` does not implement the interface.
    #[error("{pos}: {concrete} does not implement {iface}")]
    BindingTypeMismatch {
        pos: Pos,
        iface: String,
        concrete: String,
    },

    /// An injector body is not a single `build!` statement.
    #[error("{pos}: injector {injector} must consist of exactly one build! call")]
    InvalidInjectorShape { pos: Pos, injector: String },

    /// The synthesized source failed to re-parse; raw bytes are still
    /// returned alongside this error.
    #[error("format generated source: {0}")]
    Format(String),

    /// A file-system failure outside the cache.
    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The run was canceled through the context's cancel token.
    #[error("operation canceled")]
    Canceled,
}

fn format_chain(chain: &[String]) -> String {
    let mut out = String::new();
    for link in chain {
        out.push_str("\n\tneeded by ");
        out.push_str(link);
    }
    out
}

/// A specialized `Result` for generator operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pos_display() {
        let pos = Pos {
            file: PathBuf::from("app/stub.rs"),
            line: 12,
            column: 5,
        };
        assert_eq!(pos.to_string(), "app/stub.rs:12:5");
    }

    #[test]
    fn missing_provider_renders_chain() {
        let err = Error::MissingProvider {
            ty: "crate::db::Pool".to_string(),
            pos: Pos {
                file: PathBuf::from("app/stub.rs"),
                line: 3,
                column: 1,
            },
            chain: vec![
                "crate::App (provider new_app)".to_string(),
                "injector init_app".to_string(),
            ],
        };
        let text = err.to_string();
        assert!(text.contains("no provider found for crate::db::Pool"));
        assert!(text.contains("needed by crate::App (provider new_app)"));
        assert!(text.contains("needed by injector init_app"));
    }
}
