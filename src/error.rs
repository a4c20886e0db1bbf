//! Error types for linking.

use thiserror::Error;

/// Errors that can occur while linking a resolved graph.
///
/// Every error aborts linking immediately; the input graph is static, so a
/// retry would reproduce the identical failure. Variants carry the offending
/// names and shapes so a front end can render precise diagnostics.
#[derive(Debug, Error)]
pub enum LinkError {
    /// Failed to parse an input module binary.
    #[error("invalid module '{module}': {message}")]
    Module { module: String, message: String },

    /// Malformed type or instance declaration.
    #[error("invalid definition: {message}")]
    Definition { message: String },

    /// A referenced (instance, function) pair has no concrete provider.
    #[error("unresolved import '{instance}'::'{name}'")]
    UnresolvedImport { instance: String, name: String },

    /// Structural mismatch between a declared import and its provider.
    #[error("signature mismatch for '{name}': expected {expected}, found {found}")]
    SignatureMismatch {
        name: String,
        expected: String,
        found: String,
    },

    /// The instantiation graph has no valid topological order.
    #[error("cyclic dependency between modules: {cycle:?}")]
    CyclicDependency { cycle: Vec<String> },

    /// A declared top-level export cannot be traced to a concrete definition.
    #[error("unresolved export '{name}': {message}")]
    UnresolvedExport { name: String, message: String },

    /// A composed artifact could not be encoded or decoded.
    #[error("invalid artifact: {message}")]
    Artifact { message: String },

    /// An adapter needs scratch memory but no memory/realloc was designated.
    #[error("adapter '{adapter}' requires scratch allocation but no memory and realloc were designated")]
    AllocationUnavailable { adapter: String },
}
