//! Error types for declaration, planning and state operations
//!
//! Everything here surfaces before the provider is touched, or while
//! reading and writing the state store. Provider failures live in
//! [`crate::provider::ProviderError`] and are contained per operation.

use std::path::PathBuf;
use thiserror::Error;

/// Errors that abort a run before or outside operation execution
#[derive(Debug, Error)]
pub enum Error {
    /// A node's property bag does not match its kind's schema
    #[error("schema violation in '{node}': {message}")]
    SchemaViolation { node: String, message: String },

    /// Two nodes share a logical id
    #[error("duplicate resource id '{0}'")]
    DuplicateNode(String),

    /// A dependency (explicit or via a deferred reference) names no declared node
    #[error("'{node}' depends on undeclared resource '{missing}'")]
    UnknownDependency { node: String, missing: String },

    /// The dependency relation contains a cycle
    #[error("cyclic dependency: {}", .cycle.join(" -> "))]
    CyclicDependency {
        /// Full cycle path, first node repeated at the end
        cycle: Vec<String>,
    },

    /// The persisted state cannot be trusted; an operator must resolve it
    #[error("state is corrupt ({location}): {message}")]
    StateCorrupt { location: String, message: String },

    /// Another run holds the state lock
    #[error("state is locked by another run: {}", .0.display())]
    StateLocked(PathBuf),

    /// An immutable field changed and the replace policy forbids replacement
    #[error(
        "'{node}' changes immutable field(s) {}; replacement is not allowed by policy",
        .fields.join(", ")
    )]
    ImmutableChange { node: String, fields: Vec<String> },

    /// A plan target names no declared node or state record
    #[error("unknown target '{0}'")]
    UnknownTarget(String),

    /// A plan operation names a node missing from the graph it runs against
    #[error("plan operation '{0}' has no declared node")]
    PlanMismatch(String),

    /// The worker pool could not be started
    #[error("failed to create worker pool: {0}")]
    WorkerPool(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub(crate) fn schema(node: &str, message: impl Into<String>) -> Self {
        Self::SchemaViolation {
            node: node.to_string(),
            message: message.into(),
        }
    }

    pub(crate) fn corrupt(location: impl Into<String>, message: impl Into<String>) -> Self {
        Self::StateCorrupt {
            location: location.into(),
            message: message.into(),
        }
    }

    /// Short taxonomy label used in reports
    pub fn label(&self) -> &'static str {
        match self {
            Self::SchemaViolation { .. } => "SchemaViolation",
            Self::DuplicateNode(_) => "DuplicateNode",
            Self::UnknownDependency { .. } => "UnknownDependency",
            Self::CyclicDependency { .. } => "CyclicDependency",
            Self::StateCorrupt { .. } => "StateCorrupt",
            Self::StateLocked(_) => "StateLocked",
            Self::ImmutableChange { .. } => "ImmutableChange",
            Self::UnknownTarget(_) => "UnknownTarget",
            Self::PlanMismatch(_) => "PlanMismatch",
            Self::WorkerPool(_) => "WorkerPool",
            Self::Io(_) => "Io",
        }
    }
}

/// Result type for stackgraph operations
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cycle_message_shows_path() {
        let err = Error::CyclicDependency {
            cycle: vec!["a".into(), "b".into(), "a".into()],
        };
        assert_eq!(err.to_string(), "cyclic dependency: a -> b -> a");
        assert_eq!(err.label(), "CyclicDependency");
    }
}
