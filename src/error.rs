//! Stream index errors
//!
//! Every failure is classified into one of three policies:
//! - missing node: the targeted activity, identity or bucket is gone
//! - concurrent modification: another writer already applied the mutation
//! - other: anything else, recorded on the event context

use thiserror::Error;

pub type Result<T> = std::result::Result<T, StreamError>;

/// What kind of stored object an operation failed to find.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Activity,
    Identity,
    Space,
}

impl std::fmt::Display for NodeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            NodeKind::Activity => "activity",
            NodeKind::Identity => "identity",
            NodeKind::Space => "space",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StreamError {
    #[error("{kind} not found: {id}")]
    NotFound { kind: NodeKind, id: String },

    #[error("concurrent modification: {0}")]
    ConcurrentModification(String),

    #[error("backend error: {0}")]
    Backend(String),

    #[error("invalid configuration: {0}")]
    Config(String),
}

/// Logging/propagation policy for an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorPolicy {
    /// Abort the current single-identity step only.
    SkipStep,
    /// Benign race, warn and continue.
    Converged,
    /// Record on the event context.
    Record,
}

impl StreamError {
    pub fn not_found(kind: NodeKind, id: impl Into<String>) -> Self {
        StreamError::NotFound {
            kind,
            id: id.into(),
        }
    }

    pub fn policy(&self) -> ErrorPolicy {
        match self {
            StreamError::NotFound { .. } => ErrorPolicy::SkipStep,
            StreamError::ConcurrentModification(_) => ErrorPolicy::Converged,
            StreamError::Backend(_) | StreamError::Config(_) => ErrorPolicy::Record,
        }
    }
}
