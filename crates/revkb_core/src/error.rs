//! Error types for revkb core.

use revkb_codec::{ObjectKey, RevisionNumber};
use thiserror::Error;

use crate::context::MergeConflict;
use crate::validity::ValidityError;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors that can occur in knowledge base operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Storage backend error.
    #[error("storage error: {0}")]
    Storage(#[from] revkb_storage::StorageError),

    /// Codec error.
    #[error("codec error: {0}")]
    Codec(#[from] revkb_codec::CodecError),

    /// Read or write against an object that is not alive at the access revision.
    #[error("{key} is not alive at revision {revision}: {detail}")]
    DeletedObjectAccess {
        /// The accessed object.
        key: ObjectKey,
        /// Revision of the access.
        revision: RevisionNumber,
        /// Human readable reason, naming the dead range when known.
        detail: String,
        /// First and last revision of the dead range, when known.
        dead_range: Option<(RevisionNumber, RevisionNumber)>,
    },

    /// Commit or session refresh conflicted with concurrent commits.
    #[error("concurrent modification: {}", format_conflicts(.conflicts))]
    ConcurrentModification {
        /// Every detected conflict.
        conflicts: Vec<MergeConflict>,
    },

    /// A link endpoint resolves to an object that no longer exists.
    #[error("dangling reference from link {link} to {target}")]
    DanglingReference {
        /// The link item.
        link: ObjectKey,
        /// The missing endpoint.
        target: ObjectKey,
    },

    /// Mutation of a historic, immutable or system object.
    #[error("{key} is immutable: {message}")]
    ImmutabilityViolation {
        /// The object.
        key: ObjectKey,
        /// Why it is immutable.
        message: String,
    },

    /// The durable id sequence could not be advanced.
    #[error("id allocation failed for sequence {sequence}: {source}")]
    AllocationFailure {
        /// Sequence name.
        sequence: String,
        /// Underlying storage error.
        #[source]
        source: revkb_storage::StorageError,
    },

    /// Validity chain or cache bookkeeping broke an invariant. Always a logic
    /// defect.
    #[error("invariant violation: {0}")]
    InvariantViolation(#[from] ValidityError),

    /// The transaction context was already committed or rolled back.
    #[error("transaction context {context} is closed ({state})")]
    TransactionClosed {
        /// Context id.
        context: u64,
        /// Terminal state name.
        state: &'static str,
    },

    /// A query cache was read after `invalidate()`.
    #[error("query cache {name} was invalidated")]
    InvalidatedCache {
        /// Query name.
        name: String,
    },

    /// Attribute is not declared by the type.
    #[error("type {type_name} has no attribute {attribute}")]
    NoSuchAttribute {
        /// Type name.
        type_name: String,
        /// Attribute name.
        attribute: String,
    },

    /// Type is not registered.
    #[error("unknown type {0}")]
    UnknownType(String),

    /// A value does not fit the attribute or type it is used for.
    #[error("type mismatch: {message}")]
    TypeMismatch {
        /// Description.
        message: String,
    },

    /// A new object was accessed from outside the context that created it.
    #[error("{key} was created by context {owner} and is not visible here")]
    ForeignContext {
        /// The new object.
        key: ObjectKey,
        /// Creating context id.
        owner: u64,
    },

    /// Operation not permitted in current state.
    #[error("invalid operation: {message}")]
    InvalidOperation {
        /// Description of why operation is invalid.
        message: String,
    },
}

fn format_conflicts(conflicts: &[MergeConflict]) -> String {
    conflicts
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl CoreError {
    /// Create an invalid operation error.
    pub fn invalid_operation(message: impl Into<String>) -> Self {
        Self::InvalidOperation {
            message: message.into(),
        }
    }

    /// Create a type mismatch error.
    pub fn type_mismatch(message: impl Into<String>) -> Self {
        Self::TypeMismatch {
            message: message.into(),
        }
    }

    /// Create an immutability violation error.
    pub fn immutable(key: &ObjectKey, message: impl Into<String>) -> Self {
        Self::ImmutabilityViolation {
            key: key.clone(),
            message: message.into(),
        }
    }

    /// Create a no-such-attribute error.
    pub fn no_such_attribute(type_name: &str, attribute: &str) -> Self {
        Self::NoSuchAttribute {
            type_name: type_name.to_string(),
            attribute: attribute.to_string(),
        }
    }

    /// Returns true for errors a caller may resolve by retrying with fresh
    /// reads.
    #[must_use]
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::ConcurrentModification { .. })
    }

    /// The conflicts of a `ConcurrentModification`, empty otherwise.
    #[must_use]
    pub fn conflicts(&self) -> &[MergeConflict] {
        match self {
            Self::ConcurrentModification { conflicts } => conflicts,
            _ => &[],
        }
    }
}
