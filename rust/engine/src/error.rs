//! Error taxonomy for stepping, committing and storage.

use parley_types::{Label, Placeholder, Polarity, ProcName, Shape, TermKind, TypeKey, TypeModelError, TypeName};
use thiserror::Error;
use uuid::Uuid;

use crate::ids::{ChannelId, PoolId, ProcessId};
use crate::ledger::{PendingKind, Revision, Role};

/// The term names something that is not there.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BindingError {
    #[error("placeholder '{placeholder}' is not bound")]
    UnboundPlaceholder { placeholder: Placeholder },

    #[error("placeholder '{placeholder}' is already bound")]
    DuplicatePlaceholder { placeholder: Placeholder },

    #[error("unknown type name '{0}'")]
    UnknownTypeName(TypeName),

    #[error("unknown process name '{0}'")]
    UnknownProcName(ProcName),

    #[error("unknown process {0}")]
    UnknownProcess(ProcessId),

    #[error("unknown pool {0}")]
    UnknownPool(PoolId),

    #[error("process {process_id} belongs to pool {actual}, not {expected}")]
    ForeignProcess {
        process_id: ProcessId,
        expected: PoolId,
        actual: PoolId,
    },

    #[error("no pool or process with id {0}")]
    UnknownId(Uuid),
}

/// The term does not fit the session type recorded for its channels.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TypeError {
    #[error("type mismatch on '{placeholder}': want {want}, got {got}")]
    TypeMismatch {
        placeholder: Placeholder,
        want: Shape,
        got: Shape,
    },

    #[error("label '{label}' not offered on '{placeholder}'")]
    LabelNotFound { placeholder: Placeholder, label: Label },

    #[error("{term} cannot act as {role} on '{placeholder}' at polarity {polarity}")]
    TermKindMismatch {
        placeholder: Placeholder,
        term: TermKind,
        role: Role,
        polarity: Polarity,
    },

    #[error("'{placeholder}' must be held as {want}, found {got}")]
    RoleMismatch {
        placeholder: Placeholder,
        want: Role,
        got: Role,
    },

    #[error("resources left undischarged at '{placeholder}': {leftover:?}")]
    LinearityViolation {
        placeholder: Placeholder,
        leftover: Vec<Placeholder>,
    },

    #[error("process '{proc_name}' takes {want} arguments, got {got}")]
    ArityMismatch {
        proc_name: ProcName,
        want: usize,
        got: usize,
    },

    #[error("ill-formed session type: {0}")]
    Model(TypeModelError),
}

/// Persisted pending state contradicts what a well-typed run produces.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("channel {channel_id}: expected a pending {want}, found {got}")]
    PendingKindMismatch {
        channel_id: ChannelId,
        want: String,
        got: PendingKind,
    },

    #[error("channel {channel_id}: sides disagree on the session state ({want} vs {got})")]
    StateDivergence {
        channel_id: ChannelId,
        want: TypeKey,
        got: TypeKey,
    },

    #[error("{0} terms do not communicate")]
    NotCommunication(TermKind),
}

/// Commit rejected; the store is unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConflictError {
    #[error("pool {pool_id} moved from revision {want} to {got}")]
    ConcurrentModification {
        pool_id: PoolId,
        want: Revision,
        got: Revision,
    },

    #[error("channel {channel_id} pending sequence moved from {want} to {got}")]
    PendingConflict {
        channel_id: ChannelId,
        want: u64,
        got: u64,
    },

    #[error("{kind} '{name}' is already declared")]
    DuplicateDeclaration { kind: &'static str, name: String },

    #[error("{kind} {id} already exists")]
    DuplicateId { kind: &'static str, id: Uuid },
}

/// Storage failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RepoError {
    #[error("{entity} not found: {key}")]
    NotFound { entity: &'static str, key: String },

    #[error("{0} lock poisoned")]
    Poisoned(&'static str),

    #[error("codec error: {0}")]
    Codec(String),
}

impl From<serde_json::Error> for RepoError {
    fn from(err: serde_json::Error) -> Self {
        RepoError::Codec(err.to_string())
    }
}

/// Top-level error of the engine.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    #[error(transparent)]
    Binding(#[from] BindingError),

    #[error(transparent)]
    Type(#[from] TypeError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Conflict(#[from] ConflictError),

    #[error(transparent)]
    Repo(#[from] RepoError),

    #[error("cascade exceeded {limit} steps")]
    CascadeLimit { limit: usize },
}

impl From<TypeModelError> for EngineError {
    fn from(err: TypeModelError) -> Self {
        match err {
            TypeModelError::UnknownTypeName(name) => BindingError::UnknownTypeName(name).into(),
            TypeModelError::UnknownTypeKey(key) => RepoError::NotFound {
                entity: "type node",
                key: key.to_hex(),
            }
            .into(),
            other => TypeError::Model(other).into(),
        }
    }
}

/// Result alias used across the engine.
pub type EngineResult<T> = Result<T, EngineError>;
