//! Stable error taxonomy and machine-readable codes.

use serde::{Deserialize, Serialize};

use crate::error::{ConflictError, EngineError};

/// Classes callers can branch on without matching every variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorClass {
    /// Unbound placeholder or undeclared name.
    Binding,
    /// Term does not fit the recorded session type.
    Type,
    /// Persisted pending state is inconsistent.
    Protocol,
    /// Lost an optimistic race; retry from a fresh snapshot.
    Conflict,
    /// Name or id already taken.
    Declaration,
    /// Storage failure.
    Repository,
    /// Cascade ran past its configured bound.
    Cascade,
}

impl ErrorClass {
    /// Only lost races are worth retrying.
    #[must_use]
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorClass::Conflict)
    }

    #[must_use]
    pub fn code(self) -> &'static str {
        match self {
            ErrorClass::Binding => "engine.error.binding",
            ErrorClass::Type => "engine.error.type",
            ErrorClass::Protocol => "engine.error.protocol",
            ErrorClass::Conflict => "engine.error.conflict",
            ErrorClass::Declaration => "engine.error.declaration",
            ErrorClass::Repository => "engine.error.repository",
            ErrorClass::Cascade => "engine.error.cascade",
        }
    }
}

#[must_use]
pub fn classify_error(err: &EngineError) -> ErrorClass {
    match err {
        EngineError::Binding(_) => ErrorClass::Binding,
        EngineError::Type(_) => ErrorClass::Type,
        EngineError::Protocol(_) => ErrorClass::Protocol,
        EngineError::Conflict(
            ConflictError::ConcurrentModification { .. } | ConflictError::PendingConflict { .. },
        ) => ErrorClass::Conflict,
        EngineError::Conflict(
            ConflictError::DuplicateDeclaration { .. } | ConflictError::DuplicateId { .. },
        ) => ErrorClass::Declaration,
        EngineError::Repo(_) => ErrorClass::Repository,
        EngineError::CascadeLimit { .. } => ErrorClass::Cascade,
    }
}

#[must_use]
pub fn error_code_of(err: &EngineError) -> &'static str {
    classify_error(err).code()
}

impl EngineError {
    #[must_use]
    pub fn class(&self) -> ErrorClass {
        classify_error(self)
    }

    #[must_use]
    pub fn is_retryable(&self) -> bool {
        self.class().is_retryable()
    }
}
