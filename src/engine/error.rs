use ulid::Ulid;

use crate::model::RequestStatus;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// Missing or malformed field. The request is not created.
    Validation {
        field: &'static str,
        reason: &'static str,
    },
    NotFound(Ulid),
    AlreadyExists(Ulid),
    /// Status change not allowed from the request's current state.
    InvalidTransition {
        id: Ulid,
        current: RequestStatus,
        requested: RequestStatus,
    },
    /// Overlaps a confirmed request on the same resource.
    Conflict(Ulid),
    LimitExceeded(&'static str),
    /// Storage or transport failure. Never degrade this to an empty result.
    Unavailable(String),
}

impl EngineError {
    pub(crate) fn missing(field: &'static str) -> Self {
        EngineError::Validation {
            field,
            reason: "required",
        }
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::Validation { field, reason } => {
                write!(f, "invalid {field}: {reason}")
            }
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::InvalidTransition {
                id,
                current,
                requested,
            } => write!(
                f,
                "request {id} is {current}; cannot change status to {requested}"
            ),
            EngineError::Conflict(id) => write!(f, "conflict with confirmed request: {id}"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::Unavailable(e) => write!(f, "store unavailable: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
