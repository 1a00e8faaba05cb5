//! Error taxonomy for the numbering and approval engine
use crate::types::Role;
use crate::workflow::{Action, DocumentKind, Status};

pub type Result<T> = std::result::Result<T, DocflowError>;

#[derive(thiserror::Error, Debug)]
pub enum DocflowError {
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("{role} may not {operation} a {kind}")]
    Forbidden {
        kind: DocumentKind,
        role: Role,
        operation: &'static str,
    },
    #[error("record {0} not found")]
    NotFound(String),
    #[error("{role} may not '{action}' a {kind} in status '{status}'")]
    InvalidTransition {
        kind: DocumentKind,
        status: Status,
        action: Action,
        role: Role,
    },
    #[error("record {id} is '{status}' and cannot be {operation}")]
    ImmutableRecord {
        id: String,
        status: Status,
        operation: &'static str,
    },
    #[error("record {id} left status '{expected}' before the write landed")]
    ConcurrentModification { id: String, expected: Status },
    #[error("no free {kind} number in period '{period}' after {attempts} attempts")]
    AllocationExhausted {
        kind: DocumentKind,
        period: String,
        attempts: u32,
    },
    #[error("storage error: {0}")]
    Storage(#[from] sled::Error),
    #[error("corrupt value under key {key}: {reason}")]
    Corrupt { key: String, reason: String },
    #[error("failed to encode {0}")]
    Encode(String),
}

/// Stable, caller-facing error codes. The calling layer maps these to its
/// own transport (HTTP status, IPC error, ...).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    Validation,
    Forbidden,
    NotFound,
    InvalidTransition,
    ImmutableRecord,
    ConcurrentModification,
    AllocationExhausted,
    Storage,
    Corrupt,
    Encode,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Validation => "VALIDATION_ERROR",
            Self::Forbidden => "FORBIDDEN",
            Self::NotFound => "NOT_FOUND",
            Self::InvalidTransition => "INVALID_TRANSITION",
            Self::ImmutableRecord => "IMMUTABLE_RECORD",
            Self::ConcurrentModification => "CONCURRENT_MODIFICATION",
            Self::AllocationExhausted => "ALLOCATION_EXHAUSTED",
            Self::Storage => "STORAGE_ERROR",
            Self::Corrupt => "CORRUPT_DATA",
            Self::Encode => "ENCODE_ERROR",
        }
    }

    pub fn http_status(&self) -> u16 {
        match self {
            Self::Validation => 400,
            Self::Forbidden => 403,
            Self::NotFound => 404,
            Self::InvalidTransition | Self::ImmutableRecord | Self::ConcurrentModification => 409,
            Self::AllocationExhausted => 503,
            Self::Storage | Self::Corrupt | Self::Encode => 500,
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl DocflowError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Validation(_) => ErrorCode::Validation,
            Self::Forbidden { .. } => ErrorCode::Forbidden,
            Self::NotFound(_) => ErrorCode::NotFound,
            Self::InvalidTransition { .. } => ErrorCode::InvalidTransition,
            Self::ImmutableRecord { .. } => ErrorCode::ImmutableRecord,
            Self::ConcurrentModification { .. } => ErrorCode::ConcurrentModification,
            Self::AllocationExhausted { .. } => ErrorCode::AllocationExhausted,
            Self::Storage(_) => ErrorCode::Storage,
            Self::Corrupt { .. } => ErrorCode::Corrupt,
            Self::Encode(_) => ErrorCode::Encode,
        }
    }

    /// Whether the same request may succeed if the caller retries it
    /// (after reloading the record, or after a backoff).
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ConcurrentModification { .. } | Self::AllocationExhausted { .. } | Self::Storage(_)
        )
    }

    /// Text suitable for showing to the person who made the request.
    pub fn user_message(&self) -> String {
        match self {
            Self::ConcurrentModification { .. } => {
                "This document was changed by someone else. Please reload and retry.".to_string()
            }
            Self::AllocationExhausted { .. } => {
                "Could not assign a document number right now. Please retry shortly.".to_string()
            }
            Self::Storage(_) | Self::Corrupt { .. } | Self::Encode(_) => {
                "An internal error occurred while saving the document.".to_string()
            }
            other => other.to_string(),
        }
    }

    pub(crate) fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub(crate) fn corrupt(key: impl AsRef<[u8]>, reason: impl std::fmt::Display) -> Self {
        Self::Corrupt {
            key: String::from_utf8_lossy(key.as_ref()).into_owned(),
            reason: reason.to_string(),
        }
    }
}

impl<E: std::fmt::Display> From<minicbor::encode::Error<E>> for DocflowError {
    fn from(err: minicbor::encode::Error<E>) -> Self {
        Self::Encode(err.to_string())
    }
}
