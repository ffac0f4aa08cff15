//! Error types for the transfer core and their HTTP rendering.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use thiserror::Error;

use crate::models::ErrorResponse;

pub type Result<T> = std::result::Result<T, TransferError>;

/// Coarse classification of every failure the core can report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    Conflict,
    Validation,
    IntegrityFailure,
    AccessDenied,
    StorageFailure,
    Incomplete,
}

#[derive(Error, Debug)]
pub enum TransferError {
    #[error("upload session not found: {0}")]
    SessionNotFound(String),

    #[error("file not found: {0}")]
    FileNotFound(String),

    #[error("upload session already exists: {0}")]
    AlreadyExists(String),

    #[error("upload already completed: {0}")]
    AlreadyComplete(String),

    #[error("completed uploads cannot be deleted: {0}")]
    CompletedImmutable(String),

    #[error("chunk index {index} out of range (total chunks {total})")]
    IndexOutOfRange { index: usize, total: usize },

    #[error("empty chunk payload")]
    EmptyPayload,

    #[error("payload of {size} bytes exceeds the {limit} byte limit")]
    PayloadTooLarge { size: u64, limit: u64 },

    #[error("invalid session descriptor: {0}")]
    InvalidDescriptor(String),

    #[error("share_id is required")]
    MissingShareId,

    #[error("chunk {index} hash mismatch")]
    HashMismatch {
        index: usize,
        expected: String,
        actual: String,
    },

    #[error("overall file hash mismatch")]
    FileHashMismatch { expected: String, actual: String },

    #[error("missing chunks: {missing:?}")]
    Incomplete {
        missing: Vec<usize>,
        received: usize,
        total: usize,
    },

    #[error("chunk {0} disappeared during assembly")]
    ChunkMissingDuringAssembly(usize),

    #[error("access denied: invalid share id")]
    AccessDenied,

    #[error("storage unavailable: {0}")]
    StorageUnavailable(#[source] std::io::Error),

    #[error("{context}: {source}")]
    Storage {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("corrupt session metadata for {upload_id}: {source}")]
    CorruptMetadata {
        upload_id: String,
        #[source]
        source: serde_json::Error,
    },
}

impl TransferError {
    /// wrap an io error with a description of what was being attempted
    pub fn storage(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Storage {
            context: context.into(),
            source,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::SessionNotFound(_) | Self::FileNotFound(_) => ErrorKind::NotFound,
            Self::AlreadyExists(_) | Self::AlreadyComplete(_) | Self::CompletedImmutable(_) => {
                ErrorKind::Conflict
            }
            Self::IndexOutOfRange { .. }
            | Self::EmptyPayload
            | Self::PayloadTooLarge { .. }
            | Self::InvalidDescriptor(_)
            | Self::MissingShareId => ErrorKind::Validation,
            Self::HashMismatch { .. } | Self::FileHashMismatch { .. } => {
                ErrorKind::IntegrityFailure
            }
            Self::Incomplete { .. } | Self::ChunkMissingDuringAssembly(_) => ErrorKind::Incomplete,
            Self::AccessDenied => ErrorKind::AccessDenied,
            Self::StorageUnavailable(_) | Self::Storage { .. } | Self::CorruptMetadata { .. } => {
                ErrorKind::StorageFailure
            }
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self.kind() {
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::Conflict => StatusCode::CONFLICT,
            ErrorKind::Validation => match self {
                Self::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
                _ => StatusCode::BAD_REQUEST,
            },
            ErrorKind::IntegrityFailure => StatusCode::UNPROCESSABLE_ENTITY,
            ErrorKind::AccessDenied => StatusCode::FORBIDDEN,
            ErrorKind::StorageFailure => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorKind::Incomplete => StatusCode::BAD_REQUEST,
        }
    }

    fn code(&self) -> &'static str {
        match self {
            Self::SessionNotFound(_) => "SESSION_NOT_FOUND",
            Self::FileNotFound(_) => "FILE_NOT_FOUND",
            Self::AlreadyExists(_) => "SESSION_EXISTS",
            Self::AlreadyComplete(_) => "ALREADY_COMPLETE",
            Self::CompletedImmutable(_) => "COMPLETED_IMMUTABLE",
            Self::IndexOutOfRange { .. } => "INDEX_OUT_OF_RANGE",
            Self::EmptyPayload => "EMPTY_PAYLOAD",
            Self::PayloadTooLarge { .. } => "PAYLOAD_TOO_LARGE",
            Self::InvalidDescriptor(_) => "INVALID_DESCRIPTOR",
            Self::MissingShareId => "SHARE_ID_REQUIRED",
            Self::HashMismatch { .. } => "CHUNK_HASH_MISMATCH",
            Self::FileHashMismatch { .. } => "FILE_HASH_MISMATCH",
            Self::Incomplete { .. } => "INCOMPLETE_UPLOAD",
            Self::ChunkMissingDuringAssembly(_) => "CHUNK_MISSING",
            Self::AccessDenied => "ACCESS_DENIED",
            Self::StorageUnavailable(_) | Self::Storage { .. } | Self::CorruptMetadata { .. } => {
                "STORAGE_ERROR"
            }
        }
    }
}

impl IntoResponse for TransferError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let mut body = ErrorResponse::new(self.code(), String::new());

        match &self {
            Self::StorageUnavailable(_) | Self::Storage { .. } | Self::CorruptMetadata { .. } => {
                // full context stays in the log, the client gets an opaque message
                tracing::error!("❌ Storage failure: {}", self);
                body.error = "internal storage error".to_string();
            }
            Self::HashMismatch {
                index,
                expected,
                actual,
            } => {
                body.error = self.to_string();
                body.chunk_index = Some(*index);
                body.expected = Some(expected.clone());
                body.actual = Some(actual.clone());
            }
            Self::FileHashMismatch { expected, actual } => {
                body.error = self.to_string();
                body.expected = Some(expected.clone());
                body.actual = Some(actual.clone());
            }
            Self::Incomplete {
                missing,
                received,
                total,
            } => {
                body.error = self.to_string();
                body.missing_chunks = Some(missing.clone());
                body.received_count = Some(*received);
                body.total_chunks = Some(*total);
            }
            Self::ChunkMissingDuringAssembly(index) => {
                body.error = self.to_string();
                body.missing_chunks = Some(vec![*index]);
            }
            _ => body.error = self.to_string(),
        }

        (status, Json(body)).into_response()
    }
}
