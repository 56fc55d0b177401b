//! Error types for vaultsync
//!
//! This module defines every error that can surface from a sync run. The
//! variants follow the failure taxonomy of the engine:
//!
//! - **Transport**: the remote store could not be reached or answered with a
//!   server error. Retried with backoff by the store client and surfaced only
//!   after the retry budget is exhausted.
//! - **Conflict**: a conditional document write was rejected because the
//!   revision moved. Expected under concurrent writers; handled by re-planning.
//! - **Corruption**: a document references a chunk the store cannot resolve.
//!   Fatal for that one document only.
//! - **AlgorithmMismatch**: recorded chunk ids differ from the canonical
//!   chunking of the content. Drives the repair flow.
//! - **MalformedDocument**: a file record exists but its body does not
//!   decode. Reported for that path; the run continues.
//!
//! "Not found" is an expected outcome (new paths, missing chunks) and is
//! expressed as `Option` by the store API rather than as an error.

use std::path::PathBuf;
use thiserror::Error;

/// Type alias for Results in vaultsync
pub type Result<T> = std::result::Result<T, SyncError>;

/// Main error type for all sync operations
#[derive(Debug, Error)]
pub enum SyncError {
    /// I/O errors during file operations
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Errors during JSON serialization/deserialization
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Errors during bincode serialization/deserialization
    #[error("Bincode error: {0}")]
    Bincode(String),

    /// Remote store unreachable or failing after all retries
    #[error("Transport error: {message}")]
    Transport {
        /// Description of the last failure
        message: String,
        /// Whether another attempt may succeed
        retryable: bool,
    },

    /// Unexpected HTTP status from the remote store
    #[error("HTTP {status} from {url}: {body}")]
    Http {
        /// Status code
        status: u16,
        /// Request URL
        url: String,
        /// Truncated response body
        body: String,
    },

    /// Credentials rejected by the remote store
    #[error("Unauthorized ({status}) for {url}")]
    Unauthorized {
        /// Status code (401 or 403)
        status: u16,
        /// Request URL
        url: String,
    },

    /// Document revision moved since it was read
    #[error("Revision conflict on {path}")]
    Conflict {
        /// Path of the conflicting document
        path: String,
    },

    /// Document references a chunk that cannot be resolved
    #[error("Corrupt document {path}: missing chunk {chunk_id}")]
    Corruption {
        /// Path of the damaged document
        path: String,
        /// Chunk id the store could not return
        chunk_id: String,
    },

    /// Recorded chunk ids do not match the canonical algorithm
    #[error("Chunk id scheme mismatch on {path}: {mismatched} ids differ from the canonical chunking")]
    AlgorithmMismatch {
        /// Path of the affected document
        path: String,
        /// Recorded ids that are not canonical
        mismatched: usize,
    },

    /// File record whose body does not decode
    #[error("Malformed document {path}: {message}")]
    MalformedDocument {
        /// Path of the record
        path: String,
        /// Decoder message
        message: String,
    },

    /// Path escapes the vault or is otherwise unusable
    #[error("Invalid path: {0}")]
    InvalidPath(String),

    /// File content is not valid UTF-8 text
    #[error("Not a text file: {path:?}")]
    NotText {
        /// Path to the file
        path: PathBuf,
    },

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Thread pool error
    #[error("Thread pool error: {0}")]
    ThreadPool(String),

    /// Walk directory error from walkdir crate
    #[error("Walk directory error: {0}")]
    WalkDir(#[from] walkdir::Error),

    /// Exclude pattern could not be compiled
    #[error("Invalid exclude pattern: {0}")]
    Pattern(#[from] globset::Error),

    /// Generic error for unexpected conditions
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<bincode::error::DecodeError> for SyncError {
    fn from(err: bincode::error::DecodeError) -> Self {
        SyncError::Bincode(err.to_string())
    }
}

impl From<bincode::error::EncodeError> for SyncError {
    fn from(err: bincode::error::EncodeError) -> Self {
        SyncError::Bincode(err.to_string())
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_builder() {
            return SyncError::InvalidConfiguration(err.to_string());
        }
        // A body that failed to decode fails the same way on every attempt
        SyncError::Transport {
            message: err.to_string(),
            retryable: !err.is_decode(),
        }
    }
}

impl SyncError {
    /// Create a retryable transport error
    pub fn transport(msg: impl Into<String>) -> Self {
        SyncError::Transport {
            message: msg.into(),
            retryable: true,
        }
    }

    /// Create an internal error with a custom message
    pub fn internal(msg: impl Into<String>) -> Self {
        SyncError::Internal(msg.into())
    }

    /// Create a conflict error for a path
    pub fn conflict(path: impl Into<String>) -> Self {
        SyncError::Conflict { path: path.into() }
    }

    /// Check if another attempt of the same request may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, SyncError::Transport { retryable: true, .. })
    }

    /// Check if this error is a revision conflict
    pub fn is_conflict(&self) -> bool {
        matches!(self, SyncError::Conflict { .. })
    }

    /// Check if this error indicates corrupt remote state
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            SyncError::Corruption { .. } | SyncError::AlgorithmMismatch { .. }
        )
    }

    /// Check if the whole run must stop
    ///
    /// Per-path failures are isolated; these mean no further progress is
    /// possible against the store. A non-retryable transport error concerns
    /// one response only.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SyncError::Transport { retryable: true, .. }
                | SyncError::Unauthorized { .. }
                | SyncError::InvalidConfiguration(_)
                | SyncError::ThreadPool(_)
        )
    }

    /// Get a user-friendly error message with suggestions
    pub fn user_message(&self) -> String {
        match self {
            SyncError::Unauthorized { url, .. } => {
                format!("The store rejected our credentials at {}. Check COUCHDB_USER and COUCHDB_PASSWORD.", url)
            }
            SyncError::Transport { message, .. } => {
                format!("Could not reach the store ({}). Check COUCHDB_URI and your network, then retry.", message)
            }
            SyncError::Conflict { path } => {
                format!("{} changed on both sides since the last sync. Resolve it manually, then rerun.", path)
            }
            SyncError::Corruption { path, chunk_id } => {
                format!("{} references missing chunk {}. Re-push the file from a healthy copy.", path, chunk_id)
            }
            SyncError::AlgorithmMismatch { path, .. } => {
                format!("{} uses non-canonical chunk ids. Run `vaultsync repair` to regenerate it.", path)
            }
            SyncError::MalformedDocument { path, .. } => {
                format!("The remote record for {} cannot be read. Fix or delete it in the database, then rerun.", path)
            }
            SyncError::InvalidConfiguration(msg) => {
                format!("{}. Set it in the environment or in the .env file.", msg)
            }
            _ => self.to_string(),
        }
    }
}
