//! Error types for the postrider-store crate.

use std::io;

use postrider_common::{EnvelopeId, MessageId};
use thiserror::Error;

/// Top-level store error type.
///
/// Every store operation returns this, categorizing failures into I/O,
/// id-space exhaustion, validation, and logical errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// I/O operation failed (create/write/rename/delete).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Ran out of attempts drawing a fresh message id.
    #[error("message id space exhausted after {attempts} draws")]
    MessageIdExhausted { attempts: u32 },

    /// Ran out of attempts drawing a fresh envelope id under a message.
    #[error("envelope id space exhausted under {message} after {attempts} draws")]
    EnvelopeIdExhausted { message: MessageId, attempts: u32 },

    /// The referenced message has no directory in incoming or the queue.
    #[error("message not found: {0}")]
    MessageNotFound(MessageId),

    /// The referenced envelope has no file.
    #[error("envelope not found: {0}")]
    EnvelopeNotFound(EnvelopeId),

    /// Store root validation failed.
    #[error("store validation error: {0}")]
    Validation(#[from] ValidationError),
}

/// Store root directory validation errors.
#[derive(Debug, Error)]
pub enum ValidationError {
    /// Root path is relative; the store requires an absolute root.
    #[error("store path is not absolute: {0}")]
    NotAbsolute(String),

    /// Root path contains a parent-directory component.
    #[error("store path contains a parent component: {0}")]
    ParentComponent(String),

    /// Root path points into a protected system directory.
    #[error("store path is a system directory: {0}")]
    SystemDirectory(String),

    /// Root path exists but is not a directory.
    #[error("store path is not a directory: {0}")]
    NotDirectory(String),
}

/// Specialized `Result` type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

impl StoreError {
    /// True for failures the caller should back off and retry later
    /// (disk pressure, id-space contention) rather than treat as permanent.
    #[must_use]
    pub const fn is_exhaustion(&self) -> bool {
        matches!(
            self,
            Self::MessageIdExhausted { .. } | Self::EnvelopeIdExhausted { .. }
        )
    }

    /// True when the failure means the referenced object does not exist.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::MessageNotFound(_) | Self::EnvelopeNotFound(_))
    }
}
