//! Error types for multipart uploads

use std::io;
use std::time::Duration;
use thiserror::Error;

/// Object store operation result type
pub type StoreResult<T> = Result<T, StoreError>;

/// Upload operation result type
pub type UploadResult<T> = Result<T, UploadError>;

/// Whether retrying a failed call can be expected to help
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Network blip, server error or rate limit
    Transient,
    /// Bad credentials, malformed request, missing upload
    Permanent,
}

/// Errors reported by an [`ObjectStore`](crate::store::ObjectStore)
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Connection reset, DNS failure, request timeout
    #[error("Transport error: {0}")]
    Transport(String),

    /// Non-2xx response from the store
    #[error("HTTP {status}: {message}")]
    Status { status: u16, message: String },

    /// Upload ID does not exist (never initiated, completed or aborted)
    #[error("Upload ID not found: {0}")]
    NoSuchUpload(String),

    /// A part listed on completion is missing or its etag does not match
    #[error("Invalid part {part_number}: {reason}")]
    InvalidPart { part_number: u32, reason: String },

    /// Parts listed on completion are not in ascending order
    #[error("Parts must be listed in ascending order")]
    InvalidPartOrder,

    /// A non-final part is below the store's minimum part size
    #[error("Part {part_number} is {size} bytes, below the minimum of {min}")]
    EntityTooSmall { part_number: u32, size: u64, min: u64 },

    /// Invalid bucket, key or argument
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Local I/O failure inside the store
    #[error("I/O error ({kind:?}): {message}")]
    Io { kind: io::ErrorKind, message: String },
}

impl StoreError {
    /// Shorthand for an HTTP status error
    pub fn status(status: u16, message: impl Into<String>) -> Self {
        StoreError::Status {
            status,
            message: message.into(),
        }
    }

    /// Classify this error; see [`crate::retry::classify`]
    pub fn kind(&self) -> FailureKind {
        crate::retry::classify(self)
    }

    pub fn is_transient(&self) -> bool {
        self.kind() == FailureKind::Transient
    }
}

impl From<io::Error> for StoreError {
    fn from(err: io::Error) -> Self {
        StoreError::Io {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

/// Terminal error of a whole upload
///
/// Transient part failures are retried locally and never surface here; once
/// the retries run out they are reported as [`UploadError::PartPermanentFailure`].
#[derive(Error, Debug)]
pub enum UploadError {
    /// Bad part size, total size or concurrency
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The store refused to start a multipart upload
    #[error("Failed to initiate multipart upload for {bucket}/{key}: {source}")]
    InitiateFailed {
        bucket: String,
        key: String,
        #[source]
        source: StoreError,
    },

    /// A part failed permanently, or exhausted its retries
    #[error("Part {part_number} failed after {attempts} attempt(s): {source}")]
    PartPermanentFailure {
        part_number: u32,
        attempts: u32,
        #[source]
        source: StoreError,
    },

    /// The payload source could not supply a part's byte range
    #[error("Failed to read part {part_number} from source: {source}")]
    SourceRead {
        part_number: u32,
        #[source]
        source: io::Error,
    },

    /// Direct upload of a single-part payload failed
    #[error("Single-part upload of {bucket}/{key} failed after {attempts} attempt(s): {source}")]
    PutFailed {
        bucket: String,
        key: String,
        attempts: u32,
        #[source]
        source: StoreError,
    },

    /// Every part succeeded but the store rejected completion
    #[error("Failed to complete multipart upload {upload_id}: {source}")]
    CompletionFailed {
        upload_id: String,
        #[source]
        source: StoreError,
    },

    /// Cancelled by the caller
    #[error("Upload cancelled")]
    Cancelled,

    /// The configured upload timeout elapsed
    #[error("Upload timed out after {0:?}")]
    TimedOut(Duration),

    /// A part task panicked
    #[error("Internal error: {0}")]
    Internal(String),
}

impl UploadError {
    /// Part number the failure originated from, if any
    pub fn part_number(&self) -> Option<u32> {
        match self {
            UploadError::PartPermanentFailure { part_number, .. }
            | UploadError::SourceRead { part_number, .. } => Some(*part_number),
            _ => None,
        }
    }

    /// Underlying store error, if the failure came from the store
    pub fn store_error(&self) -> Option<&StoreError> {
        match self {
            UploadError::InitiateFailed { source, .. }
            | UploadError::PartPermanentFailure { source, .. }
            | UploadError::PutFailed { source, .. }
            | UploadError::CompletionFailed { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// Configuration loading errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid config: {0}")]
    Invalid(#[from] validator::ValidationErrors),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_part_number_accessor() {
        let err = UploadError::PartPermanentFailure {
            part_number: 2,
            attempts: 1,
            source: StoreError::status(403, "Forbidden"),
        };
        assert_eq!(err.part_number(), Some(2));
        assert_eq!(err.store_error(), Some(&StoreError::status(403, "Forbidden")));

        let err = UploadError::SourceRead {
            part_number: 7,
            source: io::Error::from(io::ErrorKind::UnexpectedEof),
        };
        assert_eq!(err.part_number(), Some(7));
        assert!(err.store_error().is_none());

        assert_eq!(UploadError::Cancelled.part_number(), None);
    }

    #[test]
    fn test_io_conversion_keeps_kind() {
        let err: StoreError = io::Error::new(io::ErrorKind::TimedOut, "slow disk").into();
        match err {
            StoreError::Io { kind, ref message } => {
                assert_eq!(kind, io::ErrorKind::TimedOut);
                assert!(message.contains("slow disk"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_display_includes_cause() {
        let err = UploadError::CompletionFailed {
            upload_id: "abc".to_string(),
            source: StoreError::InvalidPartOrder,
        };
        let msg = err.to_string();
        assert!(msg.contains("abc"));
        assert!(msg.contains("ascending"));
    }
}
