use std::path::PathBuf;

use reqwest::StatusCode;

use crate::model::Track;

/// Failure of a single retrieval attempt.
#[derive(Debug, thiserror::Error)]
pub enum FetchAttemptError {
    #[error("HTTP request failed: {source}")]
    Network {
        #[from]
        source: reqwest::Error,
    },

    #[error("request failed with HTTP {status} for {url}")]
    HttpStatus { status: StatusCode, url: String },

    #[error("failed to read local segment {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid segment location `{location}`: {reason}")]
    InvalidLocation { location: String, reason: String },
}

impl FetchAttemptError {
    pub fn http_status(status: StatusCode, url: impl Into<String>) -> Self {
        Self::HttpStatus {
            status,
            url: url.into(),
        }
    }

    pub fn invalid_location(location: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidLocation {
            location: location.into(),
            reason: reason.into(),
        }
    }

    /// Every transport, status and local read failure is retried. Only a
    /// location that can never be resolved is permanent.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Network { .. } | Self::HttpStatus { .. } | Self::Io { .. } => true,
            Self::InvalidLocation { .. } => false,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("failed to fetch {location} after {attempts} attempt(s): {source}")]
    Exhausted {
        location: String,
        attempts: u32,
        #[source]
        source: FetchAttemptError,
    },

    #[error("fetch of {location} rejected: {source}")]
    Rejected {
        location: String,
        #[source]
        source: FetchAttemptError,
    },

    #[error("fetch cancelled")]
    Cancelled,
}

#[derive(Debug, thiserror::Error)]
pub enum DecryptionError {
    #[error("invalid key length: expected 16 bytes, got {0}")]
    InvalidKeyLength(usize),

    #[error("failed to decode IV '{iv}': {source}")]
    InvalidIv {
        iv: String,
        #[source]
        source: hex::FromHexError,
    },

    #[error("invalid IV length: expected 16 bytes, got {0}")]
    InvalidIvLength(usize),

    #[error("ciphertext length {0} is not a multiple of the 16-byte block size")]
    Misaligned(usize),

    #[error("segment index {0} does not fit a 32-bit sequence IV")]
    IndexOutOfRange(usize),

    #[error("decryption offload task failed: {0}")]
    Offload(String),
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("failed to create temp directory under {}: {source}", root.display())]
    CreateTempDir {
        root: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write segment file {}: {source}", path.display())]
    WriteSegment {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("disk storage requested before the temp directory exists")]
    MissingTempDir,

    #[error("failed to remove temp directory {}: {source}", path.display())]
    Cleanup {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Why one segment of a run has no payload.
#[derive(Debug, thiserror::Error)]
pub enum SegmentError {
    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error("decryption failed: {0}")]
    Decrypt(#[from] DecryptionError),

    #[error("storage failed: {0}")]
    Storage(#[from] StorageError),

    #[error("skipped after the run was aborted")]
    Aborted,

    #[error("segment task exited without reporting a result")]
    TaskLost,
}

#[derive(Debug, thiserror::Error)]
pub enum AssemblyError {
    #[error("no segments to merge")]
    Empty,

    #[error("segment {index} has no payload: {reason}")]
    FailedSegment { index: usize, reason: String },

    #[error("segment records out of order: expected index {expected}, found {found}")]
    OutOfOrder { expected: usize, found: usize },

    #[error("fragmented merge requires an initialization segment")]
    MissingInit,

    #[error("failed to read segment {index} from {}: {source}", path.display())]
    ReadSegment {
        index: usize,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write {}: {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error("invalid input: {reason}")]
    InvalidInput { reason: String },

    #[error("failed to download {failed} of {total} {track} segments (first failure: segment {first_index}): {source}")]
    SegmentsFailed {
        track: Track,
        first_index: usize,
        failed: usize,
        total: usize,
        #[source]
        source: SegmentError,
    },

    #[error("failed to fetch {track} initialization segment: {source}")]
    InitSegment {
        track: Track,
        #[source]
        source: FetchError,
    },

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("assembly error: {0}")]
    Assembly(#[from] AssemblyError),
}

impl RunError {
    pub fn invalid_input(reason: impl Into<String>) -> Self {
        Self::InvalidInput {
            reason: reason.into(),
        }
    }

    /// Index of the first failed segment, when the run failed on segments.
    pub fn first_failed_index(&self) -> Option<usize> {
        match self {
            Self::SegmentsFailed { first_index, .. } => Some(*first_index),
            _ => None,
        }
    }
}
