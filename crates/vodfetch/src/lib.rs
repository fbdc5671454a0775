//! # vodfetch-engine
//!
//! Concurrent segment acquisition and adaptive assembly for segmented VOD
//! streams (HLS and similar).
//!
//! ## Features
//!
//! - Bounded-parallel segment fetching with linear-backoff retries
//! - AES-128-CBC segment decryption, optionally on the blocking pool
//! - Memory storage that spills to a temp directory past a size threshold
//! - Order-preserving merge, with an init-segment variant for fMP4 streams
//!
//! Playlist parsing is left to the caller: the engine consumes an already
//! resolved [`DownloadRequest`].
//!
//! ## Authors
//!
//! - hua0512
//!

pub mod assembler;
pub mod config;
pub mod decryption;
pub mod engine;
pub mod error;
pub mod events;
pub mod fetcher;
pub mod model;
pub mod orchestrator;
pub mod retry;
pub mod storage;

pub use assembler::{MergeReport, merge_fragmented, merge_plain};
pub use config::{
    DecryptionConfig, DownloaderConfig, EngineConfig, FetcherConfig, SchedulerConfig,
    StorageConfig,
};
pub use decryption::{DecryptionOffloader, decrypt_segment, derive_iv};
pub use engine::{DownloadSummary, OutputTargets, VodDownloader};
pub use error::{
    AssemblyError, DecryptionError, FetchAttemptError, FetchError, RunError, SegmentError,
    StorageError,
};
pub use events::{ProgressCallback, ProgressEvent};
pub use fetcher::{Fetcher, HttpSource, SegmentSource};
pub use model::{
    CryptoContext, DownloadRequest, FormatContext, SegmentLocator, SegmentRecord, SegmentState,
    Track,
};
pub use orchestrator::{RunOutput, SegmentOrchestrator, TrackOutput};
pub use retry::RetryPolicy;
pub use storage::{StorageManager, StorageMode};
