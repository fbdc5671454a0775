//! Adaptive segment storage.
//!
//! Segments stay in memory until the cumulative payload of a run crosses the
//! configured threshold. From then on every completed segment is written to
//! a per-run temp directory. The switch happens once and is never undone.

use std::fmt;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use parking_lot::Mutex;
use serde::Serialize;
use tempfile::TempDir;
use tracing::{debug, info};

use crate::config::StorageConfig;
use crate::error::StorageError;
use crate::model::{SegmentRecord, Track};

const TEMP_DIR_PREFIX: &str = "vodfetch-segments-";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageMode {
    Memory,
    Disk,
}

impl fmt::Display for StorageMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageMode::Memory => f.write_str("memory"),
            StorageMode::Disk => f.write_str("disk"),
        }
    }
}

#[derive(Debug)]
struct StorageState {
    cumulative_bytes: u64,
    mode: StorageMode,
    temp_dir: Option<TempDir>,
}

/// Owns the memory-vs-disk policy of one run.
///
/// The temp directory is removed by [`StorageManager::cleanup`] or, failing
/// that, when the manager is dropped.
#[derive(Debug)]
pub struct StorageManager {
    threshold: u64,
    temp_root: PathBuf,
    extension: &'static str,
    state: Mutex<StorageState>,
}

impl StorageManager {
    pub fn new(threshold: u64, temp_root: Option<PathBuf>, extension: &'static str) -> Self {
        Self {
            threshold,
            temp_root: temp_root.unwrap_or_else(std::env::temp_dir),
            extension,
            state: Mutex::new(StorageState {
                cumulative_bytes: 0,
                mode: StorageMode::Memory,
                temp_dir: None,
            }),
        }
    }

    pub fn from_config(config: &StorageConfig, extension: &'static str) -> Self {
        Self::new(config.memory_threshold, config.temp_root.clone(), extension)
    }

    /// Account for `size_delta` more bytes and return the post-update mode.
    ///
    /// The call that pushes the total past the threshold creates the temp
    /// directory and gets [`StorageMode::Disk`] back itself.
    pub fn record(&self, size_delta: u64) -> Result<StorageMode, StorageError> {
        let mut state = self.state.lock();
        state.cumulative_bytes = state.cumulative_bytes.saturating_add(size_delta);

        if state.mode == StorageMode::Memory && state.cumulative_bytes > self.threshold {
            let dir = tempfile::Builder::new()
                .prefix(TEMP_DIR_PREFIX)
                .tempdir_in(&self.temp_root)
                .map_err(|source| StorageError::CreateTempDir {
                    root: self.temp_root.clone(),
                    source,
                })?;
            info!(
                threshold = self.threshold,
                cumulative_bytes = state.cumulative_bytes,
                path = %dir.path().display(),
                "Payload exceeded memory threshold, switching to disk storage"
            );
            state.temp_dir = Some(dir);
            state.mode = StorageMode::Disk;
        }

        Ok(state.mode)
    }

    /// Store one segment under the current mode.
    ///
    /// The mode is read at store time, so a segment accounted before another
    /// task crossed the threshold still lands on disk. Disk writes happen
    /// outside the lock; every segment has its own file.
    pub async fn store(
        &self,
        track: Track,
        index: usize,
        data: Bytes,
    ) -> Result<SegmentRecord, StorageError> {
        let Some(path) = self.disk_path(track, index)? else {
            return Ok(SegmentRecord::memory(index, data));
        };

        tokio::fs::write(&path, &data)
            .await
            .map_err(|source| StorageError::WriteSegment {
                path: path.clone(),
                source,
            })?;
        debug!(%track, index, path = %path.display(), "Segment spilled to disk");
        Ok(SegmentRecord::disk(index, path))
    }

    /// Target file for a segment, or `None` while still in memory mode.
    fn disk_path(&self, track: Track, index: usize) -> Result<Option<PathBuf>, StorageError> {
        let state = self.state.lock();
        if state.mode == StorageMode::Memory {
            return Ok(None);
        }
        let dir = state.temp_dir.as_ref().ok_or(StorageError::MissingTempDir)?;
        Ok(Some(dir.path().join(format!(
            "{}_{index:06}.{}",
            track.as_str(),
            self.extension
        ))))
    }

    /// Remove the temp directory and everything in it. A no-op when none
    /// was created or it is already gone.
    pub fn cleanup(&self) -> Result<(), StorageError> {
        let dir = self.state.lock().temp_dir.take();
        if let Some(dir) = dir {
            let path = dir.path().to_path_buf();
            dir.close()
                .map_err(|source| StorageError::Cleanup {
                    path: path.clone(),
                    source,
                })?;
            info!(path = %path.display(), "Temporary segment files cleaned up");
        }
        Ok(())
    }

    pub fn mode(&self) -> StorageMode {
        self.state.lock().mode
    }

    pub fn cumulative_bytes(&self) -> u64 {
        self.state.lock().cumulative_bytes
    }

    pub fn threshold(&self) -> u64 {
        self.threshold
    }

    /// Current temp directory, if the run has spilled to disk.
    pub fn temp_dir(&self) -> Option<PathBuf> {
        self.state
            .lock()
            .temp_dir
            .as_ref()
            .map(|dir| dir.path().to_path_buf())
    }

    pub fn temp_root(&self) -> &Path {
        &self.temp_root
    }
}
