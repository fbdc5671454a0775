//! Order-preserving reassembly of downloaded segments into one output file.
//!
//! Records are validated as a whole before the destination is opened, so a
//! run with any failed or missing segment never leaves an output behind.
//! Disk-backed segments are read back one at a time and their temp files
//! removed as soon as they have been copied.

use std::path::{Path, PathBuf};

use serde::Serialize;
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::{debug, info, warn};

use crate::error::AssemblyError;
use crate::model::{SegmentRecord, SegmentState};

#[derive(Debug, Clone, Serialize)]
pub struct MergeReport {
    pub destination: PathBuf,
    /// Media segments written, not counting the init segment.
    pub segments: usize,
    pub bytes_written: u64,
}

/// Concatenate `records` into `destination` in index order.
pub async fn merge_plain(
    records: &[SegmentRecord],
    destination: &Path,
) -> Result<MergeReport, AssemblyError> {
    merge(None, records, destination).await
}

/// Write `init` followed by every media record in index order.
pub async fn merge_fragmented(
    init: Option<&[u8]>,
    records: &[SegmentRecord],
    destination: &Path,
) -> Result<MergeReport, AssemblyError> {
    let init = init.ok_or(AssemblyError::MissingInit)?;
    merge(Some(init), records, destination).await
}

fn validate(records: &[SegmentRecord]) -> Result<(), AssemblyError> {
    if records.is_empty() {
        return Err(AssemblyError::Empty);
    }
    for (expected, record) in records.iter().enumerate() {
        if record.index != expected {
            return Err(AssemblyError::OutOfOrder {
                expected,
                found: record.index,
            });
        }
        if let SegmentState::Failed(err) = &record.state {
            return Err(AssemblyError::FailedSegment {
                index: record.index,
                reason: err.to_string(),
            });
        }
    }
    Ok(())
}

async fn merge(
    init: Option<&[u8]>,
    records: &[SegmentRecord],
    destination: &Path,
) -> Result<MergeReport, AssemblyError> {
    validate(records)?;

    let write_err = |source: std::io::Error| AssemblyError::Write {
        path: destination.to_path_buf(),
        source,
    };

    if let Some(parent) = destination.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await.map_err(write_err)?;
    }
    let file = File::create(destination).await.map_err(write_err)?;

    match write_segments(BufWriter::new(file), init, records, destination).await {
        Ok(bytes_written) => {
            info!(
                path = %destination.display(),
                segments = records.len(),
                bytes_written,
                "Merged segments"
            );
            Ok(MergeReport {
                destination: destination.to_path_buf(),
                segments: records.len(),
                bytes_written,
            })
        }
        Err(err) => {
            if let Err(remove_err) = tokio::fs::remove_file(destination).await {
                warn!(
                    path = %destination.display(),
                    error = %remove_err,
                    "Failed to remove partial output"
                );
            }
            Err(err)
        }
    }
}

async fn write_segments(
    mut writer: BufWriter<File>,
    init: Option<&[u8]>,
    records: &[SegmentRecord],
    destination: &Path,
) -> Result<u64, AssemblyError> {
    let write_err = |source: std::io::Error| AssemblyError::Write {
        path: destination.to_path_buf(),
        source,
    };
    let mut bytes_written = 0u64;

    if let Some(init) = init {
        writer.write_all(init).await.map_err(write_err)?;
        bytes_written += init.len() as u64;
    }

    for record in records {
        match &record.state {
            SegmentState::Memory(data) => {
                writer.write_all(data).await.map_err(write_err)?;
                bytes_written += data.len() as u64;
            }
            SegmentState::Disk(path) => {
                let data =
                    tokio::fs::read(path)
                        .await
                        .map_err(|source| AssemblyError::ReadSegment {
                            index: record.index,
                            path: path.clone(),
                            source,
                        })?;
                writer.write_all(&data).await.map_err(write_err)?;
                bytes_written += data.len() as u64;

                if let Err(err) = tokio::fs::remove_file(path).await {
                    debug!(path = %path.display(), error = %err, "Failed to remove merged segment file");
                }
            }
            // Rejected by validation.
            SegmentState::Failed(err) => {
                return Err(AssemblyError::FailedSegment {
                    index: record.index,
                    reason: err.to_string(),
                });
            }
        }
    }

    writer.flush().await.map_err(write_err)?;
    Ok(bytes_written)
}
