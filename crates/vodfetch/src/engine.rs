use std::path::PathBuf;
use std::sync::Arc;

use humansize::{BINARY, format_size};
use serde::Serialize;
use tracing::{info, warn};

use crate::assembler::{MergeReport, merge_fragmented, merge_plain};
use crate::config::{DownloaderConfig, EngineConfig};
use crate::error::RunError;
use crate::events::ProgressCallback;
use crate::fetcher::{HttpSource, SegmentSource};
use crate::model::{DownloadRequest, FormatContext};
use crate::orchestrator::{RunOutput, SegmentOrchestrator, TrackOutput};

/// Destination files of one download.
#[derive(Debug, Clone)]
pub struct OutputTargets {
    pub video: PathBuf,
    /// Required when the request carries an audio track.
    pub audio: Option<PathBuf>,
}

impl OutputTargets {
    pub fn new(video: impl Into<PathBuf>) -> Self {
        Self {
            video: video.into(),
            audio: None,
        }
    }

    pub fn with_audio(mut self, audio: impl Into<PathBuf>) -> Self {
        self.audio = Some(audio.into());
        self
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DownloadSummary {
    pub video: MergeReport,
    pub audio: Option<MergeReport>,
    /// Whether the run spilled segments to a temp directory.
    pub used_disk: bool,
    pub total_bytes: u64,
}

/// Downloads a resolved segment list and merges it into output files.
///
/// Temporary segment storage is released on every path out of
/// [`download`](Self::download).
pub struct VodDownloader {
    orchestrator: SegmentOrchestrator,
}

impl VodDownloader {
    /// Build a downloader fetching over HTTP with `downloader_config`.
    pub fn new(
        config: EngineConfig,
        downloader_config: &DownloaderConfig,
    ) -> Result<Self, reqwest::Error> {
        let source = HttpSource::new(downloader_config, &config.fetcher)?;
        Ok(Self::with_source(config, Arc::new(source)))
    }

    pub fn with_source(config: EngineConfig, source: Arc<dyn SegmentSource>) -> Self {
        Self {
            orchestrator: SegmentOrchestrator::new(config, source),
        }
    }

    pub fn with_progress(mut self, callback: ProgressCallback) -> Self {
        self.orchestrator = self.orchestrator.with_progress(callback);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        self.orchestrator.config()
    }

    pub async fn download(
        &self,
        request: &DownloadRequest,
        targets: &OutputTargets,
    ) -> Result<DownloadSummary, RunError> {
        if request.audio.is_some() && targets.audio.is_none() {
            return Err(RunError::invalid_input(
                "audio segments given without an audio output path",
            ));
        }

        let output = self.orchestrator.run(request).await?;
        let result = Self::assemble(&output, &request.format, targets).await;

        let used_disk = output.used_disk();
        let total_bytes = output.total_bytes();
        if let Err(err) = output.cleanup() {
            warn!(error = %err, "Failed to clean up temporary segment storage");
        }

        let (video, audio) = result?;
        info!(
            path = %video.destination.display(),
            size = %format_size(total_bytes, BINARY),
            used_disk,
            "Download complete"
        );
        Ok(DownloadSummary {
            video,
            audio,
            used_disk,
            total_bytes,
        })
    }

    async fn assemble(
        output: &RunOutput,
        format: &FormatContext,
        targets: &OutputTargets,
    ) -> Result<(MergeReport, Option<MergeReport>), RunError> {
        let video = Self::merge_track(&output.video, format, &targets.video).await?;
        let audio = match (&output.audio, &targets.audio) {
            (Some(track), Some(path)) => Some(Self::merge_track(track, format, path).await?),
            _ => None,
        };
        Ok((video, audio))
    }

    async fn merge_track(
        track: &TrackOutput,
        format: &FormatContext,
        destination: &std::path::Path,
    ) -> Result<MergeReport, RunError> {
        let report = if format.fragmented {
            merge_fragmented(track.init.as_deref(), &track.records, destination).await?
        } else {
            merge_plain(&track.records, destination).await?
        };
        Ok(report)
    }
}
