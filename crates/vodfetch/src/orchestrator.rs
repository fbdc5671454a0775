// Segment orchestrator: one task per segment under a concurrency ceiling,
// wiring fetch -> decrypt -> store and collecting records back in index order.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use bytes::Bytes;
use humansize::{BINARY, format_size};
use tokio::sync::{Semaphore, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::decryption::DecryptionOffloader;
use crate::error::{FetchError, RunError, SegmentError, StorageError};
use crate::events::{ProgressCallback, ProgressEvent};
use crate::fetcher::{Fetcher, SegmentSource};
use crate::model::{
    CryptoContext, DownloadRequest, FormatContext, SegmentLocator, SegmentRecord, SegmentState,
    Track, validate_locators,
};
use crate::storage::{StorageManager, StorageMode};

/// Records of one track, in index order, plus its init block when fragmented.
#[derive(Debug)]
pub struct TrackOutput {
    pub init: Option<Bytes>,
    pub records: Vec<SegmentRecord>,
}

/// Successful result of a run.
///
/// Disk-backed records point into the run's temp directory, which lives as
/// long as this value: it is removed by [`RunOutput::cleanup`] or on drop.
#[derive(Debug)]
pub struct RunOutput {
    pub video: TrackOutput,
    pub audio: Option<TrackOutput>,
    storage: Arc<StorageManager>,
}

impl RunOutput {
    pub fn storage(&self) -> &StorageManager {
        &self.storage
    }

    pub fn used_disk(&self) -> bool {
        self.storage.mode() == StorageMode::Disk
    }

    pub fn total_bytes(&self) -> u64 {
        self.storage.cumulative_bytes()
    }

    /// Release the temp directory, reporting any removal failure.
    pub fn cleanup(self) -> Result<(), StorageError> {
        self.storage.cleanup()
    }
}

/// Shared by every segment task of one run.
struct TaskContext {
    fetcher: Fetcher,
    decryptor: DecryptionOffloader,
    crypto: CryptoContext,
    storage: Arc<StorageManager>,
    semaphore: Arc<Semaphore>,
    completed: AtomicUsize,
    total: usize,
    /// Tripped by the first storage failure; never by segment failures.
    abort: CancellationToken,
    on_progress: Option<ProgressCallback>,
}

pub struct SegmentOrchestrator {
    config: EngineConfig,
    fetcher: Fetcher,
    decryptor: DecryptionOffloader,
    on_progress: Option<ProgressCallback>,
}

impl SegmentOrchestrator {
    pub fn new(config: EngineConfig, source: Arc<dyn SegmentSource>) -> Self {
        let fetcher = Fetcher::from_config(source, &config.fetcher);
        let decryptor = DecryptionOffloader::new(config.decryption.offload_to_blocking_pool);
        Self {
            config,
            fetcher,
            decryptor,
            on_progress: None,
        }
    }

    pub fn with_progress(mut self, callback: ProgressCallback) -> Self {
        self.on_progress = Some(callback);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Download every segment of `request`.
    ///
    /// All segments are attempted exactly once (with retries) even when some
    /// fail; the run only fails after every task has finished. Storage
    /// failures are the exception: they stop segments that have not started
    /// yet. Any temp directory is removed before an error is returned.
    pub async fn run(&self, request: &DownloadRequest) -> Result<RunOutput, RunError> {
        let concurrency = self.config.scheduler.concurrency;
        if concurrency == 0 {
            return Err(RunError::invalid_input("concurrency limit must be at least 1"));
        }
        if request.video.is_empty() {
            return Err(RunError::invalid_input("no segments to download"));
        }
        validate_locators(Track::Video, &request.video)?;
        if let Some(audio) = &request.audio {
            validate_locators(Track::Audio, audio)?;
        }

        let audio_len = request.audio.as_ref().map_or(0, Vec::len);
        let total = request.video.len() + audio_len;
        let storage = Arc::new(StorageManager::from_config(
            &self.config.storage,
            request.format.extension(),
        ));

        info!(
            video_segments = request.video.len(),
            audio_segments = audio_len,
            concurrency,
            encrypted = request.crypto.enabled,
            fragmented = request.format.fragmented,
            "SegmentOrchestrator started"
        );

        let ctx = Arc::new(TaskContext {
            fetcher: self.fetcher.clone(),
            decryptor: self.decryptor.clone(),
            crypto: request.crypto.clone(),
            storage: Arc::clone(&storage),
            semaphore: Arc::new(Semaphore::new(concurrency)),
            completed: AtomicUsize::new(0),
            total,
            abort: CancellationToken::new(),
            on_progress: self.on_progress.clone(),
        });

        let (record_tx, mut record_rx) = mpsc::channel::<(Track, SegmentRecord)>(concurrency);
        let tracks = std::iter::once((Track::Video, &request.video))
            .chain(request.audio.iter().map(|audio| (Track::Audio, audio)));
        for (track, locators) in tracks {
            for locator in locators {
                tokio::spawn(Self::process_segment(
                    Arc::clone(&ctx),
                    track,
                    locator.clone(),
                    record_tx.clone(),
                ));
            }
        }
        // The channel closes once the last task drops its sender.
        drop(record_tx);

        let collect = async {
            let mut video_slots = empty_slots(request.video.len());
            let mut audio_slots = request.audio.as_ref().map(|audio| empty_slots(audio.len()));
            while let Some((track, record)) = record_rx.recv().await {
                let slots = match track {
                    Track::Video => Some(&mut video_slots),
                    Track::Audio => audio_slots.as_mut(),
                };
                if let Some(slot) = slots.and_then(|slots| slots.get_mut(record.index)) {
                    *slot = Some(record);
                }
            }
            (video_slots, audio_slots)
        };

        let video_init = self.fetch_init(Track::Video, &request.format, &ctx.abort);
        let audio_init = async {
            if request.audio.is_some() {
                self.fetch_init(Track::Audio, &request.format, &ctx.abort).await
            } else {
                Ok(None)
            }
        };

        let ((video_slots, audio_slots), video_init, audio_init) =
            tokio::join!(collect, video_init, audio_init);

        let mut video_records = fill_lost(video_slots);
        let mut audio_records = audio_slots.map(fill_lost);

        let outcome = Self::check_records(&mut video_records, audio_records.as_mut())
            .and_then(|()| {
                let video_init = video_init.map_err(|source| RunError::InitSegment {
                    track: Track::Video,
                    source,
                })?;
                let audio_init = audio_init.map_err(|source| RunError::InitSegment {
                    track: Track::Audio,
                    source,
                })?;
                Ok((video_init, audio_init))
            });

        let (video_init, audio_init) = match outcome {
            Ok(inits) => inits,
            Err(err) => {
                warn!(error = %err, "Run failed, discarding downloaded segments");
                if let Err(cleanup_err) = storage.cleanup() {
                    warn!(error = %cleanup_err, "Failed to remove temporary segment files");
                }
                return Err(err);
            }
        };

        match storage.temp_dir() {
            Some(dir) => info!(
                size = %format_size(storage.cumulative_bytes(), BINARY),
                path = %dir.display(),
                "Segments stored in temporary directory"
            ),
            None => info!(
                size = %format_size(storage.cumulative_bytes(), BINARY),
                "Segments stored in memory"
            ),
        }

        Ok(RunOutput {
            video: TrackOutput {
                init: video_init,
                records: video_records,
            },
            audio: audio_records.map(|records| TrackOutput {
                init: audio_init,
                records,
            }),
            storage,
        })
    }

    async fn fetch_init(
        &self,
        track: Track,
        format: &FormatContext,
        token: &CancellationToken,
    ) -> Result<Option<Bytes>, FetchError> {
        if !format.fragmented {
            return Ok(None);
        }
        match format.init_for(track) {
            Some(locator) => {
                debug!(%track, location = %locator.location, "Fetching initialization segment");
                self.fetcher.fetch(locator, token).await.map(Some)
            }
            None => Ok(None),
        }
    }

    async fn process_segment(
        ctx: Arc<TaskContext>,
        track: Track,
        locator: SegmentLocator,
        record_tx: mpsc::Sender<(Track, SegmentRecord)>,
    ) {
        let index = locator.index;
        let result = match Arc::clone(&ctx.semaphore).acquire_owned().await {
            Ok(_permit) => Self::acquire_segment(&ctx, track, &locator).await,
            Err(_) => Err(SegmentError::Aborted),
        };

        let record = match result {
            Ok(record) => record,
            Err(err) => {
                if !matches!(err, SegmentError::Aborted) {
                    warn!(%track, index, location = %locator.location, error = %err, "Segment failed");
                }
                SegmentRecord::failed(index, err)
            }
        };
        let failed = record.is_failed();

        if record_tx.send((track, record)).await.is_err() {
            warn!(%track, index, "Result collector closed before segment was reported");
        }

        let completed = ctx.completed.fetch_add(1, Ordering::SeqCst) + 1;
        let event = ProgressEvent {
            track,
            index,
            completed,
            total: ctx.total,
            percentage: completed as f64 / ctx.total as f64 * 100.0,
            cumulative_bytes: ctx.storage.cumulative_bytes(),
            mode: ctx.storage.mode(),
            failed,
        };
        debug!(
            %track,
            index,
            completed,
            total = ctx.total,
            cumulative_bytes = event.cumulative_bytes,
            mode = %event.mode,
            failed,
            "Segment finished"
        );
        if let Some(callback) = &ctx.on_progress {
            callback(&event);
        }
    }

    /// Fetch, decrypt and store one segment while holding a semaphore slot.
    async fn acquire_segment(
        ctx: &TaskContext,
        track: Track,
        locator: &SegmentLocator,
    ) -> Result<SegmentRecord, SegmentError> {
        if ctx.abort.is_cancelled() {
            return Err(SegmentError::Aborted);
        }

        let data = match ctx.fetcher.fetch(locator, &ctx.abort).await {
            Ok(data) => data,
            Err(FetchError::Cancelled) => return Err(SegmentError::Aborted),
            Err(err) => return Err(SegmentError::Fetch(err)),
        };

        let data = if ctx.crypto.enabled {
            ctx.decryptor
                .decrypt(data, &ctx.crypto, locator.index)
                .await?
        } else {
            data
        };

        let stored = match ctx.storage.record(data.len() as u64) {
            Ok(_) => ctx.storage.store(track, locator.index, data).await,
            Err(err) => Err(err),
        };

        stored.map_err(|err| {
            ctx.abort.cancel();
            SegmentError::Storage(err)
        })
    }

    /// Storage failures win over segment failures; video is reported before
    /// audio.
    fn check_records(
        video: &mut [SegmentRecord],
        audio: Option<&mut Vec<SegmentRecord>>,
    ) -> Result<(), RunError> {
        let mut audio = audio;
        if let Some(err) = take_storage_error(video)
            .or_else(|| audio.as_deref_mut().and_then(|records| take_storage_error(records)))
        {
            return Err(RunError::Storage(err));
        }

        aggregate_failures(Track::Video, video)?;
        if let Some(records) = audio {
            aggregate_failures(Track::Audio, records)?;
        }
        Ok(())
    }
}

fn empty_slots(len: usize) -> Vec<Option<SegmentRecord>> {
    std::iter::repeat_with(|| None).take(len).collect()
}

/// Turn collected slots into records; a slot nobody filled means the task
/// died before reporting.
fn fill_lost(slots: Vec<Option<SegmentRecord>>) -> Vec<SegmentRecord> {
    slots
        .into_iter()
        .enumerate()
        .map(|(index, slot)| {
            slot.unwrap_or_else(|| SegmentRecord::failed(index, SegmentError::TaskLost))
        })
        .collect()
}

fn take_storage_error(records: &mut [SegmentRecord]) -> Option<StorageError> {
    let record = records
        .iter_mut()
        .find(|r| matches!(r.state, SegmentState::Failed(SegmentError::Storage(_))))?;
    match std::mem::replace(&mut record.state, SegmentState::Failed(SegmentError::Aborted)) {
        SegmentState::Failed(SegmentError::Storage(err)) => Some(err),
        _ => None,
    }
}

fn aggregate_failures(track: Track, records: &mut [SegmentRecord]) -> Result<(), RunError> {
    let failed = records.iter().filter(|r| r.is_failed()).count();
    if failed == 0 {
        return Ok(());
    }

    let total = records.len();
    let Some(first) = records.iter_mut().find(|r| r.is_failed()) else {
        return Ok(());
    };
    let first_index = first.index;
    let source = match std::mem::replace(&mut first.state, SegmentState::Failed(SegmentError::Aborted)) {
        SegmentState::Failed(err) => err,
        _ => SegmentError::TaskLost,
    };

    Err(RunError::SegmentsFailed {
        track,
        first_index,
        failed,
        total,
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FetchAttemptError;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::time::Duration;

    struct MapSource(HashMap<String, Bytes>);

    #[async_trait]
    impl SegmentSource for MapSource {
        async fn fetch_once(&self, location: &str) -> Result<Bytes, FetchAttemptError> {
            self.0.get(location).cloned().ok_or_else(|| {
                FetchAttemptError::http_status(reqwest::StatusCode::NOT_FOUND, location)
            })
        }
    }

    fn source(entries: &[(&str, &str)]) -> Arc<MapSource> {
        let map = entries
            .iter()
            .map(|(k, v)| (k.to_string(), Bytes::copy_from_slice(v.as_bytes())))
            .collect();
        Arc::new(MapSource(map))
    }

    fn orchestrator(entries: &[(&str, &str)], root: &std::path::Path) -> SegmentOrchestrator {
        let config = EngineConfig::default()
            .with_concurrency(2)
            .with_max_retries(1)
            .with_retry_delay_unit(Duration::from_millis(1))
            .with_temp_root(root);
        SegmentOrchestrator::new(config, source(entries))
    }

    #[tokio::test]
    async fn rejects_invalid_input() {
        let root = tempfile::tempdir().unwrap();
        let orch = orchestrator(&[], root.path());

        let empty = DownloadRequest::new(Vec::new());
        assert!(matches!(
            orch.run(&empty).await,
            Err(RunError::InvalidInput { .. })
        ));

        let gap = DownloadRequest::new(vec![SegmentLocator::new(1, "a")]);
        assert!(matches!(
            orch.run(&gap).await,
            Err(RunError::InvalidInput { .. })
        ));

        let zero = SegmentOrchestrator::new(
            EngineConfig::default().with_concurrency(0),
            Arc::new(MapSource(HashMap::new())),
        );
        let request = DownloadRequest::new(SegmentLocator::sequence(["a"]));
        assert!(matches!(
            zero.run(&request).await,
            Err(RunError::InvalidInput { .. })
        ));
    }

    #[tokio::test]
    async fn audio_track_is_collected_separately() {
        let root = tempfile::tempdir().unwrap();
        let orch = orchestrator(
            &[("v0", "V0"), ("v1", "V1"), ("a0", "A0")],
            root.path(),
        );
        let request = DownloadRequest::new(SegmentLocator::sequence(["v0", "v1"]))
            .with_audio(SegmentLocator::sequence(["a0"]));

        let output = orch.run(&request).await.unwrap();
        assert_eq!(output.video.records.len(), 2);
        let audio = output.audio.as_ref().unwrap();
        assert_eq!(audio.records.len(), 1);
        assert!(matches!(&audio.records[0].state, SegmentState::Memory(b) if b.as_ref() == b"A0"));
        assert_eq!(output.total_bytes(), 6);
    }

    #[tokio::test]
    async fn audio_failure_is_reported_with_its_track() {
        let root = tempfile::tempdir().unwrap();
        let orch = orchestrator(&[("v0", "V0")], root.path());
        let request = DownloadRequest::new(SegmentLocator::sequence(["v0"]))
            .with_audio(SegmentLocator::sequence(["missing"]));

        match orch.run(&request).await {
            Err(RunError::SegmentsFailed {
                track,
                first_index,
                failed,
                ..
            }) => {
                assert_eq!(track, Track::Audio);
                assert_eq!(first_index, 0);
                assert_eq!(failed, 1);
            }
            other => panic!("expected audio failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn init_failure_fails_the_run() {
        let root = tempfile::tempdir().unwrap();
        let orch = orchestrator(&[("m0", "M0")], root.path());
        let request = DownloadRequest::new(SegmentLocator::sequence(["m0"])).with_format(
            FormatContext::fragmented(Some(SegmentLocator::new(0, "init-missing"))),
        );

        assert!(matches!(
            orch.run(&request).await,
            Err(RunError::InitSegment {
                track: Track::Video,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn storage_failure_aborts_the_run() {
        let root = tempfile::tempdir().unwrap();
        let missing_root = root.path().join("gone");
        let config = EngineConfig::default()
            .with_concurrency(1)
            .with_memory_threshold(0)
            .with_temp_root(&missing_root);
        let orch = SegmentOrchestrator::new(config, source(&[("s0", "0123"), ("s1", "4567")]));
        let request = DownloadRequest::new(SegmentLocator::sequence(["s0", "s1"]));

        assert!(matches!(
            orch.run(&request).await,
            Err(RunError::Storage(StorageError::CreateTempDir { .. }))
        ));
    }
}
