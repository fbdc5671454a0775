use std::fmt;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use serde::Serialize;

use crate::error::{RunError, SegmentError};

/// Which segment list of a run a record belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Track {
    Video,
    Audio,
}

impl Track {
    pub fn as_str(&self) -> &'static str {
        match self {
            Track::Video => "video",
            Track::Audio => "audio",
        }
    }
}

impl fmt::Display for Track {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One fetchable segment: its position in the stream and where to get it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentLocator {
    pub index: usize,
    /// Absolute URL, `file://` URL or filesystem path.
    pub location: String,
}

impl SegmentLocator {
    pub fn new(index: usize, location: impl Into<String>) -> Self {
        Self {
            index,
            location: location.into(),
        }
    }

    /// Number a list of locations `0..N-1` in order.
    pub fn sequence<I, S>(locations: I) -> Vec<SegmentLocator>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        locations
            .into_iter()
            .enumerate()
            .map(|(index, location)| SegmentLocator::new(index, location))
            .collect()
    }
}

/// Checks that indices run `0..N-1` in list order with no gaps or duplicates.
pub fn validate_locators(track: Track, locators: &[SegmentLocator]) -> Result<(), RunError> {
    for (expected, locator) in locators.iter().enumerate() {
        if locator.index != expected {
            return Err(RunError::invalid_input(format!(
                "{track} locator at position {expected} has index {}",
                locator.index
            )));
        }
    }
    Ok(())
}

#[derive(Debug, Clone, Default)]
pub struct CryptoContext {
    pub enabled: bool,
    /// AES-128 key. Its length is validated by the decryptor.
    pub key: Bytes,
    /// Hex IV from the playlist, with or without a `0x` prefix.
    pub iv_hex: Option<String>,
}

impl CryptoContext {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn aes128(key: impl Into<Bytes>, iv_hex: Option<String>) -> Self {
        Self {
            enabled: true,
            key: key.into(),
            iv_hex,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct FormatContext {
    /// fMP4 stream: every merged output starts with an init segment.
    pub fragmented: bool,
    pub init_locator: Option<SegmentLocator>,
    /// Init segment of the audio rendition, passed explicitly so the audio
    /// pass never borrows the video init.
    pub audio_init_locator: Option<SegmentLocator>,
}

impl FormatContext {
    pub fn plain() -> Self {
        Self::default()
    }

    pub fn fragmented(init_locator: Option<SegmentLocator>) -> Self {
        Self {
            fragmented: true,
            init_locator,
            audio_init_locator: None,
        }
    }

    pub fn with_audio_init(mut self, locator: SegmentLocator) -> Self {
        self.audio_init_locator = Some(locator);
        self
    }

    pub fn init_for(&self, track: Track) -> Option<&SegmentLocator> {
        match track {
            Track::Video => self.init_locator.as_ref(),
            Track::Audio => self.audio_init_locator.as_ref(),
        }
    }

    /// File extension for stored and merged segment data.
    pub fn extension(&self) -> &'static str {
        if self.fragmented { "m4s" } else { "ts" }
    }
}

/// Already-resolved input of one run, as produced by playlist resolution.
#[derive(Debug, Clone, Default)]
pub struct DownloadRequest {
    pub video: Vec<SegmentLocator>,
    pub audio: Option<Vec<SegmentLocator>>,
    pub crypto: CryptoContext,
    pub format: FormatContext,
}

impl DownloadRequest {
    pub fn new(video: Vec<SegmentLocator>) -> Self {
        Self {
            video,
            ..Default::default()
        }
    }

    pub fn with_audio(mut self, audio: Vec<SegmentLocator>) -> Self {
        self.audio = Some(audio);
        self
    }

    pub fn with_crypto(mut self, crypto: CryptoContext) -> Self {
        self.crypto = crypto;
        self
    }

    pub fn with_format(mut self, format: FormatContext) -> Self {
        self.format = format;
        self
    }
}

/// Where a segment's bytes ended up, or why there are none.
#[derive(Debug)]
pub enum SegmentState {
    Memory(Bytes),
    Disk(PathBuf),
    Failed(SegmentError),
}

#[derive(Debug)]
pub struct SegmentRecord {
    pub index: usize,
    pub state: SegmentState,
}

impl SegmentRecord {
    pub fn memory(index: usize, data: Bytes) -> Self {
        Self {
            index,
            state: SegmentState::Memory(data),
        }
    }

    pub fn disk(index: usize, path: PathBuf) -> Self {
        Self {
            index,
            state: SegmentState::Disk(path),
        }
    }

    pub fn failed(index: usize, error: SegmentError) -> Self {
        Self {
            index,
            state: SegmentState::Failed(error),
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.state, SegmentState::Failed(_))
    }

    pub fn is_disk_backed(&self) -> bool {
        matches!(self.state, SegmentState::Disk(_))
    }

    pub fn disk_path(&self) -> Option<&Path> {
        match &self.state {
            SegmentState::Disk(path) => Some(path),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&SegmentError> {
        match &self.state {
            SegmentState::Failed(err) => Some(err),
            _ => None,
        }
    }
}
