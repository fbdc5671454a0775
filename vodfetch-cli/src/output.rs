use std::ffi::OsString;
use std::path::{Path, PathBuf};

use tracing::warn;
use vodfetch_engine::OutputTargets;

/// Work out the output files for a download.
///
/// An output without a `.ts` or `.mp4` extension gets one appended (`.mp4`
/// for fragmented streams). The audio track, when present, is written next
/// to it as `<stem>.audio.<ext>`.
pub fn output_targets(output: &Path, fragmented: bool, has_audio: bool) -> OutputTargets {
    let video = with_media_extension(output, fragmented);
    if container_mismatch(&video, fragmented) {
        let actual = if fragmented { "fragmented MP4" } else { "MPEG-TS" };
        warn!(
            output = %video.display(),
            "Output extension does not match the stream container, bytes are written as {actual} without conversion"
        );
    }
    let mut targets = OutputTargets::new(&video);
    if has_audio {
        targets = targets.with_audio(audio_path(&video));
    }
    targets
}

fn with_media_extension(output: &Path, fragmented: bool) -> PathBuf {
    match output.extension().and_then(|ext| ext.to_str()) {
        Some("ts") | Some("mp4") => output.to_path_buf(),
        _ => {
            let mut name = OsString::from(output.as_os_str());
            name.push(if fragmented { ".mp4" } else { ".ts" });
            PathBuf::from(name)
        }
    }
}

/// A `.mp4` name for a TS stream, or `.ts` for a fragmented one.
fn container_mismatch(video: &Path, fragmented: bool) -> bool {
    match video.extension().and_then(|ext| ext.to_str()) {
        Some("mp4") => !fragmented,
        Some("ts") => fragmented,
        _ => false,
    }
}

fn audio_path(video: &Path) -> PathBuf {
    let stem = video
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "output".to_string());
    let ext = video
        .extension()
        .map(|e| e.to_string_lossy().into_owned())
        .unwrap_or_else(|| "ts".to_string());
    video.with_file_name(format!("{stem}.audio.{ext}"))
}
