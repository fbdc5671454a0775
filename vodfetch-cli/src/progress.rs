use std::sync::Arc;
use std::time::Duration;

use indicatif::{HumanBytes, ProgressBar, ProgressStyle};
use vodfetch_engine::{ProgressCallback, ProgressEvent};

const TEMPLATE: &str =
    "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} segments ({percent}%) {msg}";

/// Terminal progress bar driven by the engine's per-segment events.
#[derive(Clone)]
pub struct DownloadProgress {
    bar: ProgressBar,
}

impl DownloadProgress {
    pub fn new(total_segments: usize, hidden: bool) -> Self {
        let bar = if hidden {
            ProgressBar::hidden()
        } else {
            let bar = ProgressBar::new(total_segments as u64);
            if let Ok(style) = ProgressStyle::with_template(TEMPLATE) {
                bar.set_style(style.progress_chars("=>-"));
            }
            bar.enable_steady_tick(Duration::from_millis(120));
            bar
        };
        Self { bar }
    }

    pub fn callback(&self) -> ProgressCallback {
        let bar = self.bar.clone();
        Arc::new(move |event: &ProgressEvent| {
            bar.set_position(event.completed as u64);
            bar.set_message(format!(
                "{} ({})",
                HumanBytes(event.cumulative_bytes),
                event.mode
            ));
        })
    }

    pub fn finish(&self, success: bool) {
        if success {
            self.bar.finish_with_message("done");
        } else {
            self.bar.abandon_with_message("failed");
        }
    }
}
