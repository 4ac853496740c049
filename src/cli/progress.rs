//! CLI-specific progress handling for monarch-dl
//!
//! Drives an indicatif progress bar off the engine's event stream.

use indicatif::{ProgressBar, ProgressStyle};
use monarch_dl::{BreakpointInfo, EndCause, Error, EventSink, ResumeFailedCause, Task};

/// Creates a progress bar for CLI display with enhanced information
pub fn create_progress_bar(total_size: u64) -> ProgressBar {
    let pb = ProgressBar::new(total_size);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {bytes}/{total_bytes} ({percent}%) {bytes_per_sec} ETA: {eta}")
            .expect("Failed to create progress style")
            .progress_chars("#>-")
    );
    pb
}

/// Event sink rendering download progress on stderr.
pub struct ProgressSink {
    pb: ProgressBar,
}

impl ProgressSink {
    pub fn new(message: &str) -> Self {
        let pb = create_progress_bar(0);

        // Print initial message to stderr
        eprintln!("{message}");

        Self { pb }
    }
}

impl EventSink for ProgressSink {
    fn download_from_beginning(
        &self,
        _task: &Task,
        content_length: Option<u64>,
        cause: Option<ResumeFailedCause>,
    ) {
        if let Some(cause) = cause {
            eprintln!("⚠️  Breakpoint rejected ({cause}), starting from the beginning");
        }
        if let Some(total) = content_length {
            self.pb.set_length(total);
        }
        self.pb.set_position(0);
    }

    fn download_from_breakpoint(&self, _task: &Task, info: &BreakpointInfo) {
        eprintln!(
            "⏯️  Resuming: {} of {} bytes already present",
            info.total_completed(),
            info.content_length
        );
        self.pb.set_length(info.content_length);
        self.pb.set_position(info.total_completed());
    }

    fn fetch_progress(&self, _task: &Task, _block: u32, bytes: u64) {
        self.pb.inc(bytes);
    }

    fn task_end(&self, _task: &Task, cause: EndCause, _error: Option<&Error>) {
        if cause.is_success() {
            self.pb.finish_with_message("✅ Download completed!");
        } else {
            self.pb.abandon();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_progress_bar_template() {
        let pb = create_progress_bar(1000);

        assert_eq!(pb.length().unwrap(), 1000);

        // The template string must be valid for the enhanced bar
        pb.set_position(100);
        pb.finish();
    }

    #[test]
    fn test_progress_sink_tracks_resume_position() {
        let sink = ProgressSink::new("test download");
        let task = Task::new("https://example.com/f.bin", "/tmp/f.bin");

        sink.download_from_beginning(&task, Some(500), None);
        assert_eq!(sink.pb.length().unwrap(), 500);

        sink.fetch_progress(&task, 0, 100);
        assert_eq!(sink.pb.position(), 100);

        sink.task_end(&task, EndCause::Completed, None);
    }
}
