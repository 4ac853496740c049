//! Task identity and configuration for monarch-dl
//!
//! A task is a url plus a destination path; everything else about a download
//! is carried by [`TaskOptions`].

use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::core::error::{Error, Result};

/// Identifies a task for the lifetime of the process and inside breakpoint
/// records. Derived from url + destination, so resubmitting the same download
/// yields the same id.
pub type TaskId = u64;

/// A download task: remote url plus local destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Task {
    pub id: TaskId,
    pub url: String,
    pub path: PathBuf,
}

impl Task {
    /// Create a task for `url` downloading into `path`.
    pub fn new(url: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        let url = url.into();
        let path = path.into();
        let id = derive_task_id(&url, &path);
        Self { id, url, path }
    }
}

/// Stable id for a (url, destination) pair.
pub fn derive_task_id(url: &str, path: &Path) -> TaskId {
    let mut hasher = DefaultHasher::new();
    url.hash(&mut hasher);
    path.hash(&mut hasher);
    hasher.finish()
}

/// Derive a destination file name from the last path segment of a url.
pub fn filename_for_url(url: &str) -> Result<String> {
    let without_query = url.split(['?', '#']).next().unwrap_or(url);
    let after_scheme = without_query
        .split_once("://")
        .map_or(without_query, |(_, rest)| rest);
    let name = after_scheme.rsplit('/').next().unwrap_or("");

    if !after_scheme.contains('/') || name.is_empty() {
        return Err(Error::InvalidInput(format!(
            "cannot derive a file name from '{url}', pass an output path"
        )));
    }
    Ok(name.to_string())
}

/// Terminal classification of a finished task, reported exactly once through
/// the task-end event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndCause {
    /// All blocks fetched and the file verified
    Completed,

    /// Stopped by an external cancel signal
    Canceled,

    /// Rejected: destination file already claimed by an active task
    FileBusy,

    /// Rejected: identical task already active
    SameTaskBusy,

    /// Destination file could not be created or pre-allocated
    PreAllocateFailed,

    /// Failed; the task-end event carries the underlying error
    Error,
}

impl EndCause {
    pub fn is_success(self) -> bool {
        self == EndCause::Completed
    }
}

impl fmt::Display for EndCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EndCause::Completed => "completed",
            EndCause::Canceled => "canceled",
            EndCause::FileBusy => "file busy",
            EndCause::SameTaskBusy => "same task busy",
            EndCause::PreAllocateFailed => "pre-allocate failed",
            EndCause::Error => "error",
        };
        write!(f, "{name}")
    }
}

/// Behavior when the destination file already exists and no valid breakpoint
/// allows resuming into it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverwriteBehavior {
    /// Resume from a valid breakpoint, otherwise start over in place (default)
    Resume,

    /// Always start over, discarding any breakpoint
    Force,

    /// Never overwrite, fail if the file exists without a valid breakpoint
    NeverOverwrite,
}

impl Default for OverwriteBehavior {
    fn default() -> Self {
        Self::Resume
    }
}

/// Backoff schedule between retries of the same failure cause.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    /// Same delay before every retry
    Fixed(Duration),

    /// `base * 2^(attempt - 1)`
    Exponential { base: Duration },
}

/// Retry budget applied per block and per failure cause.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff: Backoff::Exponential { base: Duration::from_millis(1000) },
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        match self.backoff {
            Backoff::Fixed(delay) => delay,
            Backoff::Exponential { base } => {
                let shift = attempt.saturating_sub(1).min(16);
                base.saturating_mul(1 << shift)
            }
        }
    }
}

/// Aggregate progress callback: (bytes downloaded, total bytes)
pub type ProgressCallback = Arc<dyn Fn(u64, u64) + Send + Sync>;

/// Options for a single download task
#[derive(Clone)]
pub struct TaskOptions {
    /// Optional aggregate progress callback
    pub progress: Option<ProgressCallback>,

    /// Number of parallel blocks; defaults to a file-size heuristic
    pub block_count: Option<usize>,

    /// Upper bound for the block-count heuristic
    pub max_blocks: usize,

    /// Resume from a persisted breakpoint when one validates
    pub resume: bool,

    /// Behavior when the destination exists without a usable breakpoint
    pub overwrite: OverwriteBehavior,

    /// Retry budget per block and failure cause
    pub retry: RetryPolicy,

    /// Worker-local timeout for reading one chunk of the response body
    pub read_timeout: Duration,
}

impl Default for TaskOptions {
    fn default() -> Self {
        Self {
            progress: None,
            block_count: None,
            max_blocks: 16,
            resume: true,
            overwrite: OverwriteBehavior::default(),
            retry: RetryPolicy::default(),
            read_timeout: Duration::from_secs(30),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_id_is_stable_per_identity() {
        let a = Task::new("https://example.com/f.bin", "/tmp/f.bin");
        let b = Task::new("https://example.com/f.bin", "/tmp/f.bin");
        let c = Task::new("https://example.com/f.bin", "/tmp/other.bin");
        let d = Task::new("https://example.com/g.bin", "/tmp/f.bin");

        assert_eq!(a.id, b.id);
        assert_ne!(a.id, c.id);
        assert_ne!(a.id, d.id);
    }

    #[test]
    fn test_filename_for_url() {
        assert_eq!(
            filename_for_url("https://example.com/pub/data.tar.gz").unwrap(),
            "data.tar.gz"
        );
        assert_eq!(
            filename_for_url("https://example.com/pub/data.bin?token=abc#frag").unwrap(),
            "data.bin"
        );
        assert!(filename_for_url("https://example.com").is_err());
        assert!(filename_for_url("https://example.com/dir/").is_err());
    }

    #[test]
    fn test_exponential_backoff_doubles() {
        let policy = RetryPolicy {
            max_retries: 3,
            backoff: Backoff::Exponential { base: Duration::from_millis(100) },
        };
        assert_eq!(policy.delay(1), Duration::from_millis(100));
        assert_eq!(policy.delay(2), Duration::from_millis(200));
        assert_eq!(policy.delay(3), Duration::from_millis(400));
    }

    #[test]
    fn test_fixed_backoff_is_constant() {
        let policy = RetryPolicy {
            max_retries: 5,
            backoff: Backoff::Fixed(Duration::from_millis(250)),
        };
        assert_eq!(policy.delay(1), policy.delay(5));
    }

    #[test]
    fn test_default_options() {
        let options = TaskOptions::default();
        assert!(options.resume);
        assert_eq!(options.max_blocks, 16);
        assert_eq!(options.overwrite, OverwriteBehavior::Resume);
        assert_eq!(options.retry.max_retries, 3);
    }
}
