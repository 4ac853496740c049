//! # monarch-dl
//!
//! Resumable, multi-connection block-based download engine.
//!
//! A task is split into contiguous byte-range blocks fetched by parallel
//! workers writing into disjoint regions of a pre-allocated file. Progress is
//! snapshotted into a breakpoint sidecar so an interrupted download resumes
//! from where it stopped, as long as the origin's validators (etag /
//! last-modified) still match. Lifecycle and progress are observable through
//! [`EventSink`] implementations, or through the optional-callback adapter
//! [`CallbackSink`].
//!
//! # Quick Start
//!
//! ```no_run
//! # #[tokio::main]
//! # async fn main() -> monarch_dl::Result<()> {
//! // one-shot download, destination derived from the url
//! monarch_dl::get("https://example.com/pub/data.tar.gz", None).await?;
//! # Ok(())
//! # }
//! ```
//!
//! For cancellation, multiple tasks, or event listeners, drive the [`Engine`]
//! directly:
//!
//! ```no_run
//! # use std::sync::Arc;
//! # use monarch_dl::{CallbackSink, Engine, Task, TaskOptions};
//! # #[tokio::main]
//! # async fn main() -> monarch_dl::Result<()> {
//! let engine = Engine::new();
//! let task = Task::new("https://example.com/pub/data.tar.gz", "data.tar.gz");
//! let sink = Arc::new(CallbackSink::new(|task, cause, _error| {
//!     eprintln!("{} ended: {cause}", task.url);
//! }));
//! let handle = engine.submit(task, TaskOptions::default(), vec![sink])?;
//! handle.wait().await?;
//! # Ok(())
//! # }
//! ```

use std::path::PathBuf;

mod core;

pub use crate::core::block::{Block, BlockState};
pub use crate::core::breakpoint::{
    BlockSnapshot, BreakpointInfo, BreakpointStore, ResumeFailedCause,
};
pub use crate::core::coordinator::{Engine, EngineConfig, TaskHandle};
pub use crate::core::error::{Error, Result, RetryKind};
pub use crate::core::events::{CallbackSink, EventSink};
pub use crate::core::probe::ProbeResult;
pub use crate::core::task::{
    filename_for_url, Backoff, EndCause, OverwriteBehavior, ProgressCallback, RetryPolicy, Task,
    TaskId, TaskOptions,
};

/// Download `url` into `dest` with default options.
///
/// When `dest` is `None` the file name is derived from the url's last path
/// segment. Blocks until the task reaches a terminal state.
pub async fn get(url: &str, dest: Option<&str>) -> Result<()> {
    get_with_options(url, dest, TaskOptions::default()).await
}

/// Download `url` into `dest` with custom options.
pub async fn get_with_options(url: &str, dest: Option<&str>, options: TaskOptions) -> Result<()> {
    let path = match dest {
        Some(path) => PathBuf::from(path),
        None => PathBuf::from(filename_for_url(url)?),
    };

    let engine = Engine::new();
    let handle = engine.submit(Task::new(url, path), options, Vec::new())?;
    match handle.wait().await? {
        EndCause::Canceled => Err(Error::IoError(std::io::Error::new(
            std::io::ErrorKind::Interrupted,
            "download canceled",
        ))),
        _ => Ok(()),
    }
}
