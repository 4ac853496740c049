//! Listener surface for download lifecycle events
//!
//! [`EventSink`] is a pure observer: every method has a no-op default, so an
//! implementation overrides only the events it cares about. [`CallbackSink`]
//! builds a sink out of independently optional closures for callers that do
//! not want a dedicated type. Sinks are invoked synchronously on the emitting
//! task and must not block; a panicking sink is isolated and logged, never
//! surfaced into engine state.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use log::warn;

use crate::core::breakpoint::{BreakpointInfo, ResumeFailedCause};
use crate::core::error::Error;
use crate::core::probe::ProbeResult;
use crate::core::task::{EndCause, ProgressCallback, Task};

/// Observer interface for task lifecycle and progress events.
///
/// Event order for one task: `task_start`, `connect_trial_start`,
/// `connect_trial_end`, then `download_from_beginning` or
/// `download_from_breakpoint`, then per block `connect_start`, `connect_end`,
/// `fetch_start`, `fetch_progress` (0..n times), `fetch_end`, and finally
/// exactly one `task_end`. Rejected submissions only see `task_end`.
pub trait EventSink: Send + Sync {
    fn task_start(&self, _task: &Task) {}

    fn connect_trial_start(&self, _task: &Task) {}

    fn connect_trial_end(&self, _task: &Task, _probe: &ProbeResult) {}

    /// The task starts over; `cause` is set when a previous breakpoint was
    /// rejected.
    fn download_from_beginning(
        &self,
        _task: &Task,
        _content_length: Option<u64>,
        _cause: Option<ResumeFailedCause>,
    ) {
    }

    /// The task continues from a validated breakpoint.
    fn download_from_breakpoint(&self, _task: &Task, _info: &BreakpointInfo) {}

    fn connect_start(&self, _task: &Task, _block: u32) {}

    fn connect_end(&self, _task: &Task, _block: u32, _status: u16) {}

    /// `length` is the number of bytes this fetch will transfer, 0 when the
    /// total length is unknown.
    fn fetch_start(&self, _task: &Task, _block: u32, _length: u64) {}

    fn fetch_progress(&self, _task: &Task, _block: u32, _bytes: u64) {}

    fn fetch_end(&self, _task: &Task, _block: u32) {}

    /// Mandatory terminal event, fired exactly once per task.
    fn task_end(&self, _task: &Task, _cause: EndCause, _error: Option<&Error>) {}
}

/// Fan-out over zero or more sinks, shared between the coordinator and its
/// workers. Attaching after fetching has started is allowed but misses the
/// earlier events.
#[derive(Clone, Default)]
pub struct SinkSet {
    sinks: Arc<RwLock<Vec<Arc<dyn EventSink>>>>,
}

impl SinkSet {
    pub fn new(initial: Vec<Arc<dyn EventSink>>) -> Self {
        Self { sinks: Arc::new(RwLock::new(initial)) }
    }

    pub fn attach(&self, sink: Arc<dyn EventSink>) {
        self.guard_mut().push(sink);
    }

    /// Detach a previously attached sink, matched by identity.
    pub fn detach(&self, sink: &Arc<dyn EventSink>) {
        self.guard_mut().retain(|s| !Arc::ptr_eq(s, sink));
    }

    fn guard_mut(&self) -> std::sync::RwLockWriteGuard<'_, Vec<Arc<dyn EventSink>>> {
        match self.sinks.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn emit(&self, event: impl Fn(&dyn EventSink)) {
        let sinks = match self.sinks.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        for sink in sinks.iter() {
            if catch_unwind(AssertUnwindSafe(|| event(sink.as_ref()))).is_err() {
                warn!("event sink panicked; event dropped for that sink");
            }
        }
    }

    pub(crate) fn task_start(&self, task: &Task) {
        self.emit(|s| s.task_start(task));
    }

    pub(crate) fn connect_trial_start(&self, task: &Task) {
        self.emit(|s| s.connect_trial_start(task));
    }

    pub(crate) fn connect_trial_end(&self, task: &Task, probe: &ProbeResult) {
        self.emit(|s| s.connect_trial_end(task, probe));
    }

    pub(crate) fn download_from_beginning(
        &self,
        task: &Task,
        content_length: Option<u64>,
        cause: Option<ResumeFailedCause>,
    ) {
        self.emit(|s| s.download_from_beginning(task, content_length, cause));
    }

    pub(crate) fn download_from_breakpoint(&self, task: &Task, info: &BreakpointInfo) {
        self.emit(|s| s.download_from_breakpoint(task, info));
    }

    pub(crate) fn connect_start(&self, task: &Task, block: u32) {
        self.emit(|s| s.connect_start(task, block));
    }

    pub(crate) fn connect_end(&self, task: &Task, block: u32, status: u16) {
        self.emit(|s| s.connect_end(task, block, status));
    }

    pub(crate) fn fetch_start(&self, task: &Task, block: u32, length: u64) {
        self.emit(|s| s.fetch_start(task, block, length));
    }

    pub(crate) fn fetch_progress(&self, task: &Task, block: u32, bytes: u64) {
        self.emit(|s| s.fetch_progress(task, block, bytes));
    }

    pub(crate) fn fetch_end(&self, task: &Task, block: u32) {
        self.emit(|s| s.fetch_end(task, block));
    }

    pub(crate) fn task_end(&self, task: &Task, cause: EndCause, error: Option<&Error>) {
        self.emit(|s| s.task_end(task, cause, error));
    }
}

type TaskHook = Box<dyn Fn(&Task) + Send + Sync>;
type BlockHook = Box<dyn Fn(&Task, u32) + Send + Sync>;
type BlockBytesHook = Box<dyn Fn(&Task, u32, u64) + Send + Sync>;

/// Adapter that assembles an [`EventSink`] from optional callbacks.
///
/// Every callback is independently optional except task-end, which the
/// constructor requires. Unset callbacks no-op.
pub struct CallbackSink {
    on_task_start: Option<TaskHook>,
    on_connect_trial_start: Option<TaskHook>,
    on_connect_trial_end: Option<Box<dyn Fn(&Task, &ProbeResult) + Send + Sync>>,
    on_download_from_beginning:
        Option<Box<dyn Fn(&Task, Option<u64>, Option<ResumeFailedCause>) + Send + Sync>>,
    on_download_from_breakpoint: Option<Box<dyn Fn(&Task, &BreakpointInfo) + Send + Sync>>,
    on_connect_start: Option<BlockHook>,
    on_connect_end: Option<Box<dyn Fn(&Task, u32, u16) + Send + Sync>>,
    on_fetch_start: Option<BlockBytesHook>,
    on_fetch_progress: Option<BlockBytesHook>,
    on_fetch_end: Option<BlockHook>,
    on_task_end: Box<dyn Fn(&Task, EndCause, Option<&Error>) + Send + Sync>,
}

impl CallbackSink {
    pub fn new(on_task_end: impl Fn(&Task, EndCause, Option<&Error>) + Send + Sync + 'static) -> Self {
        Self {
            on_task_start: None,
            on_connect_trial_start: None,
            on_connect_trial_end: None,
            on_download_from_beginning: None,
            on_download_from_breakpoint: None,
            on_connect_start: None,
            on_connect_end: None,
            on_fetch_start: None,
            on_fetch_progress: None,
            on_fetch_end: None,
            on_task_end: Box::new(on_task_end),
        }
    }

    pub fn on_task_start(mut self, f: impl Fn(&Task) + Send + Sync + 'static) -> Self {
        self.on_task_start = Some(Box::new(f));
        self
    }

    pub fn on_connect_trial_start(mut self, f: impl Fn(&Task) + Send + Sync + 'static) -> Self {
        self.on_connect_trial_start = Some(Box::new(f));
        self
    }

    pub fn on_connect_trial_end(
        mut self,
        f: impl Fn(&Task, &ProbeResult) + Send + Sync + 'static,
    ) -> Self {
        self.on_connect_trial_end = Some(Box::new(f));
        self
    }

    pub fn on_download_from_beginning(
        mut self,
        f: impl Fn(&Task, Option<u64>, Option<ResumeFailedCause>) + Send + Sync + 'static,
    ) -> Self {
        self.on_download_from_beginning = Some(Box::new(f));
        self
    }

    pub fn on_download_from_breakpoint(
        mut self,
        f: impl Fn(&Task, &BreakpointInfo) + Send + Sync + 'static,
    ) -> Self {
        self.on_download_from_breakpoint = Some(Box::new(f));
        self
    }

    pub fn on_connect_start(mut self, f: impl Fn(&Task, u32) + Send + Sync + 'static) -> Self {
        self.on_connect_start = Some(Box::new(f));
        self
    }

    pub fn on_connect_end(
        mut self,
        f: impl Fn(&Task, u32, u16) + Send + Sync + 'static,
    ) -> Self {
        self.on_connect_end = Some(Box::new(f));
        self
    }

    pub fn on_fetch_start(mut self, f: impl Fn(&Task, u32, u64) + Send + Sync + 'static) -> Self {
        self.on_fetch_start = Some(Box::new(f));
        self
    }

    pub fn on_fetch_progress(
        mut self,
        f: impl Fn(&Task, u32, u64) + Send + Sync + 'static,
    ) -> Self {
        self.on_fetch_progress = Some(Box::new(f));
        self
    }

    pub fn on_fetch_end(mut self, f: impl Fn(&Task, u32) + Send + Sync + 'static) -> Self {
        self.on_fetch_end = Some(Box::new(f));
        self
    }
}

impl EventSink for CallbackSink {
    fn task_start(&self, task: &Task) {
        if let Some(f) = &self.on_task_start {
            f(task);
        }
    }

    fn connect_trial_start(&self, task: &Task) {
        if let Some(f) = &self.on_connect_trial_start {
            f(task);
        }
    }

    fn connect_trial_end(&self, task: &Task, probe: &ProbeResult) {
        if let Some(f) = &self.on_connect_trial_end {
            f(task, probe);
        }
    }

    fn download_from_beginning(
        &self,
        task: &Task,
        content_length: Option<u64>,
        cause: Option<ResumeFailedCause>,
    ) {
        if let Some(f) = &self.on_download_from_beginning {
            f(task, content_length, cause);
        }
    }

    fn download_from_breakpoint(&self, task: &Task, info: &BreakpointInfo) {
        if let Some(f) = &self.on_download_from_breakpoint {
            f(task, info);
        }
    }

    fn connect_start(&self, task: &Task, block: u32) {
        if let Some(f) = &self.on_connect_start {
            f(task, block);
        }
    }

    fn connect_end(&self, task: &Task, block: u32, status: u16) {
        if let Some(f) = &self.on_connect_end {
            f(task, block, status);
        }
    }

    fn fetch_start(&self, task: &Task, block: u32, length: u64) {
        if let Some(f) = &self.on_fetch_start {
            f(task, block, length);
        }
    }

    fn fetch_progress(&self, task: &Task, block: u32, bytes: u64) {
        if let Some(f) = &self.on_fetch_progress {
            f(task, block, bytes);
        }
    }

    fn fetch_end(&self, task: &Task, block: u32) {
        if let Some(f) = &self.on_fetch_end {
            f(task, block);
        }
    }

    fn task_end(&self, task: &Task, cause: EndCause, error: Option<&Error>) {
        (self.on_task_end)(task, cause, error);
    }
}

/// Bridges the aggregate `(downloaded, total)` progress callback onto the
/// per-block event stream.
pub(crate) struct ProgressAdapter {
    callback: ProgressCallback,
    downloaded: AtomicU64,
    total: AtomicU64,
}

impl ProgressAdapter {
    pub(crate) fn new(callback: ProgressCallback) -> Self {
        Self {
            callback,
            downloaded: AtomicU64::new(0),
            total: AtomicU64::new(0),
        }
    }
}

impl EventSink for ProgressAdapter {
    fn download_from_beginning(
        &self,
        _task: &Task,
        content_length: Option<u64>,
        _cause: Option<ResumeFailedCause>,
    ) {
        self.total.store(content_length.unwrap_or(0), Ordering::Relaxed);
        self.downloaded.store(0, Ordering::Relaxed);
    }

    fn download_from_breakpoint(&self, _task: &Task, info: &BreakpointInfo) {
        self.total.store(info.content_length, Ordering::Relaxed);
        self.downloaded.store(info.total_completed(), Ordering::Relaxed);
    }

    fn fetch_progress(&self, _task: &Task, _block: u32, bytes: u64) {
        let downloaded = self.downloaded.fetch_add(bytes, Ordering::Relaxed) + bytes;
        (self.callback)(downloaded, self.total.load(Ordering::Relaxed));
    }

    fn task_end(&self, _task: &Task, cause: EndCause, _error: Option<&Error>) {
        if cause.is_success() {
            let total = self.total.load(Ordering::Relaxed);
            (self.callback)(total.max(self.downloaded.load(Ordering::Relaxed)), total);
        }
    }
}
