//! Task orchestration state machine
//!
//! The coordinator drives one task through probe → split-or-resume → fetch →
//! finalize. It owns the destination file lifecycle (create, pre-allocate,
//! verify), aggregates worker outcomes with a per-cause retry budget, keeps
//! the breakpoint snapshot in sync while fetching, and reports the terminal
//! cause exactly once through the attached sinks.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use log::{debug, info, warn};
use once_cell::sync::Lazy;
use reqwest::{Client, ClientBuilder};
use tokio::sync::Semaphore;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;

use crate::core::block::{self, Block, BlockState};
use crate::core::breakpoint::{BreakpointInfo, BreakpointStore};
use crate::core::error::{Error, Result, RetryKind};
use crate::core::events::{EventSink, ProgressAdapter, SinkSet};
use crate::core::probe::{self, ProbeResult};
use crate::core::task::{
    EndCause, OverwriteBehavior, RetryPolicy, Task, TaskId, TaskOptions,
};
use crate::core::worker::{BlockOutcome, FetchWorker};

/// Interval between breakpoint snapshots while fetching
const BREAKPOINT_SYNC_INTERVAL: Duration = Duration::from_millis(500);

/// Global HTTP client with optimizations
static GLOBAL_CLIENT: Lazy<Client> = Lazy::new(|| {
    ClientBuilder::new()
        .tcp_keepalive(Duration::from_secs(60))
        .pool_idle_timeout(Duration::from_secs(90))
        .pool_max_idle_per_host(20)
        .connect_timeout(Duration::from_secs(10))
        .user_agent(concat!("monarch-dl/", env!("CARGO_PKG_VERSION")))
        .build()
        .expect("Failed to create HTTP client")
});

/// Process-wide set of active task ids and destination paths. Registered at
/// submit, deregistered at any terminal state.
struct ActiveSet {
    ids: HashSet<TaskId>,
    paths: HashSet<PathBuf>,
}

static ACTIVE: Lazy<Mutex<ActiveSet>> = Lazy::new(|| {
    Mutex::new(ActiveSet { ids: HashSet::new(), paths: HashSet::new() })
});

fn lock_active() -> MutexGuard<'static, ActiveSet> {
    match ACTIVE.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

struct ActiveGuard {
    id: TaskId,
    path: PathBuf,
}

impl ActiveGuard {
    fn register(task: &Task) -> Result<Self> {
        let mut active = lock_active();
        if active.ids.contains(&task.id) {
            return Err(Error::SameTaskBusy(task.id));
        }
        if active.paths.contains(&task.path) {
            return Err(Error::FileBusy(task.path.clone()));
        }
        active.ids.insert(task.id);
        active.paths.insert(task.path.clone());
        Ok(Self { id: task.id, path: task.path.clone() })
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        let mut active = lock_active();
        active.ids.remove(&self.id);
        active.paths.remove(&self.path);
    }
}

/// Engine-level configuration shared by every task it runs.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Cap on tasks fetching at the same time; excess submissions queue
    pub max_concurrent_tasks: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self { max_concurrent_tasks: 8 }
    }
}

/// Orchestrates download tasks. Cheap to clone; clones share the same
/// concurrency budget and running-task table.
#[derive(Clone)]
pub struct Engine {
    config: EngineConfig,
    permits: Arc<Semaphore>,
    running: Arc<Mutex<HashMap<TaskId, CancellationToken>>>,
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

impl Engine {
    /// Create an engine with default configuration.
    pub fn new() -> Self {
        Self::with_config(EngineConfig::default())
    }

    pub fn with_config(config: EngineConfig) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_concurrent_tasks.max(1)));
        Self {
            config,
            permits,
            running: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Submit a task for download. Must be called inside a tokio runtime.
    ///
    /// The accept/reject decision is immediate: a destination or task-id
    /// collision returns `FileBusy`/`SameTaskBusy` (also reported through
    /// `task_end` on the given sinks). An accepted task runs in the
    /// background and reports progress through its sinks; the returned
    /// handle waits for the terminal cause.
    pub fn submit(
        &self,
        task: Task,
        options: TaskOptions,
        sinks: Vec<Arc<dyn EventSink>>,
    ) -> Result<TaskHandle> {
        let sinks = SinkSet::new(sinks);
        if let Some(callback) = options.progress.clone() {
            sinks.attach(Arc::new(ProgressAdapter::new(callback)));
        }

        let guard = match ActiveGuard::register(&task) {
            Ok(guard) => guard,
            Err(err) => {
                let cause = match &err {
                    Error::SameTaskBusy(_) => EndCause::SameTaskBusy,
                    _ => EndCause::FileBusy,
                };
                sinks.task_end(&task, cause, Some(&err));
                return Err(err);
            }
        };

        let token = CancellationToken::new();
        lock_running(&self.running).insert(task.id, token.clone());

        let id = task.id;
        let coordinator = Coordinator {
            task: Arc::new(task),
            options,
            sinks: sinks.clone(),
            token: token.clone(),
            permits: Arc::clone(&self.permits),
            running: Arc::clone(&self.running),
            _guard: guard,
        };
        let join = tokio::spawn(coordinator.run());

        Ok(TaskHandle { id, token, sinks, join })
    }

    /// Cancel a running task. Idempotent; returns false when the task is
    /// unknown or already terminal.
    pub fn cancel(&self, id: TaskId) -> bool {
        let running = lock_running(&self.running);
        match running.get(&id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }
}

fn lock_running(
    running: &Mutex<HashMap<TaskId, CancellationToken>>,
) -> MutexGuard<'_, HashMap<TaskId, CancellationToken>> {
    match running.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Handle to a submitted task.
pub struct TaskHandle {
    id: TaskId,
    token: CancellationToken,
    sinks: SinkSet,
    join: JoinHandle<(EndCause, Option<Error>)>,
}

impl TaskHandle {
    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Cancel this task; equivalent to `Engine::cancel` with this id.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Attach a sink after submission. Events emitted earlier are missed.
    pub fn attach_sink(&self, sink: Arc<dyn EventSink>) {
        self.sinks.attach(sink);
    }

    pub fn detach_sink(&self, sink: &Arc<dyn EventSink>) {
        self.sinks.detach(sink);
    }

    /// Wait for the terminal cause. `Completed` and `Canceled` come back as
    /// `Ok`; every failing terminal returns its underlying error.
    pub async fn wait(self) -> Result<EndCause> {
        let (cause, error) = self.join.await.map_err(|err| {
            Error::IoError(std::io::Error::new(
                std::io::ErrorKind::Other,
                format!("task aborted: {err}"),
            ))
        })?;
        match error {
            Some(err) if !matches!(cause, EndCause::Completed | EndCause::Canceled) => Err(err),
            _ => Ok(cause),
        }
    }
}

/// Internal halt reason; mapped onto [`EndCause`] at the single exit point.
enum TaskHalt {
    Canceled,
    PreAllocate(Error),
    Failed(Error),
}

struct Coordinator {
    task: Arc<Task>,
    options: TaskOptions,
    sinks: SinkSet,
    token: CancellationToken,
    permits: Arc<Semaphore>,
    running: Arc<Mutex<HashMap<TaskId, CancellationToken>>>,
    _guard: ActiveGuard,
}

impl Coordinator {
    async fn run(self) -> (EndCause, Option<Error>) {
        let (cause, error) = match self.drive().await {
            Ok(()) => (EndCause::Completed, None),
            Err(TaskHalt::Canceled) => (EndCause::Canceled, None),
            Err(TaskHalt::PreAllocate(err)) => (EndCause::PreAllocateFailed, Some(err)),
            Err(TaskHalt::Failed(err)) => (EndCause::Error, Some(err)),
        };

        lock_running(&self.running).remove(&self.task.id);
        self.sinks.task_end(&self.task, cause, error.as_ref());
        (cause, error)
    }

    async fn drive(&self) -> std::result::Result<(), TaskHalt> {
        let task = &self.task;
        self.sinks.task_start(task);

        // cancellation is observable even while queued behind the task cap
        let _permit = tokio::select! {
            _ = self.token.cancelled() => return Err(TaskHalt::Canceled),
            permit = self.permits.clone().acquire_owned() => permit
                .map_err(|_| TaskHalt::Failed(Error::InvalidInput("engine is shut down".into())))?,
        };

        // Probing
        self.sinks.connect_trial_start(task);
        let probe = tokio::select! {
            _ = self.token.cancelled() => return Err(TaskHalt::Canceled),
            result = retry_on_network_error(&self.options.retry, || {
                probe::probe(&GLOBAL_CLIENT, &task.url)
            }) => result.map_err(TaskHalt::Failed)?,
        };
        self.sinks.connect_trial_end(task, &probe);

        // Splitting, or reuse of a validated breakpoint layout
        let (blocks, resumed) = self.plan_blocks(&probe).await;
        let persist = probe.resumable && !blocks.is_empty();

        if !resumed {
            if task.path.exists() && self.options.overwrite == OverwriteBehavior::NeverOverwrite {
                return Err(TaskHalt::Failed(Error::IoError(std::io::Error::new(
                    std::io::ErrorKind::AlreadyExists,
                    format!(
                        "File already exists: {} (pass OverwriteBehavior::Force to replace it)",
                        task.path.display()
                    ),
                ))));
            }
            pre_allocate(&task.path, probe.content_length)
                .await
                .map_err(|err| TaskHalt::PreAllocate(Error::PreAllocateFailed(err)))?;
        }

        if persist {
            self.save_breakpoint(&probe, &blocks).await;
        }

        // Fetching
        let fetch_token = self.token.child_token();
        let mut join: JoinSet<(u32, BlockOutcome)> = JoinSet::new();
        for block in &blocks {
            if block.is_done() {
                block.set_state(BlockState::Done);
            } else {
                self.spawn_worker(&mut join, Arc::clone(block), &fetch_token, Duration::ZERO);
            }
        }

        let mut retries: HashMap<(u32, RetryKind), u32> = HashMap::new();
        let mut failure: Option<Error> = None;
        let mut sync = tokio::time::interval(BREAKPOINT_SYNC_INTERVAL);
        sync.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = sync.tick() => {
                    if persist {
                        self.save_breakpoint(&probe, &blocks).await;
                    }
                }
                next = join.join_next() => {
                    let Some(result) = next else { break };
                    match result {
                        Err(join_err) => {
                            warn!("task {}: block worker aborted: {join_err}", task.id);
                            if failure.is_none() {
                                failure = Some(Error::IoError(std::io::Error::new(
                                    std::io::ErrorKind::Other,
                                    format!("block worker aborted: {join_err}"),
                                )));
                                fetch_token.cancel();
                            }
                        }
                        Ok((index, BlockOutcome::Done)) => {
                            debug!("task {}: block {index} done", task.id);
                        }
                        Ok((_, BlockOutcome::Canceled)) => {}
                        Ok((index, BlockOutcome::Failed(err))) => {
                            self.handle_block_failure(
                                index,
                                err,
                                &blocks,
                                &mut join,
                                &fetch_token,
                                &mut retries,
                                &mut failure,
                            );
                        }
                    }
                }
            }
        }

        let canceled = self.token.is_cancelled() && failure.is_none();
        if persist && (canceled || failure.is_some()) {
            // partial progress stays resumable
            self.save_breakpoint(&probe, &blocks).await;
        }
        if canceled {
            return Err(TaskHalt::Canceled);
        }
        if let Some(err) = failure {
            return Err(TaskHalt::Failed(err));
        }

        // Finalizing
        if self.token.is_cancelled() {
            if persist {
                self.save_breakpoint(&probe, &blocks).await;
            }
            return Err(TaskHalt::Canceled);
        }
        self.finalize(&probe, &blocks).await.map_err(TaskHalt::Failed)?;
        Ok(())
    }

    /// Decide between reusing a validated breakpoint layout and a fresh
    /// split, emitting the matching event.
    async fn plan_blocks(&self, probe: &ProbeResult) -> (Vec<Arc<Block>>, bool) {
        let task = &self.task;

        let existing = if self.options.resume
            && self.options.overwrite != OverwriteBehavior::Force
        {
            match BreakpointStore::load(&task.path).await {
                Ok(info) => info,
                Err(err) => {
                    warn!("task {}: failed to load breakpoint: {err}", task.id);
                    None
                }
            }
        } else {
            None
        };

        match existing {
            Some(info) => match info.validate(task, probe) {
                None => {
                    info!(
                        "task {}: resuming from breakpoint, {} of {} bytes present",
                        task.id,
                        info.total_completed(),
                        info.content_length
                    );
                    self.sinks.download_from_breakpoint(task, &info);
                    (info.restore_blocks().into_iter().map(Arc::new).collect(), true)
                }
                Some(cause) => {
                    info!("task {}: breakpoint rejected ({cause}), starting over", task.id);
                    if let Err(err) = BreakpointStore::remove(&task.path).await {
                        warn!("task {}: failed to drop stale breakpoint: {err}", task.id);
                    }
                    self.sinks
                        .download_from_beginning(task, probe.content_length, Some(cause));
                    (self.fresh_blocks(probe), false)
                }
            },
            None => {
                // a sidecar skipped by --no-resume/force must not survive
                if let Err(err) = BreakpointStore::remove(&task.path).await {
                    warn!("task {}: failed to drop stale breakpoint: {err}", task.id);
                }
                self.sinks.download_from_beginning(task, probe.content_length, None);
                (self.fresh_blocks(probe), false)
            }
        }
    }

    fn fresh_blocks(&self, probe: &ProbeResult) -> Vec<Arc<Block>> {
        match probe.content_length {
            Some(len) => {
                let count = if probe.resumable {
                    self.options
                        .block_count
                        .unwrap_or_else(|| block::default_block_count(len, self.options.max_blocks))
                } else {
                    // no range support: a single connection streams everything
                    1
                };
                block::split(len, count).into_iter().map(Arc::new).collect()
            }
            None => vec![Arc::new(Block::single_unknown())],
        }
    }

    fn spawn_worker(
        &self,
        join: &mut JoinSet<(u32, BlockOutcome)>,
        block: Arc<Block>,
        token: &CancellationToken,
        delay: Duration,
    ) {
        let worker = FetchWorker {
            client: GLOBAL_CLIENT.clone(),
            task: Arc::clone(&self.task),
            block,
            sinks: self.sinks.clone(),
            token: token.clone(),
            read_timeout: self.options.read_timeout,
            start_delay: delay,
        };
        join.spawn(worker.run());
    }

    #[allow(clippy::too_many_arguments)]
    fn handle_block_failure(
        &self,
        index: u32,
        err: Error,
        blocks: &[Arc<Block>],
        join: &mut JoinSet<(u32, BlockOutcome)>,
        fetch_token: &CancellationToken,
        retries: &mut HashMap<(u32, RetryKind), u32>,
        failure: &mut Option<Error>,
    ) {
        let task_id = self.task.id;
        if failure.is_some() || self.token.is_cancelled() {
            debug!("task {task_id}: block {index} failure after teardown: {err}");
            return;
        }

        if let Some(kind) = err.retry_kind() {
            let attempts = retries.entry((index, kind)).or_insert(0);
            if *attempts < self.options.retry.max_retries {
                *attempts += 1;
                let delay = self.options.retry.delay(*attempts);
                warn!(
                    "task {task_id}: block {index} failed ({err}); retry {}/{} in {delay:?}",
                    attempts, self.options.retry.max_retries
                );
                if let Some(block) = blocks.get(index as usize) {
                    self.spawn_worker(join, Arc::clone(block), fetch_token, delay);
                    return;
                }
            } else {
                warn!("task {task_id}: block {index} retry budget exhausted");
            }
        } else {
            warn!("task {task_id}: block {index} failed permanently: {err}");
        }

        *failure = Some(err);
        fetch_token.cancel();
    }

    async fn save_breakpoint(&self, probe: &ProbeResult, blocks: &[Arc<Block>]) {
        let Some(content_length) = probe.content_length else { return };
        let info = BreakpointInfo::capture(&self.task, content_length, probe, blocks);
        if let Err(err) = BreakpointStore::save(&info).await {
            warn!("task {}: failed to save breakpoint: {err}", self.task.id);
        }
    }

    async fn finalize(&self, probe: &ProbeResult, blocks: &[Arc<Block>]) -> Result<()> {
        let task = &self.task;
        let transferred: u64 = blocks.iter().map(|b| b.bytes_completed()).sum();

        if let Some(expected) = probe.content_length {
            if transferred != expected {
                return Err(Error::SizeMismatch { expected, actual: transferred });
            }
            let actual = tokio::fs::metadata(&task.path).await?.len();
            if actual != expected {
                return Err(Error::SizeMismatch { expected, actual });
            }
        }

        // durability before the breakpoint record disappears
        let file = tokio::fs::OpenOptions::new()
            .write(true)
            .open(&task.path)
            .await?;
        file.sync_all().await?;

        if let Err(err) = BreakpointStore::remove(&task.path).await {
            warn!("task {}: failed to remove breakpoint: {err}", task.id);
        }
        info!("task {}: completed, {transferred} bytes", task.id);
        Ok(())
    }
}

/// Execute an operation, retrying retryable failures per `policy`.
async fn retry_on_network_error<F, Fut, T>(policy: &RetryPolicy, operation: F) -> Result<T>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let mut attempt = 0;

    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(err) if err.retry_kind().is_some() && attempt < policy.max_retries => {
                attempt += 1;
                let delay = policy.delay(attempt);
                warn!("network error (attempt {attempt}): {err}; retrying in {delay:?}");
                tokio::time::sleep(delay).await;
            }
            Err(err) => return Err(err),
        }
    }
}

/// Create (or truncate) the destination and reserve its full size so workers
/// can write disjoint regions without racing to extend the file.
async fn pre_allocate(path: &Path, size: Option<u64>) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await?;
        }
    }

    let file = tokio::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)
        .await?;

    if let Some(size) = size {
        file.set_len(size).await?;

        #[cfg(target_os = "linux")]
        if size > 0 {
            use std::os::unix::io::AsRawFd;

            let ret = unsafe { libc::posix_fallocate(file.as_raw_fd(), 0, size as libc::off_t) };
            // unsupported filesystems keep the sparse file from set_len
            if ret != 0 && ret != libc::EOPNOTSUPP && ret != libc::EINVAL {
                return Err(std::io::Error::from_raw_os_error(ret));
            }
        }
    }

    file.sync_all().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use crate::core::task::Backoff;

    #[test]
    fn test_active_guard_rejects_collisions() {
        let task = Task::new("https://example.com/a.bin", "/tmp/monarch-active-a.bin");
        let guard = ActiveGuard::register(&task).unwrap();

        // identical task: same id wins the check
        let same = Task::new("https://example.com/a.bin", "/tmp/monarch-active-a.bin");
        assert!(matches!(
            ActiveGuard::register(&same),
            Err(Error::SameTaskBusy(_))
        ));

        // different url, same destination
        let busy = Task::new("https://example.com/b.bin", "/tmp/monarch-active-a.bin");
        assert!(matches!(ActiveGuard::register(&busy), Err(Error::FileBusy(_))));

        drop(guard);
        let again = ActiveGuard::register(&same).unwrap();
        drop(again);
    }

    #[tokio::test]
    async fn test_retry_respects_policy_budget() {
        let policy = RetryPolicy {
            max_retries: 2,
            backoff: Backoff::Fixed(Duration::from_millis(10)),
        };
        let calls = Arc::new(AtomicUsize::new(0));

        let calls_clone = Arc::clone(&calls);
        let result: Result<()> = retry_on_network_error(&policy, || {
            let calls = Arc::clone(&calls_clone);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(Error::NetworkError("simulated".into()))
            }
        })
        .await;

        assert!(result.is_err());
        // initial attempt plus two retries
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_recovers_after_transient_failures() {
        let policy = RetryPolicy {
            max_retries: 3,
            backoff: Backoff::Fixed(Duration::from_millis(5)),
        };
        let calls = Arc::new(AtomicUsize::new(0));

        let calls_clone = Arc::clone(&calls);
        let result = retry_on_network_error(&policy, || {
            let calls = Arc::clone(&calls_clone);
            async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(Error::NetworkError("simulated".into()))
                } else {
                    Ok("success")
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), "success");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_gives_up_on_permanent_error() {
        let policy = RetryPolicy::default();
        let calls = Arc::new(AtomicUsize::new(0));

        let calls_clone = Arc::clone(&calls);
        let result: Result<()> = retry_on_network_error(&policy, || {
            let calls = Arc::clone(&calls_clone);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(Error::HttpStatus { status: 403, context: "trial".into() })
            }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_pre_allocate_reserves_size() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.bin");

        pre_allocate(&path, Some(4096)).await.unwrap();
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 4096);

        // re-allocating truncates back to the requested size
        pre_allocate(&path, Some(128)).await.unwrap();
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 128);
    }

    #[tokio::test]
    async fn test_pre_allocate_unknown_size_creates_empty_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.bin");

        pre_allocate(&path, None).await.unwrap();
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 0);
    }
}
