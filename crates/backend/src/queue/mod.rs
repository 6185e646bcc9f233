//! Indexing queue.
//!
//! A single background worker executes indexing tasks strictly in submission
//! order, because a search index tolerates only one writer. Submissions are
//! validated against the registry and the tasks already queued or running;
//! conflicting ones are refused with a [`Rejection`] instead of being queued.
//!
//! ```text
//! add_task ──> pending (FIFO) ──> running ──> post-processing ──> Finished
//!                  │                  │
//!             remove_task        remove_task / shutdown
//!             (dropped)          (cancelled, Discard or Keep)
//! ```
//!
//! All state lives behind one mutex. Queue events are delivered synchronously
//! while it is held, so listeners must be quick and must not call back into
//! the queue.

mod worker;

use std::{
  collections::VecDeque,
  fmt,
  sync::{
    Arc, Condvar, Mutex, MutexGuard, PoisonError,
    atomic::{AtomicU64, Ordering},
  },
  thread::JoinHandle,
};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
  domain::{
    config::QueueConfig,
    index::{Index, IndexId, IndexKind},
  },
  parse::Parser,
  registry::Registry,
  reporter::BoundedReporter,
  sync::{SyncOutcome, SyncReport, mail::MailStoreOpener},
};

// ============================================================================
// Task types
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(u64);

impl fmt::Display for TaskId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "#{}", self.0)
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexAction {
  /// Build a new index and register it
  Create,
  /// Synchronize a registered index with its source
  Update,
  /// Clear a registered index and build it again
  Rebuild,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
  Ready,
  Indexing,
  Finished,
}

/// What happens to the partial index of a cancelled task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelAction {
  Discard,
  Keep,
}

/// Why a submission was refused
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Rejection {
  #[error("the folder overlaps with an existing index")]
  OverlapWithRegistry,

  #[error("the folder overlaps with a folder waiting to be indexed")]
  OverlapWithQueue,

  #[error("the folder is already indexed")]
  SameInRegistry,

  #[error("the folder is already waiting to be indexed")]
  SameInQueue,

  #[error("an update of this index is already pending")]
  RedundantUpdate,

  #[error("the index has been removed")]
  NotRegistered,

  #[error("the indexing queue is shutting down")]
  Shutdown,
}

#[derive(Debug)]
struct TaskControl {
  state: TaskState,
  cancel_action: Option<CancelAction>,
  /// Set when the index was removed while the task ran; true deletes its files
  deletion: Option<bool>,
  report: Option<SyncReport>,
}

/// One queued or running indexing job
#[derive(Debug)]
pub struct Task {
  id: TaskId,
  index: Arc<Index>,
  action: IndexAction,
  cancel: CancellationToken,
  reporter: Arc<BoundedReporter>,
  control: Mutex<TaskControl>,
}

impl Task {
  fn new(id: TaskId, index: Arc<Index>, action: IndexAction, reporter_capacity: usize) -> Self {
    Self {
      id,
      index,
      action,
      cancel: CancellationToken::new(),
      reporter: Arc::new(BoundedReporter::new(reporter_capacity)),
      control: Mutex::new(TaskControl {
        state: TaskState::Ready,
        cancel_action: None,
        deletion: None,
        report: None,
      }),
    }
  }

  fn control(&self) -> MutexGuard<'_, TaskControl> {
    self.control.lock().unwrap_or_else(PoisonError::into_inner)
  }

  pub fn id(&self) -> TaskId {
    self.id
  }

  pub fn index(&self) -> &Arc<Index> {
    &self.index
  }

  pub fn action(&self) -> IndexAction {
    self.action
  }

  pub fn state(&self) -> TaskState {
    self.control().state
  }

  pub fn cancel_action(&self) -> Option<CancelAction> {
    self.control().cancel_action
  }

  pub fn is_canceled(&self) -> bool {
    self.cancel.is_cancelled()
  }

  /// Progress and failures of this task, kept after it finished
  pub fn reporter(&self) -> &Arc<BoundedReporter> {
    &self.reporter
  }

  /// Result of the run, once finished
  pub fn report(&self) -> Option<SyncReport> {
    self.control().report.clone()
  }

  fn set_state(&self, state: TaskState) {
    self.control().state = state;
  }

  /// Ask a running task to stop; updates always keep what they indexed
  fn request_cancel(&self, action: CancelAction) {
    let action = match self.action {
      IndexAction::Update => CancelAction::Keep,
      _ => action,
    };
    self.control().cancel_action = Some(action);
    self.cancel.cancel();
  }

  fn request_deletion(&self, delete_files: bool) {
    let mut control = self.control();
    let previous = control.deletion.unwrap_or(false);
    control.deletion = Some(previous || delete_files);
  }
}

// ============================================================================
// Events
// ============================================================================

#[derive(Debug, Clone)]
pub enum QueueEvent {
  Added(Arc<Task>),
  /// Dropped before it started
  Removed(Arc<Task>),
  Started(Arc<Task>),
  Finished { task: Arc<Task>, outcome: SyncOutcome },
}

pub type QueueListener = Box<dyn Fn(&QueueEvent) + Send + Sync>;

// ============================================================================
// Queue
// ============================================================================

#[derive(Default)]
struct QueueState {
  pending: VecDeque<Arc<Task>>,
  running: Option<Arc<Task>>,
  shutdown: bool,
  listeners: Vec<QueueListener>,
}

impl QueueState {
  fn fire(&self, event: QueueEvent) {
    for listener in &self.listeners {
      listener(&event);
    }
  }

  /// Running task first, then pending ones in execution order
  fn tasks(&self) -> impl Iterator<Item = &Arc<Task>> {
    self.running.iter().chain(self.pending.iter())
  }

  fn is_idle(&self) -> bool {
    self.pending.is_empty() && self.running.is_none()
  }
}

/// Collaborators shared between the queue handle and its worker
pub(crate) struct Shared {
  registry: Arc<Registry>,
  config: QueueConfig,
  parser: Arc<dyn Parser>,
  mail: Option<Arc<dyn MailStoreOpener>>,
  state: Mutex<QueueState>,
  /// Signalled when a task is queued or the queue shuts down
  available: Condvar,
  /// Signalled when the queue drains
  idle: Condvar,
  next_id: AtomicU64,
}

impl Shared {
  fn lock(&self) -> MutexGuard<'_, QueueState> {
    self.state.lock().unwrap_or_else(PoisonError::into_inner)
  }
}

/// Serializes indexing jobs onto one worker thread
pub struct IndexingQueue {
  shared: Arc<Shared>,
  worker: Mutex<Option<JoinHandle<()>>>,
}

/// How a candidate target relates to an existing one
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Conflict {
  Same,
  Overlap,
}

/// Files conflict on containment; mail stores only on identity
fn conflict(existing: &Index, candidate: &Index) -> Option<Conflict> {
  if existing.kind() != candidate.kind() {
    return None;
  }
  let target = candidate.canonical_root();
  if existing.same_target(target) {
    Some(Conflict::Same)
  } else if existing.kind() == IndexKind::File && existing.overlaps(target) {
    Some(Conflict::Overlap)
  } else {
    None
  }
}

/// Delete or detach the directory of an unregistered index
fn release_files(registry: &Registry, index: &Index, delete_files: bool) {
  let result = if delete_files {
    registry.delete_files(index)
  } else {
    registry.detach_files(index)
  };
  if let Err(e) = result {
    warn!(index = %index.display_name(), error = %e, "Failed to release index files");
  }
}

impl IndexingQueue {
  /// Start the worker thread.
  ///
  /// `mail` opens mail stores for mail indexes; without it their tasks fail.
  pub fn start(
    registry: Arc<Registry>,
    config: QueueConfig,
    parser: Arc<dyn Parser>,
    mail: Option<Arc<dyn MailStoreOpener>>,
  ) -> std::io::Result<Self> {
    let shared = Arc::new(Shared {
      registry,
      config,
      parser,
      mail,
      state: Mutex::new(QueueState::default()),
      available: Condvar::new(),
      idle: Condvar::new(),
      next_id: AtomicU64::new(1),
    });

    let worker_shared = Arc::clone(&shared);
    let handle = std::thread::Builder::new()
      .name("docsync-indexer".to_string())
      .spawn(move || worker::run(&worker_shared))?;

    debug!("Indexing queue started");
    Ok(Self {
      shared,
      worker: Mutex::new(Some(handle)),
    })
  }

  pub fn registry(&self) -> &Arc<Registry> {
    &self.shared.registry
  }

  /// Validate and enqueue a task.
  ///
  /// Creates and rebuilds may not share or overlap their target with a
  /// registered index or a queued task. A rebuild replaces a pending update of
  /// the same index and cancels a running one. An update is refused while its
  /// index has any task. Updates and rebuilds need a registered index.
  pub fn add_task(&self, index: Arc<Index>, action: IndexAction) -> Result<Arc<Task>, Rejection> {
    let mut state = self.shared.lock();
    if state.shutdown {
      return Err(Rejection::Shutdown);
    }

    match action {
      IndexAction::Update => {
        if state.tasks().any(|t| t.index.id() == index.id()) {
          return Err(Rejection::RedundantUpdate);
        }
        if !self.shared.registry.contains(index.id()) {
          return Err(Rejection::NotRegistered);
        }
      }
      IndexAction::Create | IndexAction::Rebuild => {
        if action == IndexAction::Rebuild && !self.shared.registry.contains(index.id()) {
          return Err(Rejection::NotRegistered);
        }
        for existing in self.shared.registry.indexes() {
          if action == IndexAction::Rebuild && existing.id() == index.id() {
            continue;
          }
          match conflict(&existing, &index) {
            Some(Conflict::Same) => return Err(Rejection::SameInRegistry),
            Some(Conflict::Overlap) => return Err(Rejection::OverlapWithRegistry),
            None => {}
          }
        }

        let mut replaced = Vec::new();
        for queued in state.tasks() {
          if action == IndexAction::Rebuild && queued.action == IndexAction::Update && queued.index.id() == index.id() {
            replaced.push(Arc::clone(queued));
            continue;
          }
          match conflict(&queued.index, &index) {
            Some(Conflict::Same) => return Err(Rejection::SameInQueue),
            Some(Conflict::Overlap) => return Err(Rejection::OverlapWithQueue),
            None => {}
          }
        }

        for queued in replaced {
          if state.running.as_ref().is_some_and(|r| r.id == queued.id) {
            debug!(task = %queued.id, "Cancelling running update replaced by rebuild");
            queued.request_cancel(CancelAction::Keep);
          } else {
            state.pending.retain(|t| t.id != queued.id);
            state.fire(QueueEvent::Removed(queued));
          }
        }
      }
    }

    let id = TaskId(self.shared.next_id.fetch_add(1, Ordering::Relaxed));
    let task = Arc::new(Task::new(id, index, action, self.shared.config.reporter_capacity));
    state.pending.push_back(Arc::clone(&task));
    info!(task = %id, ?action, index = %task.index.display_name(), "Queued indexing task");
    state.fire(QueueEvent::Added(Arc::clone(&task)));
    self.shared.available.notify_one();
    Ok(task)
  }

  /// Drop a pending task, or cancel the running one.
  ///
  /// Returns true if the task was pending and is gone. For the running task
  /// cancellation is requested with `action` and false is returned; it ends
  /// with a [`QueueEvent::Finished`].
  pub fn remove_task(&self, id: TaskId, action: CancelAction) -> bool {
    let mut state = self.shared.lock();
    if let Some(position) = state.pending.iter().position(|t| t.id == id)
      && let Some(task) = state.pending.remove(position)
    {
      debug!(task = %id, "Removed pending task");
      state.fire(QueueEvent::Removed(task));
      self.notify_if_idle(&state);
      return true;
    }
    if let Some(running) = &state.running
      && running.id == id
    {
      info!(task = %id, ?action, "Cancelling running task");
      running.request_cancel(action);
    }
    false
  }

  /// Drop every pending task and cancel the running one with `action`
  pub fn remove_all(&self, action: CancelAction) {
    let mut state = self.shared.lock();
    while let Some(task) = state.pending.pop_front() {
      state.fire(QueueEvent::Removed(task));
    }
    if let Some(running) = &state.running {
      running.request_cancel(action);
    }
    self.notify_if_idle(&state);
  }

  /// Unregister indexes, stopping their tasks.
  ///
  /// Pending tasks of these indexes are dropped. An index with a running task
  /// is released once that task stops, so its files are never touched under
  /// the writer. Releasing deletes the directory when `delete_files` is set and
  /// otherwise detaches it, so a later [`Registry::load`] leaves it alone.
  pub fn remove_indexes(&self, indexes: &[Arc<Index>], delete_files: bool) {
    let mut state = self.shared.lock();
    for index in indexes {
      self.shared.registry.remove(index.id());

      let mut i = 0;
      while i < state.pending.len() {
        if state.pending[i].index.id() == index.id() {
          if let Some(task) = state.pending.remove(i) {
            state.fire(QueueEvent::Removed(task));
          }
        } else {
          i += 1;
        }
      }

      let running = state
        .running
        .as_ref()
        .filter(|r| r.index.id() == index.id())
        .cloned();
      match running {
        Some(task) => {
          info!(index = %index.display_name(), "Index removed while indexing, deferring deletion");
          task.request_deletion(delete_files);
          task.request_cancel(CancelAction::Keep);
        }
        None => release_files(&self.shared.registry, index, delete_files),
      }
    }
    self.notify_if_idle(&state);
  }

  /// Running task first, then pending tasks in execution order
  pub fn tasks(&self) -> Vec<Arc<Task>> {
    self.shared.lock().tasks().cloned().collect()
  }

  pub fn find_task(&self, index: IndexId) -> Option<Arc<Task>> {
    self.shared.lock().tasks().find(|t| t.index.id() == index).cloned()
  }

  /// Register `listener` and return the tasks it has not been told about
  pub fn add_listener(&self, listener: QueueListener) -> Vec<Arc<Task>> {
    let mut state = self.shared.lock();
    state.listeners.push(listener);
    state.tasks().cloned().collect()
  }

  /// Block until no task is pending or running
  pub fn wait_idle(&self) {
    let state = self.shared.lock();
    let _state = self
      .shared
      .idle
      .wait_while(state, |s| !s.is_idle())
      .unwrap_or_else(PoisonError::into_inner);
  }

  pub fn is_shut_down(&self) -> bool {
    self.shared.lock().shutdown
  }

  /// Refuse new tasks, drop pending ones, stop the running one (keeping its
  /// progress) and join the worker.
  pub fn shutdown(&self) {
    {
      let mut state = self.shared.lock();
      if !state.shutdown {
        info!("Shutting down indexing queue");
        state.shutdown = true;
        while let Some(task) = state.pending.pop_front() {
          state.fire(QueueEvent::Removed(task));
        }
        if let Some(running) = &state.running {
          running.request_cancel(CancelAction::Keep);
        }
      }
      self.shared.available.notify_all();
      self.notify_if_idle(&state);
    }

    let handle = self.worker.lock().unwrap_or_else(PoisonError::into_inner).take();
    if let Some(handle) = handle
      && handle.join().is_err()
    {
      warn!("Indexing worker panicked");
    }
  }

  fn notify_if_idle(&self, state: &QueueState) {
    if state.is_idle() {
      self.shared.idle.notify_all();
    }
  }
}

impl Drop for IndexingQueue {
  fn drop(&mut self) {
    self.shutdown();
  }
}
