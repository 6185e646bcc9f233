//! FolderWatcher - keeps file indexes current while their folders change
//!
//! Watches the roots of all registered file indexes and submits an `Update`
//! task for an index once changes below its root have settled.
//!
//! # Design
//!
//! 1. notify's sync callback forwards events to a channel with `blocking_send`
//! 2. The async task maps each event path to the index whose root contains it
//! 3. Indexes are debounced: an update is submitted only after `debounce_ms`
//!    without further events
//! 4. An update refused because the index is busy stays pending and is retried
//!    on the next tick
//!
//! The set of watched roots follows the registry: it is refreshed on every tick.

use std::{
  collections::{HashMap, HashSet},
  path::{Path, PathBuf},
  sync::Arc,
  time::{Duration, Instant},
};

use ignore::gitignore::Gitignore;
use notify::{Config as NotifyConfig, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::{
  domain::{
    config::WatchConfig,
    index::{Index, IndexId, IndexKind, contains},
  },
  queue::{IndexAction, IndexingQueue, Rejection},
  sync::build_excludes,
};

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum WatchError {
  #[error("Failed to initialize watcher: {0}")]
  Init(#[source] notify::Error),

  #[error("Failed to watch {path}: {source}")]
  Watch {
    path: PathBuf,
    #[source]
    source: notify::Error,
  },
}

// ============================================================================
// Debouncing
// ============================================================================

/// Indexes with unsettled changes and the time of their last event
#[derive(Debug, Default)]
struct PendingUpdates {
  last_event: HashMap<IndexId, Instant>,
}

impl PendingUpdates {
  fn touch(&mut self, id: IndexId, now: Instant) {
    self.last_event.insert(id, now);
  }

  /// Indexes quiet for at least `debounce`
  fn settled(&self, now: Instant, debounce: Duration) -> Vec<IndexId> {
    let mut settled: Vec<_> = self
      .last_event
      .iter()
      .filter(|(_, last)| now.duration_since(**last) >= debounce)
      .map(|(id, _)| *id)
      .collect();
    settled.sort();
    settled
  }

  fn clear(&mut self, id: IndexId) {
    self.last_event.remove(&id);
  }

  fn len(&self) -> usize {
    self.last_event.len()
  }

  fn is_empty(&self) -> bool {
    self.last_event.is_empty()
  }
}

/// The watched index whose root contains `path`
fn owner<'a>(indexes: &'a [Arc<Index>], path: &Path) -> Option<&'a Arc<Index>> {
  indexes.iter().find(|index| contains(index.canonical_root(), path))
}

/// Path notify should watch for an index: the folder itself, or the folder
/// holding an archive root
fn watch_target(index: &Index) -> (PathBuf, RecursiveMode) {
  let root = index.canonical_root();
  if root.is_dir() {
    (root.to_path_buf(), RecursiveMode::Recursive)
  } else {
    let parent = root.parent().unwrap_or(root);
    (parent.to_path_buf(), RecursiveMode::NonRecursive)
  }
}

// ============================================================================
// Watcher
// ============================================================================

/// Async task submitting updates for changed folders
pub struct FolderWatcher {
  queue: Arc<IndexingQueue>,
  config: WatchConfig,
  cancel: CancellationToken,
  // The notify watcher must be held to keep it alive
  watcher: RecommendedWatcher,
  event_rx: mpsc::Receiver<Result<Event, notify::Error>>,
  excludes: Gitignore,
  /// Watched file indexes and the path registered with notify for each
  watched: HashMap<IndexId, PathBuf>,
  /// Indexes whose root could not be watched; retried quietly on every tick
  unwatchable: HashSet<IndexId>,
  indexes: Vec<Arc<Index>>,
}

impl FolderWatcher {
  pub fn new(queue: Arc<IndexingQueue>, config: WatchConfig, cancel: CancellationToken) -> Result<Self, WatchError> {
    let (event_tx, event_rx) = mpsc::channel::<Result<Event, notify::Error>>(256);
    let notify_config = NotifyConfig::default().with_poll_interval(Duration::from_secs(config.poll_interval_secs));

    let watcher = RecommendedWatcher::new(
      move |res| {
        // Runs on notify's thread; events are dropped once the task is gone
        let _ = event_tx.blocking_send(res);
      },
      notify_config,
    )
    .map_err(WatchError::Init)?;

    let excludes = build_excludes(&queue.registry().config().exclude_patterns);
    let mut this = Self {
      queue,
      config,
      cancel,
      watcher,
      event_rx,
      excludes,
      watched: HashMap::new(),
      unwatchable: HashSet::new(),
      indexes: Vec::new(),
    };
    this.refresh_roots();
    Ok(this)
  }

  pub fn spawn(
    queue: Arc<IndexingQueue>,
    config: WatchConfig,
    cancel: CancellationToken,
  ) -> Result<tokio::task::JoinHandle<()>, WatchError> {
    let watcher = Self::new(queue, config, cancel)?;
    Ok(tokio::spawn(watcher.run()))
  }

  /// Run until the cancellation token fires or notify goes away
  pub async fn run(mut self) {
    info!(roots = self.watched.len(), "Folder watcher started");
    let debounce = Duration::from_millis(self.config.debounce_ms);
    let mut pending = PendingUpdates::default();
    let mut tick = tokio::time::interval(debounce.max(Duration::from_millis(10)));

    loop {
      tokio::select! {
        biased;

        _ = self.cancel.cancelled() => {
          info!("Folder watcher shutting down (cancelled)");
          break;
        }

        event = self.event_rx.recv() => {
          match event {
            Some(Ok(event)) => self.process_event(&mut pending, &event),
            Some(Err(e)) => warn!(error = %e, "Watcher error"),
            None => {
              info!("Folder watcher shutting down (channel closed)");
              break;
            }
          }
        }

        _ = tick.tick() => {
          self.refresh_roots();
          self.submit_settled(&mut pending, debounce);
        }
      }
    }

    if !pending.is_empty() {
      debug!(pending = pending.len(), "Dropping unsettled changes on shutdown");
    }
  }

  /// Start watching new file indexes and stop watching removed ones
  fn refresh_roots(&mut self) {
    let indexes: Vec<Arc<Index>> = self
      .queue
      .registry()
      .indexes()
      .into_iter()
      .filter(|index| index.kind() == IndexKind::File)
      .collect();
    let current: HashSet<IndexId> = indexes.iter().map(|index| index.id()).collect();

    let removed: Vec<IndexId> = self.watched.keys().filter(|id| !current.contains(id)).copied().collect();
    for id in removed {
      if let Some(path) = self.watched.remove(&id)
        && !self.watched.values().any(|p| *p == path)
        && let Err(e) = self.watcher.unwatch(&path)
      {
        debug!(path = %path.display(), error = %e, "Failed to unwatch folder");
      }
    }

    self.unwatchable.retain(|id| current.contains(id));

    for index in &indexes {
      if self.watched.contains_key(&index.id()) {
        continue;
      }
      match self.watch_index(index) {
        Ok(()) => {
          self.unwatchable.remove(&index.id());
        }
        Err(e) if self.unwatchable.insert(index.id()) => {
          warn!(index = %index.display_name(), error = %e, "Failed to watch folder");
        }
        Err(e) => trace!(index = %index.display_name(), error = %e, "Folder still cannot be watched"),
      }
    }

    self.indexes = indexes;
  }

  fn watch_index(&mut self, index: &Index) -> Result<(), WatchError> {
    let (path, mode) = watch_target(index);
    if !self.watched.values().any(|p| *p == path) {
      self.watcher.watch(&path, mode).map_err(|source| WatchError::Watch {
        path: path.clone(),
        source,
      })?;
    }
    info!(index = %index.display_name(), path = %path.display(), "Watching folder");
    self.watched.insert(index.id(), path);
    Ok(())
  }

  fn process_event(&mut self, pending: &mut PendingUpdates, event: &Event) {
    if matches!(event.kind, EventKind::Access(_) | EventKind::Other) {
      return;
    }

    let index_parent = self.queue.registry().parent_dir();
    let now = Instant::now();
    for path in &event.paths {
      // Our own writes to index directories inside a watched folder
      if contains(index_parent, path) {
        continue;
      }
      let excluded = path
        .file_name()
        .map(|name| self.excludes.matched(name, path.is_dir()).is_ignore())
        .unwrap_or(false);
      if excluded {
        trace!(path = %path.display(), "Skipping excluded path");
        continue;
      }
      if let Some(index) = owner(&self.indexes, path) {
        trace!(path = %path.display(), index = %index.display_name(), "Change detected");
        pending.touch(index.id(), now);
      }
    }
  }

  fn submit_settled(&self, pending: &mut PendingUpdates, debounce: Duration) {
    for id in pending.settled(Instant::now(), debounce) {
      let Some(index) = self.indexes.iter().find(|index| index.id() == id) else {
        pending.clear(id);
        continue;
      };
      match self.queue.add_task(Arc::clone(index), IndexAction::Update) {
        Ok(task) => {
          debug!(index = %index.display_name(), task = %task.id(), "Submitted update for changed folder");
          pending.clear(id);
        }
        Err(Rejection::RedundantUpdate) => {
          trace!(index = %index.display_name(), "Index busy, retrying update later");
        }
        Err(Rejection::NotRegistered) => {
          debug!(index = %index.display_name(), "Index removed before its update");
          pending.clear(id);
        }
        Err(rejection) => {
          warn!(index = %index.display_name(), %rejection, "Update refused");
          pending.clear(id);
        }
      }
    }
  }
}
