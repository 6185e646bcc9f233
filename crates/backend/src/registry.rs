//! Registry of built indexes.
//!
//! Every index lives in its own directory under the index parent directory:
//! the tantivy segment files plus `tree-index.json`, the persisted tree. The
//! registry restores indexes from those directories and keeps the in-memory set
//! sorted by display name. Listeners are notified synchronously under the
//! registry lock, so they must not call back into the registry.

use std::{
  path::{Path, PathBuf},
  sync::{
    Arc, Mutex, PoisonError,
    atomic::{AtomicI64, Ordering},
  },
};

use chrono::Utc;
use tracing::{debug, info, instrument, warn};

use crate::domain::{
  config::IndexConfig,
  index::{Index, IndexId, IndexKind, IndexSnapshot, canonicalize, contains},
};

/// File holding the serialized tree inside an index directory
pub const TREE_FILE: &str = "tree-index.json";

/// Tree of an index removed with its files kept; [`Registry::load`] skips it
pub const DETACHED_TREE_FILE: &str = "tree-index.json.detached";

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
  #[error("I/O error on {path}: {source}")]
  Io {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },

  #[error("Failed to serialize index {id}: {source}")]
  Serialize {
    id: IndexId,
    #[source]
    source: serde_json::Error,
  },
}

impl RegistryError {
  fn io(path: &Path, source: std::io::Error) -> Self {
    RegistryError::Io {
      path: path.to_path_buf(),
      source,
    }
  }
}

#[derive(Debug, Clone)]
pub enum RegistryEvent {
  Added(Arc<Index>),
  Removed(Arc<Index>),
}

pub type RegistryListener = Box<dyn Fn(&RegistryEvent) + Send + Sync>;

#[derive(Default)]
struct RegistryState {
  /// Sorted by display name
  indexes: Vec<Arc<Index>>,
  listeners: Vec<RegistryListener>,
}

impl RegistryState {
  fn fire(&self, event: &RegistryEvent) {
    for listener in &self.listeners {
      listener(event);
    }
  }
}

/// The set of known indexes
pub struct Registry {
  parent_dir: PathBuf,
  config: IndexConfig,
  state: Mutex<RegistryState>,
  /// Last timestamp handed out for a directory name
  last_stamp: AtomicI64,
}

impl Registry {
  pub fn new(parent_dir: impl Into<PathBuf>, config: IndexConfig) -> Self {
    Self {
      parent_dir: parent_dir.into(),
      config,
      state: Mutex::new(RegistryState::default()),
      last_stamp: AtomicI64::new(0),
    }
  }

  /// Directory holding one subdirectory per index
  pub fn parent_dir(&self) -> &Path {
    &self.parent_dir
  }

  pub fn config(&self) -> &IndexConfig {
    &self.config
  }

  // ==========================================================================
  // Persistence
  // ==========================================================================

  /// Restore every index found under the parent directory.
  ///
  /// Directories without a readable snapshot are skipped with a warning.
  /// Returns the number of indexes added.
  #[instrument(skip(self), fields(dir = %self.parent_dir.display()))]
  pub fn load(&self) -> Result<usize, RegistryError> {
    if !self.parent_dir.exists() {
      return Ok(0);
    }
    let entries = std::fs::read_dir(&self.parent_dir).map_err(|e| RegistryError::io(&self.parent_dir, e))?;

    let mut loaded = 0;
    for entry in entries {
      let entry = match entry {
        Ok(entry) => entry,
        Err(e) => {
          warn!(error = %e, "Skipping unreadable index directory entry");
          continue;
        }
      };
      let index_dir = entry.path();
      let tree_file = index_dir.join(TREE_FILE);
      if !tree_file.is_file() {
        continue;
      }

      let snapshot: IndexSnapshot = match std::fs::read_to_string(&tree_file)
        .map_err(|e| e.to_string())
        .and_then(|json| serde_json::from_str(&json).map_err(|e| e.to_string()))
      {
        Ok(snapshot) => snapshot,
        Err(e) => {
          warn!(path = %tree_file.display(), error = %e, "Skipping unreadable index");
          continue;
        }
      };

      let read_only = std::fs::metadata(&index_dir)
        .map(|m| m.permissions().readonly())
        .unwrap_or(false);
      let index = Arc::new(Index::from_snapshot(snapshot, index_dir, read_only));
      if self.add(index) {
        loaded += 1;
      }
    }

    info!(loaded, "Loaded indexes");
    Ok(loaded)
  }

  /// Persist the tree of `index` next to its search index.
  ///
  /// Indexes on read-only media are skipped.
  #[instrument(skip_all, fields(index = %index.display_name()))]
  pub fn save(&self, index: &Index) -> Result<(), RegistryError> {
    if index.is_read_only() {
      debug!("Skipping save of read-only index");
      return Ok(());
    }

    let dir = index.index_dir();
    std::fs::create_dir_all(dir).map_err(|e| RegistryError::io(dir, e))?;

    let snapshot = index.snapshot();
    let json = serde_json::to_string(&snapshot).map_err(|source| RegistryError::Serialize { id: index.id(), source })?;

    // Write then rename so a crash never leaves a truncated snapshot
    let target = dir.join(TREE_FILE);
    let tmp = dir.join(format!("{TREE_FILE}.tmp"));
    std::fs::write(&tmp, json).map_err(|e| RegistryError::io(&tmp, e))?;
    std::fs::rename(&tmp, &target).map_err(|e| RegistryError::io(&target, e))?;

    debug!(path = %target.display(), "Saved index tree");
    Ok(())
  }

  /// Remove the directory of `index` from disk
  pub fn delete_files(&self, index: &Index) -> Result<(), RegistryError> {
    let dir = index.index_dir();
    match std::fs::remove_dir_all(dir) {
      Ok(()) => {
        info!(dir = %dir.display(), "Deleted index directory");
        Ok(())
      }
      Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
      Err(e) => Err(RegistryError::io(dir, e)),
    }
  }

  /// Keep the directory of `index` but stop it from being loaded again
  pub fn detach_files(&self, index: &Index) -> Result<(), RegistryError> {
    let tree_file = index.index_dir().join(TREE_FILE);
    let detached = index.index_dir().join(DETACHED_TREE_FILE);
    match std::fs::rename(&tree_file, &detached) {
      Ok(()) => {
        info!(dir = %index.index_dir().display(), "Detached index directory");
        Ok(())
      }
      Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
      Err(e) => Err(RegistryError::io(&tree_file, e)),
    }
  }

  // ==========================================================================
  // Index set
  // ==========================================================================

  /// Build an unregistered index for `root` with a fresh directory name.
  ///
  /// In portable mode a root below the working directory is kept relative.
  pub fn create_index(&self, kind: IndexKind, root: &Path) -> Index {
    let canonical = canonicalize(root);
    let root_path = if self.config.store_relative_paths {
      relative_to_cwd(&canonical).unwrap_or_else(|| canonical.clone())
    } else {
      canonical.clone()
    };
    let mut index_dir = self.parent_dir.join(index_dir_name(&canonical, self.next_stamp()));
    while index_dir.exists() {
      index_dir = self.parent_dir.join(index_dir_name(&canonical, self.next_stamp()));
    }
    Index::new(kind, root_path, index_dir)
  }

  /// Current time in milliseconds, strictly increasing across calls
  fn next_stamp(&self) -> i64 {
    let now = Utc::now().timestamp_millis();
    let previous = self
      .last_stamp
      .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| Some(now.max(last + 1)))
      .unwrap_or_else(|last| last);
    now.max(previous + 1)
  }

  /// Register `index`; returns false if an index with the same id is known
  pub fn add(&self, index: Arc<Index>) -> bool {
    let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
    if state.indexes.iter().any(|i| i.id() == index.id()) {
      return false;
    }

    let name = index.display_name();
    let position = state.indexes.partition_point(|i| i.display_name() <= name);
    state.indexes.insert(position, Arc::clone(&index));
    debug!(index = %name, id = %index.id(), "Registered index");
    state.fire(&RegistryEvent::Added(index));
    true
  }

  pub fn remove(&self, id: IndexId) -> Option<Arc<Index>> {
    let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
    let position = state.indexes.iter().position(|i| i.id() == id)?;
    let index = state.indexes.remove(position);
    debug!(index = %index.display_name(), "Unregistered index");
    state.fire(&RegistryEvent::Removed(Arc::clone(&index)));
    Some(index)
  }

  /// Registered indexes sorted by display name
  pub fn indexes(&self) -> Vec<Arc<Index>> {
    self.state.lock().unwrap_or_else(PoisonError::into_inner).indexes.clone()
  }

  pub fn find(&self, id: IndexId) -> Option<Arc<Index>> {
    let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
    state.indexes.iter().find(|i| i.id() == id).cloned()
  }

  /// The index whose root is `path`
  pub fn find_by_root(&self, path: &Path) -> Option<Arc<Index>> {
    let canonical = canonicalize(path);
    let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
    state.indexes.iter().find(|i| i.same_target(&canonical)).cloned()
  }

  pub fn contains(&self, id: IndexId) -> bool {
    self.find(id).is_some()
  }

  /// Register `listener` and return the indexes it has not been told about
  pub fn add_listener(&self, listener: RegistryListener) -> Vec<Arc<Index>> {
    let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
    state.listeners.push(listener);
    state.indexes.clone()
  }
}

/// Sanitized base name of the root plus the creation time in milliseconds
fn index_dir_name(root: &Path, millis: i64) -> String {
  let base = root
    .file_name()
    .map(|n| n.to_string_lossy().into_owned())
    .unwrap_or_else(|| "root".to_string());
  let sanitized: String = base
    .chars()
    .map(|c| if c.is_alphanumeric() { c } else { '_' })
    .collect();
  format!("{sanitized}_{millis}")
}

fn relative_to_cwd(path: &Path) -> Option<PathBuf> {
  let cwd = std::env::current_dir().ok()?.canonicalize().ok()?;
  if !contains(&cwd, path) {
    return None;
  }
  let relative = path.strip_prefix(&cwd).ok()?;
  if relative.as_os_str().is_empty() {
    Some(PathBuf::from("."))
  } else {
    Some(relative.to_path_buf())
  }
}
