//! Index domain types.
//!
//! An [`Index`] is one indexed source: a directory, an archive file or a mail
//! store. It owns a tree snapshot and a directory holding the search index and
//! the persisted tree. The tree is swapped wholesale after each run so readers
//! always see a consistent snapshot.

use std::{
  fmt,
  path::{Component, Path, PathBuf},
  sync::{PoisonError, RwLock},
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::tree::{DocumentType, Folder};

/// Identifier of a registered index, stable across restarts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IndexId(Uuid);

impl IndexId {
  pub fn new() -> Self {
    Self(Uuid::new_v4())
  }
}

impl Default for IndexId {
  fn default() -> Self {
    Self::new()
  }
}

impl fmt::Display for IndexId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.0)
  }
}

/// Kind of source an index covers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexKind {
  /// A directory or an archive file
  File,
  /// A mail store
  Mail,
}

impl IndexKind {
  pub fn document_type(&self) -> DocumentType {
    match self {
      IndexKind::File => DocumentType::File,
      IndexKind::Mail => DocumentType::Mail,
    }
  }
}

/// Persisted form of an [`Index`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexSnapshot {
  pub id: IndexId,
  pub kind: IndexKind,
  /// Root as configured; relative in portable mode
  pub root_path: PathBuf,
  pub created_at: DateTime<Utc>,
  #[serde(default)]
  pub last_updated: Option<DateTime<Utc>>,
  pub root: Folder,
}

#[derive(Debug)]
struct IndexState {
  root: Folder,
  last_updated: Option<DateTime<Utc>>,
}

/// One indexed source
#[derive(Debug)]
pub struct Index {
  id: IndexId,
  kind: IndexKind,
  root_path: PathBuf,
  canonical_root: PathBuf,
  index_dir: PathBuf,
  created_at: DateTime<Utc>,
  read_only: bool,
  state: RwLock<IndexState>,
}

impl Index {
  /// A fresh index with an empty tree
  pub fn new(kind: IndexKind, root_path: PathBuf, index_dir: PathBuf) -> Self {
    let root = Folder::root(display_name(&root_path), tree_path(&root_path));
    Self {
      id: IndexId::new(),
      kind,
      canonical_root: canonicalize(&root_path),
      root_path,
      index_dir,
      created_at: Utc::now(),
      read_only: false,
      state: RwLock::new(IndexState {
        root,
        last_updated: None,
      }),
    }
  }

  /// Restore an index persisted in `index_dir`
  pub fn from_snapshot(snapshot: IndexSnapshot, index_dir: PathBuf, read_only: bool) -> Self {
    Self {
      id: snapshot.id,
      kind: snapshot.kind,
      canonical_root: canonicalize(&snapshot.root_path),
      root_path: snapshot.root_path,
      index_dir,
      created_at: snapshot.created_at,
      read_only,
      state: RwLock::new(IndexState {
        root: snapshot.root,
        last_updated: snapshot.last_updated,
      }),
    }
  }

  pub fn snapshot(&self) -> IndexSnapshot {
    let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
    IndexSnapshot {
      id: self.id,
      kind: self.kind,
      root_path: self.root_path.clone(),
      created_at: self.created_at,
      last_updated: state.last_updated,
      root: state.root.clone(),
    }
  }

  pub fn id(&self) -> IndexId {
    self.id
  }

  pub fn kind(&self) -> IndexKind {
    self.kind
  }

  /// Root as configured, possibly relative
  pub fn root_path(&self) -> &Path {
    &self.root_path
  }

  /// Absolute, symlink-resolved root used for overlap checks and file access
  pub fn canonical_root(&self) -> &Path {
    &self.canonical_root
  }

  pub fn index_dir(&self) -> &Path {
    &self.index_dir
  }

  pub fn created_at(&self) -> DateTime<Utc> {
    self.created_at
  }

  /// Set when the index directory lives on read-only media
  pub fn is_read_only(&self) -> bool {
    self.read_only
  }

  pub fn display_name(&self) -> String {
    display_name(&self.root_path)
  }

  pub fn last_updated(&self) -> Option<DateTime<Utc>> {
    self.state.read().unwrap_or_else(PoisonError::into_inner).last_updated
  }

  /// Copy of the current tree
  pub fn tree(&self) -> Folder {
    self.state.read().unwrap_or_else(PoisonError::into_inner).root.clone()
  }

  /// Install the tree produced by a synchronization run
  pub fn replace_tree(&self, root: Folder) {
    let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
    state.root = root;
    state.last_updated = Some(Utc::now());
  }

  /// Same target, or one target inside the other
  pub fn overlaps(&self, other: &Path) -> bool {
    contains(&self.canonical_root, other) || contains(other, &self.canonical_root)
  }

  pub fn same_target(&self, other: &Path) -> bool {
    self.canonical_root == other
  }
}

/// Component-wise containment: `/a/b` contains `/a/b/c` but not `/a/bc`
pub fn contains(outer: &Path, inner: &Path) -> bool {
  inner.starts_with(outer)
}

/// Absolute form of `path`, resolving symlinks when the path exists
pub fn canonicalize(path: &Path) -> PathBuf {
  let absolute = if path.is_absolute() {
    path.to_path_buf()
  } else {
    std::env::current_dir()
      .map(|cwd| cwd.join(path))
      .unwrap_or_else(|_| path.to_path_buf())
  };
  std::fs::canonicalize(&absolute).unwrap_or_else(|_| normalize(&absolute))
}

/// Lexically drop `.` and resolve `..` components
fn normalize(path: &Path) -> PathBuf {
  let mut out = PathBuf::new();
  for component in path.components() {
    match component {
      Component::CurDir => {}
      Component::ParentDir => {
        out.pop();
      }
      other => out.push(other),
    }
  }
  out
}

fn display_name(path: &Path) -> String {
  path
    .file_name()
    .map(|n| n.to_string_lossy().into_owned())
    .unwrap_or_else(|| path.to_string_lossy().into_owned())
}

/// Slash-separated form of a filesystem path, used for tree paths and uids
pub fn tree_path(path: &Path) -> String {
  let s = path.to_string_lossy().replace('\\', "/");
  if s.len() > 1 {
    s.trim_end_matches('/').to_string()
  } else {
    s
  }
}
