//! Three-way comparison of one folder against the live children of its source.
//!
//! [`diff_folder`] is pure: it only reads the stored folder and the live listing
//! and yields the changes in the order they must be applied. Children present
//! in both are classified by timestamp, live-only children are additions and
//! stored-only children are removals. Removals of vanished children come last
//! so that a pass stopped early never deletes anything it has not confirmed
//! missing. A child that switched between document and folder is the one
//! exception: its removal comes right before the addition replacing it.

use std::collections::BTreeSet;

use super::Folder;

/// Live state of a child as reported by the source
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LiveKind {
  /// Directory or mail folder, always compared entry by entry
  Folder,
  /// Archive: only re-read when its timestamp moved
  Container { last_modified: i64 },
  Document { last_modified: i64, size: u64 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveEntry {
  pub name: String,
  pub kind: LiveKind,
}

impl LiveEntry {
  pub fn folder(name: impl Into<String>) -> Self {
    Self {
      name: name.into(),
      kind: LiveKind::Folder,
    }
  }

  pub fn container(name: impl Into<String>, last_modified: i64) -> Self {
    Self {
      name: name.into(),
      kind: LiveKind::Container { last_modified },
    }
  }

  pub fn document(name: impl Into<String>, last_modified: i64, size: u64) -> Self {
    Self {
      name: name.into(),
      kind: LiveKind::Document { last_modified, size },
    }
  }
}

/// One step of reconciling a folder with its source
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChildChange {
  AddedDocument(LiveEntry),
  ModifiedDocument(LiveEntry),
  UnchangedDocument(String),
  AddedFolder(LiveEntry),
  /// Known folder that has to be compared recursively
  ExistingFolder(LiveEntry),
  /// Known container whose timestamp did not move
  UnchangedFolder(String),
  RemovedDocument(String),
  RemovedFolder(String),
}

impl ChildChange {
  pub fn is_removal(&self) -> bool {
    matches!(self, ChildChange::RemovedDocument(_) | ChildChange::RemovedFolder(_))
  }
}

/// Compare `folder` against the live listing of its source
pub fn diff_folder(folder: &Folder, live: &[LiveEntry]) -> Vec<ChildChange> {
  let mut unseen_documents: BTreeSet<&str> = folder.documents().map(|d| d.name()).collect();
  let mut unseen_folders: BTreeSet<&str> = folder.subfolders().map(|f| f.name()).collect();
  let mut changes = Vec::with_capacity(live.len());

  for entry in live {
    match &entry.kind {
      LiveKind::Document { last_modified, .. } => {
        if unseen_folders.remove(entry.name.as_str()) {
          changes.push(ChildChange::RemovedFolder(entry.name.clone()));
        }
        match folder.document(&entry.name) {
          Some(existing) => {
            unseen_documents.remove(entry.name.as_str());
            if existing.is_modified(*last_modified) {
              changes.push(ChildChange::ModifiedDocument(entry.clone()));
            } else {
              changes.push(ChildChange::UnchangedDocument(entry.name.clone()));
            }
          }
          None => changes.push(ChildChange::AddedDocument(entry.clone())),
        }
      }
      LiveKind::Folder | LiveKind::Container { .. } => {
        if unseen_documents.remove(entry.name.as_str()) {
          changes.push(ChildChange::RemovedDocument(entry.name.clone()));
        }
        match folder.subfolder(&entry.name) {
          Some(existing) => {
            unseen_folders.remove(entry.name.as_str());
            let unchanged_container = match entry.kind {
              LiveKind::Container { last_modified } => existing.last_modified() == Some(last_modified),
              _ => false,
            };
            if unchanged_container {
              changes.push(ChildChange::UnchangedFolder(entry.name.clone()));
            } else {
              changes.push(ChildChange::ExistingFolder(entry.clone()));
            }
          }
          None => changes.push(ChildChange::AddedFolder(entry.clone())),
        }
      }
    }
  }

  changes.extend(
    unseen_documents
      .into_iter()
      .map(|name| ChildChange::RemovedDocument(name.to_string())),
  );
  changes.extend(
    unseen_folders
      .into_iter()
      .map(|name| ChildChange::RemovedFolder(name.to_string())),
  );
  changes
}
