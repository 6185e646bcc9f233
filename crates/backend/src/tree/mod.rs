//! In-memory mirror of an indexed source.
//!
//! A tree is a strict hierarchy of [`Folder`]s owning their child folders and
//! [`Document`]s by name. Children are only ever created through
//! [`Folder::new_subfolder`] and [`Folder::new_document`], which derive the
//! child path from the parent, so `child.path == parent.path + "/" + child.name`
//! holds everywhere. Trees serialize with serde so the registry can persist
//! them next to the search index.

pub mod diff;
pub mod simplify;

use std::{collections::BTreeMap, fmt, time::SystemTime};

use serde::{Deserialize, Serialize};

/// Timestamp given to documents whose parse was interrupted, forcing a reparse on the next run
pub const INTERRUPTED_TIMESTAMP: i64 = -1;

/// Milliseconds since the Unix epoch; pre-epoch times clamp to 0
pub fn millis(time: SystemTime) -> i64 {
  time
    .duration_since(SystemTime::UNIX_EPOCH)
    .map(|d| d.as_millis() as i64)
    .unwrap_or(0)
}

// ============================================================================
// Errors attached to nodes
// ============================================================================

/// Category of a per-node indexing failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorType {
  Archive,
  ArchiveEncrypted,
  ArchiveEntry,
  Parsing,
  OutOfMemory,
  NotAnArchive,
  Attachment,
  IoException,
  /// The indexing run itself panicked
  Crashed,
}

impl fmt::Display for ErrorType {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let label = match self {
      ErrorType::Archive => "archive error",
      ErrorType::ArchiveEncrypted => "encrypted archive",
      ErrorType::ArchiveEntry => "archive entry error",
      ErrorType::Parsing => "parse error",
      ErrorType::OutOfMemory => "out of memory",
      ErrorType::NotAnArchive => "not an archive",
      ErrorType::Attachment => "attachment error",
      ErrorType::IoException => "i/o error",
      ErrorType::Crashed => "indexing crashed",
    };
    f.write_str(label)
  }
}

/// A failure recorded on the folder or document it occurred at
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexingError {
  pub error_type: ErrorType,
  /// Tree path of the offending node
  pub path: String,
  pub message: String,
}

impl IndexingError {
  pub fn new(error_type: ErrorType, path: impl Into<String>, message: impl fmt::Display) -> Self {
    Self {
      error_type,
      path: path.into(),
      message: message.to_string(),
    }
  }
}

impl fmt::Display for IndexingError {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{} at {}: {}", self.error_type, self.path, self.message)
  }
}

// ============================================================================
// Documents
// ============================================================================

/// Source a document came from; determines the unique id scheme
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentType {
  File,
  Mail,
}

impl DocumentType {
  pub fn as_str(&self) -> &'static str {
    match self {
      DocumentType::File => "file",
      DocumentType::Mail => "outlook",
    }
  }

  /// Unique id of the document at `path`
  pub fn uid(&self, path: &str) -> String {
    format!("{}://{}", self.as_str(), path)
  }

  pub fn parse(s: &str) -> Option<Self> {
    match s {
      "file" => Some(DocumentType::File),
      "outlook" => Some(DocumentType::Mail),
      _ => None,
    }
  }
}

/// Leaf node: one file, archive entry or mail message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
  name: String,
  path: String,
  doc_type: DocumentType,
  last_modified: i64,
  #[serde(default)]
  size: u64,
  /// Display title when it differs from the name (mail subjects)
  #[serde(default, skip_serializing_if = "Option::is_none")]
  title: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  error: Option<IndexingError>,
}

impl Document {
  pub fn name(&self) -> &str {
    &self.name
  }

  pub fn path(&self) -> &str {
    &self.path
  }

  pub fn doc_type(&self) -> DocumentType {
    self.doc_type
  }

  /// Stable key used to match this document in the search index
  pub fn uid(&self) -> String {
    self.doc_type.uid(&self.path)
  }

  pub fn last_modified(&self) -> i64 {
    self.last_modified
  }

  pub fn set_last_modified(&mut self, last_modified: i64) {
    self.last_modified = last_modified;
  }

  pub fn size(&self) -> u64 {
    self.size
  }

  pub fn title(&self) -> &str {
    self.title.as_deref().unwrap_or(&self.name)
  }

  pub fn set_title(&mut self, title: Option<String>) {
    self.title = title;
  }

  pub fn error(&self) -> Option<&IndexingError> {
    self.error.as_ref()
  }

  pub fn set_error(&mut self, error: Option<IndexingError>) {
    self.error = error;
  }

  /// Whether the live source timestamp differs from the one seen last run
  pub fn is_modified(&self, live_last_modified: i64) -> bool {
    self.last_modified != live_last_modified
  }
}

// ============================================================================
// Folders
// ============================================================================

/// Container node: a directory, an archive or a mail folder
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Folder {
  name: String,
  path: String,
  /// Set for archives and mail stores, whose timestamp gates re-reading them
  #[serde(default, skip_serializing_if = "Option::is_none")]
  last_modified: Option<i64>,
  #[serde(default)]
  documents: BTreeMap<String, Document>,
  #[serde(default)]
  subfolders: BTreeMap<String, Folder>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  error: Option<IndexingError>,
  #[serde(default)]
  has_deep_content: bool,
}

impl Folder {
  /// Create a tree root
  pub fn root(name: impl Into<String>, path: impl Into<String>) -> Self {
    Self {
      name: name.into(),
      path: path.into(),
      last_modified: None,
      documents: BTreeMap::new(),
      subfolders: BTreeMap::new(),
      error: None,
      has_deep_content: false,
    }
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  pub fn path(&self) -> &str {
    &self.path
  }

  pub fn child_path(&self, name: &str) -> String {
    format!("{}/{}", self.path, name)
  }

  pub fn last_modified(&self) -> Option<i64> {
    self.last_modified
  }

  pub fn set_last_modified(&mut self, last_modified: Option<i64>) {
    self.last_modified = last_modified;
  }

  pub fn error(&self) -> Option<&IndexingError> {
    self.error.as_ref()
  }

  pub fn set_error(&mut self, error: Option<IndexingError>) {
    self.error = error;
  }

  pub fn has_deep_content(&self) -> bool {
    self.has_deep_content
  }

  /// A detached subfolder whose path is derived from this folder
  pub fn new_subfolder(&self, name: &str, last_modified: Option<i64>) -> Folder {
    let mut folder = Folder::root(name, self.child_path(name));
    folder.last_modified = last_modified;
    folder
  }

  /// A detached document whose path is derived from this folder
  pub fn new_document(&self, doc_type: DocumentType, name: &str, last_modified: i64, size: u64) -> Document {
    Document {
      name: name.to_string(),
      path: self.child_path(name),
      doc_type,
      last_modified,
      size,
      title: None,
      error: None,
    }
  }

  pub fn document(&self, name: &str) -> Option<&Document> {
    self.documents.get(name)
  }

  pub fn document_mut(&mut self, name: &str) -> Option<&mut Document> {
    self.documents.get_mut(name)
  }

  pub fn subfolder(&self, name: &str) -> Option<&Folder> {
    self.subfolders.get(name)
  }

  pub fn subfolder_mut(&mut self, name: &str) -> Option<&mut Folder> {
    self.subfolders.get_mut(name)
  }

  pub fn documents(&self) -> impl Iterator<Item = &Document> {
    self.documents.values()
  }

  pub fn subfolders(&self) -> impl Iterator<Item = &Folder> {
    self.subfolders.values()
  }

  /// Attach a document created by [`Folder::new_document`], replacing any same-named document
  pub fn put_document(&mut self, document: Document) -> Option<Document> {
    debug_assert_eq!(document.path, self.child_path(&document.name));
    debug_assert!(!self.subfolders.contains_key(&document.name));
    self.documents.insert(document.name.clone(), document)
  }

  /// Attach a folder created by [`Folder::new_subfolder`], replacing any same-named folder
  pub fn put_subfolder(&mut self, folder: Folder) -> Option<Folder> {
    debug_assert_eq!(folder.path, self.child_path(&folder.name));
    debug_assert!(!self.documents.contains_key(&folder.name));
    self.subfolders.insert(folder.name.clone(), folder)
  }

  pub fn remove_document(&mut self, name: &str) -> Option<Document> {
    self.documents.remove(name)
  }

  pub fn remove_subfolder(&mut self, name: &str) -> Option<Folder> {
    self.subfolders.remove(name)
  }

  /// Drop every child, the stored timestamp and the error state
  pub fn remove_children(&mut self) {
    self.documents.clear();
    self.subfolders.clear();
    self.last_modified = None;
    self.error = None;
    self.has_deep_content = false;
  }

  pub fn is_empty(&self) -> bool {
    self.documents.is_empty() && self.subfolders.is_empty()
  }

  /// Recompute the deep content flag from the direct children's flags
  pub fn refresh_deep_content(&mut self) -> bool {
    self.has_deep_content = !self.documents.is_empty() || self.subfolders.values().any(|f| f.has_deep_content);
    self.has_deep_content
  }

  /// All nodes below this folder, depth-first, folders before their contents
  pub fn walk(&self) -> Walk<'_> {
    Walk {
      stack: vec![TreeNode::Folder(self)],
    }
  }

  /// All documents in this subtree
  pub fn documents_deep(&self) -> Vec<&Document> {
    self
      .walk()
      .filter_map(|node| match node {
        TreeNode::Document(doc) => Some(doc),
        TreeNode::Folder(_) => None,
      })
      .collect()
  }

  /// Unique ids of all documents in this subtree
  pub fn document_ids(&self) -> Vec<String> {
    self.documents_deep().into_iter().map(Document::uid).collect()
  }

  pub fn document_count(&self) -> usize {
    self.documents_deep().len()
  }

  /// Every error attached to a node in this subtree, this folder included
  pub fn errors_deep(&self) -> Vec<&IndexingError> {
    self.walk().filter_map(|node| node.error()).collect()
  }
}

// ============================================================================
// Traversal
// ============================================================================

/// Borrowed view of either node kind
#[derive(Debug, Clone, Copy)]
pub enum TreeNode<'a> {
  Folder(&'a Folder),
  Document(&'a Document),
}

impl<'a> TreeNode<'a> {
  pub fn name(&self) -> &'a str {
    match self {
      TreeNode::Folder(f) => &f.name,
      TreeNode::Document(d) => &d.name,
    }
  }

  pub fn path(&self) -> &'a str {
    match self {
      TreeNode::Folder(f) => &f.path,
      TreeNode::Document(d) => &d.path,
    }
  }

  pub fn error(&self) -> Option<&'a IndexingError> {
    match self {
      TreeNode::Folder(f) => f.error.as_ref(),
      TreeNode::Document(d) => d.error.as_ref(),
    }
  }
}

/// Stack-based iterator returned by [`Folder::walk`]
pub struct Walk<'a> {
  stack: Vec<TreeNode<'a>>,
}

impl<'a> Iterator for Walk<'a> {
  type Item = TreeNode<'a>;

  fn next(&mut self) -> Option<Self::Item> {
    let node = self.stack.pop()?;
    if let TreeNode::Folder(folder) = node {
      // Reversed so that children come out in name order
      self
        .stack
        .extend(folder.subfolders.values().rev().map(TreeNode::Folder));
      self
        .stack
        .extend(folder.documents.values().rev().map(TreeNode::Document));
    }
    Some(node)
  }
}
