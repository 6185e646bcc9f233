//! Incremental synchronization of a tree with its live source.
//!
//! A run walks the stored tree and the source in lockstep. Each folder is
//! compared with [`diff_folder`] and the resulting changes are applied one at
//! a time: new and modified documents are parsed and written to the search
//! index, vanished ones are deleted from it, and the tree is updated to match.
//!
//! # Consistency
//!
//! Cancellation is checked before every change, never in the middle of one, so
//! a stopped run leaves exactly the processed documents in both the tree and
//! the index. Per-node failures are recorded on the node and reported; only a
//! failure at the root or in the search index aborts the run.
//!
//! # Sources
//!
//! - [`filesystem`]: directories, with tar archives found inside them
//! - [`archive`]: tar and tar.gz files, as index roots or nested in directories
//! - [`mail`]: mail stores opened through a [`mail::MailStoreOpener`]

pub mod archive;
pub mod filesystem;
pub mod mail;

use std::{
  any::Any,
  panic::{self, AssertUnwindSafe},
  path::{Path, PathBuf},
};

use chrono::Utc;
use ignore::gitignore::{Gitignore, GitignoreBuilder};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

use crate::{
  domain::{
    config::IndexConfig,
    index::{Index, IndexKind},
  },
  parse::{ParseError, ParseResult, Parser},
  reporter::{InfoType, Reporter},
  store::{DocumentWriter, IndexDocument, SearchIndex, StoreError},
  tree::{
    DocumentType, ErrorType, Folder, INTERRUPTED_TIMESTAMP, IndexingError,
    diff::{ChildChange, LiveEntry, LiveKind, diff_folder},
  },
};

// ============================================================================
// Errors and results
// ============================================================================

/// Failures that abort a whole run
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
  #[error("Failed to read {path}: {source}")]
  Io {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },

  #[error("Not an archive: {0}")]
  NotAnArchive(PathBuf),

  #[error("Failed to read archive {path}: {message}")]
  Archive { path: PathBuf, message: String },

  #[error("Search index error: {0}")]
  Store(#[from] StoreError),

  #[error("Mail store error: {0}")]
  MailStore(#[from] mail::MailStoreError),

  #[error("No mail store reader available")]
  NoMailReader,
}

impl SyncError {
  pub fn io(path: &Path, source: std::io::Error) -> Self {
    SyncError::Io {
      path: path.to_path_buf(),
      source,
    }
  }

  pub fn error_type(&self) -> ErrorType {
    match self {
      SyncError::Io { .. } | SyncError::Store(_) => ErrorType::IoException,
      SyncError::NotAnArchive(_) => ErrorType::NotAnArchive,
      SyncError::Archive { .. } => ErrorType::Archive,
      SyncError::MailStore(mail::MailStoreError::Encrypted) => ErrorType::ArchiveEncrypted,
      SyncError::MailStore(_) | SyncError::NoMailReader => ErrorType::IoException,
    }
  }
}

/// Result of one run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
  SuccessChanged,
  SuccessUnchanged,
  Failure,
}

/// Counters collected during a run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncStats {
  pub added: usize,
  pub updated: usize,
  pub removed: usize,
  pub unchanged: usize,
  pub errors: usize,
  /// The run stopped early because its token was cancelled
  pub canceled: bool,
}

impl SyncStats {
  pub fn changed(&self) -> bool {
    self.added + self.updated + self.removed > 0
  }

  pub fn outcome(&self) -> SyncOutcome {
    if self.changed() {
      SyncOutcome::SuccessChanged
    } else {
      SyncOutcome::SuccessUnchanged
    }
  }
}

/// Outcome and counters of a finished run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncReport {
  pub outcome: SyncOutcome,
  pub stats: SyncStats,
  /// Root-level failure message when the outcome is [`SyncOutcome::Failure`]
  pub error: Option<String>,
}

// ============================================================================
// Context
// ============================================================================

/// Collaborators of a run
#[derive(Clone, Copy)]
pub struct SyncContext<'a> {
  pub config: &'a IndexConfig,
  pub parser: &'a dyn Parser,
  pub reporter: &'a dyn Reporter,
  pub cancel: &'a CancellationToken,
  pub mail: Option<&'a dyn mail::MailStoreOpener>,
}

// ============================================================================
// Entry points
// ============================================================================

/// Update (or with `rebuild`, recreate) an index from its source.
///
/// Opens the search index, synchronizes a copy of the tree, commits and
/// installs the new tree. A failed run rolls back uncommitted writes and keeps
/// the previous tree with the failure attached to its root, leaving earlier
/// commits untouched.
#[instrument(skip_all, fields(index = %index.display_name(), rebuild))]
pub fn run_sync(index: &Index, rebuild: bool, writer_heap_bytes: usize, ctx: &SyncContext<'_>) -> SyncReport {
  ctx.reporter.set_start_time(Utc::now());
  let report = match run_inner(index, rebuild, writer_heap_bytes, ctx) {
    Ok(stats) => {
      info!(
        added = stats.added,
        updated = stats.updated,
        removed = stats.removed,
        unchanged = stats.unchanged,
        errors = stats.errors,
        canceled = stats.canceled,
        "Synchronization finished"
      );
      SyncReport {
        outcome: stats.outcome(),
        stats,
        error: None,
      }
    }
    Err(e) => {
      warn!(error = %e, "Synchronization failed");
      fail_run(index, ctx.reporter, e.error_type(), &e)
    }
  };
  ctx.reporter.set_end_time(Utc::now());
  report
}

/// Attach a root-level failure to the stored tree and report it
pub fn fail_run(
  index: &Index,
  reporter: &dyn Reporter,
  error_type: ErrorType,
  message: impl std::fmt::Display,
) -> SyncReport {
  let mut tree = index.tree();
  let error = IndexingError::new(error_type, tree.path(), message);
  reporter.fail(&error);
  let message = error.message.clone();
  tree.set_error(Some(error));
  index.replace_tree(tree);
  SyncReport {
    outcome: SyncOutcome::Failure,
    stats: SyncStats::default(),
    error: Some(message),
  }
}

/// Best-effort text of a panic payload
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
  if let Some(message) = payload.downcast_ref::<&str>() {
    (*message).to_string()
  } else if let Some(message) = payload.downcast_ref::<String>() {
    message.clone()
  } else {
    "unknown panic".to_string()
  }
}

fn run_inner(index: &Index, rebuild: bool, writer_heap_bytes: usize, ctx: &SyncContext<'_>) -> Result<SyncStats, SyncError> {
  let search = SearchIndex::open_or_create(index.index_dir())?;
  let mut writer = search.writer(writer_heap_bytes)?;

  let mut root = index.tree();
  if rebuild {
    writer.delete_all()?;
    root.remove_children();
  }

  match synchronize(index, &mut root, &mut writer, ctx) {
    Ok(stats) => {
      writer.commit()?;
      index.replace_tree(root);
      Ok(stats)
    }
    Err(e) => {
      if let Err(rollback) = writer.rollback() {
        warn!(error = %rollback, "Failed to roll back search index");
      }
      Err(e)
    }
  }
}

/// Reconcile `root` with the source of `index`, writing changes to `writer`.
///
/// Does not commit; [`run_sync`] records failures on the stored tree.
pub fn synchronize(
  index: &Index,
  root: &mut Folder,
  writer: &mut DocumentWriter,
  ctx: &SyncContext<'_>,
) -> Result<SyncStats, SyncError> {
  root.set_error(None);
  let source = index.canonical_root();
  let mut pass = SyncPass::new(ctx, writer, index.kind().document_type());
  ctx.reporter.info(InfoType::Scanning, root.path(), 0);

  let result = match index.kind() {
    IndexKind::File => filesystem::sync_root(&mut pass, source, root),
    IndexKind::Mail => mail::sync_store(&mut pass, source, root),
  };

  result.map(|()| pass.stats)
}

// ============================================================================
// Shared pass state
// ============================================================================

/// Text and headers extracted from one document
#[derive(Debug, Default)]
pub(crate) struct Extracted {
  pub result: ParseResult,
  pub sender: Option<String>,
  pub recipients: Vec<String>,
  /// Overrides the modification time as the indexed date
  pub date: Option<i64>,
}

impl From<ParseResult> for Extracted {
  fn from(result: ParseResult) -> Self {
    Self {
      result,
      ..Default::default()
    }
  }
}

/// The live side of one folder during a pass
pub(crate) trait FolderSource {
  fn entries(&self) -> &[LiveEntry];

  fn extract(&self, pass: &SyncPass<'_, '_>, document_path: &str, name: &str) -> Result<Extracted, ParseError>;

  /// Reconcile the subfolder named by `entry` with its live counterpart
  fn descend(&self, pass: &mut SyncPass<'_, '_>, entry: &LiveEntry, folder: &mut Folder) -> Result<(), SyncError>;
}

/// State of one run: writer, counters and filters
pub(crate) struct SyncPass<'c, 'w> {
  pub ctx: &'c SyncContext<'c>,
  writer: &'w mut DocumentWriter,
  doc_type: DocumentType,
  excludes: Gitignore,
  processed: usize,
  pub stats: SyncStats,
}

impl<'c, 'w> SyncPass<'c, 'w> {
  fn new(ctx: &'c SyncContext<'c>, writer: &'w mut DocumentWriter, doc_type: DocumentType) -> Self {
    Self {
      ctx,
      writer,
      doc_type,
      excludes: build_excludes(&ctx.config.exclude_patterns),
      processed: 0,
      stats: SyncStats::default(),
    }
  }

  pub fn is_canceled(&mut self) -> bool {
    if self.ctx.cancel.is_cancelled() {
      self.stats.canceled = true;
    }
    self.stats.canceled
  }

  /// Whether a child named `name` is skipped by the exclude patterns
  pub fn is_excluded(&self, name: &str, is_dir: bool) -> bool {
    self.excludes.matched(name, is_dir).is_ignore()
  }

  /// Whether a file named `name` becomes a document
  pub fn is_indexable(&self, name: &str) -> bool {
    self.ctx.config.index_filenames || self.ctx.parser.can_parse(name)
  }

  /// Record a failure on a node and report it
  pub fn record(&mut self, error: IndexingError) -> IndexingError {
    self.ctx.reporter.fail(&error);
    self.stats.errors += 1;
    error
  }

  /// Apply the diff between `folder` and `source`, then refresh the deep content flag
  pub fn reconcile<S: FolderSource>(&mut self, folder: &mut Folder, source: &S) -> Result<(), SyncError> {
    folder.set_error(None);
    let result = self.apply_changes(folder, source);
    folder.refresh_deep_content();
    result
  }

  fn apply_changes<S: FolderSource>(&mut self, folder: &mut Folder, source: &S) -> Result<(), SyncError> {
    for change in diff_folder(folder, source.entries()) {
      if self.is_canceled() {
        return Ok(());
      }
      match change {
        ChildChange::AddedDocument(entry) => self.store_document(folder, source, &entry, false)?,
        ChildChange::ModifiedDocument(entry) => self.store_document(folder, source, &entry, true)?,
        ChildChange::UnchangedDocument(_) => self.stats.unchanged += 1,
        ChildChange::AddedFolder(entry) => {
          let mut subfolder = folder.new_subfolder(&entry.name, None);
          source.descend(self, &entry, &mut subfolder)?;
          folder.put_subfolder(subfolder);
        }
        ChildChange::ExistingFolder(entry) => {
          if let Some(subfolder) = folder.subfolder_mut(&entry.name) {
            source.descend(self, &entry, subfolder)?;
          }
        }
        ChildChange::UnchangedFolder(_) => {}
        ChildChange::RemovedDocument(name) => {
          if let Some(document) = folder.remove_document(&name) {
            self.ctx.reporter.info(InfoType::Removing, document.path(), self.processed);
            self.writer.delete(&document.uid());
            self.stats.removed += 1;
          }
        }
        ChildChange::RemovedFolder(name) => {
          if let Some(subfolder) = folder.remove_subfolder(&name) {
            self.ctx.reporter.info(InfoType::Removing, subfolder.path(), self.processed);
            for uid in subfolder.document_ids() {
              self.writer.delete(&uid);
              self.stats.removed += 1;
            }
          }
        }
      }
    }
    Ok(())
  }

  /// Run the source's extraction, turning a parser panic into a parse error
  fn extract_guarded<S: FolderSource>(&self, source: &S, document_path: &str, name: &str) -> Result<Extracted, ParseError> {
    panic::catch_unwind(AssertUnwindSafe(|| source.extract(self, document_path, name))).unwrap_or_else(|payload| {
      let message = panic_message(payload.as_ref());
      error!(path = %document_path, panic = %message, "Parser panicked");
      Err(ParseError::Crashed(message))
    })
  }

  /// Parse and index a new or modified document, then attach it to `folder`
  fn store_document<S: FolderSource>(
    &mut self,
    folder: &mut Folder,
    source: &S,
    entry: &LiveEntry,
    modified: bool,
  ) -> Result<(), SyncError> {
    let LiveKind::Document { last_modified, size } = entry.kind else {
      return Ok(());
    };
    let mut document = folder.new_document(self.doc_type, &entry.name, last_modified, size);

    self.processed += 1;
    self
      .ctx
      .reporter
      .info(InfoType::Extracting, document.path(), self.processed);

    let extracted = match self.extract_guarded(source, document.path(), &entry.name) {
      Ok(extracted) => extracted,
      Err(ParseError::Canceled) => {
        // Keep the old entry but force a reparse next time
        if modified && let Some(existing) = folder.document_mut(&entry.name) {
          existing.set_last_modified(INTERRUPTED_TIMESTAMP);
        }
        self.stats.canceled = true;
        return Ok(());
      }
      Err(e) => {
        let error = IndexingError::new(e.error_type(), document.path(), &e);
        document.set_error(Some(self.record(error)));
        Extracted::default()
      }
    };

    document.set_title(extracted.result.title.clone());
    let index_document = IndexDocument {
      uid: document.uid(),
      doc_type: self.doc_type,
      filename: entry.name.clone(),
      title: extracted.result.title,
      content: extracted.result.content,
      size,
      date: extracted.date.unwrap_or(last_modified),
      sender: extracted.sender,
      recipients: extracted.recipients,
    };
    if modified {
      self.writer.update(&index_document)?;
      self.stats.updated += 1;
    } else {
      self.writer.add(&index_document)?;
      self.stats.added += 1;
    }
    folder.put_document(document);
    Ok(())
  }
}

/// Gitignore-style matcher over entry names
pub(crate) fn build_excludes(patterns: &[String]) -> Gitignore {
  let mut builder = GitignoreBuilder::new("");
  for pattern in patterns {
    if let Err(e) = builder.add_line(None, pattern) {
      warn!(pattern = %pattern, error = %e, "Ignoring invalid exclude pattern");
    }
  }
  builder.build().unwrap_or_else(|e| {
    warn!(error = %e, "Failed to build exclude matcher, nothing will be excluded");
    Gitignore::empty()
  })
}
