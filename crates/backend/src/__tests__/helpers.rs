//! Test helpers for synchronizer and queue tests.
//!
//! Provides `SyncTestContext`, which owns a source directory and a data
//! directory, plus parsers that let tests pause or cancel a run at a chosen
//! document.

use std::{
  fs,
  path::{Path, PathBuf},
  sync::{
    Arc, Condvar, Mutex,
    atomic::{AtomicUsize, Ordering},
  },
  time::Duration,
};

use filetime::FileTime;
use flate2::{Compression, write::GzEncoder};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use crate::{
  domain::{
    config::{IndexConfig, QueueConfig},
    index::{Index, IndexKind},
  },
  parse::{ParseError, ParseResult, ParseService, Parser},
  queue::{IndexAction, IndexingQueue, Task},
  registry::Registry,
  reporter::BoundedReporter,
  store::SearchIndex,
  sync::{SyncContext, SyncReport, mail::MailStoreOpener, run_sync},
};

/// Smallest writer budget tantivy accepts; keeps tests light
pub const TEST_WRITER_HEAP: usize = 15_000_000;

/// Test context owning temporary source and index directories.
pub struct SyncTestContext {
  /// Folder being indexed
  pub source_dir: TempDir,
  /// Parent of the index directories
  pub data_dir: TempDir,
  pub config: IndexConfig,
}

impl SyncTestContext {
  pub fn new() -> Self {
    Self {
      source_dir: TempDir::new().expect("create source temp dir"),
      data_dir: TempDir::new().expect("create data temp dir"),
      config: IndexConfig::default(),
    }
  }

  pub fn source(&self, path: &str) -> PathBuf {
    self.source_dir.path().join(path)
  }

  pub fn index_parent(&self) -> PathBuf {
    self.data_dir.path().join("indexes")
  }

  /// Write a file below the source directory with a fixed mtime
  pub fn write_file_at(&self, path: &str, content: &str, mtime_secs: i64) {
    let full_path = self.source(path);
    if let Some(parent) = full_path.parent() {
      fs::create_dir_all(parent).expect("create parent dirs");
    }
    fs::write(&full_path, content).expect("write file");
    set_mtime(&full_path, mtime_secs);
  }

  pub fn write_file(&self, path: &str, content: &str) {
    self.write_file_at(path, content, 1_000_000);
  }

  pub fn write_bytes(&self, path: &str, content: &[u8]) {
    let full_path = self.source(path);
    if let Some(parent) = full_path.parent() {
      fs::create_dir_all(parent).expect("create parent dirs");
    }
    fs::write(&full_path, content).expect("write file");
    set_mtime(&full_path, 1_000_000);
  }

  pub fn delete_file(&self, path: &str) {
    fs::remove_file(self.source(path)).expect("delete file");
  }

  pub fn delete_dir(&self, path: &str) {
    fs::remove_dir_all(self.source(path)).expect("delete dir");
  }

  /// Write a gzip-compressed tar below the source directory
  pub fn write_tar_gz(&self, path: &str, entries: &[(&str, &str)], mtime_secs: i64) {
    let full_path = self.source(path);
    if let Some(parent) = full_path.parent() {
      fs::create_dir_all(parent).expect("create parent dirs");
    }
    let file = fs::File::create(&full_path).expect("create archive");
    let mut builder = tar::Builder::new(GzEncoder::new(file, Compression::default()));
    for (name, content) in entries {
      let mut header = tar::Header::new_gnu();
      header.set_size(content.len() as u64);
      header.set_mode(0o644);
      header.set_mtime(1_000_000);
      header.set_cksum();
      builder
        .append_data(&mut header, name, content.as_bytes())
        .expect("append archive entry");
    }
    builder
      .into_inner()
      .expect("finish tar")
      .finish()
      .expect("finish gzip");
    set_mtime(&full_path, mtime_secs);
  }

  pub fn registry(&self) -> Arc<Registry> {
    Arc::new(Registry::new(self.index_parent(), self.config.clone()))
  }

  /// Fresh unregistered index over the whole source directory
  pub fn new_index(&self) -> Index {
    Index::new(
      IndexKind::File,
      self.source_dir.path().to_path_buf(),
      self.index_parent().join("source"),
    )
  }

  /// Run a synchronization directly, without a queue
  pub fn sync(&self, index: &Index, parser: &dyn Parser, cancel: &CancellationToken) -> (SyncReport, BoundedReporter) {
    self.sync_with(index, parser, cancel, None, false)
  }

  pub fn sync_with(
    &self,
    index: &Index,
    parser: &dyn Parser,
    cancel: &CancellationToken,
    mail: Option<&dyn MailStoreOpener>,
    rebuild: bool,
  ) -> (SyncReport, BoundedReporter) {
    let reporter = BoundedReporter::new(1000);
    let ctx = SyncContext {
      config: &self.config,
      parser,
      reporter: &reporter,
      cancel,
      mail,
    };
    let report = run_sync(index, rebuild, TEST_WRITER_HEAP, &ctx);
    (report, reporter)
  }

  pub fn parser(&self) -> ParseService {
    ParseService::new(self.config.clone())
  }

  pub fn start_queue(&self, registry: Arc<Registry>, parser: Arc<dyn Parser>) -> IndexingQueue {
    let config = QueueConfig {
      reporter_capacity: 100,
      writer_heap_bytes: TEST_WRITER_HEAP,
    };
    IndexingQueue::start(registry, config, parser, None).expect("start queue")
  }

  /// Submit a create task for `root` and wait for it to finish
  pub fn create_and_wait(&self, queue: &IndexingQueue, root: &Path) -> Arc<Task> {
    let index = Arc::new(queue.registry().create_index(IndexKind::File, root));
    let task = queue.add_task(index, IndexAction::Create).expect("create accepted");
    queue.wait_idle();
    task
  }
}

pub fn set_mtime(path: &Path, secs: i64) {
  filetime::set_file_mtime(path, FileTime::from_unix_time(secs, 0)).expect("set mtime");
}

/// Number of committed documents in the search index of `index`
pub fn num_docs(index: &Index) -> u64 {
  SearchIndex::open_or_create(index.index_dir())
    .expect("open search index")
    .num_docs()
}

/// Number of hits for `query` in the search index of `index`
pub fn hits(index: &Index, query: &str) -> usize {
  SearchIndex::open_or_create(index.index_dir())
    .expect("open search index")
    .search(query, 100)
    .expect("search")
    .len()
}

// ============================================================================
// Parsers
// ============================================================================

/// Cancels the run's token after `limit` successful parses
pub struct CancelAfter {
  inner: ParseService,
  limit: usize,
  parsed: AtomicUsize,
  token: CancellationToken,
}

impl CancelAfter {
  pub fn new(inner: ParseService, limit: usize, token: CancellationToken) -> Self {
    Self {
      inner,
      limit,
      parsed: AtomicUsize::new(0),
      token,
    }
  }
}

impl Parser for CancelAfter {
  fn can_parse(&self, name: &str) -> bool {
    self.inner.can_parse(name)
  }

  fn parse_bytes(&self, name: &str, bytes: &[u8], cancel: &CancellationToken) -> Result<ParseResult, ParseError> {
    let result = self.inner.parse_bytes(name, bytes, cancel);
    if self.parsed.fetch_add(1, Ordering::SeqCst) + 1 >= self.limit {
      self.token.cancel();
    }
    result
  }
}

#[derive(Default)]
struct GateState {
  open: bool,
  entered: usize,
}

/// Parser that blocks every parse until the gate is opened.
///
/// Lets tests hold the worker on its first task while they inspect and modify
/// the queue.
#[derive(Default)]
pub struct GatedParser {
  inner: Option<ParseService>,
  state: Mutex<GateState>,
  changed: Condvar,
}

impl GatedParser {
  pub fn new(inner: ParseService) -> Self {
    Self {
      inner: Some(inner),
      ..Default::default()
    }
  }

  pub fn open(&self) {
    let mut state = self.state.lock().expect("gate lock");
    state.open = true;
    self.changed.notify_all();
  }

  /// Block until a parse call is waiting at the gate
  pub fn wait_entered(&self) {
    let state = self.state.lock().expect("gate lock");
    let (_state, timeout) = self
      .changed
      .wait_timeout_while(state, Duration::from_secs(10), |s| s.entered == 0)
      .expect("gate lock");
    assert!(!timeout.timed_out(), "no parse reached the gate");
  }
}

impl Parser for GatedParser {
  fn can_parse(&self, name: &str) -> bool {
    self.inner.as_ref().is_some_and(|p| p.can_parse(name))
  }

  fn parse_bytes(&self, name: &str, bytes: &[u8], _cancel: &CancellationToken) -> Result<ParseResult, ParseError> {
    {
      let mut state = self.state.lock().expect("gate lock");
      state.entered += 1;
      self.changed.notify_all();
      let _state = self.changed.wait_while(state, |s| !s.open).expect("gate lock");
    }
    match &self.inner {
      Some(inner) => inner.parse_bytes(name, bytes, &CancellationToken::new()),
      None => Ok(ParseResult::default()),
    }
  }
}

/// Where [`PanickingParser`] blows up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PanicAt {
  /// While parsing the document
  Parse,
  /// While the synchronizer asks whether the file is parsable
  CanParse,
}

/// Parser that panics on one file name and delegates everything else
pub struct PanickingParser {
  inner: ParseService,
  name: &'static str,
  at: PanicAt,
}

impl PanickingParser {
  pub fn new(inner: ParseService, name: &'static str, at: PanicAt) -> Self {
    Self { inner, name, at }
  }
}

impl Parser for PanickingParser {
  fn can_parse(&self, name: &str) -> bool {
    if self.at == PanicAt::CanParse && name == self.name {
      panic!("format sniffing exploded on {name}");
    }
    self.inner.can_parse(name)
  }

  fn parse_bytes(&self, name: &str, bytes: &[u8], cancel: &CancellationToken) -> Result<ParseResult, ParseError> {
    if self.at == PanicAt::Parse && name == self.name {
      panic!("decoder exploded on {name}");
    }
    self.inner.parse_bytes(name, bytes, cancel)
  }
}
