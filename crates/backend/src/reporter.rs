//! Progress and failure sinks for indexing runs.

use std::{
  collections::VecDeque,
  sync::{Mutex, PoisonError},
};

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::tree::IndexingError;

/// What the synchronizer is doing when it reports progress
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InfoType {
  Scanning,
  Extracting,
  Unpacking,
  Removing,
}

/// Receives events from a running synchronization.
///
/// Called on the worker thread; implementations must be quick or hand the
/// event off.
pub trait Reporter: Send + Sync {
  /// `count` is the running number of processed documents
  fn info(&self, info_type: InfoType, path: &str, count: usize);

  fn fail(&self, error: &IndexingError);

  fn set_start_time(&self, _time: DateTime<Utc>) {}

  fn set_end_time(&self, _time: DateTime<Utc>) {}
}

/// Forwards everything to `tracing`
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingReporter;

impl Reporter for TracingReporter {
  fn info(&self, info_type: InfoType, path: &str, count: usize) {
    debug!(?info_type, path, count, "Indexing progress");
  }

  fn fail(&self, error: &IndexingError) {
    warn!(error_type = %error.error_type, path = %error.path, message = %error.message, "Indexing error");
  }

  fn set_start_time(&self, time: DateTime<Utc>) {
    info!(start = %time, "Indexing started");
  }

  fn set_end_time(&self, time: DateTime<Utc>) {
    info!(end = %time, "Indexing finished");
  }
}

/// One recorded reporter event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReportEntry {
  Info {
    info_type: InfoType,
    path: String,
    count: usize,
  },
  Failure(IndexingError),
}

#[derive(Debug, Default)]
struct BoundedState {
  entries: VecDeque<ReportEntry>,
  start: Option<DateTime<Utc>>,
  end: Option<DateTime<Utc>>,
}

/// Keeps the most recent events of a task so they can be shown after it finished.
///
/// Everything is also logged through [`TracingReporter`].
#[derive(Debug)]
pub struct BoundedReporter {
  capacity: usize,
  state: Mutex<BoundedState>,
}

impl BoundedReporter {
  pub fn new(capacity: usize) -> Self {
    Self {
      capacity: capacity.max(1),
      state: Mutex::new(BoundedState::default()),
    }
  }

  fn push(&self, entry: ReportEntry) {
    let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
    if state.entries.len() == self.capacity {
      state.entries.pop_front();
    }
    state.entries.push_back(entry);
  }

  pub fn entries(&self) -> Vec<ReportEntry> {
    let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
    state.entries.iter().cloned().collect()
  }

  /// Failures still held in the buffer, oldest first
  pub fn failures(&self) -> Vec<IndexingError> {
    let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
    state
      .entries
      .iter()
      .filter_map(|entry| match entry {
        ReportEntry::Failure(error) => Some(error.clone()),
        ReportEntry::Info { .. } => None,
      })
      .collect()
  }

  pub fn start_time(&self) -> Option<DateTime<Utc>> {
    self.state.lock().unwrap_or_else(PoisonError::into_inner).start
  }

  pub fn end_time(&self) -> Option<DateTime<Utc>> {
    self.state.lock().unwrap_or_else(PoisonError::into_inner).end
  }
}

impl Reporter for BoundedReporter {
  fn info(&self, info_type: InfoType, path: &str, count: usize) {
    TracingReporter.info(info_type, path, count);
    self.push(ReportEntry::Info {
      info_type,
      path: path.to_string(),
      count,
    });
  }

  fn fail(&self, error: &IndexingError) {
    TracingReporter.fail(error);
    self.push(ReportEntry::Failure(error.clone()));
  }

  fn set_start_time(&self, time: DateTime<Utc>) {
    TracingReporter.set_start_time(time);
    self.state.lock().unwrap_or_else(PoisonError::into_inner).start = Some(time);
  }

  fn set_end_time(&self, time: DateTime<Utc>) {
    TracingReporter.set_end_time(time);
    self.state.lock().unwrap_or_else(PoisonError::into_inner).end = Some(time);
  }
}
