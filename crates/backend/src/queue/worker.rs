//! The worker thread: runs tasks one at a time and settles their indexes.

use std::{
  panic::{self, AssertUnwindSafe},
  sync::{Arc, PoisonError},
};

use chrono::Utc;
use tracing::{error, info, warn};

use super::{CancelAction, IndexAction, QueueEvent, Shared, Task, TaskState};
use crate::{
  sync::{SyncContext, SyncOutcome, SyncReport, fail_run, panic_message, run_sync},
  tree::ErrorType,
};

pub(super) fn run(shared: &Shared) {
  loop {
    let task = {
      let mut state = shared.lock();
      let task = loop {
        if let Some(task) = state.pending.pop_front() {
          break task;
        }
        if state.shutdown {
          info!("Indexing worker stopped");
          return;
        }
        state = shared.available.wait(state).unwrap_or_else(PoisonError::into_inner);
      };
      state.running = Some(Arc::clone(&task));
      task.set_state(TaskState::Indexing);
      state.fire(QueueEvent::Started(Arc::clone(&task)));
      task
    };

    execute(shared, &task);
  }
}

fn execute(shared: &Shared, task: &Arc<Task>) {
  info!(task = %task.id, action = ?task.action, index = %task.index.display_name(), "Indexing task started");
  let ctx = SyncContext {
    config: shared.registry.config(),
    parser: shared.parser.as_ref(),
    reporter: task.reporter.as_ref(),
    cancel: &task.cancel,
    mail: shared.mail.as_deref(),
  };
  let run = panic::catch_unwind(AssertUnwindSafe(|| {
    run_sync(
      &task.index,
      task.action == IndexAction::Rebuild,
      shared.config.writer_heap_bytes,
      &ctx,
    )
  }));
  // A panicking run drops its writer uncommitted and leaves the stored tree as it was
  let report = run.unwrap_or_else(|payload| {
    let message = panic_message(payload.as_ref());
    error!(task = %task.id, panic = %message, "Indexing task panicked");
    let report = fail_run(&task.index, ctx.reporter, ErrorType::Crashed, &message);
    ctx.reporter.set_end_time(Utc::now());
    report
  });

  let mut state = shared.lock();
  settle(shared, task, &report);

  state.running = None;
  {
    let mut control = task.control();
    control.state = TaskState::Finished;
    control.report = Some(report.clone());
  }
  info!(task = %task.id, outcome = ?report.outcome, "Indexing task finished");
  state.fire(QueueEvent::Finished {
    task: Arc::clone(task),
    outcome: report.outcome,
  });
  if state.is_idle() {
    shared.idle.notify_all();
  }
}

/// Register, save or delete the index of a finished task.
///
/// Runs under the queue lock so no submission observes a half-settled index.
fn settle(shared: &Shared, task: &Task, report: &SyncReport) {
  let registry = &shared.registry;
  let index = &task.index;
  let (cancel_action, deletion) = {
    let control = task.control();
    (control.cancel_action, control.deletion)
  };
  let failed = report.outcome == SyncOutcome::Failure;
  let discard = cancel_action == Some(CancelAction::Discard);

  let mut save = false;
  let mut delete = false;
  match deletion {
    Some(delete_files) => {
      registry.remove(index.id());
      super::release_files(registry, index, delete_files);
    }
    None => match task.action {
      IndexAction::Create if failed || discard => delete = true,
      IndexAction::Create => {
        registry.add(Arc::clone(index));
        save = true;
      }
      IndexAction::Rebuild if discard => {
        registry.remove(index.id());
        delete = true;
      }
      // Saving an index unregistered behind the queue's back would bring it back on load
      IndexAction::Update | IndexAction::Rebuild => save = registry.contains(index.id()),
    },
  }

  if save && let Err(e) = registry.save(index) {
    warn!(index = %index.display_name(), error = %e, "Failed to save index");
  }
  if delete && let Err(e) = registry.delete_files(index) {
    warn!(index = %index.display_name(), error = %e, "Failed to delete index files");
  }
}
