//! Indexing queue tests.
//!
//! Tests that need a task to stay running use [`GatedParser`], which holds the
//! worker inside its first parse until the test opens the gate. Every such
//! test opens the gate before returning so the queue can shut down.

#[cfg(test)]
mod tests {
  use std::{
    path::Path,
    sync::{Arc, Mutex},
  };

  use pretty_assertions::assert_eq;

  use crate::{
    __tests__::helpers::{GatedParser, PanicAt, PanickingParser, SyncTestContext, num_docs},
    domain::index::{Index, IndexKind},
    parse::Parser,
    queue::{CancelAction, IndexAction, IndexingQueue, QueueEvent, Rejection, TaskId, TaskState},
    registry::{DETACHED_TREE_FILE, Registry, TREE_FILE},
    sync::SyncOutcome,
    tree::ErrorType,
  };

  /// Source tree shared by most tests:
  ///
  /// ```text
  /// docs/a.txt
  /// docs/sub/b.txt
  /// other/c.txt
  /// ```
  fn populated() -> SyncTestContext {
    let ctx = SyncTestContext::new();
    ctx.write_file("docs/a.txt", "alpha");
    ctx.write_file("docs/sub/b.txt", "beta");
    ctx.write_file("other/c.txt", "gamma");
    ctx
  }

  fn gated_queue(ctx: &SyncTestContext, registry: &Arc<Registry>) -> (IndexingQueue, Arc<GatedParser>) {
    let gate = Arc::new(GatedParser::new(ctx.parser()));
    let parser: Arc<dyn Parser> = gate.clone();
    let queue = ctx.start_queue(Arc::clone(registry), parser);
    (queue, gate)
  }

  fn index_for(queue: &IndexingQueue, root: &Path) -> Arc<Index> {
    Arc::new(queue.registry().create_index(IndexKind::File, root))
  }

  /// Create and register an index for `root` on a throwaway ungated queue
  fn registered(ctx: &SyncTestContext, registry: &Arc<Registry>, root: &Path) -> Arc<Index> {
    let queue = ctx.start_queue(Arc::clone(registry), Arc::new(ctx.parser()));
    let task = ctx.create_and_wait(&queue, root);
    assert!(registry.contains(task.index().id()));
    Arc::clone(task.index())
  }

  fn recorded_events(queue: &IndexingQueue) -> Arc<Mutex<Vec<(String, TaskId)>>> {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    queue.add_listener(Box::new(move |event| {
      let (kind, task) = match event {
        QueueEvent::Added(task) => ("added", task),
        QueueEvent::Removed(task) => ("removed", task),
        QueueEvent::Started(task) => ("started", task),
        QueueEvent::Finished { task, .. } => ("finished", task),
      };
      sink.lock().unwrap().push((kind.to_string(), task.id()));
    }));
    events
  }

  // ==========================================================================
  // Admission
  // ==========================================================================

  /// Test: creates are refused when they match or overlap a queued task.
  #[test]
  fn test_create_rejected_against_queue() {
    let ctx = populated();
    let registry = ctx.registry();
    let (queue, gate) = gated_queue(&ctx, &registry);

    let docs = queue.add_task(index_for(&queue, &ctx.source("docs")), IndexAction::Create);
    assert!(docs.is_ok());
    gate.wait_entered();

    let same = queue.add_task(index_for(&queue, &ctx.source("docs")), IndexAction::Create);
    assert_eq!(same.err(), Some(Rejection::SameInQueue));
    let inner = queue.add_task(index_for(&queue, &ctx.source("docs/sub")), IndexAction::Create);
    assert_eq!(inner.err(), Some(Rejection::OverlapWithQueue));
    let outer = queue.add_task(index_for(&queue, ctx.source_dir.path()), IndexAction::Create);
    assert_eq!(outer.err(), Some(Rejection::OverlapWithQueue));
    let other = queue.add_task(index_for(&queue, &ctx.source("other")), IndexAction::Create);
    assert!(other.is_ok());

    gate.open();
    queue.wait_idle();
    assert_eq!(registry.indexes().len(), 2);
  }

  #[test]
  fn test_create_rejected_against_registry() {
    let ctx = populated();
    let registry = ctx.registry();
    registered(&ctx, &registry, &ctx.source("docs"));
    let queue = ctx.start_queue(Arc::clone(&registry), Arc::new(ctx.parser()));

    let same = queue.add_task(index_for(&queue, &ctx.source("docs")), IndexAction::Create);
    assert_eq!(same.err(), Some(Rejection::SameInRegistry));
    let inner = queue.add_task(index_for(&queue, &ctx.source("docs/sub")), IndexAction::Create);
    assert_eq!(inner.err(), Some(Rejection::OverlapWithRegistry));
    let outer = queue.add_task(index_for(&queue, ctx.source_dir.path()), IndexAction::Create);
    assert_eq!(outer.err(), Some(Rejection::OverlapWithRegistry));
  }

  /// Test: however the submissions interleave with the worker, the accepted
  /// roots never overlap.
  #[test]
  fn test_accepted_roots_never_overlap() {
    let ctx = SyncTestContext::new();
    let roots = ["a", "a/b", "a/b/c", "d", "d/e", "f"];
    for root in roots {
      ctx.write_file(&format!("{root}/file.txt"), root);
    }
    let registry = ctx.registry();
    let queue = ctx.start_queue(Arc::clone(&registry), Arc::new(ctx.parser()));

    let accepted: Vec<&str> = roots
      .iter()
      .copied()
      .filter(|root| {
        queue
          .add_task(index_for(&queue, &ctx.source(root)), IndexAction::Create)
          .is_ok()
      })
      .collect();
    queue.wait_idle();

    assert_eq!(accepted, vec!["a", "d", "f"]);
    let indexes = registry.indexes();
    for (i, first) in indexes.iter().enumerate() {
      for second in &indexes[i + 1..] {
        assert!(!first.overlaps(second.canonical_root()));
      }
    }
  }

  #[test]
  fn test_update_rejected_while_index_busy() {
    let ctx = populated();
    let registry = ctx.registry();
    let docs = registered(&ctx, &registry, &ctx.source("docs"));
    let (queue, gate) = gated_queue(&ctx, &registry);

    // Something new to parse so the update reaches the gate
    ctx.write_file("docs/new.txt", "delta");
    let update = queue.add_task(Arc::clone(&docs), IndexAction::Update).expect("update accepted");
    gate.wait_entered();
    assert_eq!(update.state(), TaskState::Indexing);

    let again = queue.add_task(Arc::clone(&docs), IndexAction::Update);
    assert_eq!(again.err(), Some(Rejection::RedundantUpdate));

    gate.open();
    queue.wait_idle();
    assert_eq!(update.state(), TaskState::Finished);
    assert_eq!(num_docs(&docs), 3);
    assert!(queue.add_task(docs, IndexAction::Update).is_ok());
  }

  /// Test: a rebuild takes the place of a pending update of the same index.
  #[test]
  fn test_rebuild_replaces_pending_update() {
    let ctx = populated();
    let registry = ctx.registry();
    let docs = registered(&ctx, &registry, &ctx.source("docs"));
    let (queue, gate) = gated_queue(&ctx, &registry);
    let events = recorded_events(&queue);

    queue
      .add_task(index_for(&queue, &ctx.source("other")), IndexAction::Create)
      .expect("create accepted");
    gate.wait_entered();

    let update = queue.add_task(Arc::clone(&docs), IndexAction::Update).expect("update accepted");
    let rebuild = queue.add_task(Arc::clone(&docs), IndexAction::Rebuild).expect("rebuild accepted");

    let queued: Vec<_> = queue.tasks().iter().map(|t| t.id()).collect();
    assert_eq!(queued.len(), 2);
    assert_eq!(queued[1], rebuild.id());
    assert!(
      events
        .lock()
        .unwrap()
        .contains(&("removed".to_string(), update.id()))
    );

    gate.open();
    queue.wait_idle();
    assert!(registry.contains(docs.id()));
    assert_eq!(update.state(), TaskState::Ready);
    assert_eq!(rebuild.report().map(|r| r.stats.added), Some(2));
  }

  /// Test: a rebuild submitted while an update of the same index runs cancels it.
  #[test]
  fn test_rebuild_cancels_running_update() {
    let ctx = populated();
    let registry = ctx.registry();
    let docs = registered(&ctx, &registry, &ctx.source("docs"));
    let (queue, gate) = gated_queue(&ctx, &registry);

    ctx.write_file("docs/new.txt", "delta");
    let update = queue.add_task(Arc::clone(&docs), IndexAction::Update).expect("update accepted");
    gate.wait_entered();

    let rebuild = queue.add_task(Arc::clone(&docs), IndexAction::Rebuild).expect("rebuild accepted");
    assert!(update.is_canceled());
    assert_eq!(update.cancel_action(), Some(CancelAction::Keep));

    gate.open();
    queue.wait_idle();
    assert!(registry.contains(docs.id()));
    assert_eq!(rebuild.report().map(|r| r.outcome), Some(SyncOutcome::SuccessChanged));
    assert_eq!(num_docs(&docs), 3);
  }

  /// Test: a removed index takes no further updates or rebuilds and stays gone.
  #[test]
  fn test_update_of_removed_index_refused() {
    let ctx = populated();
    let registry = ctx.registry();
    let docs = registered(&ctx, &registry, &ctx.source("docs"));
    let queue = ctx.start_queue(Arc::clone(&registry), Arc::new(ctx.parser()));

    queue.remove_indexes(&[Arc::clone(&docs)], true);
    let update = queue.add_task(Arc::clone(&docs), IndexAction::Update);
    assert_eq!(update.err(), Some(Rejection::NotRegistered));
    let rebuild = queue.add_task(Arc::clone(&docs), IndexAction::Rebuild);
    assert_eq!(rebuild.err(), Some(Rejection::NotRegistered));
    queue.wait_idle();

    assert!(!docs.index_dir().exists());
    assert_eq!(ctx.registry().load().expect("load"), 0);
  }

  /// Test: an update whose index was unregistered mid-run does not save it back.
  #[test]
  fn test_update_of_unregistered_index_not_saved() {
    let ctx = populated();
    let registry = ctx.registry();
    let docs = registered(&ctx, &registry, &ctx.source("docs"));
    let (queue, gate) = gated_queue(&ctx, &registry);

    ctx.write_file("docs/new.txt", "delta");
    let update = queue.add_task(Arc::clone(&docs), IndexAction::Update).expect("update accepted");
    gate.wait_entered();
    registry.remove(docs.id());
    std::fs::remove_file(docs.index_dir().join(TREE_FILE)).expect("remove tree file");

    gate.open();
    queue.wait_idle();
    assert_eq!(update.state(), TaskState::Finished);
    assert!(!docs.index_dir().join(TREE_FILE).exists());
    assert_eq!(ctx.registry().load().expect("load"), 0);
  }

  #[test]
  fn test_shutdown_refuses_tasks() {
    let ctx = populated();
    let registry = ctx.registry();
    let queue = ctx.start_queue(Arc::clone(&registry), Arc::new(ctx.parser()));

    queue.shutdown();
    assert!(queue.is_shut_down());
    let refused = queue.add_task(index_for(&queue, &ctx.source("docs")), IndexAction::Create);
    assert_eq!(refused.err(), Some(Rejection::Shutdown));

    // A second shutdown is a no-op
    queue.shutdown();
  }

  // ==========================================================================
  // Execution
  // ==========================================================================

  #[test]
  fn test_tasks_start_in_submission_order() {
    let ctx = SyncTestContext::new();
    for dir in ["one", "two", "three"] {
      ctx.write_file(&format!("{dir}/file.txt"), dir);
    }
    let registry = ctx.registry();
    let queue = ctx.start_queue(Arc::clone(&registry), Arc::new(ctx.parser()));
    let events = recorded_events(&queue);

    let submitted: Vec<TaskId> = ["one", "two", "three"]
      .iter()
      .map(|dir| {
        queue
          .add_task(index_for(&queue, &ctx.source(dir)), IndexAction::Create)
          .expect("create accepted")
          .id()
      })
      .collect();
    queue.wait_idle();

    let started: Vec<TaskId> = events
      .lock()
      .unwrap()
      .iter()
      .filter(|(kind, _)| kind == "started")
      .map(|(_, id)| *id)
      .collect();
    assert_eq!(started, submitted);
    assert_eq!(registry.indexes().len(), 3);
  }

  #[test]
  fn test_create_registers_and_saves() {
    let ctx = populated();
    let registry = ctx.registry();
    let queue = ctx.start_queue(Arc::clone(&registry), Arc::new(ctx.parser()));

    let task = ctx.create_and_wait(&queue, &ctx.source("docs"));
    let index = task.index();
    assert_eq!(task.state(), TaskState::Finished);
    assert_eq!(task.report().map(|r| r.outcome), Some(SyncOutcome::SuccessChanged));
    assert!(registry.contains(index.id()));
    assert!(index.index_dir().join(TREE_FILE).is_file());
    assert_eq!(num_docs(index), 2);
    assert!(task.reporter().end_time().is_some());
  }

  #[test]
  fn test_failed_create_is_discarded() {
    let ctx = SyncTestContext::new();
    let registry = ctx.registry();
    let queue = ctx.start_queue(Arc::clone(&registry), Arc::new(ctx.parser()));

    let task = ctx.create_and_wait(&queue, &ctx.source("missing"));
    assert_eq!(task.report().map(|r| r.outcome), Some(SyncOutcome::Failure));
    assert!(registry.indexes().is_empty());
    assert!(!task.index().index_dir().exists());
  }

  /// Test: a parser panic stays on its document and the next task still runs.
  #[test]
  fn test_parser_panic_recorded_on_document() {
    let ctx = populated();
    ctx.write_file("bad/boom.txt", "kaboom");
    ctx.write_file("bad/fine.txt", "steady");
    let registry = ctx.registry();
    let parser = PanickingParser::new(ctx.parser(), "boom.txt", PanicAt::Parse);
    let queue = ctx.start_queue(Arc::clone(&registry), Arc::new(parser));

    let bad = queue
      .add_task(index_for(&queue, &ctx.source("bad")), IndexAction::Create)
      .expect("create accepted");
    let good = queue
      .add_task(index_for(&queue, &ctx.source("docs")), IndexAction::Create)
      .expect("create accepted");
    queue.wait_idle();

    assert_eq!(bad.report().map(|r| r.outcome), Some(SyncOutcome::SuccessChanged));
    assert!(registry.contains(bad.index().id()));
    let tree = bad.index().tree();
    let errors = tree.errors_deep();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].error_type, ErrorType::Parsing);
    assert!(errors[0].path.ends_with("/boom.txt"));
    assert!(errors[0].message.contains("decoder exploded"));
    // Still findable by name
    assert_eq!(num_docs(bad.index()), 2);

    assert_eq!(good.state(), TaskState::Finished);
    assert!(registry.contains(good.index().id()));
    assert_eq!(num_docs(good.index()), 2);
  }

  /// Test: a panic outside document parsing fails its task without stopping the worker.
  #[test]
  fn test_panicking_run_fails_and_worker_continues() {
    let mut ctx = populated();
    // Makes the listing ask the parser about every file
    ctx.config.index_filenames = false;
    ctx.write_file("bad/boom.txt", "kaboom");
    let registry = ctx.registry();
    let parser = PanickingParser::new(ctx.parser(), "boom.txt", PanicAt::CanParse);
    let queue = ctx.start_queue(Arc::clone(&registry), Arc::new(parser));

    let bad = queue
      .add_task(index_for(&queue, &ctx.source("bad")), IndexAction::Create)
      .expect("create accepted");
    let good = queue
      .add_task(index_for(&queue, &ctx.source("docs")), IndexAction::Create)
      .expect("create accepted");
    queue.wait_idle();

    let report = bad.report().expect("bad task finished");
    assert_eq!(report.outcome, SyncOutcome::Failure);
    assert!(report.error.is_some_and(|e| e.contains("format sniffing exploded")));
    assert_eq!(bad.state(), TaskState::Finished);
    assert!(!registry.contains(bad.index().id()));
    assert!(!bad.index().index_dir().exists());
    assert_eq!(bad.reporter().failures().len(), 1);

    assert_eq!(good.report().map(|r| r.outcome), Some(SyncOutcome::SuccessChanged));
    assert!(registry.contains(good.index().id()));
    assert_eq!(num_docs(good.index()), 2);
  }

  // ==========================================================================
  // Removal and cancellation
  // ==========================================================================

  #[test]
  fn test_remove_pending_task() {
    let ctx = populated();
    let registry = ctx.registry();
    let (queue, gate) = gated_queue(&ctx, &registry);

    let docs = queue
      .add_task(index_for(&queue, &ctx.source("docs")), IndexAction::Create)
      .expect("create accepted");
    gate.wait_entered();
    let other = queue
      .add_task(index_for(&queue, &ctx.source("other")), IndexAction::Create)
      .expect("create accepted");

    assert!(queue.remove_task(other.id(), CancelAction::Discard));
    assert!(!queue.remove_task(other.id(), CancelAction::Discard));
    assert_eq!(queue.tasks().len(), 1);

    gate.open();
    queue.wait_idle();
    assert!(registry.contains(docs.index().id()));
    assert!(!registry.contains(other.index().id()));
    assert_eq!(other.state(), TaskState::Ready);
  }

  #[test]
  fn test_cancel_running_create_with_discard() {
    let ctx = populated();
    let registry = ctx.registry();
    let (queue, gate) = gated_queue(&ctx, &registry);

    let task = queue
      .add_task(index_for(&queue, &ctx.source("docs")), IndexAction::Create)
      .expect("create accepted");
    gate.wait_entered();

    assert!(!queue.remove_task(task.id(), CancelAction::Discard));
    assert!(task.is_canceled());

    gate.open();
    queue.wait_idle();
    assert_eq!(task.state(), TaskState::Finished);
    assert!(!registry.contains(task.index().id()));
    assert!(!task.index().index_dir().exists());
  }

  #[test]
  fn test_cancel_running_create_with_keep() {
    let ctx = populated();
    let registry = ctx.registry();
    let (queue, gate) = gated_queue(&ctx, &registry);

    let task = queue
      .add_task(index_for(&queue, &ctx.source("docs")), IndexAction::Create)
      .expect("create accepted");
    gate.wait_entered();
    assert!(!queue.remove_task(task.id(), CancelAction::Keep));

    gate.open();
    queue.wait_idle();
    let index = task.index();
    assert!(registry.contains(index.id()));
    assert!(index.index_dir().join(TREE_FILE).is_file());
    // Only the document parsed before the cancel made it in
    assert_eq!(index.tree().document_count(), 1);
    assert_eq!(num_docs(index), 1);
  }

  #[test]
  fn test_remove_indexes_deletes_files() {
    let ctx = populated();
    let registry = ctx.registry();
    let queue = ctx.start_queue(Arc::clone(&registry), Arc::new(ctx.parser()));

    let docs = Arc::clone(ctx.create_and_wait(&queue, &ctx.source("docs")).index());
    let other = Arc::clone(ctx.create_and_wait(&queue, &ctx.source("other")).index());
    assert_eq!(registry.indexes().len(), 2);

    queue.remove_indexes(&[Arc::clone(&docs)], true);
    queue.remove_indexes(&[Arc::clone(&other)], false);
    assert!(registry.indexes().is_empty());
    assert!(!docs.index_dir().exists());
    assert!(other.index_dir().exists());
    assert!(other.index_dir().join(DETACHED_TREE_FILE).is_file());

    // Kept files do not bring the index back
    assert_eq!(ctx.registry().load().expect("load"), 0);
  }

  /// Test: removing a running index with its files kept detaches it once the task stops.
  #[test]
  fn test_remove_running_index_keeping_files() {
    let ctx = populated();
    let registry = ctx.registry();
    let docs = registered(&ctx, &registry, &ctx.source("docs"));
    let (queue, gate) = gated_queue(&ctx, &registry);

    ctx.write_file("docs/new.txt", "delta");
    queue.add_task(Arc::clone(&docs), IndexAction::Update).expect("update accepted");
    gate.wait_entered();
    queue.remove_indexes(&[Arc::clone(&docs)], false);

    gate.open();
    queue.wait_idle();
    assert!(!registry.contains(docs.id()));
    assert!(docs.index_dir().join(DETACHED_TREE_FILE).is_file());
    assert!(!docs.index_dir().join(TREE_FILE).exists());
    assert_eq!(ctx.registry().load().expect("load"), 0);
  }

  /// Test: removing the index of the running task defers deletion until it stops.
  #[test]
  fn test_remove_index_of_running_task() {
    let ctx = populated();
    let registry = ctx.registry();
    let (queue, gate) = gated_queue(&ctx, &registry);

    let task = queue
      .add_task(index_for(&queue, &ctx.source("docs")), IndexAction::Create)
      .expect("create accepted");
    gate.wait_entered();

    queue.remove_indexes(&[Arc::clone(task.index())], true);
    assert!(task.is_canceled());

    gate.open();
    queue.wait_idle();
    assert!(!registry.contains(task.index().id()));
    assert!(!task.index().index_dir().exists());
  }

  #[test]
  fn test_listener_receives_existing_tasks() {
    let ctx = populated();
    let registry = ctx.registry();
    let (queue, gate) = gated_queue(&ctx, &registry);

    let task = queue
      .add_task(index_for(&queue, &ctx.source("docs")), IndexAction::Create)
      .expect("create accepted");
    gate.wait_entered();

    let existing = queue.add_listener(Box::new(|_| {}));
    let ids: Vec<TaskId> = existing.iter().map(|t| t.id()).collect();
    assert_eq!(ids, vec![task.id()]);
    assert_eq!(queue.find_task(task.index().id()).map(|t| t.id()), Some(task.id()));

    gate.open();
    queue.wait_idle();
    assert!(queue.find_task(task.index().id()).is_none());
  }

  #[test]
  fn test_dropping_queue_stops_worker() {
    let ctx = populated();
    let registry = ctx.registry();
    let root = ctx.source("docs");
    {
      let queue = ctx.start_queue(Arc::clone(&registry), Arc::new(ctx.parser()));
      queue
        .add_task(index_for(&queue, &root), IndexAction::Create)
        .expect("create accepted");
    }
    // Whatever ran before the drop, nothing is left half registered
    for index in registry.indexes() {
      assert!(index.index_dir().join(TREE_FILE).is_file());
    }
  }
}
