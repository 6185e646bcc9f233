//! Registry persistence tests.

#[cfg(test)]
mod tests {
  use std::{
    path::Path,
    sync::{Arc, Mutex},
  };

  use pretty_assertions::assert_eq;

  use crate::{
    __tests__::helpers::SyncTestContext,
    domain::index::{Index, IndexKind},
    registry::{DETACHED_TREE_FILE, Registry, RegistryEvent, TREE_FILE},
    tree::ErrorType,
  };

  /// Test: an index saved by the queue loads back with its tree and errors.
  #[test]
  fn test_save_and_load_round_trip() {
    let ctx = SyncTestContext::new();
    ctx.write_file("docs/a.txt", "alpha");
    ctx.write_bytes("docs/bad.txt", b"\0\0");
    let registry = ctx.registry();
    let original = {
      let queue = ctx.start_queue(Arc::clone(&registry), Arc::new(ctx.parser()));
      Arc::clone(ctx.create_and_wait(&queue, &ctx.source("docs")).index())
    };

    let restored = ctx.registry();
    assert_eq!(restored.load().expect("load"), 1);
    let loaded = restored.find(original.id()).expect("index restored");
    assert_eq!(loaded.kind(), IndexKind::File);
    assert_eq!(loaded.root_path(), original.root_path());
    assert_eq!(loaded.index_dir(), original.index_dir());
    assert_eq!(loaded.tree(), original.tree());

    let tree = loaded.tree();
    let errors = tree.errors_deep();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].error_type, ErrorType::Parsing);
    assert!(loaded.last_updated().is_some());
  }

  #[test]
  fn test_load_skips_broken_snapshots() {
    let ctx = SyncTestContext::new();
    let registry = ctx.registry();
    let good = Index::new(IndexKind::File, ctx.source("good"), ctx.index_parent().join("good_1"));
    registry.save(&good).expect("save");

    let broken_dir = ctx.index_parent().join("broken_2");
    std::fs::create_dir_all(&broken_dir).expect("create dir");
    std::fs::write(broken_dir.join(TREE_FILE), "{ not json").expect("write");
    std::fs::create_dir_all(ctx.index_parent().join("stray")).expect("create dir");

    let restored = ctx.registry();
    assert_eq!(restored.load().expect("load"), 1);
    assert!(restored.contains(good.id()));
  }

  /// Test: a detached index keeps its directory but is not loaded again.
  #[test]
  fn test_detached_index_not_reloaded() {
    let ctx = SyncTestContext::new();
    let registry = ctx.registry();
    let kept = Index::new(IndexKind::File, ctx.source("kept"), ctx.index_parent().join("kept_1"));
    let detached = Index::new(IndexKind::File, ctx.source("detached"), ctx.index_parent().join("detached_2"));
    registry.save(&kept).expect("save");
    registry.save(&detached).expect("save");

    registry.detach_files(&detached).expect("detach");
    assert!(detached.index_dir().join(DETACHED_TREE_FILE).is_file());
    assert!(!detached.index_dir().join(TREE_FILE).exists());
    // Nothing left to detach
    registry.detach_files(&detached).expect("detach again");

    let restored = ctx.registry();
    assert_eq!(restored.load().expect("load"), 1);
    assert!(restored.contains(kept.id()));
    assert!(!restored.contains(detached.id()));
  }

  #[test]
  fn test_load_without_parent_dir() {
    let ctx = SyncTestContext::new();
    assert_eq!(ctx.registry().load().expect("load"), 0);
  }

  /// Test: a listener sees the indexes present when it registers, then every change.
  #[test]
  fn test_listener_events() {
    let ctx = SyncTestContext::new();
    let registry = ctx.registry();
    let first = Arc::new(Index::new(IndexKind::File, ctx.source("first"), ctx.index_parent().join("first")));
    let second = Arc::new(Index::new(IndexKind::File, ctx.source("second"), ctx.index_parent().join("second")));
    registry.add(Arc::clone(&first));

    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    let existing = registry.add_listener(Box::new(move |event| {
      let entry = match event {
        RegistryEvent::Added(index) => format!("added {}", index.display_name()),
        RegistryEvent::Removed(index) => format!("removed {}", index.display_name()),
      };
      sink.lock().unwrap().push(entry);
    }));
    assert_eq!(existing.len(), 1);
    assert_eq!(existing[0].id(), first.id());

    registry.add(Arc::clone(&second));
    registry.remove(first.id());
    assert!(registry.remove(first.id()).is_none());

    assert_eq!(*events.lock().unwrap(), vec!["added second", "removed first"]);
  }

  #[test]
  fn test_find_by_root() {
    let ctx = SyncTestContext::new();
    ctx.write_file("docs/a.txt", "alpha");
    let registry = ctx.registry();
    let index = Arc::new(registry.create_index(IndexKind::File, &ctx.source("docs")));
    registry.add(Arc::clone(&index));

    let found = registry.find_by_root(&ctx.source("docs/../docs"));
    assert_eq!(found.map(|i| i.id()), Some(index.id()));
    assert!(registry.find_by_root(&ctx.source("docs/sub")).is_none());
  }

  #[test]
  fn test_delete_files_missing_dir_is_ok() {
    let ctx = SyncTestContext::new();
    let registry = ctx.registry();
    let index = registry.create_index(IndexKind::File, &ctx.source("docs"));
    assert!(!index.index_dir().exists());
    registry.delete_files(&index).expect("delete missing dir");
  }

  /// Test: in portable mode roots below the working directory stay relative.
  #[test]
  fn test_portable_mode_stores_relative_root() {
    let mut ctx = SyncTestContext::new();
    ctx.config.store_relative_paths = true;
    let registry = ctx.registry();

    let cwd = std::env::current_dir().unwrap().canonicalize().unwrap();
    let index = registry.create_index(IndexKind::File, &cwd.join("nonexistent_sub"));
    assert_eq!(index.root_path(), Path::new("nonexistent_sub"));
    assert_eq!(index.canonical_root(), cwd.join("nonexistent_sub"));

    // Roots elsewhere stay absolute
    let outside = registry.create_index(IndexKind::File, ctx.source_dir.path());
    assert!(outside.root_path().is_absolute());
  }

  #[test]
  fn test_absolute_roots_by_default() {
    let ctx = SyncTestContext::new();
    let registry: Arc<Registry> = ctx.registry();
    let cwd = std::env::current_dir().unwrap().canonicalize().unwrap();
    let index = registry.create_index(IndexKind::File, &cwd.join("nonexistent_sub"));
    assert_eq!(index.root_path(), cwd.join("nonexistent_sub"));
  }
}
