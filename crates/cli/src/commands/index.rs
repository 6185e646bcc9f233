//! Index maintenance commands (index, update, rebuild, remove)

use std::sync::Arc;

use anyhow::{Result, bail};
use docsync::{index::IndexKind, queue::IndexAction};
use tracing::info;

use super::app::{App, print_task_summary, rejected, resolve_path};

/// Create an index for a folder or archive and build it
pub async fn cmd_index(path: &str) -> Result<()> {
  let app = App::open()?;
  let root = resolve_path(Some(path))?;
  if !root.exists() {
    bail!("{} does not exist", root.display());
  }

  let index = Arc::new(app.registry.create_index(IndexKind::File, &root));
  info!(root = %root.display(), dir = %index.index_dir().display(), "Creating index");
  let task = app
    .queue
    .add_task(index, IndexAction::Create)
    .map_err(|rejection| rejected(&root, rejection))?;

  println!("Indexing {}...", root.display());
  app.wait().await?;
  print_task_summary(&task);
  Ok(())
}

/// Bring one index, or every index, up to date with its source
pub async fn cmd_update(path: Option<&str>) -> Result<()> {
  let app = App::open()?;
  let indexes = match path {
    Some(path) => vec![app.find_index(&resolve_path(Some(path))?)?],
    None => app.registry.indexes(),
  };
  if indexes.is_empty() {
    println!("No indexes registered. Create one with `docsync index <path>`.");
    return Ok(());
  }

  let mut tasks = Vec::with_capacity(indexes.len());
  for index in indexes {
    match app.queue.add_task(Arc::clone(&index), IndexAction::Update) {
      Ok(task) => tasks.push(task),
      Err(rejection) => println!("{}: skipped ({rejection})", index.display_name()),
    }
  }

  app.wait().await?;
  for task in &tasks {
    print_task_summary(task);
  }
  Ok(())
}

/// Clear an index and build it again from scratch
pub async fn cmd_rebuild(path: &str) -> Result<()> {
  let app = App::open()?;
  let root = resolve_path(Some(path))?;
  let index = app.find_index(&root)?;
  let task = app
    .queue
    .add_task(index, IndexAction::Rebuild)
    .map_err(|rejection| rejected(&root, rejection))?;

  println!("Rebuilding {}...", root.display());
  app.wait().await?;
  print_task_summary(&task);
  Ok(())
}

/// Unregister an index, deleting its directory unless `keep_files` is set
pub async fn cmd_remove(path: &str, keep_files: bool) -> Result<()> {
  let app = App::open()?;
  let index = app.find_index(&resolve_path(Some(path))?)?;
  let name = index.display_name();
  let dir = index.index_dir().to_path_buf();

  app.queue.remove_indexes(&[index], !keep_files);
  app.wait().await?;

  if keep_files {
    println!("Removed {name} (index files kept in {})", dir.display());
  } else {
    println!("Removed {name}");
  }
  Ok(())
}
