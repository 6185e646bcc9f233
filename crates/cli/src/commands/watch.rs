//! Watch command: keep every registered index current until interrupted

use std::sync::Arc;

use anyhow::{Context, Result};
use docsync::{
  queue::{IndexAction, QueueEvent},
  watcher::FolderWatcher,
};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::app::App;

/// Update all indexes once, then watch their folders for changes
pub async fn cmd_watch() -> Result<()> {
  let app = App::open()?;
  if !app.config.watch.enabled {
    println!("Watching is disabled in the configuration ([watch] enabled = false)");
    return Ok(());
  }

  app.queue.add_listener(Box::new(|event| match event {
    QueueEvent::Started(task) => info!(index = %task.index().display_name(), action = ?task.action(), "Indexing"),
    QueueEvent::Finished { task, outcome } => {
      info!(index = %task.index().display_name(), ?outcome, "Indexing finished")
    }
    QueueEvent::Added(_) | QueueEvent::Removed(_) => {}
  }));

  // Catch up on changes made while nothing was watching
  let indexes = app.registry.indexes();
  for index in &indexes {
    if let Err(rejection) = app.queue.add_task(Arc::clone(index), IndexAction::Update) {
      warn!(index = %index.display_name(), %rejection, "Startup update refused");
    }
  }

  let cancel = CancellationToken::new();
  let handle = FolderWatcher::spawn(Arc::clone(&app.queue), app.config.watch.clone(), cancel.clone())
    .context("Failed to start folder watcher")?;

  println!("Watching {} index(es)", indexes.len());
  println!("Press Ctrl+C to stop watching");

  tokio::signal::ctrl_c().await?;
  cancel.cancel();
  if let Err(e) = handle.await {
    warn!(error = %e, "Folder watcher task failed");
  }

  let queue = Arc::clone(&app.queue);
  tokio::task::spawn_blocking(move || queue.shutdown())
    .await
    .context("Failed to stop indexing worker")?;

  println!("\nWatcher stopped");
  Ok(())
}
