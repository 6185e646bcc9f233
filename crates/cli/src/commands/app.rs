//! Shared setup: configuration, registry and queue

use std::{
  path::{Path, PathBuf},
  sync::Arc,
};

use anyhow::{Context, Result, anyhow, bail};
use docsync::{
  config::Config,
  dirs::default_index_parent_dir,
  index::Index,
  parse::ParseService,
  queue::{CancelAction, IndexingQueue, Rejection, Task},
  registry::Registry,
  sync::SyncOutcome,
};
use tracing::debug;

/// Everything a command needs to talk to the indexes
pub struct App {
  pub config: Config,
  pub registry: Arc<Registry>,
  pub queue: Arc<IndexingQueue>,
}

impl App {
  /// Load config for the working directory, restore the registry and start the queue
  pub fn open() -> Result<Self> {
    let cwd = std::env::current_dir().context("Failed to determine working directory")?;
    let config = Config::load(&cwd);

    let parent_dir = default_index_parent_dir();
    let registry = Arc::new(Registry::new(parent_dir.clone(), config.index.clone()));
    let loaded = registry
      .load()
      .with_context(|| format!("Failed to load indexes from {}", parent_dir.display()))?;
    debug!(loaded, dir = %parent_dir.display(), "Registry ready");

    let parser = Arc::new(ParseService::new(config.index.clone()));
    let queue = IndexingQueue::start(Arc::clone(&registry), config.queue.clone(), parser, None)
      .context("Failed to start indexing worker")?;

    Ok(Self {
      config,
      registry,
      queue: Arc::new(queue),
    })
  }

  /// The registered index whose root is `path`
  pub fn find_index(&self, path: &Path) -> Result<Arc<Index>> {
    match self.registry.find_by_root(path) {
      Some(index) => Ok(index),
      None => bail!("No index for {}", path.display()),
    }
  }

  /// Wait for the queue to drain; Ctrl+C cancels everything that is left
  pub async fn wait(&self) -> Result<()> {
    let queue = Arc::clone(&self.queue);
    let idle = tokio::task::spawn_blocking(move || queue.wait_idle());
    tokio::pin!(idle);

    tokio::select! {
      result = &mut idle => {
        result.context("Indexing worker wait failed")?;
      }
      _ = tokio::signal::ctrl_c() => {
        println!("\nCancelling...");
        self.queue.remove_all(CancelAction::Discard);
        idle.await.context("Indexing worker wait failed")?;
      }
    }
    Ok(())
  }
}

/// Absolute form of a user-supplied path
pub fn resolve_path(path: Option<&str>) -> Result<PathBuf> {
  let cwd = std::env::current_dir().context("Failed to determine working directory")?;
  Ok(match path {
    Some(p) => cwd.join(p),
    None => cwd,
  })
}

/// Print what a finished task did
pub fn print_task_summary(task: &Task) {
  let name = task.index().display_name();
  let Some(report) = task.report() else {
    println!("{name}: removed before it started");
    return;
  };

  let stats = report.stats;
  let elapsed = match (task.reporter().start_time(), task.reporter().end_time()) {
    (Some(start), Some(end)) => format!(" in {:.1}s", (end - start).num_milliseconds() as f64 / 1000.0),
    _ => String::new(),
  };
  match report.outcome {
    SyncOutcome::Failure => {
      println!("{name}: failed: {}", report.error.as_deref().unwrap_or("unknown error"));
    }
    SyncOutcome::SuccessUnchanged if !stats.canceled => {
      println!("{name}: up to date ({} documents){elapsed}", stats.unchanged);
    }
    _ => {
      println!(
        "{name}: {} added, {} updated, {} removed, {} unchanged{}{elapsed}",
        stats.added,
        stats.updated,
        stats.removed,
        stats.unchanged,
        if stats.canceled { " (canceled)" } else { "" }
      );
    }
  }

  let failures = task.reporter().failures();
  if !failures.is_empty() {
    println!("  {} problem(s):", failures.len());
    for error in failures.iter().take(20) {
      println!("    {error}");
    }
    if failures.len() > 20 {
      println!("    ... and {} more (see `docsync errors`)", failures.len() - 20);
    }
  }
}

/// Error for a submission the queue refused
pub fn rejected(path: &Path, rejection: Rejection) -> anyhow::Error {
  anyhow!("Cannot index {}: {rejection}", path.display())
}
