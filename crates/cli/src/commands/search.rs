//! Search command

use anyhow::{Context, Result};
use chrono::DateTime;
use docsync::{
  config::Config,
  dirs::default_index_parent_dir,
  registry::Registry,
  store::{SearchHit, SearchIndex},
};
use tracing::warn;

/// A hit together with the index it came from
struct IndexedHit {
  index: String,
  hit: SearchHit,
}

/// Search every registered index and print the best hits
pub async fn cmd_search(query: &str, limit: usize, json_output: bool) -> Result<()> {
  let cwd = std::env::current_dir().context("Failed to determine working directory")?;
  let config = Config::load(&cwd);
  let registry = Registry::new(default_index_parent_dir(), config.index);
  registry.load().context("Failed to load indexes")?;

  let mut hits = Vec::new();
  for index in registry.indexes() {
    let search = match SearchIndex::open_or_create(index.index_dir()) {
      Ok(search) => search,
      Err(e) => {
        warn!(index = %index.display_name(), error = %e, "Skipping unreadable index");
        continue;
      }
    };
    let found = search
      .search(query, limit)
      .with_context(|| format!("Search failed in {}", index.display_name()))?;
    hits.extend(found.into_iter().map(|hit| IndexedHit {
      index: index.display_name(),
      hit,
    }));
  }

  hits.sort_by(|a, b| b.hit.score.total_cmp(&a.hit.score));
  hits.truncate(limit);

  if json_output {
    let results: Vec<_> = hits
      .iter()
      .map(|h| {
        serde_json::json!({
          "index": h.index,
          "uid": h.hit.uid,
          "filename": h.hit.filename,
          "title": h.hit.title,
          "score": h.hit.score,
          "date": h.hit.date,
        })
      })
      .collect();
    println!("{}", serde_json::to_string_pretty(&results)?);
    return Ok(());
  }

  if hits.is_empty() {
    println!("No results for \"{query}\".");
    return Ok(());
  }

  println!("Found {} result(s):\n", hits.len());
  for (i, h) in hits.iter().enumerate() {
    let title = h.hit.title.as_deref().unwrap_or(&h.hit.filename);
    println!("{}. {} [{}] (score: {:.2})", i + 1, title, h.index, h.hit.score);
    println!("   {}", display_uid(&h.hit.uid));
    if let Some(date) = DateTime::from_timestamp_millis(h.hit.date) {
      println!("   {}", date.format("%Y-%m-%d %H:%M"));
    }
  }
  Ok(())
}

/// Drop the scheme prefix from a document uid
fn display_uid(uid: &str) -> &str {
  uid.split_once("://").map(|(_, path)| path).unwrap_or(uid)
}
