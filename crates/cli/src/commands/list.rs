//! Registry inspection commands (list, errors)

use anyhow::{Context, Result};
use docsync::{
  config::Config,
  dirs::default_index_parent_dir,
  index::{Index, IndexKind},
  registry::Registry,
  tree::simplify::simplified_root,
};

fn load_registry() -> Result<Registry> {
  let cwd = std::env::current_dir().context("Failed to determine working directory")?;
  let config = Config::load(&cwd);
  let registry = Registry::new(default_index_parent_dir(), config.index);
  registry.load().context("Failed to load indexes")?;
  Ok(registry)
}

fn kind_label(index: &Index) -> &'static str {
  match index.kind() {
    IndexKind::File => "files",
    IndexKind::Mail => "mail",
  }
}

/// List all registered indexes
pub async fn cmd_list(json_output: bool) -> Result<()> {
  let registry = load_registry()?;
  let indexes = registry.indexes();

  if json_output {
    let entries: Vec<_> = indexes
      .iter()
      .map(|index| {
        let tree = index.tree();
        serde_json::json!({
          "id": index.id().to_string(),
          "name": index.display_name(),
          "kind": kind_label(index),
          "root": index.root_path().display().to_string(),
          "index_dir": index.index_dir().display().to_string(),
          "documents": tree.document_count(),
          "errors": tree.errors_deep().len(),
          "created_at": index.created_at().to_rfc3339(),
          "last_updated": index.last_updated().map(|t| t.to_rfc3339()),
          "read_only": index.is_read_only(),
        })
      })
      .collect();
    println!("{}", serde_json::to_string_pretty(&entries)?);
    return Ok(());
  }

  if indexes.is_empty() {
    println!("No indexes registered.");
    return Ok(());
  }

  println!("Indexes ({})", indexes.len());
  println!("===========\n");
  for index in &indexes {
    let tree = index.tree();
    let id = index.id().to_string();
    println!("{} [{}] ({})", index.display_name(), &id[..8], kind_label(index));
    println!("  Root:      {}", index.root_path().display());
    if index.kind() == IndexKind::Mail {
      let shown = simplified_root(&tree);
      if shown.path() != tree.path() {
        println!("  Shown as:  {}", shown.path());
      }
    }
    println!("  Documents: {}", tree.document_count());
    let errors = tree.errors_deep().len();
    if errors > 0 {
      println!("  Errors:    {errors}");
    }
    match index.last_updated() {
      Some(time) => println!("  Updated:   {}", time.format("%Y-%m-%d %H:%M:%S")),
      None => println!("  Updated:   never"),
    }
    if index.is_read_only() {
      println!("  Read-only");
    }
    println!();
  }
  Ok(())
}

/// Show the errors recorded in one index, or in all of them
pub async fn cmd_errors(path: Option<&str>) -> Result<()> {
  let registry = load_registry()?;
  let indexes = match path {
    Some(path) => {
      let root = std::env::current_dir()
        .context("Failed to determine working directory")?
        .join(path);
      match registry.find_by_root(&root) {
        Some(index) => vec![index],
        None => anyhow::bail!("No index for {}", root.display()),
      }
    }
    None => registry.indexes(),
  };

  let mut total = 0;
  for index in &indexes {
    let tree = index.tree();
    let errors = tree.errors_deep();
    if errors.is_empty() {
      continue;
    }
    total += errors.len();
    println!("{} ({} error(s))", index.display_name(), errors.len());
    for error in errors {
      println!("  [{}] {}", error.error_type, error.path);
      println!("      {}", error.message);
    }
    println!();
  }

  if total == 0 {
    println!("No errors recorded.");
  }
  Ok(())
}
