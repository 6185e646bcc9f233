//! docsync CLI - index folders and archives, keep them in sync, search them

use anyhow::Result;
use clap::{Parser, Subcommand};

mod commands;
mod logging;

use commands::{
  cmd_config_init, cmd_config_show, cmd_errors, cmd_index, cmd_list, cmd_rebuild, cmd_remove, cmd_search, cmd_update,
  cmd_watch,
};
use docsync::config::Config;
use logging::{init_cli_logging, init_watch_logging};

#[derive(Parser)]
#[command(name = "docsync")]
#[command(about = "Full-text indexes over folders and archives, kept in sync with their sources")]
#[command(after_help = "\
QUICK START:
  docsync index ~/Documents       # Build an index for a folder
  docsync search \"quarterly report\"
  docsync update                  # Pick up changes in every index

COMMON WORKFLOWS:
  docsync watch                   # Update indexes as their folders change
  docsync errors                  # Show files that could not be indexed
  docsync config init             # Write a commented config file")]
struct Cli {
  #[command(subcommand)]
  command: Commands,
}

/// Subcommands for `docsync config`
#[derive(Subcommand)]
pub enum ConfigCommand {
  /// Show current effective configuration
  #[command(long_about = "Show the current effective configuration.\n\n\
    Displays which config file is being used and its contents as TOML.")]
  Show,

  /// Write a default config file (./.docsync.toml)
  Init {
    /// Write the user config (~/.config/docsync/config.toml) instead
    #[arg(long)]
    user: bool,
  },
}

#[derive(Subcommand)]
enum Commands {
  /// Create and build an index for a folder or tar archive
  #[command(after_help = "\
NOTES:
  A folder cannot be indexed if it is already indexed, lies inside an
  indexed folder, or contains one.")]
  Index {
    /// Folder or archive to index
    path: String,
  },
  /// Update indexes with changes in their folders
  Update {
    /// Root of the index to update (default: all indexes)
    path: Option<String>,
  },
  /// Discard an index's contents and build it again
  Rebuild {
    /// Root of the index to rebuild
    path: String,
  },
  /// Remove an index
  Remove {
    /// Root of the index to remove
    path: String,
    /// Keep the index directory on disk, detached so it is not loaded again
    #[arg(long)]
    keep_files: bool,
  },
  /// List registered indexes
  List {
    /// Output as JSON
    #[arg(long)]
    json: bool,
  },
  /// Search all indexes
  Search {
    /// Search query
    query: String,
    #[arg(short, long, default_value = "10")]
    limit: usize,
    /// Output as JSON
    #[arg(long)]
    json: bool,
  },
  /// Show files and folders that could not be indexed
  Errors {
    /// Root of the index to inspect (default: all indexes)
    path: Option<String>,
  },
  /// Watch indexed folders and update them as they change
  Watch,
  /// Manage configuration
  #[command(after_help = "\
CONFIG LOCATIONS:
  Directory: ./.docsync.toml
  User:      ~/.config/docsync/config.toml")]
  Config {
    #[command(subcommand)]
    command: ConfigCommand,
  },
}

#[tokio::main]
async fn main() -> Result<()> {
  let cli = Cli::parse();

  // File logging for the long-running watcher, console-only for other commands
  let _guard = match &cli.command {
    Commands::Watch => {
      let cwd = std::env::current_dir()?;
      init_watch_logging(&Config::load(&cwd).daemon)
    }
    _ => {
      init_cli_logging();
      None
    }
  };

  match cli.command {
    Commands::Index { path } => cmd_index(&path).await,
    Commands::Update { path } => cmd_update(path.as_deref()).await,
    Commands::Rebuild { path } => cmd_rebuild(&path).await,
    Commands::Remove { path, keep_files } => cmd_remove(&path, keep_files).await,
    Commands::List { json } => cmd_list(json).await,
    Commands::Search { query, limit, json } => cmd_search(&query, limit, json).await,
    Commands::Errors { path } => cmd_errors(path.as_deref()).await,
    Commands::Watch => cmd_watch().await,
    Commands::Config { command } => match command {
      ConfigCommand::Show => cmd_config_show().await,
      ConfigCommand::Init { user } => cmd_config_init(user).await,
    },
  }
}
