//! Configuration system for docsync with per-directory overrides.
//!
//! Config priority: directory-relative (.docsync.toml) > user (~/.config/docsync/config.toml) > defaults

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// File name looked up in the working directory
pub const LOCAL_CONFIG_FILE: &str = ".docsync.toml";

// ============================================================================
// Index Configuration
// ============================================================================

/// Controls which files become documents and how they are indexed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexConfig {
  /// Extensions handled by the plain-text parser (default: txt, md, html, ...)
  pub text_extensions: Vec<String>,

  /// Extensions treated as tar archives and descended into (default: tar, tgz, tar.gz)
  pub archive_extensions: Vec<String>,

  /// Gitignore-style patterns for files and folders that are skipped entirely
  pub exclude_patterns: Vec<String>,

  /// Files larger than this are indexed by name only (default: 16MB)
  pub max_file_size: u64,

  /// Index files the parser cannot read under their file name (default: true)
  pub index_filenames: bool,

  /// Store the root relative to the working directory when it lies beneath it (default: false)
  ///
  /// Lets an index directory travel with the documents it covers, e.g. on a USB drive.
  pub store_relative_paths: bool,
}

impl Default for IndexConfig {
  fn default() -> Self {
    Self {
      text_extensions: [
        "txt", "md", "csv", "log", "java", "cpp", "py", "rs", "html", "htm", "xml", "json",
      ]
      .into_iter()
      .map(String::from)
      .collect(),
      archive_extensions: ["tar", "tgz", "tar.gz"].into_iter().map(String::from).collect(),
      exclude_patterns: vec![".*".to_string()],
      max_file_size: 16 * 1024 * 1024,
      index_filenames: true,
      store_relative_paths: false,
    }
  }
}

impl IndexConfig {
  /// Whether `name` carries one of the configured archive extensions
  pub fn is_archive(&self, name: &str) -> bool {
    let lower = name.to_lowercase();
    self
      .archive_extensions
      .iter()
      .any(|ext| lower.ends_with(&format!(".{}", ext.to_lowercase())))
  }

  /// Whether `name` carries one of the configured text extensions
  pub fn is_text(&self, name: &str) -> bool {
    let lower = name.to_lowercase();
    self
      .text_extensions
      .iter()
      .any(|ext| lower.ends_with(&format!(".{}", ext.to_lowercase())))
  }
}

// ============================================================================
// Queue Configuration
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
  /// Number of progress and error messages each task keeps (default: 1000)
  pub reporter_capacity: usize,

  /// Memory budget of the search index writer in bytes (default: 50MB)
  pub writer_heap_bytes: usize,
}

impl Default for QueueConfig {
  fn default() -> Self {
    Self {
      reporter_capacity: 1000,
      writer_heap_bytes: 50_000_000,
    }
  }
}

// ============================================================================
// Watch Configuration
// ============================================================================

/// Folder watcher settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchConfig {
  /// Watch registered folders for changes (default: true)
  pub enabled: bool,

  /// Quiet period before a changed folder is updated, in milliseconds (default: 1000)
  pub debounce_ms: u64,

  /// Poll interval for backends without native events, in seconds (default: 2)
  pub poll_interval_secs: u64,
}

impl Default for WatchConfig {
  fn default() -> Self {
    Self {
      enabled: true,
      debounce_ms: 1000,
      poll_interval_secs: 2,
    }
  }
}

// ============================================================================
// Daemon Configuration
// ============================================================================

/// Logging settings for long-running commands
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
  /// Log level: "off", "error", "warn", "info", "debug", "trace"
  /// Default: "info"
  #[serde(default = "default_log_level")]
  pub log_level: String,

  /// Log file rotation: "daily", "hourly", "never"
  /// Default: "daily"
  #[serde(default = "default_log_rotation")]
  pub log_rotation: String,

  /// Maximum log file age in days (0 = keep forever)
  /// Default: 7
  #[serde(default = "default_log_retention_days")]
  pub log_retention_days: u64,
}

fn default_log_level() -> String {
  "info".to_string()
}
fn default_log_rotation() -> String {
  "daily".to_string()
}
fn default_log_retention_days() -> u64 {
  7
}

impl Default for DaemonConfig {
  fn default() -> Self {
    Self {
      log_level: default_log_level(),
      log_rotation: default_log_rotation(),
      log_retention_days: default_log_retention_days(),
    }
  }
}

// ============================================================================
// Root Configuration
// ============================================================================

/// docsync configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
  /// Indexing settings
  #[serde(default)]
  pub index: IndexConfig,

  /// Task queue settings
  #[serde(default)]
  pub queue: QueueConfig,

  /// Folder watcher settings
  #[serde(default)]
  pub watch: WatchConfig,

  /// Logging settings
  #[serde(default)]
  pub daemon: DaemonConfig,
}

impl Config {
  /// Load config for a directory, with fallback to user config
  pub fn load(dir: &Path) -> Self {
    let local_config = Self::local_config_path(dir);
    if local_config.exists()
      && let Ok(content) = std::fs::read_to_string(&local_config)
      && let Ok(config) = toml::from_str(&content)
    {
      return config;
    }

    let user_config_path = Self::user_config_path();
    if user_config_path.exists()
      && let Ok(content) = std::fs::read_to_string(&user_config_path)
      && let Ok(config) = toml::from_str(&content)
    {
      return config;
    }

    Self::default()
  }

  /// Get the user-level config path
  pub fn user_config_path() -> PathBuf {
    crate::dirs::default_config_dir().join("config.toml")
  }

  /// Get the directory-relative config path
  pub fn local_config_path(dir: &Path) -> PathBuf {
    dir.join(LOCAL_CONFIG_FILE)
  }

  /// Generate a default config file as a string
  pub fn generate_template() -> String {
    let defaults = Self::default();
    let quoted = |items: &[String]| {
      items
        .iter()
        .map(|item| format!("\"{}\"", item))
        .collect::<Vec<_>>()
        .join(", ")
    };

    format!(
      r#"# docsync Configuration
# Place in ./.docsync.toml (per directory) or ~/.config/docsync/config.toml (user)

# ============================================================================
# Indexing
# ============================================================================

[index]
# Extensions read by the built-in text parser
text_extensions = [{text_extensions}]

# Extensions treated as tar archives (their entries become documents)
archive_extensions = [{archive_extensions}]

# Gitignore-style patterns for files and folders to skip
exclude_patterns = [{exclude_patterns}]

# Files larger than this (bytes) are indexed by file name only
max_file_size = {max_file_size}

# Make unreadable files findable by their file name
index_filenames = true

# Store index roots relative to the working directory (portable indexes)
store_relative_paths = false

# ============================================================================
# Task Queue
# ============================================================================

[queue]
# Progress and error messages kept per task
reporter_capacity = {reporter_capacity}

# Search index writer memory budget in bytes
writer_heap_bytes = {writer_heap_bytes}

# ============================================================================
# Folder Watcher
# ============================================================================

[watch]
enabled = true

# Quiet period before a changed folder is updated (milliseconds)
debounce_ms = {debounce_ms}

# Poll interval for filesystems without change notifications (seconds)
poll_interval_secs = {poll_interval_secs}

# ============================================================================
# Logging
# ============================================================================

[daemon]
# Log level: off, error, warn, info, debug, trace
log_level = "info"

# Log file rotation: daily, hourly, never
log_rotation = "daily"

# Days to keep rotated log files (0 = forever)
log_retention_days = 7
"#,
      text_extensions = quoted(&defaults.index.text_extensions),
      archive_extensions = quoted(&defaults.index.archive_extensions),
      exclude_patterns = quoted(&defaults.index.exclude_patterns),
      max_file_size = defaults.index.max_file_size,
      reporter_capacity = defaults.queue.reporter_capacity,
      writer_heap_bytes = defaults.queue.writer_heap_bytes,
      debounce_ms = defaults.watch.debounce_ms,
      poll_interval_secs = defaults.watch.poll_interval_secs,
    )
  }
}
