//! Logging setup for one-shot commands and the watcher

use docsync::{config::DaemonConfig, dirs::default_log_dir};
use tracing_appender::{non_blocking::WorkerGuard, rolling};
use tracing_subscriber::EnvFilter;

/// Parse log level from config string
fn parse_log_level(level: &str) -> tracing::Level {
  match level.to_lowercase().as_str() {
    "off" | "error" => tracing::Level::ERROR,
    "warn" => tracing::Level::WARN,
    "info" => tracing::Level::INFO,
    "debug" => tracing::Level::DEBUG,
    "trace" => tracing::Level::TRACE,
    _ => tracing::Level::INFO,
  }
}

/// Initialize logging for one-shot commands.
///
/// Logs go to stderr so command output stays clean; only warnings show unless
/// `RUST_LOG` asks for more.
pub fn init_cli_logging() {
  let env_filter = EnvFilter::builder()
    .with_default_directive(tracing::Level::WARN.into())
    .from_env_lossy();
  tracing_subscriber::fmt()
    .with_env_filter(env_filter)
    .with_writer(std::io::stderr)
    .init();
}

/// Initialize logging for the watcher: console plus a rolling log file.
///
/// Returns the guard that must be kept alive for the duration of the program.
/// Falls back to console-only logging if the log directory is unusable.
pub fn init_watch_logging(config: &DaemonConfig) -> Option<WorkerGuard> {
  use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt};

  let level = parse_log_level(&config.log_level);
  let env_filter = || {
    EnvFilter::builder()
      .with_default_directive(level.into())
      .from_env_lossy()
  };

  let log_dir = default_log_dir();
  let rotation = match config.log_rotation.as_str() {
    "hourly" => rolling::Rotation::HOURLY,
    "never" => rolling::Rotation::NEVER,
    _ => rolling::Rotation::DAILY,
  };
  let mut builder = rolling::Builder::new()
    .rotation(rotation)
    .filename_prefix("docsync")
    .filename_suffix("log");
  if config.log_retention_days > 0 {
    builder = builder.max_log_files(config.log_retention_days as usize);
  }

  let appender = match std::fs::create_dir_all(&log_dir)
    .map_err(|e| e.to_string())
    .and_then(|()| builder.build(&log_dir).map_err(|e| e.to_string()))
  {
    Ok(appender) => appender,
    Err(e) => {
      tracing_subscriber::fmt()
        .with_env_filter(env_filter())
        .with_target(true)
        .init();
      tracing::warn!(dir = %log_dir.display(), error = %e, "File logging unavailable, logging to console only");
      return None;
    }
  };
  let (file_writer, guard) = tracing_appender::non_blocking(appender);

  tracing_subscriber::registry()
    .with(env_filter())
    .with(fmt::layer().with_target(true).with_ansi(true))
    .with(fmt::layer().with_target(true).with_ansi(false).with_writer(file_writer))
    .init();

  Some(guard)
}
