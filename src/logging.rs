use color_eyre::{eyre::eyre, Result};
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Environment variable holding the log filter directives.
pub const LOG_ENV: &str = "DRIVECRAWL_LOG";

/// Install the global subscriber: stderr always, plus a daily rolling file
/// under `log_dir` when given. The returned guard flushes the file writer
/// and must live until exit.
pub fn init(log_dir: Option<&Path>) -> Result<Option<WorkerGuard>> {
  let stderr = fmt::layer()
    .with_writer(std::io::stderr)
    .with_target(false)
    .with_filter(filter());

  let (file, guard) = match log_dir {
    Some(dir) => {
      std::fs::create_dir_all(dir)
        .map_err(|e| eyre!("Failed to create log directory {}: {}", dir.display(), e))?;
      let appender = tracing_appender::rolling::daily(dir, "drivecrawl.log");
      let (writer, guard) = tracing_appender::non_blocking(appender);
      let layer = fmt::layer()
        .with_writer(writer)
        .with_ansi(false)
        .with_filter(filter());
      (Some(layer), Some(guard))
    }
    None => (None, None),
  };

  tracing_subscriber::registry()
    .with(stderr)
    .with(file)
    .try_init()
    .map_err(|e| eyre!("Failed to initialize logging: {}", e))?;

  Ok(guard)
}

fn filter() -> EnvFilter {
  EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("info"))
}
