use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;

use chrono::Utc;
use log::{LevelFilter, Log, Metadata, Record};

/// Appends one timestamped line per record to a log file.
pub struct Logger {
  file: Mutex<std::fs::File>,
  level: LevelFilter,
}

impl Logger {
  pub fn new(path: &Path, level: LevelFilter) -> anyhow::Result<Self> {
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    Ok(Self {
      file: Mutex::new(file),
      level,
    })
  }

  /// Installs this logger as the global `log` backend.
  pub fn install(self) -> anyhow::Result<()> {
    let level = self.level;
    log::set_boxed_logger(Box::new(self)).map_err(|err| anyhow::anyhow!(err.to_string()))?;
    log::set_max_level(level);
    Ok(())
  }
}

impl Log for Logger {
  fn enabled(&self, metadata: &Metadata) -> bool {
    metadata.level() <= self.level
  }

  fn log(&self, record: &Record) {
    if !self.enabled(record.metadata()) {
      return;
    }
    let line = format_line(&Utc::now().to_rfc3339(), record);
    if let Ok(mut file) = self.file.lock() {
      let _ = file.write_all(line.as_bytes());
    }
  }

  fn flush(&self) {
    if let Ok(mut file) = self.file.lock() {
      let _ = file.flush();
    }
  }
}

fn format_line(ts: &str, record: &Record) -> String {
  format!("[{ts}] {} {}: {}\n", record.level(), record.target(), record.args())
}

/// `SITESMITH_LOG` as a level filter, `info` when unset or unrecognized.
pub fn level_from_env() -> LevelFilter {
  std::env::var("SITESMITH_LOG")
    .ok()
    .and_then(|value| value.parse().ok())
    .unwrap_or(LevelFilter::Info)
}
