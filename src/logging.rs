use std::{
    fs::{self, File, OpenOptions},
    io::Write,
    path::{Path, PathBuf},
    sync::Mutex,
    time::{SystemTime, UNIX_EPOCH},
};

use anyhow::{Context, Result};
use log::{Level, LevelFilter, Log, Metadata, Record};
use serde_json::json;

pub mod category {
    pub const SYSTEM: &str = "System";
    pub const SERIAL: &str = "SerialPort";
    pub const TCP: &str = "TCP";
    pub const WIFI: &str = "WiFi";
    pub const IMU: &str = "IMUData";
    pub const FILE_IO: &str = "FileIO";
}

/// Console logger with an optional JSON-lines sink.
///
/// Info and below go to stdout, warnings and errors to stderr. Each record is
/// also appended to the JSON file (one object per line) when a path is set.
pub struct FixtureLogger {
    level: LevelFilter,
    json_file: Option<Mutex<File>>,
}

impl FixtureLogger {
    pub fn new(level: LevelFilter, path: Option<PathBuf>) -> Result<Self> {
        let json_file = match path {
            Some(path) => {
                ensure_parent_dir(&path)?;
                let file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&path)
                    .with_context(|| format!("failed to open log file {}", path.display()))?;
                Some(Mutex::new(file))
            }
            None => None,
        };
        Ok(Self { level, json_file })
    }

    /// Installs the logger as the global `log` backend.
    ///
    /// `FIXTURE_LOG_JSON_PATH` overrides the configured JSON path.
    pub fn install(level: LevelFilter, path: Option<PathBuf>) -> Result<()> {
        let path = std::env::var("FIXTURE_LOG_JSON_PATH")
            .ok()
            .filter(|raw| !raw.trim().is_empty())
            .map(PathBuf::from)
            .or(path);
        let logger = Self::new(level, path)?;
        log::set_boxed_logger(Box::new(logger)).context("logger already installed")?;
        log::set_max_level(level);
        Ok(())
    }

    fn event(&self, level: Level, category: &str, message: &str) {
        let Some(file) = &self.json_file else {
            return;
        };

        let ts_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);

        let entry = json!({
            "ts_ms": ts_ms,
            "level": level.as_str().to_ascii_lowercase(),
            "category": category,
            "msg": message,
        });

        if let Ok(mut file) = file.lock() {
            let _ = writeln!(file, "{}", entry);
            let _ = file.flush();
        }
    }
}

impl Log for FixtureLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let message = record.args().to_string();
        let category = record.target();
        match record.level() {
            Level::Error | Level::Warn => {
                eprintln!("[{}] {}: {}", record.level(), category, message)
            }
            _ => println!("[{}] {}: {}", record.level(), category, message),
        }
        self.event(record.level(), category, &message);
    }

    fn flush(&self) {
        if let Some(file) = &self.json_file {
            if let Ok(mut file) = file.lock() {
                let _ = file.flush();
            }
        }
    }
}

pub fn ensure_parent_dir(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use anyhow::Result;
    use log::{Level, LevelFilter, Log, Record};
    use tempfile::tempdir;

    use super::FixtureLogger;

    #[test]
    fn json_sink_writes_one_object_per_record() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("nested/run.jsonl");
        let logger = FixtureLogger::new(LevelFilter::Debug, Some(path.clone()))?;

        logger.log(
            &Record::builder()
                .level(Level::Warn)
                .target("SerialPort")
                .args(format_args!("port busy"))
                .build(),
        );
        logger.log(
            &Record::builder()
                .level(Level::Trace)
                .target("TCP")
                .args(format_args!("filtered out"))
                .build(),
        );

        let raw = std::fs::read_to_string(path)?;
        let lines = raw.lines().collect::<Vec<_>>();
        assert_eq!(lines.len(), 1);
        let entry: serde_json::Value = serde_json::from_str(lines[0])?;
        assert_eq!(entry["level"], "warn");
        assert_eq!(entry["category"], "SerialPort");
        assert_eq!(entry["msg"], "port busy");
        Ok(())
    }
}
