//! Data-directory resolution and the daemon activity log.
//!
//! Everything the daemon persists lives under a single directory:
//! the SQLite database, the daemon handshake file and the activity log.
//! `ROBOREV_DATA_DIR` overrides the default `~/.roborev`; tests always
//! set it to a temp directory so the production log is never touched.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Utc;

/// Environment variable that overrides the default data directory.
pub const DATA_DIR_ENV: &str = "ROBOREV_DATA_DIR";

/// Resolve the data directory: `$ROBOREV_DATA_DIR`, else `~/.roborev`.
pub fn data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var(DATA_DIR_ENV) {
        if !dir.is_empty() {
            return PathBuf::from(dir);
        }
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".roborev")
}

pub fn database_path(data_dir: &Path) -> PathBuf {
    data_dir.join("reviews.db")
}

pub fn handshake_path(data_dir: &Path) -> PathBuf {
    data_dir.join("daemon.json")
}

pub fn activity_log_path(data_dir: &Path) -> PathBuf {
    data_dir.join("activity.log")
}

pub fn global_config_path(data_dir: &Path) -> PathBuf {
    data_dir.join("config.toml")
}

/// Append-only text log of daemon events.
///
/// One line per event, prefixed with an RFC 3339 timestamp. Failures to
/// append are reported to the caller; the daemon logs and carries on.
#[derive(Debug, Clone)]
pub struct ActivityLog {
    path: PathBuf,
}

impl ActivityLog {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn record(&self, event: &str) -> std::io::Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "{} {}", Utc::now().to_rfc3339(), event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn well_known_paths_live_under_data_dir() {
        let dir = Path::new("/data");
        assert_eq!(database_path(dir), Path::new("/data/reviews.db"));
        assert_eq!(handshake_path(dir), Path::new("/data/daemon.json"));
        assert_eq!(activity_log_path(dir), Path::new("/data/activity.log"));
        assert_eq!(global_config_path(dir), Path::new("/data/config.toml"));
    }

    #[test]
    fn activity_log_appends_lines() {
        let dir = TempDir::new().unwrap();
        let log = ActivityLog::new(activity_log_path(dir.path()));

        log.record("daemon started").unwrap();
        log.record("daemon stopped").unwrap();

        let contents = fs::read_to_string(log.path()).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ends_with("daemon started"));
        assert!(lines[1].ends_with("daemon stopped"));
    }

    #[test]
    fn data_dir_honors_env_override() {
        // Single test covers set and unset so parallel tests never race
        // on the shared environment variable.
        std::env::set_var(DATA_DIR_ENV, "/tmp/roborev-test-data");
        assert_eq!(data_dir(), PathBuf::from("/tmp/roborev-test-data"));

        std::env::remove_var(DATA_DIR_ENV);
        let fallback = data_dir();
        assert!(fallback.ends_with(".roborev"));
    }
}
