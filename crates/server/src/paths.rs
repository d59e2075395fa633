//! Path resolution for vibecheck data files.
//!
//! Resolved once at startup from: `--data-dir` > `VIBECHECK_DATA_DIR` env >
//! `~/.vibecheck`. Session discovery reads the agent's own log tree, which
//! defaults to `~/.vibe/logs/session`.

use std::io;
use std::path::{Path, PathBuf};

use crate::config::ConfigError;

const DATA_DIR_NAME: &str = ".vibecheck";

fn home_dir() -> Result<PathBuf, ConfigError> {
    dirs::home_dir().ok_or(ConfigError::NoHomeDir)
}

/// `explicit` wins; otherwise `~/.vibecheck`.
pub fn resolve_data_dir(explicit: Option<&Path>) -> Result<PathBuf, ConfigError> {
    match explicit {
        Some(path) => Ok(path.to_path_buf()),
        None => Ok(home_dir()?.join(DATA_DIR_NAME)),
    }
}

/// `explicit` wins; otherwise `~/.vibe/logs/session`.
pub fn resolve_session_logs_root(explicit: Option<&Path>) -> Result<PathBuf, ConfigError> {
    match explicit {
        Some(path) => Ok(path.to_path_buf()),
        None => Ok(home_dir()?.join(".vibe").join("logs").join("session")),
    }
}

/// Server log file name inside [`log_dir`].
pub const LOG_FILE: &str = "server.log";

/// Filter used when neither `VIBECHECK_SERVER_LOG_FILTER` nor `RUST_LOG` parses.
pub const DEFAULT_LOG_FILTER: &str = "info,tower_http=warn,hyper=warn";

pub fn log_dir(data_dir: &Path) -> PathBuf {
    data_dir.join("logs")
}

/// Create the data dir and its `logs` subdirectory.
pub fn ensure_dirs(data_dir: &Path) -> io::Result<()> {
    std::fs::create_dir_all(data_dir)?;
    std::fs::create_dir_all(log_dir(data_dir))?;
    Ok(())
}
