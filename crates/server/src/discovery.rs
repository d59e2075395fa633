//! On-disk session discovery
//!
//! Each session the agent has logged lives in its own directory under the
//! logs root with a `meta.json` (`session_id`, `start_time`, `end_time`) and
//! a `messages.jsonl` holding one message per line.

use std::fs;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::debug;

const META_FILE: &str = "meta.json";
const MESSAGES_FILE: &str = "messages.jsonl";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredSession {
    pub id: String,
    pub started_at: Option<String>,
    /// End time, falling back to the start time.
    pub last_activity: Option<String>,
    pub message_count: usize,
    pub dir: PathBuf,
}

/// Scan `logs_root`, sorted by directory name. A missing root yields an
/// empty list; directories without readable metadata are skipped.
pub fn discover_sessions(logs_root: &Path) -> Vec<DiscoveredSession> {
    let Ok(entries) = fs::read_dir(logs_root) else {
        return Vec::new();
    };

    let mut dirs: Vec<PathBuf> = entries
        .filter_map(Result::ok)
        .map(|entry| entry.path())
        .filter(|path| path.is_dir())
        .collect();
    dirs.sort();

    dirs.into_iter().filter_map(|dir| read_session(&dir)).collect()
}

fn read_session(dir: &Path) -> Option<DiscoveredSession> {
    let meta_path = dir.join(META_FILE);
    let text = fs::read_to_string(&meta_path).ok()?;
    let meta: Value = match serde_json::from_str(&text) {
        Ok(meta) => meta,
        Err(e) => {
            debug!(
                component = "discovery",
                event = "discovery.meta.invalid",
                path = %meta_path.display(),
                error = %e,
                "Skipping session with unreadable metadata"
            );
            return None;
        }
    };

    let dir_name = dir.file_name()?.to_string_lossy().into_owned();
    let id = text_field(&meta, "session_id")
        .filter(|id| !id.is_empty())
        .unwrap_or(dir_name);
    let started_at = text_field(&meta, "start_time");
    let last_activity = text_field(&meta, "end_time").or_else(|| started_at.clone());

    Some(DiscoveredSession {
        id,
        started_at,
        last_activity,
        message_count: count_lines(&dir.join(MESSAGES_FILE)),
        dir: dir.to_path_buf(),
    })
}

fn text_field(meta: &Value, key: &str) -> Option<String> {
    match meta.get(key)? {
        Value::Null => None,
        Value::String(text) if text.is_empty() => None,
        Value::String(text) => Some(text.clone()),
        other => Some(other.to_string()),
    }
}

fn count_lines(path: &Path) -> usize {
    match fs::File::open(path) {
        Ok(file) => BufReader::new(file).lines().count(),
        Err(_) => 0,
    }
}
