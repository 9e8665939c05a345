//! Diagnostics for cardgate.
//!
//! Provides:
//! - **About info**: version, build timestamp, git SHA, platform
//! - **Log rotation helpers**: used by `lib.rs` to configure rolling log files

use serde_json::{json, Value};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Maximum number of log files to retain.
pub const MAX_LOG_FILES: usize = 10;

/// File name prefix of the rolling log files.
pub const LOG_FILE_PREFIX: &str = "cardgate";

// ---------------------------------------------------------------------------
// About info
// ---------------------------------------------------------------------------

/// Returns version, build timestamp, git SHA, and platform info.
pub fn get_about_info() -> Value {
    json!({
        "version": env!("CARGO_PKG_VERSION"),
        "buildTimestamp": env!("BUILD_TIMESTAMP"),
        "gitSha": env!("BUILD_GIT_SHA"),
        "profile": env!("BUILD_PROFILE"),
        "platform": std::env::consts::OS,
        "arch": std::env::consts::ARCH,
    })
}

// ---------------------------------------------------------------------------
// Log rotation
// ---------------------------------------------------------------------------

/// Returns the log directory: `configured` when set, otherwise
/// `$XDG_DATA_HOME/cardgate/logs` (or `~/.local/share/cardgate/logs`).
pub fn get_log_dir(configured: Option<&Path>) -> PathBuf {
    if let Some(dir) = configured {
        return dir.to_path_buf();
    }
    let base = std::env::var("XDG_DATA_HOME")
        .ok()
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| {
            PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| ".".into()))
                .join(".local")
                .join("share")
        });
    base.join("cardgate").join("logs")
}

/// Prune old log files in `log_dir`, keeping only the most recent `MAX_LOG_FILES`.
pub fn prune_old_logs(log_dir: &Path) {
    if !log_dir.exists() {
        return;
    }

    let mut log_files: Vec<(PathBuf, std::time::SystemTime)> = Vec::new();
    if let Ok(entries) = fs::read_dir(log_dir) {
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let is_log = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|name| name.starts_with(&format!("{LOG_FILE_PREFIX}.")));
            if is_log {
                let modified = entry
                    .metadata()
                    .ok()
                    .and_then(|m| m.modified().ok())
                    .unwrap_or(std::time::UNIX_EPOCH);
                log_files.push((path, modified));
            }
        }
    }

    // Sort newest first
    log_files.sort_by(|a, b| b.1.cmp(&a.1));

    for (path, _) in log_files.iter().skip(MAX_LOG_FILES) {
        if let Err(e) = fs::remove_file(path) {
            warn!(path = %path.display(), error = %e, "Failed to prune log file");
        }
    }
}
