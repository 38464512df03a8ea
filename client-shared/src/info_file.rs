//! The daemon's info file.
//!
//! A running daemon announces itself with a small JSON file named
//! `<safe-name>-<port>.json` and keeps the file's mtime fresh every 5 s.
//! Anything older than that plus a grace period belongs to a dead daemon and
//! may be deleted.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use anyhow::{Context as _, Result};
use serde::{Deserialize, Serialize};

/// How often a live daemon touches its info file.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);

/// Slack granted on top of the heartbeat before a file counts as stale.
const STALE_GRACE: Duration = Duration::from_millis(600);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DaemonInfo {
    pub name: String,
    pub port: u16,
    pub pid: u32,
}

/// `<safe-name>-<port>.json`.
pub fn file_name(name: &str, port: u16) -> String {
    format!("{}-{port}.json", safe_name(name))
}

/// Replaces every character outside `[A-Za-z0-9._-]` with `-`.
///
/// In particular the `+` of combined connect names turns into `-`.
fn safe_name(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '-'
            }
        })
        .collect()
}

pub fn write(dir: &Path, info: &DaemonInfo) -> Result<PathBuf> {
    fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create {}", dir.display()))?;

    let path = dir.join(file_name(&info.name, info.port));
    let json = serde_json::to_string_pretty(info)?;

    fs::write(&path, json).with_context(|| format!("Failed to write {}", path.display()))?;

    Ok(path)
}

pub fn read(path: &Path) -> Result<DaemonInfo> {
    let json =
        fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;

    serde_json::from_str(&json).with_context(|| format!("Malformed info file {}", path.display()))
}

/// Refreshes the file's mtime; the daemon calls this every
/// [`HEARTBEAT_INTERVAL`].
pub fn touch(path: &Path) -> Result<()> {
    let file = fs::File::options()
        .append(true)
        .open(path)
        .with_context(|| format!("Failed to open {}", path.display()))?;

    file.set_modified(SystemTime::now())
        .with_context(|| format!("Failed to touch {}", path.display()))?;

    Ok(())
}

/// Whether the info file's owner has missed its heartbeat.
pub fn is_stale(path: &Path) -> Result<bool> {
    let mtime = fs::metadata(path)
        .and_then(|m| m.modified())
        .with_context(|| format!("Failed to stat {}", path.display()))?;

    let age = SystemTime::now()
        .duration_since(mtime)
        .unwrap_or(Duration::ZERO);

    Ok(age > HEARTBEAT_INTERVAL + STALE_GRACE)
}

/// Deletes every stale info file in `dir`.
pub fn remove_stale_files(dir: &Path) -> Result<()> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => {
            return Err(e).with_context(|| format!("Failed to list {}", dir.display()));
        }
    };

    for entry in entries.filter_map(|e| e.ok()) {
        let path = entry.path();

        if path.extension().is_none_or(|ext| ext != "json") {
            continue;
        }

        if is_stale(&path).unwrap_or(false) {
            tracing::debug!(path = %path.display(), "Removing stale info file");

            if let Err(e) = fs::remove_file(&path) {
                tracing::warn!(path = %path.display(), "Failed to remove stale info file: {e}");
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mangles_unsafe_characters() {
        assert_eq!(file_name("docker-desktop", 8080), "docker-desktop-8080.json");
        assert_eq!(
            file_name("gke_project_us-central1_cluster", 1234),
            "gke_project_us-central1_cluster-1234.json"
        );
        assert_eq!(file_name("a@b/c", 1), "a-b-c-1.json");
        // The `+` of combined names becomes a `-` too.
        assert_eq!(file_name("ctx+extra", 9), "ctx-extra-9.json");
    }

    #[test]
    fn round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let info = DaemonInfo {
            name: "kind-kind".to_string(),
            port: 18080,
            pid: 4242,
        };

        let path = write(dir.path(), &info).unwrap();

        assert_eq!(path.file_name().unwrap(), "kind-kind-18080.json");
        assert_eq!(read(&path).unwrap(), info);
    }

    #[test]
    fn fresh_files_are_not_stale() {
        let dir = tempfile::tempdir().unwrap();
        let info = DaemonInfo {
            name: "x".to_string(),
            port: 1,
            pid: 1,
        };

        let path = write(dir.path(), &info).unwrap();
        touch(&path).unwrap();

        assert!(!is_stale(&path).unwrap());
    }

    #[test]
    fn old_files_are_stale_and_removed() {
        let dir = tempfile::tempdir().unwrap();
        let info = DaemonInfo {
            name: "x".to_string(),
            port: 1,
            pid: 1,
        };

        let path = write(dir.path(), &info).unwrap();

        let past = SystemTime::now() - (HEARTBEAT_INTERVAL + Duration::from_secs(2));
        fs::File::options()
            .append(true)
            .open(&path)
            .unwrap()
            .set_modified(past)
            .unwrap();

        assert!(is_stale(&path).unwrap());

        remove_stale_files(dir.path()).unwrap();
        assert!(!path.exists());
    }
}
