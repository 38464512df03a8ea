//! File logger for the interception core.
//!
//! A new log file is created per process start and never rotated for the duration
//! of the process. To keep the log directory bounded, creating a new file prunes
//! the oldest files beyond `TELEPRESENCE_MAX_LOGFILES` (default 5).
//!
//! Since these files may leave the user's machine, they should contain *only*
//! the necessary debugging information, and **not** any sensitive information
//! such as cluster credentials or request payloads.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::{fs, io};

use time::OffsetDateTime;
use tracing::Subscriber;
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::Layer;

const LOG_FILE_BASE_NAME: &str = "seam";
pub const TIME_FORMAT: &str = "[year]-[month]-[day]-[hour]-[minute]-[second]";

/// Maximum number of log files kept in the log directory.
pub const MAX_LOGFILES_ENV: &str = "TELEPRESENCE_MAX_LOGFILES";
const DEFAULT_MAX_LOGFILES: usize = 5;

/// Create a new file logger layer.
pub fn layer<T>(log_dir: &Path) -> (Box<dyn Layer<T> + Send + Sync + 'static>, Handle)
where
    T: Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
{
    let (appender, guard) = new_appender(log_dir.to_path_buf(), "log");
    let layer = tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .with_writer(appender)
        .boxed();

    let handle = Handle {
        _guard: Arc::new(guard),
    };

    // Return the guard so that the caller maintains a handle to it. Otherwise,
    // we have to wait for tracing_appender to flush the logs before exiting.
    // See https://docs.rs/tracing-appender/latest/tracing_appender/non_blocking/struct.WorkerGuard.html
    (layer, handle)
}

fn new_appender(directory: PathBuf, file_extension: &'static str) -> (NonBlocking, WorkerGuard) {
    let appender = Appender {
        directory,
        current: None,
        file_extension,
    };

    tracing_appender::non_blocking(appender)
}

/// A handle to our file-logger.
///
/// This handle houses the [`WorkerGuard`] of the underlying non-blocking appender.
/// Thus, you MUST NOT drop this handle for as long as you want messages to arrive at the log file.
#[must_use]
#[derive(Clone, Debug)]
pub struct Handle {
    _guard: Arc<WorkerGuard>,
}

#[derive(Debug)]
struct Appender {
    directory: PathBuf,
    file_extension: &'static str,
    // Leaving this so that I/O errors come up through `write` instead of panicking
    // in `layer`
    current: Option<(fs::File, String)>,
}

impl Appender {
    fn with_current_file<R>(
        &mut self,
        cb: impl Fn(&mut fs::File) -> io::Result<R>,
    ) -> io::Result<R> {
        match self.current.as_mut() {
            None => {
                let (mut file, name) = self.create_new_writer()?;

                let ret = cb(&mut file);

                self.current = Some((file, name));

                ret
            }
            Some((file, _)) => cb(file),
        }
    }

    // Inspired from `tracing-appender/src/rolling.rs`.
    fn create_new_writer(&self) -> io::Result<(fs::File, String)> {
        let format = time::format_description::parse(TIME_FORMAT).map_err(io::Error::other)?;
        let date = OffsetDateTime::now_utc()
            .format(&format)
            .map_err(|_| io::Error::other("Failed to format timestamp"))?;

        let filename = format!("{LOG_FILE_BASE_NAME}.{date}.{}", self.file_extension);

        let path = self.directory.join(&filename);
        let mut open_options = fs::OpenOptions::new();
        open_options.append(true).create(true);

        let new_file = open_options.open(path.as_path());
        if new_file.is_err()
            && let Some(parent) = path.parent()
        {
            fs::create_dir_all(parent)?;
            let file = open_options.open(path)?;

            prune_old_files(&self.directory, self.file_extension);

            return Ok((file, filename));
        }

        let file = new_file?;
        prune_old_files(&self.directory, self.file_extension);

        Ok((file, filename))
    }
}

/// Deletes the oldest log files so that at most [`MAX_LOGFILES_ENV`] remain.
///
/// Our file names embed a UTC timestamp, so the lexicographic order is the
/// chronological order. Failures are logged and otherwise ignored; pruning must
/// never take down the process.
fn prune_old_files(directory: &Path, file_extension: &str) {
    let max_files = max_logfiles();

    let Ok(entries) = fs::read_dir(directory) else {
        return;
    };

    let mut log_files = entries
        .filter_map(|e| e.ok())
        .filter_map(|e| {
            let name = e.file_name().into_string().ok()?;

            (name.starts_with(LOG_FILE_BASE_NAME) && name.ends_with(file_extension))
                .then_some(name)
        })
        .collect::<Vec<_>>();

    if log_files.len() <= max_files {
        return;
    }

    log_files.sort_unstable();

    let num_stale = log_files.len() - max_files;

    for name in log_files.into_iter().take(num_stale) {
        if let Err(e) = fs::remove_file(directory.join(&name)) {
            tracing::warn!(%name, "Failed to remove stale log file: {e}");
        }
    }
}

fn max_logfiles() -> usize {
    std::env::var(MAX_LOGFILES_ENV)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(DEFAULT_MAX_LOGFILES)
}

impl io::Write for Appender {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.with_current_file(|f| f.write(buf))
    }

    fn flush(&mut self) -> io::Result<()> {
        self.with_current_file(|f| f.flush())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prunes_oldest_files_beyond_cap() {
        let dir = tempfile::tempdir().unwrap();

        for hour in 10..20 {
            let name = format!("{LOG_FILE_BASE_NAME}.2026-01-01-{hour}-00-00.log");
            fs::write(dir.path().join(name), b"x").unwrap();
        }

        prune_old_files(dir.path(), "log");

        let mut remaining = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect::<Vec<_>>();
        remaining.sort_unstable();

        assert_eq!(remaining.len(), DEFAULT_MAX_LOGFILES);
        assert_eq!(
            remaining.first().unwrap(),
            &format!("{LOG_FILE_BASE_NAME}.2026-01-01-15-00-00.log")
        );
    }

    #[test]
    fn ignores_unrelated_files() {
        let dir = tempfile::tempdir().unwrap();

        fs::write(dir.path().join("config.json"), b"{}").unwrap();
        fs::write(
            dir.path()
                .join(format!("{LOG_FILE_BASE_NAME}.2026-01-01-10-00-00.log")),
            b"x",
        )
        .unwrap();

        prune_old_files(dir.path(), "log");

        assert!(dir.path().join("config.json").exists());
    }
}
