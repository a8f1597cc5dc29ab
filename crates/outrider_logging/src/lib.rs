//! Logging for the Outrider binaries: tracing to stderr plus a
//! size-capped live log that rolls to timestamped archives.
//!
//! The live file is `<logs>/<app>.log`. When a write pushes it past
//! the cap it is renamed to `<app>.<unix-seconds>.log` and a fresh
//! live file is started; archives beyond the keep count are pruned,
//! oldest first.

use anyhow::{Context, Result};
use outrider_protocol::{defaults, paths};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

const DEFAULT_LOG_FILTER: &str =
    "outrider_agent=info,outrider_schedule=info,outrider_matcher=info,outrider_protocol=info";

/// Logging configuration for an Outrider binary. The rolling policy
/// comes from the platform defaults unless the configuration says
/// otherwise.
pub struct LogSettings<'a> {
    pub app_name: &'a str,
    /// Mirror the full file filter to stderr instead of warn-and-up.
    pub verbose: bool,
    /// Live-file size cap override, bytes.
    pub file_cap: Option<u64>,
    /// Archive keep-count override.
    pub keep: Option<usize>,
}

impl<'a> LogSettings<'a> {
    pub fn new(app_name: &'a str, verbose: bool) -> Self {
        Self {
            app_name,
            verbose,
            file_cap: None,
            keep: None,
        }
    }
}

/// The logs directory: ~/.outrider/logs
pub fn logs_dir() -> PathBuf {
    paths::outrider_home().join("logs")
}

/// Initialize tracing: a rolling file layer plus a stderr layer.
pub fn init_logging(settings: LogSettings<'_>) -> Result<()> {
    let dir = logs_dir();
    fs::create_dir_all(&dir)
        .with_context(|| format!("Failed to create logs directory: {}", dir.display()))?;

    let sink = LogSink::open(
        &dir,
        settings.app_name,
        settings.file_cap.unwrap_or(defaults::LOG_FILE_CAP_BYTES),
        settings.keep.unwrap_or(defaults::LOG_KEEP_ARCHIVES),
    )
    .with_context(|| format!("Failed to open log file for {}", settings.app_name))?;

    let file_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let console_filter = if settings.verbose {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER))
    } else {
        EnvFilter::new("warn")
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(Mutex::new(sink))
                .with_ansi(false)
                .with_filter(file_filter),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_filter(console_filter),
        )
        .init();

    Ok(())
}

/// The live log file plus its rolling policy.
struct LogSink {
    dir: PathBuf,
    stem: String,
    cap: u64,
    keep: usize,
    file: File,
    written: u64,
}

impl LogSink {
    fn open(dir: &Path, app_name: &str, cap: u64, keep: usize) -> io::Result<Self> {
        let stem = file_stem(app_name);
        let live = dir.join(format!("{stem}.log"));
        let file = OpenOptions::new().create(true).append(true).open(&live)?;
        let written = file.metadata()?.len();
        Ok(Self {
            dir: dir.to_path_buf(),
            stem,
            cap: cap.max(1),
            keep,
            file,
            written,
        })
    }

    fn live_path(&self) -> PathBuf {
        self.dir.join(format!("{}.log", self.stem))
    }

    /// Move the live file aside under a timestamped name and start a
    /// fresh one.
    fn roll(&mut self) -> io::Result<()> {
        self.file.flush()?;

        let stamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_secs())
            .unwrap_or(0);
        let mut archive = self.dir.join(format!("{}.{stamp}.log", self.stem));
        // the same second can roll more than once under burst load
        let mut bump = 1;
        while archive.exists() {
            archive = self.dir.join(format!("{}.{stamp}-{bump}.log", self.stem));
            bump += 1;
        }
        fs::rename(self.live_path(), &archive)?;
        self.prune();

        self.file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.live_path())?;
        self.written = 0;
        Ok(())
    }

    /// Delete the oldest archives past the keep count. Best effort: a
    /// failed listing or unlink only costs disk, never logging.
    fn prune(&self) {
        let Ok(listing) = fs::read_dir(&self.dir) else {
            return;
        };
        let live = self.live_path();
        let prefix = format!("{}.", self.stem);
        let mut archives: Vec<PathBuf> = listing
            .flatten()
            .map(|entry| entry.path())
            .filter(|path| *path != live)
            .filter(|path| {
                path.file_name()
                    .and_then(|name| name.to_str())
                    .map(|name| name.starts_with(&prefix) && name.ends_with(".log"))
                    .unwrap_or(false)
            })
            .collect();
        if archives.len() <= self.keep {
            return;
        }
        // unix-second stamps sort oldest first
        archives.sort();
        let excess = archives.len() - self.keep;
        for stale in archives.into_iter().take(excess) {
            let _ = fs::remove_file(stale);
        }
    }
}

impl Write for LogSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let written = self.file.write(buf)?;
        self.written += written as u64;
        // roll after the line that crossed the cap, so no line is split
        if self.written >= self.cap {
            self.roll()?;
        }
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

/// Reduce an application name to a safe file stem.
fn file_stem(app_name: &str) -> String {
    let cleaned: String = app_name
        .chars()
        .filter(|ch| ch.is_ascii_alphanumeric() || *ch == '-' || *ch == '_')
        .collect();
    if cleaned.is_empty() {
        "outrider".to_string()
    } else {
        cleaned
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn archives_in(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = fs::read_dir(dir)
            .unwrap()
            .flatten()
            .filter_map(|entry| entry.file_name().into_string().ok())
            .filter(|name| name != "agent.log")
            .collect();
        names.sort();
        names
    }

    #[test]
    fn live_log_rolls_into_archives() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = LogSink::open(dir.path(), "agent", 32, 8).unwrap();

        sink.write_all(b"short line\n").unwrap();
        assert!(archives_in(dir.path()).is_empty());

        // push past the cap: the live file is archived and restarted
        sink.write_all(b"a line well past the 32 byte cap\n").unwrap();
        sink.flush().unwrap();
        assert_eq!(archives_in(dir.path()).len(), 1);
        assert_eq!(fs::metadata(dir.path().join("agent.log")).unwrap().len(), 0);
    }

    #[test]
    fn prune_keeps_only_the_newest() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = LogSink::open(dir.path(), "agent", 8, 2).unwrap();

        for _ in 0..5 {
            sink.write_all(b"0123456789abcdef\n").unwrap();
        }
        let archives = archives_in(dir.path());
        assert_eq!(archives.len(), 2, "{archives:?}");
    }

    #[test]
    fn same_second_rolls_get_distinct_names() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = LogSink::open(dir.path(), "agent", 4, 10).unwrap();

        sink.write_all(b"aaaaaa\n").unwrap();
        sink.write_all(b"bbbbbb\n").unwrap();
        sink.write_all(b"cccccc\n").unwrap();
        assert_eq!(archives_in(dir.path()).len(), 3);
    }

    #[test]
    fn stems_are_filtered() {
        assert_eq!(file_stem("outrider-agent"), "outrider-agent");
        assert_eq!(file_stem("outrider agent!"), "outrideragent");
        assert_eq!(file_stem("!!"), "outrider");
    }
}
