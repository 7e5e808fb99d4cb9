//! Shared logging setup for Forker binaries.
//!
//! Log lines go to stderr and to a size-capped file under the Forker home
//! directory. When the active file fills up it is archived under a
//! timestamped name (`forker-<epoch>.log`) and a fresh file starts; the
//! oldest archives are pruned so disk usage stays bounded.

use anyhow::{Context, Result};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

const DEFAULT_LOG_FILTER: &str = "forker=info,forker_engine=info,forker_store=info";

/// Archived files kept per stem, beyond the active one.
const MAX_ARCHIVED_LOGS: usize = 4;

/// Size at which the active file is archived.
const ROLL_AT_BYTES: u64 = 10 * 1024 * 1024;

/// Logging configuration shared by Forker binaries.
pub struct LogConfig<'a> {
    pub app_name: &'a str,
    pub verbose: bool,
}

/// Initialize tracing with the file sink and stderr output.
pub fn init_logging(config: LogConfig<'_>) -> Result<()> {
    let log_dir = ensure_logs_dir().context("Failed to ensure log directory")?;
    let sink = LogSink::open(log_dir, config.app_name)
        .context("Failed to open log file sink")?;

    let file_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let console_filter = if config.verbose {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"))
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER))
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(sink)
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

/// Get the Forker home directory: ~/.forker
pub fn forker_home() -> PathBuf {
    if let Ok(override_path) = std::env::var("FORKER_HOME") {
        return PathBuf::from(override_path);
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".forker")
}

/// Get the logs directory: ~/.forker/logs
pub fn logs_dir() -> PathBuf {
    forker_home().join("logs")
}

/// Ensure the logs directory exists.
pub fn ensure_logs_dir() -> Result<PathBuf> {
    let logs = logs_dir();
    fs::create_dir_all(&logs)
        .with_context(|| format!("Failed to create logs directory: {}", logs.display()))?;
    Ok(logs)
}

/// The active log file plus the bookkeeping to roll and prune it.
struct ActiveLog {
    dir: PathBuf,
    stem: String,
    file: File,
    written: u64,
}

impl ActiveLog {
    fn open(dir: PathBuf, stem: String) -> io::Result<Self> {
        fs::create_dir_all(&dir)?;
        let path = dir.join(format!("{stem}.log"));
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let written = file.metadata()?.len();
        Ok(Self {
            dir,
            stem,
            file,
            written,
        })
    }

    fn active_path(&self) -> PathBuf {
        self.dir.join(format!("{}.log", self.stem))
    }

    /// Archive the active file under a timestamped name and start fresh.
    fn roll(&mut self) -> io::Result<()> {
        self.file.flush()?;

        let stamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        let mut archived = self.dir.join(format!("{}-{stamp}.log", self.stem));
        let mut dedup = 1u32;
        while archived.exists() {
            archived = self.dir.join(format!("{}-{stamp}.{dedup}.log", self.stem));
            dedup += 1;
        }
        fs::rename(self.active_path(), &archived)?;
        self.prune_archives()?;

        let fresh = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.active_path())?;
        self.file = fresh;
        self.written = 0;
        Ok(())
    }

    /// Drop the oldest archives once more than `MAX_ARCHIVED_LOGS` exist.
    /// Epoch-second names sort chronologically as strings.
    fn prune_archives(&self) -> io::Result<()> {
        let prefix = format!("{}-", self.stem);
        let mut archives: Vec<PathBuf> = fs::read_dir(&self.dir)?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| {
                path.file_name()
                    .and_then(|n| n.to_str())
                    .map(|n| n.starts_with(&prefix) && n.ends_with(".log"))
                    .unwrap_or(false)
            })
            .collect();
        archives.sort();
        while archives.len() > MAX_ARCHIVED_LOGS {
            fs::remove_file(archives.remove(0))?;
        }
        Ok(())
    }

    fn write_line(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.written + buf.len() as u64 > ROLL_AT_BYTES {
            self.roll()?;
        }
        let bytes = self.file.write(buf)?;
        self.written += bytes as u64;
        Ok(bytes)
    }
}

/// Cloneable sink handed to `tracing_subscriber`; every clone shares the
/// same active file and locks it per write.
#[derive(Clone)]
struct LogSink {
    inner: Arc<Mutex<ActiveLog>>,
}

impl LogSink {
    fn open(dir: PathBuf, stem: &str) -> io::Result<Self> {
        Ok(Self {
            inner: Arc::new(Mutex::new(ActiveLog::open(dir, stem.to_string())?)),
        })
    }

    fn lock(&self) -> io::Result<std::sync::MutexGuard<'_, ActiveLog>> {
        self.inner
            .lock()
            .map_err(|_| io::Error::other("log sink lock poisoned"))
    }
}

impl Write for LogSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.lock()?.write_line(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.lock()?.file.flush()
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for LogSink {
    type Writer = LogSink;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}
