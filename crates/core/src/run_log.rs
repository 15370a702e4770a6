//! Per-run NDJSON log file fed by the global `tracing` subscriber.

use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, OnceLock, PoisonError};

use chrono::Utc;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

pub const ENV_LOG: &str = "SYNC_PORTAL_LOG";
pub const ENV_LOG_DIR: &str = "SYNC_PORTAL_LOG_DIR";

static RUN_LOG: OnceLock<RunLogFile> = OnceLock::new();
static TRACING_INIT: OnceLock<()> = OnceLock::new();

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunKind {
    Sync,
    Sweep,
}

impl RunKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sync => "sync",
            Self::Sweep => "sweep",
        }
    }
}

#[derive(Debug, Default)]
struct RunLogFile {
    writer: Mutex<Option<BufWriter<File>>>,
}

impl RunLogFile {
    fn slot(&self) -> MutexGuard<'_, Option<BufWriter<File>>> {
        self.writer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn open(&self, path: &Path) -> io::Result<()> {
        let mut slot = self.slot();
        if slot.is_some() {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                "run log already active",
            ));
        }
        let file = OpenOptions::new().create_new(true).write(true).open(path)?;
        *slot = Some(BufWriter::new(file));
        Ok(())
    }

    fn close(&self) -> io::Result<()> {
        let Some(mut writer) = self.slot().take() else {
            return Ok(());
        };
        writer.flush()?;
        writer.get_ref().sync_all()
    }
}

/// Writes into the open run log, or discards when none is open.
struct RunLogWriter<'a> {
    slot: MutexGuard<'a, Option<BufWriter<File>>>,
}

impl Write for RunLogWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.slot.as_mut() {
            Some(w) => w.write(buf),
            None => Ok(buf.len()),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.slot.as_mut() {
            Some(w) => w.flush(),
            None => Ok(()),
        }
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for RunLogFile {
    type Writer = RunLogWriter<'a>;

    fn make_writer(&'a self) -> Self::Writer {
        RunLogWriter { slot: self.slot() }
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for &RunLogFile {
    type Writer = RunLogWriter<'a>;

    fn make_writer(&'a self) -> Self::Writer {
        (**self).make_writer()
    }
}

fn env_filter_from(portal_log: Option<&str>, rust_log: Option<&str>) -> EnvFilter {
    let default = || EnvFilter::new("debug");
    portal_log
        .or(rust_log)
        .map(|v| EnvFilter::try_new(v).unwrap_or_else(|_| default()))
        .unwrap_or_else(default)
}

/// Installs the global subscriber once. Later calls are no-ops.
pub fn init_run_logging() {
    TRACING_INIT.get_or_init(|| {
        let file = RUN_LOG.get_or_init(RunLogFile::default);
        let filter = env_filter_from(
            std::env::var(ENV_LOG).ok().as_deref(),
            std::env::var("RUST_LOG").ok().as_deref(),
        );

        let layer = tracing_subscriber::fmt::layer()
            .json()
            .with_timer(tracing_subscriber::fmt::time::UtcTime::rfc_3339())
            .with_writer(file);

        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(layer)
            .try_init();
    });
}

/// Flushes and fsyncs the run log on drop.
pub struct RunLogGuard {
    path: PathBuf,
}

impl RunLogGuard {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RunLogGuard {
    fn drop(&mut self) {
        if let Some(file) = RUN_LOG.get() {
            let _ = file.close();
        }
    }
}

/// Opens `<data_dir>/logs/sync-<kind>-<utc stamp>-<run_id>.ndjson`.
pub fn start_run_log(kind: RunKind, run_id: &str, data_dir: &Path) -> io::Result<RunLogGuard> {
    init_run_logging();

    let log_dir = match std::env::var(ENV_LOG_DIR) {
        Ok(dir) if !dir.trim().is_empty() => PathBuf::from(dir),
        _ => data_dir.join("logs"),
    };
    std::fs::create_dir_all(&log_dir)?;

    let path = log_dir.join(format!(
        "sync-{}-{}-{}.ndjson",
        kind.as_str(),
        Utc::now().format("%Y%m%dT%H%M%SZ"),
        sanitize_filename_component(run_id)
    ));
    RUN_LOG.get_or_init(RunLogFile::default).open(&path)?;

    Ok(RunLogGuard { path })
}

fn sanitize_filename_component(s: &str) -> String {
    s.chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '.' | '_' | '-' => c,
            _ => '_',
        })
        .collect()
}
