use std::io;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tracing::{debug, error, info, warn};

use crate::log_lines::{LineSplitter, LogRecord, ToolEvent, classify, strip_ansi};
use crate::progress::ProgressUpdate;
use crate::session::SyncSession;
use crate::{Error, Result};

/// Appended to every invocation; retries and timeouts stay inside the tool.
pub const RESILIENCE_FLAGS: [&str; 11] = [
    "--retries",
    "4",
    "--retries-sleep",
    "10s",
    "--low-level-retries",
    "10",
    "--contimeout",
    "10s",
    "--timeout",
    "10s",
    "--ignore-errors",
];

const READ_CHUNK: usize = 8 * 1024;

/// Suspend/continue capability for a running process.
pub trait ProcessSignals: Send + Sync {
    fn suspend(&self, pid: u32) -> io::Result<()>;
    fn resume(&self, pid: u32) -> io::Result<()>;
}

/// SIGSTOP / SIGCONT.
#[derive(Debug, Default, Clone, Copy)]
pub struct PosixSignals;

#[cfg(unix)]
fn send_signal(pid: u32, signal: libc::c_int) -> io::Result<()> {
    let pid = libc::pid_t::try_from(pid)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "pid out of range"))?;
    // SAFETY: kill(2) has no memory-safety preconditions.
    let rc = unsafe { libc::kill(pid, signal) };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

impl ProcessSignals for PosixSignals {
    #[cfg(unix)]
    fn suspend(&self, pid: u32) -> io::Result<()> {
        send_signal(pid, libc::SIGSTOP)
    }

    #[cfg(unix)]
    fn resume(&self, pid: u32) -> io::Result<()> {
        send_signal(pid, libc::SIGCONT)
    }

    #[cfg(not(unix))]
    fn suspend(&self, _pid: u32) -> io::Result<()> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "process suspend is not supported on this platform",
        ))
    }

    #[cfg(not(unix))]
    fn resume(&self, _pid: u32) -> io::Result<()> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "process resume is not supported on this platform",
        ))
    }
}

/// How the external tool is launched.
#[derive(Debug, Clone)]
pub struct ToolCommand {
    pub program: PathBuf,
    pub config_path: Option<PathBuf>,
    pub stats_interval: String,
}

impl ToolCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            config_path: None,
            stats_interval: "500ms".to_string(),
        }
    }

    /// Full argument vector: credentials file, phase args, resilience and output flags.
    pub fn build_args(&self, args: &[String]) -> Vec<String> {
        let mut out = Vec::with_capacity(args.len() + RESILIENCE_FLAGS.len() + 8);
        if let Some(path) = &self.config_path {
            out.push("--config".to_string());
            out.push(path.to_string_lossy().into_owned());
        }
        out.extend(args.iter().cloned());
        out.extend(RESILIENCE_FLAGS.iter().map(|s| s.to_string()));
        out.push("--stats".to_string());
        out.push(self.stats_interval.clone());
        out.push("--log-level".to_string());
        out.push("INFO".to_string());
        out.push("--use-json-log".to_string());
        out
    }
}

/// Runs the external tool one process at a time and exposes pause, resume and stop.
pub struct ProcessController {
    session: Arc<SyncSession>,
    tool: ToolCommand,
    signals: Arc<dyn ProcessSignals>,
    active_pid: Mutex<Option<u32>>,
}

struct ActivePid<'a>(&'a Mutex<Option<u32>>);

impl Drop for ActivePid<'_> {
    fn drop(&mut self) {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }
}

impl ProcessController {
    pub fn new(session: Arc<SyncSession>, tool: ToolCommand) -> Self {
        Self::with_signals(session, tool, Arc::new(PosixSignals))
    }

    pub fn with_signals(
        session: Arc<SyncSession>,
        tool: ToolCommand,
        signals: Arc<dyn ProcessSignals>,
    ) -> Self {
        Self {
            session,
            tool,
            signals,
            active_pid: Mutex::new(None),
        }
    }

    pub fn session(&self) -> &Arc<SyncSession> {
        &self.session
    }

    pub fn active_pid(&self) -> Option<u32> {
        *self.active_pid.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Spawns the tool with `args` and streams progress through `on_update` until it exits.
    /// Exit code 0 is success; anything else is [`Error::ToolExit`].
    pub async fn run(
        &self,
        args: &[String],
        on_update: &(dyn Fn(ProgressUpdate) + Send + Sync),
    ) -> Result<()> {
        let cancel = self.session.cancel_token();
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let full_args = self.tool.build_args(args);
        let mut child = {
            let mut slot = self.active_pid.lock().unwrap_or_else(PoisonError::into_inner);
            if slot.is_some() {
                return Err(Error::ToolBusy);
            }
            let child = Command::new(&self.tool.program)
                .args(&full_args)
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true)
                .spawn()
                .map_err(|e| Error::ToolSpawn {
                    message: format!("{}: {e}", self.tool.program.display()),
                })?;
            *slot = child.id();
            child
        };
        let _active = ActivePid(&self.active_pid);

        let pid = child.id();
        let started = Instant::now();
        info!(
            event = "tool.spawn",
            program = %self.tool.program.display(),
            pid = pid.unwrap_or_default(),
            args = ?args,
            "tool.spawn"
        );

        if self.session.is_paused() {
            if let Some(pid) = pid {
                if let Err(e) = self.signals.suspend(pid) {
                    warn!(event = "tool.suspend_failed", pid, error = %e, "tool.suspend_failed");
                }
            }
            on_update(ProgressUpdate::paused(true));
        }

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let outcome = tokio::select! {
            _ = cancel.cancelled() => None,
            status = async {
                let (out, err) = tokio::join!(
                    self.drain(stdout, "stdout", on_update),
                    self.drain(stderr, "stderr", on_update),
                );
                for (stream, res) in [("stdout", out), ("stderr", err)] {
                    if let Err(e) = res {
                        warn!(event = "tool.read_failed", stream, error = %e, "tool.read_failed");
                    }
                }
                child.wait().await
            } => Some(status),
        };

        let status = match outcome {
            Some(status) => status?,
            None => {
                if let Err(e) = child.start_kill() {
                    debug!(event = "tool.kill_failed", error = %e, "tool.kill_failed");
                }
                let _ = child.wait().await;
                info!(
                    event = "tool.cancelled",
                    duration_ms = started.elapsed().as_millis() as u64,
                    "tool.cancelled"
                );
                return Err(Error::Cancelled);
            }
        };

        let duration_ms = started.elapsed().as_millis() as u64;
        if status.success() {
            info!(event = "tool.exit", code = 0, duration_ms, "tool.exit");
            return Ok(());
        }

        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        error!(
            event = "tool.exit",
            code = ?status.code(),
            duration_ms,
            "tool.exit"
        );
        Err(Error::ToolExit {
            code: status.code(),
        })
    }

    async fn drain<R>(
        &self,
        reader: Option<R>,
        stream: &'static str,
        on_update: &(dyn Fn(ProgressUpdate) + Send + Sync),
    ) -> io::Result<()>
    where
        R: AsyncRead + Unpin,
    {
        let Some(mut reader) = reader else {
            return Ok(());
        };
        let mut splitter = LineSplitter::new();
        let mut buf = vec![0u8; READ_CHUNK];
        loop {
            let n = reader.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            for line in splitter.push(&buf[..n]) {
                self.handle_line(&line, stream, on_update);
            }
        }
        if let Some(line) = splitter.finish() {
            self.handle_line(&line, stream, on_update);
        }
        Ok(())
    }

    fn handle_line(
        &self,
        line: &str,
        stream: &'static str,
        on_update: &(dyn Fn(ProgressUpdate) + Send + Sync),
    ) {
        let clean = strip_ansi(line);
        let Some(record) = classify(&clean) else {
            return;
        };
        log_record(&record, stream);
        if let Some(update) = self.session.handle_record(&record) {
            on_update(update);
        }
    }

    /// Suspends the running tool and reports `isPaused: true`. No-op when already paused.
    pub fn pause(&self) {
        if !self.session.set_paused(true) {
            return;
        }
        if let Some(pid) = self.active_pid() {
            if let Err(e) = self.signals.suspend(pid) {
                warn!(event = "tool.suspend_failed", pid, error = %e, "tool.suspend_failed");
            }
        }
        info!(event = "sync.pause", "sync.pause");
        self.session.emit(ProgressUpdate::paused(true));
    }

    /// Continues a suspended tool and reports `isPaused: false`. No-op when not paused.
    pub fn resume(&self) {
        if !self.session.set_paused(false) {
            return;
        }
        if let Some(pid) = self.active_pid() {
            if let Err(e) = self.signals.resume(pid) {
                warn!(event = "tool.resume_failed", pid, error = %e, "tool.resume_failed");
            }
        }
        info!(event = "sync.resume", "sync.resume");
        self.session.emit(ProgressUpdate::paused(false));
    }

    /// Cancels the run and kills the tool. Leaves the paused flag untouched.
    pub fn stop(&self) {
        self.session.cancel();
        self.session.detach_sink();
        info!(
            event = "sync.stop",
            pid = self.active_pid().unwrap_or_default(),
            "sync.stop"
        );
    }
}

fn log_record(record: &LogRecord, stream: &'static str) {
    match record {
        LogRecord::Structured(ToolEvent::Message { level, msg }) => match level.as_deref() {
            Some("error") | Some("critical") | Some("alert") | Some("emergency") => {
                error!(event = "tool.log", stream, level = ?level, msg = %msg, "tool.log")
            }
            Some("warning") => warn!(event = "tool.log", stream, msg = %msg, "tool.log"),
            Some("info") | Some("notice") => {
                info!(event = "tool.log", stream, msg = %msg, "tool.log")
            }
            _ => debug!(event = "tool.log", stream, msg = %msg, "tool.log"),
        },
        LogRecord::Structured(ToolEvent::Completed { object }) => {
            debug!(event = "tool.copied", stream, object = %object, "tool.copied")
        }
        LogRecord::Unrecognized(line) => {
            debug!(event = "tool.unparsed", stream, line = %line, "tool.unparsed")
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn args_wrap_phase_args_with_config_and_output_flags() {
        let mut tool = ToolCommand::new("rclone");
        tool.config_path = Some(PathBuf::from("/tmp/rclone.conf"));
        let args = tool.build_args(&["copy".to_string(), "a:".to_string(), "/b".to_string()]);

        assert_eq!(&args[..5], ["--config", "/tmp/rclone.conf", "copy", "a:", "/b"]);
        assert_eq!(&args[5..16], RESILIENCE_FLAGS);
        assert_eq!(
            &args[16..],
            ["--stats", "500ms", "--log-level", "INFO", "--use-json-log"]
        );
    }

    #[test]
    fn args_without_config_path_start_with_phase_args() {
        let tool = ToolCommand::new("rclone");
        let args = tool.build_args(&["lsf".to_string()]);
        assert_eq!(args[0], "lsf");
        assert!(!args.contains(&"--config".to_string()));
    }
}
