use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use serde::Serialize;
use sync_portal_core::config::{
    ENV_CONFIG_DIR, ENV_DATA_DIR, config_path, to_toml, validate_config,
};
use sync_portal_core::format::format_bytes;
use sync_portal_core::run_log::{RunKind, start_run_log};
use sync_portal_core::shield::SKIPPED_NO_TOOLS;
use sync_portal_core::{
    APP_NAME, CleanupStats, CleanupSweep, FileConfigStore, MalwarePolicy, PatternSweep, Phase,
    ProgressSink, SyncConfig, SyncEngine, SyncProgress, load_config, save_config,
};

#[derive(Parser)]
#[command(name = "syncportal")]
#[command(about = "SyncPortal CLI: pull, clean and back up a mirrored portal", long_about = None)]
struct Cli {
    #[arg(long)]
    json: bool,

    #[arg(long)]
    config_dir: Option<PathBuf>,

    #[arg(long)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run every enabled phase once.
    Run,
    /// Sweep the local directory for risky archives without transferring anything.
    Sweep,
    Config {
        #[command(subcommand)]
        cmd: ConfigCmd,
    },
}

#[derive(Subcommand)]
enum ConfigCmd {
    Get,
    Path,
    /// Point the portal at a local directory and save.
    Init {
        #[arg(long)]
        local_dir: PathBuf,
    },
}

#[derive(Debug, Serialize)]
struct CliError {
    code: &'static str,
    message: String,
    details: serde_json::Value,
    retryable: bool,
}

impl CliError {
    fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: serde_json::json!({}),
            retryable: false,
        }
    }

    fn retryable(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: serde_json::json!({}),
            retryable: true,
        }
    }
}

struct NdjsonProgressSink {
    run_id: String,
}

impl ProgressSink for NdjsonProgressSink {
    fn on_progress(&self, p: SyncProgress) {
        let line = serde_json::json!({
            "type": "sync.progress",
            "runId": self.run_id,
            "progress": p,
        });
        println!("{line}");
    }
}

struct HumanProgressSink;

impl ProgressSink for HumanProgressSink {
    fn on_progress(&self, p: SyncProgress) {
        let mut line = format!(
            "[{:>5}] {:>3}% (total {:>3}%) {}",
            p.phase.as_str(),
            p.percentage,
            p.global_percentage.unwrap_or(0),
            p.description
        );
        if let Some(speed) = &p.transfer_speed {
            line.push_str(&format!(" | {speed}"));
        }
        if let Some(eta) = &p.eta {
            line.push_str(&format!(" | ETA {eta}"));
        }
        if p.is_paused {
            line.push_str(" | paused");
        }
        println!("{line}");
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let code = match run(cli).await {
        Ok(()) => 0,
        Err(e) => {
            emit_error(&e);
            1
        }
    };
    std::process::exit(code);
}

async fn run(cli: Cli) -> Result<(), CliError> {
    let config_dir = cli
        .config_dir
        .or_else(|| std::env::var(ENV_CONFIG_DIR).ok().map(PathBuf::from))
        .unwrap_or_else(default_config_dir);
    let data_dir = cli
        .data_dir
        .or_else(|| std::env::var(ENV_DATA_DIR).ok().map(PathBuf::from))
        .unwrap_or_else(|| config_dir.clone());

    match cli.cmd {
        Command::Run => sync_run(&config_dir, &data_dir, cli.json).await,
        Command::Sweep => sweep_run(&config_dir, &data_dir, cli.json).await,
        Command::Config { cmd } => match cmd {
            ConfigCmd::Get => config_get(&config_dir, cli.json),
            ConfigCmd::Path => {
                let path = config_path(&config_dir);
                if cli.json {
                    println!("{}", serde_json::json!({ "path": path }));
                } else {
                    println!("{}", path.display());
                }
                Ok(())
            }
            ConfigCmd::Init { local_dir } => config_init(&config_dir, local_dir, cli.json),
        },
    }
}

fn load_validated(config_dir: &Path) -> Result<SyncConfig, CliError> {
    let mut config = load_config(config_dir).map_err(map_core_err)?;
    config.apply_env_overrides();
    validate_config(&config).map_err(map_core_err)?;
    Ok(config)
}

fn config_get(config_dir: &Path, json: bool) -> Result<(), CliError> {
    let config = load_validated(config_dir)?;
    if json {
        println!(
            "{}",
            serde_json::json!({
                "config": config,
                "initialized": config.is_initialized(),
            })
        );
    } else {
        let text = to_toml(&config).map_err(map_core_err)?;
        print!("{text}");
        if !text.ends_with('\n') {
            println!();
        }
    }
    Ok(())
}

fn config_init(config_dir: &Path, local_dir: PathBuf, json: bool) -> Result<(), CliError> {
    let mut config = load_config(config_dir).map_err(map_core_err)?;
    let local_dir = std::path::absolute(&local_dir)
        .map_err(|e| CliError::new("config.invalid", e.to_string()))?;
    config.local_dir = local_dir;
    validate_config(&config).map_err(map_core_err)?;
    save_config(config_dir, &config).map_err(map_core_err)?;

    if json {
        println!("{}", serde_json::json!({ "localDir": config.local_dir }));
    } else {
        println!("localDir={}", config.local_dir.display());
    }
    Ok(())
}

async fn sync_run(config_dir: &Path, data_dir: &Path, json: bool) -> Result<(), CliError> {
    let config = load_validated(config_dir)?;

    let run_id = format!("run_{}", uuid::Uuid::new_v4().simple());
    let _log = start_run_log(RunKind::Sync, &run_id, data_dir)
        .map_err(|e| CliError::new("log.init_failed", e.to_string()))?;
    tracing::info!(event = "cli.run", run_id = %run_id, "cli.run");

    let store = Arc::new(FileConfigStore::new(config_dir));
    let engine = Arc::new(SyncEngine::from_config(&config, store));
    let sink: Arc<dyn ProgressSink> = if json {
        Arc::new(NdjsonProgressSink {
            run_id: run_id.clone(),
        })
    } else {
        Arc::new(HumanProgressSink)
    };

    let signals = tokio::spawn(forward_signals(engine.clone()));
    let last = engine.run_sync(&config, sink).await;
    signals.abort();

    match last.phase {
        Phase::Done => {
            if !json {
                println!(
                    "files={} bytes={}",
                    engine.session().files_processed(),
                    format_bytes(last.raw_bytes_transferred.unwrap_or(0))
                );
            }
            Ok(())
        }
        Phase::Error => Err(CliError::retryable("sync.failed", last.description)),
        _ => Err(CliError::new("task.cancelled", "cancelled")),
    }
}

async fn sweep_run(config_dir: &Path, data_dir: &Path, json: bool) -> Result<(), CliError> {
    let config = load_validated(config_dir)?;
    if !config.is_initialized() {
        return Err(CliError::new("config.invalid", "Portal not initialized."));
    }

    let run_id = format!("run_{}", uuid::Uuid::new_v4().simple());
    let _log = start_run_log(RunKind::Sweep, &run_id, data_dir)
        .map_err(|e| CliError::new("log.init_failed", e.to_string()))?;

    let sweep = PatternSweep::from_config(&config);
    let report = |stats: &CleanupStats| {
        if json {
            return;
        }
        if stats.tools_missing {
            println!("{SKIPPED_NO_TOOLS}");
        } else if let Some(name) = &stats.current_archive {
            println!(
                "[{}/{}] {name}",
                stats.scanned_archives, stats.total_archives
            );
        }
    };
    let stats = sweep
        .run_sweep(
            &config.local_dir,
            &config.exclude_file_path(),
            config.malware_policy,
            &report,
        )
        .await
        .map_err(map_core_err)?;

    if json {
        println!("{}", serde_json::json!({ "cleanupStats": stats }));
    } else {
        let action = match config.malware_policy {
            MalwarePolicy::Purge => format!("purged={}", stats.purged_files),
            MalwarePolicy::Isolate => format!("isolated={}", stats.isolated_files),
        };
        println!(
            "archives={} flagged={} extracted={} {action}",
            stats.scanned_archives, stats.flagged_archives, stats.extracted_files
        );
    }
    Ok(())
}

/// Ctrl-C stops the run; SIGUSR1 pauses and SIGUSR2 resumes it.
#[cfg(unix)]
async fn forward_signals(engine: Arc<SyncEngine>) {
    use tokio::signal::unix::{SignalKind, signal};

    let (Ok(mut usr1), Ok(mut usr2)) = (
        signal(SignalKind::user_defined1()),
        signal(SignalKind::user_defined2()),
    ) else {
        tracing::warn!(event = "cli.signals_unavailable", "cli.signals_unavailable");
        return;
    };
    loop {
        tokio::select! {
            res = tokio::signal::ctrl_c() => {
                if res.is_ok() {
                    engine.stop();
                }
                return;
            }
            _ = usr1.recv() => engine.pause(),
            _ = usr2.recv() => engine.resume(),
        }
    }
}

#[cfg(not(unix))]
async fn forward_signals(engine: Arc<SyncEngine>) {
    if tokio::signal::ctrl_c().await.is_ok() {
        engine.stop();
    }
}

fn default_config_dir() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    PathBuf::from(home).join(".config").join(APP_NAME)
}

fn map_core_err(e: sync_portal_core::Error) -> CliError {
    use sync_portal_core::Error;
    match e {
        Error::InvalidConfig { message } => CliError::new("config.invalid", message),
        Error::ToolSpawn { message } => CliError::new("tool.spawn_failed", message),
        e @ Error::ToolExit { .. } => CliError::retryable("tool.failed", e.to_string()),
        Error::ToolBusy => CliError::retryable("tool.busy", "a transfer is already running"),
        Error::Cleanup { message } => CliError::new("sweep.failed", message),
        Error::Cancelled => CliError::new("task.cancelled", "cancelled"),
        other => CliError::new("unknown", other.to_string()),
    }
}

fn emit_error(e: &CliError) {
    let json = serde_json::to_string(e).unwrap_or_else(|_| "{\"code\":\"unknown\",\"message\":\"json encode failed\",\"details\":{},\"retryable\":false}".to_string());
    let _ = writeln!(std::io::stderr(), "{json}");
}
