use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use tracing::{debug, error, info, warn};

use crate::config::{
    ConfigStore, LastShieldStats, LastSyncStats, Provider, SyncConfig, SyncOutcome,
    is_safe_directory,
};
use crate::manifest::{
    MANIFEST_FILE, ManifestDiff, MissingSplit, PRIORITIZED_LIST_FILE, RISK_DIR,
    RISK_EXCLUDE_ENTRY, STANDARD_LIST_FILE, STATE_DIR, UPSYNC_MANIFEST_FILE, UpsyncManifest,
    diff_manifest, list_local_files, parse_manifest, read_exclude_list, split_missing,
};
use crate::process::{ProcessController, ToolCommand};
use crate::progress::{
    CleanupStats, ManifestSource, ManifestStats, OptimizationMode, Phase, ProgressAggregator,
    ProgressSink, ProgressUpdate, SyncProgress,
};
use crate::session::{QueueKind, SyncSession};
use crate::shield::{CleanupSweep, PRIORITY_FILENAMES, PatternSweep, SKIPPED_NO_TOOLS};
use crate::transfers::now_unix_ms;
use crate::{Error, Result};

/// Which phases a configuration enables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhasePlan {
    pub pull: bool,
    pub clean: bool,
    pub cloud: bool,
}

impl PhasePlan {
    pub fn from_config(config: &SyncConfig) -> Self {
        Self {
            pull: config.source_provider.is_configured(),
            clean: config.enable_malware_shield,
            cloud: config.upsync_enabled && config.backup_provider.is_configured(),
        }
    }
}

/// Tracks manifest reconciliation as files complete during the pull phase.
#[derive(Debug, Clone)]
struct ManifestTracker {
    stats: ManifestStats,
    initial_local: u64,
    total_missing: u64,
}

impl ManifestTracker {
    fn apply(&self, completed: u64, update: &mut ProgressUpdate) {
        let mut stats = self.stats.clone();
        stats.local_file_count = self.initial_local + completed;
        stats.missing_file_count = self.total_missing.saturating_sub(completed);
        update.manifest_stats = Some(stats);
        update.total_files = Some(self.total_missing);
        if self.total_missing > 0 {
            update.percentage = Some(ratio_percent(completed, self.total_missing));
        }
    }
}

/// Neutralizes risky downloads as soon as the tool reports them complete.
struct RealtimeClean<'a> {
    sweep: &'a dyn CleanupSweep,
    config: &'a SyncConfig,
    exclude_file: &'a Path,
    stats: Mutex<CleanupStats>,
}

impl RealtimeClean<'_> {
    /// Checks `files` and returns the updated stats when any of them was neutralized.
    /// Failures are logged; the clean phase sweeps the tree again.
    fn check(&self, files: &[String]) -> Option<CleanupStats> {
        if files.is_empty() {
            return None;
        }
        let mut stats = self.stats.lock().unwrap_or_else(PoisonError::into_inner);
        let mut neutralized = false;
        for rel in files {
            match self.sweep.clean_file(
                &self.config.local_dir,
                self.exclude_file,
                rel,
                self.config.malware_policy,
                &mut stats,
            ) {
                Ok(hit) => neutralized |= hit,
                Err(e) => warn!(
                    event = "shield.realtime_failed",
                    path = %rel,
                    error = %e,
                    "shield.realtime_failed"
                ),
            }
        }
        neutralized.then(|| stats.clone())
    }

    fn into_stats(self) -> CleanupStats {
        self.stats.into_inner().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Debug, Default)]
struct RunContext {
    manifest_files: Option<Vec<String>>,
    cleanup: Option<CleanupStats>,
    extracted: Vec<String>,
    upsync_manifest: Option<PathBuf>,
}

impl RunContext {
    fn record_cleanup(&mut self, stats: CleanupStats) {
        self.extracted.extend(stats.extracted_paths.iter().cloned());
        self.cleanup = Some(stats);
    }
}

/// Sequences pull, clean and cloud for one configuration and reports through a sink.
pub struct SyncEngine {
    session: Arc<SyncSession>,
    process: Arc<ProcessController>,
    sweep: Arc<dyn CleanupSweep>,
    store: Arc<dyn ConfigStore>,
}

impl SyncEngine {
    pub fn new(
        process: Arc<ProcessController>,
        sweep: Arc<dyn CleanupSweep>,
        store: Arc<dyn ConfigStore>,
    ) -> Self {
        Self {
            session: process.session().clone(),
            process,
            sweep,
            store,
        }
    }

    /// Engine with the tool, credentials and risky names taken from `config`.
    pub fn from_config(config: &SyncConfig, store: Arc<dyn ConfigStore>) -> Self {
        let tool = ToolCommand {
            program: PathBuf::from(&config.tool.binary),
            config_path: config.tool.config_path.clone(),
            stats_interval: config.tool.stats_interval.clone(),
        };
        let session = Arc::new(SyncSession::new());
        let process = Arc::new(ProcessController::new(session, tool));
        let sweep = Arc::new(PatternSweep::from_config(config));
        Self::new(process, sweep, store)
    }

    pub fn session(&self) -> &Arc<SyncSession> {
        &self.session
    }

    pub fn controller(&self) -> &Arc<ProcessController> {
        &self.process
    }

    pub fn pause(&self) {
        self.process.pause();
    }

    pub fn resume(&self) {
        self.process.resume();
    }

    pub fn stop(&self) {
        self.process.stop();
    }

    /// Runs every enabled phase and returns the last emitted record.
    pub async fn run_sync(&self, config: &SyncConfig, sink: Arc<dyn ProgressSink>) -> SyncProgress {
        let plan = PhasePlan::from_config(config);
        let weights = config.weights.for_enabled(plan.pull, plan.clean, plan.cloud);
        self.session.begin_run(
            ProgressAggregator::new(weights),
            sink,
            config.recent_completed,
        );

        if !config.is_initialized() {
            warn!(event = "sync.uninitialized", "sync.uninitialized");
            return self.emit(
                ProgressUpdate::phase(Phase::Error, "Portal not initialized.").with_percentage(0),
            );
        }

        let started = Instant::now();
        info!(
            event = "sync.start",
            local_dir = %config.local_dir.display(),
            pull = plan.pull,
            clean = plan.clean,
            cloud = plan.cloud,
            "sync.start"
        );

        let mut ctx = RunContext::default();
        match self.run_phases(config, plan, &mut ctx).await {
            Ok(()) => {
                let done = self.emit(
                    ProgressUpdate::phase(Phase::Done, "Sync complete.").with_percentage(100),
                );
                info!(
                    event = "sync.finish",
                    status = "done",
                    duration_ms = started.elapsed().as_millis() as u64,
                    files = self.session.files_processed(),
                    "sync.finish"
                );
                self.persist_stats(config, &done, ctx.cleanup.as_ref(), SyncOutcome::Success);
                done
            }
            Err(Error::Cancelled) => {
                info!(
                    event = "sync.finish",
                    status = "cancelled",
                    duration_ms = started.elapsed().as_millis() as u64,
                    "sync.finish"
                );
                self.session.last_progress().unwrap_or_default()
            }
            Err(e) => {
                error!(
                    event = "sync.finish",
                    status = "error",
                    duration_ms = started.elapsed().as_millis() as u64,
                    error = %e,
                    "sync.finish"
                );
                let failed = self.emit(ProgressUpdate::phase(
                    Phase::Error,
                    format!("Sync Failed: {e}"),
                ));
                self.persist_stats(config, &failed, ctx.cleanup.as_ref(), SyncOutcome::Error);
                failed
            }
        }
    }

    async fn run_phases(
        &self,
        config: &SyncConfig,
        plan: PhasePlan,
        ctx: &mut RunContext,
    ) -> Result<()> {
        if !is_safe_directory(&config.local_dir) {
            return Err(Error::InvalidConfig {
                message: format!(
                    "local_dir is a protected system location: {}",
                    config.local_dir.display()
                ),
            });
        }
        std::fs::create_dir_all(config.state_dir())?;
        ensure_exclude_file(&config.exclude_file_path())?;

        if plan.pull {
            self.checkpoint()?;
            self.run_pull(config, ctx).await?;
        }
        if plan.clean {
            self.checkpoint()?;
            self.run_clean(config, ctx).await?;
        }
        if let Some(files) = ctx.manifest_files.as_deref() {
            ctx.upsync_manifest = Some(write_upsync_manifest(config, files, &ctx.extracted)?);
        }
        if plan.cloud {
            self.checkpoint()?;
            self.run_cloud(config, ctx).await?;
        }
        Ok(())
    }

    fn checkpoint(&self) -> Result<()> {
        if self.session.is_cancelled() {
            return Err(Error::Cancelled);
        }
        Ok(())
    }

    fn emit(&self, update: ProgressUpdate) -> SyncProgress {
        self.session.emit(update).unwrap_or_default()
    }

    async fn run_pull(&self, config: &SyncConfig, ctx: &mut RunContext) -> Result<()> {
        debug!(event = "phase.start", phase = "pull", "phase.start");
        let started = Instant::now();
        self.emit(ProgressUpdate::phase(Phase::Pull, "Analyzing source...").with_percentage(0));
        self.session
            .set_queue(QueueKind::Download, config.downsync_transfers);

        let local_dir = path_arg(&config.local_dir)?;
        let source = format!("{}:/", config.tool.source_remote);
        let state_dir = config.state_dir();
        let exclude_path = config.exclude_file_path();

        let discovered = self.discover_manifest(config, &state_dir).await?;
        let local_files = list_local_files(&config.local_dir)?;

        let mut split = MissingSplit::default();
        let tracker = match discovered {
            Some((remote_files, source_kind)) => {
                let ManifestDiff {
                    remote_files,
                    local_count,
                    missing,
                } = diff_manifest(remote_files, &local_files);
                let exclude = read_exclude_list(&exclude_path)?;
                split = split_missing(
                    &missing,
                    &exclude,
                    PRIORITY_FILENAMES
                        .iter()
                        .copied()
                        .chain(config.risky_names.iter().map(String::as_str)),
                );
                info!(
                    event = "manifest.diff",
                    source = ?source_kind,
                    remote = remote_files.len() as u64,
                    local = local_count,
                    missing = split.missing_total,
                    risky = split.risky.len() as u64,
                    "manifest.diff"
                );
                let stats = ManifestStats {
                    remote_file_count: remote_files.len() as u64,
                    local_file_count: local_count,
                    missing_file_count: split.missing_total,
                    risky_file_count: Some(split.risky.len() as u64),
                    optimization_mode: OptimizationMode::Manifest,
                    manifest_source: source_kind,
                };
                ctx.manifest_files = Some(remote_files);
                Some(ManifestTracker {
                    stats,
                    initial_local: local_count,
                    total_missing: split.missing_total,
                })
            }
            None => {
                info!(event = "manifest.unavailable", "manifest.unavailable");
                self.emit(ProgressUpdate {
                    manifest_stats: Some(ManifestStats {
                        remote_file_count: 0,
                        local_file_count: local_files.len() as u64,
                        missing_file_count: 0,
                        risky_file_count: None,
                        optimization_mode: OptimizationMode::Full,
                        manifest_source: ManifestSource::None,
                    }),
                    ..ProgressUpdate::default()
                });
                None
            }
        };

        // Manifest fetches must not count as transfers.
        self.session.clear_transfers();
        self.session.reset_completions();

        if let Some(tracker) = &tracker {
            let mut update = ProgressUpdate::default();
            tracker.apply(0, &mut update);
            self.emit(update);
        }

        let flags = pull_flags(config);

        if !split.risky.is_empty() {
            let list = state_dir.join(PRIORITIZED_LIST_FILE);
            std::fs::write(&list, split.risky.join("\n") + "\n")?;
            let mut args = vec![
                "copy".to_string(),
                source.clone(),
                local_dir.to_string(),
                "--files-from".to_string(),
                path_arg(&list)?.to_string(),
            ];
            args.extend(flags.iter().cloned());

            info!(event = "pull.prioritized", files = split.risky.len() as u64, "pull.prioritized");
            let report =
                self.pull_reporter("Pulling prioritized archives...", tracker.as_ref(), None);
            self.process.run(&args, &report).await?;

            if config.enable_malware_shield {
                let on_sweep = |stats: &CleanupStats| {
                    let description = if stats.tools_missing {
                        SKIPPED_NO_TOOLS
                    } else {
                        "Neutralizing prioritized archives..."
                    };
                    self.emit(ProgressUpdate {
                        cleanup_stats: Some(stats.clone()),
                        ..ProgressUpdate::phase(Phase::Pull, description)
                    });
                };
                let stats = self
                    .sweep
                    .run_sweep(
                        &config.local_dir,
                        &exclude_path,
                        config.malware_policy,
                        &on_sweep,
                    )
                    .await?;
                ctx.record_cleanup(stats);
            }
        }

        let mut args = vec![
            if config.strict_mirror { "sync" } else { "copy" }.to_string(),
            source.clone(),
            local_dir.to_string(),
        ];
        let standard_run = match &tracker {
            Some(_) if split.standard.is_empty() => {
                debug!(event = "pull.standard_skipped", "pull.standard_skipped");
                false
            }
            Some(_) => {
                let list = state_dir.join(STANDARD_LIST_FILE);
                std::fs::write(&list, split.standard.join("\n") + "\n")?;
                args.push("--files-from".to_string());
                args.push(path_arg(&list)?.to_string());
                true
            }
            None => {
                args.push("--exclude-from".to_string());
                args.push(path_arg(&exclude_path)?.to_string());
                true
            }
        };
        if standard_run {
            args.extend(flags);
            let realtime = config.enable_malware_shield.then(|| RealtimeClean {
                sweep: &*self.sweep,
                config,
                exclude_file: &exclude_path,
                stats: Mutex::new(ctx.cleanup.clone().unwrap_or_else(|| CleanupStats {
                    policy_mode: config.malware_policy.as_str().to_string(),
                    ..CleanupStats::default()
                })),
            });
            {
                let report =
                    self.pull_reporter("Downloading files...", tracker.as_ref(), realtime.as_ref());
                self.process.run(&args, &report).await?;
            }
            if let Some(realtime) = realtime {
                ctx.cleanup = Some(realtime.into_stats());
            }
        }

        let mut done = ProgressUpdate::phase(Phase::Pull, "Pull complete.").with_percentage(100);
        done.files_transferred = Some(self.session.completed_count());
        if let Some(tracker) = &tracker {
            tracker.apply(self.session.completed_count(), &mut done);
            done.percentage = Some(100);
        }
        self.emit(done);

        debug!(
            event = "phase.finish",
            phase = "pull",
            duration_ms = started.elapsed().as_millis() as u64,
            files = self.session.completed_count(),
            "phase.finish"
        );
        Ok(())
    }

    fn pull_reporter<'a>(
        &'a self,
        description: &'a str,
        tracker: Option<&'a ManifestTracker>,
        realtime: Option<&'a RealtimeClean<'a>>,
    ) -> impl Fn(ProgressUpdate) + Send + Sync + 'a {
        move |mut update: ProgressUpdate| {
            if let Some(stats) = realtime.and_then(|r| r.check(&update.completed_files)) {
                update.cleanup_stats = Some(stats);
            }
            update.phase = Some(Phase::Pull);
            update.description = Some(description.to_string());
            if let Some(tracker) = tracker {
                tracker.apply(self.session.completed_count(), &mut update);
            }
            self.emit(update);
        }
    }

    /// Fetches the manifest from the source, then from the backup when uploads are on.
    /// Only cancellation propagates; any other failure means no manifest.
    async fn discover_manifest(
        &self,
        config: &SyncConfig,
        state_dir: &Path,
    ) -> Result<Option<(Vec<String>, ManifestSource)>> {
        let dest = state_dir.join(MANIFEST_FILE);
        let dest_arg = path_arg(&dest)?.to_string();

        let mut candidates = vec![(
            format!("{}:/{MANIFEST_FILE}", config.tool.source_remote),
            ManifestSource::Source,
            true,
        )];
        if config.upsync_enabled && config.backup_provider.is_configured() {
            candidates.push((
                backup_path(config, MANIFEST_FILE),
                ManifestSource::Backup,
                false,
            ));
        }

        for (remote, kind, from_source) in candidates {
            if let Err(e) = std::fs::remove_file(&dest)
                && e.kind() != std::io::ErrorKind::NotFound
            {
                return Err(e.into());
            }

            let mut args = vec!["copyto".to_string(), remote.clone(), dest_arg.clone()];
            if from_source {
                args.extend(cookie_flags(config));
            }
            match self.process.run(&args, &|_: ProgressUpdate| {}).await {
                Ok(()) => match std::fs::read_to_string(&dest) {
                    Ok(text) => {
                        info!(event = "manifest.fetched", remote = %remote, "manifest.fetched");
                        return Ok(Some((parse_manifest(&text), kind)));
                    }
                    Err(e) => {
                        debug!(
                            event = "manifest.read_failed",
                            remote = %remote,
                            error = %e,
                            "manifest.read_failed"
                        );
                    }
                },
                Err(Error::Cancelled) => return Err(Error::Cancelled),
                Err(e) => {
                    debug!(
                        event = "manifest.fetch_failed",
                        remote = %remote,
                        error = %e,
                        "manifest.fetch_failed"
                    );
                }
            }
        }
        Ok(None)
    }

    async fn run_clean(&self, config: &SyncConfig, ctx: &mut RunContext) -> Result<()> {
        debug!(event = "phase.start", phase = "clean", "phase.start");
        let started = Instant::now();
        self.emit(ProgressUpdate::phase(Phase::Clean, "Scanning archives...").with_percentage(0));

        let on_sweep = |stats: &CleanupStats| {
            let description = match &stats.current_archive {
                _ if stats.tools_missing => SKIPPED_NO_TOOLS.to_string(),
                Some(name) => format!("Scanning {name}..."),
                None => "Scanning archives...".to_string(),
            };
            self.emit(ProgressUpdate {
                cleanup_stats: Some(stats.clone()),
                ..ProgressUpdate::phase(Phase::Clean, description)
                    .with_percentage(ratio_percent(stats.scanned_archives, stats.total_archives))
            });
        };
        let stats = self
            .sweep
            .run_sweep(
                &config.local_dir,
                &config.exclude_file_path(),
                config.malware_policy,
                &on_sweep,
            )
            .await?;

        let description = if stats.tools_missing {
            SKIPPED_NO_TOOLS
        } else {
            "Scan complete."
        };
        self.emit(ProgressUpdate {
            cleanup_stats: Some(stats.clone()),
            ..ProgressUpdate::phase(Phase::Clean, description).with_percentage(100)
        });
        debug!(
            event = "phase.finish",
            phase = "clean",
            duration_ms = started.elapsed().as_millis() as u64,
            scanned = stats.scanned_archives,
            flagged = stats.flagged_archives,
            "phase.finish"
        );
        ctx.record_cleanup(stats);
        Ok(())
    }

    async fn run_cloud(&self, config: &SyncConfig, ctx: &RunContext) -> Result<()> {
        debug!(event = "phase.start", phase = "cloud", "phase.start");
        let started = Instant::now();
        self.session.set_queue(QueueKind::Upload, config.upsync_transfers);
        self.session.clear_transfers();
        self.emit(ProgressUpdate::phase(Phase::Cloud, "Uploading to backup...").with_percentage(0));

        let mut args = vec![
            "sync".to_string(),
            path_arg(&config.local_dir)?.to_string(),
            backup_path(config, ""),
        ];
        if let Some(list) = &ctx.upsync_manifest {
            args.push("--files-from".to_string());
            args.push(path_arg(list)?.to_string());
        }
        args.extend([
            "--size-only".to_string(),
            "--fast-list".to_string(),
            "--transfers".to_string(),
            config.upsync_transfers.to_string(),
            "--checkers".to_string(),
            config.checkers.to_string(),
        ]);
        args.extend(state_excludes());
        args.push("--exclude-from".to_string());
        args.push(path_arg(&config.exclude_file_path())?.to_string());
        if config.backup_provider == Provider::Gdrive {
            args.push("--drive-use-trash=false".to_string());
        }

        let report = |mut update: ProgressUpdate| {
            update.phase = Some(Phase::Cloud);
            update.description = Some("Uploading to backup...".to_string());
            self.emit(update);
        };
        self.process.run(&args, &report).await?;

        self.emit(ProgressUpdate::phase(Phase::Cloud, "Backup complete.").with_percentage(100));
        debug!(
            event = "phase.finish",
            phase = "cloud",
            duration_ms = started.elapsed().as_millis() as u64,
            files = self.session.completed_count(),
            "phase.finish"
        );
        Ok(())
    }

    fn persist_stats(
        &self,
        config: &SyncConfig,
        last: &SyncProgress,
        cleanup: Option<&CleanupStats>,
        status: SyncOutcome,
    ) {
        let now = now_unix_ms();
        let mut updated = config.clone();
        updated.last_sync_stats = Some(LastSyncStats {
            timestamp: now,
            files_processed: self.session.files_processed(),
            bytes_transferred: last.raw_bytes_transferred.unwrap_or(0),
            status,
        });
        if let Some(c) = cleanup {
            updated.last_shield_stats = Some(LastShieldStats {
                timestamp: now,
                total_archives: c.scanned_archives,
                risky_pattern_count: c.risky_pattern_count,
                extracted_files: c.extracted_files,
            });
        }
        if let Err(e) = self.store.save(&updated) {
            error!(event = "config.save_failed", error = %e, "config.save_failed");
        }
    }
}

fn ratio_percent(done: u64, total: u64) -> u8 {
    if total == 0 {
        return 0;
    }
    ((done as f64 / total as f64) * 100.0).round().min(100.0) as u8
}

fn path_arg(path: &Path) -> Result<&str> {
    path.to_str().ok_or_else(|| Error::NonUtf8Path {
        path: path.to_path_buf(),
    })
}

/// `<backup_remote>:<backup_dir>[/<file>]`.
fn backup_path(config: &SyncConfig, file: &str) -> String {
    let dir = config.backup_dir.trim_end_matches('/');
    match (dir.is_empty(), file.is_empty()) {
        (true, _) => format!("{}:{file}", config.tool.backup_remote),
        (false, true) => format!("{}:{dir}", config.tool.backup_remote),
        (false, false) => format!("{}:{dir}/{file}", config.tool.backup_remote),
    }
}

fn state_excludes() -> [String; 4] {
    [
        "--exclude".to_string(),
        format!("/{STATE_DIR}/**"),
        "--exclude".to_string(),
        format!("{RISK_DIR}/**"),
    ]
}

fn cookie_flags(config: &SyncConfig) -> Vec<String> {
    match config.cookie.as_deref().map(str::trim) {
        Some(cookie) if config.source_provider == Provider::Copyparty && !cookie.is_empty() => {
            vec!["--header".to_string(), format!("Cookie: {cookie}")]
        }
        _ => Vec::new(),
    }
}

fn pull_flags(config: &SyncConfig) -> Vec<String> {
    let mut flags = vec![
        "--size-only".to_string(),
        "--fast-list".to_string(),
        "--transfers".to_string(),
        config.downsync_transfers.to_string(),
        "--checkers".to_string(),
        config.checkers.to_string(),
    ];
    flags.extend(state_excludes());
    flags.extend(cookie_flags(config));
    flags
}

fn ensure_exclude_file(path: &Path) -> Result<()> {
    if path.exists() {
        return Ok(());
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, format!("{RISK_EXCLUDE_ENTRY}\n"))?;
    Ok(())
}

/// Lists the manifest entries and extracted files still present locally and writes them as
/// the upload list.
fn write_upsync_manifest(
    config: &SyncConfig,
    manifest_files: &[String],
    extracted: &[String],
) -> Result<PathBuf> {
    let local: std::collections::HashSet<String> =
        list_local_files(&config.local_dir)?.into_iter().collect();
    let approved: Vec<String> = manifest_files
        .iter()
        .chain(extracted)
        .filter(|f| local.contains(f.as_str()))
        .cloned()
        .collect();

    let manifest = UpsyncManifest::new(approved, config.malware_policy);
    let path = config.state_dir().join(UPSYNC_MANIFEST_FILE);
    std::fs::write(&path, manifest.render())?;
    info!(
        event = "manifest.upsync_written",
        files = manifest.files.len() as u64,
        path = %path.display(),
        "manifest.upsync_written"
    );
    Ok(path)
}
