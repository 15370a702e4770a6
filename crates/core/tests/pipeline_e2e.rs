#![cfg(unix)]

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use sync_portal_core::config::{LastSyncStats, SyncOutcome};
use sync_portal_core::progress::{ManifestSource, OptimizationMode};
use sync_portal_core::shield::SweepFuture;
use sync_portal_core::{
    CleanupStats, CleanupSweep, ConfigStore, Error, MalwarePolicy, Phase, ProcessController,
    ProgressSink, Provider, SyncConfig, SyncEngine, SyncProgress, SyncSession, ToolCommand,
};
use tempfile::TempDir;

#[derive(Default)]
struct RecordingStore {
    saved: Mutex<Vec<SyncConfig>>,
}

impl ConfigStore for RecordingStore {
    fn save(&self, config: &SyncConfig) -> sync_portal_core::Result<()> {
        self.saved.lock().unwrap().push(config.clone());
        Ok(())
    }
}

fn recording_sink() -> (Arc<dyn ProgressSink>, Arc<Mutex<Vec<SyncProgress>>>) {
    let records = Arc::new(Mutex::new(Vec::new()));
    let out = records.clone();
    let sink = move |p: SyncProgress| out.lock().unwrap().push(p);
    (Arc::new(sink), records)
}

/// Sweep whose archive scan always fails.
struct FailingSweep;

impl CleanupSweep for FailingSweep {
    fn run_sweep<'a>(
        &'a self,
        _local_dir: &'a Path,
        _exclude_file: &'a Path,
        _policy: MalwarePolicy,
        _on_update: &'a (dyn Fn(&CleanupStats) + Send + Sync),
    ) -> SweepFuture<'a> {
        Box::pin(async {
            Err(Error::Cleanup {
                message: "disk full".to_string(),
            })
        })
    }

    fn clean_file(
        &self,
        _local_dir: &Path,
        _exclude_file: &Path,
        _rel_path: &str,
        _policy: MalwarePolicy,
        _stats: &mut CleanupStats,
    ) -> sync_portal_core::Result<bool> {
        Ok(false)
    }
}

fn write_script(path: &Path, script: &str) {
    std::fs::write(path, script).unwrap();
    let mut perms = std::fs::metadata(path).unwrap().permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(path, perms).unwrap();
}

/// Writes an executable `/bin/sh` stand-in for the transfer tool that appends its
/// arguments to `args.log`.
fn write_tool(dir: &Path, body: &str) -> PathBuf {
    let path = dir.join("fake-rclone");
    let log = dir.join("args.log");
    write_script(
        &path,
        &format!("#!/bin/sh\necho \"$*\" >> \"{}\"\n{body}\n", log.display()),
    );
    path
}

/// 7-Zip stand-in whose listing of an archive is the archive's own text.
fn write_archiver(dir: &Path) -> PathBuf {
    let path = dir.join("7z");
    write_script(
        &path,
        "#!/bin/sh\ncase \"$1\" in\n  l) cat \"$2\";;\nesac\nexit 0\n",
    );
    path
}

fn invocations(dir: &Path) -> Vec<String> {
    std::fs::read_to_string(dir.join("args.log"))
        .unwrap_or_default()
        .lines()
        .map(str::to_string)
        .collect()
}

fn base_config(temp: &TempDir, tool: &Path) -> SyncConfig {
    let mut cfg = SyncConfig {
        source_provider: Provider::Copyparty,
        local_dir: temp.path().join("portal"),
        ..SyncConfig::default()
    };
    cfg.tool.binary = tool.to_string_lossy().into_owned();
    cfg
}

#[tokio::test]
async fn pull_only_without_manifest_falls_back_to_full_listing() {
    let temp = TempDir::new().unwrap();
    let tool = write_tool(
        temp.path(),
        r#"
if [ "$1" = "copyto" ]; then
  echo '{"level":"error","msg":"object not found"}' >&2
  exit 1
fi
echo '{"level":"info","msg":"Copied (new)","object":"a.zip"}'
echo '{"level":"info","stats":{"bytes":10,"totalBytes":10,"speed":5,"transferring":[]}}'
exit 0
"#,
    );
    let cfg = base_config(&temp, &tool);
    let store = Arc::new(RecordingStore::default());
    let engine = SyncEngine::from_config(&cfg, store.clone());
    let (sink, records) = recording_sink();

    let last = engine.run_sync(&cfg, sink).await;

    assert_eq!(last.phase, Phase::Done);
    assert_eq!(last.percentage, 100);
    assert_eq!(last.global_percentage, Some(100));

    let records = records.lock().unwrap();
    assert!(records.iter().all(|p| p.phase != Phase::Error));
    assert!(records.iter().all(|p| p.phase != Phase::Clean && p.phase != Phase::Cloud));
    let full = records
        .iter()
        .find_map(|p| p.manifest_stats.clone())
        .unwrap();
    assert_eq!(full.optimization_mode, OptimizationMode::Full);
    assert_eq!(full.manifest_source, ManifestSource::None);

    let calls = invocations(temp.path());
    assert_eq!(calls.len(), 2, "{calls:?}");
    assert!(calls[0].starts_with("copyto portal_source:/manifest.txt"));
    assert!(!calls[0].contains("--header"));
    assert!(calls[1].starts_with("copy portal_source:/ "));
    assert!(calls[1].contains("--exclude-from"));
    assert!(calls[1].contains("--exclude /.portal/**"));
    assert!(calls[1].ends_with("--stats 500ms --log-level INFO --use-json-log"));

    let saved = store.saved.lock().unwrap();
    assert_eq!(saved.len(), 1);
    let LastSyncStats {
        files_processed,
        bytes_transferred,
        status,
        ..
    } = saved[0].last_sync_stats.clone().unwrap();
    assert_eq!(files_processed, 1);
    assert_eq!(bytes_transferred, 10);
    assert_eq!(status, SyncOutcome::Success);
    assert!(saved[0].last_shield_stats.is_none());
}

#[tokio::test]
async fn tool_failure_emits_single_error_and_skips_later_phases() {
    let temp = TempDir::new().unwrap();
    let tool = write_tool(
        temp.path(),
        r#"
echo '{"level":"error","msg":"failed to copy: permission denied"}' >&2
exit 1
"#,
    );
    let mut cfg = base_config(&temp, &tool);
    cfg.upsync_enabled = true;
    cfg.backup_provider = Provider::B2;
    let store = Arc::new(RecordingStore::default());
    let engine = SyncEngine::from_config(&cfg, store.clone());
    let (sink, records) = recording_sink();

    let last = engine.run_sync(&cfg, sink).await;

    assert_eq!(last.phase, Phase::Error);
    assert!(last.description.contains("Sync Failed"));
    assert!(last.description.contains("exit code 1"));
    assert_eq!(last.percentage, 0);

    let records = records.lock().unwrap();
    let errors: Vec<&SyncProgress> = records.iter().filter(|p| p.phase == Phase::Error).collect();
    assert_eq!(errors.len(), 1);
    assert!(records.iter().all(|p| p.phase != Phase::Cloud));
    assert_eq!(records.last().unwrap().phase, Phase::Error);

    // Source manifest, backup manifest, then the failing pull.
    let calls = invocations(temp.path());
    assert_eq!(calls.len(), 3, "{calls:?}");
    assert!(calls[1].starts_with("copyto portal_backup:manifest.txt"));
    assert!(!calls.iter().any(|c| c.starts_with("sync ")));

    let saved = store.saved.lock().unwrap();
    assert_eq!(
        saved[0].last_sync_stats.as_ref().unwrap().status,
        SyncOutcome::Error
    );
}

#[tokio::test]
async fn manifest_run_prioritizes_risky_archives_and_uploads_approved_files() {
    let temp = TempDir::new().unwrap();
    let tool = write_tool(
        temp.path(),
        r#"
cmd="$1"; src="$2"; dst="$3"
list=""; prev=""
for a in "$@"; do
  if [ "$prev" = "--files-from" ]; then list="$a"; fi
  prev="$a"
done
case "$cmd" in
  copyto)
    case "$src" in
      portal_source:*)
        printf '# listing\na.pdf\nsub/b.pdf\nGV-RX590GAMING-8GD-1.0 Boardview.zip\n' > "$dst"
        exit 0;;
      *) exit 1;;
    esac;;
  copy|sync)
    if [ -n "$list" ]; then
      while IFS= read -r f; do
        case "$f" in ''|'#'*) continue;; esac
        case "$dst" in
          portal_backup:*) ;;
          *) mkdir -p "$dst/$(dirname "$f")"; echo data > "$dst/$f";;
        esac
        printf '{"level":"info","msg":"Copied (new)","object":"%s"}\n' "$f"
      done < "$list"
    fi
    exit 0;;
esac
exit 0
"#,
    );
    let mut cfg = base_config(&temp, &tool);
    cfg.enable_malware_shield = true;
    cfg.malware_policy = MalwarePolicy::Purge;
    cfg.upsync_enabled = true;
    cfg.backup_provider = Provider::Gdrive;
    cfg.tool.archiver = Some(write_archiver(temp.path()));
    std::fs::create_dir_all(&cfg.local_dir).unwrap();
    std::fs::write(cfg.local_dir.join("a.pdf"), b"local").unwrap();

    let store = Arc::new(RecordingStore::default());
    let engine = SyncEngine::from_config(&cfg, store.clone());
    let (sink, records) = recording_sink();

    let last = engine.run_sync(&cfg, sink).await;
    assert_eq!(last.phase, Phase::Done, "{}", last.description);
    assert_eq!(last.global_percentage, Some(100));

    let records = records.lock().unwrap();
    let mut phases: Vec<Phase> = Vec::new();
    for p in records.iter() {
        if phases.last() != Some(&p.phase) {
            phases.push(p.phase);
        }
    }
    assert_eq!(phases, vec![Phase::Pull, Phase::Clean, Phase::Cloud, Phase::Done]);
    assert!(records.iter().all(|p| !p.description.contains("Skipped")));

    let globals: Vec<u8> = records.iter().filter_map(|p| p.global_percentage).collect();
    assert!(globals.windows(2).all(|w| w[0] <= w[1]), "{globals:?}");

    let end_of_pull = records
        .iter()
        .rev()
        .find(|p| p.phase == Phase::Pull)
        .unwrap();
    let stats = end_of_pull.manifest_stats.clone().unwrap();
    assert_eq!(stats.manifest_source, ManifestSource::Source);
    assert_eq!(stats.remote_file_count, 3);
    assert_eq!(stats.risky_file_count, Some(1));
    assert_eq!(stats.missing_file_count, 0);
    assert_eq!(end_of_pull.files_transferred, 2);

    let local = &cfg.local_dir;
    assert!(local.join("sub/b.pdf").exists());
    assert!(!local.join("GV-RX590GAMING-8GD-1.0 Boardview.zip").exists());

    let exclude = std::fs::read_to_string(local.join(".portal/exclude.txt")).unwrap();
    assert!(exclude.contains("GV-RX590GAMING-8GD-1.0 Boardview.zip"));

    let upsync = std::fs::read_to_string(local.join(".portal/upsync-manifest.txt")).unwrap();
    let listed: Vec<&str> = upsync.lines().filter(|l| !l.starts_with('#')).collect();
    assert_eq!(listed, vec!["a.pdf", "sub/b.pdf"]);

    let calls = invocations(temp.path());
    assert!(calls[1].contains("--files-from") && calls[1].contains("prioritized_risky.txt"));
    let cloud = calls.iter().find(|c| c.starts_with("sync ")).unwrap();
    assert!(cloud.contains("portal_backup:"));
    assert!(cloud.contains("upsync-manifest.txt"));
    assert!(cloud.contains("--drive-use-trash=false"));

    let saved = store.saved.lock().unwrap();
    let saved = &saved[0];
    assert_eq!(saved.last_sync_stats.as_ref().unwrap().files_processed, 4);
    assert!(saved.last_shield_stats.is_some());
}

#[tokio::test]
async fn uninitialized_portal_reports_error_without_running_tool() {
    let temp = TempDir::new().unwrap();
    let tool = write_tool(temp.path(), "exit 0");
    let mut cfg = base_config(&temp, &tool);
    cfg.local_dir = PathBuf::new();
    let store = Arc::new(RecordingStore::default());
    let engine = SyncEngine::from_config(&cfg, store.clone());
    let (sink, records) = recording_sink();

    let last = engine.run_sync(&cfg, sink).await;

    assert_eq!(last.phase, Phase::Error);
    assert_eq!(last.description, "Portal not initialized.");
    assert_eq!(records.lock().unwrap().len(), 1);
    assert!(invocations(temp.path()).is_empty());
    assert!(store.saved.lock().unwrap().is_empty());
}

#[tokio::test]
async fn cloud_failure_after_pull_emits_single_error() {
    let temp = TempDir::new().unwrap();
    let tool = write_tool(
        temp.path(),
        r#"
case "$1" in
  copyto) exit 1;;
  copy)
    echo '{"level":"info","msg":"Copied (new)","object":"a.pdf"}'
    exit 0;;
  sync)
    echo '{"level":"error","msg":"quota exceeded"}' >&2
    exit 1;;
esac
exit 0
"#,
    );
    let mut cfg = base_config(&temp, &tool);
    cfg.upsync_enabled = true;
    cfg.backup_provider = Provider::B2;
    let store = Arc::new(RecordingStore::default());
    let engine = SyncEngine::from_config(&cfg, store.clone());
    let (sink, records) = recording_sink();

    let last = engine.run_sync(&cfg, sink).await;

    assert_eq!(last.phase, Phase::Error);
    assert!(last.description.starts_with("Sync Failed"));
    assert!(last.description.contains("exit code 1"));

    let records = records.lock().unwrap();
    let errors = records.iter().filter(|p| p.phase == Phase::Error).count();
    assert_eq!(errors, 1);
    assert!(records.iter().any(|p| p.phase == Phase::Cloud));
    assert!(records.iter().all(|p| p.phase != Phase::Done));
    assert_eq!(records.last().unwrap().phase, Phase::Error);

    let calls = invocations(temp.path());
    assert_eq!(calls.len(), 4, "{calls:?}");
    assert!(calls[3].starts_with("sync "));

    let saved = store.saved.lock().unwrap();
    assert_eq!(saved.len(), 1);
    let stats = saved[0].last_sync_stats.as_ref().unwrap();
    assert_eq!(stats.status, SyncOutcome::Error);
    assert_eq!(stats.files_processed, 1);
}

#[tokio::test]
async fn failing_sweep_stops_the_run_before_upload() {
    let temp = TempDir::new().unwrap();
    let tool = write_tool(
        temp.path(),
        r#"
if [ "$1" = "copyto" ]; then exit 1; fi
exit 0
"#,
    );
    let mut cfg = base_config(&temp, &tool);
    cfg.enable_malware_shield = true;
    cfg.upsync_enabled = true;
    cfg.backup_provider = Provider::B2;
    let store = Arc::new(RecordingStore::default());
    let process = Arc::new(ProcessController::new(
        Arc::new(SyncSession::new()),
        ToolCommand::new(&tool),
    ));
    let engine = SyncEngine::new(process, Arc::new(FailingSweep), store.clone());
    let (sink, records) = recording_sink();

    let last = engine.run_sync(&cfg, sink).await;

    assert_eq!(last.phase, Phase::Error);
    assert_eq!(last.description, "Sync Failed: cleanup sweep failed: disk full");

    let records = records.lock().unwrap();
    assert!(records.iter().any(|p| p.phase == Phase::Clean));
    assert!(records.iter().all(|p| p.phase != Phase::Cloud));
    assert_eq!(records.iter().filter(|p| p.phase == Phase::Error).count(), 1);
    assert!(!invocations(temp.path()).iter().any(|c| c.starts_with("sync ")));

    let saved = store.saved.lock().unwrap();
    assert_eq!(
        saved[0].last_sync_stats.as_ref().unwrap().status,
        SyncOutcome::Error
    );
}

#[tokio::test]
async fn shield_neutralizes_risky_downloads_as_they_complete() {
    let temp = TempDir::new().unwrap();
    let tool = write_tool(
        temp.path(),
        r#"
if [ "$1" = "copyto" ]; then exit 1; fi
dst="$3"
mkdir -p "$dst/tools" "$dst/docs"
echo bad > "$dst/tools/keygen.exe"
echo '{"level":"info","msg":"Copied (new)","object":"tools/keygen.exe"}'
echo ok > "$dst/docs/manual.pdf"
echo '{"level":"info","msg":"Copied (new)","object":"docs/manual.pdf"}'
exit 0
"#,
    );
    let mut cfg = base_config(&temp, &tool);
    cfg.enable_malware_shield = true;
    cfg.malware_policy = MalwarePolicy::Purge;
    cfg.tool.archiver = Some(write_archiver(temp.path()));
    let store = Arc::new(RecordingStore::default());
    let engine = SyncEngine::from_config(&cfg, store.clone());
    let (sink, records) = recording_sink();

    let last = engine.run_sync(&cfg, sink).await;
    assert_eq!(last.phase, Phase::Done, "{}", last.description);

    let local = &cfg.local_dir;
    assert!(!local.join("tools/keygen.exe").exists());
    assert!(local.join("docs/manual.pdf").exists());
    let exclude = std::fs::read_to_string(local.join(".portal/exclude.txt")).unwrap();
    assert!(exclude.lines().any(|l| l == "tools/keygen.exe"));

    let records = records.lock().unwrap();
    let purged_during_pull = records
        .iter()
        .filter(|p| p.phase == Phase::Pull)
        .filter_map(|p| p.cleanup_stats.as_ref())
        .any(|c| c.purged_files == 1);
    assert!(purged_during_pull);
    assert_eq!(engine.session().files_processed(), 2);
}
