use std::ffi::OsString;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::process::{Output, Stdio};

use tokio::process::Command;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::config::{MalwarePolicy, SyncConfig};
use crate::manifest::{RISK_DIR, RISK_EXCLUDE_ENTRY, STATE_DIR};
use crate::progress::CleanupStats;
use crate::{Error, Result};

/// Archive names known to carry bundled malware; pulled first and swept immediately.
pub const PRIORITY_FILENAMES: &[&str] = &[
    "GV-R580AORUS-8GD-1.0-1.01 Boardview.zip",
    "GV-R580GAMING-8GD-1.0-1.01 Boardview.zip",
    "GV-RX580GAMING-4GD-1.0-1.01 Boardview.zip",
    "GV-RX580GAMING-8GD-1.0-1.01 Boardview.zip",
    "GV-R939XG1 GAMING-8GD-1.0-1.01 Boardview.zip",
    "GV-R938WF2-4GD-1.0 Boardview.zip",
    "IOT73 V3.0 TG-B75.zip",
    "GV-R938G1 GAMING-4GD-1.02 Boardview.zip",
    "GV-RX470G1 GAMING-4GD-0.2 Boardview.zip",
    "GV-RX480G1 GAMING-4GD-1.1 Boardview.zip",
    "BIOS_K54C usb 3.0_factory-Chinafix.zip",
    "BIOS_K54LY usb 3.0_factory-Chinafix.zip",
    "GV-RX570AORUS-4GD-1.0 Boardview.zip",
    "GV-RX580AORUS-4GD-0.2-1.1 Boardview.zip",
    "GV-RX580GAMING-8GD-1.0 Boardview.zip",
    "GV-RX590GAMING-8GD-1.0 Boardview.zip",
    "BIOS_k53SJ usb 3.0 K53SJFW05300A_factory-Chinafix.zip",
    "BIOS_k53sv usb 3.0 _factory-Chinafix.zip",
    "BIOS_u310 U410_Chinafix.zip",
    "GV-N3070EAGLE OC-8GD-1.0 Boardview.zip",
    "DANL9MB18F0 (tvw).rar",
    "GV-N4090GAMING-OC-24GD r1.0 boardview.zip",
];

/// Substrings (case-insensitive) of archive contents or paths that mark them as risky.
pub const GARBAGE_PATTERNS: &[&str] = &[
    "lpk.dll",
    "open boardview using this tvw specific software",
    "chinafix",
    "程序_原厂_迅维版主分享",
    "crack.exe",
    "patch.exe",
    "keygen.exe",
    "loader.exe",
    "activator.exe",
    "bypass.exe",
    ".exe.bak",
    "dos4gw",
    "crack/",
    "keygen/",
    "medicine/",
];

/// Vendor tooling names that are expected in firmware archives.
pub const SAFE_PATTERNS: &[&str] = &[
    "flash", "afud", "insyde", "h2o", "utility", "update", "phlash", "ami", "phoenix", "dell",
    "hp", "lenovo", "bios",
];

/// Board data worth keeping: pulled out of a flagged archive before it is neutralized, and
/// never neutralized by the per-file check.
pub const KEEP_EXTS: &[&str] = &[
    "tvw", "brd", "fz", "cad", "asc", "pdf", "bvr", "pcb", "sqlite3", "obdata", "obdlocal",
    "obdlog", "obdq", "bin", "rom", "cap", "fd", "wph", "hex", "txt", "json",
];

/// Shown instead of scan progress when no archive tool is installed.
pub const SKIPPED_NO_TOOLS: &str = "Shield: Skipped (Tools not found)";

const ARCHIVE_EXTENSIONS: [&str; 3] = ["zip", "7z", "rar"];
const SEVEN_ZIP_BINARIES: [&str; 3] = ["7z", "7za", "7zz"];
const RAR_BINARIES: [&str; 2] = ["unrar", "rar"];
const EXTRACT_DIR: &str = "extract";

pub type SweepFuture<'a> = Pin<Box<dyn Future<Output = Result<CleanupStats>> + Send + 'a>>;

/// Scans the local tree for risky archives and neutralizes them per `policy`.
pub trait CleanupSweep: Send + Sync {
    fn run_sweep<'a>(
        &'a self,
        local_dir: &'a Path,
        exclude_file: &'a Path,
        policy: MalwarePolicy,
        on_update: &'a (dyn Fn(&CleanupStats) + Send + Sync),
    ) -> SweepFuture<'a>;

    /// Checks one freshly downloaded file by its path alone and neutralizes it when risky.
    /// Returns whether the file was removed from its place.
    fn clean_file(
        &self,
        local_dir: &Path,
        exclude_file: &Path,
        rel_path: &str,
        policy: MalwarePolicy,
        stats: &mut CleanupStats,
    ) -> Result<bool>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiverKind {
    SevenZip,
    Rar,
}

/// External archive tool used to list and extract archive contents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Archiver {
    pub kind: ArchiverKind,
    pub program: PathBuf,
}

impl Archiver {
    /// The command-line dialect follows the program name: anything named like `rar` speaks
    /// RAR, everything else 7-Zip.
    pub fn new(program: impl Into<PathBuf>) -> Self {
        let program = program.into();
        let name = program
            .file_stem()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
            .to_ascii_lowercase();
        let kind = if name.contains("rar") {
            ArchiverKind::Rar
        } else {
            ArchiverKind::SevenZip
        };
        Self { kind, program }
    }

    /// `configured` when set, else the first 7-Zip binary on `PATH`, then RAR.
    pub fn resolve(configured: Option<&Path>) -> Option<Self> {
        if let Some(program) = configured {
            return Some(Self::new(program));
        }
        let path = std::env::var_os("PATH")?;
        let dirs: Vec<PathBuf> = std::env::split_paths(&path).collect();
        SEVEN_ZIP_BINARIES
            .iter()
            .chain(RAR_BINARIES.iter())
            .find_map(|name| {
                let file = format!("{name}{}", std::env::consts::EXE_SUFFIX);
                dirs.iter().map(|d| d.join(&file)).find(|p| p.is_file())
            })
            .map(Self::new)
    }

    /// Recursive member listing as printed by the tool.
    pub async fn list(&self, archive: &Path) -> Result<String> {
        let mut cmd = Command::new(&self.program);
        match self.kind {
            ArchiverKind::SevenZip => cmd.arg("l").arg(archive).arg("-r"),
            ArchiverKind::Rar => cmd.arg("v").arg(archive),
        };
        let output = self.output(cmd).await?;
        if !output.status.success() {
            warn!(
                event = "shield.list_failed",
                archive = %archive.display(),
                code = output.status.code().unwrap_or(-1),
                "shield.list_failed"
            );
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// Extracts members matching `patterns` into `dest`, keeping their inner paths.
    pub async fn extract(&self, archive: &Path, patterns: &[String], dest: &Path) -> Result<()> {
        let mut cmd = Command::new(&self.program);
        match self.kind {
            ArchiverKind::SevenZip => {
                let mut out = OsString::from("-o");
                out.push(dest);
                cmd.arg("x")
                    .arg(archive)
                    .args(patterns)
                    .arg(out)
                    .args(["-r", "-y"]);
            }
            ArchiverKind::Rar => {
                let mut out = dest.as_os_str().to_owned();
                out.push(std::path::MAIN_SEPARATOR_STR);
                cmd.args(["x", "-r", "-y"]).arg(archive).args(patterns).arg(out);
            }
        }
        let output = self.output(cmd).await?;
        if !output.status.success() {
            debug!(
                event = "shield.extract_incomplete",
                archive = %archive.display(),
                code = output.status.code().unwrap_or(-1),
                "shield.extract_incomplete"
            );
        }
        Ok(())
    }

    async fn output(&self, mut cmd: Command) -> Result<Output> {
        cmd.stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| Error::Cleanup {
                message: format!("{}: {e}", self.program.display()),
            })
    }
}

/// Content-based sweep: each archive is listed through the archive tool and judged by its
/// path plus member names. Without a tool the sweep reports itself skipped.
#[derive(Debug, Clone)]
pub struct PatternSweep {
    priority_names: Vec<String>,
    archiver: Option<Archiver>,
}

impl PatternSweep {
    pub fn new<'a>(extra_risky_names: impl IntoIterator<Item = &'a str>) -> Self {
        let priority_names = PRIORITY_FILENAMES
            .iter()
            .copied()
            .chain(extra_risky_names)
            .map(str::to_lowercase)
            .collect();
        Self {
            priority_names,
            archiver: None,
        }
    }

    /// Risky names and archive tool taken from `config`.
    pub fn from_config(config: &SyncConfig) -> Self {
        Self::new(config.risky_names.iter().map(String::as_str))
            .with_archiver(Archiver::resolve(config.tool.archiver.as_deref()))
    }

    pub fn with_archiver(mut self, archiver: Option<Archiver>) -> Self {
        self.archiver = archiver;
        self
    }

    fn is_priority(&self, rel_path: &str) -> bool {
        let lower = rel_path.to_lowercase();
        let name = lower.rsplit('/').next().unwrap_or(&lower);
        self.priority_names.iter().any(|p| p == name)
    }

    /// Garbage hits in `haystack` (lowercased) plus one for a priority filename.
    fn risk_hits(&self, rel_path: &str, haystack: &str) -> u64 {
        let mut hits = GARBAGE_PATTERNS
            .iter()
            .filter(|p| haystack.contains(*p))
            .count() as u64;
        if self.is_priority(rel_path) {
            hits += 1;
        }
        hits
    }

    async fn sweep(
        &self,
        local_dir: &Path,
        exclude_file: &Path,
        policy: MalwarePolicy,
        on_update: &(dyn Fn(&CleanupStats) + Send + Sync),
    ) -> Result<CleanupStats> {
        let mut stats = CleanupStats {
            policy_mode: policy.as_str().to_string(),
            ..CleanupStats::default()
        };
        let Some(archiver) = &self.archiver else {
            warn!(
                event = "shield.skipped",
                reason = "no archive tool",
                "shield.skipped"
            );
            stats.tools_missing = true;
            on_update(&stats);
            return Ok(stats);
        };

        let archives = list_archives(local_dir)?;
        stats.total_archives = archives.len() as u64;
        info!(
            event = "shield.start",
            local_dir = %local_dir.display(),
            archives = stats.total_archives,
            policy = policy.as_str(),
            archiver = %archiver.program.display(),
            "shield.start"
        );
        on_update(&stats);

        let mut flagged_paths = Vec::new();
        for (rel, size) in archives {
            stats.current_archive = Some(rel.clone());
            stats.current_archive_size = Some(size);
            let path = local_dir.join(&rel);

            let listing = archiver.list(&path).await?;
            let haystack = format!("{rel}\n{listing}").to_lowercase();
            if SAFE_PATTERNS.iter().any(|p| haystack.contains(p)) {
                stats.safe_pattern_count += 1;
            }

            let hits = self.risk_hits(&rel, &haystack);
            if hits > 0 {
                stats.risky_pattern_count += hits;
                stats.flagged_archives += 1;
                on_update(&stats);

                let kept = extract_keepers(archiver, local_dir, &rel).await;
                stats.extracted_files += kept.len() as u64;
                stats.extracted_paths.extend(kept);

                neutralize(local_dir, &rel, policy)?;
                match policy {
                    MalwarePolicy::Purge => stats.purged_files += 1,
                    MalwarePolicy::Isolate => stats.isolated_files += 1,
                }
                warn!(
                    event = "shield.flagged",
                    path = %rel,
                    hits,
                    policy = policy.as_str(),
                    "shield.flagged"
                );
                flagged_paths.push(rel);
            } else {
                stats.clean_archives += 1;
            }

            stats.scanned_archives += 1;
            on_update(&stats);
        }

        stats.current_archive = None;
        stats.current_archive_size = None;
        update_exclude_file(exclude_file, &flagged_paths)?;

        info!(
            event = "shield.finish",
            scanned = stats.scanned_archives,
            flagged = stats.flagged_archives,
            extracted = stats.extracted_files,
            "shield.finish"
        );
        Ok(stats)
    }
}

impl CleanupSweep for PatternSweep {
    fn run_sweep<'a>(
        &'a self,
        local_dir: &'a Path,
        exclude_file: &'a Path,
        policy: MalwarePolicy,
        on_update: &'a (dyn Fn(&CleanupStats) + Send + Sync),
    ) -> SweepFuture<'a> {
        Box::pin(self.sweep(local_dir, exclude_file, policy, on_update))
    }

    fn clean_file(
        &self,
        local_dir: &Path,
        exclude_file: &Path,
        rel_path: &str,
        policy: MalwarePolicy,
        stats: &mut CleanupStats,
    ) -> Result<bool> {
        if has_keep_ext(rel_path) || !local_dir.join(rel_path).is_file() {
            return Ok(false);
        }
        let hits = self.risk_hits(rel_path, &rel_path.to_lowercase());
        if hits == 0 {
            return Ok(false);
        }

        stats.risky_pattern_count += hits;
        neutralize(local_dir, rel_path, policy)?;
        match policy {
            MalwarePolicy::Purge => stats.purged_files += 1,
            MalwarePolicy::Isolate => stats.isolated_files += 1,
        }
        update_exclude_file(exclude_file, &[rel_path.to_string()])?;
        warn!(
            event = "shield.realtime_flagged",
            path = %rel_path,
            policy = policy.as_str(),
            "shield.realtime_flagged"
        );
        Ok(true)
    }
}

fn has_keep_ext(rel_path: &str) -> bool {
    Path::new(rel_path)
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| KEEP_EXTS.iter().any(|k| e.eq_ignore_ascii_case(k)))
}

/// Pulls keep-worthy members of `rel` out next to it. Extraction is best effort: failures
/// are logged and whatever was moved into place is returned.
async fn extract_keepers(archiver: &Archiver, local_dir: &Path, rel: &str) -> Vec<String> {
    let staging = local_dir.join(STATE_DIR).join(EXTRACT_DIR);
    if let Err(e) = reset_dir(&staging) {
        warn!(event = "shield.extract_failed", path = %rel, error = %e, "shield.extract_failed");
        return Vec::new();
    }

    let patterns: Vec<String> = KEEP_EXTS.iter().map(|e| format!("*.{e}")).collect();
    let target_rel = Path::new(rel).parent().unwrap_or(Path::new(""));
    let kept = match archiver
        .extract(&local_dir.join(rel), &patterns, &staging)
        .await
    {
        Ok(()) => move_extracted(&staging, local_dir, target_rel),
        Err(e) => Err(e),
    };
    if let Err(e) = std::fs::remove_dir_all(&staging) {
        debug!(event = "shield.staging_cleanup_failed", error = %e, "shield.staging_cleanup_failed");
    }

    match kept {
        Ok(kept) => {
            debug!(event = "shield.extracted", path = %rel, files = kept.len() as u64, "shield.extracted");
            kept
        }
        Err(e) => {
            warn!(event = "shield.extract_failed", path = %rel, error = %e, "shield.extract_failed");
            Vec::new()
        }
    }
}

fn reset_dir(dir: &Path) -> std::io::Result<()> {
    match std::fs::remove_dir_all(dir) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }
    std::fs::create_dir_all(dir)
}

/// Moves every extracted file from `staging` to `local_dir/target_rel`, returning the new
/// relative paths.
fn move_extracted(staging: &Path, local_dir: &Path, target_rel: &Path) -> Result<Vec<String>> {
    let mut moved = Vec::new();
    for entry in WalkDir::new(staging).sort_by_file_name() {
        let entry = entry?;
        if !entry.file_type().is_file() || !has_keep_ext(&entry.file_name().to_string_lossy()) {
            continue;
        }
        let Ok(inner) = entry.path().strip_prefix(staging) else {
            continue;
        };
        let rel_path = target_rel.join(inner);
        let Some(rel) = rel_path.to_str() else {
            debug!(event = "shield.skip_non_utf8", path = ?entry.path(), "shield.skip_non_utf8");
            continue;
        };
        let dest = local_dir.join(&rel_path);
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::rename(entry.path(), &dest)?;
        moved.push(rel.replace('\\', "/"));
    }
    Ok(moved)
}

fn list_archives(root: &Path) -> Result<Vec<(String, u64)>> {
    if !root.exists() {
        return Ok(Vec::new());
    }
    let mut out = Vec::new();
    let walker = WalkDir::new(root).into_iter().filter_entry(|e| {
        if e.depth() == 0 || !e.file_type().is_dir() {
            return true;
        }
        let name = e.file_name().to_string_lossy();
        name != STATE_DIR && name != RISK_DIR
    });
    for entry in walker {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let is_archive = entry
            .path()
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| ARCHIVE_EXTENSIONS.iter().any(|a| e.eq_ignore_ascii_case(a)));
        if !is_archive {
            continue;
        }
        let Ok(rel) = entry.path().strip_prefix(root) else {
            continue;
        };
        let Some(rel) = rel.to_str() else {
            debug!(event = "shield.skip_non_utf8", path = ?entry.path(), "shield.skip_non_utf8");
            continue;
        };
        let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
        out.push((rel.replace('\\', "/"), size));
    }
    out.sort();
    Ok(out)
}

fn neutralize(local_dir: &Path, rel: &str, policy: MalwarePolicy) -> Result<()> {
    let src = local_dir.join(rel);
    let res = match policy {
        MalwarePolicy::Purge => std::fs::remove_file(&src),
        MalwarePolicy::Isolate => {
            let dst: PathBuf = local_dir.join(RISK_DIR).join(rel);
            match dst.parent() {
                Some(parent) => std::fs::create_dir_all(parent),
                None => Ok(()),
            }
            .and_then(|_| std::fs::rename(&src, &dst))
        }
    };
    res.map_err(|e| Error::Cleanup {
        message: format!("{} {rel}: {e}", policy.as_str()),
    })
}

/// Appends `flagged` to the exclude list and keeps the risk subtree entry last.
fn update_exclude_file(path: &Path, flagged: &[String]) -> Result<()> {
    let existing = match std::fs::read_to_string(path) {
        Ok(s) => s,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
        Err(e) => {
            return Err(Error::Cleanup {
                message: format!("read exclude file: {e}"),
            });
        }
    };

    let mut entries: Vec<String> = existing
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && *l != RISK_EXCLUDE_ENTRY)
        .map(str::to_string)
        .collect();
    let before = entries.len();
    for f in flagged {
        if !entries.contains(f) {
            entries.push(f.clone());
        }
    }
    let had_marker = existing.lines().any(|l| l.trim() == RISK_EXCLUDE_ENTRY);
    if entries.len() == before && had_marker {
        return Ok(());
    }
    entries.push(RISK_EXCLUDE_ENTRY.to_string());

    let write = || -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, entries.join("\n") + "\n")
    };
    write().map_err(|e| Error::Cleanup {
        message: format!("write exclude file: {e}"),
    })
}
