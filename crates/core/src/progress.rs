use serde::{Deserialize, Serialize};

use crate::transfers::TransferItem;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    #[default]
    Pull,
    Clean,
    Cloud,
    Done,
    Error,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pull => "pull",
            Self::Clean => "clean",
            Self::Cloud => "cloud",
            Self::Done => "done",
            Self::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ManifestSource {
    Source,
    Backup,
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OptimizationMode {
    Manifest,
    Full,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestStats {
    pub remote_file_count: u64,
    pub local_file_count: u64,
    pub missing_file_count: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub risky_file_count: Option<u64>,
    pub optimization_mode: OptimizationMode,
    pub manifest_source: ManifestSource,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanupStats {
    pub total_archives: u64,
    pub scanned_archives: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_archive: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_archive_size: Option<u64>,
    pub safe_pattern_count: u64,
    pub risky_pattern_count: u64,
    pub clean_archives: u64,
    pub flagged_archives: u64,
    pub extracted_files: u64,
    pub purged_files: u64,
    pub isolated_files: u64,
    pub policy_mode: String,
    /// No archive tool was found, so nothing was opened or neutralized.
    #[serde(default)]
    pub tools_missing: bool,
    /// Local paths written by extraction, relative to the swept directory.
    #[serde(skip)]
    pub extracted_paths: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TransferSlots {
    pub active: u32,
    pub total: u32,
}

/// The outward progress record. `percentage` is phase-local, `global_percentage` spans all
/// enabled phases.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncProgress {
    pub phase: Phase,
    pub description: String,
    pub percentage: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub global_percentage: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transfer_speed: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub eta: Option<String>,
    pub files_transferred: u64,
    pub total_files: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bytes_transferred: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw_bytes_transferred: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw_total_bytes: Option<u64>,
    pub error_count: u64,
    pub is_paused: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub manifest_stats: Option<ManifestStats>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cleanup_stats: Option<CleanupStats>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub download_queue: Option<Vec<TransferItem>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upload_queue: Option<Vec<TransferItem>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transfer_slots: Option<TransferSlots>,
}

/// Partial update merged into the last known [`SyncProgress`]; `None` keeps the prior value.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProgressUpdate {
    pub phase: Option<Phase>,
    pub description: Option<String>,
    pub percentage: Option<u8>,
    pub transfer_speed: Option<String>,
    pub eta: Option<String>,
    pub files_transferred: Option<u64>,
    pub total_files: Option<u64>,
    pub bytes_transferred: Option<String>,
    pub raw_bytes_transferred: Option<u64>,
    pub raw_total_bytes: Option<u64>,
    pub error_count: Option<u64>,
    pub is_paused: Option<bool>,
    pub manifest_stats: Option<ManifestStats>,
    pub cleanup_stats: Option<CleanupStats>,
    pub download_queue: Option<Vec<TransferItem>>,
    pub upload_queue: Option<Vec<TransferItem>>,
    pub transfer_slots: Option<TransferSlots>,
    /// Files this update counted as completed for the first time.
    pub completed_files: Vec<String>,
}

impl ProgressUpdate {
    pub fn phase(phase: Phase, description: impl Into<String>) -> Self {
        Self {
            phase: Some(phase),
            description: Some(description.into()),
            ..Self::default()
        }
    }

    pub fn with_percentage(mut self, percentage: u8) -> Self {
        self.percentage = Some(percentage.min(100));
        self
    }

    pub(crate) fn completing(mut self, fresh: bool, filename: &str) -> Self {
        if fresh {
            self.completed_files.push(filename.to_string());
        }
        self
    }

    pub fn paused(is_paused: bool) -> Self {
        Self {
            is_paused: Some(is_paused),
            ..Self::default()
        }
    }
}

pub trait ProgressSink: Send + Sync {
    fn on_progress(&self, progress: SyncProgress);
}

impl<F> ProgressSink for F
where
    F: Fn(SyncProgress) + Send + Sync,
{
    fn on_progress(&self, progress: SyncProgress) {
        self(progress)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PhaseWeights {
    pub pull: u32,
    pub clean: u32,
    pub cloud: u32,
}

impl Default for PhaseWeights {
    fn default() -> Self {
        Self {
            pull: 45,
            clean: 10,
            cloud: 45,
        }
    }
}

impl PhaseWeights {
    /// Zeroes the weight of every disabled phase.
    pub fn for_enabled(self, pull: bool, clean: bool, cloud: bool) -> Self {
        Self {
            pull: if pull { self.pull } else { 0 },
            clean: if clean { self.clean } else { 0 },
            cloud: if cloud { self.cloud } else { 0 },
        }
    }

    pub fn total(&self) -> u32 {
        self.pull + self.clean + self.cloud
    }

    /// Weighted cross-phase percentage for `phase` at phase-local `percentage`.
    pub fn global_percentage(&self, phase: Phase, percentage: u8) -> u8 {
        let total = self.total();
        let (prior, current) = match phase {
            Phase::Done => return 100,
            Phase::Error => return 0,
            Phase::Pull => (0, self.pull),
            Phase::Clean => (self.pull, self.clean),
            Phase::Cloud => (self.pull + self.clean, self.cloud),
        };
        if total == 0 {
            return 0;
        }

        let pct = f64::from(percentage.min(100));
        let weighted = f64::from(prior) + f64::from(current) * pct / 100.0;
        let scaled = (weighted * 100.0 / f64::from(total)).round();
        scaled.clamp(0.0, 100.0) as u8
    }
}

/// Merges partial updates into the last known record and stamps the global percentage.
#[derive(Debug, Clone)]
pub struct ProgressAggregator {
    weights: PhaseWeights,
    current: SyncProgress,
}

impl ProgressAggregator {
    pub fn new(weights: PhaseWeights) -> Self {
        Self {
            weights,
            current: SyncProgress::default(),
        }
    }

    pub fn weights(&self) -> PhaseWeights {
        self.weights
    }

    pub fn current(&self) -> &SyncProgress {
        &self.current
    }

    pub fn reset(&mut self) {
        self.current = SyncProgress::default();
    }

    pub fn wrap(&mut self, update: ProgressUpdate) -> SyncProgress {
        let cur = &mut self.current;

        let entering_error = update.phase == Some(Phase::Error);

        if let Some(v) = update.phase {
            cur.phase = v;
        }
        if let Some(v) = update.description {
            cur.description = v;
        }
        if let Some(v) = update.percentage {
            cur.percentage = v.min(100);
        }
        if let Some(v) = update.transfer_speed {
            cur.transfer_speed = Some(v);
        }
        if let Some(v) = update.eta {
            cur.eta = Some(v);
        }
        if let Some(v) = update.files_transferred {
            cur.files_transferred = v;
        }
        if let Some(v) = update.total_files {
            cur.total_files = v;
        }
        if let Some(v) = update.bytes_transferred {
            cur.bytes_transferred = Some(v);
        }
        if let Some(v) = update.raw_bytes_transferred {
            cur.raw_bytes_transferred = Some(v);
        }
        if let Some(v) = update.raw_total_bytes {
            cur.raw_total_bytes = Some(v);
        }
        if let Some(v) = update.error_count {
            cur.error_count = v;
        }
        if let Some(v) = update.is_paused {
            cur.is_paused = v;
        }
        if let Some(v) = update.manifest_stats {
            cur.manifest_stats = Some(v);
        }
        if let Some(v) = update.cleanup_stats {
            cur.cleanup_stats = Some(v);
        }
        if let Some(v) = update.download_queue {
            cur.download_queue = Some(v);
        }
        if let Some(v) = update.upload_queue {
            cur.upload_queue = Some(v);
        }
        if let Some(v) = update.transfer_slots {
            cur.transfer_slots = Some(v);
        }

        if entering_error {
            // No stale transfer detail once the run has failed.
            cur.percentage = 0;
            cur.transfer_speed = None;
            cur.eta = None;
            cur.download_queue = None;
            cur.upload_queue = None;
            cur.transfer_slots = None;
        } else if cur.phase == Phase::Done {
            cur.percentage = 100;
        }

        cur.global_percentage = Some(self.weights.global_percentage(cur.phase, cur.percentage));
        cur.clone()
    }
}
