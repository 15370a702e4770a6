use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Completed entries stay visible for this long before eviction.
pub const COMPLETED_RETENTION_MS: u64 = 60_000;
/// Completed entries surfaced by `snapshot` unless a call site asks for more.
pub const DEFAULT_RECENT_COMPLETED: usize = 2;

pub fn now_unix_ms() -> u64 {
    static LAST_UNIX_MS: AtomicU64 = AtomicU64::new(0);

    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64;

    let mut prev = LAST_UNIX_MS.load(Ordering::Relaxed);
    loop {
        let next = now.max(prev);
        match LAST_UNIX_MS.compare_exchange_weak(prev, next, Ordering::Relaxed, Ordering::Relaxed) {
            Ok(_) => return next,
            Err(current) => prev = current,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferStatus {
    Queued,
    Active,
    Completed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferItem {
    pub filename: String,
    pub size: u64,
    pub transferred: u64,
    pub percentage: u8,
    pub speed: String,
    pub status: TransferStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub eta: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<u64>,
}

/// One sighting of a file in a log record.
#[derive(Debug, Clone, Default)]
pub struct TransferSample {
    pub filename: String,
    pub size: u64,
    pub bytes: u64,
    pub percentage: Option<f64>,
    pub speed: Option<String>,
    pub eta: Option<String>,
}

impl TransferSample {
    /// `round(bytes / size * 100)` when the size is known, else the reported value, else 0.
    pub fn effective_percentage(&self) -> u8 {
        let pct = if self.size > 0 {
            (self.bytes as f64 / self.size as f64 * 100.0).round()
        } else {
            self.percentage.unwrap_or(0.0).round()
        };
        pct.clamp(0.0, 100.0) as u8
    }
}

/// Session-wide set of filenames already counted as completed.
#[derive(Debug, Default, Clone)]
pub struct CompletionSet {
    seen: HashSet<String>,
}

impl CompletionSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` only the first time a filename is marked.
    pub fn mark_complete(&mut self, filename: &str) -> bool {
        if self.seen.contains(filename) {
            return false;
        }
        self.seen.insert(filename.to_string())
    }

    pub fn contains(&self, filename: &str) -> bool {
        self.seen.contains(filename)
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    pub fn clear(&mut self) {
        self.seen.clear();
    }
}

#[derive(Debug, Clone)]
struct Entry {
    item: TransferItem,
    completion_seq: u64,
}

/// Per-file transfer table keyed by filename.
#[derive(Debug, Default)]
pub struct TransferRegistry {
    entries: HashMap<String, Entry>,
    next_seq: u64,
}

impl TransferRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates or refreshes the entry for `sample.filename`. Returns `true` when this call
    /// moved the file into `completed` for the first time in the session.
    pub fn upsert(
        &mut self,
        sample: TransferSample,
        now_ms: u64,
        completions: &mut CompletionSet,
    ) -> bool {
        let percentage = sample.effective_percentage();
        let speed = sample.speed.clone().unwrap_or_else(|| "0 B/s".to_string());

        if let Some(entry) = self.entries.get_mut(&sample.filename) {
            if entry.item.status == TransferStatus::Completed {
                // Completion is sticky: refresh counters but never re-stamp or re-count.
                let item = &mut entry.item;
                item.size = item.size.max(sample.size);
                item.transferred = item.transferred.max(sample.bytes);
                return false;
            }
        }

        let completed = percentage >= 100;
        let newly_completed = completed && completions.mark_complete(&sample.filename);
        let (status, completed_at) = if completed {
            (TransferStatus::Completed, Some(now_ms))
        } else {
            (TransferStatus::Active, None)
        };

        let completion_seq = if completed { self.bump_seq() } else { 0 };
        self.entries.insert(
            sample.filename.clone(),
            Entry {
                item: TransferItem {
                    filename: sample.filename,
                    size: sample.size,
                    transferred: sample.bytes,
                    percentage,
                    speed,
                    status,
                    eta: sample.eta,
                    completed_at,
                },
                completion_seq,
            },
        );

        newly_completed
    }

    /// Forces `filename` into `completed`, creating it if it was never seen.
    pub fn mark_completed(
        &mut self,
        filename: &str,
        now_ms: u64,
        completions: &mut CompletionSet,
    ) -> bool {
        let newly_completed = completions.mark_complete(filename);

        let already_completed = self
            .entries
            .get(filename)
            .is_some_and(|e| e.item.status == TransferStatus::Completed);
        if already_completed {
            return newly_completed;
        }

        let completion_seq = self.bump_seq();
        let previous = self.entries.remove(filename).map(|e| e.item);
        let size = previous.as_ref().map(|p| p.size).unwrap_or(0);
        let speed = previous
            .map(|p| p.speed)
            .unwrap_or_else(|| "0 B/s".to_string());

        self.entries.insert(
            filename.to_string(),
            Entry {
                item: TransferItem {
                    filename: filename.to_string(),
                    size,
                    transferred: size,
                    percentage: 100,
                    speed,
                    status: TransferStatus::Completed,
                    eta: None,
                    completed_at: Some(now_ms),
                },
                completion_seq,
            },
        );

        newly_completed
    }

    pub fn snapshot(&mut self, limit: usize, now_ms: u64) -> Vec<TransferItem> {
        self.snapshot_with(limit, DEFAULT_RECENT_COMPLETED, now_ms)
    }

    /// Active items by descending percentage, then the `recent_completed` newest completions.
    pub fn snapshot_with(
        &mut self,
        limit: usize,
        recent_completed: usize,
        now_ms: u64,
    ) -> Vec<TransferItem> {
        self.evict_expired(now_ms);

        let mut active: Vec<&Entry> = self
            .entries
            .values()
            .filter(|e| e.item.status == TransferStatus::Active)
            .collect();
        active.sort_by(|a, b| {
            b.item
                .percentage
                .cmp(&a.item.percentage)
                .then_with(|| a.item.filename.cmp(&b.item.filename))
        });

        let mut completed: Vec<&Entry> = self
            .entries
            .values()
            .filter(|e| e.item.status == TransferStatus::Completed)
            .collect();
        completed.sort_by(|a, b| {
            b.item
                .completed_at
                .cmp(&a.item.completed_at)
                .then_with(|| b.completion_seq.cmp(&a.completion_seq))
        });

        active
            .into_iter()
            .chain(completed.into_iter().take(recent_completed))
            .take(limit)
            .map(|e| e.item.clone())
            .collect()
    }

    pub fn active_count(&self) -> usize {
        self.entries
            .values()
            .filter(|e| e.item.status == TransferStatus::Active)
            .count()
    }

    pub fn get(&self, filename: &str) -> Option<&TransferItem> {
        self.entries.get(filename).map(|e| &e.item)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    fn evict_expired(&mut self, now_ms: u64) {
        self.entries.retain(|_, e| match e.item.completed_at {
            Some(at) if e.item.status == TransferStatus::Completed => {
                now_ms.saturating_sub(at) <= COMPLETED_RETENTION_MS
            }
            _ => true,
        });
    }

    fn bump_seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }
}
