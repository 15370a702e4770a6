use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio_util::sync::CancellationToken;

use crate::format::{format_bytes, format_eta, format_speed};
use crate::log_lines::{LegacyTransfer, LogRecord, Metric, StatsBlock, ToolEvent};
use crate::progress::{
    ProgressAggregator, ProgressSink, ProgressUpdate, SyncProgress, TransferSlots,
};
use crate::transfers::{CompletionSet, TransferRegistry, TransferSample, now_unix_ms};

/// Upper bound on items carried in one queue snapshot.
pub const QUEUE_DISPLAY_LIMIT: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QueueKind {
    #[default]
    Download,
    Upload,
}

struct SessionState {
    downloads: TransferRegistry,
    uploads: TransferRegistry,
    download_done: CompletionSet,
    upload_done: CompletionSet,
    queue_kind: QueueKind,
    slots_total: u32,
    recent_completed: usize,
    aggregator: Option<ProgressAggregator>,
    sink: Option<Arc<dyn ProgressSink>>,
    last_progress: Option<SyncProgress>,
    cancel: CancellationToken,
}

impl Default for SessionState {
    fn default() -> Self {
        Self {
            downloads: TransferRegistry::new(),
            uploads: TransferRegistry::new(),
            download_done: CompletionSet::new(),
            upload_done: CompletionSet::new(),
            queue_kind: QueueKind::Download,
            slots_total: 0,
            recent_completed: crate::transfers::DEFAULT_RECENT_COMPLETED,
            aggregator: None,
            sink: None,
            last_progress: None,
            cancel: CancellationToken::new(),
        }
    }
}

impl SessionState {
    fn registry(&mut self) -> (&mut TransferRegistry, &mut CompletionSet) {
        match self.queue_kind {
            QueueKind::Download => (&mut self.downloads, &mut self.download_done),
            QueueKind::Upload => (&mut self.uploads, &mut self.upload_done),
        }
    }

    fn completed(&self) -> u64 {
        match self.queue_kind {
            QueueKind::Download => self.download_done.len() as u64,
            QueueKind::Upload => self.upload_done.len() as u64,
        }
    }

    /// Queue snapshot, slot usage and completed count for the current queue.
    fn transfer_update(&mut self, now_ms: u64) -> ProgressUpdate {
        let recent = self.recent_completed;
        let slots_total = self.slots_total;
        let files_transferred = self.completed();
        let (registry, _) = self.registry();
        let queue = registry.snapshot_with(QUEUE_DISPLAY_LIMIT, recent, now_ms);
        let active = registry.active_count() as u32;

        let mut update = ProgressUpdate {
            files_transferred: Some(files_transferred),
            transfer_slots: Some(TransferSlots {
                active,
                total: slots_total,
            }),
            ..ProgressUpdate::default()
        };
        match self.queue_kind {
            QueueKind::Download => update.download_queue = Some(queue),
            QueueKind::Upload => update.upload_queue = Some(queue),
        }
        update
    }
}

/// State for one sync run, shared between the pipeline, the process controller and callers
/// that pause or stop the run.
pub struct SyncSession {
    state: Mutex<SessionState>,
    paused: AtomicBool,
}

impl Default for SyncSession {
    fn default() -> Self {
        Self::new()
    }
}

impl SyncSession {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SessionState::default()),
            paused: AtomicBool::new(false),
        }
    }

    fn state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Clears per-run state and installs the aggregator and sink for a new run.
    /// The paused flag is left as the user set it.
    pub fn begin_run(
        &self,
        aggregator: ProgressAggregator,
        sink: Arc<dyn ProgressSink>,
        recent_completed: usize,
    ) {
        let mut st = self.state();
        st.cancel = CancellationToken::new();
        st.downloads.clear();
        st.uploads.clear();
        st.download_done.clear();
        st.upload_done.clear();
        st.queue_kind = QueueKind::Download;
        st.slots_total = 0;
        st.recent_completed = recent_completed;
        st.aggregator = Some(aggregator);
        st.sink = Some(sink);
        st.last_progress = None;
    }

    /// Merges `update` into the run's progress and delivers it to the sink.
    /// Returns `None` when no run has begun.
    pub fn emit(&self, mut update: ProgressUpdate) -> Option<SyncProgress> {
        update.is_paused = Some(self.is_paused());
        let (progress, sink) = {
            let mut st = self.state();
            let progress = st.aggregator.as_mut()?.wrap(update);
            st.last_progress = Some(progress.clone());
            (progress, st.sink.clone())
        };
        if let Some(sink) = sink {
            sink.on_progress(progress.clone());
        }
        Some(progress)
    }

    /// Applies one classified log record to the transfer state and returns the resulting
    /// partial update, if the record carried anything progress-relevant.
    pub fn handle_record(&self, record: &LogRecord) -> Option<ProgressUpdate> {
        let now_ms = now_unix_ms();
        let mut st = self.state();
        match record {
            LogRecord::Structured(ToolEvent::Stats { stats, .. }) => {
                Some(apply_stats(&mut st, stats, now_ms))
            }
            LogRecord::Structured(ToolEvent::Completed { object }) => {
                let (registry, done) = st.registry();
                let fresh = registry.mark_completed(object, now_ms, done);
                Some(st.transfer_update(now_ms).completing(fresh, object))
            }
            LogRecord::Structured(ToolEvent::Transferred(file)) => {
                let sample = TransferSample {
                    filename: file.name.clone(),
                    size: file.size,
                    bytes: file.bytes,
                    percentage: None,
                    speed: file.speed.as_ref().map(speed_text),
                    eta: file.eta.as_ref().map(eta_text),
                };
                let (registry, done) = st.registry();
                let fresh = registry.upsert(sample, now_ms, done);
                Some(st.transfer_update(now_ms).completing(fresh, &file.name))
            }
            LogRecord::Transfer(line)
            | LogRecord::Structured(ToolEvent::Transferring(line)) => {
                let (registry, done) = st.registry();
                let fresh = registry.upsert(legacy_sample(line), now_ms, done);
                Some(st.transfer_update(now_ms).completing(fresh, &line.name))
            }
            LogRecord::Structured(ToolEvent::Message { .. })
            | LogRecord::Structured(ToolEvent::Unknown)
            | LogRecord::Unrecognized(_) => None,
        }
    }

    /// Completed files in the current queue.
    pub fn completed_count(&self) -> u64 {
        self.state().completed()
    }

    /// Completed files across both directions.
    pub fn files_processed(&self) -> u64 {
        let st = self.state();
        (st.download_done.len() + st.upload_done.len()) as u64
    }

    /// Drops displayed transfers for the current queue; completion counts are kept.
    pub fn clear_transfers(&self) {
        let mut st = self.state();
        let (registry, _) = st.registry();
        registry.clear();
    }

    /// Forgets completions for the current queue, for a phase that counts from zero.
    pub fn reset_completions(&self) {
        let mut st = self.state();
        let (_, done) = st.registry();
        done.clear();
    }

    pub fn set_queue(&self, kind: QueueKind, slots_total: u32) {
        let mut st = self.state();
        st.queue_kind = kind;
        st.slots_total = slots_total;
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// Returns `true` when the flag actually changed.
    pub fn set_paused(&self, paused: bool) -> bool {
        self.paused.swap(paused, Ordering::SeqCst) != paused
    }

    pub fn detach_sink(&self) {
        self.state().sink = None;
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.state().cancel.clone()
    }

    pub fn cancel(&self) {
        self.state().cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.state().cancel.is_cancelled()
    }

    pub fn last_progress(&self) -> Option<SyncProgress> {
        self.state().last_progress.clone()
    }

    /// Returns the session to its initial state, including the paused flag.
    pub fn reset_session(&self) {
        *self.state() = SessionState::default();
        self.paused.store(false, Ordering::SeqCst);
    }
}

fn apply_stats(st: &mut SessionState, stats: &StatsBlock, now_ms: u64) -> ProgressUpdate {
    let mut completed_files = Vec::new();
    {
        let (registry, done) = st.registry();
        for t in stats.transferring.iter().flatten() {
            if t.name.is_empty() {
                continue;
            }
            let sample = TransferSample {
                filename: t.name.clone(),
                size: whole(t.size),
                bytes: whole(t.bytes),
                percentage: t.percentage,
                speed: t.speed.map(|s| format_speed(whole(Some(s)))),
                eta: t.eta.map(|e| format_eta(whole(Some(e)))),
            };
            if registry.upsert(sample, now_ms, done) {
                completed_files.push(t.name.clone());
            }
        }
    }

    let mut update = st.transfer_update(now_ms);
    update.completed_files = completed_files;

    let bytes = stats.bytes.map(|b| whole(Some(b)));
    let total = stats.total_bytes.map(|b| whole(Some(b)));
    let percentage = match (bytes, total) {
        (Some(done), Some(total)) if total > 0 => Some(done as f64 / total as f64 * 100.0),
        _ => stats.percentage,
    };

    update.percentage = percentage.map(|p| p.round().clamp(0.0, 100.0) as u8);
    update.transfer_speed = stats.speed.map(|s| format_speed(whole(Some(s))));
    update.eta = stats.eta.map(|e| format_eta(whole(Some(e))));
    update.raw_bytes_transferred = bytes;
    update.raw_total_bytes = total;
    update.bytes_transferred = match (bytes, total) {
        (Some(done), Some(total)) => {
            Some(format!("{}/{}", format_bytes(done), format_bytes(total)))
        }
        (Some(done), None) => Some(format_bytes(done)),
        _ => None,
    };
    update.error_count = stats.errors;
    update
}

/// The human format reports no byte count; derive it from size and percentage.
fn legacy_sample(line: &LegacyTransfer) -> TransferSample {
    let size = line.size.unwrap_or(0);
    let bytes = match line.percentage {
        Some(pct) if pct >= 100.0 => size,
        Some(pct) if pct > 0.0 => (size as f64 * pct / 100.0).floor() as u64,
        _ => 0,
    };
    TransferSample {
        filename: line.name.clone(),
        size,
        bytes,
        percentage: line.percentage,
        speed: line.speed.clone(),
        eta: line.eta.clone(),
    }
}

fn whole(v: Option<f64>) -> u64 {
    match v {
        Some(v) if v.is_finite() && v > 0.0 => v.round() as u64,
        _ => 0,
    }
}

fn speed_text(metric: &Metric) -> String {
    match metric {
        Metric::Number(n) => format_speed(whole(Some(*n))),
        Metric::Text(s) => s.clone(),
    }
}

fn eta_text(metric: &Metric) -> String {
    match metric {
        Metric::Number(n) => format_eta(whole(Some(*n))),
        Metric::Text(s) => s.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log_lines::{LineSplitter, classify, strip_ansi};
    use crate::progress::{Phase, PhaseWeights};

    fn session() -> Arc<SyncSession> {
        let session = Arc::new(SyncSession::new());
        session.begin_run(
            ProgressAggregator::new(PhaseWeights::default()),
            Arc::new(|_: SyncProgress| {}),
            2,
        );
        session
    }

    fn feed(session: &SyncSession, line: &str) -> Option<ProgressUpdate> {
        let record = classify(&strip_ansi(line))?;
        session.handle_record(&record)
    }

    #[test]
    fn completion_counts_once_across_all_record_shapes() {
        let session = session();
        feed(&session, "* a.zip: 50% /1 MiB, 1 MiB/s, 1s");
        feed(&session, "* a.zip: 100% /1 MiB, 1 MiB/s, 0s");
        feed(
            &session,
            r#"{"level":"info","msg":"Copied (new)","object":"a.zip"}"#,
        );
        feed(
            &session,
            r#"{"stats":{"bytes":1048576,"totalBytes":1048576,"transferring":[{"name":"a.zip","size":1048576,"bytes":1048576}]}}"#,
        );
        let update = feed(&session, "* a.zip: 100% /1 MiB, 1 MiB/s, 0s").unwrap();

        assert_eq!(update.files_transferred, Some(1));
        assert_eq!(session.completed_count(), 1);
    }

    #[test]
    fn finished_line_with_placeholder_stats_counts_completion() {
        let session = session();
        feed(&session, "* a.zip: 10% /1Mi, -, 9s");
        let update = feed(&session, "* a.zip: 100% /1Mi, -, -").unwrap();

        assert_eq!(update.files_transferred, Some(1));
        assert_eq!(update.completed_files, vec!["a.zip".to_string()]);
        let queue = update.download_queue.unwrap();
        assert_eq!(queue[0].transferred, 1024 * 1024);
        assert_eq!(session.completed_count(), 1);

        let again = feed(
            &session,
            r#"{"level":"info","msg":"Copied (new)","object":"a.zip"}"#,
        )
        .unwrap();
        assert!(again.completed_files.is_empty());
    }

    #[test]
    fn transferring_message_updates_the_queue() {
        let session = session();
        let update = feed(
            &session,
            r#"{"level":"info","msg":"Transferring: b.zip: 100% /2Ki, -, -"}"#,
        )
        .unwrap();

        assert_eq!(update.files_transferred, Some(1));
        assert_eq!(session.completed_count(), 1);
    }

    #[test]
    fn carriage_return_redraws_yield_ordered_updates() {
        let session = session();
        let mut splitter = LineSplitter::new();
        let chunk = "* a.zip: 10% /1 MiB, 1 MiB/s, 9s\r* a.zip: 20% /1 MiB, 2 MiB/s, 8s\n";

        let percentages: Vec<u8> = splitter
            .push(chunk.as_bytes())
            .iter()
            .filter_map(|line| feed(&session, line))
            .map(|u| u.download_queue.unwrap()[0].percentage)
            .collect();
        assert_eq!(percentages, vec![10, 20]);
    }

    #[test]
    fn stats_block_reports_bytes_speed_and_errors() {
        let session = session();
        let update = feed(
            &session,
            r#"{"level":"info","stats":{"bytes":1572864,"totalBytes":3145728,"speed":2048,"eta":185,"errors":2,"transferring":[{"name":"b.7z","size":100,"bytes":25}]}}"#,
        )
        .unwrap();

        assert_eq!(update.percentage, Some(50));
        assert_eq!(update.bytes_transferred.as_deref(), Some("1.5 MiB/3 MiB"));
        assert_eq!(update.transfer_speed.as_deref(), Some("2 KiB/s"));
        assert_eq!(update.eta.as_deref(), Some("3m 5s"));
        assert_eq!(update.error_count, Some(2));
        assert_eq!(update.transfer_slots.unwrap().active, 1);
    }

    #[test]
    fn upload_queue_counts_separately_from_downloads() {
        let session = session();
        feed(&session, r#"{"msg":"Copied (new)","object":"x.zip"}"#);
        session.set_queue(QueueKind::Upload, 4);
        let update = feed(&session, r#"{"msg":"Copied (new)","object":"x.zip"}"#).unwrap();

        assert_eq!(update.files_transferred, Some(1));
        assert!(update.upload_queue.is_some());
        assert_eq!(session.files_processed(), 2);
    }

    #[test]
    fn messages_and_noise_produce_no_update() {
        let session = session();
        assert!(feed(&session, r#"{"level":"notice","msg":"Starting"}"#).is_none());
        assert!(feed(&session, "Transferred: 0 / 0, -, 0 B/s, ETA -").is_none());
    }

    #[test]
    fn emit_stamps_pause_flag_and_records_last_progress() {
        let session = session();
        session.set_paused(true);
        let progress = session
            .emit(ProgressUpdate::phase(Phase::Pull, "Pulling"))
            .unwrap();
        assert!(progress.is_paused);
        assert_eq!(session.last_progress(), Some(progress));
    }

    #[test]
    fn reset_session_clears_pause_and_run_state() {
        let session = session();
        session.set_paused(true);
        feed(&session, r#"{"msg":"Copied (new)","object":"x.zip"}"#);

        session.reset_session();
        assert!(!session.is_paused());
        assert_eq!(session.completed_count(), 0);
        assert!(session.emit(ProgressUpdate::default()).is_none());
    }
}
