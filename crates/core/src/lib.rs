mod error;

pub mod config;
pub mod format;
pub mod log_lines;
pub mod manifest;
pub mod pipeline;
pub mod process;
pub mod progress;
pub mod run_log;
pub mod session;
pub mod shield;
pub mod transfers;

pub const APP_NAME: &str = "SyncPortal";

pub use config::{
    ConfigStore, FileConfigStore, MalwarePolicy, Provider, SyncConfig, load_config, save_config,
};
pub use error::{Error, Result};
pub use pipeline::{PhasePlan, SyncEngine};
pub use process::{PosixSignals, ProcessController, ProcessSignals, ToolCommand};
pub use progress::{
    CleanupStats, ManifestStats, Phase, PhaseWeights, ProgressAggregator, ProgressSink,
    ProgressUpdate, SyncProgress, TransferSlots,
};
pub use session::{QueueKind, SyncSession};
pub use shield::{Archiver, CleanupSweep, PatternSweep};
pub use transfers::{CompletionSet, TransferItem, TransferRegistry, TransferStatus};
