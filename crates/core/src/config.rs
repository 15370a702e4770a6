use std::path::{Component, Path, PathBuf};

use serde::de::Error as _;
use serde::{Deserialize, Serialize};

use crate::manifest::{EXCLUDE_FILE, STATE_DIR};
use crate::progress::PhaseWeights;
use crate::{Error, Result};

pub const CONFIG_SCHEMA_VERSION: u32 = 1;

pub const ENV_TOOL: &str = "SYNC_PORTAL_TOOL";
pub const ENV_RCLONE_CONFIG: &str = "SYNC_PORTAL_RCLONE_CONFIG";
pub const ENV_ARCHIVER: &str = "SYNC_PORTAL_ARCHIVER";
pub const ENV_CONFIG_DIR: &str = "SYNC_PORTAL_CONFIG_DIR";
pub const ENV_DATA_DIR: &str = "SYNC_PORTAL_DATA_DIR";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Copyparty,
    Gdrive,
    B2,
    Sftp,
    Pcloud,
    Onedrive,
    Dropbox,
    Mega,
    R2,
    #[default]
    None,
    Unconfigured,
}

impl Provider {
    pub fn is_configured(self) -> bool {
        !matches!(self, Self::None | Self::Unconfigured)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MalwarePolicy {
    #[default]
    Purge,
    Isolate,
}

impl MalwarePolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Purge => "purge",
            Self::Isolate => "isolate",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolSettings {
    pub binary: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config_path: Option<PathBuf>,
    pub source_remote: String,
    pub backup_remote: String,
    pub stats_interval: String,
    /// Archive tool used by the cleanup sweep; `7z`, `7za`, `7zz`, `rar` or `unrar` on
    /// `PATH` when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub archiver: Option<PathBuf>,
}

impl Default for ToolSettings {
    fn default() -> Self {
        Self {
            binary: "rclone".to_string(),
            config_path: None,
            source_remote: "portal_source".to_string(),
            backup_remote: "portal_backup".to_string(),
            stats_interval: "500ms".to_string(),
            archiver: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncOutcome {
    Success,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastSyncStats {
    pub timestamp: u64,
    pub files_processed: u64,
    pub bytes_transferred: u64,
    pub status: SyncOutcome,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastShieldStats {
    pub timestamp: u64,
    pub total_archives: u64,
    pub risky_pattern_count: u64,
    pub extracted_files: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncConfig {
    pub version: u32,
    #[serde(default)]
    pub source_provider: Provider,
    #[serde(default)]
    pub backup_provider: Provider,
    #[serde(default)]
    pub upsync_enabled: bool,
    #[serde(default)]
    pub local_dir: PathBuf,
    #[serde(default)]
    pub backup_dir: String,
    #[serde(default)]
    pub strict_mirror: bool,
    #[serde(default)]
    pub enable_malware_shield: bool,
    #[serde(default)]
    pub malware_policy: MalwarePolicy,
    #[serde(default = "default_transfers")]
    pub downsync_transfers: u32,
    #[serde(default = "default_transfers")]
    pub upsync_transfers: u32,
    #[serde(default = "default_checkers")]
    pub checkers: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cookie: Option<String>,
    #[serde(default)]
    pub risky_names: Vec<String>,
    #[serde(default = "default_recent_completed")]
    pub recent_completed: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exclude_file: Option<PathBuf>,
    #[serde(default)]
    pub tool: ToolSettings,
    #[serde(default)]
    pub weights: PhaseWeights,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_sync_stats: Option<LastSyncStats>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_shield_stats: Option<LastShieldStats>,
}

fn default_transfers() -> u32 {
    4
}

fn default_checkers() -> u32 {
    16
}

fn default_recent_completed() -> usize {
    10
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            version: CONFIG_SCHEMA_VERSION,
            source_provider: Provider::None,
            backup_provider: Provider::None,
            upsync_enabled: false,
            local_dir: PathBuf::new(),
            backup_dir: String::new(),
            strict_mirror: false,
            enable_malware_shield: false,
            malware_policy: MalwarePolicy::Purge,
            downsync_transfers: default_transfers(),
            upsync_transfers: default_transfers(),
            checkers: default_checkers(),
            cookie: None,
            risky_names: Vec::new(),
            recent_completed: default_recent_completed(),
            exclude_file: None,
            tool: ToolSettings::default(),
            weights: PhaseWeights::default(),
            last_sync_stats: None,
            last_shield_stats: None,
        }
    }
}

impl SyncConfig {
    pub fn is_initialized(&self) -> bool {
        !self.local_dir.as_os_str().is_empty()
    }

    pub fn state_dir(&self) -> PathBuf {
        self.local_dir.join(STATE_DIR)
    }

    pub fn exclude_file_path(&self) -> PathBuf {
        self.exclude_file
            .clone()
            .unwrap_or_else(|| self.state_dir().join(EXCLUDE_FILE))
    }

    /// `SYNC_PORTAL_TOOL`, `SYNC_PORTAL_RCLONE_CONFIG` and `SYNC_PORTAL_ARCHIVER` override the
    /// `[tool]` table.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var(ENV_TOOL)
            && !v.trim().is_empty()
        {
            self.tool.binary = v;
        }
        if let Ok(v) = std::env::var(ENV_RCLONE_CONFIG)
            && !v.trim().is_empty()
        {
            self.tool.config_path = Some(PathBuf::from(v));
        }
        if let Ok(v) = std::env::var(ENV_ARCHIVER)
            && !v.trim().is_empty()
        {
            self.tool.archiver = Some(PathBuf::from(v));
        }
    }
}

pub fn config_path(config_dir: &Path) -> PathBuf {
    config_dir.join("config.toml")
}

pub fn load_config(config_dir: &Path) -> Result<SyncConfig> {
    let path = config_path(config_dir);
    if !path.exists() {
        return Ok(SyncConfig::default());
    }

    let text = std::fs::read_to_string(&path).map_err(|e| Error::InvalidConfig {
        message: format!("config read failed: {e}"),
    })?;

    parse_config(&text).map_err(|e| Error::InvalidConfig {
        message: format!("config invalid: {e}"),
    })
}

pub fn parse_config(text: &str) -> std::result::Result<SyncConfig, toml::de::Error> {
    let raw: toml::Value = toml::from_str(text)?;
    let version = raw
        .get("version")
        .and_then(|v| v.as_integer())
        .and_then(|v| u32::try_from(v).ok());

    match version {
        Some(CONFIG_SCHEMA_VERSION) => toml::from_str::<SyncConfig>(text),
        Some(other) => Err(toml::de::Error::custom(format!(
            "unsupported config schema version: {other} (expected {CONFIG_SCHEMA_VERSION})"
        ))),
        None => Err(toml::de::Error::custom("missing config schema version")),
    }
}

pub fn to_toml(config: &SyncConfig) -> Result<String> {
    validate_config(config)?;
    toml::to_string(config).map_err(|e| Error::InvalidConfig {
        message: format!("config encode failed: {e}"),
    })
}

pub fn save_config(config_dir: &Path, config: &SyncConfig) -> Result<()> {
    let text = to_toml(config)?;

    let path = config_path(config_dir);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| Error::InvalidConfig {
            message: format!("config dir create failed: {e}"),
        })?;
    }

    atomic_write(&path, text.as_bytes()).map_err(|e| Error::InvalidConfig {
        message: format!("config write failed: {e}"),
    })?;
    Ok(())
}

pub fn validate_config(config: &SyncConfig) -> Result<()> {
    if config.version != CONFIG_SCHEMA_VERSION {
        return Err(Error::InvalidConfig {
            message: format!(
                "config.version must be {CONFIG_SCHEMA_VERSION} (got {})",
                config.version
            ),
        });
    }

    if config.downsync_transfers == 0 || config.upsync_transfers == 0 {
        return Err(Error::InvalidConfig {
            message: "transfer counts must be > 0".to_string(),
        });
    }
    if config.checkers == 0 {
        return Err(Error::InvalidConfig {
            message: "checkers must be > 0".to_string(),
        });
    }

    if config.weights.total() == 0 {
        return Err(Error::InvalidConfig {
            message: "phase weights must not all be 0".to_string(),
        });
    }

    if config.tool.binary.trim().is_empty() {
        return Err(Error::InvalidConfig {
            message: "tool.binary must not be empty".to_string(),
        });
    }

    if config.is_initialized() && !is_safe_directory(&config.local_dir) {
        return Err(Error::InvalidConfig {
            message: format!(
                "local_dir is a protected system location: {}",
                config.local_dir.display()
            ),
        });
    }

    Ok(())
}

const PROTECTED_DIRS: [&str; 7] = [
    "/usr",
    "/bin",
    "/sbin",
    "/etc",
    "/var",
    "/Windows",
    "/Program Files",
];

/// Rejects filesystem roots, drive roots and well-known system directories.
pub fn is_safe_directory(path: &Path) -> bool {
    let text = path.to_string_lossy().replace('\\', "/");
    let text = text.trim();
    if text.is_empty() || text == "/" {
        return false;
    }

    // `C:/` or `C:`
    let bytes = text.as_bytes();
    if bytes.len() <= 3
        && bytes.len() >= 2
        && bytes[0].is_ascii_alphabetic()
        && bytes[1] == b':'
        && bytes.get(2).is_none_or(|b| *b == b'/')
    {
        return false;
    }

    let without_drive = if bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':' {
        &text[2..]
    } else {
        text
    };
    let normalized: PathBuf = Path::new(without_drive)
        .components()
        .filter(|c| !matches!(c, Component::CurDir))
        .collect();

    !PROTECTED_DIRS
        .iter()
        .any(|dir| normalized.starts_with(Path::new(dir)))
}

/// Configuration-persistence collaborator used at the end of a run.
pub trait ConfigStore: Send + Sync {
    fn save(&self, config: &SyncConfig) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct FileConfigStore {
    config_dir: PathBuf,
}

impl FileConfigStore {
    pub fn new(config_dir: impl Into<PathBuf>) -> Self {
        Self {
            config_dir: config_dir.into(),
        }
    }
}

impl ConfigStore for FileConfigStore {
    fn save(&self, config: &SyncConfig) -> Result<()> {
        save_config(&self.config_dir, config)
    }
}

fn atomic_write(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, bytes)?;
    std::fs::rename(tmp, path)?;
    Ok(())
}
