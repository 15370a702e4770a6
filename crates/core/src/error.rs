use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid config: {message}")]
    InvalidConfig { message: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("walkdir error: {0}")]
    Walkdir(#[from] walkdir::Error),

    #[error("failed to start external tool: {message}")]
    ToolSpawn { message: String },

    #[error("{}", tool_exit_message(.code))]
    ToolExit { code: Option<i32> },

    #[error("external tool already running")]
    ToolBusy,

    #[error("cleanup sweep failed: {message}")]
    Cleanup { message: String },

    #[error("sync cancelled")]
    Cancelled,

    #[error("unsupported path (must be UTF-8): {path:?}")]
    NonUtf8Path { path: PathBuf },
}

fn tool_exit_message(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("external tool failed with exit code {code}"),
        None => "external tool terminated by signal".to_string(),
    }
}
