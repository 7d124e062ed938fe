use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ReleaseError {
    #[error("Provisioning build tools failed: {0}")]
    ProvisionFailed(String),

    #[error("Dependency cache unavailable: {0}")]
    CacheUnavailable(String),

    #[error("Dependency fetch failed: {0}")]
    FetchFailed(String),

    #[error("Toolchain version report failed: {0}")]
    ToolchainUnavailable(String),

    #[error("Test suite failed: {0}")]
    TestFailed(String),

    #[error("Release compilation failed: {0}")]
    CompileFailed(String),

    #[error("Compiled artifact not found at {}", .0.display())]
    ArtifactMissing(PathBuf),

    #[error("Runtime image contains unexpected content: {0}")]
    ImageContaminated(String),

    #[error("Authentication to the remote build service failed: {0}")]
    AuthFailed(String),

    #[error("Remote build tool version mismatch: expected {expected}, found {found}")]
    ToolVersionMismatch { expected: String, found: String },

    #[error("Remote build dispatch failed: {0}")]
    DispatchFailed(String),

    #[error("Remote build {id} finished with status {status}")]
    RemoteBuildFailed { id: String, status: String },

    #[error("API request failed with status {status}: {message}")]
    ApiError { status: u16, message: String },

    #[error("Invalid push event: {0}")]
    InvalidEvent(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML serialization error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ReleaseError>;
