// file: src/error.rs
// version: 1.0.0
// guid: 8d42b6ef-1a37-4c90-b2e5-7f61d3a8c094

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for the build engine
pub type Result<T> = std::result::Result<T, FledgeError>;

/// Error types for the fledge build engine
#[derive(Debug, Error)]
pub enum FledgeError {
    #[error("Configuration error: {field}: {reason}")]
    Config { field: String, reason: String },

    #[error("Source file does not exist: {0}")]
    MissingSource(PathBuf),

    #[error("Network operation failed: {0}")]
    Network(String),

    #[error("Release registry returned status {status}: {detail}")]
    Registry { status: u16, detail: String },

    #[error("Checksum mismatch:\n  expected: {expected}\n  got:      {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("Agent binary not found in release {0}")]
    AgentNotFound(String),

    #[error("Image not found: {0}")]
    ImageNotFound(String),

    #[error("Failed to unpack OCI image: {0}")]
    UnpackFailed(String),

    #[error("Dockerfile builds require a registered builder")]
    DockerfileUnsupported,

    #[error("Symlink {link} points outside the rootfs: {target}")]
    UnsafeSymlink { link: PathBuf, target: String },

    #[error("{tool} failed with exit status {status}: {output}")]
    ToolFailure {
        tool: String,
        status: i32,
        output: String,
    },

    #[error("Build cancelled")]
    Cancelled,

    #[error("{step} failed: {source}")]
    Step {
        step: String,
        #[source]
        source: Box<FledgeError>,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl FledgeError {
    /// Shorthand for a configuration error with a field and reason.
    pub fn config(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Config {
            field: field.into(),
            reason: reason.into(),
        }
    }
}
