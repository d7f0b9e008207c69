use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum HarvestError {
    #[error("missing config file esri-harvest.json in current directory")]
    MissingConfig,

    #[error("failed to read config file at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("invalid config: {0}")]
    ConfigInvalid(String),

    #[error("catalog request failed: {0}")]
    Http(String),

    #[error("catalog returned status {status}: {message}")]
    HttpStatus { status: u16, message: String },

    #[error("{context}: {message}")]
    Remote { context: String, message: String },

    #[error("unexpected response from {url}: {reason}")]
    MalformedResponse { url: String, reason: String },

    #[error("filesystem error: {0}")]
    Filesystem(String),

    #[error("json error: {0}")]
    Json(String),

    #[error("invalid layer status `{token}` in {path}")]
    InvalidStatus { token: String, path: String },

    #[error("status of {path} cannot move from {from} back to {to}")]
    StatusRegression {
        path: String,
        from: String,
        to: String,
    },

    #[error("unexpected status file name: {0}")]
    StatusFileName(String),

    #[error("layer {name} ({id}) is missing from the layer catalog")]
    MissingCatalogEntry { name: String, id: i64 },

    #[error("broken layer tree in {service}: {reason}")]
    LayerTree { service: String, reason: String },

    #[error("invalid cursor: {0}")]
    InvalidCursor(String),

    #[error("required tool not found: {0}")]
    MissingTool(String),

    #[error("post-processing command failed: {0}")]
    PostProcess(String),
}

impl HarvestError {
    pub fn is_config(&self) -> bool {
        matches!(
            self,
            HarvestError::MissingConfig
                | HarvestError::ConfigRead(_)
                | HarvestError::ConfigParse(_)
                | HarvestError::ConfigInvalid(_)
        )
    }

    pub fn is_remote(&self) -> bool {
        matches!(
            self,
            HarvestError::Http(_)
                | HarvestError::HttpStatus { .. }
                | HarvestError::Remote { .. }
                | HarvestError::MalformedResponse { .. }
        )
    }
}
