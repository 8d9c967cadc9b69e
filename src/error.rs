//! Error taxonomy and the normalizer applied around model calls.

use std::path::PathBuf;

use thiserror::Error;
use tracing::error;

use crate::response::ResponseStream;

/// Result type alias for snkr operations.
pub type Result<T> = std::result::Result<T, SnkrError>;

/// Shown when the provider rejects a prompt as off-topic.
pub const OFF_TOPIC_APOLOGY: &str = "I'm sorry, I can only explain computer science concepts.";

const OFF_TOPIC_MARKER: &str = "off_topic";

#[derive(Error, Debug)]
pub enum SnkrError {
    #[error("No open folder in the workspace")]
    NoWorkspace,

    #[error("{} file not found in the workspace", path.display())]
    ManifestNotFound { path: PathBuf },

    #[error("Failed to parse {}: {source}", path.display())]
    ManifestParse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    /// A required table along the dependency path is missing or has the wrong type.
    #[error("{} has no `{key}` table", path.display())]
    ManifestShape { path: PathBuf, key: String },

    #[error("Failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Provider-reported failure: consent, quota, content policy, unknown model.
    #[error("Language model error ({code}): {message}")]
    ModelCapability {
        message: String,
        code: String,
        cause: Option<String>,
    },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Template error: {0}")]
    Template(#[from] minijinja::Error),

    #[error("Failed to decode model response: {0}")]
    Decode(#[from] serde_json::Error),
}

impl SnkrError {
    /// True for a capability error whose cause reports an off-topic rejection.
    pub fn is_off_topic(&self) -> bool {
        match self {
            SnkrError::ModelCapability {
                cause: Some(cause), ..
            } => cause.contains(OFF_TOPIC_MARKER),
            _ => false,
        }
    }
}

/// How a failed model call was resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// The apology was written to the stream.
    Declined,
    /// Logged only; the user sees nothing.
    Swallowed,
}

/// Classify an error raised around the model call.
///
/// Capability errors are absorbed: off-topic rejections produce the fixed
/// apology, everything else is logged. Any other error is handed back to the
/// caller unchanged.
pub fn handle_error(err: SnkrError, stream: &mut dyn ResponseStream) -> Result<Disposition> {
    if let SnkrError::ModelCapability {
        message,
        code,
        cause,
    } = &err
    {
        error!(%message, %code, cause = ?cause, "Language model request failed");
        if err.is_off_topic() {
            stream.markdown(OFF_TOPIC_APOLOGY);
            return Ok(Disposition::Declined);
        }
        return Ok(Disposition::Swallowed);
    }
    Err(err)
}
