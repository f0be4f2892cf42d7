use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, DupemapError>;

#[derive(Debug, Error)]
pub enum DupemapError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("could not determine config directory")]
    NoConfigDir,

    #[error("failed to read config at {0}: {1}")]
    ConfigIo(PathBuf, #[source] std::io::Error),

    #[error("failed to parse config at {0}: {1}")]
    ConfigParse(PathBuf, #[source] toml::de::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("remote store: {0}")]
    Remote(#[from] RemoteError),

    #[error("batch of {size} requests failed after {attempts} attempts: {source}")]
    BatchExhausted {
        size: usize,
        attempts: u32,
        #[source]
        source: RemoteError,
    },

    #[error("listing failed and no cached listing is available: {0}")]
    ListingFailed(#[source] RemoteError),

    #[error("CSV export error: {0}")]
    Csv(#[from] csv::Error),

    #[error("failed to read answer: {0}")]
    Prompt(#[source] std::io::Error),
}

/// Whether a remote failure is worth retrying.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Network hiccup, throttling, server-side error.
    Transient,
    /// The request itself is wrong (not found, forbidden, bad input).
    Terminal,
}

/// A failure reported by the remote store transport, per request or per batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteError {
    pub kind: ErrorKind,
    pub message: String,
}

impl RemoteError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Transient,
            message: message.into(),
        }
    }

    pub fn terminal(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Terminal,
            message: message.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind == ErrorKind::Transient
    }

    /// Classify an HTTP status: throttling and server errors are retryable.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        if status == 429 || status >= 500 {
            Self::transient(message)
        } else {
            Self::terminal(message)
        }
    }
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.kind {
            ErrorKind::Transient => "transient",
            ErrorKind::Terminal => "terminal",
        };
        write!(f, "{} ({kind})", self.message)
    }
}

impl std::error::Error for RemoteError {}
