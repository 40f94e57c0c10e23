//! Typed errors for workspace operations.

use thiserror::Error;

/// Errors surfaced by workspace operations to the request layer.
#[derive(Debug, Error)]
pub enum WorkspaceError {
    #[error("No files selected")]
    NoFiles,

    #[error("Malformed upload: {0}")]
    MalformedUpload(String),

    #[error("Invalid file path: {0}")]
    InvalidPath(String),

    #[error("Invalid command: {0}")]
    UnknownVerb(String),

    #[error("Invalid session id: {0}")]
    InvalidToken(String),

    #[error("Session not found")]
    NotFound,

    #[error("File not found")]
    FileNotFound,

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl WorkspaceError {
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Validation failures the caller can fix by changing the request.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::NoFiles
                | Self::MalformedUpload(_)
                | Self::InvalidPath(_)
                | Self::UnknownVerb(_)
                | Self::InvalidToken(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, WorkspaceError>;
