//! Error taxonomy of the transfer engine
//!
//! Every failure the engine can observe is classified up front as either *recoverable* (transient
//! network trouble that warrants a reconnect and another attempt) or *non-recoverable* (surfaced as
//! a failed result right away). Application-level plumbing (CLI, reading files) keeps using
//! `anyhow::Result` and only meets these variants wrapped with context.

use std::path::PathBuf;

/// Coarse error class, used in structured log events and in transfer results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum ErrorClass {
    Auth,
    Connect,
    Protocol,
    Timeout,
    Discovery,
    RemotePath,
    LocalIo,
    Config,
    Cancelled,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("authentication failed for server '{server}': {message}")]
    Auth { server: String, message: String },

    #[error("failed to connect to server '{server}': {message}")]
    Connect { server: String, message: String },

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("failed listing '{path}' on server '{server}': {message}")]
    Discovery {
        server: String,
        path: String,
        message: String,
    },

    #[error("remote path '{path}' is not accessible: {message}")]
    RemotePath { path: String, message: String },

    #[error("local I/O error on {path:?}: {source}")]
    LocalIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("operation cancelled")]
    Cancelled,
}

impl Error {
    pub fn local_io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::LocalIo {
            path: path.into(),
            source,
        }
    }

    #[must_use]
    pub fn class(&self) -> ErrorClass {
        match self {
            Error::Auth { .. } => ErrorClass::Auth,
            Error::Connect { .. } => ErrorClass::Connect,
            Error::Protocol(_) => ErrorClass::Protocol,
            Error::Timeout(_) => ErrorClass::Timeout,
            Error::Discovery { .. } => ErrorClass::Discovery,
            Error::RemotePath { .. } => ErrorClass::RemotePath,
            Error::LocalIo { .. } => ErrorClass::LocalIo,
            Error::Config(_) => ErrorClass::Config,
            Error::Cancelled => ErrorClass::Cancelled,
        }
    }

    /// Transient failures: the session is torn down and the attempt repeated after a backoff.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::Connect { .. } | Error::Protocol(_) | Error::Timeout(_)
        )
    }
}
