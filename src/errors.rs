use std::path::PathBuf;
use thiserror::Error;

use crate::config::Engine;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Cannot reach {engine} server at {address}: {source}")]
    Connection {
        engine: Engine,
        address: String,
        #[source]
        source: sqlx::Error,
    },

    #[error("{engine} server rejected the credentials of user '{user}': {source}")]
    Auth {
        engine: Engine,
        user: String,
        #[source]
        source: sqlx::Error,
    },

    #[error("Failed to list {engine} databases: {source}")]
    Query {
        engine: Engine,
        #[source]
        source: sqlx::Error,
    },

    #[error("{tool} is not available: {reason}")]
    ToolUnavailable { tool: String, reason: String },

    #[error("Command execution failed: {tool} exited with {status}: {stderr}")]
    Command {
        tool: String,
        status: String,
        stderr: String,
    },

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Archive creation failed: {0}")]
    Archive(String),

    #[error("Upload failed: {0}")]
    Upload(String),

    #[error("Another backup run holds the lock file {}", .0.display())]
    Locked(PathBuf),

    #[error("{context}: {source}")]
    Filesystem {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

impl AppError {
    /// Upload failures leave the archive on disk and let the run continue;
    /// everything else aborts the invocation.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, AppError::Upload(_))
    }
}

/// Attaches a description of the attempted filesystem operation to an I/O error.
pub trait IoContext<T> {
    fn fs_context<F: FnOnce() -> String>(self, context: F) -> Result<T>;
}

impl<T> IoContext<T> for std::result::Result<T, std::io::Error> {
    fn fs_context<F: FnOnce() -> String>(self, context: F) -> Result<T> {
        self.map_err(|source| AppError::Filesystem {
            context: context(),
            source,
        })
    }
}

pub type Result<T> = std::result::Result<T, AppError>;
