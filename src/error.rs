//! Error types for scenario sandboxes.

use std::path::PathBuf;
use thiserror::Error;

/// Top-level error type for sandbox operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Failed to allocate the sandbox directory.
    #[error("failed to create sandbox: {0}")]
    SandboxCreation(String),

    /// IO error while touching a path inside the sandbox.
    #[error("IO error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The path is absolute or escapes the sandbox.
    #[error("invalid sandbox path: {0}")]
    InvalidPath(PathBuf),

    /// `patch` could not find its search text.
    #[error("pattern {search:?} not found in {path}; current content:\n{content}")]
    PatternNotFound {
        path: PathBuf,
        search: String,
        content: String,
    },

    /// A command exited with a non-zero status.
    ///
    /// `output` is stdout followed by stderr, exactly as captured.
    #[error("command `{command}` failed with exit code {code:?}:\n{output}")]
    CommandFailed {
        command: String,
        code: Option<i32>,
        output: String,
    },

    /// The command could not be started at all.
    #[error("failed to start `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    /// A started process could not be observed to completion.
    #[error("process `{command}`: {reason}")]
    Process { command: String, reason: String },

    /// The packaged artifact scenarios install from has not been built.
    #[error(
        "distributable package not found at {path}; build and pack the project before running sandbox scenarios"
    )]
    MissingDistributable { path: PathBuf },

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::Io {
            path: path.into(),
            source,
        }
    }

    /// Returns the combined output of a failed command, if this is one.
    pub fn command_output(&self) -> Option<&str> {
        match self {
            Error::CommandFailed { output, .. } => Some(output),
            _ => None,
        }
    }
}

/// Result type alias for sandbox operations.
pub type Result<T> = std::result::Result<T, Error>;
