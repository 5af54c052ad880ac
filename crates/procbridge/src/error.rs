//! Error types for `procbridge`.
//!
//! The session keeps the last error it recorded and hands out copies of it,
//! so [`Error`] is `Clone`; I/O sources are shared through an [`Arc`].

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use nix::sys::signal::Signal;
use thiserror::Error;

/// Result type alias using the `procbridge` [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Errors reported by sessions, attribute builders and configuration loading.
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// The working directory or the program argument is unusable.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The working directory cannot be accessed.
    #[error("Working directory {} is not accessible: {source}", path.display())]
    WorkingDirectory {
        path: PathBuf,
        #[source]
        source: Arc<io::Error>,
    },

    /// The program could not be found on the search path.
    #[error("Failed to resolve program {program:?}: {reason}")]
    Resolution { program: String, reason: String },

    /// `start` was called while a child is still active.
    #[error("Process already running, reset the session before reusing it")]
    AlreadyRunning,

    /// A lifecycle operation was called without an active child.
    #[error("Process not started")]
    NotStarted,

    /// The pipes of the previous run were consumed and need to be reallocated.
    #[error("Session already used, reset it before starting again")]
    ResetRequired,

    /// Creating or registering a standard stream pipe failed.
    #[error("Failed to set up {stream} pipe: {source}")]
    Pipe {
        stream: &'static str,
        #[source]
        source: Arc<io::Error>,
    },

    /// The OS refused to start the program.
    #[error("Failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: Arc<io::Error>,
    },

    /// Waiting for the child to exit failed.
    #[error("Failed waiting for process {pid}: {source}")]
    Wait {
        pid: u32,
        #[source]
        source: Arc<io::Error>,
    },

    /// Delivering a signal to the child failed.
    #[error("Failed to send {signal} to process {pid}: {source}")]
    Signal {
        pid: u32,
        signal: Signal,
        #[source]
        source: nix::errno::Errno,
    },

    /// Killing the child failed.
    #[error("Failed to kill process {pid}: {source}")]
    Kill {
        pid: u32,
        #[source]
        source: Arc<io::Error>,
    },

    /// The child handle was released before an exit status was collected.
    #[error("Process handle released before exit status was collected")]
    Released,

    /// A user or group name could not be translated into an identifier.
    #[error("Failed to look up {kind} {name:?}: {reason}")]
    Lookup {
        kind: &'static str,
        name: String,
        reason: String,
    },

    /// Session configuration could not be loaded or is invalid.
    #[error("Config error: {0}")]
    Config(String),
}

impl Error {
    pub(crate) fn pipe(stream: &'static str, source: io::Error) -> Self {
        Self::Pipe {
            stream,
            source: Arc::new(source),
        }
    }

    /// Whether this error means "no child to operate on".
    ///
    /// Escalation and `start_and_wait` treat it as "already exited".
    pub const fn is_not_started(&self) -> bool {
        matches!(self, Self::NotStarted)
    }
}
