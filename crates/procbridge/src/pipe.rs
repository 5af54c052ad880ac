//! The three standard stream pipe pairs of a session.
//!
//! Pipes are opened when the session is initialized. At start the
//! session-facing ends go to the workers and duplicates of the child-facing
//! ends go to the child; the session keeps the originals in [`ChildEnds`]
//! until the exit waiter drops them.

use std::fmt;
use std::os::fd::OwnedFd;
use std::process::Stdio;

use nix::fcntl::OFlag;
use nix::unistd::pipe2;
use tokio::net::unix::pipe;

use crate::error::{Error, Result};

/// Standard stream a pipe or worker is bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    Stdin,
    Stdout,
    Stderr,
}

impl Stream {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Stdin => "stdin",
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
        }
    }
}

impl fmt::Display for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn cloexec_pipe(stream: Stream) -> Result<(OwnedFd, OwnedFd)> {
    pipe2(OFlag::O_CLOEXEC).map_err(|e| Error::pipe(stream.as_str(), e.into()))
}

/// All three pipe pairs, as allocated by session initialization.
#[derive(Debug)]
pub struct PipeSet {
    stdin_read: OwnedFd,
    stdin_write: OwnedFd,
    stdout_read: OwnedFd,
    stdout_write: OwnedFd,
    stderr_read: OwnedFd,
    stderr_write: OwnedFd,
}

impl PipeSet {
    pub fn open() -> Result<Self> {
        let (stdin_read, stdin_write) = cloexec_pipe(Stream::Stdin)?;
        let (stdout_read, stdout_write) = cloexec_pipe(Stream::Stdout)?;
        let (stderr_read, stderr_write) = cloexec_pipe(Stream::Stderr)?;
        Ok(Self {
            stdin_read,
            stdin_write,
            stdout_read,
            stdout_write,
            stderr_read,
            stderr_write,
        })
    }

    /// Split into the session-facing and child-facing halves.
    pub fn split(self) -> (SessionEnds, ChildEnds) {
        (
            SessionEnds {
                stdin: self.stdin_write,
                stdout: self.stdout_read,
                stderr: self.stderr_read,
            },
            ChildEnds {
                stdin: Some(self.stdin_read),
                stdout: Some(self.stdout_write),
                stderr: Some(self.stderr_write),
            },
        )
    }
}

/// Ends driven by the relay workers.
#[derive(Debug)]
pub struct SessionEnds {
    stdin: OwnedFd,
    stdout: OwnedFd,
    stderr: OwnedFd,
}

/// Async pipe handles registered with the runtime reactor.
pub struct WorkerPipes {
    pub stdin: pipe::Sender,
    pub stdout: pipe::Receiver,
    pub stderr: pipe::Receiver,
}

impl SessionEnds {
    /// Register the ends with the tokio reactor. Must run inside a runtime.
    pub fn into_async(self) -> Result<WorkerPipes> {
        Ok(WorkerPipes {
            stdin: pipe::Sender::from_owned_fd(self.stdin)
                .map_err(|e| Error::pipe(Stream::Stdin.as_str(), e))?,
            stdout: pipe::Receiver::from_owned_fd(self.stdout)
                .map_err(|e| Error::pipe(Stream::Stdout.as_str(), e))?,
            stderr: pipe::Receiver::from_owned_fd(self.stderr)
                .map_err(|e| Error::pipe(Stream::Stderr.as_str(), e))?,
        })
    }
}

/// Ends wired to the child's standard streams.
#[derive(Debug)]
pub struct ChildEnds {
    pub(crate) stdin: Option<OwnedFd>,
    pub(crate) stdout: Option<OwnedFd>,
    pub(crate) stderr: Option<OwnedFd>,
}

/// Duplicated child-facing ends, consumed by the spawned command.
pub struct ChildStdio {
    pub stdin: Stdio,
    pub stdout: Stdio,
    pub stderr: Stdio,
}

impl ChildEnds {
    /// Duplicate the ends for handing to the child process image.
    pub fn stdio(&self) -> Result<ChildStdio> {
        Ok(ChildStdio {
            stdin: Stdio::from(dup_end(self.stdin.as_ref(), Stream::Stdin)?),
            stdout: Stdio::from(dup_end(self.stdout.as_ref(), Stream::Stdout)?),
            stderr: Stdio::from(dup_end(self.stderr.as_ref(), Stream::Stderr)?),
        })
    }

    /// Close every end still held, in the order stdin, stdout, stderr.
    ///
    /// Returns how many ends were actually closed; calling it again is a
    /// no-op.
    pub fn close(&mut self) -> usize {
        [
            self.stdin.take(),
            self.stdout.take(),
            self.stderr.take(),
        ]
        .into_iter()
        .flatten()
        .map(drop)
        .count()
    }
}

fn dup_end(fd: Option<&OwnedFd>, stream: Stream) -> Result<OwnedFd> {
    let fd = fd.ok_or_else(|| {
        Error::pipe(
            stream.as_str(),
            std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe end already closed"),
        )
    })?;
    fd.try_clone().map_err(|e| Error::pipe(stream.as_str(), e))
}
