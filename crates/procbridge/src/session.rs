//! Session lifecycle controller.
//!
//! A [`Session`] owns everything one process execution needs: the pipes
//! opened at initialization, the accumulation buffers and the handles of the
//! current run. `start` hands most of that to the run's tasks; `reset` brings
//! the session back to its freshly constructed state.
//!
//! Exclusivity is a single `tokio::sync::Mutex<()>`. `start` only ever
//! *tries* to take it, the exit waiter holds it until teardown completes, and
//! `wait`/`reset` queue on it.

use std::path::Path;
use std::process::ExitStatus;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::Bytes;
use nix::sys::signal::Signal;
use tokio::process::{Child, Command};
use tokio::sync::{OwnedMutexGuard, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::attributes::ProcessAttributes;
use crate::config::SessionConfig;
use crate::control::ProcessControl;
use crate::error::{Error, Result};
use crate::escalation::{self, Terminate};
use crate::multiplexer::{Attachment, Buffers, Multiplexer, Queues};
use crate::pipe::{ChildEnds, PipeSet, Stream};
use crate::relay::{Chunk, spawn_confirmed};
use crate::state::{ActiveRun, DebugFlag, RunRecord, SharedRecord};
use crate::waiter::{ExitWaiter, Workers};
use crate::worker::{self, WorkerTokens};

/// Per-initialization resources, replaced wholesale by `reset`.
#[derive(Debug)]
struct Slots {
    init_error: Option<Error>,
    pipes: Option<PipeSet>,
    buffers: Buffers,
    wake_tx: mpsc::Sender<()>,
    wake_rx: Option<mpsc::Receiver<()>>,
    stdin_source: Option<mpsc::Receiver<Chunk>>,
    stdout_mirror: Option<mpsc::Sender<Chunk>>,
    stderr_mirror: Option<mpsc::Sender<Chunk>>,
}

/// What a run takes out of [`Slots`].
struct RunResources {
    pipes: PipeSet,
    buffers: Buffers,
    wake: mpsc::Receiver<()>,
    stdin_source: Option<mpsc::Receiver<Chunk>>,
    stdout_mirror: Option<mpsc::Sender<Chunk>>,
    stderr_mirror: Option<mpsc::Sender<Chunk>>,
}

impl Slots {
    fn open(config: &SessionConfig) -> Self {
        let (pipes, init_error) = match config.validate().and_then(|()| PipeSet::open()) {
            Ok(pipes) => (Some(pipes), None),
            Err(e) => {
                warn!(error = %e, "Session initialization failed");
                (None, Some(e))
            }
        };
        let (wake_tx, wake_rx) = mpsc::channel(1);
        Self {
            init_error,
            pipes,
            buffers: Buffers::default(),
            wake_tx,
            wake_rx: Some(wake_rx),
            stdin_source: None,
            stdout_mirror: None,
            stderr_mirror: None,
        }
    }

    fn take_run(&mut self) -> Option<RunResources> {
        let (Some(pipes), Some(wake)) = (self.pipes.take(), self.wake_rx.take()) else {
            return None;
        };
        Some(RunResources {
            pipes,
            buffers: self.buffers.clone(),
            wake,
            stdin_source: self.stdin_source.take(),
            stdout_mirror: self.stdout_mirror.take(),
            stderr_mirror: self.stderr_mirror.take(),
        })
    }
}

/// Handle to one launchable child process and its relayed standard streams.
#[derive(Debug)]
pub struct Session {
    attributes: ProcessAttributes,
    config: SessionConfig,
    debug: DebugFlag,
    run_lock: Arc<tokio::sync::Mutex<()>>,
    record: SharedRecord,
    slots: Mutex<Slots>,
}

impl Default for Session {
    fn default() -> Self {
        Self::new(ProcessAttributes::default())
    }
}

impl Session {
    /// Create a session with the default [`SessionConfig`].
    pub fn new(attributes: ProcessAttributes) -> Self {
        Self::with_config(attributes, SessionConfig::default())
    }

    /// Create a session. Initialization failures (invalid config, pipe
    /// allocation) are recorded and returned by the first `start`.
    pub fn with_config(attributes: ProcessAttributes, config: SessionConfig) -> Self {
        let slots = Slots::open(&config);
        let record = SharedRecord::default();
        record.lock().error.clone_from(&slots.init_error);
        Self {
            attributes,
            config,
            debug: DebugFlag::default(),
            run_lock: Arc::new(tokio::sync::Mutex::new(())),
            record,
            slots: Mutex::new(slots),
        }
    }

    pub const fn attributes(&self) -> &ProcessAttributes {
        &self.attributes
    }

    pub const fn config(&self) -> &SessionConfig {
        &self.config
    }

    fn slots(&self) -> MutexGuard<'_, Slots> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn capacity(&self) -> usize {
        self.config.queue_capacity.max(1)
    }

    // -- lifecycle -------------------------------------------------------

    /// Launch `program` with `args` and return without waiting for it.
    ///
    /// `program` is resolved on the search path. The run is cancelled, and
    /// the child killed, when `cancel` (if given) is cancelled.
    pub async fn start<I, S>(
        &self,
        cancel: Option<&CancellationToken>,
        program: &str,
        args: I,
    ) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let Ok(run_guard) = Arc::clone(&self.run_lock).try_lock_owned() else {
            if self.debug.is_on() {
                debug!(program, "Start rejected, a process is already running");
            }
            return Err(Error::AlreadyRunning);
        };
        let args: Vec<String> = args.into_iter().map(Into::into).collect();

        let result = self.launch(run_guard, cancel, program, args).await;
        if let Err(e) = &result {
            warn!(program, error = %e, "Failed to start process");
            // A finished run's outcome stays readable until `reset`.
            if !matches!(e, Error::ResetRequired) {
                self.record.lock().error = Some(e.clone());
            }
        }
        result
    }

    /// [`start`](Self::start) followed by waiting for the run to complete.
    pub async fn start_and_wait<I, S>(
        &self,
        cancel: Option<&CancellationToken>,
        program: &str,
        args: I,
    ) -> Result<ExitStatus>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.start(cancel, program, args).await?;
        self.join_run().await
    }

    /// Wait until the current run is torn down and return its exit status.
    ///
    /// Fails with [`Error::NotStarted`] when nothing was launched since the
    /// session was (re)initialized. Waiting on a run that already finished
    /// returns its recorded outcome again.
    pub async fn wait(&self) -> Result<ExitStatus> {
        if !self.record.lock().launched {
            return Err(Error::NotStarted);
        }
        self.join_run().await
    }

    async fn join_run(&self) -> Result<ExitStatus> {
        drop(self.run_lock.lock().await);
        let record = self.record.lock();
        match (&record.error, record.exit_status) {
            (Some(err), _) => Err(err.clone()),
            (None, Some(status)) => Ok(status),
            (None, None) => Err(Error::Released),
        }
    }

    #[allow(clippy::too_many_lines)]
    async fn launch(
        &self,
        run_guard: OwnedMutexGuard<()>,
        cancel: Option<&CancellationToken>,
        program: &str,
        args: Vec<String>,
    ) -> Result<()> {
        {
            let slots = self.slots();
            if let Some(err) = slots.init_error.clone() {
                return Err(err);
            }
            if slots.pipes.is_none() {
                return Err(Error::ResetRequired);
            }
        }

        self.attributes.check_working_directory()?;
        if program.is_empty() {
            return Err(Error::Configuration("no program specified".into()));
        }
        let resolved = which::which(program).map_err(|e| Error::Resolution {
            program: program.to_string(),
            reason: e.to_string(),
        })?;

        let resources = self.slots().take_run().ok_or(Error::ResetRequired)?;
        self.record.lock().exit_status = None;
        let (session_ends, mut child_ends) = resources.pipes.split();
        let pipes = session_ends.into_async()?;

        let mut command = Vec::with_capacity(args.len() + 1);
        command.push(resolved.to_string_lossy().into_owned());
        command.extend(args);
        self.record.lock().command.clone_from(&command);

        let capacity = self.capacity();
        let chunk_size = self.config.chunk_size;
        let tokens = WorkerTokens::default();
        let (stdin_tx, stdin_rx) = mpsc::channel(capacity);
        let (stdout_tx, stdout_rx) = mpsc::channel(capacity);
        let (stderr_tx, stderr_rx) = mpsc::channel(capacity);

        // Workers confirm in sequence: writer, stdout reader, stderr reader.
        let writer =
            spawn_confirmed(|s| worker::write_input(pipes.stdin, stdin_rx, tokens.clone(), s))
                .await;
        let stdout_reader = spawn_confirmed(|s| {
            worker::read_output(
                Stream::Stdout,
                pipes.stdout,
                stdout_tx,
                chunk_size,
                tokens.detach.clone(),
                s,
            )
        })
        .await;
        let stderr_reader = spawn_confirmed(|s| {
            worker::read_output(
                Stream::Stderr,
                pipes.stderr,
                stderr_tx,
                chunk_size,
                tokens.detach.clone(),
                s,
            )
        })
        .await;
        let workers = Workers {
            writer,
            stdout_reader,
            stderr_reader,
        };

        let child = match self.spawn_child(&resolved, &command[1..], &child_ends) {
            Ok(child) => child,
            Err(e) => {
                tokens.close_stdin.cancel();
                drop(stdin_tx);
                child_ends.close();
                workers.join().await;
                return Err(e);
            }
        };
        let pid = child.id().unwrap_or_default();

        let (control, requests) = ProcessControl::channel(pid);
        let (attach_tx, attach_rx) = mpsc::unbounded_channel();
        {
            let mut record = self.record.lock();
            record.error = None;
            record.launched = true;
            record.detach = Some(tokens.detach.clone());
            record.active = Some(ActiveRun {
                control: control.clone(),
                attach: attach_tx,
            });
        }

        let run_cancel = cancel.map_or_else(CancellationToken::new, CancellationToken::child_token);
        let multiplexer = Multiplexer {
            cancel: run_cancel.clone(),
            queues: Queues {
                stdin: stdin_tx,
                stdout: stdout_rx,
                stderr: stderr_rx,
                wake: resources.wake,
                attach: attach_rx,
                stdin_source: resources.stdin_source,
                stdout_mirror: resources.stdout_mirror,
                stderr_mirror: resources.stderr_mirror,
            },
            buffers: resources.buffers,
            control,
            record: self.record.clone(),
            chunk_size,
            stage_limit: capacity,
            debug: self.debug.clone(),
        };
        let multiplexer = spawn_confirmed(|s| multiplexer.run(s)).await;

        let waiter = ExitWaiter {
            child,
            pid,
            requests,
            cancel: run_cancel,
            tokens,
            child_ends,
            workers,
            multiplexer,
            record: self.record.clone(),
            debug: self.debug.clone(),
            run_guard,
        };
        // The waiter's handle is not kept; completion is observed via the run lock.
        drop(spawn_confirmed(|s| waiter.run(s)).await);

        if self.debug.is_on() {
            debug!(pid, command = ?command, "Process started");
        }
        Ok(())
    }

    /// Build and spawn the child. The command, and with it the duplicated
    /// pipe ends, is dropped before returning.
    fn spawn_child(
        &self,
        program: &Path,
        args: &[String],
        child_ends: &ChildEnds,
    ) -> Result<Child> {
        let stdio = child_ends.stdio()?;
        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(stdio.stdin)
            .stdout(stdio.stdout)
            .stderr(stdio.stderr);
        self.attributes.apply(&mut cmd)?;
        cmd.spawn().map_err(|e| Error::Spawn {
            program: program.display().to_string(),
            source: e.into(),
        })
    }

    fn control(&self) -> Result<ProcessControl> {
        self.record
            .active()
            .map(|active| active.control)
            .ok_or(Error::NotStarted)
    }

    /// Deliver `sig` to the running child.
    pub async fn signal(&self, sig: Signal) -> Result<()> {
        let control = self.control()?;
        if self.debug.is_on() {
            debug!(pid = control.pid(), %sig, "Signalling process");
        }
        control.signal(sig).await
    }

    /// Force-kill the running child.
    pub async fn kill(&self) -> Result<()> {
        let control = self.control()?;
        if self.debug.is_on() {
            debug!(pid = control.pid(), "Killing process");
        }
        control.kill().await
    }

    /// Give up the child handle without waiting for the process to exit.
    ///
    /// The run is torn down without collecting an exit status; `wait` then
    /// reports [`Error::Released`].
    pub async fn release(&self) -> Result<()> {
        let control = self.control()?;
        if self.debug.is_on() {
            debug!(pid = control.pid(), "Releasing process");
        }
        control.release().await
    }

    /// Terminate any running child and return the session to the state of a
    /// freshly constructed one. Attributes and config are kept; debug mode is
    /// switched off.
    pub async fn reset(&self) {
        if let Some(pid) = self.pid() {
            if self.debug.is_on() {
                debug!(pid, "Resetting session with a running process");
            }
            escalation::terminate(self, &self.config.escalation).await;
        }

        // The child is gone or released. Stop reading pipes that a surviving
        // grandchild may still hold open, so teardown can complete.
        let detach = self.record.lock().detach.take();
        if let Some(detach) = detach {
            detach.cancel();
        }

        let _run_guard = self.run_lock.lock().await;
        self.debug.set(false);
        let slots = Slots::open(&self.config);
        *self.record.lock() = RunRecord {
            error: slots.init_error.clone(),
            ..RunRecord::default()
        };
        *self.slots() = slots;
    }

    // -- I/O ---------------------------------------------------------------

    /// Queue bytes for the child's stdin. Bytes submitted before `start` are
    /// forwarded as soon as the child runs.
    pub fn stdin(&self, data: &[u8]) {
        let slots = self.slots();
        slots.buffers.stdin.append(data);
        let _ = slots.wake_tx.try_send(());
    }

    /// Forward every chunk received on `source` to the child's stdin.
    ///
    /// Replaces a previously registered source. Ordering relative to
    /// [`stdin`](Self::stdin) is not defined.
    pub fn stdin_source(&self, source: mpsc::Receiver<Chunk>) {
        self.attach(Attachment::StdinSource(source));
    }

    /// Everything the child wrote to stdout so far.
    pub fn stdout(&self) -> Bytes {
        self.slots().buffers.stdout.snapshot()
    }

    /// Everything the child wrote to stderr so far.
    pub fn stderr(&self) -> Bytes {
        self.slots().buffers.stderr.snapshot()
    }

    /// Live copy of stdout. Replaces (and closes) any earlier stdout mirror.
    pub fn stdout_mirror(&self) -> mpsc::Receiver<Chunk> {
        let (tx, rx) = mpsc::channel(self.capacity());
        self.attach(Attachment::StdoutMirror(tx));
        rx
    }

    /// Live copy of stderr. Replaces (and closes) any earlier stderr mirror.
    pub fn stderr_mirror(&self) -> mpsc::Receiver<Chunk> {
        let (tx, rx) = mpsc::channel(self.capacity());
        self.attach(Attachment::StderrMirror(tx));
        rx
    }

    /// Hand a registration to the running multiplexer, or keep it for the
    /// next start.
    fn attach(&self, attachment: Attachment) {
        let attachment = match self.record.active() {
            Some(active) => match active.attach.send(attachment) {
                Ok(()) => return,
                Err(mpsc::error::SendError(attachment)) => attachment,
            },
            None => attachment,
        };
        let mut slots = self.slots();
        match attachment {
            Attachment::StdoutMirror(tx) => slots.stdout_mirror = Some(tx),
            Attachment::StderrMirror(tx) => slots.stderr_mirror = Some(tx),
            Attachment::StdinSource(rx) => slots.stdin_source = Some(rx),
        }
    }

    // -- inspection --------------------------------------------------------

    /// PID of the running child, `None` when nothing is running.
    pub fn pid(&self) -> Option<u32> {
        self.record.active().map(|active| active.control.pid())
    }

    pub fn is_running(&self) -> bool {
        self.pid().is_some()
    }

    /// Resolved program path followed by the arguments of the last start.
    pub fn command(&self) -> Vec<String> {
        self.record.lock().command.clone()
    }

    /// Last recorded error.
    pub fn error(&self) -> Option<Error> {
        self.record.lock().error.clone()
    }

    pub fn set_debug(&self, on: bool) {
        self.debug.set(on);
    }

    pub fn is_debug(&self) -> bool {
        self.debug.is_on()
    }
}

impl Terminate for Session {
    fn is_running(&self) -> bool {
        Self::is_running(self)
    }

    async fn signal(&self, sig: Signal) -> Result<()> {
        Self::signal(self, sig).await
    }

    async fn kill(&self) -> Result<()> {
        Self::kill(self).await
    }

    async fn release(&self) -> Result<()> {
        Self::release(self).await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::time::Duration;

    const NO_ARGS: [&str; 0] = [];

    #[tokio::test]
    async fn fresh_session_is_idle() {
        let session = Session::default();
        assert_eq!(session.pid(), None);
        assert!(session.command().is_empty());
        assert!(session.error().is_none());
        assert!(session.stdout().is_empty());
        assert!(session.wait().await.unwrap_err().is_not_started());
        assert!(session.kill().await.unwrap_err().is_not_started());
        assert!(
            session
                .signal(Signal::SIGTERM)
                .await
                .unwrap_err()
                .is_not_started()
        );
        assert!(session.release().await.unwrap_err().is_not_started());
    }

    #[tokio::test]
    async fn invalid_config_is_reported_by_start() {
        let config = SessionConfig {
            queue_capacity: 0,
            ..SessionConfig::default()
        };
        let session = Session::with_config(ProcessAttributes::default(), config);
        assert!(matches!(session.error(), Some(Error::Config(_))));

        let err = session.start(None, "true", NO_ARGS).await.unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        // Mirrors can still be requested without panicking.
        drop(session.stdout_mirror());
    }

    #[tokio::test]
    async fn empty_program_is_configuration_error() {
        let session = Session::default();
        let err = session.start(None, "", NO_ARGS).await.unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
        assert!(matches!(session.error(), Some(Error::Configuration(_))));
    }

    #[tokio::test]
    async fn missing_working_directory_prevents_start() {
        let dir = tempfile::tempdir().unwrap();
        let attrs = ProcessAttributes::builder()
            .working_directory(dir.path().join("missing"))
            .build();
        let session = Session::new(attrs);

        let err = session.start(None, "true", NO_ARGS).await.unwrap_err();
        assert!(matches!(err, Error::WorkingDirectory { .. }));
        assert_eq!(session.pid(), None);
    }

    #[tokio::test]
    async fn second_run_requires_reset() {
        let session = Session::default();
        session.start_and_wait(None, "sh", ["-c", "echo first"]).await.unwrap();

        let err = session.start(None, "true", NO_ARGS).await.unwrap_err();
        assert!(matches!(err, Error::ResetRequired));

        // The rejected start leaves the finished run's outcome in place.
        assert!(session.wait().await.unwrap().success());
        assert!(session.error().is_none());
        assert_eq!(session.stdout(), "first\n");
        assert!(session.command()[0].ends_with("sh"));

        session.reset().await;
        let status = session.start_and_wait(None, "true", NO_ARGS).await.unwrap();
        assert!(status.success());
    }

    #[tokio::test]
    async fn wait_after_exit_returns_recorded_status() {
        let session = Session::default();
        session.start(None, "sh", ["-c", "exit 3"]).await.unwrap();

        let first = session.wait().await.unwrap();
        let again = session.wait().await.unwrap();
        assert_eq!(first.code(), Some(3));
        assert_eq!(again.code(), Some(3));
        assert_eq!(session.pid(), None);
    }

    #[tokio::test]
    async fn stdout_and_stderr_are_separated() {
        let session = Session::default();
        let status = session
            .start_and_wait(None, "sh", ["-c", "printf out; printf err >&2"])
            .await
            .unwrap();
        assert!(status.success());
        assert_eq!(session.stdout(), "out");
        assert_eq!(session.stderr(), "err");
    }

    #[tokio::test]
    async fn environment_replaces_inherited_one() {
        let attrs = ProcessAttributes::builder()
            .environment(["PROCBRIDGE_TEST=visible"])
            .build();
        let session = Session::new(attrs);
        session
            .start_and_wait(None, "sh", ["-c", "printf \"$PROCBRIDGE_TEST:${HOME:-unset}\""])
            .await
            .unwrap();
        assert_eq!(session.stdout(), "visible:unset");
    }

    #[tokio::test]
    async fn working_directory_is_applied() {
        let dir = tempfile::tempdir().unwrap();
        let canonical = dir.path().canonicalize().unwrap();
        let attrs = ProcessAttributes::builder()
            .working_directory(&canonical)
            .build();
        let session = Session::new(attrs);
        session.start_and_wait(None, "pwd", NO_ARGS).await.unwrap();

        let expected = format!("{}\n", canonical.display());
        assert_eq!(session.stdout(), expected.as_bytes());
    }

    #[tokio::test]
    async fn command_records_resolved_path_and_args() {
        let session = Session::default();
        session
            .start_and_wait(None, "echo", ["a", "b"])
            .await
            .unwrap();
        let command = session.command();
        assert!(Path::new(&command[0]).is_absolute());
        assert!(command[0].ends_with("echo"));
        assert_eq!(&command[1..], ["a", "b"]);
    }

    #[tokio::test]
    async fn kill_is_reflected_in_exit_status() {
        use std::os::unix::process::ExitStatusExt;

        let session = Session::default();
        session.start(None, "sleep", ["30"]).await.unwrap();
        assert!(session.pid().is_some());

        session.kill().await.unwrap();
        let status = tokio::time::timeout(Duration::from_secs(10), session.wait())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(status.signal(), Some(libc::SIGKILL));
        assert_eq!(session.pid(), None);
    }

    #[tokio::test]
    async fn release_ends_run_without_status() {
        let session = Session::default();
        session.start(None, "sleep", ["30"]).await.unwrap();
        let pid = session.pid().unwrap();

        session.release().await.unwrap();
        let err = tokio::time::timeout(Duration::from_secs(10), session.wait())
            .await
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, Error::Released));
        assert_eq!(session.pid(), None);

        #[allow(clippy::cast_possible_wrap)]
        nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid as i32), Signal::SIGKILL).unwrap();
    }

    #[tokio::test]
    async fn reset_clears_debug_and_keeps_attributes() {
        let attrs = ProcessAttributes::builder().working_directory("/").build();
        let session = Session::new(attrs.clone());
        session.set_debug(true);
        assert!(session.is_debug());

        session.reset().await;
        assert!(!session.is_debug());
        assert_eq!(session.attributes(), &attrs);
    }

    #[tokio::test]
    async fn pending_mirror_is_closed_by_reset() {
        let session = Session::default();
        let mut mirror = session.stdout_mirror();
        session.reset().await;
        assert!(mirror.recv().await.is_none());
    }
}
