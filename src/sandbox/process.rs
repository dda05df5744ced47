//! Child processes started inside a sandbox.
//!
//! Every child leads its own process group, so signalling the group reaches
//! everything the command forked. Output is captured for the caller and,
//! optionally, echoed to the terminal with ANSI escapes stripped.

use std::fmt;
use std::io::Write;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use anstream::adapter::StripBytes;
use nix::errno::Errno;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::sync::{watch, Notify};

use crate::error::{Error, Result};
use crate::retry::RetryPolicy;

/// How long `kill` waits after SIGTERM before sending SIGKILL to the group.
pub const KILL_GRACE_PERIOD: Duration = Duration::from_secs(2);

/// Outcome of killing a process tree.
///
/// Killing never fails from the caller's point of view: `Failed` is logged
/// and reported for inspection only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KillOutcome {
    /// The process had already exited or never had a pid.
    AlreadyExited,
    /// The process group was signalled and is gone.
    Terminated,
    /// Signalling failed after all retries.
    Failed(String),
}

#[derive(Debug, Clone, Copy)]
enum Stream {
    Stdout,
    Stderr,
}

#[derive(Default)]
struct Captured {
    stdout: Vec<u8>,
    stderr: Vec<u8>,
}

/// Exit result published by the waiter task. IO errors are stringified so the
/// value can be cloned out of the watch channel.
type ExitState = Option<std::result::Result<ExitStatus, String>>;

struct Inner {
    id: u64,
    command: String,
    pid: Option<u32>,
    captured: Mutex<Captured>,
    output_changed: Notify,
    exit: watch::Receiver<ExitState>,
}

impl Inner {
    fn captured(&self) -> MutexGuard<'_, Captured> {
        self.captured.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn append(&self, stream: Stream, chunk: &[u8]) {
        {
            let mut captured = self.captured();
            match stream {
                Stream::Stdout => captured.stdout.extend_from_slice(chunk),
                Stream::Stderr => captured.stderr.extend_from_slice(chunk),
            }
        }
        self.output_changed.notify_waiters();
    }
}

/// Handle to a process started by a sandbox.
///
/// Handles are cheap to clone; all clones observe the same process.
#[derive(Clone)]
pub struct ProcessHandle {
    inner: Arc<Inner>,
}

impl fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessHandle")
            .field("id", &self.inner.id)
            .field("command", &self.inner.command)
            .field("pid", &self.inner.pid)
            .field("running", &self.is_running())
            .finish()
    }
}

impl ProcessHandle {
    /// Sandbox-local identifier.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// The command line this process was started with.
    pub fn command(&self) -> &str {
        &self.inner.command
    }

    /// OS process id, also the process group id.
    pub fn pid(&self) -> Option<u32> {
        self.inner.pid
    }

    /// Returns false once the process has exited and its output is drained.
    pub fn is_running(&self) -> bool {
        self.inner.exit.borrow().is_none()
    }

    /// Waits for the process to exit and its output streams to close.
    pub async fn wait(&self) -> Result<ExitStatus> {
        let mut exit = self.inner.exit.clone();
        let state = exit
            .wait_for(Option::is_some)
            .await
            .map_err(|_| self.lost("exit status was never reported"))?
            .clone();

        match state {
            Some(Ok(status)) => Ok(status),
            Some(Err(reason)) => Err(self.lost(&reason)),
            None => Err(self.lost("exit status was never reported")),
        }
    }

    /// Everything captured so far: stdout followed by stderr.
    pub fn output(&self) -> String {
        let captured = self.inner.captured();
        let mut output = String::from_utf8_lossy(&captured.stdout).into_owned();
        output.push_str(&String::from_utf8_lossy(&captured.stderr));
        output
    }

    /// Waits until the captured output contains `needle`.
    ///
    /// Fails if the process exits first or `timeout` elapses. Useful for
    /// watch-mode commands that print a marker once a build finished.
    pub async fn wait_for_output(&self, needle: &str, timeout: Duration) -> Result<String> {
        let waiting = async {
            loop {
                let notified = self.inner.output_changed.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();

                let output = self.output();
                if output.contains(needle) {
                    return Ok(output);
                }
                if !self.is_running() {
                    return Err(self.lost(&format!("exited before printing {:?}", needle)));
                }
                notified.await;
            }
        };

        tokio::time::timeout(timeout, waiting).await.map_err(|_| {
            self.lost(&format!("timed out after {:?} waiting for {:?}", timeout, needle))
        })?
    }

    fn lost(&self, reason: &str) -> Error {
        Error::Process {
            command: self.inner.command.clone(),
            reason: reason.to_string(),
        }
    }
}

/// Starts `command` as the leader of a new process group.
///
/// The caller sets working directory and environment. Must run inside a
/// tokio runtime: one waiter and two output pump tasks are spawned.
pub(crate) fn start(
    mut command: Command,
    label: &str,
    id: u64,
    echo: bool,
) -> Result<ProcessHandle> {
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .process_group(0);

    let mut child = command.spawn().map_err(|source| Error::Spawn {
        command: label.to_string(),
        source,
    })?;

    let (exit_tx, exit_rx) = watch::channel(None);
    let inner = Arc::new(Inner {
        id,
        command: label.to_string(),
        pid: child.id(),
        captured: Mutex::new(Captured::default()),
        output_changed: Notify::new(),
        exit: exit_rx,
    });

    let stdout = child.stdout.take().map(|r| {
        let echo = echo.then(|| Echo::terminal(Stream::Stdout));
        tokio::spawn(pump(r, Stream::Stdout, Arc::clone(&inner), echo))
    });
    let stderr = child.stderr.take().map(|r| {
        let echo = echo.then(|| Echo::terminal(Stream::Stderr));
        tokio::spawn(pump(r, Stream::Stderr, Arc::clone(&inner), echo))
    });

    let waiter = Arc::clone(&inner);
    tokio::spawn(async move {
        let status = child.wait().await.map_err(|e| e.to_string());

        // Descendants may hold the pipes open after the leader exits.
        for pump in [stdout, stderr].into_iter().flatten() {
            if let Err(e) = pump.await {
                tracing::warn!(command = %waiter.command, error = %e, "output pump task failed");
            }
        }

        tracing::debug!(
            id = waiter.id,
            command = %waiter.command,
            status = ?status,
            "process exited"
        );
        exit_tx.send_replace(Some(status));
        waiter.output_changed.notify_waiters();
    });

    Ok(ProcessHandle { inner })
}

async fn pump<R: AsyncRead + Unpin>(
    mut reader: R,
    stream: Stream,
    inner: Arc<Inner>,
    mut echo: Option<Echo>,
) {
    let mut buf = [0u8; 8192];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                let chunk = &buf[..n];
                inner.append(stream, chunk);
                if let Some(target) = echo.as_mut() {
                    if let Err(e) = target.forward(chunk) {
                        tracing::debug!(
                            command = %inner.command,
                            stream = ?stream,
                            error = %e,
                            "terminal echo failed, disabling it"
                        );
                        echo = None;
                    }
                }
            }
            Err(e) => {
                tracing::warn!(command = %inner.command, error = %e, "failed to read process output");
                break;
            }
        }
    }
}

/// Copies one output stream to the terminal with ANSI escapes removed.
///
/// The stripper keeps its state between chunks, so escape sequences and
/// UTF-8 characters split across reads come out intact.
struct Echo {
    target: Box<dyn Write + Send>,
    stripper: StripBytes,
}

impl Echo {
    fn terminal(stream: Stream) -> Self {
        let target: Box<dyn Write + Send> = match stream {
            Stream::Stdout => Box::new(std::io::stdout()),
            Stream::Stderr => Box::new(std::io::stderr()),
        };
        Self::new(target)
    }

    fn new(target: Box<dyn Write + Send>) -> Self {
        Self {
            target,
            stripper: StripBytes::new(),
        }
    }

    fn forward(&mut self, chunk: &[u8]) -> std::io::Result<()> {
        for printable in self.stripper.strip_next(chunk) {
            self.target.write_all(printable)?;
        }
        self.target.flush()
    }
}

/// Sends SIGTERM to the handle's whole process group, escalating to SIGKILL
/// if the group has not exited within [`KILL_GRACE_PERIOD`].
pub(crate) async fn terminate_tree(handle: &ProcessHandle, retry: RetryPolicy) -> KillOutcome {
    if !handle.is_running() {
        return KillOutcome::AlreadyExited;
    }
    let Some(pid) = handle.pid() else {
        return KillOutcome::AlreadyExited;
    };
    let group = match i32::try_from(pid) {
        Ok(raw) => Pid::from_raw(raw),
        Err(_) => return KillOutcome::Failed(format!("pid {} out of range", pid)),
    };

    let signalled = retry
        .run("terminate process tree", move || async move {
            match killpg(group, Signal::SIGTERM) {
                Ok(()) => Ok(true),
                Err(Errno::ESRCH) => Ok(false),
                Err(e) => Err(e),
            }
        })
        .await;

    match signalled {
        Ok(false) => KillOutcome::AlreadyExited,
        Ok(true) => {
            if tokio::time::timeout(KILL_GRACE_PERIOD, handle.wait())
                .await
                .is_err()
            {
                tracing::warn!(
                    command = %handle.command(),
                    pid,
                    "process tree ignored SIGTERM, sending SIGKILL"
                );
                match killpg(group, Signal::SIGKILL) {
                    Ok(()) | Err(Errno::ESRCH) => {}
                    Err(e) => return KillOutcome::Failed(e.to_string()),
                }
            }
            KillOutcome::Terminated
        }
        Err(e) => {
            tracing::warn!(
                command = %handle.command(),
                pid,
                error = %e,
                "failed to signal process tree"
            );
            KillOutcome::Failed(e.to_string())
        }
    }
}

/// Immediately SIGKILLs the handle's process group, ignoring errors.
pub(crate) fn kill_group_now(handle: &ProcessHandle) {
    if !handle.is_running() {
        return;
    }
    if let Some(raw) = handle.pid().and_then(|pid| i32::try_from(pid).ok()) {
        let _ = killpg(Pid::from_raw(raw), Signal::SIGKILL);
    }
}
