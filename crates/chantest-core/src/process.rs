//! External commands with a wall-clock timeout and process-group teardown.
//!
//! Every command is started as the leader of a fresh process group so that a
//! timeout can reach everything it spawned, not only the direct child. The
//! group is owned by a [`GroupGuard`] for the whole call; unless the child
//! finished on its own, the guard tears the group down before the call
//! returns, on the timeout path and on every early return or panic alike.
//!
//! Teardown order:
//!
//! 1. `SIGKILL` the leader.
//! 2. `SIGINT` the whole group (descendants that outlived the leader).
//! 3. Reap the leader, then give the group [`GROUP_GRACE`] to drain.
//! 4. `SIGKILL` whatever is left in the group.
//!
//! Unix only.

use std::collections::BTreeMap;
use std::ffi::{OsStr, OsString};
use std::fmt;
use std::io::{self, Read};
use std::os::unix::process::CommandExt as _;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::sys::signal::{Signal, killpg};
use nix::unistd::Pid;
use tracing::{debug, warn};

use crate::error::ErrorCode;

/// How often the child and its output reader are polled.
const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Time the group gets to exit after `SIGINT` before it is killed outright.
pub const GROUP_GRACE: Duration = Duration::from_secs(2);

/// How long to wait for the stdout reader once the group is gone.
const READER_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("{program} exited with {}", describe_exit(.code))]
    Failed {
        program: String,
        /// `None` when the process was ended by a signal.
        code: Option<i32>,
        stdout: Vec<u8>,
    },

    #[error("{program} timed out after {timeout:?}")]
    TimedOut {
        program: String,
        timeout: Duration,
        /// Whatever was captured before teardown.
        stdout: Vec<u8>,
    },

    #[error("error while waiting for {program}: {source}")]
    Io {
        program: String,
        #[source]
        source: io::Error,
    },
}

fn describe_exit(code: &Option<i32>) -> String {
    code.map_or_else(|| "a signal".to_string(), |code| format!("code {code}"))
}

impl ProcessError {
    /// Machine-readable code associated with this error.
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::Spawn { .. } => ErrorCode::ProcessSpawnFailed,
            Self::Failed { .. } => ErrorCode::ProcessFailed,
            Self::TimedOut { .. } => ErrorCode::ProcessTimedOut,
            Self::Io { .. } => ErrorCode::InternalUnexpected,
        }
    }

    /// Captured stdout for failures that produced any.
    #[must_use]
    pub fn stdout(&self) -> Option<&[u8]> {
        match self {
            Self::Failed { stdout, .. } | Self::TimedOut { stdout, .. } => Some(stdout.as_slice()),
            Self::Spawn { .. } | Self::Io { .. } => None,
        }
    }
}

/// Program, arguments, and environment overrides for one run.
///
/// The child inherits the caller's environment with `env` entries layered on
/// top. Stdin is closed; stderr is inherited so it lands in the job log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    program: OsString,
    args: Vec<OsString>,
    env: BTreeMap<OsString, OsString>,
}

impl Invocation {
    pub fn new(program: impl AsRef<OsStr>) -> Self {
        Self {
            program: program.as_ref().to_os_string(),
            args: Vec::new(),
            env: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn arg(mut self, arg: impl AsRef<OsStr>) -> Self {
        self.args.push(arg.as_ref().to_os_string());
        self
    }

    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.args
            .extend(args.into_iter().map(|a| a.as_ref().to_os_string()));
        self
    }

    #[must_use]
    pub fn env(mut self, key: impl AsRef<OsStr>, value: impl AsRef<OsStr>) -> Self {
        self.env
            .insert(key.as_ref().to_os_string(), value.as_ref().to_os_string());
        self
    }

    #[must_use]
    pub fn program(&self) -> &OsStr {
        &self.program
    }

    #[must_use]
    pub fn get_args(&self) -> &[OsString] {
        &self.args
    }

    #[must_use]
    pub fn get_env(&self, key: &str) -> Option<&OsStr> {
        self.env.get(OsStr::new(key)).map(OsString::as_os_str)
    }

    fn command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .envs(&self.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .process_group(0);
        command
    }
}

impl fmt::Display for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program.to_string_lossy())?;
        for arg in &self.args {
            write!(f, " {}", arg.to_string_lossy())?;
        }
        Ok(())
    }
}

/// Run `invocation`, returning its stdout byte-for-byte on exit code 0.
///
/// The call completes once the child has exited and its stdout is closed.
/// If that has not happened within `timeout` the whole process group is torn
/// down and [`ProcessError::TimedOut`] is returned with the partial output.
///
/// # Errors
///
/// - [`ProcessError::Spawn`] if the program cannot be started.
/// - [`ProcessError::Failed`] on a non-zero exit (or death by signal).
/// - [`ProcessError::TimedOut`] when the deadline passes.
/// - [`ProcessError::Io`] if waiting on the child fails.
pub fn run(invocation: &Invocation, timeout: Duration) -> Result<Vec<u8>, ProcessError> {
    let program = invocation.program.to_string_lossy().into_owned();
    debug!(command = %invocation, ?timeout, "starting process");

    let child = invocation
        .command()
        .spawn()
        .map_err(|source| ProcessError::Spawn {
            program: program.clone(),
            source,
        })?;
    let mut guard = GroupGuard::new(child);
    let reader = OutputReader::start(guard.child_mut());

    // a timeout too large to represent never expires
    let deadline = Instant::now().checked_add(timeout);
    let status = loop {
        let exited = guard
            .child_mut()
            .try_wait()
            .map_err(|source| ProcessError::Io {
                program: program.clone(),
                source,
            })?;
        if let Some(status) = exited {
            if reader.is_finished() {
                break status;
            }
        }
        if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
            warn!(command = %invocation, ?timeout, "process timed out, tearing down its group");
            guard.teardown();
            return Err(ProcessError::TimedOut {
                program,
                timeout,
                stdout: reader.finish(),
            });
        }
        thread::sleep(POLL_INTERVAL);
    };

    guard.release();
    let stdout = reader.finish();
    check_status(program, status, stdout)
}

fn check_status(
    program: String,
    status: ExitStatus,
    stdout: Vec<u8>,
) -> Result<Vec<u8>, ProcessError> {
    if status.success() {
        return Ok(stdout);
    }
    Err(ProcessError::Failed {
        program,
        code: status.code(),
        stdout,
    })
}

/// Owns a child that leads its own process group.
///
/// Dropping an armed guard tears the group down; [`GroupGuard::release`]
/// disarms it once the child has exited on its own.
#[derive(Debug)]
pub struct GroupGuard {
    child: Child,
    pgid: Option<Pid>,
    armed: bool,
}

impl GroupGuard {
    /// Take ownership of a child spawned with `process_group(0)`.
    #[must_use]
    pub fn new(child: Child) -> Self {
        let pgid = i32::try_from(child.id()).ok().map(Pid::from_raw);
        Self {
            child,
            pgid,
            armed: true,
        }
    }

    pub fn child_mut(&mut self) -> &mut Child {
        &mut self.child
    }

    /// Disarm without signalling anything.
    pub fn release(&mut self) {
        self.armed = false;
    }

    /// Kill the leader, interrupt then kill the group, and reap the leader.
    ///
    /// Idempotent; later calls (including the one from `Drop`) do nothing.
    pub fn teardown(&mut self) {
        if !self.armed {
            return;
        }
        self.armed = false;

        if let Err(err) = self.child.kill() {
            debug!(error = %err, "leader already gone");
        }
        self.signal_group(Signal::SIGINT);
        if let Err(err) = self.child.wait() {
            warn!(error = %err, "failed to reap process group leader");
        }

        let grace_end = Instant::now() + GROUP_GRACE;
        while self.group_alive() && Instant::now() < grace_end {
            thread::sleep(POLL_INTERVAL);
        }
        if self.group_alive() {
            debug!(pgid = ?self.pgid, "group survived SIGINT, sending SIGKILL");
            self.signal_group(Signal::SIGKILL);
        }
    }

    fn signal_group(&self, signal: Signal) {
        let Some(pgid) = self.pgid else {
            return;
        };
        match killpg(pgid, signal) {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(err) => warn!(pgid = %pgid, ?signal, error = %err, "failed to signal process group"),
        }
    }

    fn group_alive(&self) -> bool {
        self.pgid
            .is_some_and(|pgid| !matches!(killpg(pgid, None::<Signal>), Err(Errno::ESRCH)))
    }
}

impl Drop for GroupGuard {
    fn drop(&mut self) {
        self.teardown();
    }
}

/// Drains a child's stdout on a background thread into a shared buffer, so
/// partial output survives even if the reader has to be abandoned.
struct OutputReader {
    buffer: Arc<Mutex<Vec<u8>>>,
    handle: Option<JoinHandle<()>>,
}

impl OutputReader {
    fn start(child: &mut Child) -> Self {
        let buffer = Arc::new(Mutex::new(Vec::new()));
        let handle = child.stdout.take().map(|mut stdout| {
            let sink = Arc::clone(&buffer);
            thread::spawn(move || {
                let mut chunk = [0u8; 8192];
                loop {
                    match stdout.read(&mut chunk) {
                        Ok(0) => break,
                        Ok(n) => sink
                            .lock()
                            .unwrap_or_else(PoisonError::into_inner)
                            .extend_from_slice(&chunk[..n]),
                        Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                        Err(_) => break,
                    }
                }
            })
        });
        Self { buffer, handle }
    }

    fn is_finished(&self) -> bool {
        self.handle.as_ref().is_none_or(JoinHandle::is_finished)
    }

    /// Join the reader (bounded) and take the captured bytes.
    fn finish(mut self) -> Vec<u8> {
        let deadline = Instant::now() + READER_GRACE;
        while !self.is_finished() && Instant::now() < deadline {
            thread::sleep(POLL_INTERVAL);
        }
        if let Some(handle) = self.handle.take() {
            if handle.is_finished() {
                let _ = handle.join();
            } else {
                warn!("stdout still held open by an escaped process, abandoning reader");
            }
        }
        std::mem::take(&mut *self.buffer.lock().unwrap_or_else(PoisonError::into_inner))
    }
}
