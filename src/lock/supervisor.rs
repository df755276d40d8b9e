//! Child process supervision.
//!
//! The child inherits stdin, stdout and stderr. A reaper task owns the
//! `tokio::process::Child` and reports the exit code once; signals are sent
//! by pid so the supervisor can keep signalling while the reaper waits.

use std::ffi::OsString;
use std::future::pending;
use std::io;
use std::os::unix::process::ExitStatusExt;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::error;
use tokio::process::Command;
use tokio::sync::oneshot;

use super::signals::ForwardedSignal;

/// Exit code when the program cannot be found.
pub const EXIT_NOT_FOUND: i32 = 127;
/// Exit code when the program exists but cannot be executed.
pub const EXIT_NOT_EXECUTABLE: i32 = 126;
const EXIT_UNKNOWN: i32 = 1;

/// Program and arguments to run while the lock is held.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: OsString,
    pub args: Vec<OsString>,
}

impl CommandSpec {
    pub fn new<I, A>(program: impl Into<OsString>, args: I) -> Self
    where
        I: IntoIterator<Item = A>,
        A: Into<OsString>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    pub fn display_name(&self) -> String {
        self.program.to_string_lossy().into_owned()
    }
}

pub struct ChildSupervisor {
    pid: u32,
    exit: Option<oneshot::Receiver<i32>>,
    exited: Arc<AtomicBool>,
}

impl ChildSupervisor {
    pub fn spawn(command: &CommandSpec) -> io::Result<Self> {
        let mut child = Command::new(&command.program)
            .args(&command.args)
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .spawn()?;
        let pid = child
            .id()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "child exited before reporting a pid"))?;

        let (tx, rx) = oneshot::channel();
        let exited = Arc::new(AtomicBool::new(false));
        let reaped = Arc::clone(&exited);
        tokio::spawn(async move {
            let code = match child.wait().await {
                Ok(status) => exit_code(status),
                Err(err) => {
                    error!("waiting for child {pid}: {err}");
                    EXIT_UNKNOWN
                }
            };
            reaped.store(true, Ordering::SeqCst);
            let _ = tx.send(code);
        });

        Ok(Self {
            pid,
            exit: Some(rx),
            exited,
        })
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn signal(&self, signal: ForwardedSignal) -> io::Result<()> {
        self.send(signal.as_raw())
    }

    pub fn kill(&self) -> io::Result<()> {
        self.send(libc::SIGKILL)
    }

    fn send(&self, signal: libc::c_int) -> io::Result<()> {
        // The pid may already be recycled once reaped.
        if self.exited.load(Ordering::SeqCst) {
            return Ok(());
        }
        let rc = unsafe { libc::kill(self.pid as libc::pid_t, signal) };
        if rc == 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::ESRCH) {
            return Ok(());
        }
        Err(err)
    }

    /// Resolves with the exit code once. Cancel-safe; pending forever after.
    pub async fn exited(&mut self) -> i32 {
        let Some(rx) = self.exit.as_mut() else {
            return pending().await;
        };
        let code = rx.await.unwrap_or(EXIT_UNKNOWN);
        self.exit = None;
        code
    }
}

/// Exit code for a finished child: its own code, or 128 + signal.
pub fn exit_code(status: ExitStatus) -> i32 {
    status
        .code()
        .or_else(|| status.signal().map(|signal| 128 + signal))
        .unwrap_or(EXIT_UNKNOWN)
}

/// Exit code reported when the child could not be started at all.
pub fn spawn_failure_code(err: &io::Error) -> i32 {
    match err.kind() {
        io::ErrorKind::NotFound => EXIT_NOT_FOUND,
        _ => EXIT_NOT_EXECUTABLE,
    }
}
