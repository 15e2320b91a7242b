use crate::error::StageError;
use std::ffi::{OsStr, OsString};
use std::fmt;
use std::fs::File;
use std::path::Path;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// A program and its arguments, ready to be spawned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandLine {
    program: OsString,
    args: Vec<OsString>,
}

impl CommandLine {
    pub fn new<P, I, A>(program: P, args: I) -> Self
    where
        P: Into<OsString>,
        I: IntoIterator<Item = A>,
        A: Into<OsString>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    pub fn program(&self) -> &OsStr {
        &self.program
    }

    pub fn args(&self) -> &[OsString] {
        &self.args
    }

    fn to_command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        cmd
    }
}

impl fmt::Display for CommandLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program.to_string_lossy())?;
        for arg in &self.args {
            write!(f, " {}", arg.to_string_lossy())?;
        }
        Ok(())
    }
}

/// Runs one external command to completion.
///
/// Implementations block the calling thread. A non-zero exit is reported as
/// [`StageError::Subprocess`]; the caller decides whether that matters.
pub trait ProcessRunner: Send + Sync {
    fn run(&self, command: &CommandLine) -> Result<(), StageError>;
}

/// [`ProcessRunner`] backed by [`std::process::Command`], with the child's
/// stdout and stderr passed through to ours.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemProcessRunner;

impl ProcessRunner for SystemProcessRunner {
    fn run(&self, command: &CommandLine) -> Result<(), StageError> {
        let label = command.program().to_string_lossy().into_owned();
        log::debug!("Executing: {command}");
        let status = command
            .to_command()
            .stdin(Stdio::null())
            .status()
            .map_err(|e| StageError::Subprocess {
                command: label.clone(),
                reason: format!("failed to spawn: {e}"),
            })?;
        if status.success() {
            Ok(())
        } else {
            Err(StageError::exit_status(&label, status))
        }
    }
}

/// Cooperative cancellation flag shared between the controller, the crash
/// verifier's workers and whoever wants to stop the run (e.g. a Ctrl-C handler).
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn check(&self) -> Result<(), StageError> {
        if self.is_cancelled() {
            Err(StageError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// How a supervised child process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitOutcome {
    Exited(ExitStatus),
    TimedOut,
}

/// Where the child's stdin comes from.
pub enum StdinSource<'a> {
    Null,
    File(&'a Path),
}

/// Spawns `command` with its output discarded and waits for it, killing it
/// when `timeout` elapses or `cancel` is tripped.
pub fn execute_with_timeout(
    command: &CommandLine,
    stdin: StdinSource<'_>,
    timeout: Duration,
    cancel: &CancelToken,
) -> Result<ExitOutcome, StageError> {
    let label = command.program().to_string_lossy().into_owned();
    let stdin = match stdin {
        StdinSource::Null => Stdio::null(),
        StdinSource::File(path) => {
            Stdio::from(File::open(path).map_err(|e| StageError::fs("failed to open", path, e))?)
        }
    };

    let mut cmd = command.to_command();
    #[cfg(unix)]
    {
        // Own group so a timeout also reaches anything the target forks.
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
    }
    let child = cmd
        .stdin(stdin)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .map_err(|e| StageError::Subprocess {
            command: label.clone(),
            reason: format!("failed to spawn: {e}"),
        })?;

    wait_with_timeout(child, &label, timeout, cancel)
}

fn wait_with_timeout(
    mut child: Child,
    label: &str,
    timeout: Duration,
    cancel: &CancelToken,
) -> Result<ExitOutcome, StageError> {
    let start_time = Instant::now();

    loop {
        match child.try_wait() {
            Ok(Some(status)) => return Ok(ExitOutcome::Exited(status)),
            Ok(None) => {
                let cancelled = cancel.is_cancelled();
                if cancelled || start_time.elapsed() > timeout {
                    if let Err(e) = kill_process_tree(&mut child) {
                        return Err(StageError::Subprocess {
                            command: label.to_string(),
                            reason: format!("failed to kill process: {e}"),
                        });
                    }
                    let _ = child.wait();
                    if cancelled {
                        return Err(StageError::Cancelled);
                    }
                    return Ok(ExitOutcome::TimedOut);
                }
                std::thread::sleep(WAIT_POLL_INTERVAL);
            }
            Err(e) => {
                return Err(StageError::Subprocess {
                    command: label.to_string(),
                    reason: format!("error waiting for child: {e}"),
                });
            }
        }
    }
}

#[cfg(unix)]
fn kill_process_tree(child: &mut Child) -> std::io::Result<()> {
    let pgid = libc::pid_t::try_from(child.id())
        .map_err(|_| std::io::Error::other("child pid out of range"))?;
    // SAFETY: killpg only sends a signal. The group was created for this
    // child at spawn and the child is not reaped yet, so the id is not reused.
    if unsafe { libc::killpg(pgid, libc::SIGKILL) } == 0 {
        return Ok(());
    }
    let err = std::io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        child.kill()
    } else {
        Err(err)
    }
}

#[cfg(not(unix))]
fn kill_process_tree(child: &mut Child) -> std::io::Result<()> {
    child.kill()
}
