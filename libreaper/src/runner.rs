//! External command execution.
//!
//! [`CommandRunner`] is the only I/O primitive the inventories and the
//! deletion loop use. The execution context (local process namespace or the
//! host's namespaces via `nsenter`) is a parameter of every call, so the
//! reconciler runs the same code in both deployments.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use nix::sys::signal::{Signal, killpg};
use nix::unistd::Pid;
use tokio::process::Command;
use tracing::{debug, instrument, warn};

use crate::error::ExecutionError;

/// Exit status used by `nsenter` and shells when the target program is missing.
const EXIT_COMMAND_NOT_FOUND: i32 = 127;

/// How long a timed-out command gets to exit after SIGTERM before SIGKILL.
const KILL_GRACE: Duration = Duration::from_secs(2);

/// Where a command runs.
///
/// Either way the spawned process may be `sudo` or `nsenter` rather than
/// the command itself, so timeouts signal the whole process group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecContext {
    /// In the reaper's own namespaces.
    Local,
    /// In the mount, UTS, network and IPC namespaces of `target_pid`
    /// (pid 1 of the host when running in a `hostPID` pod).
    HostNamespace { target_pid: u32 },
}

impl std::fmt::Display for ExecContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Local => f.write_str("local"),
            Self::HostNamespace { target_pid } => write!(f, "nsenter(pid {target_pid})"),
        }
    }
}

/// A command to run, plus the non-zero exit codes the caller wants back as
/// ordinary output instead of an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub tolerated: Vec<i32>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            tolerated: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Treat exit `code` as a normal result.
    pub fn tolerate(mut self, code: i32) -> Self {
        self.tolerated.push(code);
        self
    }

    /// `program arg…`, used in logs and errors.
    pub fn render(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Captured result of a finished command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub code: i32,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == 0
    }
}

/// Executes a [`CommandSpec`] in an [`ExecContext`].
///
/// Implementations must not retry. Any exit status other than zero or one of
/// `spec.tolerated` is returned as [`ExecutionError::NonZeroExit`].
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(
        &self,
        ctx: &ExecContext,
        spec: &CommandSpec,
    ) -> Result<CommandOutput, ExecutionError>;
}

/// Full argv for `spec` in `ctx`, including the privilege wrapper.
pub fn wrap_argv(ctx: &ExecContext, escalate: bool, spec: &CommandSpec) -> Vec<String> {
    let mut argv = Vec::with_capacity(spec.args.len() + 12);
    if escalate {
        argv.extend(["sudo", "-n"].map(String::from));
    }
    if let ExecContext::HostNamespace { target_pid } = ctx {
        argv.extend(
            [
                "nsenter".to_owned(),
                "-t".to_owned(),
                target_pid.to_string(),
            ]
            .into_iter()
            .chain(["-m", "-u", "-n", "-i", "--"].map(String::from)),
        );
    }
    argv.push(spec.program.clone());
    argv.extend(spec.args.iter().cloned());
    argv
}

/// Send `sig` to the process group led by `pid`. Members owned by root stay
/// out of reach for an unprivileged reaper; `sudo` relays SIGTERM to them.
fn signal_group(pid: u32, sig: Signal) {
    let Ok(raw) = i32::try_from(pid) else {
        return;
    };
    if let Err(errno) = killpg(Pid::from_raw(raw), sig) {
        debug!(pid, %sig, %errno, "could not signal process group");
    }
}

/// [`CommandRunner`] that spawns real processes with a per-command timeout.
#[derive(Debug, Clone)]
pub struct HostCommandRunner {
    timeout: Duration,
    escalate: bool,
}

impl HostCommandRunner {
    /// Commands are prefixed with `sudo -n` unless the reaper runs as root.
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            escalate: !nix::unistd::geteuid().is_root(),
        }
    }

    pub fn with_escalation(mut self, escalate: bool) -> Self {
        self.escalate = escalate;
        self
    }
}

#[async_trait]
impl CommandRunner for HostCommandRunner {
    #[instrument(skip_all, fields(command = %spec.render(), %ctx))]
    async fn run(
        &self,
        ctx: &ExecContext,
        spec: &CommandSpec,
    ) -> Result<CommandOutput, ExecutionError> {
        let argv = wrap_argv(ctx, self.escalate, spec);
        let rendered = argv.join(" ");

        let mut cmd = Command::new(&argv[0]);
        cmd.args(&argv[1..])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true);

        let child = cmd.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ExecutionError::MissingBinary {
                    program: argv[0].clone(),
                }
            } else {
                ExecutionError::spawn(&rendered, e)
            }
        })?;

        let pid = child.id();
        let wait = child.wait_with_output();
        tokio::pin!(wait);

        let output = match tokio::time::timeout(self.timeout, &mut wait).await {
            Ok(res) => res.map_err(|e| ExecutionError::spawn(&rendered, e))?,
            Err(_) => {
                warn!(after = ?self.timeout, "command timed out, terminating");
                if let Some(pid) = pid {
                    signal_group(pid, Signal::SIGTERM);
                    if tokio::time::timeout(KILL_GRACE, &mut wait).await.is_err() {
                        signal_group(pid, Signal::SIGKILL);
                    }
                }
                // Dropping `wait` drops the child, which kills it if still alive.
                return Err(ExecutionError::TimedOut {
                    command: rendered,
                    after: self.timeout,
                });
            }
        };

        let Some(code) = output.status.code() else {
            return Err(ExecutionError::Killed { command: rendered });
        };
        let out = CommandOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_owned(),
            code,
        };
        debug!(code, "command finished");

        if out.success() || spec.tolerated.contains(&code) {
            return Ok(out);
        }
        if code == EXIT_COMMAND_NOT_FOUND {
            return Err(ExecutionError::MissingBinary {
                program: spec.program.clone(),
            });
        }
        Err(ExecutionError::NonZeroExit {
            command: rendered,
            code,
            stderr: out.stderr,
        })
    }
}
