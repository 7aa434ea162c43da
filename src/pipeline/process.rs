//! External process handles
//!
//! Every OS-level process operation the supervisor needs (spawn, liveness,
//! exit status, graceful stop) goes through [`ProcessHandle`].

use log::{debug, warn};
use std::os::unix::process::ExitStatusExt;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};

use super::types::ProcessRole;

static NEXT_HANDLE_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of one launched process, never reused within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandleId(u64);

impl HandleId {
    fn next() -> Self {
        HandleId(NEXT_HANDLE_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Display for HandleId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// How a process attaches to the data channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelEnd {
    /// Writes the stream to stdout
    Writer,
    /// Reads the stream from stdin
    Reader,
}

/// Structured description of a process to launch.
///
/// Arguments are passed to the program verbatim, never through a shell.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessSpec {
    pub role: ProcessRole,
    pub program: String,
    pub args: Vec<String>,
    pub channel_end: ChannelEnd,
    /// Values masked whenever the spec is displayed
    pub secrets: Vec<String>,
}

impl ProcessSpec {
    pub fn new(role: ProcessRole, program: impl Into<String>, channel_end: ChannelEnd) -> Self {
        Self {
            role,
            program: program.into(),
            args: Vec::new(),
            channel_end,
            secrets: Vec::new(),
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

    pub fn secret(mut self, secret: impl Into<String>) -> Self {
        let secret = secret.into();
        if !secret.is_empty() {
            self.secrets.push(secret);
        }
        self
    }

    pub fn has_arg(&self, arg: &str) -> bool {
        self.args.iter().any(|a| a == arg)
    }

    /// Value following `flag`, if present.
    pub fn arg_value(&self, flag: &str) -> Option<&str> {
        self.args
            .iter()
            .position(|a| a == flag)
            .and_then(|i| self.args.get(i + 1))
            .map(String::as_str)
    }

    fn redact(&self, value: &str) -> String {
        self.secrets
            .iter()
            .fold(value.to_string(), |acc, secret| acc.replace(secret.as_str(), "****"))
    }
}

impl std::fmt::Display for ProcessSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            let arg = self.redact(arg);
            if arg.is_empty() || arg.contains(char::is_whitespace) {
                write!(f, " '{}'", arg)?;
            } else {
                write!(f, " {}", arg)?;
            }
        }
        Ok(())
    }
}

/// How a process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitKind {
    Success,
    Code(i32),
    Signal(i32),
    Unknown,
}

impl ExitKind {
    /// Anything but a zero exit code.
    pub fn is_crash(&self) -> bool {
        !matches!(self, ExitKind::Success)
    }
}

impl From<ExitStatus> for ExitKind {
    fn from(status: ExitStatus) -> Self {
        match (status.code(), status.signal()) {
            (Some(0), _) => ExitKind::Success,
            (Some(code), _) => ExitKind::Code(code),
            (None, Some(signal)) => ExitKind::Signal(signal),
            (None, None) => ExitKind::Unknown,
        }
    }
}

impl std::fmt::Display for ExitKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExitKind::Success => write!(f, "exit code 0"),
            ExitKind::Code(code) => write!(f, "exit code {}", code),
            ExitKind::Signal(signal) => write!(f, "signal {}", signal),
            ExitKind::Unknown => write!(f, "unknown status"),
        }
    }
}

/// Result of a [`ProcessHandle::terminate`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// Stopped within the grace period after SIGTERM
    Graceful(ExitKind),
    /// Ignored SIGTERM for the whole grace period and was killed
    Forced,
    /// Had already exited, nothing was sent
    AlreadyExited(ExitKind),
}

impl std::fmt::Display for Termination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Termination::Graceful(kind) => write!(f, "stopped gracefully ({})", kind),
            Termination::Forced => write!(f, "killed after grace period"),
            Termination::AlreadyExited(kind) => write!(f, "already exited ({})", kind),
        }
    }
}

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("failed to spawn {role} process `{program}`: {source}")]
    Spawn {
        role: ProcessRole,
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{role} process {pid} not ready within {timeout:?}")]
    Timeout {
        role: ProcessRole,
        pid: u32,
        timeout: Duration,
    },
    #[error("{role} process {pid} exited after {uptime:?} ({status})")]
    Exited {
        role: ProcessRole,
        pid: u32,
        status: ExitKind,
        uptime: Duration,
    },
    #[error("i/o error supervising {role} process {pid}: {source}")]
    Io {
        role: ProcessRole,
        pid: u32,
        #[source]
        source: std::io::Error,
    },
}

/// A launched external process.
///
/// The child is killed if the handle is dropped while it still runs.
pub struct ProcessHandle {
    id: HandleId,
    role: ProcessRole,
    pid: u32,
    child: Child,
    started_at: Instant,
    exit: Option<ExitKind>,
    stdout: Option<ChildStdout>,
    stdin: Option<ChildStdin>,
}

impl ProcessHandle {
    /// Spawn `spec` and start forwarding its stderr to the log.
    pub fn spawn(spec: &ProcessSpec) -> Result<Self, ProcessError> {
        let (stdin, stdout) = match spec.channel_end {
            ChannelEnd::Writer => (Stdio::null(), Stdio::piped()),
            ChannelEnd::Reader => (Stdio::piped(), Stdio::null()),
        };

        let mut child = Command::new(&spec.program)
            .args(&spec.args)
            .stdin(stdin)
            .stdout(stdout)
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| ProcessError::Spawn {
                role: spec.role,
                program: spec.program.clone(),
                source,
            })?;

        let pid = child.id().unwrap_or_default();
        let role = spec.role;

        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!("[{} {}] {}", role, pid, line);
                }
            });
        }

        Ok(Self {
            id: HandleId::next(),
            role,
            pid,
            stdout: child.stdout.take(),
            stdin: child.stdin.take(),
            child,
            started_at: Instant::now(),
            exit: None,
        })
    }

    pub fn id(&self) -> HandleId {
        self.id
    }

    pub fn role(&self) -> ProcessRole {
        self.role
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Take the stdout pipe of a [`ChannelEnd::Writer`] process.
    pub fn take_stdout(&mut self) -> Option<ChildStdout> {
        self.stdout.take()
    }

    /// Take the stdin pipe of a [`ChannelEnd::Reader`] process.
    pub fn take_stdin(&mut self) -> Option<ChildStdin> {
        self.stdin.take()
    }

    /// Non-blocking exit check, `None` while the process runs.
    pub fn exit_status(&mut self) -> Option<ExitKind> {
        if self.exit.is_none() {
            match self.child.try_wait() {
                Ok(Some(status)) => self.exit = Some(status.into()),
                Ok(None) => {}
                Err(e) => warn!("{} process {}: cannot poll status: {}", self.role, self.pid, e),
            }
        }
        self.exit
    }

    pub fn is_alive(&mut self) -> bool {
        self.exit_status().is_none()
    }

    /// Wait until the process has survived `warmup` since launch.
    ///
    /// Fails with [`ProcessError::Exited`] as soon as the process dies and
    /// with [`ProcessError::Timeout`] when `warmup` exceeds `timeout`.
    pub async fn await_ready(
        &mut self,
        warmup: Duration,
        timeout: Duration,
    ) -> Result<Duration, ProcessError> {
        if let Some(status) = self.exit_status() {
            return Err(self.exited(status));
        }

        let remaining = warmup.saturating_sub(self.uptime());
        let wait = remaining.min(timeout);

        let exited = tokio::select! {
            status = self.child.wait() => Some(status),
            _ = tokio::time::sleep(wait) => None,
        };

        match exited {
            Some(status) => {
                let status = status.map_err(|source| ProcessError::Io {
                    role: self.role,
                    pid: self.pid,
                    source,
                })?;
                let kind = ExitKind::from(status);
                self.exit = Some(kind);
                Err(self.exited(kind))
            }
            None if remaining <= timeout => Ok(self.uptime()),
            None => Err(ProcessError::Timeout {
                role: self.role,
                pid: self.pid,
                timeout,
            }),
        }
    }

    /// Ask the process to stop, killing it if it outlives `grace`.
    ///
    /// Calling this on a process that already exited is a no-op.
    pub async fn terminate(&mut self, grace: Duration) -> Result<Termination, ProcessError> {
        if let Some(status) = self.exit_status() {
            return Ok(Termination::AlreadyExited(status));
        }

        if self.pid != 0 {
            // SAFETY: plain syscall on a pid we spawned and have not reaped yet
            let rc = unsafe { libc::kill(self.pid as libc::pid_t, libc::SIGTERM) };
            if rc != 0 {
                debug!(
                    "{} process {}: SIGTERM not delivered: {}",
                    self.role,
                    self.pid,
                    std::io::Error::last_os_error()
                );
            }
        }

        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(Ok(status)) => {
                let kind = ExitKind::from(status);
                self.exit = Some(kind);
                Ok(Termination::Graceful(kind))
            }
            Ok(Err(source)) => Err(ProcessError::Io {
                role: self.role,
                pid: self.pid,
                source,
            }),
            Err(_) => {
                self.child.kill().await.map_err(|source| ProcessError::Io {
                    role: self.role,
                    pid: self.pid,
                    source,
                })?;
                self.exit = Some(ExitKind::Signal(libc::SIGKILL));
                Ok(Termination::Forced)
            }
        }
    }

    fn exited(&self, status: ExitKind) -> ProcessError {
        ProcessError::Exited {
            role: self.role,
            pid: self.pid,
            status,
            uptime: self.uptime(),
        }
    }
}

/// Turns a [`ProcessSpec`] into a running process.
pub trait ProcessLauncher: Send + Sync {
    fn launch(&self, spec: &ProcessSpec) -> Result<ProcessHandle, ProcessError>;
}

/// Launches specs exactly as described.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemLauncher;

impl ProcessLauncher for SystemLauncher {
    fn launch(&self, spec: &ProcessSpec) -> Result<ProcessHandle, ProcessError> {
        ProcessHandle::spawn(spec)
    }
}
