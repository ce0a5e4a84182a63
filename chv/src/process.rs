//! Launching and reaping the VMM child process.

use std::ffi::{OsStr, OsString};
use std::io;
use std::path::{Path, PathBuf};
use std::process::ExitStatus;

use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Executable name looked up on `PATH` when no program is configured.
pub const DEFAULT_PROGRAM: &str = "cloud-hypervisor";

/// Logging verbosity, shared by the VMM flags and host-side logging.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
#[non_exhaustive]
pub enum LogLevel {
    /// Logging disabled.
    Off,
    /// Errors only.
    Error,
    /// Errors and warnings.
    Warn,
    /// Errors, warnings, and informational messages.
    #[default]
    Info,
    /// Verbose debug output.
    Debug,
    /// Maximum verbosity.
    Trace,
}

impl LogLevel {
    /// Verbosity flag passed to the VMM.
    ///
    /// Debug and trace get `-vv`; everything else gets `-v`.
    pub const fn vmm_flag(self) -> &'static str {
        match self {
            Self::Debug | Self::Trace => "-vv",
            _ => "-v",
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Off => "off",
            Self::Error => "error",
            Self::Warn => "warn",
            Self::Info => "info",
            Self::Debug => "debug",
            Self::Trace => "trace",
        })
    }
}

impl std::str::FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "off" => Ok(Self::Off),
            "error" => Ok(Self::Error),
            "warn" => Ok(Self::Warn),
            "info" => Ok(Self::Info),
            "debug" => Ok(Self::Debug),
            "trace" => Ok(Self::Trace),
            _ => Err(format!("unknown log level: {s}")),
        }
    }
}

/// Where the VMM's stdout and stderr go.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[non_exhaustive]
pub enum Output {
    /// Share the supervisor's streams.
    #[default]
    Inherit,
    /// Discard.
    Null,
}

impl Output {
    fn stdio(self) -> std::process::Stdio {
        match self {
            Self::Inherit => std::process::Stdio::inherit(),
            Self::Null => std::process::Stdio::null(),
        }
    }
}

/// Lifecycle of the VMM child process as seen by the supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum ProcessState {
    /// Not launched yet.
    NotStarted,
    /// Launched and not yet reaped.
    Running {
        /// OS process id.
        pid: u32,
    },
    /// Reaped. `None` if the exit status could not be collected.
    Exited(Option<ExitStatus>),
}

impl ProcessState {
    /// Returns `true` once the process has been reaped.
    pub const fn has_exited(&self) -> bool {
        matches!(self, Self::Exited(_))
    }
}

/// Builds and spawns the VMM command line.
///
/// The command is `<program> [args..] --api-socket <socket> <-v|-vv>`,
/// with stdin closed and the process killed if the supervisor dies.
#[derive(Debug, Clone)]
pub struct Launcher {
    /// Resolved executable path.
    program: PathBuf,
    /// Arguments placed before the VMM flags.
    args: Vec<OsString>,
    /// Control socket the VMM listens on.
    api_socket: PathBuf,
    /// Selects the verbosity flag.
    log_level: LogLevel,
    /// stdout/stderr routing.
    output: Output,
}

impl Launcher {
    /// Creates a launcher for an already-resolved `program`.
    pub fn new(program: impl Into<PathBuf>, api_socket: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            api_socket: api_socket.into(),
            log_level: LogLevel::default(),
            output: Output::default(),
        }
    }

    /// Appends an argument placed before the VMM flags.
    #[must_use]
    pub fn arg(mut self, arg: impl AsRef<OsStr>) -> Self {
        self.args.push(arg.as_ref().to_owned());
        self
    }

    /// Sets the verbosity level.
    #[must_use]
    pub const fn log_level(mut self, level: LogLevel) -> Self {
        self.log_level = level;
        self
    }

    /// Sets where stdout and stderr go.
    #[must_use]
    pub const fn output(mut self, output: Output) -> Self {
        self.output = output;
        self
    }

    /// Control socket path passed to the VMM.
    pub fn api_socket(&self) -> &Path {
        &self.api_socket
    }

    /// Executable path.
    pub fn program(&self) -> &Path {
        &self.program
    }

    /// Full argument vector, excluding the program.
    pub fn argv(&self) -> Vec<OsString> {
        let mut argv = self.args.clone();
        argv.push("--api-socket".into());
        argv.push(self.api_socket.clone().into_os_string());
        argv.push(self.log_level.vmm_flag().into());
        argv
    }

    /// Spawns the VMM. A stale socket file at the API path is removed first.
    ///
    /// The returned child is killed when dropped.
    pub fn launch(&self) -> Result<Child> {
        match std::fs::remove_file(&self.api_socket) {
            Ok(()) => debug!(socket = %self.api_socket.display(), "removed stale api socket"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        let mut cmd = Command::new(&self.program);
        cmd.args(self.argv())
            .stdin(std::process::Stdio::null())
            .stdout(self.output.stdio())
            .stderr(self.output.stdio())
            .kill_on_drop(true);
        die_with_parent(&mut cmd);

        let child = cmd.spawn()?;
        debug!(program = %self.program.display(), pid = ?child.id(), "spawned vmm");
        Ok(child)
    }
}

/// Asks the kernel to SIGKILL the child when its parent thread exits.
#[cfg(target_os = "linux")]
#[allow(unsafe_code)]
fn die_with_parent(cmd: &mut Command) {
    // SAFETY: prctl is async-signal-safe and touches no parent state.
    unsafe {
        cmd.pre_exec(|| {
            if libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGKILL) == -1 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        });
    }
}

#[cfg(not(target_os = "linux"))]
fn die_with_parent(_cmd: &mut Command) {}

/// Waits for `child` to exit, killing it first if `kill` fires.
pub(crate) async fn reap(mut child: Child, kill: &CancellationToken) -> Option<ExitStatus> {
    let status = tokio::select! {
        status = child.wait() => status,
        () = kill.cancelled() => {
            debug!(pid = ?child.id(), "killing vmm");
            if let Err(e) = child.start_kill() {
                warn!(error = %e, "could not signal vmm");
            }
            child.wait().await
        }
    };
    match status {
        Ok(status) => Some(status),
        Err(e) => {
            warn!(error = %e, "could not reap vmm");
            None
        }
    }
}

/// Resolves `program` to an executable path.
///
/// Names without a path separator are searched on `PATH`; anything else is
/// checked in place.
pub fn which(program: impl AsRef<Path>) -> Result<PathBuf> {
    let program = program.as_ref();
    ::which::which(program).map_err(|e| {
        debug!(program = %program.display(), error = %e, "executable lookup failed");
        Error::DependencyMissing {
            program: program.display().to_string(),
        }
    })
}
