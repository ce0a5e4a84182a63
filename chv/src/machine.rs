//! Machine lifecycle supervision.
//!
//! A [`Machine`] owns one VMM process and the guest it hosts. `start`
//! launches the VMM, waits for its control endpoint, then creates and boots
//! the guest. From then on a background reaper watches the process: an exit
//! that follows [`Machine::shutdown`] ends the machine cleanly, any other
//! exit is recorded as its fatal error.
//!
//! # Example
//!
//! ```no_run
//! # async fn demo(config: chv::Config) -> chv::Result<()> {
//! use chv::Machine;
//! use tokio_util::sync::CancellationToken;
//!
//! let cancel = CancellationToken::new();
//! let machine = Machine::builder(config.to_vm_config()?).build()?;
//! machine.start(&cancel).await?;
//! machine.wait(&cancel).await?;
//! # Ok(())
//! # }
//! ```

use std::ffi::OsString;
use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chv_api::{
    ApiResponse, Operation, RestoreConfig, VmConfig, VmInfo, VmSnapshotConfig, VmmPingResponse,
};
use serde::de::DeserializeOwned;
use tokio::process::Child;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::client::{ControlClient, HttpClient};
use crate::config::Vm;
use crate::error::{ControlError, Error, Result, expect_success};
use crate::process::{self, DEFAULT_PROGRAM, Launcher, LogLevel, Output, ProcessState};
use crate::ready::Prober;

/// How a machine ended.
#[derive(Debug, Clone)]
enum Exit {
    /// The VMM exited after an operator shutdown.
    Stopped,
    /// The machine failed; every waiter sees this error.
    Failed(Arc<Error>),
}

/// Write-once terminal outcome shared by all waiters.
#[derive(Debug)]
struct ExitSignal(watch::Sender<Option<Exit>>);

impl ExitSignal {
    fn new() -> Self {
        Self(watch::Sender::new(None))
    }

    /// Records `exit` unless an outcome is already recorded.
    fn close(&self, exit: Exit) -> bool {
        let mut exit = Some(exit);
        self.0.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = exit.take();
            true
        })
    }

    fn fail(&self, err: Error) -> bool {
        self.close(Exit::Failed(Arc::new(err)))
    }

    fn is_closed(&self) -> bool {
        self.0.borrow().is_some()
    }

    fn fatal_error(&self) -> Option<Arc<Error>> {
        match &*self.0.borrow() {
            Some(Exit::Failed(err)) => Some(Arc::clone(err)),
            _ => None,
        }
    }

    /// Resolves once an outcome is recorded.
    async fn closed(&self) -> Exit {
        let mut rx = self.0.subscribe();
        let exit = rx
            .wait_for(Option::is_some)
            .await
            .ok()
            .and_then(|exit| (*exit).clone());
        match exit {
            Some(exit) => exit,
            None => std::future::pending().await,
        }
    }
}

/// Builder for a [`Machine`].
///
/// Defaults: `cloud-hypervisor` from `PATH`, a fresh socket under the user
/// runtime directory, info-level VMM logging, inherited stdout/stderr, and
/// the [`Prober`] defaults.
#[derive(Debug)]
#[must_use = "a MachineBuilder does nothing until .build() is called"]
pub struct MachineBuilder {
    /// Guest configuration sent with `vm.create`.
    config: VmConfig,
    /// Program name or path.
    program: PathBuf,
    /// Extra arguments placed before the VMM flags.
    args: Vec<OsString>,
    /// Control socket; generated when unset.
    api_socket: Option<PathBuf>,
    /// VMM verbosity.
    log_level: LogLevel,
    /// VMM stdout/stderr routing.
    output: Output,
    /// Readiness timing.
    prober: Prober,
    /// Parent token; cancelling it kills the VMM.
    cancel: Option<CancellationToken>,
}

impl MachineBuilder {
    /// Starts a builder for a guest described by `config`.
    pub fn new(config: VmConfig) -> Self {
        Self {
            config,
            program: PathBuf::from(DEFAULT_PROGRAM),
            args: Vec::new(),
            api_socket: None,
            log_level: LogLevel::default(),
            output: Output::default(),
            prober: Prober::default(),
            cancel: None,
        }
    }

    /// VMM executable: a bare name is looked up on `PATH`.
    pub fn program(mut self, program: impl Into<PathBuf>) -> Self {
        self.program = program.into();
        self
    }

    /// Adds an argument placed before the VMM flags.
    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Control socket path.
    pub fn api_socket(mut self, path: impl Into<PathBuf>) -> Self {
        self.api_socket = Some(path.into());
        self
    }

    /// VMM log verbosity.
    pub const fn log_level(mut self, level: LogLevel) -> Self {
        self.log_level = level;
        self
    }

    /// VMM stdout/stderr routing.
    pub const fn output(mut self, output: Output) -> Self {
        self.output = output;
        self
    }

    /// How long `start` waits for the control endpoint.
    pub const fn ready_timeout(mut self, timeout: Duration) -> Self {
        self.prober.timeout = timeout;
        self
    }

    /// Interval between socket checks during startup.
    pub const fn poll_interval(mut self, interval: Duration) -> Self {
        self.prober.poll_interval = interval;
        self
    }

    /// Pause after a failed ping during startup.
    pub const fn retry_interval(mut self, interval: Duration) -> Self {
        self.prober.retry_interval = interval;
        self
    }

    /// Ties the VMM's lifetime to `token`: cancelling it kills the process.
    pub fn cancel_token(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Builds a machine talking HTTP over the control socket.
    ///
    /// # Errors
    ///
    /// [`Error::DependencyMissing`] if the VMM executable cannot be found.
    pub fn build(self) -> Result<Machine> {
        self.build_with(|socket| HttpClient::new(socket))
    }

    /// Builds a machine using the client returned by `connect` for the
    /// resolved socket path.
    pub fn build_with<C, F>(self, connect: F) -> Result<Machine<C>>
    where
        C: ControlClient,
        F: FnOnce(&Path) -> C,
    {
        let program = process::which(&self.program)?;
        let api_socket = match self.api_socket {
            Some(path) => path,
            None => default_socket()?,
        };

        let launcher = self
            .args
            .into_iter()
            .fold(Launcher::new(program, api_socket), Launcher::arg)
            .log_level(self.log_level)
            .output(self.output);
        let client = connect(launcher.api_socket());
        debug!(
            program = %launcher.program().display(),
            socket = %launcher.api_socket().display(),
            "machine configured"
        );

        Ok(Machine {
            client,
            config: self.config,
            launcher,
            prober: self.prober,
            vmm: self
                .cancel
                .map_or_else(CancellationToken::new, |parent| parent.child_token()),
            started: AtomicBool::new(false),
            stopping: Arc::new(AtomicBool::new(false)),
            process: Arc::new(watch::Sender::new(ProcessState::NotStarted)),
            exit: Arc::new(ExitSignal::new()),
        })
    }
}

/// A supervised VMM process and its guest.
///
/// All methods take `&self`; a machine can be shared across tasks behind an
/// `Arc`. Dropping it kills the VMM.
#[derive(Debug)]
pub struct Machine<C = HttpClient> {
    /// Control endpoint.
    client: C,
    /// Sent once with `vm.create`.
    config: VmConfig,
    /// Spawns the VMM.
    launcher: Launcher,
    /// Startup readiness timing.
    prober: Prober,
    /// Cancelled to kill the VMM.
    vmm: CancellationToken,
    /// Start gate.
    started: AtomicBool,
    /// Set once the operator asked the VMM to exit.
    stopping: Arc<AtomicBool>,
    /// Process lifecycle, written by `start` and then by the reaper.
    process: Arc<watch::Sender<ProcessState>>,
    /// Terminal outcome.
    exit: Arc<ExitSignal>,
}

impl Machine {
    /// Starts a builder for a guest described by `config`.
    pub fn builder(config: VmConfig) -> MachineBuilder {
        MachineBuilder::new(config)
    }

    /// Machine with every default. See [`MachineBuilder`].
    pub fn new(config: VmConfig) -> Result<Self> {
        MachineBuilder::new(config).build()
    }
}

impl<C: ControlClient> Machine<C> {
    /// Launches the VMM, waits for its control endpoint, then creates and
    /// boots the guest.
    ///
    /// `cancel` bounds the launch and readiness phases. Only the first call
    /// proceeds; later calls fail with [`Error::AlreadyStarted`]. Any other
    /// failure is recorded as the machine's fatal error, the VMM is killed,
    /// and the recorded error is returned.
    pub async fn start(&self, cancel: &CancellationToken) -> Result<()> {
        if self
            .started
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(Error::AlreadyStarted);
        }

        match self.boot(cancel).await {
            Ok(pid) => {
                info!(pid, socket = %self.launcher.api_socket().display(), "machine started");
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "machine failed to start");
                let err = Arc::new(e);
                self.exit.close(Exit::Failed(Arc::clone(&err)));
                self.vmm.cancel();
                Err(Error::Fatal(self.exit.fatal_error().unwrap_or(err)))
            }
        }
    }

    async fn boot(&self, cancel: &CancellationToken) -> Result<u32> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let child = self.launcher.launch()?;
        let pid = child.id().ok_or(Error::NotRunning)?;
        self.process.send_replace(ProcessState::Running { pid });
        let mut process = self.process.subscribe();
        self.spawn_reaper(child);

        self.prober
            .wait_ready(&self.client, self.launcher.api_socket(), &mut process, cancel)
            .await?;
        debug!(pid, "vmm ready");

        expect_success(Operation::Create, self.client.create_vm(&self.config).await)
            .map_err(Error::CreateFailed)?;
        expect_success(Operation::Boot, self.client.boot_vm().await)
            .map_err(Error::BootFailed)?;
        Ok(pid)
    }

    /// Reaps the VMM in the background and publishes its exit.
    fn spawn_reaper(&self, child: Child) {
        let process = Arc::clone(&self.process);
        let exit = Arc::clone(&self.exit);
        let stopping = Arc::clone(&self.stopping);
        let kill = self.vmm.clone();

        tokio::spawn(async move {
            let status = process::reap(child, &kill).await;
            process.send_replace(ProcessState::Exited(status));

            if stopping.load(Ordering::Acquire) {
                info!(?status, "vmm stopped");
                exit.close(Exit::Stopped);
            } else if exit.fail(Error::VmmExited { status }) {
                warn!(?status, "vmm exited unexpectedly");
            } else {
                debug!(?status, "vmm reaped");
            }
        });
    }

    /// PID of the running VMM.
    ///
    /// # Errors
    ///
    /// [`Error::NotRunning`] before launch and once the machine has ended.
    pub fn pid(&self) -> Result<u32> {
        if self.exit.is_closed() {
            return Err(Error::NotRunning);
        }
        match *self.process.borrow() {
            ProcessState::Running { pid } => Ok(pid),
            _ => Err(Error::NotRunning),
        }
    }

    /// Pauses the guest's vCPUs.
    pub async fn pause(&self) -> Result<()> {
        self.act(Operation::Pause, self.client.pause_vm()).await
    }

    /// Resumes a paused guest.
    pub async fn resume(&self) -> Result<()> {
        self.act(Operation::Resume, self.client.resume_vm()).await
    }

    /// Reboots the guest.
    pub async fn reboot(&self) -> Result<()> {
        self.act(Operation::Reboot, self.client.reboot_vm()).await
    }

    /// Presses the virtual power button.
    pub async fn power_button(&self) -> Result<()> {
        self.act(Operation::PowerButton, self.client.power_button_vm()).await
    }

    /// Deletes the guest definition from the VMM.
    pub async fn delete(&self) -> Result<()> {
        self.act(Operation::Delete, self.client.delete_vm()).await
    }

    /// Writes a snapshot of the (paused) guest into the directory `dest`.
    pub async fn snapshot(&self, dest: impl AsRef<Path>) -> Result<()> {
        let config = VmSnapshotConfig::to_path(&dest.as_ref().to_string_lossy());
        expect_success(Operation::Snapshot, self.client.snapshot_vm(&config).await)
            .map_err(Error::SnapshotFailed)?;
        info!(destination = %config.destination_url, "snapshot written");
        Ok(())
    }

    /// Restores guest state from the snapshot directory `src`.
    pub async fn restore(&self, src: impl AsRef<Path>) -> Result<()> {
        let config = RestoreConfig::from_path(&src.as_ref().to_string_lossy());
        expect_success(Operation::Restore, self.client.restore_vm(&config).await)
            .map_err(Error::RestoreFailed)?;
        info!(source = %config.source_url, "snapshot restored");
        Ok(())
    }

    /// Shuts the guest down, then asks the VMM to exit.
    ///
    /// The resulting process exit ends the machine without a fatal error.
    /// Neither failure closes the machine by itself.
    pub async fn shutdown(&self, cancel: &CancellationToken) -> Result<()> {
        tokio::select! {
            res = self.stop() => res,
            () = cancel.cancelled() => Err(Error::Cancelled),
        }
    }

    async fn stop(&self) -> Result<()> {
        expect_success(Operation::Shutdown, self.client.shutdown_vm().await)
            .map_err(Error::ShutdownFailed)?;
        debug!("guest shut down");

        self.stopping.store(true, Ordering::Release);
        match expect_success(Operation::ShutdownVmm, self.client.shutdown_vmm().await) {
            Ok(_) => {
                info!("vmm shutting down");
                Ok(())
            }
            Err(e) => {
                // A refusal means the VMM stays up; a transport error may
                // mean it is already going away.
                if matches!(e, ControlError::Status { .. }) {
                    self.stopping.store(false, Ordering::Release);
                }
                Err(Error::VmmShutdownFailed(e))
            }
        }
    }

    /// Blocks until the machine ends or `cancel` fires.
    ///
    /// Returns `Ok(())` after a clean shutdown and the recorded fatal error
    /// otherwise. Any number of callers may wait; all see the same outcome.
    pub async fn wait(&self, cancel: &CancellationToken) -> Result<()> {
        tokio::select! {
            exit = self.exit.closed() => match exit {
                Exit::Stopped => Ok(()),
                Exit::Failed(err) => Err(Error::Fatal(err)),
            },
            () = cancel.cancelled() => Err(Error::Cancelled),
        }
    }

    /// VMM version information.
    pub async fn version(&self) -> Result<VmmPingResponse> {
        self.query(Operation::Ping, self.client.vmm_ping()).await
    }

    /// Guest configuration and state.
    pub async fn info(&self) -> Result<Vm> {
        self.query::<VmInfo>(Operation::Info, self.client.vm_info())
            .await
            .map(Vm::from)
    }

    /// The recorded fatal error, if any. Never blocks.
    pub fn fatal_error(&self) -> Option<Arc<Error>> {
        self.exit.fatal_error()
    }

    /// Control socket path.
    pub fn api_socket(&self) -> &Path {
        self.launcher.api_socket()
    }

    /// Guest configuration sent with `vm.create`.
    pub const fn config(&self) -> &VmConfig {
        &self.config
    }

    /// Control client in use.
    pub const fn client(&self) -> &C {
        &self.client
    }

    async fn act(
        &self,
        op: Operation,
        call: impl Future<Output = io::Result<ApiResponse>>,
    ) -> Result<()> {
        expect_success(op, call.await)
            .map_err(|source| Error::ControlOperationFailed { op, source })?;
        debug!(%op, "control operation succeeded");
        Ok(())
    }

    async fn query<T: DeserializeOwned>(
        &self,
        op: Operation,
        call: impl Future<Output = io::Result<ApiResponse>>,
    ) -> Result<T> {
        let resp = expect_success(op, call.await)
            .map_err(|source| Error::QueryFailed { op, source })?;
        chv_api::decode(&resp.body).map_err(|e| Error::QueryFailed {
            op,
            source: ControlError::Decode(e),
        })
    }
}

impl<C> Drop for Machine<C> {
    fn drop(&mut self) {
        self.vmm.cancel();
    }
}

/// `{runtime dir}/chv/{id}.sock`, falling back to the temp dir.
fn default_socket() -> io::Result<PathBuf> {
    let dir = dirs::runtime_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("chv");
    std::fs::create_dir_all(&dir)?;
    Ok(dir.join(format!("{}.sock", gen_id())))
}

/// Generates a random 12-character hex id.
fn gen_id() -> String {
    use std::collections::hash_map::RandomState;
    use std::hash::{BuildHasher, Hasher};
    use std::time::{SystemTime, UNIX_EPOCH};

    let mut h = RandomState::new().build_hasher();
    h.write_u32(std::process::id());
    h.write_u128(
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos(),
    );
    format!("{:012x}", h.finish() & 0xffff_ffff_ffff)
}
