//! `chv run`: boot a machine from a config document and supervise it.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use chv::{CloudInit, Config, LogLevel, Machine};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// How long an interrupted machine gets to shut down before it is killed.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Arguments for `chv run`.
#[derive(clap::Args)]
pub struct RunArgs {
    /// Machine configuration (JSON).
    #[arg(long, short = 'c')]
    config: PathBuf,

    /// Control socket path. Defaults to a fresh path under the runtime dir.
    #[arg(long)]
    api_socket: Option<PathBuf>,

    /// VMM executable.
    #[arg(long, default_value = chv::DEFAULT_PROGRAM)]
    vmm: PathBuf,

    /// Seconds to wait for the VMM's control socket.
    #[arg(long, default_value_t = 10)]
    timeout: u64,

    #[command(flatten)]
    seed: SeedArgs,
}

/// Cloud-init seed options. Giving a hostname builds a seed disk.
#[derive(clap::Args)]
struct SeedArgs {
    /// Guest hostname.
    #[arg(long = "cloud-init-hostname", requires_all = ["mac", "cidr", "gateway", "seed"])]
    hostname: Option<String>,

    /// MAC of the guest interface to configure.
    #[arg(long = "cloud-init-mac", requires = "hostname")]
    mac: Option<String>,

    /// Guest address with prefix length, e.g. `10.0.5.2/24`.
    #[arg(long = "cloud-init-cidr", requires = "hostname")]
    cidr: Option<String>,

    /// Default gateway.
    #[arg(long = "cloud-init-gateway", requires = "hostname")]
    gateway: Option<String>,

    /// Login user.
    #[arg(long = "cloud-init-user", requires = "hostname")]
    user: Option<String>,

    /// SSH public key for the login user. Repeatable.
    #[arg(long = "cloud-init-ssh-key", requires = "hostname")]
    ssh_keys: Vec<String>,

    /// DNS server. Repeatable.
    #[arg(long = "cloud-init-nameserver", requires = "hostname")]
    nameservers: Vec<String>,

    /// Where to write the seed image.
    #[arg(long = "cloud-init-seed", requires = "hostname")]
    seed: Option<PathBuf>,
}

impl SeedArgs {
    fn cloud_init(&self) -> Option<(CloudInit, &Path)> {
        let (Some(hostname), Some(mac), Some(cidr), Some(gateway), Some(seed)) = (
            &self.hostname,
            &self.mac,
            &self.cidr,
            &self.gateway,
            &self.seed,
        ) else {
            return None;
        };
        let mut ci = CloudInit::new(hostname, mac, cidr, gateway);
        ci.username.clone_from(&self.user);
        ci.ssh_authorized_keys.clone_from(&self.ssh_keys);
        ci.nameservers.clone_from(&self.nameservers);
        Some((ci, seed))
    }
}

impl RunArgs {
    pub async fn run(self, log_level: LogLevel) -> Result<()> {
        let mut config = load(&self.config)?;
        if let Some((ci, dest)) = self.seed.cloud_init() {
            let seed = ci.build(dest).context("cannot build cloud-init seed")?;
            info!(seed = %seed.display(), instance_id = %ci.instance_id(), "cloud-init seed written");
            config.disks.push(CloudInit::disk_config(&seed));
        }
        let vm_config = config
            .to_vm_config()
            .with_context(|| format!("invalid config {}", self.config.display()))?;

        let mut builder = Machine::builder(vm_config)
            .program(&self.vmm)
            .log_level(log_level)
            .ready_timeout(Duration::from_secs(self.timeout));
        if let Some(socket) = &self.api_socket {
            builder = builder.api_socket(socket);
        }
        let machine = builder.build()?;

        let interrupt = CancellationToken::new();
        tokio::spawn({
            let interrupt = interrupt.clone();
            async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    interrupt.cancel();
                }
            }
        });

        machine.start(&interrupt).await?;
        eprintln!(
            "machine running (pid {}, api socket {})",
            machine.pid()?,
            machine.api_socket().display()
        );

        match machine.wait(&interrupt).await {
            Err(chv::Error::Cancelled) => stop(&machine).await,
            res => res.map_err(Into::into),
        }
    }
}

/// Shuts the machine down, killing the VMM if it overruns the grace period.
async fn stop(machine: &Machine) -> Result<()> {
    info!("interrupted, shutting down");
    let never = CancellationToken::new();
    let graceful = async {
        machine.shutdown(&never).await?;
        machine.wait(&never).await
    };
    match tokio::time::timeout(SHUTDOWN_GRACE, graceful).await {
        Ok(res) => res.map_err(Into::into),
        Err(_) => {
            warn!(grace = ?SHUTDOWN_GRACE, "machine did not stop in time, killing vmm");
            Ok(())
        }
    }
}

/// Reads a JSON machine configuration.
fn load(path: &Path) -> Result<Config> {
    let raw = std::fs::read(path).with_context(|| format!("cannot read {}", path.display()))?;
    serde_json::from_slice(&raw).with_context(|| format!("cannot parse {}", path.display()))
}
