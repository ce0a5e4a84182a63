//! Supervisor for [cloud-hypervisor] micro-VMs.
//!
//! `chv` launches a VMM process, waits for its control socket to answer,
//! creates and boots a guest, then watches the process until it is shut
//! down or dies. It also translates a user-facing [`Config`] into the
//! VMM's wire format and builds NoCloud cloud-init seed disks.
//!
//! # Quick start
//!
//! ```no_run
//! # async fn demo() -> chv::Result<()> {
//! use chv::{CloudInit, Config, DiskConfig, KernelConfig, Machine, MemoryConfig};
//! use tokio_util::sync::CancellationToken;
//!
//! let seed = CloudInit::new("web-1", "12:34:56:78:90:01", "10.0.0.2/24", "10.0.0.1")
//!     .user("ops")
//!     .ssh_key("ssh-ed25519 AAAA... ops@host")
//!     .build("/var/lib/chv/web-1-seed.iso")?;
//!
//! let config = Config {
//!     kernel: KernelConfig {
//!         firmware: Some("/usr/share/cloud-hypervisor/hypervisor-fw".into()),
//!         ..KernelConfig::default()
//!     },
//!     disks: vec![
//!         DiskConfig::new("/var/lib/chv/focal.raw"),
//!         CloudInit::disk_config(&seed),
//!     ],
//!     memory: MemoryConfig::mib(1024),
//!     ..Config::default()
//! };
//!
//! let cancel = CancellationToken::new();
//! let machine = Machine::new(config.to_vm_config()?)?;
//! machine.start(&cancel).await?;
//! machine.wait(&cancel).await?;
//! # Ok(())
//! # }
//! ```
//!
//! [cloud-hypervisor]: https://www.cloudhypervisor.org

#[cfg(unix)]
mod client;
mod cloudinit;
mod config;
mod error;
pub mod iso9660;
#[cfg(unix)]
mod machine;
#[cfg(unix)]
mod process;
#[cfg(unix)]
mod ready;

pub use chv_api as api;
#[cfg(unix)]
pub use client::{ControlClient, HttpClient};
pub use cloudinit::{CloudInit, VOLUME_LABEL};
pub use config::{
    Config, ConsoleConfig, ConsoleMode, CpuConfig, DEFAULT_VSOCK_CID, DebugConfig, DeviceConfig,
    DiskConfig, KernelConfig, MemoryConfig, NetworkConfig, Vm, VmState, VsockConfig,
};
pub use error::{ControlError, Error, Result};
#[cfg(unix)]
pub use machine::{Machine, MachineBuilder};
#[cfg(unix)]
pub use process::{DEFAULT_PROGRAM, Launcher, LogLevel, Output, ProcessState, which};
#[cfg(unix)]
pub use ready::Prober;
