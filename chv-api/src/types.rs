//! Request and response bodies of the cloud-hypervisor control API.
//!
//! Field names follow the upstream OpenAPI schema so the types serialize
//! to exactly what the VMM expects. Optional fields are omitted when unset.

use serde::{Deserialize, Serialize};

/// Complete guest boot configuration consumed by `vm.create`.
///
/// Once handed to the supervisor this value is never mutated: the create
/// operation consumes it exactly once.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmConfig {
    /// vCPU counts.
    pub cpus: CpusConfig,
    /// Guest RAM.
    pub memory: MemoryConfig,
    /// Kernel / firmware payload.
    pub payload: PayloadConfig,
    /// Block devices.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub disks: Vec<DiskConfig>,
    /// Network interfaces.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub net: Vec<NetConfig>,
    /// VFIO passthrough devices.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub devices: Vec<DeviceConfig>,
    /// virtio-console.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub console: Option<ConsoleConfig>,
    /// Legacy serial port.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub serial: Option<ConsoleConfig>,
    /// Debug console (x86 I/O port 0xe9).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub debug_console: Option<DebugConsoleConfig>,
    /// virtio-vsock device.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vsock: Option<VsockConfig>,
}

/// vCPU configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CpusConfig {
    /// vCPUs online at boot.
    pub boot_vcpus: u32,
    /// Upper bound for hotplug.
    pub max_vcpus: u32,
}

impl CpusConfig {
    /// Creates a vCPU configuration.
    pub const fn new(boot_vcpus: u32, max_vcpus: u32) -> Self {
        Self {
            boot_vcpus,
            max_vcpus,
        }
    }
}

/// Guest memory configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryConfig {
    /// Size in bytes.
    pub size: u64,
}

impl MemoryConfig {
    /// Creates a memory configuration of `size` bytes.
    pub const fn new(size: u64) -> Self {
        Self { size }
    }
}

/// Boot payload: either a kernel (with optional initramfs and command line)
/// or a firmware image.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayloadConfig {
    /// Firmware path (e.g. `hypervisor-fw`, `CLOUDHV.fd`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub firmware: Option<String>,
    /// Kernel image path.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kernel: Option<String>,
    /// Kernel command line.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cmdline: Option<String>,
    /// Initramfs path.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initramfs: Option<String>,
}

/// A virtio-block device.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskConfig {
    /// Backing image path.
    pub path: String,
    /// Expose the disk read-only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub readonly: Option<bool>,
    /// Open the backing file with `O_DIRECT`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub direct: Option<bool>,
    /// Device identifier.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

impl DiskConfig {
    /// Creates a writable disk entry for `path`.
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }
}

/// A virtio-net device.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetConfig {
    /// Host TAP interface name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tap: Option<String>,
    /// Host-side IP address of the TAP interface.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    /// Host-side netmask.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mask: Option<String>,
    /// Guest MAC address.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mac: Option<String>,
    /// Host MAC address of the TAP interface.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_mac: Option<String>,
    /// Device identifier.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

/// A VFIO passthrough device.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// sysfs path of the device.
    pub path: String,
    /// Device identifier.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

impl DeviceConfig {
    /// Creates a passthrough entry for the sysfs `path`.
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            id: None,
        }
    }
}

/// Output mode of a console device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[non_exhaustive]
pub enum ConsoleMode {
    /// Disabled.
    #[default]
    Off,
    /// Allocate a pseudo-terminal.
    Pty,
    /// Use the VMM's own terminal.
    Tty,
    /// Write to a file.
    File,
    /// Expose on a Unix socket.
    Socket,
    /// Discard output.
    Null,
}

/// virtio-console or serial port configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsoleConfig {
    /// Output mode.
    pub mode: ConsoleMode,
    /// Output file (mode `File`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    /// Socket path (mode `Socket`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub socket: Option<String>,
}

impl ConsoleConfig {
    /// Creates a console configuration with the given mode.
    pub const fn new(mode: ConsoleMode) -> Self {
        Self {
            mode,
            file: None,
            socket: None,
        }
    }
}

/// Debug console configuration. `Socket` mode is not supported upstream.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DebugConsoleConfig {
    /// Output mode.
    pub mode: ConsoleMode,
    /// Output file (mode `File`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
}

/// virtio-vsock configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VsockConfig {
    /// Guest context ID (>= 3).
    pub cid: u64,
    /// Host-side Unix socket path.
    pub socket: String,
    /// Device identifier.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

/// Guest state as reported by `vm.info`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[non_exhaustive]
pub enum VmState {
    /// Created but not booted.
    Created,
    /// Booted and running.
    Running,
    /// Shut down; may be booted again.
    Shutdown,
    /// Paused.
    Paused,
}

/// Body of a successful `vm.info` query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmInfo {
    /// Effective guest configuration.
    pub config: VmConfig,
    /// Current guest state.
    pub state: VmState,
    /// Memory actually backing the guest, in bytes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_actual_size: Option<u64>,
}

/// Body of a successful `vmm.ping` query.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmmPingResponse {
    /// VMM version.
    pub version: String,
    /// Build (git) version.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build_version: Option<String>,
    /// VMM process ID.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<i64>,
    /// Compiled-in features.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub features: Vec<String>,
}

/// Body of `vm.snapshot`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmSnapshotConfig {
    /// Target directory URL (`file:///path`).
    pub destination_url: String,
}

impl VmSnapshotConfig {
    /// Snapshot into the local directory `path`.
    pub fn to_path(path: &str) -> Self {
        Self {
            destination_url: file_url(path),
        }
    }
}

/// Body of `vm.restore`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestoreConfig {
    /// Source directory URL (`file:///path`).
    pub source_url: String,
    /// Populate guest memory eagerly.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefault: Option<bool>,
}

impl RestoreConfig {
    /// Restore from the local directory `path`.
    pub fn from_path(path: &str) -> Self {
        Self {
            source_url: file_url(path),
            prefault: None,
        }
    }
}

/// Turns a local path into a `file://` URL; existing URLs pass through.
fn file_url(path: &str) -> String {
    if path.contains("://") {
        path.to_owned()
    } else {
        format!("file://{path}")
    }
}
