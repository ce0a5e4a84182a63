//! User-facing machine configuration and its translation to the wire
//! [`VmConfig`](chv_api::VmConfig).
//!
//! [`Config`] is the document operators write (JSON). [`Config::to_vm_config`]
//! validates it and produces the body of `vm.create`;
//! [`Config::from_vm_config`] maps a `vm.info` response back.

use chv_api as api;
pub use chv_api::{ConsoleMode, VmState};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Context id assigned to the guest when a vsock device omits one.
pub const DEFAULT_VSOCK_CID: u64 = 3;

/// Machine configuration document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// Boot payload.
    pub kernel: KernelConfig,
    /// Block devices, in attach order.
    #[serde(default)]
    pub disks: Vec<DiskConfig>,
    /// Network interfaces.
    #[serde(default)]
    pub networks: Vec<NetworkConfig>,
    /// VFIO passthrough devices.
    #[serde(default)]
    pub devices: Vec<DeviceConfig>,
    /// vCPU topology.
    pub cpu: CpuConfig,
    /// Guest memory.
    pub memory: MemoryConfig,
    /// virtio-console.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub console: Option<ConsoleConfig>,
    /// Debug console.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub debug: Option<DebugConfig>,
    /// Legacy serial port.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub serial: Option<ConsoleConfig>,
    /// virtio-vsock.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vsock: Option<VsockConfig>,
}

/// Kernel or firmware payload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KernelConfig {
    /// Kernel image.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    /// Initial ramdisk.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initrd: Option<String>,
    /// Kernel command line.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<String>,
    /// Firmware image (e.g. rust-hypervisor-firmware), used instead of a kernel.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub firmware: Option<String>,
}

/// Block device.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskConfig {
    /// Backing image path.
    pub path: String,
    /// Attach read-only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub readonly: Option<bool>,
    /// Open with `O_DIRECT`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub direct: Option<bool>,
    /// Device identifier.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

impl DiskConfig {
    /// Read-write disk backed by `path`.
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    /// Marks the disk read-only.
    #[must_use]
    pub const fn readonly(mut self) -> Self {
        self.readonly = Some(true);
        self
    }
}

/// Network interface.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Device identifier.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Host-side IP of the tap device.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    /// Guest MAC address.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mac: Option<String>,
    /// Host-side netmask.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mask: Option<String>,
    /// Existing tap device to attach.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tap: Option<String>,
    /// Guest default gateway. Only consumed by cloud-init; never sent to the VMM.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway: Option<String>,
}

/// VFIO device.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// sysfs path of the device.
    pub path: String,
    /// Device identifier.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

/// vCPU topology. `max_vcpus` of zero means "same as boot".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CpuConfig {
    /// vCPUs online at boot.
    pub boot_vcpus: u32,
    /// Hotplug ceiling.
    #[serde(default)]
    pub max_vcpus: u32,
}

/// Guest memory.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryConfig {
    /// Size in bytes.
    pub size: u64,
}

impl MemoryConfig {
    /// `mib` mebibytes.
    pub const fn mib(mib: u64) -> Self {
        Self {
            size: mib * 1024 * 1024,
        }
    }
}

/// Console or serial port.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsoleConfig {
    /// Output mode.
    pub mode: ConsoleMode,
    /// Output file for `File` mode.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    /// Socket path for `Socket` mode.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub socket: Option<String>,
}

/// Debug console.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DebugConfig {
    /// Output mode.
    pub mode: ConsoleMode,
    /// Output file for `File` mode.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
}

/// virtio-vsock device.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VsockConfig {
    /// Device identifier.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Guest context id. Defaults to 3.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cid: Option<u64>,
    /// Host-side Unix socket.
    pub socket: String,
}

/// A guest as reported by `vm.info`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vm {
    /// Configuration, in the user-facing schema.
    pub config: Config,
    /// Current state.
    pub state: VmState,
}

impl From<api::VmInfo> for Vm {
    fn from(info: api::VmInfo) -> Self {
        Self {
            config: Config::from_vm_config(&info.config),
            state: info.state,
        }
    }
}

impl Config {
    /// Checks that the document describes a bootable guest.
    pub fn validate(&self) -> Result<()> {
        if self.cpu.boot_vcpus == 0 {
            return invalid("cpu.boot_vcpus must be at least 1");
        }
        if self.cpu.max_vcpus != 0 && self.cpu.max_vcpus < self.cpu.boot_vcpus {
            return invalid(format!(
                "cpu.max_vcpus ({}) is below cpu.boot_vcpus ({})",
                self.cpu.max_vcpus, self.cpu.boot_vcpus
            ));
        }
        if self.memory.size == 0 {
            return invalid("memory.size must be non-zero");
        }
        if self.kernel.path.is_none() && self.kernel.firmware.is_none() {
            return invalid("kernel.path or kernel.firmware is required");
        }
        if let Some(i) = self.disks.iter().position(|d| d.path.is_empty()) {
            return invalid(format!("disks[{i}].path is empty"));
        }
        if let Some(i) = self.devices.iter().position(|d| d.path.is_empty()) {
            return invalid(format!("devices[{i}].path is empty"));
        }
        for (i, net) in self.networks.iter().enumerate() {
            match &net.mac {
                Some(mac) if parse_mac(mac).is_none() => {
                    return invalid(format!("networks[{i}].mac: malformed MAC address {mac:?}"));
                }
                _ => {}
            }
        }
        if let Some(console) = &self.console {
            check_console("console", console.mode, console.file.as_ref(), console.socket.as_ref())?;
        }
        if let Some(serial) = &self.serial {
            check_console("serial", serial.mode, serial.file.as_ref(), serial.socket.as_ref())?;
        }
        if let Some(debug) = &self.debug {
            if debug.mode == ConsoleMode::Socket {
                return invalid("debug: socket mode is not supported");
            }
            check_console("debug", debug.mode, debug.file.as_ref(), None)?;
        }
        if let Some(vsock) = &self.vsock {
            if vsock.socket.is_empty() {
                return invalid("vsock.socket is empty");
            }
            if vsock.cid.is_some_and(|cid| cid < DEFAULT_VSOCK_CID) {
                return invalid("vsock.cid must be at least 3");
            }
        }
        Ok(())
    }

    /// Validates the document and produces the `vm.create` body.
    pub fn to_vm_config(&self) -> Result<api::VmConfig> {
        self.validate()?;

        let max_vcpus = if self.cpu.max_vcpus == 0 {
            self.cpu.boot_vcpus
        } else {
            self.cpu.max_vcpus
        };

        Ok(api::VmConfig {
            cpus: api::CpusConfig::new(self.cpu.boot_vcpus, max_vcpus),
            memory: api::MemoryConfig::new(self.memory.size),
            payload: api::PayloadConfig {
                firmware: self.kernel.firmware.clone(),
                kernel: self.kernel.path.clone(),
                cmdline: self.kernel.args.clone(),
                initramfs: self.kernel.initrd.clone(),
            },
            disks: self
                .disks
                .iter()
                .map(|d| api::DiskConfig {
                    path: d.path.clone(),
                    readonly: d.readonly,
                    direct: d.direct,
                    id: d.id.clone(),
                })
                .collect(),
            net: self
                .networks
                .iter()
                .map(|n| api::NetConfig {
                    tap: n.tap.clone(),
                    ip: n.ip.clone(),
                    mask: n.mask.clone(),
                    mac: n.mac.clone(),
                    host_mac: None,
                    id: n.id.clone(),
                })
                .collect(),
            devices: self
                .devices
                .iter()
                .map(|d| api::DeviceConfig {
                    path: d.path.clone(),
                    id: d.id.clone(),
                })
                .collect(),
            console: self.console.as_ref().map(to_console),
            serial: self.serial.as_ref().map(to_console),
            debug_console: self.debug.as_ref().map(|d| api::DebugConsoleConfig {
                mode: d.mode,
                file: d.file.clone(),
            }),
            vsock: self.vsock.as_ref().map(|v| api::VsockConfig {
                cid: v.cid.unwrap_or(DEFAULT_VSOCK_CID),
                socket: v.socket.clone(),
                id: v.id.clone(),
            }),
        })
    }

    /// Maps a wire configuration back into the user-facing schema.
    pub fn from_vm_config(vm: &api::VmConfig) -> Self {
        Self {
            kernel: KernelConfig {
                path: vm.payload.kernel.clone(),
                initrd: vm.payload.initramfs.clone(),
                args: vm.payload.cmdline.clone(),
                firmware: vm.payload.firmware.clone(),
            },
            disks: vm
                .disks
                .iter()
                .map(|d| DiskConfig {
                    path: d.path.clone(),
                    readonly: d.readonly,
                    direct: d.direct,
                    id: d.id.clone(),
                })
                .collect(),
            networks: vm
                .net
                .iter()
                .map(|n| NetworkConfig {
                    id: n.id.clone(),
                    ip: n.ip.clone(),
                    mac: n.mac.clone(),
                    mask: n.mask.clone(),
                    tap: n.tap.clone(),
                    gateway: None,
                })
                .collect(),
            devices: vm
                .devices
                .iter()
                .map(|d| DeviceConfig {
                    path: d.path.clone(),
                    id: d.id.clone(),
                })
                .collect(),
            cpu: CpuConfig {
                boot_vcpus: vm.cpus.boot_vcpus,
                max_vcpus: vm.cpus.max_vcpus,
            },
            memory: MemoryConfig {
                size: vm.memory.size,
            },
            console: vm.console.as_ref().map(from_console),
            debug: vm.debug_console.as_ref().map(|d| DebugConfig {
                mode: d.mode,
                file: d.file.clone(),
            }),
            serial: vm.serial.as_ref().map(from_console),
            vsock: vm.vsock.as_ref().map(|v| VsockConfig {
                id: v.id.clone(),
                cid: Some(v.cid),
                socket: v.socket.clone(),
            }),
        }
    }
}

fn to_console(c: &ConsoleConfig) -> api::ConsoleConfig {
    api::ConsoleConfig {
        mode: c.mode,
        file: c.file.clone(),
        socket: c.socket.clone(),
    }
}

fn from_console(c: &api::ConsoleConfig) -> ConsoleConfig {
    ConsoleConfig {
        mode: c.mode,
        file: c.file.clone(),
        socket: c.socket.clone(),
    }
}

fn check_console(
    name: &str,
    mode: ConsoleMode,
    file: Option<&String>,
    socket: Option<&String>,
) -> Result<()> {
    match mode {
        ConsoleMode::File if file.is_none_or(String::is_empty) => {
            invalid(format!("{name}: file mode requires a file"))
        }
        ConsoleMode::Socket if socket.is_none_or(String::is_empty) => {
            invalid(format!("{name}: socket mode requires a socket"))
        }
        _ => Ok(()),
    }
}

fn invalid(msg: impl Into<String>) -> Result<()> {
    Err(Error::InvalidConfig(msg.into()))
}

/// Parses `aa:bb:cc:dd:ee:ff` (case-insensitive).
pub(crate) fn parse_mac(s: &str) -> Option<[u8; 6]> {
    let mut mac = [0u8; 6];
    let mut parts = s.split(':');
    for byte in &mut mac {
        let part = parts.next()?;
        if part.len() != 2 || !part.bytes().all(|b| b.is_ascii_hexdigit()) {
            return None;
        }
        *byte = u8::from_str_radix(part, 16).ok()?;
    }
    parts.next().is_none().then_some(mac)
}
