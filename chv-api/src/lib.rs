//! Wire types for the cloud-hypervisor control API.
//!
//! The VMM exposes a REST API over a Unix socket. Requests and responses
//! are JSON; state-changing operations answer `204 No Content`, queries
//! answer `200 OK` with a body.

mod codec;
mod endpoint;
mod types;

pub use codec::{MAX_BODY, check_len, decode, encode};
pub use endpoint::{API_PREFIX, ApiResponse, Method, Operation};
pub use types::{
    ConsoleConfig, ConsoleMode, CpusConfig, DebugConsoleConfig, DeviceConfig, DiskConfig,
    MemoryConfig, NetConfig, PayloadConfig, RestoreConfig, VmConfig, VmInfo, VmSnapshotConfig,
    VmState, VmmPingResponse, VsockConfig,
};
