//! Control operations exposed by the VMM and their HTTP shape.

use std::fmt;

/// Path prefix of every control endpoint.
pub const API_PREFIX: &str = "/api/v1/";

/// HTTP method used by a control operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum Method {
    /// Read-only query.
    Get,
    /// State-changing action.
    Put,
}

impl Method {
    /// Upper-case method token as sent on the wire.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Put => "PUT",
        }
    }
}

/// A named control operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum Operation {
    /// Create the guest from a [`VmConfig`](crate::VmConfig).
    Create,
    /// Boot the created guest.
    Boot,
    /// Pause all vCPUs.
    Pause,
    /// Resume a paused guest.
    Resume,
    /// Write a snapshot of a paused guest.
    Snapshot,
    /// Restore a guest from a snapshot.
    Restore,
    /// Reboot the guest.
    Reboot,
    /// Inject an ACPI power-button event.
    PowerButton,
    /// Shut the guest down.
    Shutdown,
    /// Delete the guest definition.
    Delete,
    /// Terminate the VMM process itself.
    ShutdownVmm,
    /// Query guest configuration and state.
    Info,
    /// VMM liveness check.
    Ping,
}

impl Operation {
    /// Endpoint name below [`API_PREFIX`].
    pub const fn endpoint(self) -> &'static str {
        match self {
            Self::Create => "vm.create",
            Self::Boot => "vm.boot",
            Self::Pause => "vm.pause",
            Self::Resume => "vm.resume",
            Self::Snapshot => "vm.snapshot",
            Self::Restore => "vm.restore",
            Self::Reboot => "vm.reboot",
            Self::PowerButton => "vm.power-button",
            Self::Shutdown => "vm.shutdown",
            Self::Delete => "vm.delete",
            Self::ShutdownVmm => "vmm.shutdown",
            Self::Info => "vm.info",
            Self::Ping => "vmm.ping",
        }
    }

    /// HTTP method of the operation.
    pub const fn method(self) -> Method {
        match self {
            Self::Info | Self::Ping => Method::Get,
            _ => Method::Put,
        }
    }

    /// Full request path, e.g. `/api/v1/vm.boot`.
    pub fn path(self) -> String {
        format!("{API_PREFIX}{}", self.endpoint())
    }

    /// Status code that signals success: `200` for queries, `204` for
    /// state-changing actions.
    pub const fn success_status(self) -> u16 {
        match self.method() {
            Method::Get => 200,
            Method::Put => 204,
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.endpoint())
    }
}

/// Raw outcome of a control request: status code plus body bytes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApiResponse {
    /// HTTP status code.
    pub status: u16,
    /// Response body (possibly empty).
    pub body: Vec<u8>,
}

impl ApiResponse {
    /// Creates a response.
    pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    /// Returns `true` if `status` is the success code of `op`.
    pub const fn is_success(&self, op: Operation) -> bool {
        self.status == op.success_status()
    }

    /// Body as text, lossily decoded.
    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}
