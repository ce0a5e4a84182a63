//! Error types for chv operations.

use std::io;
use std::process::ExitStatus;
use std::sync::Arc;
use std::time::Duration;

use chv_api::{ApiResponse, Operation};

/// Alias for `Result<T, chv::Error>`.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors returned by chv operations.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// The VMM executable could not be located.
    #[error("{program}: executable not found")]
    DependencyMissing {
        /// Program name or path that was looked up.
        program: String,
    },

    /// `start` was already called on this machine.
    #[error("machine already started")]
    AlreadyStarted,

    /// The VMM process was never launched or has already exited.
    #[error("vmm process is not running")]
    NotRunning,

    /// The control endpoint did not answer a ping before the deadline.
    #[error("vmm not ready after {0:?}")]
    VmmNotReady(Duration),

    /// The VMM process exited.
    #[error("vmm exited: {}", describe(.status.as_ref()))]
    VmmExited {
        /// Exit status, if the process could be reaped.
        status: Option<ExitStatus>,
    },

    /// `vm.create` was rejected.
    #[error("could not create vm")]
    CreateFailed(#[source] ControlError),

    /// `vm.boot` was rejected.
    #[error("could not boot vm")]
    BootFailed(#[source] ControlError),

    /// A post-start lifecycle operation was rejected.
    #[error("{op} failed")]
    ControlOperationFailed {
        /// The operation that failed.
        op: Operation,
        /// What went wrong.
        source: ControlError,
    },

    /// `vm.snapshot` was rejected.
    #[error("could not snapshot vm")]
    SnapshotFailed(#[source] ControlError),

    /// `vm.restore` was rejected.
    #[error("could not restore vm")]
    RestoreFailed(#[source] ControlError),

    /// Guest shutdown was rejected.
    #[error("could not shut down vm")]
    ShutdownFailed(#[source] ControlError),

    /// VMM shutdown was rejected.
    #[error("could not shut down vmm")]
    VmmShutdownFailed(#[source] ControlError),

    /// A read-only query failed.
    #[error("{op} query failed")]
    QueryFailed {
        /// The query that failed.
        op: Operation,
        /// What went wrong.
        source: ControlError,
    },

    /// The user-facing configuration was rejected by the translator.
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    /// The cloud-init seed image could not be built.
    #[error("could not build cloud-init disk")]
    DiskBuildFailed(#[source] io::Error),

    /// The caller's cancellation token fired.
    #[error("operation cancelled")]
    Cancelled,

    /// The machine's recorded fatal error, shared by every waiter.
    #[error(transparent)]
    Fatal(Arc<Error>),

    /// An I/O error outside the control protocol.
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl Error {
    /// Returns the underlying error, looking through [`Error::Fatal`].
    pub fn root(&self) -> &Self {
        match self {
            Self::Fatal(inner) => inner.root(),
            other => other,
        }
    }
}

fn describe(status: Option<&ExitStatus>) -> String {
    status.map_or_else(|| "status unknown".to_owned(), ToString::to_string)
}

/// Why a single control request failed.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ControlError {
    /// The request never produced a response.
    #[error("transport: {0}")]
    Transport(#[from] io::Error),

    /// The VMM answered with an unexpected status.
    #[error("status {status}: {body}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Response body, verbatim.
        body: String,
    },

    /// A query answered 200 with a body that did not decode.
    #[error("malformed response: {0}")]
    Decode(#[from] serde_json::Error),
}

impl ControlError {
    /// Builds a status error from a rejected response.
    pub fn status(resp: &ApiResponse) -> Self {
        Self::Status {
            status: resp.status,
            body: resp.body_text(),
        }
    }
}

/// Checks `resp` against the success status of `op`.
pub(crate) fn expect_success(
    op: Operation,
    resp: io::Result<ApiResponse>,
) -> std::result::Result<ApiResponse, ControlError> {
    let resp = resp?;
    if resp.is_success(op) {
        Ok(resp)
    } else {
        Err(ControlError::status(&resp))
    }
}
