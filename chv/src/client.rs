//! Host-side client for the VMM control API.
//!
//! [`ControlClient`] is the operation-shaped capability the supervisor
//! consumes. [`HttpClient`] implements it with HTTP/1.1 over the VMM's
//! Unix socket; tests substitute an in-process fake.

use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use chv_api::{ApiResponse, Operation, RestoreConfig, VmConfig, VmSnapshotConfig};
use http_body_util::{BodyExt, Full, Limited};
use hyper::Request;
use hyper::header::{ACCEPT, CONTENT_TYPE, HOST};
use hyper_util::rt::TokioIo;
use tokio::net::UnixStream;
use tracing::trace;

/// Issues named control operations against a VMM control endpoint.
///
/// Implementors provide [`send`](Self::send); the per-operation methods
/// encode request bodies and delegate to it. Responses are returned
/// verbatim: status interpretation is left to the caller.
pub trait ControlClient: Send + Sync {
    /// Sends `op` with an optional JSON body and returns the raw response.
    fn send(
        &self,
        op: Operation,
        body: Option<Vec<u8>>,
    ) -> impl Future<Output = io::Result<ApiResponse>> + Send;

    /// `PUT vm.create`.
    fn create_vm(&self, config: &VmConfig) -> impl Future<Output = io::Result<ApiResponse>> + Send {
        async move {
            let body = chv_api::encode(config)?;
            self.send(Operation::Create, Some(body)).await
        }
    }

    /// `PUT vm.boot`.
    fn boot_vm(&self) -> impl Future<Output = io::Result<ApiResponse>> + Send {
        self.send(Operation::Boot, None)
    }

    /// `PUT vm.pause`.
    fn pause_vm(&self) -> impl Future<Output = io::Result<ApiResponse>> + Send {
        self.send(Operation::Pause, None)
    }

    /// `PUT vm.resume`.
    fn resume_vm(&self) -> impl Future<Output = io::Result<ApiResponse>> + Send {
        self.send(Operation::Resume, None)
    }

    /// `PUT vm.snapshot`.
    fn snapshot_vm(
        &self,
        config: &VmSnapshotConfig,
    ) -> impl Future<Output = io::Result<ApiResponse>> + Send {
        async move {
            let body = chv_api::encode(config)?;
            self.send(Operation::Snapshot, Some(body)).await
        }
    }

    /// `PUT vm.restore`.
    fn restore_vm(
        &self,
        config: &RestoreConfig,
    ) -> impl Future<Output = io::Result<ApiResponse>> + Send {
        async move {
            let body = chv_api::encode(config)?;
            self.send(Operation::Restore, Some(body)).await
        }
    }

    /// `PUT vm.reboot`.
    fn reboot_vm(&self) -> impl Future<Output = io::Result<ApiResponse>> + Send {
        self.send(Operation::Reboot, None)
    }

    /// `PUT vm.power-button`.
    fn power_button_vm(&self) -> impl Future<Output = io::Result<ApiResponse>> + Send {
        self.send(Operation::PowerButton, None)
    }

    /// `PUT vm.shutdown`.
    fn shutdown_vm(&self) -> impl Future<Output = io::Result<ApiResponse>> + Send {
        self.send(Operation::Shutdown, None)
    }

    /// `PUT vm.delete`.
    fn delete_vm(&self) -> impl Future<Output = io::Result<ApiResponse>> + Send {
        self.send(Operation::Delete, None)
    }

    /// `PUT vmm.shutdown`.
    fn shutdown_vmm(&self) -> impl Future<Output = io::Result<ApiResponse>> + Send {
        self.send(Operation::ShutdownVmm, None)
    }

    /// `GET vm.info`.
    fn vm_info(&self) -> impl Future<Output = io::Result<ApiResponse>> + Send {
        self.send(Operation::Info, None)
    }

    /// `GET vmm.ping`.
    fn vmm_ping(&self) -> impl Future<Output = io::Result<ApiResponse>> + Send {
        self.send(Operation::Ping, None)
    }
}

/// HTTP/1.1 control client over a Unix domain socket.
///
/// Each request opens a fresh connection, so the client is cheap to clone
/// and never holds the socket between calls.
#[derive(Debug, Clone)]
pub struct HttpClient {
    /// Path of the VMM's API socket.
    socket: PathBuf,
}

impl HttpClient {
    /// Creates a client for the API socket at `socket`.
    pub fn new(socket: impl AsRef<Path>) -> Self {
        Self {
            socket: socket.as_ref().to_path_buf(),
        }
    }

    /// Returns the API socket path.
    pub fn socket(&self) -> &Path {
        &self.socket
    }
}

impl ControlClient for HttpClient {
    async fn send(&self, op: Operation, body: Option<Vec<u8>>) -> io::Result<ApiResponse> {
        let stream = UnixStream::connect(&self.socket).await?;
        let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
            .await
            .map_err(io::Error::other)?;
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                trace!(error = %e, "control connection closed with error");
            }
        });

        let method = hyper::Method::from_bytes(op.method().as_str().as_bytes())
            .map_err(io::Error::other)?;
        let mut req = Request::builder()
            .method(method)
            .uri(op.path())
            .header(HOST, "localhost")
            .header(ACCEPT, "application/json");
        if body.is_some() {
            req = req.header(CONTENT_TYPE, "application/json");
        }
        let req = req
            .body(Full::new(Bytes::from(body.unwrap_or_default())))
            .map_err(io::Error::other)?;

        let resp = sender.send_request(req).await.map_err(io::Error::other)?;
        let status = resp.status().as_u16();
        let bytes = Limited::new(resp.into_body(), chv_api::MAX_BODY)
            .collect()
            .await
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?
            .to_bytes();

        trace!(%op, status, len = bytes.len(), "control response");
        Ok(ApiResponse::new(status, bytes.to_vec()))
    }
}

/// Scriptable in-process control endpoint for tests.
#[cfg(test)]
#[allow(clippy::unwrap_used)]
pub(crate) mod fake {
    use std::collections::HashMap;
    use std::io;
    use std::sync::{Arc, Mutex};

    use chv_api::{ApiResponse, Method, Operation};

    use super::ControlClient;

    /// Shared state behind a [`FakeClient`].
    #[derive(Debug, Default)]
    struct Inner {
        /// Canned responses overriding the defaults.
        responses: HashMap<Operation, ApiResponse>,
        /// Pings left to fail with a transport error.
        ping_failures: usize,
        /// Every request received, in order.
        calls: Vec<(Operation, Option<Vec<u8>>)>,
    }

    /// Answers 204 to actions and canned 200 bodies to queries unless told
    /// otherwise. Clones share state.
    #[derive(Debug, Clone, Default)]
    pub(crate) struct FakeClient {
        inner: Arc<Mutex<Inner>>,
    }

    impl FakeClient {
        pub(crate) fn respond(&self, op: Operation, status: u16, body: &str) -> &Self {
            self.lock()
                .responses
                .insert(op, ApiResponse::new(status, body.as_bytes().to_vec()));
            self
        }

        pub(crate) fn fail_pings(&self, n: usize) -> &Self {
            self.lock().ping_failures = n;
            self
        }

        pub(crate) fn calls(&self) -> Vec<(Operation, Option<Vec<u8>>)> {
            self.lock().calls.clone()
        }

        pub(crate) fn ops(&self) -> Vec<Operation> {
            self.lock().calls.iter().map(|(op, _)| *op).collect()
        }

        fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
            self.inner.lock().unwrap()
        }

        fn answer(&self, op: Operation, body: Option<Vec<u8>>) -> io::Result<ApiResponse> {
            let mut inner = self.lock();
            inner.calls.push((op, body));
            if op == Operation::Ping && inner.ping_failures > 0 {
                inner.ping_failures -= 1;
                return Err(io::Error::from(io::ErrorKind::ConnectionRefused));
            }
            if let Some(resp) = inner.responses.get(&op) {
                return Ok(resp.clone());
            }
            Ok(match (op, op.method()) {
                (Operation::Ping, _) => ApiResponse::new(200, br#"{"version":"v42.0"}"#.to_vec()),
                (_, Method::Get) => ApiResponse::new(200, INFO_BODY.as_bytes().to_vec()),
                _ => ApiResponse::new(204, Vec::new()),
            })
        }
    }

    impl ControlClient for FakeClient {
        async fn send(&self, op: Operation, body: Option<Vec<u8>>) -> io::Result<ApiResponse> {
            self.answer(op, body)
        }
    }

    /// `vm.info` body for a running 1-vCPU, 1 GiB guest.
    pub(crate) const INFO_BODY: &str = r#"{
        "config": {
            "cpus": {"boot_vcpus": 1, "max_vcpus": 1},
            "memory": {"size": 1073741824},
            "payload": {"firmware": "/fw/hypervisor-fw"},
            "disks": [{"path": "/img/focal.raw"}],
            "net": [{"tap": "tap0", "mac": "12:34:56:78:90:01"}]
        },
        "state": "Running"
    }"#;
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::path::Path;

    use chv_api::{Operation, VmConfig, VmSnapshotConfig};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::UnixListener;

    use super::fake::FakeClient;
    use super::*;

    /// Accepts one connection, captures the request head, replies with `reply`.
    async fn serve_once(path: &Path, reply: &'static str) -> tokio::task::JoinHandle<String> {
        let listener = UnixListener::bind(path).unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 8192];
            let n = stream.read(&mut buf).await.unwrap();
            stream.write_all(reply.as_bytes()).await.unwrap();
            stream.shutdown().await.unwrap();
            String::from_utf8_lossy(&buf[..n]).into_owned()
        })
    }

    #[tokio::test]
    async fn http_client_sends_put_and_reads_no_content() {
        let dir = tempfile::tempdir().unwrap();
        let sock = dir.path().join("api.sock");
        let server = serve_once(&sock, "HTTP/1.1 204 No Content\r\n\r\n").await;

        let resp = HttpClient::new(&sock).pause_vm().await.unwrap();
        assert_eq!(resp.status, 204);
        assert!(resp.body.is_empty());

        let head = server.await.unwrap();
        assert!(head.starts_with("PUT /api/v1/vm.pause HTTP/1.1\r\n"), "{head}");
        assert!(head.to_ascii_lowercase().contains("host: localhost"));
    }

    #[tokio::test]
    async fn http_client_returns_error_bodies_verbatim() {
        let dir = tempfile::tempdir().unwrap();
        let sock = dir.path().join("api.sock");
        let _server = serve_once(
            &sock,
            "HTTP/1.1 405 Method Not Allowed\r\nContent-Length: 14\r\n\r\nVM not created",
        )
        .await;

        let resp = HttpClient::new(&sock).boot_vm().await.unwrap();
        assert_eq!(resp.status, 405);
        assert_eq!(resp.body_text(), "VM not created");
    }

    #[tokio::test]
    async fn http_client_sends_get_for_queries() {
        let dir = tempfile::tempdir().unwrap();
        let sock = dir.path().join("api.sock");
        let server = serve_once(
            &sock,
            "HTTP/1.1 200 OK\r\nContent-Length: 19\r\n\r\n{\"version\":\"v42.0\"}",
        )
        .await;

        let resp = HttpClient::new(&sock).vmm_ping().await.unwrap();
        assert!(resp.is_success(Operation::Ping));
        let head = server.await.unwrap();
        assert!(head.starts_with("GET /api/v1/vmm.ping HTTP/1.1\r\n"), "{head}");
    }

    #[tokio::test]
    async fn http_client_stops_reading_oversized_bodies() {
        let dir = tempfile::tempdir().unwrap();
        let sock = dir.path().join("api.sock");
        let listener = UnixListener::bind(&sock).unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 8192];
            let _ = stream.read(&mut buf).await;
            let total = chv_api::MAX_BODY + 1024 * 1024;
            let head = format!("HTTP/1.1 200 OK\r\nContent-Length: {total}\r\n\r\n");
            if stream.write_all(head.as_bytes()).await.is_err() {
                return;
            }
            let chunk = vec![b'x'; 1024 * 1024];
            for _ in 0..total / chunk.len() {
                if stream.write_all(&chunk).await.is_err() {
                    return;
                }
            }
        });

        let err = HttpClient::new(&sock).vm_info().await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn http_client_reports_missing_socket_as_transport_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = HttpClient::new(dir.path().join("absent.sock"))
            .vmm_ping()
            .await
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn provided_methods_encode_bodies() {
        let fake = FakeClient::default();
        fake.create_vm(&VmConfig::default()).await.unwrap();
        fake.snapshot_vm(&VmSnapshotConfig::to_path("/snap"))
            .await
            .unwrap();

        let calls = fake.calls();
        assert_eq!(calls[0].0, Operation::Create);
        let created: VmConfig = serde_json::from_slice(calls[0].1.as_ref().unwrap()).unwrap();
        assert_eq!(created, VmConfig::default());
        assert_eq!(
            calls[1].1.as_deref(),
            Some(br#"{"destination_url":"file:///snap"}"#.as_slice())
        );
    }
}
