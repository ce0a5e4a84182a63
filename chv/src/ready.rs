//! Readiness probing of the VMM control endpoint.

use std::path::Path;
use std::process::ExitStatus;
use std::time::Duration;

use chv_api::{Operation, VmmPingResponse};
use tokio::sync::watch;
use tokio::time::{Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::client::ControlClient;
use crate::error::{Error, Result};
use crate::process::ProcessState;

/// Polls the control endpoint until it answers a ping.
///
/// Defaults: 10 s deadline, 10 ms poll tick, 100 ms pause after a failed
/// ping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Prober {
    /// Overall deadline.
    pub timeout: Duration,
    /// Interval between socket-existence checks.
    pub poll_interval: Duration,
    /// Pause after a ping that failed or was rejected.
    pub retry_interval: Duration,
}

impl Default for Prober {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            poll_interval: Duration::from_millis(10),
            retry_interval: Duration::from_millis(100),
        }
    }
}

impl Prober {
    /// Waits until `socket` exists and a ping succeeds.
    ///
    /// Whichever happens first wins: the VMM exits ([`Error::VmmExited`]),
    /// `cancel` fires ([`Error::Cancelled`]), or the deadline passes
    /// ([`Error::VmmNotReady`]). An exit is preferred over a deadline that
    /// elapses at the same instant.
    pub async fn wait_ready<C: ControlClient>(
        &self,
        client: &C,
        socket: &Path,
        process: &mut watch::Receiver<ProcessState>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let deadline = tokio::time::sleep(self.timeout);
        tokio::pin!(deadline);
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut attempts = 0_u32;

        loop {
            tokio::select! {
                biased;
                status = exited(process) => return Err(Error::VmmExited { status }),
                () = cancel.cancelled() => return Err(Error::Cancelled),
                () = &mut deadline => {
                    if let ProcessState::Exited(status) = *process.borrow() {
                        return Err(Error::VmmExited { status });
                    }
                    return Err(Error::VmmNotReady(self.timeout));
                }
                ready = self.attempt(client, socket, &mut ticker, &mut attempts) => {
                    if ready {
                        trace!(attempts, "vmm answered ping");
                        return Ok(());
                    }
                }
            }
        }
    }

    /// One poll tick. Returns `true` if the VMM answered a valid ping.
    async fn attempt<C: ControlClient>(
        &self,
        client: &C,
        socket: &Path,
        ticker: &mut Interval,
        attempts: &mut u32,
    ) -> bool {
        ticker.tick().await;
        if !tokio::fs::try_exists(socket).await.unwrap_or(false) {
            return false;
        }

        *attempts += 1;
        match client.vmm_ping().await {
            Ok(resp) if resp.is_success(Operation::Ping) => {
                match chv_api::decode::<VmmPingResponse>(&resp.body) {
                    Ok(_) => return true,
                    Err(e) => trace!(attempt = *attempts, error = %e, "malformed ping response"),
                }
            }
            Ok(resp) => trace!(attempt = *attempts, status = resp.status, "ping rejected"),
            Err(e) => trace!(attempt = *attempts, error = %e, "waiting for vmm"),
        }
        tokio::time::sleep(self.retry_interval).await;
        false
    }
}

/// Resolves once the process has been reaped.
async fn exited(process: &mut watch::Receiver<ProcessState>) -> Option<ExitStatus> {
    let exited = process
        .wait_for(ProcessState::has_exited)
        .await
        .map(|state| match *state {
            ProcessState::Exited(status) => status,
            _ => None,
        });
    match exited {
        Ok(status) => status,
        // Sender gone without publishing an exit: nothing left to observe.
        Err(_) => std::future::pending().await,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::time::Instant;

    use super::*;
    use crate::client::fake::FakeClient;

    fn running() -> (watch::Sender<ProcessState>, watch::Receiver<ProcessState>) {
        watch::channel(ProcessState::Running { pid: 1 })
    }

    /// Scheduling allowance on top of one poll interval.
    const SLACK: Duration = Duration::from_millis(150);

    fn fast(timeout: Duration) -> Prober {
        Prober {
            timeout,
            poll_interval: Duration::from_millis(5),
            retry_interval: Duration::from_millis(10),
        }
    }

    #[tokio::test]
    async fn ready_once_socket_exists_and_ping_succeeds() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("api.sock");
        let fake = FakeClient::default();
        fake.fail_pings(3);
        let (_tx, mut rx) = running();

        let path = socket.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            std::fs::write(path, b"").unwrap();
        });

        fast(Duration::from_secs(5))
            .wait_ready(&fake, &socket, &mut rx, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(fake.ops(), vec![Operation::Ping; 4]);
    }

    #[tokio::test]
    async fn never_pings_before_socket_appears() {
        let dir = tempfile::tempdir().unwrap();
        let fake = FakeClient::default();
        let (_tx, mut rx) = running();

        let err = fast(Duration::from_millis(100))
            .wait_ready(&fake, &dir.path().join("absent"), &mut rx, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::VmmNotReady(_)));
        assert!(fake.ops().is_empty());
    }

    #[tokio::test]
    async fn timeout_is_not_reported_early() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("api.sock");
        std::fs::write(&socket, b"").unwrap();
        let fake = FakeClient::default();
        fake.respond(Operation::Ping, 500, "busy");
        let (_tx, mut rx) = running();

        let started = Instant::now();
        let err = fast(Duration::from_millis(200))
            .wait_ready(&fake, &socket, &mut rx, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::VmmNotReady(d) if d == Duration::from_millis(200)));
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(200));
        assert!(elapsed < Duration::from_millis(200 + 5) + SLACK, "{elapsed:?}");
    }

    #[tokio::test]
    async fn malformed_ping_body_is_not_ready() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("api.sock");
        std::fs::write(&socket, b"").unwrap();
        let fake = FakeClient::default();
        fake.respond(Operation::Ping, 200, "not json");
        let (_tx, mut rx) = running();

        let err = fast(Duration::from_millis(80))
            .wait_ready(&fake, &socket, &mut rx, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::VmmNotReady(_)));
    }

    #[tokio::test]
    async fn exit_beats_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let fake = FakeClient::default();
        let (tx, mut rx) = running();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            tx.send_replace(ProcessState::Exited(None));
        });

        let started = Instant::now();
        let err = fast(Duration::from_secs(10))
            .wait_ready(&fake, &dir.path().join("absent"), &mut rx, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::VmmExited { status: None }));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn cancellation_stops_polling() {
        let dir = tempfile::tempdir().unwrap();
        let fake = FakeClient::default();
        let (_tx, mut rx) = running();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = fast(Duration::from_secs(10))
            .wait_ready(&fake, &dir.path().join("absent"), &mut rx, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled));
    }

    #[tokio::test]
    async fn cancellation_is_seen_while_polling() {
        let dir = tempfile::tempdir().unwrap();
        let fake = FakeClient::default();
        let (_tx, mut rx) = running();
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let started = Instant::now();
        let err = fast(Duration::from_secs(10))
            .wait_ready(&fake, &dir.path().join("absent"), &mut rx, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled));
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(50));
        assert!(elapsed < Duration::from_millis(50 + 5) + SLACK, "{elapsed:?}");
    }

    #[tokio::test]
    async fn cancellation_interrupts_retry_pause() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("api.sock");
        std::fs::write(&socket, b"").unwrap();
        let fake = FakeClient::default();
        fake.respond(Operation::Ping, 503, "starting");
        let (_tx, mut rx) = running();
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let prober = Prober {
            retry_interval: Duration::from_secs(5),
            ..fast(Duration::from_secs(10))
        };
        let started = Instant::now();
        let err = prober
            .wait_ready(&fake, &socket, &mut rx, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled));
        assert!(started.elapsed() < Duration::from_millis(50) + SLACK);
        assert_eq!(fake.ops(), [Operation::Ping]);
    }
}
