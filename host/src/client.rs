//! One-shot calls from the host command line.

use crate::control::{ControlReply, ControlRequest};
use crate::discovery::Discovery;
use crate::error::{FailureKind, HostError};
use parley_core::config::{DEFAULT_TIMEOUT_SECS, call_timeout};
use parley_core::{Connection, ConnectionError, Request, Response, StreamTransport, TransportError};
use std::path::Path;
use std::time::Duration;
use tokio::net::UnixStream;
use tokio::time::Instant;

/// Extra time granted to the daemon on top of the call timeout before the
/// client stops waiting for its reply.
const CONTROL_GRACE: Duration = Duration::from_secs(5);

/// Call through the control socket of a running daemon.
///
/// Without `timeout_secs` the daemon applies its own default, so the client
/// waits for as long as the daemon does.
pub async fn call_via_daemon(
    socket: &Path,
    guest: &str,
    request: Request,
    timeout_secs: Option<u64>,
) -> Result<Response, HostError> {
    let stream = UnixStream::connect(socket)
        .await
        .map_err(HostError::DaemonUnavailable)?;
    let mut connection = Connection::new(StreamTransport::new(
        stream,
        format!("control socket {}", socket.display()),
    ));

    let limit = timeout_secs.and_then(call_timeout);
    connection
        .send(&ControlRequest {
            guest: guest.to_string(),
            request,
            timeout_secs,
        })
        .await?;

    let deadline = limit.map(|t| Instant::now() + t + CONTROL_GRACE);
    let reply: ControlReply = match connection.receive(deadline).await {
        Ok(reply) => reply,
        Err(ConnectionError::Transport(TransportError::Timeout)) => {
            return Err(HostError::Remote {
                kind: FailureKind::Timeout,
                message: "host daemon did not answer in time".to_string(),
            });
        }
        Err(e) => return Err(e.into()),
    };

    match reply {
        ControlReply::Response(response) => Ok(response),
        ControlReply::Error { kind, message } => Err(HostError::Remote { kind, message }),
    }
}

/// Resolve the guest's channels and call over the host→guest socket.
///
/// Only possible while no daemon holds the socket.
pub async fn call_direct(
    discovery: &Discovery,
    guest: &str,
    request: Request,
    timeout: Option<Duration>,
) -> Result<Response, HostError> {
    let identity = discovery
        .find_guest(guest)
        .await?
        .ok_or_else(|| HostError::UnknownGuest(guest.to_string()))?;
    let pair = discovery
        .resolve_channels(&identity)
        .await?
        .ok_or_else(|| HostError::NotConnected(identity.name.clone()))?;

    let transport = StreamTransport::connect_unix(&pair.to_guest_path)
        .await
        .map_err(ConnectionError::from)?;
    let mut connection = Connection::new(transport);
    let result = connection.call(&request, timeout).await;
    let _ = connection.close().await;
    Ok(result?)
}

/// Prefer the daemon; fall back to a direct connection when it is not
/// listening.
pub async fn call(
    socket: &Path,
    discovery: &Discovery,
    guest: &str,
    request: Request,
    timeout_secs: Option<u64>,
) -> Result<Response, HostError> {
    match call_via_daemon(socket, guest, request.clone(), timeout_secs).await {
        Err(HostError::DaemonUnavailable(e)) => {
            tracing::debug!(
                "Host daemon not reachable at {} ({}), connecting directly",
                socket.display(),
                e
            );
            let timeout = call_timeout(timeout_secs.unwrap_or(DEFAULT_TIMEOUT_SECS));
            call_direct(discovery, guest, request, timeout).await
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::{DiscoveryBackend, GuestIdentity};
    use crate::error::DiscoveryError;
    use async_trait::async_trait;
    use parley_core::config::{GUEST_TO_HOST_CHANNEL, HOST_TO_GUEST_CHANNEL};
    use std::path::PathBuf;
    use std::sync::Arc;
    use tempfile::TempDir;
    use crate::control::ControlServer;
    use tokio::net::UnixListener;
    use tokio::sync::{mpsc, watch};

    /// Guest "alpha" whose channels live in a per-domain directory.
    struct SingleGuest;

    #[async_trait]
    impl DiscoveryBackend for SingleGuest {
        async fn list_active(&self) -> Result<Vec<GuestIdentity>, DiscoveryError> {
            Ok(vec![GuestIdentity::new("alpha", Some(3))])
        }

        async fn describe(&self, _guest: &GuestIdentity) -> Result<String, DiscoveryError> {
            Ok("<domain><devices/></domain>".to_string())
        }
    }

    fn setup() -> (TempDir, Discovery, PathBuf) {
        let dir = TempDir::new().unwrap();
        let channels = dir.path().join("channels");
        let domain = channels.join("domain-3-alpha");
        std::fs::create_dir_all(&domain).unwrap();
        std::fs::write(domain.join(GUEST_TO_HOST_CHANNEL), b"").unwrap();
        let discovery = Discovery::new(Arc::new(SingleGuest), channels);
        (dir, discovery, domain.join(HOST_TO_GUEST_CHANNEL))
    }

    #[tokio::test]
    async fn test_falls_back_to_direct_connection() {
        let (dir, discovery, to_guest) = setup();
        let listener = UnixListener::bind(&to_guest).unwrap();

        let guest = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut server = Connection::new(StreamTransport::new(stream, "guest"));
            let request = server.next_request().await.unwrap();
            assert_eq!(request.command, "list-commands");
            let response = Response::success(&request.id, b"hostname\n".to_vec(), 0);
            server.respond(&response).await.unwrap();
        });

        let response = call(
            &dir.path().join("no-daemon.sock"),
            &discovery,
            "alpha",
            Request::list_commands(),
            Some(5),
        )
        .await
        .unwrap();
        assert_eq!(response.command_names(), vec!["hostname"]);
        guest.await.unwrap();
    }

    #[tokio::test]
    async fn test_unknown_guest() {
        let (dir, discovery, _) = setup();
        let err = call(
            &dir.path().join("no-daemon.sock"),
            &discovery,
            "beta",
            Request::list_commands(),
            None,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, HostError::UnknownGuest(_)));
        assert_eq!(err.kind(), FailureKind::Unavailable);
    }

    #[tokio::test]
    async fn test_silent_guest_times_out() {
        let (dir, discovery, to_guest) = setup();
        let _listener = UnixListener::bind(&to_guest).unwrap();

        let err = call_direct(
            &discovery,
            "3",
            Request::list_commands(),
            Some(Duration::from_millis(50)),
        )
        .await
        .unwrap_err();
        assert_eq!(err.kind(), FailureKind::Timeout);
        drop(dir);
    }

    #[tokio::test(start_paused = true)]
    async fn test_daemon_default_timeout_governs_wait() {
        let dir = TempDir::new().unwrap();
        let socket = dir.path().join("host.sock");
        let (routes, mut routed) = mpsc::channel(4);
        let server = ControlServer::bind(&socket, routes, Some(Duration::from_secs(60)))
            .await
            .unwrap();
        let (stop, shutdown) = watch::channel(false);
        let serve = tokio::spawn(server.run(shutdown));

        let router = tokio::spawn(async move {
            let call = routed.recv().await.unwrap();
            assert_eq!(call.timeout, Some(Duration::from_secs(60)));
            tokio::time::sleep(Duration::from_secs(20)).await;
            let response = Response::success(&call.request.id, b"slow\n".to_vec(), 0);
            call.reply.send(Ok(response)).unwrap();
        });

        let response = call_via_daemon(&socket, "alpha", Request::execute("backup", vec![]), None)
            .await
            .unwrap();
        assert_eq!(response.output, b"slow\n");

        router.await.unwrap();
        stop.send(true).unwrap();
        serve.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_explicit_timeout_bounds_wait_on_daemon() {
        let dir = TempDir::new().unwrap();
        let socket = dir.path().join("host.sock");
        let (routes, mut routed) = mpsc::channel(4);
        let server = ControlServer::bind(&socket, routes, None).await.unwrap();
        let (stop, shutdown) = watch::channel(false);
        let serve = tokio::spawn(server.run(shutdown));

        let router = tokio::spawn(async move {
            let call = routed.recv().await.unwrap();
            tokio::time::sleep(Duration::from_secs(3600)).await;
            drop(call);
        });

        let err = call_via_daemon(&socket, "alpha", Request::list_commands(), Some(2))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), FailureKind::Timeout);

        router.abort();
        stop.send(true).unwrap();
        serve.await.unwrap();
    }
}
