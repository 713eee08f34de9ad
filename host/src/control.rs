//! Operator entry point of the host daemon.
//!
//! One-shot CLI calls cannot open a guest's channel socket while the daemon
//! holds it, so they are sent here instead and multiplexed onto the guest's
//! worker. Each client connection carries exactly one [`ControlRequest`] and
//! receives one [`ControlReply`], framed like the guest channels.

use crate::daemon::RoutedCall;
use crate::error::{FailureKind, HostError};
use parley_core::config::call_timeout;
use parley_core::{Connection, ConnectionError, Request, Response, StreamTransport};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, oneshot, watch};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlRequest {
    /// Guest name or domain id.
    pub guest: String,
    pub request: Request,
    /// `None` uses the daemon's default, `Some(0)` waits forever.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlReply {
    Response(Response),
    Error { kind: FailureKind, message: String },
}

impl From<Result<Response, HostError>> for ControlReply {
    fn from(result: Result<Response, HostError>) -> Self {
        match result {
            Ok(response) => ControlReply::Response(response),
            Err(e) => ControlReply::Error {
                kind: e.kind(),
                message: e.to_string(),
            },
        }
    }
}

pub struct ControlServer {
    listener: UnixListener,
    path: PathBuf,
    routes: mpsc::Sender<RoutedCall>,
    default_timeout: Option<Duration>,
}

impl ControlServer {
    /// Bind the control socket, replacing a stale one left by a previous run.
    pub async fn bind(
        path: &Path,
        routes: mpsc::Sender<RoutedCall>,
        default_timeout: Option<Duration>,
    ) -> std::io::Result<Self> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        match tokio::fs::remove_file(path).await {
            Ok(()) => tracing::debug!("Removed stale control socket {}", path.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }

        let listener = UnixListener::bind(path)?;
        tracing::info!("Control socket listening on {}", path.display());
        Ok(Self {
            listener,
            path: path.to_path_buf(),
            routes,
            default_timeout,
        })
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        let routes = self.routes.clone();
                        let default_timeout = self.default_timeout;
                        tokio::spawn(async move {
                            if let Err(e) = serve_client(stream, routes, default_timeout).await {
                                tracing::warn!("Control client failed: {}", e);
                            }
                        });
                    }
                    Err(e) => tracing::warn!("Failed to accept control client: {}", e),
                },
            }
        }

        if let Err(e) = tokio::fs::remove_file(&self.path).await {
            tracing::debug!("Cannot remove control socket {}: {}", self.path.display(), e);
        }
    }
}

async fn serve_client(
    stream: UnixStream,
    routes: mpsc::Sender<RoutedCall>,
    default_timeout: Option<Duration>,
) -> Result<(), ConnectionError> {
    let mut connection = Connection::new(StreamTransport::new(stream, "control client"));
    let control: ControlRequest = connection.receive(None).await?;
    tracing::debug!(
        guest = %control.guest,
        "Operator calls {} {:?}",
        control.request.command,
        control.request.arguments
    );

    let timeout = match control.timeout_secs {
        Some(secs) => call_timeout(secs),
        None => default_timeout,
    };
    let (reply, result) = oneshot::channel();
    let routed = RoutedCall {
        guest: control.guest.clone(),
        request: control.request,
        timeout,
        reply,
    };

    let outcome = if routes.send(routed).await.is_err() {
        Err(HostError::WorkerStopped(control.guest))
    } else {
        result
            .await
            .unwrap_or_else(|_| Err(HostError::WorkerStopped(control.guest)))
    };

    connection.send(&ControlReply::from(outcome)).await?;
    let _ = connection.close().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_reply_wire_shape() {
        let reply = ControlReply::from(Err(HostError::UnknownGuest("vm9".to_string())));
        let json = serde_json::to_value(&reply).unwrap();
        assert_eq!(json["error"]["kind"], "unavailable");
        assert_eq!(json["error"]["message"], "no running guest named vm9");
    }

    #[tokio::test]
    async fn test_control_request_is_routed() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("run").join("host.sock");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, b"stale").unwrap();

        let (routes, mut routed) = mpsc::channel(4);
        let server = ControlServer::bind(&path, routes, Some(Duration::from_secs(10)))
            .await
            .unwrap();
        let (stop, shutdown) = watch::channel(false);
        let serve = tokio::spawn(server.run(shutdown));

        let router = tokio::spawn(async move {
            let call = routed.recv().await.unwrap();
            assert_eq!(call.guest, "alpha");
            assert_eq!(call.timeout, None);
            let response = Response::success(&call.request.id, b"pong".to_vec(), 0);
            call.reply.send(Ok(response)).unwrap();
        });

        let stream = UnixStream::connect(&path).await.unwrap();
        let mut client = Connection::new(StreamTransport::new(stream, "client"));
        let request = Request::execute("ping", vec![]);
        client
            .send(&ControlRequest {
                guest: "alpha".to_string(),
                request: request.clone(),
                timeout_secs: Some(0),
            })
            .await
            .unwrap();
        let reply: ControlReply = client.receive(None).await.unwrap();
        match reply {
            ControlReply::Response(response) => {
                assert_eq!(response.id, request.id);
                assert_eq!(response.output, b"pong");
            }
            other => panic!("unexpected reply: {:?}", other),
        }

        router.await.unwrap();
        stop.send(true).unwrap();
        serve.await.unwrap();
        assert!(!path.exists());
    }
}
