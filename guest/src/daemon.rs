//! The guest daemon: serves requests from the host on the host→guest port.
//!
//! There is a single peer, so there is a single session at a time. Any
//! failure drops the device and reopens it after a growing delay.

use crate::device::{DEV_ROOT, SYSFS_VIRTIO_PORTS, find_character_device};
use crate::error::{DeviceError, GuestError};
use crate::transport::{CharacterDevice, Port};
use parley_core::config::{BusyRetry, ENV_CHANNEL, ENV_PEER, HOST_TO_GUEST_CHANNEL};
use parley_core::protocol::EXIT_FAILURE;
use parley_core::{CommandRegistry, Connection, ConnectionError, Dispatcher, Response, Transport};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::{JoinError, JoinHandle};

const INITIAL_BACKOFF: Duration = Duration::from_millis(50);
const MAX_BACKOFF: Duration = Duration::from_secs(1);

/// Runtime configuration of the guest side, fixed once it starts.
#[derive(Debug, Clone)]
pub struct GuestConfig {
    /// Skips device discovery when set.
    pub device_override: Option<PathBuf>,
    pub sysfs_root: PathBuf,
    pub dev_root: PathBuf,
    pub busy_retry: BusyRetry,
    pub command_dirs: Vec<PathBuf>,
}

impl Default for GuestConfig {
    fn default() -> Self {
        Self {
            device_override: None,
            sysfs_root: PathBuf::from(SYSFS_VIRTIO_PORTS),
            dev_root: PathBuf::from(DEV_ROOT),
            busy_retry: BusyRetry::default(),
            command_dirs: CommandRegistry::default().directories().to_vec(),
        }
    }
}

impl GuestConfig {
    pub async fn resolve_device(&self, channel: &str) -> Result<PathBuf, DeviceError> {
        match &self.device_override {
            Some(path) => Ok(path.clone()),
            None => find_character_device(&self.sysfs_root, &self.dev_root, channel).await,
        }
    }

    pub fn registry(&self) -> CommandRegistry {
        CommandRegistry::new(self.command_dirs.clone())
    }
}

#[derive(Debug)]
pub enum SessionEnd {
    Shutdown,
    Failed(ConnectionError),
}

pub struct GuestDaemon {
    config: GuestConfig,
    registry: CommandRegistry,
}

impl GuestDaemon {
    pub fn new(config: GuestConfig) -> Self {
        let registry = config.registry();
        Self { config, registry }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<(), GuestError> {
        self.registry.prepare().await?;

        let mut backoff = INITIAL_BACKOFF;
        let mut reported = false;

        while !stopping(&shutdown) {
            let path = match self.config.resolve_device(HOST_TO_GUEST_CHANNEL).await {
                Ok(path) => path,
                Err(e) => {
                    if reported {
                        tracing::debug!("{}", e);
                    } else {
                        tracing::error!("{}", e);
                        reported = true;
                    }
                    backoff = pause(backoff, &mut shutdown).await;
                    continue;
                }
            };

            let opened = CharacterDevice::open(&path, self.config.busy_retry)
                .await
                .map_err(GuestError::from)
                .and_then(require_host);
            let device = match opened {
                Ok(device) => device,
                Err(GuestError::HostNotConnected(_)) => {
                    tracing::debug!(
                        "Host is not connected to {}, retrying in {:?}",
                        path.display(),
                        backoff
                    );
                    backoff = pause(backoff, &mut shutdown).await;
                    continue;
                }
                Err(e) => {
                    tracing::warn!("Cannot open {}: {}", path.display(), e);
                    backoff = pause(backoff, &mut shutdown).await;
                    continue;
                }
            };

            backoff = INITIAL_BACKOFF;
            reported = false;
            tracing::info!("Serving host requests on {}", path.display());

            match serve_session(Connection::new(device), self.dispatcher(&path), &mut shutdown)
                .await
            {
                SessionEnd::Shutdown => break,
                SessionEnd::Failed(e) => {
                    tracing::warn!("Session on {} ended: {}", path.display(), e);
                    backoff = pause(backoff, &mut shutdown).await;
                }
            }
        }

        tracing::info!("Guest daemon stopped");
        Ok(())
    }

    fn dispatcher(&self, device: &Path) -> Dispatcher {
        let mut peer_env = BTreeMap::new();
        peer_env.insert(ENV_PEER.to_string(), "host".to_string());
        peer_env.insert(ENV_CHANNEL.to_string(), device.display().to_string());
        Dispatcher::new(self.registry.clone(), peer_env)
    }
}

/// Keep `device` only if the host side of the port has a client.
pub(crate) fn require_host<P: Port>(
    device: CharacterDevice<P>,
) -> Result<CharacterDevice<P>, GuestError> {
    if device.is_host_connected()? {
        Ok(device)
    } else {
        Err(GuestError::HostNotConnected(device.path().to_path_buf()))
    }
}

/// Shutdown was requested, or its sender is gone.
fn stopping(shutdown: &watch::Receiver<bool>) -> bool {
    *shutdown.borrow() || shutdown.has_changed().is_err()
}

/// Sleep for `backoff` unless shutdown comes first; returns the next delay.
async fn pause(backoff: Duration, shutdown: &mut watch::Receiver<bool>) -> Duration {
    tokio::select! {
        _ = tokio::time::sleep(backoff) => {}
        _ = shutdown.changed() => {}
    }
    (backoff * 2).min(MAX_BACKOFF)
}

async fn finished(running: &mut Option<JoinHandle<Response>>) -> Result<Response, JoinError> {
    match running {
        Some(handle) => handle.await,
        None => std::future::pending().await,
    }
}

/// Serve one session until the channel fails or shutdown is requested.
///
/// Commands run on their own task so the channel keeps being read. A request
/// arriving while one is still executing is refused as busy. Output of an
/// execution that outlives the session is dropped.
pub async fn serve_session<T: Transport>(
    mut connection: Connection<T>,
    dispatcher: Dispatcher,
    shutdown: &mut watch::Receiver<bool>,
) -> SessionEnd {
    let mut running: Option<JoinHandle<Response>> = None;

    let end = loop {
        if stopping(shutdown) {
            break SessionEnd::Shutdown;
        }

        tokio::select! {
            _ = shutdown.changed() => break SessionEnd::Shutdown,
            result = finished(&mut running) => {
                running = None;
                match result {
                    Ok(response) => {
                        if let Err(e) = connection.respond(&response).await {
                            break SessionEnd::Failed(e);
                        }
                    }
                    Err(e) => tracing::warn!("Command task failed: {}", e),
                }
            }
            request = connection.next_request() => match request {
                Ok(request) if running.is_some() => {
                    tracing::warn!("Refusing {} while another command runs", request.command);
                    let response = Response::failure(
                        &request.id,
                        EXIT_FAILURE,
                        "busy: another request is still executing",
                    );
                    if let Err(e) = connection.respond(&response).await {
                        break SessionEnd::Failed(e);
                    }
                }
                Ok(request) => {
                    let dispatcher = dispatcher.clone();
                    running = Some(tokio::spawn(async move { dispatcher.handle(request).await }));
                }
                Err(e) => break SessionEnd::Failed(e),
            },
        }
    };

    if let Some(handle) = running.take() {
        tracing::debug!("Abandoning running command");
        handle.abort();
    }
    let _ = connection.close().await;
    end
}
