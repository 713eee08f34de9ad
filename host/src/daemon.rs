//! The host supervisor: polls for running guests and keeps exactly one
//! worker per guest instance.

use crate::discovery::{Discovery, GuestIdentity, VirshBackend, select_guest};
use crate::error::{DiscoveryError, HostError};
use crate::worker::{OutboundCall, WorkerContext, WorkerHandle};
use parley_core::config::{
    DEFAULT_CHANNEL_DIRECTORY, DEFAULT_CONTROL_SOCKET, DEFAULT_POLL_INTERVAL_SECS,
    DEFAULT_TIMEOUT_SECS, call_timeout,
};
use parley_core::{CommandRegistry, Request, Response};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::MissedTickBehavior;

/// Runtime configuration of the host daemon, fixed once it starts.
#[derive(Debug, Clone)]
pub struct HostConfig {
    pub poll_interval: Duration,
    /// Applied to operator calls that do not bring their own timeout.
    pub call_timeout: Option<Duration>,
    pub channel_dir: PathBuf,
    pub control_socket: PathBuf,
    pub connect_uri: Option<String>,
    pub virsh: PathBuf,
    pub command_dirs: Vec<PathBuf>,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(DEFAULT_POLL_INTERVAL_SECS),
            call_timeout: call_timeout(DEFAULT_TIMEOUT_SECS),
            channel_dir: PathBuf::from(DEFAULT_CHANNEL_DIRECTORY),
            control_socket: PathBuf::from(DEFAULT_CONTROL_SOCKET),
            connect_uri: None,
            virsh: PathBuf::from("virsh"),
            command_dirs: CommandRegistry::default().directories().to_vec(),
        }
    }
}

impl HostConfig {
    pub fn discovery(&self) -> Discovery {
        let backend = VirshBackend::new(self.virsh.clone(), self.connect_uri.clone());
        Discovery::new(Arc::new(backend), self.channel_dir.clone())
    }

    pub fn registry(&self) -> CommandRegistry {
        CommandRegistry::new(self.command_dirs.clone())
    }
}

/// An operator call addressed to a guest by name or domain id.
pub struct RoutedCall {
    pub guest: String,
    pub request: Request,
    pub timeout: Option<Duration>,
    pub reply: oneshot::Sender<Result<Response, HostError>>,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PollSummary {
    pub started: Vec<GuestIdentity>,
    pub stopped: Vec<GuestIdentity>,
    pub kept: usize,
}

pub struct HostDaemon {
    context: Arc<WorkerContext>,
    workers: HashMap<GuestIdentity, WorkerHandle>,
}

impl HostDaemon {
    pub fn new(discovery: Discovery, registry: CommandRegistry, poll_interval: Duration) -> Self {
        Self {
            context: Arc::new(WorkerContext {
                discovery,
                registry,
                retry_interval: poll_interval,
            }),
            workers: HashMap::new(),
        }
    }

    pub fn workers(&self) -> &HashMap<GuestIdentity, WorkerHandle> {
        &self.workers
    }

    /// Discover running guests once and reconcile the worker table.
    ///
    /// On failure the table is left exactly as it was.
    pub async fn poll_once(&mut self) -> Result<PollSummary, DiscoveryError> {
        let running: HashSet<GuestIdentity> = self
            .context
            .discovery
            .find_running_guests()
            .await?
            .into_iter()
            .collect();

        let mut summary = PollSummary::default();

        let vanished: Vec<GuestIdentity> = self
            .workers
            .keys()
            .filter(|identity| !running.contains(*identity))
            .cloned()
            .collect();
        let mut stopping = Vec::new();
        for identity in vanished {
            if let Some(handle) = self.workers.remove(&identity) {
                tracing::info!(guest = %identity, "Guest is gone");
                handle.signal_stop();
                stopping.push(handle);
                summary.stopped.push(identity);
            }
        }
        for handle in stopping {
            handle.join().await;
        }

        for identity in running {
            if self.workers.contains_key(&identity) {
                summary.kept += 1;
                continue;
            }
            tracing::info!(guest = %identity, "Found new guest");
            let handle = WorkerHandle::spawn(identity.clone(), self.context.clone());
            self.workers.insert(identity.clone(), handle);
            summary.started.push(identity);
        }

        summary.started.sort();
        summary.stopped.sort();
        Ok(summary)
    }

    /// Hand an operator call to the worker of the addressed guest.
    pub fn route(&self, call: RoutedCall) {
        let handle = select_guest(self.workers.keys(), &call.guest)
            .and_then(|identity| self.workers.get(identity));

        match handle {
            Some(handle) => handle.submit(OutboundCall {
                request: call.request,
                timeout: call.timeout,
                reply: call.reply,
            }),
            None => {
                let _ = call.reply.send(Err(HostError::UnknownGuest(call.guest)));
            }
        }
    }

    /// Poll on a fixed interval and route operator calls until `shutdown`
    /// flips, then stop every worker.
    pub async fn run(
        mut self,
        mut calls: mpsc::Receiver<RoutedCall>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut ticker = tokio::time::interval(self.context.retry_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => match self.poll_once().await {
                    Ok(summary) => tracing::debug!(
                        "Poll: {} started, {} stopped, {} kept",
                        summary.started.len(),
                        summary.stopped.len(),
                        summary.kept
                    ),
                    Err(e) if e.is_expected() => {
                        tracing::info!("Cannot list guests, retrying next poll: {}", e)
                    }
                    Err(e) => tracing::warn!("Guest discovery failed: {}", e),
                },
                Some(call) = calls.recv() => self.route(call),
            }
        }

        self.stop_all().await;
    }

    pub async fn stop_all(&mut self) {
        let handles: Vec<WorkerHandle> = self.workers.drain().map(|(_, handle)| handle).collect();
        for handle in &handles {
            handle.signal_stop();
        }
        for handle in handles {
            handle.join().await;
        }
        tracing::info!("All workers stopped");
    }
}
