//! One long-lived worker per running guest.
//!
//! A worker resolves the guest's channel pair, connects both sockets and then
//! multiplexes two activities on a single task: answering requests the guest
//! sends on the guest→host channel, and forwarding operator calls on the
//! host→guest channel. Everything it owns lives on its own task; the
//! supervisor only talks to it through the call queue and the shutdown flag.

use crate::discovery::{ChannelPair, Discovery, GuestIdentity};
use crate::error::HostError;
use parley_core::config::{ENV_GUEST_ID, ENV_GUEST_NAME};
use parley_core::{
    CallError, CommandRegistry, Connection, ConnectionError, Dispatcher, Request, Response,
    StreamTransport,
};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UnixStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

const CALL_QUEUE_DEPTH: usize = 16;

type Channel = Connection<StreamTransport<UnixStream>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Discovered,
    Connecting,
    Serving,
    Stopped,
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            WorkerState::Discovered => "discovered",
            WorkerState::Connecting => "connecting",
            WorkerState::Serving => "serving",
            WorkerState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// An operator call queued for one worker.
pub struct OutboundCall {
    pub request: Request,
    pub timeout: Option<Duration>,
    pub reply: oneshot::Sender<Result<Response, HostError>>,
}

/// What every worker of a daemon shares.
#[derive(Clone)]
pub struct WorkerContext {
    pub discovery: Discovery,
    pub registry: CommandRegistry,
    pub retry_interval: Duration,
}

/// Supervisor side of a worker.
pub struct WorkerHandle {
    identity: GuestIdentity,
    instance: Uuid,
    calls: mpsc::Sender<OutboundCall>,
    state: watch::Receiver<WorkerState>,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl WorkerHandle {
    pub fn spawn(identity: GuestIdentity, context: Arc<WorkerContext>) -> Self {
        let instance = Uuid::new_v4();
        let (calls_tx, calls_rx) = mpsc::channel(CALL_QUEUE_DEPTH);
        let (state_tx, state_rx) = watch::channel(WorkerState::Discovered);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let mut peer_env = BTreeMap::new();
        peer_env.insert(ENV_GUEST_NAME.to_string(), identity.name.clone());
        if let Some(id) = identity.domain_id {
            peer_env.insert(ENV_GUEST_ID.to_string(), id.to_string());
        }

        let worker = Worker {
            identity: identity.clone(),
            dispatcher: Dispatcher::new(context.registry.clone(), peer_env),
            context,
            calls: calls_rx,
            state: state_tx,
            shutdown: shutdown_rx,
        };

        tracing::info!(guest = %identity, %instance, "Starting worker");
        let task = tokio::spawn(worker.run());

        Self {
            identity,
            instance,
            calls: calls_tx,
            state: state_rx,
            shutdown: shutdown_tx,
            task,
        }
    }

    pub fn identity(&self) -> &GuestIdentity {
        &self.identity
    }

    /// Unique per started worker; unchanged for as long as the guest stays.
    pub fn instance(&self) -> Uuid {
        self.instance
    }

    pub fn state(&self) -> WorkerState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<WorkerState> {
        self.state.clone()
    }

    /// Queue an operator call. A full queue is reported to the caller
    /// instead of blocking the supervisor.
    pub fn submit(&self, call: OutboundCall) {
        match self.calls.try_send(call) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(call)) => {
                let _ = call
                    .reply
                    .send(Err(HostError::WorkerBusy(self.identity.name.clone())));
            }
            Err(mpsc::error::TrySendError::Closed(call)) => {
                let _ = call
                    .reply
                    .send(Err(HostError::WorkerStopped(self.identity.name.clone())));
            }
        }
    }

    /// Ask the worker to stop without waiting for it.
    pub fn signal_stop(&self) {
        tracing::info!(guest = %self.identity, "Stopping worker");
        let _ = self.shutdown.send(true);
    }

    /// Wait until a signalled worker has closed its channels.
    pub async fn join(self) {
        if let Err(e) = self.task.await {
            tracing::warn!(guest = %self.identity, "Worker task failed: {}", e);
        }
    }

    /// Ask the worker to stop and wait until it has closed its channels.
    pub async fn stop(self) {
        self.signal_stop();
        self.join().await;
    }
}

enum SessionEnd {
    Shutdown,
    ChannelFailed,
}

struct Worker {
    identity: GuestIdentity,
    context: Arc<WorkerContext>,
    dispatcher: Dispatcher,
    calls: mpsc::Receiver<OutboundCall>,
    state: watch::Sender<WorkerState>,
    shutdown: watch::Receiver<bool>,
}

impl Worker {
    async fn run(mut self) {
        while !self.stopping() {
            let resolved = tokio::select! {
                _ = self.shutdown.changed() => break,
                resolved = self.context.discovery.resolve_channels(&self.identity) => resolved,
            };
            let pair = match resolved {
                Ok(Some(pair)) => pair,
                Ok(None) => {
                    tracing::debug!(guest = %self.identity, "Guest has no channels yet");
                    self.set_state(WorkerState::Discovered);
                    self.idle().await;
                    continue;
                }
                Err(e) => {
                    if e.is_expected() {
                        tracing::info!(guest = %self.identity, "Cannot resolve channels: {}", e);
                    } else {
                        tracing::warn!(guest = %self.identity, "Cannot resolve channels: {}", e);
                    }
                    self.set_state(WorkerState::Discovered);
                    self.idle().await;
                    continue;
                }
            };

            self.set_state(WorkerState::Connecting);
            let connected = tokio::select! {
                _ = self.shutdown.changed() => break,
                connected = connect(&pair) => connected,
            };
            let (to_guest, from_guest) = match connected {
                Ok(channels) => channels,
                Err(e) => {
                    tracing::debug!(guest = %self.identity, "Cannot connect channels: {}", e);
                    self.idle().await;
                    continue;
                }
            };

            self.set_state(WorkerState::Serving);
            tracing::info!(
                guest = %self.identity,
                "Serving {} and {}",
                pair.to_guest_path.display(),
                pair.from_guest_path.display()
            );

            let (end, mut to_guest, mut from_guest) = self.serve(to_guest, from_guest).await;
            let _ = to_guest.close().await;
            let _ = from_guest.close().await;

            match end {
                SessionEnd::Shutdown => break,
                SessionEnd::ChannelFailed => {
                    self.set_state(WorkerState::Connecting);
                    self.idle().await;
                }
            }
        }

        self.calls.close();
        while let Ok(call) = self.calls.try_recv() {
            let _ = call
                .reply
                .send(Err(HostError::WorkerStopped(self.identity.name.clone())));
        }
        self.set_state(WorkerState::Stopped);
        tracing::info!(guest = %self.identity, "Worker stopped");
    }

    /// Shutdown was requested, or the handle is gone.
    fn stopping(&self) -> bool {
        *self.shutdown.borrow() || self.shutdown.has_changed().is_err()
    }

    fn set_state(&self, state: WorkerState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            tracing::debug!(guest = %self.identity, "Worker {} -> {}", previous, state);
        }
    }

    /// Wait one retry interval while not connected, refusing queued calls.
    async fn idle(&mut self) {
        let sleep = tokio::time::sleep(self.context.retry_interval);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => return,
                _ = self.shutdown.changed() => return,
                Some(call) = self.calls.recv() => {
                    let _ = call
                        .reply
                        .send(Err(HostError::NotConnected(self.identity.name.clone())));
                }
            }
        }
    }

    async fn serve(
        &mut self,
        mut to_guest: Channel,
        mut from_guest: Channel,
    ) -> (SessionEnd, Channel, Channel) {
        loop {
            if self.stopping() {
                return (SessionEnd::Shutdown, to_guest, from_guest);
            }

            tokio::select! {
                _ = self.shutdown.changed() => {
                    return (SessionEnd::Shutdown, to_guest, from_guest);
                }
                request = from_guest.next_request() => {
                    let request = match request {
                        Ok(request) => request,
                        Err(e) => {
                            tracing::warn!(guest = %self.identity, "Guest channel failed: {}", e);
                            return (SessionEnd::ChannelFailed, to_guest, from_guest);
                        }
                    };

                    let response = tokio::select! {
                        _ = self.shutdown.changed() => {
                            return (SessionEnd::Shutdown, to_guest, from_guest);
                        }
                        response = self.dispatcher.handle(request) => response,
                    };

                    if let Err(e) = from_guest.respond(&response).await {
                        tracing::warn!(guest = %self.identity, "Cannot answer guest: {}", e);
                        return (SessionEnd::ChannelFailed, to_guest, from_guest);
                    }
                }
                Some(call) = self.calls.recv() => {
                    let result = tokio::select! {
                        _ = self.shutdown.changed() => {
                            let _ = call
                                .reply
                                .send(Err(HostError::WorkerStopped(self.identity.name.clone())));
                            return (SessionEnd::Shutdown, to_guest, from_guest);
                        }
                        result = to_guest.call(&call.request, call.timeout) => result,
                    };

                    let failed = matches!(&result, Err(e) if !matches!(e, CallError::RemoteCallTimedOut(_)));
                    let _ = call.reply.send(result.map_err(HostError::from));
                    if failed {
                        tracing::warn!(guest = %self.identity, "Host to guest channel failed");
                        return (SessionEnd::ChannelFailed, to_guest, from_guest);
                    }
                }
            }
        }
    }
}

async fn connect(pair: &ChannelPair) -> Result<(Channel, Channel), HostError> {
    let to_guest = StreamTransport::connect_unix(&pair.to_guest_path)
        .await
        .map_err(ConnectionError::from)?;
    let from_guest = StreamTransport::connect_unix(&pair.from_guest_path)
        .await
        .map_err(ConnectionError::from)?;
    Ok((Connection::new(to_guest), Connection::new(from_guest)))
}
