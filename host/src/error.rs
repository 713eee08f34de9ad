use parley_core::config::{EXIT_TEMPFAIL, EXIT_UNAVAILABLE};
use parley_core::{CallError, ConnectionError, RegistryError};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DiscoveryError {
    #[error("virtualization manager unavailable: {0}")]
    ManagerUnavailable(String),

    #[error("failed to run {program}: {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl DiscoveryError {
    /// The manager being down is routine (e.g. libvirtd restarting) and is
    /// reported quietly.
    pub fn is_expected(&self) -> bool {
        matches!(self, DiscoveryError::ManagerUnavailable(_))
    }
}

/// Why an operator call did not produce a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Unavailable,
    Timeout,
    Protocol,
}

impl FailureKind {
    pub fn exit_status(self) -> u8 {
        match self {
            FailureKind::Unavailable => EXIT_UNAVAILABLE,
            FailureKind::Timeout | FailureKind::Protocol => EXIT_TEMPFAIL,
        }
    }
}

#[derive(Error, Debug)]
pub enum HostError {
    #[error("discovery error: {0}")]
    Discovery(#[from] DiscoveryError),

    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("no running guest named {0}")]
    UnknownGuest(String),

    #[error("channels of guest {0} are not connected")]
    NotConnected(String),

    #[error("worker of guest {0} is busy")]
    WorkerBusy(String),

    #[error("worker of guest {0} stopped before answering")]
    WorkerStopped(String),

    #[error("host daemon is not listening: {0}")]
    DaemonUnavailable(std::io::Error),

    #[error("{message}")]
    Remote { kind: FailureKind, message: String },

    #[error("call failed: {0}")]
    Call(#[from] CallError),

    #[error("connection error: {0}")]
    Connection(#[from] ConnectionError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl HostError {
    pub fn kind(&self) -> FailureKind {
        match self {
            HostError::Remote { kind, .. } => *kind,
            HostError::Call(CallError::RemoteCallTimedOut(_)) => FailureKind::Timeout,
            HostError::Call(CallError::Protocol(_))
            | HostError::Connection(ConnectionError::Protocol(_)) => FailureKind::Protocol,
            _ => FailureKind::Unavailable,
        }
    }

    pub fn exit_status(&self) -> u8 {
        self.kind().exit_status()
    }
}
