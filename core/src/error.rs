use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("timed out waiting for data")]
    Timeout,

    #[error("channel closed by peer")]
    Closed,

    #[error("device still busy after {attempts} attempts")]
    Busy { attempts: u32 },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("invalid frame header: expected a byte count, got {0:?}")]
    InvalidHeader(String),

    #[error("frame of {0} bytes exceeds the maximum frame size")]
    FrameTooLarge(usize),

    #[error("malformed message: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Failure of one side of a connection while sending or waiting for a frame.
#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

impl ConnectionError {
    /// Whether the underlying channel can no longer be used.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, ConnectionError::Transport(TransportError::Timeout))
    }
}

/// Failure of a remote call, as seen by the caller.
#[derive(Error, Debug)]
pub enum CallError {
    #[error("remote call timed out after {0:?}")]
    RemoteCallTimedOut(Duration),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
}

impl From<ConnectionError> for CallError {
    fn from(e: ConnectionError) -> Self {
        match e {
            ConnectionError::Transport(e) => CallError::Transport(e),
            ConnectionError::Protocol(e) => CallError::Protocol(e),
        }
    }
}

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("cannot prepare command directory {path}: {source}")]
    Prepare {
        path: String,
        source: std::io::Error,
    },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Error, Debug)]
pub enum ExecError {
    #[error("command not found: {0}")]
    CommandNotFound(String),

    #[error("output of {command} exceeds {limit} bytes")]
    OutputTooLarge { command: String, limit: usize },

    #[error("failed to spawn {command}: {source}")]
    Spawn {
        command: String,
        source: std::io::Error,
    },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
