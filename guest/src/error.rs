use parley_core::config::{EXIT_TEMPFAIL, EXIT_UNAVAILABLE};
use parley_core::{CallError, RegistryError, TransportError};
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DeviceError {
    #[error(
        "virtio-serial channel {name} not found (scanned {scanned}). \
         Either the channel device was never attached to this VM, \
         or the virtio_console kernel module is not loaded (try `modprobe virtio_console`)"
    )]
    DeviceNotFound { name: String, scanned: PathBuf },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Error, Debug)]
pub enum GuestError {
    #[error("{0}")]
    Device(#[from] DeviceError),

    #[error("host is not connected to {0}")]
    HostNotConnected(PathBuf),

    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("call failed: {0}")]
    Call(#[from] CallError),
}

impl GuestError {
    pub fn exit_status(&self) -> u8 {
        match self {
            GuestError::Call(CallError::RemoteCallTimedOut(_))
            | GuestError::Call(CallError::Protocol(_)) => EXIT_TEMPFAIL,
            _ => EXIT_UNAVAILABLE,
        }
    }
}
