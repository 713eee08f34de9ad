//! Shared protocol engine for host and guest channels.
//!
//! Requests and responses travel as length-prefixed JSON frames over a
//! virtio-serial port (guest) or the UNIX socket QEMU exposes for it (host).
//! Both sides run the same dispatcher against their own command directories.

pub mod config;
mod connection;
mod dispatch;
mod error;
mod executor;
pub mod protocol;
mod registry;
mod transport;

pub use connection::Connection;
pub use dispatch::Dispatcher;
pub use error::{CallError, ConnectionError, ExecError, ProtocolError, RegistryError, TransportError};
pub use executor::{ExecOutput, run_command};
pub use protocol::{Request, Response};
pub use registry::CommandRegistry;
pub use transport::{StreamTransport, Transport};
