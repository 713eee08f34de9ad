//! Guest side of the parley channels.
//!
//! Runs inside the VM. The daemon answers host requests arriving on the
//! host→guest virtio-serial port; one-shot calls reach the host through the
//! guest→host port.

pub mod client;
pub mod daemon;
pub mod device;
mod error;
pub mod transport;

pub use daemon::{GuestConfig, GuestDaemon, SessionEnd, serve_session};
pub use device::find_character_device;
pub use error::{DeviceError, GuestError};
pub use transport::{CharacterDevice, Port, retry_on_busy};
