//! Host side of the parley channels.
//!
//! The daemon polls libvirt for running guests, keeps one worker per guest
//! connected to its two channel sockets, and exposes a control socket for
//! one-shot operator calls.

mod channels;
pub mod client;
pub mod control;
pub mod daemon;
pub mod discovery;
mod error;
mod worker;

pub use channels::{extract_channel_paths, scan_channel_directory};
pub use daemon::{HostConfig, HostDaemon, PollSummary, RoutedCall};
pub use discovery::{ChannelPair, Discovery, DiscoveryBackend, GuestIdentity, VirshBackend};
pub use error::{DiscoveryError, FailureKind, HostError};
pub use worker::{OutboundCall, WorkerHandle, WorkerState};
