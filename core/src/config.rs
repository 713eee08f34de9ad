//! Defaults shared by the host and guest daemons.
//!
//! Everything here can be overridden from the command line; the values are
//! read-only once a daemon has started.

use std::time::Duration;

/// Target name of the channel the host writes requests to (guest serves it).
pub const HOST_TO_GUEST_CHANNEL: &str = "parley-host-to-guest.0";

/// Target name of the channel the guest writes requests to (host serves it).
pub const GUEST_TO_HOST_CHANNEL: &str = "parley-guest-to-host.0";

/// Directory where libvirt places the host side of QEMU channel sockets.
pub const DEFAULT_CHANNEL_DIRECTORY: &str = "/var/lib/libvirt/qemu/channel/target";

/// Commands shipped with the package.
pub const BUILTIN_COMMANDS_DIRECTORY: &str = "/usr/lib/parley/commands";

/// Commands installed by the operator. Takes precedence over the built-ins.
pub const USER_COMMANDS_DIRECTORY: &str = "/etc/parley/commands";

/// Operator socket of the host daemon.
pub const DEFAULT_CONTROL_SOCKET: &str = "/run/parley/host.sock";

/// Default call timeout in seconds. Zero disables the deadline.
pub const DEFAULT_TIMEOUT_SECS: u64 = 10;

/// Default interval between guest discovery polls, in seconds.
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 10;

/// Attempts made on a port read or open that keeps failing with `EBUSY`.
pub const DEFAULT_BUSY_RETRY_ATTEMPTS: u32 = 10;

/// Pause between two `EBUSY` attempts.
pub const DEFAULT_BUSY_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Environment variables identifying the calling peer.
pub const ENV_GUEST_NAME: &str = "PARLEY_GUEST_NAME";
pub const ENV_GUEST_ID: &str = "PARLEY_GUEST_ID";
pub const ENV_PEER: &str = "PARLEY_PEER";
pub const ENV_CHANNEL: &str = "PARLEY_CHANNEL";

/// Exit status of a one-shot call when the peer could not be reached
/// (`EX_UNAVAILABLE` from sysexits.h).
pub const EXIT_UNAVAILABLE: u8 = 69;

/// Exit status of a one-shot call that timed out or broke the protocol
/// (`EX_TEMPFAIL`).
pub const EXIT_TEMPFAIL: u8 = 75;

/// Convert an operator-supplied timeout in seconds into a deadline length.
/// Zero means "wait forever".
pub fn call_timeout(secs: u64) -> Option<Duration> {
    if secs == 0 {
        None
    } else {
        Some(Duration::from_secs(secs))
    }
}

/// Bounded retry applied to reads that fail with `EBUSY`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BusyRetry {
    pub attempts: u32,
    pub delay: Duration,
}

impl Default for BusyRetry {
    fn default() -> Self {
        Self {
            attempts: DEFAULT_BUSY_RETRY_ATTEMPTS,
            delay: DEFAULT_BUSY_RETRY_DELAY,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_timeout_disables_deadline() {
        assert_eq!(call_timeout(0), None);
        assert_eq!(call_timeout(10), Some(Duration::from_secs(10)));
    }
}
