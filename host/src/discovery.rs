//! Finding running guests and the sockets of their channels.
//!
//! The virtualization manager is only reached through [`DiscoveryBackend`]:
//! production shells out to `virsh`, tests substitute canned answers.

use crate::channels::{extract_channel_paths, scan_channel_directory};
use crate::error::DiscoveryError;
use async_trait::async_trait;
use parley_core::config::{GUEST_TO_HOST_CHANNEL, HOST_TO_GUEST_CHANNEL};
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;

/// How long a single `virsh` query may take before the manager is
/// considered unavailable.
pub const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(30);

/// A running guest instance.
///
/// The domain id is authoritative when known; the name is the fallback
/// match key. A rebooted guest gets a new id and is a new instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GuestIdentity {
    pub name: String,
    pub domain_id: Option<u32>,
}

impl GuestIdentity {
    pub fn new(name: impl Into<String>, domain_id: Option<u32>) -> Self {
        Self {
            name: name.into(),
            domain_id,
        }
    }

    /// Whether an operator-supplied guest reference (name or numeric id)
    /// designates this guest.
    pub fn matches(&self, reference: &str) -> bool {
        if self.name == reference {
            return true;
        }
        match (self.domain_id, reference.parse::<u32>()) {
            (Some(id), Ok(wanted)) => id == wanted,
            _ => false,
        }
    }
}

/// Pick the guest an operator reference designates.
///
/// An exact name wins over a domain id, so a guest named "7" is not confused
/// with the guest whose id is 7. Several candidates at the same level are
/// ambiguous and select nothing.
pub fn select_guest<'a>(
    guests: impl IntoIterator<Item = &'a GuestIdentity>,
    reference: &str,
) -> Option<&'a GuestIdentity> {
    let guests: Vec<&GuestIdentity> = guests.into_iter().collect();
    let mut candidates: Vec<&GuestIdentity> = guests
        .iter()
        .copied()
        .filter(|guest| guest.name == reference)
        .collect();
    if candidates.is_empty() {
        candidates = guests
            .into_iter()
            .filter(|guest| guest.matches(reference))
            .collect();
    }
    match candidates.as_slice() {
        [only] => Some(*only),
        [] => None,
        _ => {
            tracing::warn!("Guest reference {} is ambiguous", reference);
            None
        }
    }
}

impl fmt::Display for GuestIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.domain_id {
            Some(id) => write!(f, "{} (id {})", self.name, id),
            None => write!(f, "{}", self.name),
        }
    }
}

/// Host side endpoints of the two channels of one guest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelPair {
    /// Requests from the host, served by the guest daemon.
    pub to_guest_path: PathBuf,
    /// Requests from the guest, served by the host daemon.
    pub from_guest_path: PathBuf,
}

#[async_trait]
pub trait DiscoveryBackend: Send + Sync {
    /// Identities of all running guests.
    async fn list_active(&self) -> Result<Vec<GuestIdentity>, DiscoveryError>;

    /// Domain XML of one guest.
    async fn describe(&self, guest: &GuestIdentity) -> Result<String, DiscoveryError>;
}

/// Backend querying libvirt through the `virsh` command line tool.
#[derive(Debug, Clone)]
pub struct VirshBackend {
    program: PathBuf,
    connect_uri: Option<String>,
    timeout: Duration,
}

impl Default for VirshBackend {
    fn default() -> Self {
        Self::new(PathBuf::from("virsh"), None)
    }
}

impl VirshBackend {
    pub fn new(program: PathBuf, connect_uri: Option<String>) -> Self {
        Self {
            program,
            connect_uri,
            timeout: DEFAULT_QUERY_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn run(&self, args: &[&str]) -> Result<String, DiscoveryError> {
        let mut command = Command::new(&self.program);
        if let Some(uri) = &self.connect_uri {
            command.arg("--connect").arg(uri);
        }
        command.args(args).stdin(Stdio::null()).kill_on_drop(true);

        tracing::debug!("Running {} {:?}", self.program.display(), args);
        let output = tokio::time::timeout(self.timeout, command.output())
            .await
            .map_err(|_| {
                DiscoveryError::ManagerUnavailable(format!(
                    "{} {} did not answer within {:?}",
                    self.program.display(),
                    args.join(" "),
                    self.timeout
                ))
            })?
            .map_err(|source| DiscoveryError::Spawn {
                program: self.program.display().to_string(),
                source,
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let message = stderr.trim();
            return Err(DiscoveryError::ManagerUnavailable(if message.is_empty() {
                format!("{} exited with {}", self.program.display(), output.status)
            } else {
                message.to_string()
            }));
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl DiscoveryBackend for VirshBackend {
    async fn list_active(&self) -> Result<Vec<GuestIdentity>, DiscoveryError> {
        let output = self.run(&["list"]).await?;
        Ok(parse_domain_list(&output))
    }

    async fn describe(&self, guest: &GuestIdentity) -> Result<String, DiscoveryError> {
        let reference = match guest.domain_id {
            Some(id) => id.to_string(),
            None => guest.name.clone(),
        };
        self.run(&["dumpxml", &reference]).await
    }
}

/// Parse the table printed by `virsh list`.
///
/// ```text
///  Id   Name      State
/// --------------------------
///  3    webserver running
///  -    template  shut off
/// ```
pub fn parse_domain_list(output: &str) -> Vec<GuestIdentity> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter(|line| !line.chars().all(|c| c == '-'))
        .filter_map(|line| {
            let mut tokens = line.split_whitespace();
            let id = tokens.next()?;
            let name = tokens.next()?;
            if id == "Id" && name == "Name" {
                return None;
            }
            let domain_id = match id {
                "-" => None,
                id => Some(id.parse::<u32>().ok()?),
            };
            Some(GuestIdentity::new(name, domain_id))
        })
        .collect()
}

/// Discovery as used by the daemon and the one-shot client.
#[derive(Clone)]
pub struct Discovery {
    backend: Arc<dyn DiscoveryBackend>,
    channel_dir: PathBuf,
}

impl Discovery {
    pub fn new(backend: Arc<dyn DiscoveryBackend>, channel_dir: PathBuf) -> Self {
        Self {
            backend,
            channel_dir,
        }
    }

    pub fn channel_dir(&self) -> &Path {
        &self.channel_dir
    }

    pub async fn find_running_guests(&self) -> Result<Vec<GuestIdentity>, DiscoveryError> {
        self.backend.list_active().await
    }

    /// Locate both channel sockets of `guest`.
    ///
    /// The domain XML is consulted first; when it does not name both
    /// sockets the channel directory is scanned. `Ok(None)` means the guest
    /// has no (complete) channel pair yet.
    pub async fn resolve_channels(
        &self,
        guest: &GuestIdentity,
    ) -> Result<Option<ChannelPair>, DiscoveryError> {
        let xml = self.backend.describe(guest).await?;
        let paths = extract_channel_paths(&xml);

        if let (Some(to_guest), Some(from_guest)) = (
            paths.get(HOST_TO_GUEST_CHANNEL),
            paths.get(GUEST_TO_HOST_CHANNEL),
        ) {
            return Ok(Some(ChannelPair {
                to_guest_path: to_guest.clone(),
                from_guest_path: from_guest.clone(),
            }));
        }

        tracing::debug!(
            "Domain XML of {} does not name both channels, scanning {}",
            guest,
            self.channel_dir.display()
        );
        Ok(scan_channel_directory(&self.channel_dir, guest).await?)
    }

    /// Resolve an operator-supplied reference to a running guest.
    pub async fn find_guest(&self, reference: &str) -> Result<Option<GuestIdentity>, DiscoveryError> {
        let guests = self.find_running_guests().await?;
        Ok(select_guest(&guests, reference).cloned())
    }
}
