//! Correlating a guest with the host side sockets of its channels.
//!
//! Two sources are consulted: the `<channel>` elements of the domain XML,
//! and the directory where libvirt creates channel sockets.

use crate::discovery::{ChannelPair, GuestIdentity};
use once_cell::sync::Lazy;
use parley_core::config::{GUEST_TO_HOST_CHANNEL, HOST_TO_GUEST_CHANNEL};
use regex::Regex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

static CHANNEL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?s)<channel\b[^>]*>(.*?)</channel>").expect("channel regex is valid")
});

static SOURCE_PATH_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"<source\b[^>]*?\bpath\s*=\s*['"]([^'"]+)['"]"#).expect("source regex is valid")
});

static TARGET_NAME_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"<target\b[^>]*?\bname\s*=\s*['"]([^'"]+)['"]"#).expect("target regex is valid")
});

static DOMAIN_DIR_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^domain-(\d+)-(.+)$").expect("domain dir regex is valid"));

/// Map channel target name to the host socket path, for every channel of
/// the domain that has both.
pub fn extract_channel_paths(xml: &str) -> HashMap<String, PathBuf> {
    CHANNEL_RE
        .captures_iter(xml)
        .filter_map(|channel| {
            let body = channel.get(1)?.as_str();
            let path = SOURCE_PATH_RE.captures(body)?.get(1)?.as_str();
            let target = TARGET_NAME_RE.captures(body)?.get(1)?.as_str();
            Some((target.to_string(), PathBuf::from(path)))
        })
        .collect()
}

async fn exists(path: &Path) -> bool {
    tokio::fs::try_exists(path).await.unwrap_or(false)
}

async fn pair_in(dir: &Path) -> Option<ChannelPair> {
    let to_guest_path = dir.join(HOST_TO_GUEST_CHANNEL);
    let from_guest_path = dir.join(GUEST_TO_HOST_CHANNEL);
    if exists(&to_guest_path).await && exists(&from_guest_path).await {
        Some(ChannelPair {
            to_guest_path,
            from_guest_path,
        })
    } else {
        None
    }
}

/// Look for the channel sockets of `guest` under `channel_dir`.
///
/// Per-domain directories are named `domain-<id>-<name prefix>`. When the
/// guest's domain id is known only a directory with that id matches;
/// otherwise a directory matches when its suffix is a prefix of the guest
/// name. Legacy flat files `<name>.<target>` match on the exact name.
/// Several name based candidates make the lookup ambiguous and nothing is
/// returned.
pub async fn scan_channel_directory(
    channel_dir: &Path,
    guest: &GuestIdentity,
) -> std::io::Result<Option<ChannelPair>> {
    let mut entries = match tokio::fs::read_dir(channel_dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!("Channel directory {} does not exist", channel_dir.display());
            return Ok(None);
        }
        Err(e) => return Err(e),
    };

    let mut by_name = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let file_name = entry.file_name();
        let Some(file_name) = file_name.to_str() else {
            continue;
        };
        let Some(captures) = DOMAIN_DIR_RE.captures(file_name) else {
            continue;
        };
        if !entry.file_type().await?.is_dir() {
            continue;
        }

        let dir_id = captures[1].parse::<u32>().ok();
        let prefix = &captures[2];
        match guest.domain_id {
            Some(id) if dir_id == Some(id) => {
                if let Some(pair) = pair_in(&entry.path()).await {
                    return Ok(Some(pair));
                }
            }
            Some(_) => {}
            None if guest.name.starts_with(prefix) => {
                if let Some(pair) = pair_in(&entry.path()).await {
                    by_name.push(pair);
                }
            }
            None => {}
        }
    }

    let legacy = ChannelPair {
        to_guest_path: channel_dir.join(format!("{}.{}", guest.name, HOST_TO_GUEST_CHANNEL)),
        from_guest_path: channel_dir.join(format!("{}.{}", guest.name, GUEST_TO_HOST_CHANNEL)),
    };
    if exists(&legacy.to_guest_path).await && exists(&legacy.from_guest_path).await {
        by_name.push(legacy);
    }

    match by_name.len() {
        0 => Ok(None),
        1 => Ok(by_name.pop()),
        n => {
            tracing::warn!(
                "Guest {} matches {} channel candidates in {}, refusing to guess",
                guest,
                n,
                channel_dir.display()
            );
            Ok(None)
        }
    }
}
