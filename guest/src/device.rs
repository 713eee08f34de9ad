//! Locating the guest end of a virtio-serial channel.

use crate::error::DeviceError;
use std::path::{Path, PathBuf};

pub const SYSFS_VIRTIO_PORTS: &str = "/sys/class/virtio-ports";
pub const DEV_ROOT: &str = "/dev";

/// Find the character device whose port declares `name`.
///
/// Every `<sysfs_root>/<port>/name` is compared with `name`; a match maps to
/// `<dev_root>/<port>`. The udev symlink `<dev_root>/virtio-ports/<name>` is
/// accepted when the scan finds nothing.
pub async fn find_character_device(
    sysfs_root: &Path,
    dev_root: &Path,
    name: &str,
) -> Result<PathBuf, DeviceError> {
    match tokio::fs::read_dir(sysfs_root).await {
        Ok(mut entries) => {
            while let Some(entry) = entries.next_entry().await? {
                let declared = match tokio::fs::read_to_string(entry.path().join("name")).await {
                    Ok(declared) => declared,
                    Err(e) => {
                        tracing::trace!("Skipping {}: {}", entry.path().display(), e);
                        continue;
                    }
                };
                if declared.trim() == name {
                    let device = dev_root.join(entry.file_name());
                    tracing::debug!("Channel {} is {}", name, device.display());
                    return Ok(device);
                }
            }
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!("{} does not exist", sysfs_root.display());
        }
        Err(e) => return Err(e.into()),
    }

    let link = dev_root.join("virtio-ports").join(name);
    if tokio::fs::try_exists(&link).await.unwrap_or(false) {
        tracing::debug!("Channel {} found through {}", name, link.display());
        return Ok(link);
    }

    Err(DeviceError::DeviceNotFound {
        name: name.to_string(),
        scanned: sysfs_root.to_path_buf(),
    })
}
