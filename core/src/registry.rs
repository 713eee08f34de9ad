//! The command registry: executable files in the command directories.
//!
//! The registry is never cached. Every lookup rescans the directories, so a
//! script dropped into place is callable on the very next request.

use crate::config::{BUILTIN_COMMANDS_DIRECTORY, USER_COMMANDS_DIRECTORY};
use crate::error::RegistryError;
use std::collections::BTreeMap;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tokio::fs;

#[derive(Debug, Clone)]
pub struct CommandRegistry {
    /// Scanned in order; the first directory providing a name wins.
    directories: Vec<PathBuf>,
}

impl Default for CommandRegistry {
    fn default() -> Self {
        Self::new(vec![
            PathBuf::from(USER_COMMANDS_DIRECTORY),
            PathBuf::from(BUILTIN_COMMANDS_DIRECTORY),
        ])
    }
}

impl CommandRegistry {
    pub fn new(directories: Vec<PathBuf>) -> Self {
        Self { directories }
    }

    pub fn directories(&self) -> &[PathBuf] {
        &self.directories
    }

    /// Make the registry usable before a daemon starts serving.
    ///
    /// Creates the first (user) directory when it is missing and restores
    /// the executable bits on regular files in the remaining directories,
    /// which packaging tools tend to drop.
    pub async fn prepare(&self) -> Result<(), RegistryError> {
        let Some((user_dir, others)) = self.directories.split_first() else {
            return Ok(());
        };

        fs::create_dir_all(user_dir)
            .await
            .map_err(|source| RegistryError::Prepare {
                path: user_dir.display().to_string(),
                source,
            })?;

        for dir in others {
            if !fs::metadata(dir).await.map(|m| m.is_dir()).unwrap_or(false) {
                continue;
            }
            let mut entries = fs::read_dir(dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                let metadata = fs::metadata(&path).await?;
                if metadata.is_file() && metadata.permissions().mode() & 0o111 == 0 {
                    tracing::debug!("Making {} executable", path.display());
                    fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).await?;
                }
            }
        }

        Ok(())
    }

    /// Current mapping of command name to executable.
    pub async fn scan(&self) -> Result<BTreeMap<String, PathBuf>, RegistryError> {
        let mut commands = BTreeMap::new();

        for dir in &self.directories {
            let mut entries = match fs::read_dir(dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };

            while let Some(entry) = entries.next_entry().await? {
                let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                    continue;
                };
                if !is_valid_name(&name) || commands.contains_key(&name) {
                    continue;
                }
                let path = entry.path();
                if is_executable(&path).await {
                    commands.insert(name, path);
                }
            }
        }

        Ok(commands)
    }

    pub async fn names(&self) -> Result<Vec<String>, RegistryError> {
        Ok(self.scan().await?.into_keys().collect())
    }

    pub async fn lookup(&self, name: &str) -> Result<Option<PathBuf>, RegistryError> {
        if !is_valid_name(name) {
            return Ok(None);
        }
        for dir in &self.directories {
            let path = dir.join(name);
            if is_executable(&path).await {
                return Ok(Some(path));
            }
        }
        Ok(None)
    }
}

fn is_valid_name(name: &str) -> bool {
    !name.is_empty() && !name.starts_with('.') && !name.contains('/')
}

async fn is_executable(path: &Path) -> bool {
    match fs::metadata(path).await {
        Ok(m) => m.is_file() && m.permissions().mode() & 0o111 != 0,
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn write_script(dir: &Path, name: &str, mode: u32) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, "#!/bin/sh\necho hi\n").await.unwrap();
        fs::set_permissions(&path, std::fs::Permissions::from_mode(mode))
            .await
            .unwrap();
        path
    }

    #[tokio::test]
    async fn test_scan_lists_only_executables() {
        let dir = TempDir::new().unwrap();
        write_script(dir.path(), "reboot", 0o755).await;
        write_script(dir.path(), "notes.txt", 0o644).await;
        write_script(dir.path(), ".hidden", 0o755).await;
        fs::create_dir(dir.path().join("subdir")).await.unwrap();

        let registry = CommandRegistry::new(vec![dir.path().to_path_buf()]);
        assert_eq!(registry.names().await.unwrap(), vec!["reboot"]);
    }

    #[tokio::test]
    async fn test_scan_reflects_new_entries() {
        let dir = TempDir::new().unwrap();
        let registry = CommandRegistry::new(vec![dir.path().to_path_buf()]);
        assert!(registry.names().await.unwrap().is_empty());

        write_script(dir.path(), "backup", 0o700).await;
        assert_eq!(registry.names().await.unwrap(), vec!["backup"]);

        fs::remove_file(dir.path().join("backup")).await.unwrap();
        assert!(registry.names().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_user_directory_wins() {
        let user = TempDir::new().unwrap();
        let builtin = TempDir::new().unwrap();
        let user_script = write_script(user.path(), "status", 0o755).await;
        write_script(builtin.path(), "status", 0o755).await;
        write_script(builtin.path(), "uptime", 0o755).await;

        let registry =
            CommandRegistry::new(vec![user.path().to_path_buf(), builtin.path().to_path_buf()]);
        let commands = registry.scan().await.unwrap();
        assert_eq!(commands.len(), 2);
        assert_eq!(commands["status"], user_script);
        assert_eq!(registry.lookup("status").await.unwrap(), Some(user_script));
    }

    #[tokio::test]
    async fn test_lookup_rejects_paths() {
        let dir = TempDir::new().unwrap();
        write_script(dir.path(), "ok", 0o755).await;
        let registry = CommandRegistry::new(vec![dir.path().to_path_buf()]);

        assert!(registry.lookup("ok").await.unwrap().is_some());
        assert!(registry.lookup("../ok").await.unwrap().is_none());
        assert!(registry.lookup("").await.unwrap().is_none());
        assert!(registry.lookup("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_missing_directories_are_skipped() {
        let registry = CommandRegistry::new(vec![PathBuf::from("/nonexistent/parley")]);
        assert!(registry.names().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_prepare_creates_user_dir_and_fixes_modes() {
        let root = TempDir::new().unwrap();
        let user = root.path().join("user");
        let builtin = root.path().join("builtin");
        fs::create_dir(&builtin).await.unwrap();
        let script = write_script(&builtin, "info", 0o644).await;

        let registry = CommandRegistry::new(vec![user.clone(), builtin]);
        registry.prepare().await.unwrap();

        assert!(user.is_dir());
        let mode = fs::metadata(&script).await.unwrap().permissions().mode();
        assert_ne!(mode & 0o111, 0);
        assert_eq!(registry.names().await.unwrap(), vec!["info"]);
    }
}
