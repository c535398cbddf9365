//! Environment preparation performed once before a run.

use std::path::PathBuf;

use tracing::{info, warn};

use crate::config::PathsConfig;
use crate::error::AgentError;

/// Privilege elevation and working-folder creation.
pub trait Bootstrap: Send + Sync {
    fn grant_privileges(&self) -> Result<(), AgentError>;
    fn create_folders(&self) -> Result<(), AgentError>;
}

/// Bootstrap for the host the agent runs on.
#[derive(Debug, Clone)]
pub struct HostBootstrap {
    root: PathBuf,
    folders: Vec<String>,
    require_root: bool,
}

impl HostBootstrap {
    pub fn new(config: &PathsConfig) -> Self {
        Self {
            root: config.root.clone(),
            folders: config.folders.clone(),
            require_root: config.require_root,
        }
    }

    fn folder_paths(&self) -> impl Iterator<Item = PathBuf> + '_ {
        std::iter::once(self.root.clone()).chain(self.folders.iter().map(|f| self.root.join(f)))
    }
}

impl Bootstrap for HostBootstrap {
    fn grant_privileges(&self) -> Result<(), AgentError> {
        if is_root() {
            return Ok(());
        }
        if self.require_root {
            return Err(AgentError::Privilege(
                "agent must run as root to inspect monitored processes".to_string(),
            ));
        }
        warn!("Running without root privileges - processes of other users cannot be injected");
        Ok(())
    }

    fn create_folders(&self) -> Result<(), AgentError> {
        for path in self.folder_paths() {
            std::fs::create_dir_all(&path)
                .map_err(|source| AgentError::Bootstrap { path: path.clone(), source })?;
        }
        info!(root = %self.root.display(), "Working folders ready");
        Ok(())
    }
}

fn is_root() -> bool {
    unsafe { libc::geteuid() == 0 }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn bootstrap(root: PathBuf, require_root: bool) -> HostBootstrap {
        HostBootstrap::new(&PathsConfig {
            root,
            folders: vec!["logs".to_string(), "files".to_string()],
            require_root,
        })
    }

    #[test]
    fn test_create_folders() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("analysis");

        bootstrap(root.clone(), false).create_folders().unwrap();

        assert!(root.join("logs").is_dir());
        assert!(root.join("files").is_dir());
        // Creating them again is harmless.
        bootstrap(root, false).create_folders().unwrap();
    }

    #[test]
    fn test_create_folders_fails_under_a_file() {
        let tmp = TempDir::new().unwrap();
        let blocker = tmp.path().join("blocker");
        std::fs::write(&blocker, b"").unwrap();

        let err = bootstrap(blocker.join("analysis"), false)
            .create_folders()
            .unwrap_err();
        assert!(matches!(err, AgentError::Bootstrap { .. }));
    }

    #[test]
    fn test_privileges_are_optional_by_default() {
        let tmp = TempDir::new().unwrap();
        assert!(bootstrap(tmp.path().to_path_buf(), false).grant_privileges().is_ok());
    }

    #[test]
    fn test_required_privileges() {
        let tmp = TempDir::new().unwrap();
        let result = bootstrap(tmp.path().to_path_buf(), true).grant_privileges();
        assert_eq!(result.is_ok(), is_root());
    }
}
