//! Per-cluster bookkeeping directories
//!
//! Each cluster gets `<config root>/<name>/`, created after a successful
//! create and removed on delete. It holds the extracted credentials file.

use crate::config::Settings;
use crate::error::{ClusterError, Result};
use std::path::{Path, PathBuf};

/// File name of the extracted credentials
pub const KUBECONFIG_FILE: &str = "kubeconfig.yaml";

/// Size of the archive header in front of a copied file
const ARCHIVE_HEADER_LEN: usize = 512;

/// Cluster directories under one root
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterDirs {
    root: PathBuf,
}

impl ClusterDirs {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn from_settings(settings: &Settings) -> Result<Self> {
        Ok(Self::new(settings.config_root()?))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn cluster_dir(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    pub fn kubeconfig_path(&self, name: &str) -> PathBuf {
        self.cluster_dir(name).join(KUBECONFIG_FILE)
    }

    /// Create the directory of `name` if it is missing
    pub fn create(&self, name: &str) -> Result<PathBuf> {
        let dir = self.cluster_dir(name);
        std::fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    /// Remove the directory of `name`; a missing directory is not an error
    pub fn remove(&self, name: &str) -> Result<()> {
        let dir = self.cluster_dir(name);
        match std::fs::remove_dir_all(&dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Recover a single file from the archive stream an engine returns for a
/// copy: drop the leading header block and the NUL padding around the body.
pub fn extract_archived_file(archive: &[u8]) -> Result<Vec<u8>> {
    if archive.len() < ARCHIVE_HEADER_LEN {
        return Err(ClusterError::Engine(format!(
            "copied archive is {} bytes, shorter than its header",
            archive.len()
        )));
    }

    let body = &archive[ARCHIVE_HEADER_LEN..];
    let start = body.iter().position(|b| *b != 0).unwrap_or(body.len());
    let end = body.iter().rposition(|b| *b != 0).map(|i| i + 1).unwrap_or(start);
    Ok(body[start..end].to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_create_is_idempotent_and_remove_tolerates_missing() {
        let tmp = tempdir().unwrap();
        let dirs = ClusterDirs::new(tmp.path());

        let dir = dirs.create("t1").unwrap();
        assert!(dir.is_dir());
        dirs.create("t1").unwrap();

        std::fs::write(dirs.kubeconfig_path("t1"), "x").unwrap();
        dirs.remove("t1").unwrap();
        assert!(!dir.exists());
        dirs.remove("t1").unwrap();
    }

    #[test]
    fn test_paths() {
        let dirs = ClusterDirs::new("/home/u/.config/k3box");
        assert_eq!(
            dirs.kubeconfig_path("t1"),
            PathBuf::from("/home/u/.config/k3box/t1/kubeconfig.yaml")
        );
    }

    #[test]
    fn test_extract_strips_header_and_padding() {
        let mut archive = vec![7u8; 512];
        archive.extend_from_slice(b"apiVersion: v1\n");
        archive.extend_from_slice(&[0u8; 1000]);
        assert_eq!(extract_archived_file(&archive).unwrap(), b"apiVersion: v1\n");

        assert!(extract_archived_file(&[0u8; 100]).is_err());
        assert!(extract_archived_file(&[0u8; 1024]).unwrap().is_empty());
    }
}
