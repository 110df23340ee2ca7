//! Unpacking of helm chart archives carried on the deploy command.
//!
//! The control plane ships charts as a base64 tar.gz whose top-level
//! directories are the chart releases. Unpacking stages them into a temp
//! directory that lives as long as the `ChartSet`.

use std::path::{Path, PathBuf};

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use flate2::read::GzDecoder;
use tempfile::TempDir;

use super::DeployError;

/// Chart directories from one revision, staged on disk.
pub struct ChartSet {
    dir: TempDir,
    releases: Vec<String>,
}

impl ChartSet {
    pub fn unpack(archive: &str) -> Result<Self, DeployError> {
        let dir = tempfile::tempdir().map_err(DeployError::Archive)?;
        let bytes = BASE64.decode(archive.trim())?;
        let mut tar = tar::Archive::new(GzDecoder::new(bytes.as_slice()));
        tar.unpack(dir.path()).map_err(DeployError::Archive)?;

        let mut releases = Vec::new();
        let entries =
            std::fs::read_dir(dir.path()).map_err(DeployError::Archive)?;
        for entry in entries {
            let entry = entry.map_err(DeployError::Archive)?;
            let is_dir = entry
                .file_type()
                .map_err(DeployError::Archive)?
                .is_dir();
            if is_dir {
                releases.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        releases.sort();
        Ok(Self { dir, releases })
    }

    /// Release names, one per top-level chart directory.
    pub fn releases(&self) -> &[String] {
        &self.releases
    }

    pub fn chart_dir(&self, release: &str) -> PathBuf {
        self.dir.path().join(release)
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }
}

/// Releases present in the previous revision but gone from the current one.
pub fn removed_releases(
    previous: &ChartSet,
    current: Option<&ChartSet>,
) -> Vec<String> {
    previous
        .releases()
        .iter()
        .filter(|release| {
            current.is_none_or(|c| !c.releases().contains(release))
        })
        .cloned()
        .collect()
}
