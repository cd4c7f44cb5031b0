//! Overlay snapshot directory layout

use std::path::{Path, PathBuf};

use crate::runtime::SnapshotMount;

const UPPERDIR_OPTION: &str = "upperdir=";

/// Directories of one overlay snapshot that share a container's project
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OverlayLayout {
    /// Snapshot directory, parent of the upper dir
    pub snapshot_dir: PathBuf,
    /// Writable upper layer
    pub fs_dir: PathBuf,
    /// Overlay work directory
    pub work_dir: PathBuf,
}

impl OverlayLayout {
    /// Layout rooted at a snapshot directory
    pub fn new(snapshot_dir: impl Into<PathBuf>) -> Self {
        let snapshot_dir = snapshot_dir.into();
        Self {
            fs_dir: snapshot_dir.join("fs"),
            work_dir: snapshot_dir.join("work"),
            snapshot_dir,
        }
    }

    /// Derive the layout from the first `upperdir=` option of the mounts
    ///
    /// Returns `None` when no mount carries an upper directory.
    #[must_use]
    pub fn from_mounts(mounts: &[SnapshotMount]) -> Option<Self> {
        let upper = mounts
            .iter()
            .flat_map(|m| m.options.iter())
            .find_map(|option| option.strip_prefix(UPPERDIR_OPTION))?;

        Path::new(upper)
            .parent()
            .filter(|dir| !dir.as_os_str().is_empty())
            .map(Self::new)
    }
}
