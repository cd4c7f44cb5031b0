//! Kernel-backed project quota control

use async_trait::async_trait;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info, warn};
use snapquota_core::{overlay_snapshots_dir, Error, ProjectId, QuotaSpec, Result};

use crate::backend::QuotaBackend;
use crate::mounts;
use crate::sys::{self, ProjectUsage};

/// Name of the block device node created below the containerd root
pub const BACKING_DEVICE_NODE: &str = "backingFsBlockDev";

/// Production quota backend driving XFS/ext4 project quotas
///
/// Owns the project ID allocator. Allocation is serialized; an ID is only
/// consumed once the directory has actually been tagged with it.
#[derive(Clone)]
pub struct ProjectQuotaControl {
    inner: Arc<Inner>,
}

struct Inner {
    base_path: PathBuf,
    backing_device: PathBuf,
    allocation: Mutex<Allocation>,
}

#[derive(Debug)]
struct Allocation {
    next: Option<ProjectId>,
    established: HashSet<ProjectId>,
}

impl ProjectQuotaControl {
    /// Prepare quota control for the snapshots under `root_dir`
    ///
    /// Creates the backing device node and seeds the allocator above every
    /// project ID already in use by `root_dir` and its overlay snapshots.
    ///
    /// # Errors
    /// Returns error if the device node cannot be created or `root_dir`'s
    /// project ID cannot be read
    pub async fn new(base_path: impl Into<PathBuf>, root_dir: impl Into<PathBuf>) -> Result<Self> {
        let base_path = base_path.into();
        let root_dir = root_dir.into();

        tokio::task::spawn_blocking(move || Self::prepare(base_path, &root_dir)).await?
    }

    fn prepare(base_path: PathBuf, root_dir: &Path) -> Result<Self> {
        let backing_device = root_dir.join(BACKING_DEVICE_NODE);
        sys::make_backing_device(root_dir, &backing_device).map_err(|e| {
            Error::quota(format!(
                "failed to create backing device {}: {e}",
                backing_device.display()
            ))
        })?;

        let base_id = sys::project_id(root_dir).map_err(|e| {
            Error::quota(format!("failed to read project ID of {}: {e}", root_dir.display()))
        })?;
        let highest = highest_snapshot_project(&overlay_snapshots_dir(root_dir)).max(base_id);

        info!(
            backing_device = %backing_device.display(),
            base_project_id = %base_id,
            next_project_id = ?highest.next(),
            "Project quota control ready"
        );

        Ok(Self {
            inner: Arc::new(Inner {
                base_path,
                backing_device,
                allocation: Mutex::new(Allocation {
                    next: highest.next(),
                    established: HashSet::new(),
                }),
            }),
        })
    }

    /// Path of the block device node handed to `quotactl`
    #[must_use]
    pub fn backing_device(&self) -> &Path {
        &self.inner.backing_device
    }

    /// Read the project ID a directory is tagged with
    ///
    /// # Errors
    /// Returns error if the path is missing or the ioctl fails
    pub async fn project_id(&self, path: &Path) -> Result<ProjectId> {
        let path = path.to_path_buf();
        tokio::task::spawn_blocking(move || sys::project_id(&path).map_err(Error::from)).await?
    }
}

impl Inner {
    fn allocation(&self) -> std::sync::MutexGuard<'_, Allocation> {
        self.allocation.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn establish(&self, path: &Path) -> Result<ProjectId> {
        let mut allocation = self.allocation();
        let id = allocation
            .next
            .ok_or_else(|| Error::quota("project ID space exhausted"))?;

        sys::set_project_id(path, id).map_err(|e| {
            Error::quota(format!("failed to set project {id} on {}: {e}", path.display()))
        })?;

        allocation.next = id.next();
        allocation.established.insert(id);
        Ok(id)
    }

    fn bind(&self, path: &Path, id: ProjectId) -> Result<()> {
        if !self.allocation().established.contains(&id) {
            return Err(Error::quota(format!("project {id} was never established")));
        }
        sys::set_project_id(path, id).map_err(|e| {
            Error::quota(format!("failed to set project {id} on {}: {e}", path.display()))
        })
    }

    fn usage(&self, id: ProjectId) -> Result<ProjectUsage> {
        sys::project_usage(&self.backing_device, id)
            .map_err(|e| Error::quota(format!("failed to query project {id}: {e}")))
    }

    fn set_limit(&self, id: ProjectId, spec: QuotaSpec) -> Result<()> {
        sys::set_project_limit(&self.backing_device, id, spec)
            .map_err(|e| Error::quota(format!("failed to set limit of project {id}: {e}")))
    }
}

/// Highest project ID found on `<snapshots>/*/fs`; unreadable entries are skipped
fn highest_snapshot_project(snapshots: &Path) -> ProjectId {
    let entries = match std::fs::read_dir(snapshots) {
        Ok(entries) => entries,
        Err(e) => {
            debug!(path = %snapshots.display(), error = %e, "No snapshots to scan");
            return ProjectId::UNSET;
        }
    };

    entries
        .filter_map(std::result::Result::ok)
        .filter_map(|entry| {
            let fs = entry.path().join("fs");
            sys::project_id(&fs)
                .inspect_err(|e| debug!(path = %fs.display(), error = %e, "Skipping snapshot"))
                .ok()
        })
        .max()
        .unwrap_or(ProjectId::UNSET)
}

impl std::fmt::Debug for ProjectQuotaControl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProjectQuotaControl")
            .field("base_path", &self.inner.base_path)
            .field("backing_device", &self.inner.backing_device)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl QuotaBackend for ProjectQuotaControl {
    async fn precheck(&self, base_path: &Path) -> Result<bool> {
        let path = base_path.to_path_buf();
        let supported = tokio::task::spawn_blocking(move || mounts::precheck(&path)).await??;
        if !supported {
            warn!(path = %base_path.display(), "Project quota is not enabled");
        }
        Ok(supported)
    }

    async fn establish(&self, path: &Path) -> Result<ProjectId> {
        let inner = Arc::clone(&self.inner);
        let target = path.to_path_buf();
        let id = tokio::task::spawn_blocking(move || inner.establish(&target)).await??;

        debug!(path = %path.display(), project_id = %id, "Established project");
        Ok(id)
    }

    async fn bind(&self, path: &Path, id: ProjectId) -> Result<()> {
        let inner = Arc::clone(&self.inner);
        let target = path.to_path_buf();
        tokio::task::spawn_blocking(move || inner.bind(&target, id)).await??;

        debug!(path = %path.display(), project_id = %id, "Bound path to project");
        Ok(())
    }

    async fn set_limit(&self, id: ProjectId, spec: QuotaSpec) -> Result<()> {
        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || inner.set_limit(id, spec)).await??;

        debug!(project_id = %id, size = %spec.size, "Set project limit");
        Ok(())
    }

    async fn release(&self, id: ProjectId) -> Result<()> {
        self.set_limit(id, QuotaSpec::unlimited()).await?;
        debug!(project_id = %id, "Released project");
        Ok(())
    }

    async fn usage(&self, id: ProjectId) -> Result<ProjectUsage> {
        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || inner.usage(id)).await?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_snapshots_dir_scans_to_unset() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(
            highest_snapshot_project(&dir.path().join("absent")),
            ProjectId::UNSET
        );
    }

    #[test]
    fn test_scan_reads_configured_snapshots_dir() {
        let root = tempfile::tempdir().unwrap();
        let config = snapquota_core::config::ContainerdConfig {
            root_dir: root.path().to_path_buf(),
            ..Default::default()
        };
        let snapshots = config.snapshots_dir();
        assert_eq!(snapshots, overlay_snapshots_dir(root.path()));

        std::fs::create_dir_all(snapshots.join("7").join("fs")).unwrap();
        // a tempdir carries no project attribute, so the scan stays unset
        assert_eq!(highest_snapshot_project(&snapshots), ProjectId::UNSET);
    }

    #[test]
    fn test_exhausted_allocator_refuses_to_establish() {
        let dir = tempfile::tempdir().unwrap();
        let inner = Inner {
            base_path: PathBuf::from("/"),
            backing_device: dir.path().join(BACKING_DEVICE_NODE),
            allocation: Mutex::new(Allocation {
                next: ProjectId::from_raw(u32::MAX).next(),
                established: HashSet::new(),
            }),
        };
        let err = inner.establish(dir.path()).unwrap_err();
        assert!(err.to_string().contains("exhausted"));
    }

    #[test]
    fn test_bind_requires_establish() {
        let dir = tempfile::tempdir().unwrap();
        let inner = Inner {
            base_path: PathBuf::from("/"),
            backing_device: dir.path().join(BACKING_DEVICE_NODE),
            allocation: Mutex::new(Allocation {
                next: Some(ProjectId::from_raw(1)),
                established: HashSet::new(),
            }),
        };
        let err = inner.bind(dir.path(), ProjectId::from_raw(1)).unwrap_err();
        assert!(err.to_string().contains("never established"));
    }
}
