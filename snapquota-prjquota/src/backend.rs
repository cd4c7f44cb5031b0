//! Quota backend trait for pluggable implementations

use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use snapquota_core::{Error, ProjectId, QuotaSize, QuotaSpec, Result};

use crate::sys::ProjectUsage;

/// Trait for project quota backends
///
/// This allows for different implementations:
/// - [`ProjectQuotaControl`](crate::ProjectQuotaControl) - Production kernel project quotas
/// - [`MockBackend`] - Testing without a quota-enabled filesystem
///
/// Establishing allocates a project and tags one directory with it; binding
/// tags further directories with an existing project so that one limit
/// covers all of them.
///
/// # Thread Safety
/// All implementations must be `Send + Sync` for use across async tasks.
#[async_trait]
pub trait QuotaBackend: Send + Sync {
    /// Check that the filesystem backing `base_path` has project quota enabled
    ///
    /// # Errors
    /// Returns error if the mount table cannot be read or has no entry for the path
    async fn precheck(&self, base_path: &Path) -> Result<bool>;

    /// Allocate a new project and tag the directory at `path` with it
    ///
    /// # Errors
    /// Returns error if the path is missing, cannot be tagged, or the ID space is exhausted
    async fn establish(&self, path: &Path) -> Result<ProjectId>;

    /// Tag the directory at `path` with an already established project
    ///
    /// # Errors
    /// Returns error if `id` was never established or the path is missing
    async fn bind(&self, path: &Path, id: ProjectId) -> Result<()>;

    /// Set or overwrite the byte limit of a project
    ///
    /// # Errors
    /// Returns error if the limit cannot be applied
    async fn set_limit(&self, id: ProjectId, spec: QuotaSpec) -> Result<()>;

    /// Clear the limit of a project; releasing an unlimited project succeeds
    ///
    /// # Errors
    /// Returns error if the limit cannot be cleared
    async fn release(&self, id: ProjectId) -> Result<()>;

    /// Current usage and limit of a project
    ///
    /// # Errors
    /// Returns error if the quota cannot be queried
    async fn usage(&self, id: ProjectId) -> Result<ProjectUsage>;
}

/// One recorded backend call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QuotaCall {
    /// `establish(path)` returned `id`
    Establish(PathBuf, ProjectId),
    /// `bind(path, id)`
    Bind(PathBuf, ProjectId),
    /// `set_limit(id, spec)`
    SetLimit(ProjectId, QuotaSpec),
    /// `release(id)`
    Release(ProjectId),
}

/// Mock backend for testing (doesn't touch the filesystem)
///
/// # Example
/// ```
/// use std::path::Path;
/// use snapquota_prjquota::{MockBackend, QuotaBackend};
/// use snapquota_core::{QuotaSize, QuotaSpec};
///
/// # tokio_test::block_on(async {
/// let backend = MockBackend::new();
///
/// let id = backend.establish(Path::new("/snapshots/1/fs")).await.unwrap();
/// backend.bind(Path::new("/snapshots/1/work"), id).await.unwrap();
/// backend.set_limit(id, QuotaSpec::new(QuotaSize::from_gb(1))).await.unwrap();
///
/// assert_eq!(backend.limit(id).await, Some(QuotaSize::from_gb(1)));
/// # });
/// ```
#[derive(Clone)]
pub struct MockBackend {
    state: Arc<Mutex<MockState>>,
}

#[derive(Default)]
struct MockState {
    next: Option<ProjectId>,
    supported: bool,
    paths: BTreeMap<PathBuf, ProjectId>,
    established: BTreeSet<ProjectId>,
    limits: BTreeMap<ProjectId, QuotaSize>,
    calls: Vec<QuotaCall>,
    failing: BTreeSet<&'static str>,
}

impl MockBackend {
    /// Create a new mock backend on a quota-enabled filesystem
    #[must_use]
    pub fn new() -> Self {
        Self::starting_at(ProjectId::from_raw(1))
    }

    /// Create a mock backend whose allocator hands out `first` next
    #[must_use]
    pub fn starting_at(first: ProjectId) -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState {
                next: Some(first),
                supported: true,
                ..MockState::default()
            })),
        }
    }

    /// Pretend the filesystem has no project quota support
    pub async fn set_supported(&self, supported: bool) {
        self.state.lock().await.supported = supported;
    }

    /// Make every future call of `operation` fail
    /// (`"establish"`, `"bind"`, `"set_limit"` or `"release"`)
    pub async fn fail_on(&self, operation: &'static str) {
        self.state.lock().await.failing.insert(operation);
    }

    /// Project a path is tagged with, if any
    pub async fn project_of(&self, path: &Path) -> Option<ProjectId> {
        self.state.lock().await.paths.get(path).copied()
    }

    /// Current limit of a project; `None` when unlimited
    pub async fn limit(&self, id: ProjectId) -> Option<QuotaSize> {
        self.state.lock().await.limits.get(&id).copied()
    }

    /// Every call made so far, in order
    pub async fn calls(&self) -> Vec<QuotaCall> {
        self.state.lock().await.calls.clone()
    }

    /// Get the number of backend calls made (for testing)
    pub async fn call_count(&self) -> usize {
        self.state.lock().await.calls.len()
    }
}

impl MockState {
    fn check(&self, operation: &'static str) -> Result<()> {
        if self.failing.contains(operation) {
            return Err(Error::quota(format!("mock {operation} failure")));
        }
        Ok(())
    }
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MockBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockBackend").finish_non_exhaustive()
    }
}

#[async_trait]
impl QuotaBackend for MockBackend {
    async fn precheck(&self, base_path: &Path) -> Result<bool> {
        let supported = self.state.lock().await.supported;
        tracing::debug!(path = %base_path.display(), supported, "Mock: Precheck");
        Ok(supported)
    }

    async fn establish(&self, path: &Path) -> Result<ProjectId> {
        let mut state = self.state.lock().await;
        state.check("establish")?;

        let id = state
            .next
            .ok_or_else(|| Error::quota("project ID space exhausted"))?;
        state.next = id.next();
        state.paths.insert(path.to_path_buf(), id);
        state.established.insert(id);
        state.calls.push(QuotaCall::Establish(path.to_path_buf(), id));

        tracing::debug!(path = %path.display(), project_id = %id, "Mock: Established project");

        Ok(id)
    }

    async fn bind(&self, path: &Path, id: ProjectId) -> Result<()> {
        let mut state = self.state.lock().await;
        state.check("bind")?;

        if !state.established.contains(&id) {
            return Err(Error::quota(format!("project {id} was never established")));
        }
        state.paths.insert(path.to_path_buf(), id);
        state.calls.push(QuotaCall::Bind(path.to_path_buf(), id));

        tracing::debug!(path = %path.display(), project_id = %id, "Mock: Bound path");

        Ok(())
    }

    async fn set_limit(&self, id: ProjectId, spec: QuotaSpec) -> Result<()> {
        let mut state = self.state.lock().await;
        state.check("set_limit")?;

        if spec.size.is_zero() {
            state.limits.remove(&id);
        } else {
            state.limits.insert(id, spec.size);
        }
        state.calls.push(QuotaCall::SetLimit(id, spec));

        tracing::debug!(project_id = %id, size = %spec.size, "Mock: Set limit");

        Ok(())
    }

    async fn release(&self, id: ProjectId) -> Result<()> {
        let mut state = self.state.lock().await;
        state.check("release")?;

        state.limits.remove(&id);
        state.calls.push(QuotaCall::Release(id));

        tracing::debug!(project_id = %id, "Mock: Released project");

        Ok(())
    }

    async fn usage(&self, id: ProjectId) -> Result<ProjectUsage> {
        let state = self.state.lock().await;
        Ok(ProjectUsage {
            used: QuotaSize::default(),
            limit: state.limits.get(&id).copied().unwrap_or_default(),
        })
    }
}
