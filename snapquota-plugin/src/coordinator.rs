//! Container lifecycle coordinator
//!
//! Drives the quota backend from host runtime callbacks:
//! - post-create tags the snapshot's `fs` and `work` directories with a new project
//! - post-start optionally adds the merged rootfs and applies the limit
//! - remove clears the limit and forgets the container

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn, Level};
use snapquota_core::config::{ContainerdConfig, QuotaConfig};
use snapquota_core::{
    Config, Container, ContainerId, Error, LabelSelector, LifecycleEvent, PodSandbox, ProjectId,
    QuotaSpec, Result,
};
use snapquota_prjquota::QuotaBackend;

use crate::kube::PodResourceSource;
use crate::layout::OverlayLayout;
use crate::runtime::{RuntimeClient, OVERLAY_SNAPSHOTTER};
use crate::sizing::Sizer;

/// Receiver of container lifecycle callbacks
#[async_trait]
pub trait LifecycleHandler: Send + Sync {
    /// A container was created
    async fn post_create_container(&self, pod: &PodSandbox, container: &Container) -> Result<()>;

    /// A container was started
    async fn post_start_container(&self, pod: &PodSandbox, container: &Container) -> Result<()>;

    /// A container was removed
    async fn remove_container(&self, pod: &PodSandbox, container: &Container) -> Result<()>;

    /// A new runtime client is available after a (re)connect
    async fn runtime_connected(&self, _client: Arc<dyn RuntimeClient>) {}

    /// Dispatch an event to the matching callback
    async fn handle(&self, event: &LifecycleEvent) -> Result<()> {
        event.emit_trace();
        match event {
            LifecycleEvent::PostCreateContainer { pod, container } => {
                self.post_create_container(pod, container).await
            }
            LifecycleEvent::PostStartContainer { pod, container } => {
                self.post_start_container(pod, container).await
            }
            LifecycleEvent::RemoveContainer { pod, container } => {
                self.remove_container(pod, container).await
            }
        }
    }
}

/// Whether a container's pod passed the label selector at creation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterDecision {
    /// Quota is managed for the container
    Managed,
    /// The pod did not match; the container is left alone
    Filtered,
}

/// Coordinates project quotas over the container lifecycle
pub struct QuotaCoordinator {
    quota: QuotaConfig,
    containerd: ContainerdConfig,
    selector: Option<LabelSelector>,
    backend: Arc<dyn QuotaBackend>,
    resources: Option<Arc<dyn PodResourceSource>>,
    runtime: RwLock<Option<Arc<dyn RuntimeClient>>>,
    projects: RwLock<HashMap<ContainerId, ProjectId>>,
    decisions: RwLock<HashMap<ContainerId, FilterDecision>>,
}

impl QuotaCoordinator {
    /// Create a coordinator from the daemon configuration
    ///
    /// `resources` is only consulted when sizing needs pod resources.
    #[must_use]
    pub fn new(
        config: &Config,
        backend: Arc<dyn QuotaBackend>,
        resources: Option<Arc<dyn PodResourceSource>>,
    ) -> Self {
        Self {
            quota: config.quota.clone(),
            containerd: config.containerd.clone(),
            selector: config.label_select.clone(),
            backend,
            resources,
            runtime: RwLock::new(None),
            projects: RwLock::new(HashMap::new()),
            decisions: RwLock::new(HashMap::new()),
        }
    }

    /// Use `client` for runtime lookups
    pub async fn set_runtime(&self, client: Arc<dyn RuntimeClient>) {
        *self.runtime.write().await = Some(client);
    }

    /// Project recorded for a container
    pub async fn project_of(&self, id: &ContainerId) -> Option<ProjectId> {
        self.projects.read().await.get(id).copied()
    }

    /// Filter decision recorded for a container
    pub async fn decision_of(&self, id: &ContainerId) -> Option<FilterDecision> {
        self.decisions.read().await.get(id).copied()
    }

    /// Number of containers with a recorded project
    pub async fn tracked(&self) -> usize {
        self.projects.read().await.len()
    }

    /// Decide whether the container is filtered out
    ///
    /// A decision recorded at creation is reused so later callbacks agree
    /// with it even if the pod's labels changed; without one the labels are
    /// evaluated now.
    async fn is_filtered(&self, pod: &PodSandbox, container: &Container) -> bool {
        let Some(selector) = &self.selector else {
            return false;
        };
        match self.decision_of(&container.id).await {
            Some(decision) => decision == FilterDecision::Filtered,
            None => !selector.matches(&pod.labels),
        }
    }

    async fn runtime(&self) -> Result<Arc<dyn RuntimeClient>> {
        self.runtime
            .read()
            .await
            .clone()
            .ok_or_else(|| Error::runtime("runtime client is not connected"))
    }

    async fn layout_of(&self, container: &Container) -> Result<Option<OverlayLayout>> {
        let runtime = self.runtime().await?;
        let namespace = &self.containerd.namespace;

        let info = runtime.container(namespace, &container.id).await?;
        if info.snapshotter != OVERLAY_SNAPSHOTTER {
            warn!(
                container = %container,
                snapshotter = %info.snapshotter,
                "Container does not use the overlayfs snapshotter"
            );
            return Ok(None);
        }

        let mounts = runtime
            .mounts(namespace, &info.snapshotter, &info.snapshot_key)
            .await?;
        let layout = OverlayLayout::from_mounts(&mounts);
        if layout.is_none() {
            warn!(container = %container, mounts = ?mounts, "No upperdir in snapshot mounts");
        }
        Ok(layout)
    }
}

impl std::fmt::Debug for QuotaCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QuotaCoordinator")
            .field("quota", &self.quota)
            .field("selector", &self.selector)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl LifecycleHandler for QuotaCoordinator {
    async fn post_create_container(&self, pod: &PodSandbox, container: &Container) -> Result<()> {
        if let Some(selector) = &self.selector {
            let decision = if selector.matches(&pod.labels) {
                FilterDecision::Managed
            } else {
                info!(
                    pod = %pod.namespaced_name(),
                    labels = ?pod.labels,
                    label_select = %selector,
                    "Pod does not match label selector"
                );
                FilterDecision::Filtered
            };
            self.decisions
                .write()
                .await
                .insert(container.id.clone(), decision);
            if decision == FilterDecision::Filtered {
                return Ok(());
            }
        }

        if let Some(id) = self.project_of(&container.id).await {
            debug!(container = %container, project_id = %id, "Container already has a project");
            return Ok(());
        }

        let Some(layout) = self.layout_of(container).await? else {
            return Ok(());
        };

        let id = self.backend.establish(&layout.fs_dir).await.inspect_err(|e| {
            warn!(container = %container, path = %layout.fs_dir.display(), error = %e, "Failed to establish project");
        })?;
        self.backend.bind(&layout.work_dir, id).await.inspect_err(|e| {
            warn!(container = %container, path = %layout.work_dir.display(), project_id = %id, error = %e, "Failed to bind project");
        })?;

        self.projects.write().await.insert(container.id.clone(), id);

        info!(
            container = %container,
            project_id = %id,
            snapshot = %layout.snapshot_dir.display(),
            "Assigned project to snapshot"
        );
        Ok(())
    }

    async fn post_start_container(&self, pod: &PodSandbox, container: &Container) -> Result<()> {
        if self.is_filtered(pod, container).await {
            debug!(container = %container, "Container filtered, skipping");
            return Ok(());
        }

        let size = Sizer::new(&self.quota, self.resources.as_deref())
            .effective_size(pod, container)
            .await;

        let Some(id) = self.project_of(&container.id).await else {
            warn!(container = %container, "No project recorded for container");
            return Ok(());
        };

        if !self.quota.skip_rootfs {
            let rootfs = self.containerd.rootfs_path(&container.id);
            self.backend.bind(&rootfs, id).await.inspect_err(|e| {
                warn!(container = %container, path = %rootfs.display(), project_id = %id, error = %e, "Failed to bind rootfs");
            })?;
        }

        self.backend
            .set_limit(id, QuotaSpec::new(size))
            .await
            .inspect_err(|e| {
                warn!(container = %container, project_id = %id, error = %e, "Failed to set limit");
            })?;

        info!(container = %container, project_id = %id, %size, "Applied quota");

        if tracing::enabled!(Level::DEBUG) {
            match self.backend.usage(id).await {
                Ok(usage) => debug!(
                    project_id = %id,
                    used = %usage.used,
                    limit = %usage.limit,
                    "Project usage"
                ),
                Err(e) => debug!(project_id = %id, error = %e, "Failed to read project usage"),
            }
        }
        Ok(())
    }

    async fn remove_container(&self, pod: &PodSandbox, container: &Container) -> Result<()> {
        if self.is_filtered(pod, container).await {
            self.decisions.write().await.remove(&container.id);
            debug!(container = %container, "Container filtered, skipping");
            return Ok(());
        }

        let Some(id) = self.project_of(&container.id).await else {
            self.decisions.write().await.remove(&container.id);
            debug!(container = %container, "No project recorded for container");
            return Ok(());
        };

        let released = self.backend.release(id).await;

        self.projects.write().await.remove(&container.id);
        self.decisions.write().await.remove(&container.id);

        match &released {
            Ok(()) => info!(container = %container, project_id = %id, "Released quota"),
            Err(e) => {
                warn!(container = %container, project_id = %id, error = %e, "Failed to release quota");
            }
        }
        released
    }

    async fn runtime_connected(&self, client: Arc<dyn RuntimeClient>) {
        self.set_runtime(client).await;
    }
}
