#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::Mutex;

use snapquota_core::*;
use snapquota_plugin::*;

pub const SNAPSHOTS: &str = "/var/lib/containerd/io.containerd.snapshotter.v1.overlayfs/snapshots";

/// Runtime with a fixed set of containers, each on its own overlay snapshot
#[derive(Default)]
pub struct MockRuntime {
    containers: HashMap<String, ContainerInfo>,
    mounts: HashMap<String, Vec<SnapshotMount>>,
}

impl MockRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an overlayfs container whose snapshot lives in `SNAPSHOTS/<n>`
    pub fn with_overlay(mut self, id: &str, n: u32) -> Self {
        let key = format!("k8s.io/{n}/{id}");
        self.containers.insert(
            id.to_string(),
            ContainerInfo {
                snapshotter: "overlayfs".to_string(),
                snapshot_key: key.clone(),
            },
        );
        self.mounts.insert(
            key,
            vec![SnapshotMount {
                kind: "overlay".to_string(),
                source: "overlay".to_string(),
                options: vec![
                    "index=off".to_string(),
                    format!("workdir={SNAPSHOTS}/{n}/work"),
                    format!("upperdir={SNAPSHOTS}/{n}/fs"),
                    "lowerdir=/l1:/l2".to_string(),
                ],
            }],
        );
        self
    }

    /// Add a container on another snapshotter
    pub fn with_snapshotter(mut self, id: &str, snapshotter: &str) -> Self {
        self.containers.insert(
            id.to_string(),
            ContainerInfo {
                snapshotter: snapshotter.to_string(),
                snapshot_key: id.to_string(),
            },
        );
        self
    }
}

#[async_trait]
impl RuntimeClient for MockRuntime {
    async fn container(&self, _namespace: &str, id: &ContainerId) -> Result<ContainerInfo> {
        self.containers
            .get(id.as_str())
            .cloned()
            .ok_or_else(|| Error::runtime(format!("container {id} not found")))
    }

    async fn mounts(
        &self,
        _namespace: &str,
        _snapshotter: &str,
        key: &str,
    ) -> Result<Vec<SnapshotMount>> {
        Ok(self.mounts.get(key).cloned().unwrap_or_default())
    }
}

/// Orchestrator API returning canned pods
#[derive(Default)]
pub struct MockResources {
    pods: HashMap<String, PodResources>,
    pub lookups: AtomicUsize,
}

impl MockResources {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_pod(mut self, namespace: &str, name: &str, resources: PodResources) -> Self {
        self.pods.insert(format!("{namespace}/{name}"), resources);
        self
    }
}

#[async_trait]
impl PodResourceSource for MockResources {
    async fn pod_resources(&self, namespace: &str, name: &str) -> Result<PodResources> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        self.pods
            .get(&format!("{namespace}/{name}"))
            .cloned()
            .ok_or_else(|| Error::resource(format!("pod {namespace}/{name} not found")))
    }
}

/// Records every event it is handed
#[derive(Default)]
pub struct RecordingHandler {
    pub events: Mutex<Vec<LifecycleEvent>>,
    pub connects: AtomicUsize,
    pub fail_removals: bool,
}

#[async_trait]
impl LifecycleHandler for RecordingHandler {
    async fn post_create_container(&self, pod: &PodSandbox, container: &Container) -> Result<()> {
        self.events.lock().await.push(LifecycleEvent::PostCreateContainer {
            pod: pod.clone(),
            container: container.clone(),
        });
        Ok(())
    }

    async fn post_start_container(&self, pod: &PodSandbox, container: &Container) -> Result<()> {
        self.events.lock().await.push(LifecycleEvent::PostStartContainer {
            pod: pod.clone(),
            container: container.clone(),
        });
        Ok(())
    }

    async fn remove_container(&self, pod: &PodSandbox, container: &Container) -> Result<()> {
        self.events.lock().await.push(LifecycleEvent::RemoveContainer {
            pod: pod.clone(),
            container: container.clone(),
        });
        if self.fail_removals {
            return Err(Error::quota("release failed"));
        }
        Ok(())
    }

    async fn runtime_connected(&self, _client: Arc<dyn RuntimeClient>) {
        self.connects.fetch_add(1, Ordering::SeqCst);
    }
}

/// Connector handing out the same mock runtime every time
pub struct StaticRuntime(pub Arc<MockRuntime>);

#[async_trait]
impl RuntimeConnector for StaticRuntime {
    async fn connect(&self) -> Result<Arc<dyn RuntimeClient>> {
        Ok(Arc::clone(&self.0) as Arc<dyn RuntimeClient>)
    }
}

pub fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

pub fn pod(name: &str, pairs: &[(&str, &str)]) -> PodSandbox {
    PodSandbox {
        id: format!("sandbox-{name}"),
        name: name.to_string(),
        namespace: "default".to_string(),
        labels: labels(pairs),
        annotations: BTreeMap::new(),
    }
}

pub fn container(id: &str, name: &str) -> Container {
    Container {
        id: ContainerId::new(id).unwrap(),
        name: name.to_string(),
    }
}

pub fn ephemeral(limit: &str) -> PodResources {
    let app = ContainerResources {
        limits: [("ephemeral-storage".to_string(), limit.parse().unwrap())].into(),
        requests: BTreeMap::new(),
    };
    PodResources {
        containers: [("app".to_string(), app)].into(),
        annotations: BTreeMap::new(),
    }
}
