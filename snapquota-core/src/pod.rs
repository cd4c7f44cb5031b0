//! Pod and container model shared by the host protocol and the orchestrator client

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;

use crate::{ContainerId, Quantity};

/// The pod sandbox a container belongs to, as reported by the host runtime
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PodSandbox {
    /// Sandbox ID
    pub id: String,
    /// Pod name
    pub name: String,
    /// Pod namespace
    pub namespace: String,
    /// Pod labels
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    /// Pod annotations
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
}

impl PodSandbox {
    /// `namespace/name` key used in logs
    #[must_use]
    pub fn namespaced_name(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }
}

/// A container as reported by the host runtime
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Container {
    /// Runtime container ID
    pub id: ContainerId,
    /// Container name within the pod spec
    pub name: String,
}

impl fmt::Display for Container {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.id)
    }
}

/// Resource limits and requests of one container in the pod spec
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerResources {
    /// Resource limits keyed by resource name
    #[serde(default)]
    pub limits: BTreeMap<String, Quantity>,
    /// Resource requests keyed by resource name
    #[serde(default)]
    pub requests: BTreeMap<String, Quantity>,
}

/// Resource specification of a pod as known to the orchestrator
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PodResources {
    /// Per-container resources keyed by container name
    #[serde(default)]
    pub containers: HashMap<String, ContainerResources>,
    /// Pod annotations
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
}
