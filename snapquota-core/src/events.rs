//! Container lifecycle events with structured tracing

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::{Container, ContainerId, PodSandbox};

/// Lifecycle notifications delivered by the host runtime
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LifecycleEvent {
    /// Container was created but not started
    PostCreateContainer {
        /// Owning pod
        pod: PodSandbox,
        /// The container
        container: Container,
    },

    /// Container process was started
    PostStartContainer {
        /// Owning pod
        pod: PodSandbox,
        /// The container
        container: Container,
    },

    /// Container was removed
    RemoveContainer {
        /// Owning pod
        pod: PodSandbox,
        /// The container
        container: Container,
    },
}

impl LifecycleEvent {
    /// Wire names of every event kind, in subscription order
    pub const ALL: [&'static str; 3] = [
        "post_create_container",
        "post_start_container",
        "remove_container",
    ];

    /// Get the pod and container from any event
    #[must_use]
    pub const fn parts(&self) -> (&PodSandbox, &Container) {
        match self {
            Self::PostCreateContainer { pod, container }
            | Self::PostStartContainer { pod, container }
            | Self::RemoveContainer { pod, container } => (pod, container),
        }
    }

    /// Get the container ID from any event
    #[must_use]
    pub const fn container_id(&self) -> &ContainerId {
        &self.parts().1.id
    }

    /// Wire name of the event kind
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::PostCreateContainer { .. } => Self::ALL[0],
            Self::PostStartContainer { .. } => Self::ALL[1],
            Self::RemoveContainer { .. } => Self::ALL[2],
        }
    }

    /// Emit structured tracing event
    pub fn emit_trace(&self) {
        let (pod, container) = self.parts();
        tracing::info!(
            pod_id = %pod.id,
            pod = %pod.namespaced_name(),
            container_id = %container.id,
            container_name = %container.name,
            event = self.kind(),
            "Lifecycle event"
        );
    }
}

impl fmt::Display for LifecycleEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (pod, container) = self.parts();
        match self {
            Self::PostCreateContainer { .. } => {
                write!(f, "Container {} of pod {} created", container, pod.namespaced_name())
            }
            Self::PostStartContainer { .. } => {
                write!(f, "Container {} of pod {} started", container, pod.namespaced_name())
            }
            Self::RemoveContainer { .. } => {
                write!(f, "Container {} of pod {} removed", container, pod.namespaced_name())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> (PodSandbox, Container) {
        let pod = PodSandbox {
            id: "sb".to_string(),
            name: "nginx".to_string(),
            namespace: "default".to_string(),
            ..Default::default()
        };
        let container = Container {
            id: ContainerId::new("c1").unwrap(),
            name: "app".to_string(),
        };
        (pod, container)
    }

    #[test]
    fn test_event_container_id() {
        let (pod, container) = sample();
        let event = LifecycleEvent::RemoveContainer { pod, container };
        assert_eq!(event.container_id().as_str(), "c1");
        assert_eq!(event.kind(), "remove_container");
    }

    #[test]
    fn test_event_serde() {
        let (pod, container) = sample();
        let event = LifecycleEvent::PostStartContainer { pod, container };

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "post_start_container");
        assert_eq!(json["container"]["id"], "c1");

        let back: LifecycleEvent = serde_json::from_value(json).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn test_event_display() {
        let (pod, container) = sample();
        let event = LifecycleEvent::PostCreateContainer { pod, container };
        assert_eq!(event.to_string(), "Container app (c1) of pod default/nginx created");
    }
}
