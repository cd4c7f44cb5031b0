//! Effective quota size resolution
//!
//! A container's limit comes from, in order of precedence: a configured
//! custom resource, its `ephemeral-storage` resource minus a fixed
//! reservation, or the configured default. Lookup failures fall through to
//! the next level.

use tracing::{debug, warn};
use snapquota_core::config::QuotaConfig;
use snapquota_core::{
    Container, Error, PodResources, PodSandbox, Quantity, QuotaSize, Result,
    EPHEMERAL_STORAGE_RESERVATION,
};

use crate::kube::PodResourceSource;

/// Kubernetes resource name of container scratch space
pub const EPHEMERAL_STORAGE: &str = "ephemeral-storage";

/// Resolve a resource for one container
///
/// Checked in order: the container's limits, its requests, the sandbox
/// annotations, then the pod annotations known to the API server.
///
/// # Errors
/// Returns [`Error::ResourceLookup`] if the resource is absent or an
/// annotation is not a valid quantity
pub fn resolve_resource(
    pod_resources: &PodResources,
    sandbox: &PodSandbox,
    container_name: &str,
    resource: &str,
) -> Result<Quantity> {
    if let Some(spec) = pod_resources.containers.get(container_name) {
        if let Some(quantity) = spec.limits.get(resource).or_else(|| spec.requests.get(resource)) {
            return Ok(*quantity);
        }
    }

    let annotation = sandbox
        .annotations
        .get(resource)
        .or_else(|| pod_resources.annotations.get(resource))
        .ok_or_else(|| Error::resource(format!("resource {resource} not found")))?;

    annotation.parse().map_err(|e| {
        Error::resource(format!("annotation {resource}={annotation:?} is not a quantity: {e}"))
    })
}

/// Computes the limit to apply to a starting container
pub struct Sizer<'a> {
    config: &'a QuotaConfig,
    source: Option<&'a dyn PodResourceSource>,
}

impl<'a> Sizer<'a> {
    /// Sizer over a policy and an optional orchestrator API
    #[must_use]
    pub fn new(config: &'a QuotaConfig, source: Option<&'a dyn PodResourceSource>) -> Self {
        Self { config, source }
    }

    /// Effective size for `container` of `pod`; never fails
    pub async fn effective_size(&self, pod: &PodSandbox, container: &Container) -> QuotaSize {
        let needs_lookup =
            self.config.customer_resource.is_some() || self.config.use_ephemeral_storage;
        if !needs_lookup {
            return self.config.default_size;
        }

        let resources = self.fetch(pod).await;

        if let Some(resource) = &self.config.customer_resource {
            match lookup(resources.as_ref(), pod, container, resource) {
                Ok(size) => {
                    debug!(container = %container, %resource, %size, "Sized by custom resource");
                    return size;
                }
                Err(e) => warn!(
                    container = %container,
                    %resource,
                    error = %e,
                    "Custom resource unavailable, falling back"
                ),
            }
        }

        if self.config.use_ephemeral_storage {
            let reserved = lookup(resources.as_ref(), pod, container, EPHEMERAL_STORAGE)
                .and_then(|size| {
                    size.checked_sub(EPHEMERAL_STORAGE_RESERVATION)
                        .filter(|s| !s.is_zero())
                        .ok_or_else(|| {
                            Error::resource(format!(
                                "{EPHEMERAL_STORAGE} of {size} leaves nothing after the reservation"
                            ))
                        })
                });
            match reserved {
                Ok(size) => {
                    debug!(container = %container, %size, "Sized by ephemeral storage");
                    return size;
                }
                Err(e) => warn!(
                    container = %container,
                    error = %e,
                    default = %self.config.default_size,
                    "Ephemeral storage unavailable, using default quota size"
                ),
            }
        }

        self.config.default_size
    }

    async fn fetch(&self, pod: &PodSandbox) -> Result<PodResources> {
        let source = self
            .source
            .ok_or_else(|| Error::resource("no orchestrator API configured"))?;
        source.pod_resources(&pod.namespace, &pod.name).await
    }
}

fn lookup(
    resources: std::result::Result<&PodResources, &Error>,
    pod: &PodSandbox,
    container: &Container,
    resource: &str,
) -> Result<QuotaSize> {
    let resources = resources.map_err(|e| Error::resource(e.to_string()))?;
    let size = QuotaSize::from(resolve_resource(resources, pod, &container.name, resource)?);
    if size.is_zero() {
        return Err(Error::resource(format!("resource {resource} is zero")));
    }
    Ok(size)
}

#[cfg(test)]
mod tests {
    use super::*;
    use snapquota_core::{ContainerId, ContainerResources};
    use std::collections::BTreeMap;

    fn quantity(s: &str) -> Quantity {
        s.parse().unwrap()
    }

    fn resources() -> PodResources {
        let app = ContainerResources {
            limits: [(EPHEMERAL_STORAGE.to_string(), quantity("2Gi"))].into(),
            requests: [
                (EPHEMERAL_STORAGE.to_string(), quantity("1Gi")),
                ("example.com/disk".to_string(), quantity("5Gi")),
            ]
            .into(),
        };
        PodResources {
            containers: [("app".to_string(), app)].into(),
            annotations: [("example.com/scratch".to_string(), "300Mi".to_string())].into(),
        }
    }

    #[test]
    fn test_limits_before_requests() {
        let pod = PodSandbox::default();
        let q = resolve_resource(&resources(), &pod, "app", EPHEMERAL_STORAGE).unwrap();
        assert_eq!(q.value(), 2 * 1024 * 1024 * 1024);

        let q = resolve_resource(&resources(), &pod, "app", "example.com/disk").unwrap();
        assert_eq!(q.value(), 5 * 1024 * 1024 * 1024);
    }

    #[test]
    fn test_sandbox_annotation_before_api_annotation() {
        let pod = PodSandbox {
            annotations: BTreeMap::from([("example.com/scratch".to_string(), "100Mi".to_string())]),
            ..PodSandbox::default()
        };
        let q = resolve_resource(&resources(), &pod, "app", "example.com/scratch").unwrap();
        assert_eq!(q.value(), 100 * 1024 * 1024);

        let q = resolve_resource(&resources(), &PodSandbox::default(), "other", "example.com/scratch")
            .unwrap();
        assert_eq!(q.value(), 300 * 1024 * 1024);
    }

    #[test]
    fn test_missing_and_malformed() {
        let pod = PodSandbox {
            annotations: BTreeMap::from([("bad".to_string(), "lots".to_string())]),
            ..PodSandbox::default()
        };
        let err = resolve_resource(&resources(), &pod, "app", "absent").unwrap_err();
        assert!(err.to_string().contains("not found"));
        assert!(matches!(
            resolve_resource(&resources(), &pod, "app", "bad"),
            Err(Error::ResourceLookup { .. })
        ));
    }

    #[tokio::test]
    async fn test_default_without_lookup() {
        let config = QuotaConfig::default();
        let container = Container {
            id: ContainerId::new("c1").unwrap(),
            name: "app".to_string(),
        };
        let size = Sizer::new(&config, None)
            .effective_size(&PodSandbox::default(), &container)
            .await;
        assert_eq!(size.as_bytes(), 1_073_741_824);
    }

    #[tokio::test]
    async fn test_no_source_falls_back_to_default() {
        let config = QuotaConfig {
            use_ephemeral_storage: true,
            customer_resource: Some("example.com/disk".to_string()),
            ..QuotaConfig::default()
        };
        let container = Container {
            id: ContainerId::new("c1").unwrap(),
            name: "app".to_string(),
        };
        let size = Sizer::new(&config, None)
            .effective_size(&PodSandbox::default(), &container)
            .await;
        assert_eq!(size, config.default_size);
    }
}
