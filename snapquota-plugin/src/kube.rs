//! Kubernetes API access for pod resource specifications

use async_trait::async_trait;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::debug;
use snapquota_core::{ContainerResources, Error, PodResources, Result};

/// Service-account token mounted into every pod
pub const SERVICE_ACCOUNT_TOKEN: &str = "/var/run/secrets/kubernetes.io/serviceaccount/token";

/// Cluster CA bundle mounted into every pod
pub const SERVICE_ACCOUNT_CA: &str = "/var/run/secrets/kubernetes.io/serviceaccount/ca.crt";

/// Source of pod resource specifications
#[async_trait]
pub trait PodResourceSource: Send + Sync {
    /// Fetch the resources of the pod `namespace/name`
    ///
    /// # Errors
    /// Returns [`Error::ResourceLookup`] if the pod cannot be fetched or parsed
    async fn pod_resources(&self, namespace: &str, name: &str) -> Result<PodResources>;
}

/// The subset of a `v1.Pod` object this crate reads
#[derive(Debug, Default, Deserialize)]
struct PodObject {
    #[serde(default)]
    metadata: ObjectMeta,
    #[serde(default)]
    spec: PodSpec,
}

#[derive(Debug, Default, Deserialize)]
struct ObjectMeta {
    #[serde(default)]
    annotations: BTreeMap<String, String>,
}

#[derive(Debug, Default, Deserialize)]
struct PodSpec {
    #[serde(default)]
    containers: Vec<ContainerSpec>,
}

#[derive(Debug, Deserialize)]
struct ContainerSpec {
    name: String,
    #[serde(default)]
    resources: ContainerResources,
}

impl From<PodObject> for PodResources {
    fn from(pod: PodObject) -> Self {
        Self {
            containers: pod
                .spec
                .containers
                .into_iter()
                .map(|c| (c.name, c.resources))
                .collect(),
            annotations: pod.metadata.annotations,
        }
    }
}

/// Minimal Kubernetes API client reading pods with a bearer token
#[derive(Debug, Clone)]
pub struct KubeClient {
    http: reqwest::Client,
    apiserver: String,
    token_file: Option<PathBuf>,
}

impl KubeClient {
    /// Client for an explicit API server
    ///
    /// The token file is re-read on every request so rotated
    /// service-account tokens are picked up.
    ///
    /// # Errors
    /// Returns [`Error::InvalidConfig`] if the CA bundle is unreadable or the
    /// HTTP client cannot be built
    pub fn new(
        apiserver: impl Into<String>,
        token_file: Option<PathBuf>,
        ca_file: Option<&Path>,
    ) -> Result<Self> {
        let mut builder = reqwest::Client::builder();
        if let Some(ca) = ca_file {
            let pem = std::fs::read(ca)
                .map_err(|e| Error::config(format!("failed to read CA {}: {e}", ca.display())))?;
            let cert = reqwest::Certificate::from_pem(&pem)
                .map_err(|e| Error::config(format!("invalid CA {}: {e}", ca.display())))?;
            builder = builder.add_root_certificate(cert);
        }
        let http = builder
            .build()
            .map_err(|e| Error::config(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            http,
            apiserver: apiserver.into().trim_end_matches('/').to_string(),
            token_file,
        })
    }

    /// Client configured from the pod environment, with optional overrides
    ///
    /// Without an explicit `apiserver`, `KUBERNETES_SERVICE_HOST` and
    /// `KUBERNETES_SERVICE_PORT` must be set.
    ///
    /// # Errors
    /// Returns [`Error::InvalidConfig`] outside a cluster without overrides
    pub fn in_cluster(apiserver: Option<&str>, token_file: Option<&Path>) -> Result<Self> {
        let apiserver = match apiserver {
            Some(url) => url.to_string(),
            None => {
                let host = std::env::var("KUBERNETES_SERVICE_HOST").map_err(|_| {
                    Error::config("KUBERNETES_SERVICE_HOST is not set and no API server was given")
                })?;
                let port =
                    std::env::var("KUBERNETES_SERVICE_PORT").unwrap_or_else(|_| "443".to_string());
                if host.contains(':') {
                    format!("https://[{host}]:{port}")
                } else {
                    format!("https://{host}:{port}")
                }
            }
        };

        let token_file = token_file
            .map(Path::to_path_buf)
            .or_else(|| Some(PathBuf::from(SERVICE_ACCOUNT_TOKEN)).filter(|p| p.exists()));
        let ca = Path::new(SERVICE_ACCOUNT_CA);

        Self::new(apiserver, token_file, ca.exists().then_some(ca))
    }

    /// API server base URL
    #[must_use]
    pub fn apiserver(&self) -> &str {
        &self.apiserver
    }

    async fn token(&self) -> Result<Option<String>> {
        let Some(path) = &self.token_file else {
            return Ok(None);
        };
        let token = tokio::fs::read_to_string(path).await.map_err(|e| {
            Error::resource(format!("failed to read token {}: {e}", path.display()))
        })?;
        Ok(Some(token.trim().to_string()))
    }
}

#[async_trait]
impl PodResourceSource for KubeClient {
    async fn pod_resources(&self, namespace: &str, name: &str) -> Result<PodResources> {
        let url = format!("{}/api/v1/namespaces/{namespace}/pods/{name}", self.apiserver);
        debug!(%url, "Fetching pod");

        let mut request = self.http.get(&url);
        if let Some(token) = self.token().await? {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| Error::resource(format!("get pod {namespace}/{name}: {e}")))?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(Error::resource(format!("pod {namespace}/{name} not found")));
        }
        if !status.is_success() {
            return Err(Error::resource(format!(
                "get pod {namespace}/{name}: API server returned {status}"
            )));
        }

        let pod: PodObject = response
            .json()
            .await
            .map_err(|e| Error::resource(format!("malformed pod {namespace}/{name}: {e}")))?;

        Ok(pod.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pod_object_into_resources() {
        let json = r#"{
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": {
                "name": "web",
                "namespace": "default",
                "annotations": {"example.com/disk": "3Gi"}
            },
            "spec": {
                "containers": [
                    {
                        "name": "app",
                        "image": "nginx",
                        "resources": {
                            "limits": {"ephemeral-storage": "2Gi", "cpu": "500m"},
                            "requests": {"ephemeral-storage": "1Gi"}
                        }
                    },
                    {"name": "sidecar", "image": "busybox"}
                ]
            }
        }"#;

        let pod: PodObject = serde_json::from_str(json).unwrap();
        let resources = PodResources::from(pod);

        assert_eq!(resources.containers.len(), 2);
        assert_eq!(
            resources.containers["app"].limits["ephemeral-storage"].value(),
            2_147_483_648
        );
        assert!(resources.containers["sidecar"].limits.is_empty());
        assert_eq!(resources.annotations["example.com/disk"], "3Gi");
    }

    #[test]
    fn test_new_trims_trailing_slash() {
        let client = KubeClient::new("https://10.0.0.1:443/", None, None).unwrap();
        assert_eq!(client.apiserver(), "https://10.0.0.1:443");
    }

    #[test]
    fn test_explicit_apiserver_and_token() {
        let dir = tempfile::tempdir().unwrap();
        let token = dir.path().join("token");
        std::fs::write(&token, "abc\n").unwrap();

        let client = KubeClient::in_cluster(Some("http://127.0.0.1:8080"), Some(&token)).unwrap();
        assert_eq!(client.apiserver(), "http://127.0.0.1:8080");
        assert_eq!(client.token_file.as_deref(), Some(token.as_path()));
    }
}
