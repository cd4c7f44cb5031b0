//! Container runtime lookups: container metadata and snapshot mounts
//!
//! The production client talks to containerd's `Containers` and `Snapshots`
//! gRPC services over its Unix socket. Only the handful of message fields
//! needed here are declared; prost skips the rest on decode.

use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::UnixStream;
use tonic::codec::ProstCodec;
use tonic::codegen::http::uri::PathAndQuery;
use tonic::metadata::{Ascii, MetadataValue};
use tonic::transport::{Channel, Endpoint, Uri};
use tracing::debug;
use snapquota_core::{ContainerId, Error, Result};

/// Snapshotter whose layout the coordinator understands
pub const OVERLAY_SNAPSHOTTER: &str = "overlayfs";

/// gRPC metadata key selecting the containerd namespace
const NAMESPACE_HEADER: &str = "containerd-namespace";

const GET_CONTAINER: &str = "/containerd.services.containers.v1.Containers/Get";
const SNAPSHOT_MOUNTS: &str = "/containerd.services.snapshots.v1.Snapshots/Mounts";

/// Runtime metadata of a container
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ContainerInfo {
    /// Snapshotter managing the container's root filesystem
    pub snapshotter: String,
    /// Key of the container's active snapshot
    pub snapshot_key: String,
}

/// One mount of a snapshot
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SnapshotMount {
    /// Filesystem type, e.g. `overlay`
    pub kind: String,
    /// Mount source
    pub source: String,
    /// Mount options, e.g. `upperdir=...`
    pub options: Vec<String>,
}

/// Lookups against the container runtime
#[async_trait]
pub trait RuntimeClient: Send + Sync {
    /// Fetch a container's snapshotter and snapshot key
    async fn container(&self, namespace: &str, id: &ContainerId) -> Result<ContainerInfo>;

    /// Fetch the mounts of a snapshot
    async fn mounts(
        &self,
        namespace: &str,
        snapshotter: &str,
        key: &str,
    ) -> Result<Vec<SnapshotMount>>;
}

/// Creates runtime clients; called on every session (re)connect
#[async_trait]
pub trait RuntimeConnector: Send + Sync {
    /// Open a new client
    async fn connect(&self) -> Result<Arc<dyn RuntimeClient>>;
}

#[derive(Clone, PartialEq, prost::Message)]
struct GetContainerRequest {
    #[prost(string, tag = "1")]
    id: String,
}

#[derive(Clone, PartialEq, prost::Message)]
struct GetContainerResponse {
    #[prost(message, optional, tag = "1")]
    container: Option<ContainerRecord>,
}

#[derive(Clone, PartialEq, prost::Message)]
struct ContainerRecord {
    #[prost(string, tag = "1")]
    id: String,
    #[prost(string, tag = "3")]
    image: String,
    #[prost(string, tag = "6")]
    snapshotter: String,
    #[prost(string, tag = "7")]
    snapshot_key: String,
}

#[derive(Clone, PartialEq, prost::Message)]
struct MountsRequest {
    #[prost(string, tag = "1")]
    snapshotter: String,
    #[prost(string, tag = "2")]
    key: String,
}

#[derive(Clone, PartialEq, prost::Message)]
struct MountsResponse {
    #[prost(message, repeated, tag = "1")]
    mounts: Vec<MountRecord>,
}

#[derive(Clone, PartialEq, prost::Message)]
struct MountRecord {
    #[prost(string, tag = "1")]
    r#type: String,
    #[prost(string, tag = "2")]
    source: String,
    #[prost(string, tag = "3")]
    target: String,
    #[prost(string, repeated, tag = "4")]
    options: Vec<String>,
}

impl From<MountRecord> for SnapshotMount {
    fn from(m: MountRecord) -> Self {
        Self {
            kind: m.r#type,
            source: m.source,
            options: m.options,
        }
    }
}

/// containerd client over its gRPC Unix socket
#[derive(Debug, Clone)]
pub struct ContainerdClient {
    channel: Channel,
}

impl ContainerdClient {
    /// Connect to the containerd socket at `socket`
    ///
    /// # Errors
    /// Returns [`Error::RuntimeLookup`] if the socket cannot be reached
    pub async fn connect(socket: impl Into<PathBuf>) -> Result<Self> {
        let socket = socket.into();
        debug!(socket = %socket.display(), "Connecting to containerd");

        // the authority is ignored; every connection goes to the socket
        let endpoint = Endpoint::try_from("http://[::]:50051")
            .map_err(|e| Error::runtime(format!("invalid endpoint: {e}")))?;

        let path = socket.clone();
        let channel = endpoint
            .connect_with_connector(tower::service_fn(move |_: Uri| {
                let path = path.clone();
                async move {
                    let stream = UnixStream::connect(path).await?;
                    Ok::<_, std::io::Error>(hyper_util::rt::TokioIo::new(stream))
                }
            }))
            .await
            .map_err(|e| {
                Error::runtime(format!(
                    "failed to connect to containerd at {}: {e}",
                    socket.display()
                ))
            })?;

        Ok(Self { channel })
    }

    async fn unary<Req, Resp>(&self, namespace: &str, path: &'static str, message: Req) -> Result<Resp>
    where
        Req: prost::Message + Send + Sync + 'static,
        Resp: prost::Message + Default + Send + Sync + 'static,
    {
        let namespace: MetadataValue<Ascii> = namespace
            .parse()
            .map_err(|e| Error::runtime(format!("invalid namespace {namespace:?}: {e}")))?;

        let mut request = tonic::Request::new(message);
        request.metadata_mut().insert(NAMESPACE_HEADER, namespace);

        let mut grpc = tonic::client::Grpc::new(self.channel.clone());
        grpc.ready()
            .await
            .map_err(|e| Error::runtime(format!("containerd not ready: {e}")))?;

        let codec: ProstCodec<Req, Resp> = ProstCodec::default();
        let response = grpc
            .unary(request, PathAndQuery::from_static(path), codec)
            .await
            .map_err(|status| Error::runtime(format!("{path}: {}", status.message())))?;

        Ok(response.into_inner())
    }
}

#[async_trait]
impl RuntimeClient for ContainerdClient {
    async fn container(&self, namespace: &str, id: &ContainerId) -> Result<ContainerInfo> {
        let response: GetContainerResponse = self
            .unary(
                namespace,
                GET_CONTAINER,
                GetContainerRequest {
                    id: id.as_str().to_string(),
                },
            )
            .await?;

        let record = response
            .container
            .ok_or_else(|| Error::runtime(format!("container {id} not found")))?;

        debug!(
            container_id = %record.id,
            image = %record.image,
            snapshotter = %record.snapshotter,
            snapshot_key = %record.snapshot_key,
            "Fetched container"
        );

        Ok(ContainerInfo {
            snapshotter: record.snapshotter,
            snapshot_key: record.snapshot_key,
        })
    }

    async fn mounts(
        &self,
        namespace: &str,
        snapshotter: &str,
        key: &str,
    ) -> Result<Vec<SnapshotMount>> {
        let response: MountsResponse = self
            .unary(
                namespace,
                SNAPSHOT_MOUNTS,
                MountsRequest {
                    snapshotter: snapshotter.to_string(),
                    key: key.to_string(),
                },
            )
            .await?;

        Ok(response.mounts.into_iter().map(SnapshotMount::from).collect())
    }
}

/// Opens [`ContainerdClient`]s against a fixed socket
#[derive(Debug, Clone)]
pub struct ContainerdConnector {
    socket: PathBuf,
}

impl ContainerdConnector {
    /// Connector for the containerd socket at `socket`
    pub fn new(socket: impl Into<PathBuf>) -> Self {
        Self {
            socket: socket.into(),
        }
    }
}

#[async_trait]
impl RuntimeConnector for ContainerdConnector {
    async fn connect(&self) -> Result<Arc<dyn RuntimeClient>> {
        let client = ContainerdClient::connect(&self.socket).await?;
        Ok(Arc::new(client))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prost::Message;

    #[test]
    fn test_mount_record_decodes_overlay_options() {
        let record = MountRecord {
            r#type: "overlay".to_string(),
            source: "overlay".to_string(),
            target: String::new(),
            options: vec![
                "index=off".to_string(),
                "workdir=/snapshots/12/work".to_string(),
                "upperdir=/snapshots/12/fs".to_string(),
            ],
        };
        let bytes = MountsResponse {
            mounts: vec![record],
        }
        .encode_to_vec();

        let decoded = MountsResponse::decode(bytes.as_slice()).unwrap();
        let mount = SnapshotMount::from(decoded.mounts[0].clone());
        assert_eq!(mount.kind, "overlay");
        assert_eq!(mount.options[2], "upperdir=/snapshots/12/fs");
    }

    #[test]
    fn test_container_record_ignores_unknown_fields() {
        #[derive(Clone, PartialEq, prost::Message)]
        struct FullContainer {
            #[prost(string, tag = "1")]
            id: String,
            #[prost(map = "string, string", tag = "2")]
            labels: std::collections::HashMap<String, String>,
            #[prost(string, tag = "6")]
            snapshotter: String,
            #[prost(string, tag = "7")]
            snapshot_key: String,
        }

        let full = FullContainer {
            id: "abc".to_string(),
            labels: [("io.kubernetes.pod.name".to_string(), "web".to_string())].into(),
            snapshotter: OVERLAY_SNAPSHOTTER.to_string(),
            snapshot_key: "abc".to_string(),
        };
        let record = ContainerRecord::decode(full.encode_to_vec().as_slice()).unwrap();
        assert_eq!(record.snapshotter, OVERLAY_SNAPSHOTTER);
        assert_eq!(record.snapshot_key, "abc");
    }

    #[tokio::test]
    async fn test_connect_to_missing_socket_fails() {
        let dir = tempfile::tempdir().unwrap();
        let err = ContainerdClient::connect(dir.path().join("containerd.sock"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::RuntimeLookup { .. }));
    }
}
