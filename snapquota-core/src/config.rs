//! Daemon configuration
//!
//! Built once at startup from command-line flags and passed by reference
//! into every component constructor.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::{ContainerId, Error, QuotaSize, Result};

/// Default plugin name registered with the host runtime
pub const DEFAULT_PLUGIN_NAME: &str = "quota-injector";
/// Default plugin index registered with the host runtime
pub const DEFAULT_PLUGIN_INDEX: &str = "99";
/// Default quota for a container: 1 GiB
pub const DEFAULT_QUOTA_SIZE: u64 = 1024 * 1024 * 1024;
/// Default containerd state directory
pub const DEFAULT_CONTAINERD_STATE_DIR: &str = "/run/containerd";
/// Default containerd root directory
pub const DEFAULT_CONTAINERD_ROOT_DIR: &str = "/var/lib/containerd";
/// Default mount point backing the containerd directories
pub const DEFAULT_CONTAINERD_BASE_PATH: &str = "/";
/// Default containerd socket
pub const DEFAULT_CONTAINERD_SOCKET: &str = "/run/containerd/containerd.sock";
/// Default containerd namespace
pub const DEFAULT_CONTAINERD_NAMESPACE: &str = "k8s.io";
/// Default host plugin socket
pub const DEFAULT_HOST_SOCKET: &str = "/run/snapquota/host.sock";
/// Default liveness probe port
pub const DEFAULT_PROBE_PORT: u16 = 8089;
/// Default delay between plugin session restarts
pub const DEFAULT_RESTART_DELAY: Duration = Duration::from_secs(3);

/// Registration identity with the host runtime
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginConfig {
    /// Plugin name
    pub name: String,
    /// Two-digit plugin index, orders plugins on the host
    pub index: String,
}

impl Default for PluginConfig {
    fn default() -> Self {
        Self {
            name: DEFAULT_PLUGIN_NAME.to_string(),
            index: DEFAULT_PLUGIN_INDEX.to_string(),
        }
    }
}

/// Quota sizing policy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaConfig {
    /// Limit applied when nothing more specific resolves
    pub default_size: QuotaSize,
    /// Size quotas from the container's ephemeral-storage limit/request
    pub use_ephemeral_storage: bool,
    /// Resource name that overrides every other sizing source
    pub customer_resource: Option<String>,
    /// Leave the merged rootfs directory out of the quota project
    pub skip_rootfs: bool,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            default_size: QuotaSize::from_bytes(DEFAULT_QUOTA_SIZE),
            use_ephemeral_storage: false,
            customer_resource: None,
            skip_rootfs: true,
        }
    }
}

/// Where containerd keeps its state and how to reach it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerdConfig {
    /// State directory, e.g. `/run/containerd`
    pub state_dir: PathBuf,
    /// Root directory, e.g. `/var/lib/containerd`
    pub root_dir: PathBuf,
    /// Mount point of the filesystem holding the root directory
    pub base_path: PathBuf,
    /// gRPC socket
    pub socket: PathBuf,
    /// containerd namespace the orchestrator uses
    pub namespace: String,
}

impl Default for ContainerdConfig {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from(DEFAULT_CONTAINERD_STATE_DIR),
            root_dir: PathBuf::from(DEFAULT_CONTAINERD_ROOT_DIR),
            base_path: PathBuf::from(DEFAULT_CONTAINERD_BASE_PATH),
            socket: PathBuf::from(DEFAULT_CONTAINERD_SOCKET),
            namespace: DEFAULT_CONTAINERD_NAMESPACE.to_string(),
        }
    }
}

impl ContainerdConfig {
    /// Merged rootfs of a running container's task
    #[must_use]
    pub fn rootfs_path(&self, id: &ContainerId) -> PathBuf {
        self.state_dir
            .join("io.containerd.runtime.v2.task")
            .join(&self.namespace)
            .join(id.as_str())
            .join("rootfs")
    }

    /// Directory holding the overlay snapshotter's snapshots
    #[must_use]
    pub fn snapshots_dir(&self) -> PathBuf {
        overlay_snapshots_dir(&self.root_dir)
    }
}

/// Overlay snapshotter's snapshot directory under a containerd root
#[must_use]
pub fn overlay_snapshots_dir(root_dir: &Path) -> PathBuf {
    root_dir
        .join("io.containerd.snapshotter.v1.overlayfs")
        .join("snapshots")
}

/// Plugin session behaviour
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Host runtime plugin socket
    pub host_socket: PathBuf,
    /// Fixed delay before reconnecting
    pub restart_delay: Duration,
    /// Give up after this many consecutive restarts; `None` retries forever
    pub max_restarts: Option<u32>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            host_socket: PathBuf::from(DEFAULT_HOST_SOCKET),
            restart_delay: DEFAULT_RESTART_DELAY,
            max_restarts: None,
        }
    }
}

/// Orchestrator API access
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KubeConfig {
    /// API server URL; defaults to the in-cluster service address
    pub apiserver: Option<String>,
    /// Bearer token file; defaults to the service-account token
    pub token_file: Option<PathBuf>,
}

/// Complete daemon configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// Plugin identity
    pub plugin: PluginConfig,
    /// Sizing policy
    pub quota: QuotaConfig,
    /// containerd layout and socket
    pub containerd: ContainerdConfig,
    /// Pods must match this selector to be managed; `None` manages every pod
    pub label_select: Option<LabelSelector>,
    /// Session behaviour
    pub session: SessionConfig,
    /// Liveness probe port
    pub probe_port: u16,
    /// Orchestrator API access
    pub kube: KubeConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            plugin: PluginConfig::default(),
            quota: QuotaConfig::default(),
            containerd: ContainerdConfig::default(),
            label_select: None,
            session: SessionConfig::default(),
            probe_port: DEFAULT_PROBE_PORT,
            kube: KubeConfig::default(),
        }
    }
}

impl Config {
    /// Validate the configuration
    ///
    /// # Errors
    /// Returns [`Error::InvalidConfig`] describing the first offending option
    pub fn validate(&self) -> Result<()> {
        if self.plugin.name.trim().is_empty() {
            return Err(Error::config("plugin name cannot be empty"));
        }

        let index = &self.plugin.index;
        if index.len() != 2 || !index.bytes().all(|b| b.is_ascii_digit()) {
            return Err(Error::config(format!(
                "plugin index must be two digits, got {index:?}"
            )));
        }

        if self.quota.default_size.is_zero() {
            return Err(Error::config("default quota size must be positive"));
        }

        if let Some(resource) = &self.quota.customer_resource {
            if resource.trim().is_empty() {
                return Err(Error::config("customer resource name cannot be empty"));
            }
        }

        let dirs: [(&str, &Path); 4] = [
            ("containerd state dir", &self.containerd.state_dir),
            ("containerd root dir", &self.containerd.root_dir),
            ("containerd base path", &self.containerd.base_path),
            ("containerd socket", &self.containerd.socket),
        ];
        for (what, path) in dirs {
            if !path.is_absolute() {
                return Err(Error::config(format!(
                    "{what} must be absolute, got {}",
                    path.display()
                )));
            }
        }

        if self.containerd.namespace.is_empty() {
            return Err(Error::config("containerd namespace cannot be empty"));
        }

        Ok(())
    }

    /// Log every effective option
    pub fn log_effective(&self) {
        tracing::info!(name = %self.plugin.name, index = %self.plugin.index, "plugin");
        tracing::info!(size = self.quota.default_size.as_bytes(), "quota size");
        tracing::info!(state_dir = %self.containerd.state_dir.display(), "containerd state dir");
        tracing::info!(root_dir = %self.containerd.root_dir.display(), "containerd root dir");
        tracing::info!(base_path = %self.containerd.base_path.display(), "containerd base path");
        tracing::info!(socket = %self.containerd.socket.display(), "containerd socket");
        tracing::info!(namespace = %self.containerd.namespace, "containerd namespace");
        tracing::info!(
            use_ephemeral_storage = self.quota.use_ephemeral_storage,
            "use ephemeral storage"
        );
        tracing::info!(
            enabled = self.label_select.is_some(),
            label_select = %self.label_select.clone().unwrap_or_default(),
            "label select"
        );
        tracing::info!(skip_rootfs = self.quota.skip_rootfs, "skip rootfs");
        tracing::info!(
            customer_resource = self.quota.customer_resource.as_deref().unwrap_or(""),
            "customer resource"
        );
        tracing::info!(
            host_socket = %self.session.host_socket.display(),
            restart_delay_secs = self.session.restart_delay.as_secs(),
            max_restarts = ?self.session.max_restarts,
            "session"
        );
        tracing::info!(probe_port = self.probe_port, "liveness probe");
        if let Some(apiserver) = &self.kube.apiserver {
            tracing::info!(%apiserver, "kube apiserver");
        }
    }
}

/// Equality-based label selector built from a set of required pairs
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LabelSelector(BTreeMap<String, String>);

impl LabelSelector {
    /// Create from required label pairs
    #[must_use]
    pub fn new(pairs: BTreeMap<String, String>) -> Self {
        Self(pairs)
    }

    /// Merge another selector's pairs into this one
    pub fn extend(&mut self, other: Self) {
        self.0.extend(other.0);
    }

    /// Whether no pairs are required
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// True iff every required key is present with an equal value
    #[must_use]
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.0
            .iter()
            .all(|(key, value)| labels.get(key) == Some(value))
    }
}

impl FromStr for LabelSelector {
    type Err = Error;

    /// Parse `key=value[,key=value]*`; a bare `key` requires an empty value
    fn from_str(s: &str) -> Result<Self> {
        let mut pairs = BTreeMap::new();
        for pair in s.split(',').filter(|p| !p.trim().is_empty()) {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            let key = key.trim();
            if key.is_empty() {
                return Err(Error::config(format!("invalid label pair: {pair:?}")));
            }
            pairs.insert(key.to_string(), value.trim().to_string());
        }
        Ok(Self(pairs))
    }
}

impl fmt::Display for LabelSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let pairs: Vec<String> = self.0.iter().map(|(k, v)| format!("{k}={v}")).collect();
        write!(f, "{}", pairs.join(","))
    }
}
