//! CLI argument definitions

use clap::{ArgAction, Args, Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;
use snapquota_core::config::{
    ContainerdConfig, KubeConfig, PluginConfig, QuotaConfig, SessionConfig,
    DEFAULT_CONTAINERD_BASE_PATH, DEFAULT_CONTAINERD_NAMESPACE, DEFAULT_CONTAINERD_ROOT_DIR,
    DEFAULT_CONTAINERD_SOCKET, DEFAULT_CONTAINERD_STATE_DIR, DEFAULT_HOST_SOCKET,
    DEFAULT_PLUGIN_INDEX, DEFAULT_PLUGIN_NAME, DEFAULT_PROBE_PORT, DEFAULT_QUOTA_SIZE,
};
use snapquota_core::{Config, LabelSelector, QuotaSize};

#[derive(Parser)]
#[command(name = "snapquota")]
#[command(about = "Per-container disk quotas for containerd overlay snapshots", long_about = None)]
#[command(version)]
pub struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the quota daemon
    Run(RunArgs),

    /// Check project quota support and the node environment
    Check(CheckArgs),

    /// Show version information
    Version,
}

/// Where containerd lives on the node
#[derive(Args, Debug, Clone)]
pub struct ContainerdArgs {
    /// containerd state directory
    #[arg(long, default_value = DEFAULT_CONTAINERD_STATE_DIR)]
    pub containerd_state_dir: PathBuf,

    /// containerd root directory
    #[arg(long, default_value = DEFAULT_CONTAINERD_ROOT_DIR)]
    pub containerd_root_dir: PathBuf,

    /// Mount point of the filesystem holding the containerd root directory
    #[arg(long, default_value = DEFAULT_CONTAINERD_BASE_PATH)]
    pub containerd_base_path: PathBuf,

    /// containerd gRPC socket
    #[arg(long, default_value = DEFAULT_CONTAINERD_SOCKET)]
    pub containerd_socket: PathBuf,

    /// containerd namespace used by the orchestrator
    #[arg(long, default_value = DEFAULT_CONTAINERD_NAMESPACE)]
    pub containerd_namespace: String,
}

impl From<ContainerdArgs> for ContainerdConfig {
    fn from(args: ContainerdArgs) -> Self {
        Self {
            state_dir: args.containerd_state_dir,
            root_dir: args.containerd_root_dir,
            base_path: args.containerd_base_path,
            socket: args.containerd_socket,
            namespace: args.containerd_namespace,
        }
    }
}

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Plugin name registered with the host runtime
    #[arg(long, default_value = DEFAULT_PLUGIN_NAME)]
    pub name: String,

    /// Two-digit plugin index registered with the host runtime
    #[arg(long, default_value = DEFAULT_PLUGIN_INDEX)]
    pub idx: String,

    /// Default quota size in bytes
    #[arg(long, default_value_t = DEFAULT_QUOTA_SIZE)]
    pub quota: u64,

    #[command(flatten)]
    pub containerd: ContainerdArgs,

    /// Size quotas from the container's ephemeral-storage resource
    #[arg(long, default_value_t = false, action = ArgAction::Set, num_args = 0..=1, default_missing_value = "true")]
    pub use_ephemeral_storage: bool,

    /// Only manage pods matching --label-select
    #[arg(long, default_value_t = true, action = ArgAction::Set, num_args = 0..=1, default_missing_value = "true")]
    pub enable_label_select: bool,

    /// Required pod labels, may be repeated
    #[arg(long, value_name = "KEY=VALUE,...")]
    pub label_select: Vec<LabelSelector>,

    /// Leave the merged rootfs out of the quota project
    #[arg(long, default_value_t = true, action = ArgAction::Set, num_args = 0..=1, default_missing_value = "true")]
    pub skip_rootfs: bool,

    /// Resource name that overrides every other sizing source
    #[arg(long)]
    pub customer_resource: Option<String>,

    /// JSON-lines host protocol socket (not an NRI socket)
    #[arg(long, default_value = DEFAULT_HOST_SOCKET)]
    pub host_socket: PathBuf,

    /// Liveness probe port
    #[arg(long, default_value_t = DEFAULT_PROBE_PORT)]
    pub probe_port: u16,

    /// Seconds to wait before reconnecting to the host runtime
    #[arg(long, default_value_t = 3)]
    pub restart_delay_secs: u64,

    /// Give up after this many consecutive restarts (default: never)
    #[arg(long)]
    pub max_restarts: Option<u32>,

    /// Kubernetes API server URL (default: in-cluster service)
    #[arg(long)]
    pub kube_apiserver: Option<String>,

    /// Kubernetes bearer token file (default: service-account token)
    #[arg(long)]
    pub kube_token_file: Option<PathBuf>,
}

impl RunArgs {
    /// Build and validate the daemon configuration
    pub fn into_config(self) -> snapquota_core::Result<Config> {
        let label_select = self.enable_label_select.then(|| {
            self.label_select
                .into_iter()
                .fold(LabelSelector::default(), |mut merged, selector| {
                    merged.extend(selector);
                    merged
                })
        });

        let config = Config {
            plugin: PluginConfig {
                name: self.name,
                index: self.idx,
            },
            quota: QuotaConfig {
                default_size: QuotaSize::from_bytes(self.quota),
                use_ephemeral_storage: self.use_ephemeral_storage,
                customer_resource: self.customer_resource,
                skip_rootfs: self.skip_rootfs,
            },
            containerd: self.containerd.into(),
            label_select,
            session: SessionConfig {
                host_socket: self.host_socket,
                restart_delay: Duration::from_secs(self.restart_delay_secs),
                max_restarts: self.max_restarts,
            },
            probe_port: self.probe_port,
            kube: KubeConfig {
                apiserver: self.kube_apiserver,
                token_file: self.kube_token_file,
            },
        };
        config.validate()?;
        Ok(config)
    }
}

#[derive(Args, Debug)]
pub struct CheckArgs {
    #[command(flatten)]
    pub containerd: ContainerdArgs,

    /// JSON-lines host protocol socket (not an NRI socket)
    #[arg(long, default_value = DEFAULT_HOST_SOCKET)]
    pub host_socket: PathBuf,
}
