//! The quota daemon

use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::{info, warn};
use snapquota_plugin::{
    spawn_signal_watcher, ContainerdConnector, KubeClient, PluginSession, PodResourceSource,
    QuotaCoordinator, Registration, SocketConnector,
};
use snapquota_prjquota::{ProjectQuotaControl, QuotaBackend};

use crate::cli::RunArgs;
use crate::probe;

pub async fn execute(args: RunArgs) -> Result<()> {
    let config = args.into_config().context("Invalid configuration")?;

    info!(version = env!("CARGO_PKG_VERSION"), "Starting snapquota");
    config.log_effective();

    if !nix::unistd::geteuid().is_root() {
        warn!("Not running as root, quota operations will likely fail");
    }

    let registration = Registration::new(&config.plugin.name, &config.plugin.index)
        .context("Invalid plugin registration")?;

    let base_path = config.containerd.base_path.clone();
    let supported = tokio::task::spawn_blocking(move || snapquota_prjquota::precheck(&base_path))
        .await
        .context("Project quota check panicked")?
        .context("Failed to check project quota support")?;
    if !supported {
        return Err(snapquota_core::Error::QuotaUnsupported {
            path: config.containerd.base_path.clone(),
        }
        .into());
    }

    let control = Arc::new(
        ProjectQuotaControl::new(&config.containerd.base_path, &config.containerd.root_dir)
            .await
            .context("Failed to initialize project quota control")?,
    );
    info!(device = %control.backing_device().display(), "Project quota control ready");

    let needs_api =
        config.quota.use_ephemeral_storage || config.quota.customer_resource.is_some();
    let resources: Option<Arc<dyn PodResourceSource>> = if needs_api {
        let client = KubeClient::in_cluster(
            config.kube.apiserver.as_deref(),
            config.kube.token_file.as_deref(),
        )
        .context("Failed to create Kubernetes client")?;
        info!(apiserver = %client.apiserver(), "Using Kubernetes API for pod resources");
        Some(Arc::new(client))
    } else {
        None
    };

    let backend: Arc<dyn QuotaBackend> = control.clone();
    let coordinator = Arc::new(QuotaCoordinator::new(&config, backend, resources));

    let session = PluginSession::new(
        registration,
        config.session.clone(),
        Arc::new(SocketConnector::new(&config.session.host_socket)),
        Arc::new(ContainerdConnector::new(&config.containerd.socket)),
        coordinator,
    );

    let signals =
        spawn_signal_watcher(session.control()).context("Failed to install signal handlers")?;

    let probe = probe::spawn(config.probe_port)
        .await
        .with_context(|| format!("Failed to bind liveness probe on port {}", config.probe_port))?;

    let result = tokio::select! {
        result = session.run(control.as_ref(), &config.containerd.base_path) => {
            result.context("Plugin session failed")
        }
        served = probe => match served {
            Ok(Ok(())) => Err(anyhow::anyhow!("Liveness probe stopped")),
            Ok(Err(e)) => Err(e).context("Liveness probe failed"),
            Err(e) => Err(e).context("Liveness probe task failed"),
        },
    };

    signals.abort();

    if result.is_ok() {
        info!("snapquota stopped");
    }
    result
}
