//! snapquota plugin - lifecycle coordination and host runtime session
//!
//! Ties the project quota backend to the container lifecycle: the
//! [`QuotaCoordinator`] reacts to create/start/remove events, the
//! [`PluginSession`] keeps a registration with the host runtime alive.

#![warn(missing_docs, clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(
    clippy::module_name_repetitions,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod coordinator;
pub mod kube;
pub mod layout;
pub mod runtime;
pub mod session;
pub mod signals;
pub mod sizing;
pub mod transport;

pub use coordinator::{FilterDecision, LifecycleHandler, QuotaCoordinator};
pub use kube::{KubeClient, PodResourceSource};
pub use layout::OverlayLayout;
pub use runtime::{
    ContainerInfo, ContainerdClient, ContainerdConnector, RuntimeClient, RuntimeConnector,
    SnapshotMount,
};
pub use session::{
    HostConnector, HostSession, PluginSession, Registration, SessionControl, SessionState,
};
pub use signals::spawn_signal_watcher;
pub use transport::SocketConnector;
