//! snapquota core - foundation types, configuration and errors
//!
//! This crate provides the vocabulary shared by the quota control, the
//! lifecycle coordinator and the daemon binary.

#![warn(missing_docs, clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod error;
pub mod events;
pub mod pod;
pub mod resources;
pub mod types;

pub use config::{overlay_snapshots_dir, Config, LabelSelector};
pub use error::{Error, Result};
pub use events::LifecycleEvent;
pub use pod::{Container, ContainerResources, PodResources, PodSandbox};
pub use resources::{Quantity, QuotaSize, QuotaSpec, EPHEMERAL_STORAGE_RESERVATION};
pub use types::{ContainerId, ProjectId};
