//! Linux project quota control with pluggable backends
//!
//! This crate provides a trait-based abstraction over XFS/ext4 project
//! quotas for per-snapshot disk limits, including production and mock
//! implementations.

#![warn(missing_docs, clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(
    clippy::module_name_repetitions,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod backend;
pub mod control;
pub mod mounts;
pub mod sys;

pub use backend::{MockBackend, QuotaBackend, QuotaCall};
pub use control::{ProjectQuotaControl, BACKING_DEVICE_NODE};
pub use mounts::{precheck, MountEntry, MountTable};
pub use sys::ProjectUsage;

// Re-export commonly used types
pub use snapquota_core::{ProjectId, QuotaSize, QuotaSpec};
