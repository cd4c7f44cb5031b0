//! Core type definitions with strong typing and validation

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::{Error, Result};

/// Container identifier with validation
///
/// Follows containerd's identifier rules: alphanumeric segments joined by
/// `.`, `_` or `-`, at most [`ContainerId::MAX_LENGTH`] characters.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(transparent)]
#[serde(try_from = "String", into = "String")]
pub struct ContainerId(String);

impl ContainerId {
    /// Maximum length for container IDs
    pub const MAX_LENGTH: usize = 76;

    /// Create a new `ContainerId` with validation
    ///
    /// # Errors
    /// Returns error if ID is invalid (empty, too long, or contains invalid characters)
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        Self::validate(&id)?;
        Ok(Self(id))
    }

    /// Validate a container ID
    fn validate(id: &str) -> Result<()> {
        if id.is_empty() {
            return Err(Error::config("Container ID cannot be empty"));
        }

        if id.len() > Self::MAX_LENGTH {
            return Err(Error::config(format!(
                "Container ID too long (max {} chars)",
                Self::MAX_LENGTH
            )));
        }

        let is_separator = |c: char| matches!(c, '.' | '_' | '-');
        if !id.chars().all(|c| c.is_ascii_alphanumeric() || is_separator(c)) {
            return Err(Error::config(
                "Container ID can only contain alphanumeric, dot, dash, and underscore",
            ));
        }

        if id.starts_with(is_separator) || id.ends_with(is_separator) {
            return Err(Error::config(
                "Container ID must start and end with an alphanumeric character",
            ));
        }

        Ok(())
    }

    /// Get the container ID as a string slice
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContainerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ContainerId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::new(s)
    }
}

impl TryFrom<String> for ContainerId {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        Self::new(s)
    }
}

impl From<ContainerId> for String {
    fn from(id: ContainerId) -> Self {
        id.0
    }
}

/// Kernel project quota identifier
///
/// Zero means "no project"; every directory starts out in project 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[repr(transparent)]
#[serde(transparent)]
pub struct ProjectId(u32);

impl ProjectId {
    /// The unset project
    pub const UNSET: Self = Self(0);

    /// Create from a raw kernel value
    #[must_use]
    pub const fn from_raw(id: u32) -> Self {
        Self(id)
    }

    /// Get the raw kernel value
    #[must_use]
    pub const fn as_raw(self) -> u32 {
        self.0
    }

    /// Whether this is the unset project
    #[must_use]
    pub const fn is_unset(self) -> bool {
        self.0 == 0
    }

    /// The next project ID, or `None` when the ID space is exhausted
    #[must_use]
    pub const fn next(self) -> Option<Self> {
        match self.0.checked_add(1) {
            Some(id) => Some(Self(id)),
            None => None,
        }
    }
}

impl fmt::Display for ProjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_container_id_validation() {
        assert!(ContainerId::new("valid-id_123").is_ok());
        assert!(ContainerId::new("a9d920cfaeb0f68ac89938e160f04427f306b01ad5c80554e45d7b7b54cbab34").is_ok());
        assert!(ContainerId::new("nginx.v1").is_ok());
        assert!(ContainerId::new("").is_err());
        assert!(ContainerId::new("a".repeat(77)).is_err());
        assert!(ContainerId::new("invalid id").is_err());
        assert!(ContainerId::new("invalid/id").is_err());
        assert!(ContainerId::new("-leading").is_err());
    }

    #[test]
    fn test_container_id_serde() {
        let id = ContainerId::new("test-123").unwrap();
        let json = serde_json::to_string(&id).unwrap();
        let deserialized: ContainerId = serde_json::from_str(&json).unwrap();
        assert_eq!(id, deserialized);

        assert!(serde_json::from_str::<ContainerId>("\"bad id\"").is_err());
    }

    #[test]
    fn test_project_id() {
        assert!(ProjectId::UNSET.is_unset());
        assert_eq!(ProjectId::default(), ProjectId::UNSET);

        let id = ProjectId::from_raw(41);
        assert_eq!(id.next(), Some(ProjectId::from_raw(42)));
        assert_eq!(ProjectId::from_raw(u32::MAX).next(), None);
        assert_eq!(id.to_string(), "41");
    }
}
