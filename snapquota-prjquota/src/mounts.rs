//! Mount table inspection for the project quota precheck

use std::path::{Path, PathBuf};
use tracing::debug;
use snapquota_core::{Error, Result};

/// Kernel mount table of the current process
pub const PROC_MOUNTS: &str = "/proc/self/mounts";

/// Filesystems whose project quota this crate knows how to drive
const PROJECT_QUOTA_FILESYSTEMS: [&str; 2] = ["xfs", "ext4"];

/// Mount options that mean project quota accounting and enforcement is on
const PROJECT_QUOTA_OPTIONS: [&str; 2] = ["prjquota", "pquota"];

/// One line of the mount table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountEntry {
    /// Mounted device
    pub source: String,
    /// Mount point
    pub target: PathBuf,
    /// Filesystem type
    pub fstype: String,
    /// Mount options
    pub options: Vec<String>,
}

impl MountEntry {
    /// Whether the mount has project quota enforced
    #[must_use]
    pub fn has_project_quota(&self) -> bool {
        PROJECT_QUOTA_FILESYSTEMS.contains(&self.fstype.as_str())
            && self
                .options
                .iter()
                .any(|o| PROJECT_QUOTA_OPTIONS.contains(&o.as_str()))
    }
}

/// Parsed mount table
#[derive(Debug, Clone, Default)]
pub struct MountTable {
    entries: Vec<MountEntry>,
}

impl MountTable {
    /// Read the current process's mount table
    ///
    /// # Errors
    /// Returns [`Error::InvalidConfig`] if the table cannot be read
    pub fn read() -> Result<Self> {
        let content = std::fs::read_to_string(PROC_MOUNTS)
            .map_err(|e| Error::config(format!("failed to read {PROC_MOUNTS}: {e}")))?;
        Ok(Self::parse(&content))
    }

    /// Parse mount table text in `/proc/mounts` format
    #[must_use]
    pub fn parse(content: &str) -> Self {
        let entries = content
            .lines()
            .filter_map(|line| {
                let mut fields = line.split_whitespace();
                let source = fields.next()?;
                let target = fields.next()?;
                let fstype = fields.next()?;
                let options = fields.next()?;
                Some(MountEntry {
                    source: unescape(source),
                    target: PathBuf::from(unescape(target)),
                    fstype: fstype.to_string(),
                    options: options.split(',').map(str::to_string).collect(),
                })
            })
            .collect();
        Self { entries }
    }

    /// The mount that contains `path`: the entry with the longest matching
    /// mount point, later entries shadowing earlier ones
    #[must_use]
    pub fn containing(&self, path: &Path) -> Option<&MountEntry> {
        self.entries
            .iter()
            .filter(|entry| path.starts_with(&entry.target))
            .fold(None, |best: Option<&MountEntry>, entry| match best {
                Some(b) if b.target.components().count() > entry.target.components().count() => {
                    Some(b)
                }
                _ => Some(entry),
            })
    }
}

/// Decode the octal escapes (`\040` and friends) the kernel uses for
/// whitespace in mount table fields
fn unescape(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        let escaped = (bytes[i] == b'\\' && i + 3 < bytes.len())
            .then(|| &bytes[i + 1..i + 4])
            .filter(|digits| digits.iter().all(|b| (b'0'..=b'7').contains(b)))
            .and_then(|digits| {
                let code = digits
                    .iter()
                    .fold(0u16, |acc, d| acc * 8 + u16::from(d - b'0'));
                u8::try_from(code).ok()
            });
        match escaped {
            Some(code) => {
                out.push(code);
                i += 4;
            }
            None => {
                out.push(bytes[i]);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Check whether the filesystem backing `base_path` has project quota enabled
///
/// # Errors
/// Returns [`Error::InvalidConfig`] if the path or the mount table cannot be
/// resolved
pub fn precheck(base_path: &Path) -> Result<bool> {
    let table = MountTable::read()?;
    precheck_with(&table, base_path)
}

/// [`precheck`] against an already parsed mount table
///
/// # Errors
/// Returns [`Error::InvalidConfig`] if no mount contains the path
pub fn precheck_with(table: &MountTable, base_path: &Path) -> Result<bool> {
    let resolved = std::fs::canonicalize(base_path).unwrap_or_else(|_| base_path.to_path_buf());

    let entry = table.containing(&resolved).ok_or_else(|| {
        Error::config(format!("mount point not found for path: {}", resolved.display()))
    })?;

    debug!(
        path = %resolved.display(),
        mount_point = %entry.target.display(),
        fstype = %entry.fstype,
        options = %entry.options.join(","),
        "Resolved backing mount"
    );

    Ok(entry.has_project_quota())
}

#[cfg(test)]
mod tests {
    use super::*;

    const TABLE: &str = "\
sysfs /sys sysfs rw,nosuid,nodev,noexec,relatime 0 0
/dev/sda1 / xfs rw,relatime,attr2,inode64,logbufs=8,logbsize=32k,prjquota 0 0
/dev/sdb1 /var/lib/containerd ext4 rw,relatime 0 0
/dev/sdc1 /data\\040disk xfs rw,relatime,pquota 0 0
overlay /run/containerd/io.containerd.runtime.v2.task/k8s.io/abc/rootfs overlay rw,lowerdir=/l,upperdir=/u,workdir=/w 0 0
";

    #[test]
    fn test_parse_and_unescape() {
        let table = MountTable::parse(TABLE);
        let entry = table.containing(Path::new("/data disk/x")).unwrap();
        assert_eq!(entry.target, PathBuf::from("/data disk"));
        assert!(entry.has_project_quota());
    }

    #[test]
    fn test_longest_prefix_wins() {
        let table = MountTable::parse(TABLE);

        let root = table.containing(Path::new("/")).unwrap();
        assert_eq!(root.fstype, "xfs");
        assert!(root.has_project_quota());

        let containerd = table
            .containing(Path::new("/var/lib/containerd/io.containerd.snapshotter.v1.overlayfs"))
            .unwrap();
        assert_eq!(containerd.fstype, "ext4");
        assert!(!containerd.has_project_quota());

        // prefixes match whole components only
        let other = table.containing(Path::new("/var/lib/containerdx")).unwrap();
        assert_eq!(other.target, PathBuf::from("/"));
    }

    #[test]
    fn test_precheck_with() {
        let table = MountTable::parse(TABLE);
        assert!(precheck_with(&table, Path::new("/nonexistent/for/sure")).unwrap());

        let empty = MountTable::parse("");
        assert!(precheck_with(&empty, Path::new("/")).is_err());
    }

    #[test]
    fn test_overlay_is_not_quota_capable() {
        let entry = MountEntry {
            source: "overlay".to_string(),
            target: PathBuf::from("/merged"),
            fstype: "overlay".to_string(),
            options: vec!["prjquota".to_string()],
        };
        assert!(!entry.has_project_quota());
    }
}
