//! Raw project quota syscalls
//!
//! Project IDs live in the inode's extended attributes (`FS_IOC_FSGETXATTR`
//! / `FS_IOC_FSSETXATTR`); limits are set through the XFS quota interface
//! of `quotactl(2)`, which ext4 implements as well.

#![allow(unsafe_code)]

use std::ffi::CString;
use std::fs::File;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::MetadataExt;
use std::os::fd::AsRawFd;
use std::path::Path;

use nix::errno::Errno;
use nix::sys::stat::{mknod, Mode, SFlag};
use snapquota_core::{ProjectId, QuotaSize, QuotaSpec};

/// `struct fsxattr` from `<linux/fs.h>`
#[repr(C)]
#[allow(dead_code)]
#[derive(Debug, Default, Clone, Copy)]
pub struct FsXattr {
    fsx_xflags: u32,
    fsx_extsize: u32,
    fsx_nextents: u32,
    fsx_projid: u32,
    fsx_cowextsize: u32,
    fsx_pad: [u8; 8],
}

/// New entries below a directory inherit its project ID
const FS_XFLAG_PROJINHERIT: u32 = 0x0000_0200;

nix::ioctl_read!(fs_ioc_fsgetxattr, b'X', 31, FsXattr);
nix::ioctl_write_ptr!(fs_ioc_fssetxattr, b'X', 32, FsXattr);

/// `struct fs_disk_quota` from `<linux/dqblk_xfs.h>`
#[repr(C)]
#[allow(dead_code)]
#[derive(Debug, Default, Clone, Copy)]
struct FsDiskQuota {
    d_version: i8,
    d_flags: i8,
    d_fieldmask: u16,
    d_id: u32,
    d_blk_hardlimit: u64,
    d_blk_softlimit: u64,
    d_ino_hardlimit: u64,
    d_ino_softlimit: u64,
    d_bcount: u64,
    d_icount: u64,
    d_itimer: i32,
    d_btimer: i32,
    d_iwarns: u16,
    d_bwarns: u16,
    d_padding2: [i8; 4],
    d_rtb_hardlimit: u64,
    d_rtb_softlimit: u64,
    d_rtbcount: u64,
    d_rtbtimer: i32,
    d_rtbwarns: u16,
    d_padding3: i16,
    d_padding4: [i8; 8],
}

const FS_DQUOT_VERSION: i8 = 1;
const FS_PROJ_QUOTA: i8 = 2;
const FS_DQ_BSOFT: u16 = 1 << 2;
const FS_DQ_BHARD: u16 = 1 << 3;

const PRJQUOTA: i32 = 2;
const Q_XGETQUOTA: i32 = ((b'X' as i32) << 8) | 3;
const Q_XSETQLIM: i32 = ((b'X' as i32) << 8) | 4;

/// `QCMD(cmd, type)` from `<sys/quota.h>`
const fn qcmd(cmd: i32, kind: i32) -> i32 {
    (cmd << 8) | (kind & 0x00ff)
}

/// Current usage and limit of a project
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ProjectUsage {
    /// Bytes charged to the project
    pub used: QuotaSize,
    /// Hard limit; zero when unlimited
    pub limit: QuotaSize,
}

fn get_xattr(dir: &File) -> nix::Result<FsXattr> {
    let mut attr = FsXattr::default();
    // SAFETY: `attr` is a valid, writable `struct fsxattr` for the call's duration.
    unsafe { fs_ioc_fsgetxattr(dir.as_raw_fd(), &mut attr) }?;
    Ok(attr)
}

/// Read the project ID of a file or directory
pub fn project_id(path: &Path) -> std::io::Result<ProjectId> {
    let dir = File::open(path)?;
    let attr = get_xattr(&dir)?;
    Ok(ProjectId::from_raw(attr.fsx_projid))
}

/// Tag a directory with a project ID and make its children inherit it
pub fn set_project_id(path: &Path, id: ProjectId) -> std::io::Result<()> {
    let dir = File::open(path)?;
    let mut attr = get_xattr(&dir)?;
    attr.fsx_projid = id.as_raw();
    attr.fsx_xflags |= FS_XFLAG_PROJINHERIT;
    // SAFETY: `attr` is a valid `struct fsxattr` read back from the same inode.
    unsafe { fs_ioc_fssetxattr(dir.as_raw_fd(), &attr) }?;
    Ok(())
}

fn quotactl(cmd: i32, device: &Path, id: ProjectId, quota: &mut FsDiskQuota) -> nix::Result<()> {
    let special = CString::new(device.as_os_str().as_bytes()).map_err(|_| Errno::EINVAL)?;
    #[allow(clippy::cast_possible_wrap)]
    let raw_id = id.as_raw() as i32;
    // SAFETY: `special` is NUL-terminated and `quota` is a valid `fs_disk_quota`
    // that outlives the call.
    let rc = unsafe {
        libc::quotactl(
            qcmd(cmd, PRJQUOTA),
            special.as_ptr(),
            raw_id,
            std::ptr::from_mut(quota).cast::<libc::c_char>(),
        )
    };
    Errno::result(rc).map(drop)
}

/// Set the block hard and soft limit of a project; zero clears the limit
pub fn set_project_limit(device: &Path, id: ProjectId, spec: QuotaSpec) -> nix::Result<()> {
    let blocks = spec.size.as_basic_blocks();
    let mut quota = FsDiskQuota {
        d_version: FS_DQUOT_VERSION,
        d_flags: FS_PROJ_QUOTA,
        d_fieldmask: FS_DQ_BHARD | FS_DQ_BSOFT,
        d_id: id.as_raw(),
        d_blk_hardlimit: blocks,
        d_blk_softlimit: blocks,
        ..FsDiskQuota::default()
    };
    quotactl(Q_XSETQLIM, device, id, &mut quota)
}

/// Read usage and limit of a project
pub fn project_usage(device: &Path, id: ProjectId) -> nix::Result<ProjectUsage> {
    let mut quota = FsDiskQuota::default();
    match quotactl(Q_XGETQUOTA, device, id, &mut quota) {
        Ok(()) => Ok(ProjectUsage {
            used: QuotaSize::from_bytes(quota.d_bcount.saturating_mul(512)),
            limit: QuotaSize::from_bytes(quota.d_blk_hardlimit.saturating_mul(512)),
        }),
        // no dquot allocated yet: nothing charged, no limit
        Err(Errno::ENOENT) => Ok(ProjectUsage::default()),
        Err(e) => Err(e),
    }
}

/// Create a block device node for the filesystem holding `dir`, to be
/// passed as the `quotactl` special file
pub fn make_backing_device(dir: &Path, node: &Path) -> std::io::Result<()> {
    let dev = std::fs::metadata(dir)?.dev();

    match std::fs::remove_file(node) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }

    mknod(node, SFlag::S_IFBLK, Mode::S_IRUSR | Mode::S_IWUSR, dev)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_struct_layouts_match_kernel() {
        assert_eq!(std::mem::size_of::<FsXattr>(), 28);
        assert_eq!(std::mem::size_of::<FsDiskQuota>(), 112);
    }

    #[test]
    fn test_qcmd_encoding() {
        assert_eq!(qcmd(Q_XSETQLIM, PRJQUOTA), 0x0058_0402);
        assert_eq!(qcmd(Q_XGETQUOTA, PRJQUOTA), 0x0058_0302);
    }

    #[test]
    fn test_project_id_of_missing_path() {
        assert!(project_id(Path::new("/definitely/not/here")).is_err());
    }
}
