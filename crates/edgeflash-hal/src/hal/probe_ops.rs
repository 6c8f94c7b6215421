//! Block device probing (sysfs, blkid).

use crate::{BlockDeviceInfo, HalResult};
use std::path::{Path, PathBuf};

/// Probing operations trait.
pub trait ProbeOps {
    /// Whole-disk block devices visible to the kernel (virtual devices skipped).
    fn block_devices(&self) -> HalResult<Vec<BlockDeviceInfo>>;

    /// Whole disk that owns `device` if it is a partition, `None` for whole disks.
    fn parent_disk(&self, device: &Path) -> HalResult<Option<PathBuf>>;

    /// Resolve a mount source (symlink, `/dev/disk/by-*` path) to a kernel device node.
    fn resolve_device(&self, source: &Path) -> HalResult<PathBuf>;

    /// Most stable `/dev/disk/by-id` alias for a device, if any.
    fn stable_alias(&self, device: &Path) -> HalResult<Option<PathBuf>>;

    /// Filesystem signature type (e.g. `ext4`), `None` when no signature is found.
    fn fs_type(&self, device: &Path) -> HalResult<Option<String>>;

    /// Filesystem label, if any.
    fn fs_label(&self, device: &Path) -> HalResult<Option<String>>;

    /// Partition table type (`gpt`, `dos`) on a whole disk, if any.
    fn partition_table_type(&self, disk: &Path) -> HalResult<Option<String>>;

    /// Filesystem UUID for a block device (e.g. `/dev/nvme1n1p1`).
    fn blkid_uuid(&self, device: &Path) -> HalResult<String>;
}
