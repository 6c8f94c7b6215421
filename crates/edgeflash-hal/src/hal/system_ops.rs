//! System-level operations: sync, udev, small state files, sysfs attributes.

use crate::HalResult;
use std::path::Path;

/// System operations trait.
pub trait SystemOps {
    /// Best-effort filesystem sync.
    fn sync(&self) -> HalResult<()>;

    /// Best-effort udev settle (wait for block device events to quiesce).
    fn udev_settle(&self) -> HalResult<()>;

    /// Ask udev to re-read its rule files.
    fn udev_reload(&self) -> HalResult<()>;

    /// Bytes available to unprivileged writers on the filesystem holding `path`.
    fn free_bytes(&self, path: &Path) -> HalResult<u64>;

    fn create_dir_all(&self, path: &Path, dry_run: bool) -> HalResult<()>;

    /// Append `text` to `path`, creating it if needed, and fsync.
    fn append_text(&self, path: &Path, text: &str, dry_run: bool) -> HalResult<()>;

    /// Replace `path` with `text` and fsync.
    fn write_text(&self, path: &Path, text: &str, dry_run: bool) -> HalResult<()>;
}

/// Single-value kernel attribute files (`/sys/...`).
pub trait SysfsOps {
    fn read_attr(&self, path: &Path) -> HalResult<String>;
    fn write_attr(&self, path: &Path, value: &str) -> HalResult<()>;
}
