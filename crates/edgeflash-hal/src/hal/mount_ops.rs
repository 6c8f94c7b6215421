//! Mounting the data volume and releasing installer media.

use crate::HalResult;
use nix::mount::MsFlags;
use std::path::{Path, PathBuf};

pub trait MountOps {
    /// Mount `device` on `target`. With `dry_run` the call is only logged.
    fn mount_device(
        &self,
        device: &Path,
        target: &Path,
        fstype: Option<&str>,
        options: MountOptions,
        dry_run: bool,
    ) -> HalResult<()>;

    fn unmount(&self, target: &Path, dry_run: bool) -> HalResult<()>;

    fn is_mounted(&self, path: &Path) -> HalResult<bool>;

    /// Mount points whose source is `disk` or one of its partitions.
    fn mountpoints_on(&self, disk: &Path) -> HalResult<Vec<PathBuf>>;
}

/// An fstab-style option list such as `defaults,nofail,noatime`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MountOptions {
    pub options: Option<String>,
}

impl MountOptions {
    pub fn with_options(options: impl Into<String>) -> Self {
        Self {
            options: Some(options.into()),
        }
    }

    /// Split into mount(2) flags and the filesystem data string. Words only
    /// fstab or mount(8) understand are dropped; ext4 rejects them.
    pub fn split(&self) -> (MsFlags, Option<String>) {
        let mut flags = MsFlags::empty();
        let mut data = Vec::new();
        let words = self.options.as_deref().unwrap_or_default().split(',');
        for word in words.map(str::trim).filter(|w| !w.is_empty()) {
            match word {
                "defaults" | "rw" | "auto" | "noauto" | "nofail" | "user" | "nouser" | "users"
                | "_netdev" => {}
                w if w.starts_with("x-") || w.starts_with("comment=") => {}
                "ro" => flags |= MsFlags::MS_RDONLY,
                "noatime" => flags |= MsFlags::MS_NOATIME,
                "nodiratime" => flags |= MsFlags::MS_NODIRATIME,
                "relatime" => flags |= MsFlags::MS_RELATIME,
                "nodev" => flags |= MsFlags::MS_NODEV,
                "nosuid" => flags |= MsFlags::MS_NOSUID,
                "noexec" => flags |= MsFlags::MS_NOEXEC,
                "sync" => flags |= MsFlags::MS_SYNCHRONOUS,
                other => data.push(other),
            }
        }
        (flags, (!data.is_empty()).then(|| data.join(",")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fstab_words_are_not_passed_to_the_kernel() {
        let (flags, data) = MountOptions::with_options("defaults,nofail,noatime").split();
        assert_eq!(flags, MsFlags::MS_NOATIME);
        assert_eq!(data, None);
    }

    #[test]
    fn filesystem_options_survive_as_data() {
        let (flags, data) =
            MountOptions::with_options("nodev, commit=60,x-systemd.device-timeout=5,errors=remount-ro")
                .split();
        assert_eq!(flags, MsFlags::MS_NODEV);
        assert_eq!(data.as_deref(), Some("commit=60,errors=remount-ro"));
        assert_eq!(MountOptions::default().split(), (MsFlags::empty(), None));
    }
}
