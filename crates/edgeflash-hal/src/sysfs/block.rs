//! Block device discovery from sysfs.

use crate::HalResult;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

/// Bus a block device is attached through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Usb,
    Nvme,
    Sata,
    Mmc,
    Scsi,
    Virtual,
    Unknown,
}

impl Transport {
    pub fn hint(&self) -> &'static str {
        match self {
            Transport::Usb => "usb",
            Transport::Nvme => "nvme",
            Transport::Sata => "sata",
            Transport::Mmc => "mmc",
            Transport::Scsi => "scsi",
            Transport::Virtual => "virtual",
            Transport::Unknown => "unknown",
        }
    }

    /// Removable-class transports; everything else is treated as internal.
    pub fn is_usb(&self) -> bool {
        matches!(self, Transport::Usb)
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.hint())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockDeviceInfo {
    /// Kernel name, e.g. `nvme0n1`.
    pub name: String,
    pub dev_path: PathBuf,
    pub size_bytes: u64,
    pub vendor: Option<String>,
    pub model: Option<String>,
    pub serial: Option<String>,
    pub transport: Transport,
    pub removable: bool,
    /// Partition device nodes, e.g. `/dev/nvme0n1p1`.
    pub partitions: Vec<PathBuf>,
}

impl BlockDeviceInfo {
    /// Minimal record, mostly useful for tests and fakes.
    pub fn new(name: &str, size_bytes: u64, transport: Transport) -> Self {
        Self {
            name: name.to_string(),
            dev_path: PathBuf::from("/dev").join(name),
            size_bytes,
            vendor: None,
            model: None,
            serial: None,
            transport,
            removable: transport.is_usb(),
            partitions: Vec::new(),
        }
    }
}

/// Reads the block device size from `<sysfs dir>/size` (512-byte sectors).
pub fn block_device_size_bytes(sys_block_dev_dir: &Path) -> HalResult<u64> {
    let sectors_str = fs::read_to_string(sys_block_dev_dir.join("size"))?;
    let sectors: u64 = sectors_str
        .trim()
        .parse()
        .map_err(|e| crate::HalError::Parse(format!("sector count: {e}")))?;
    Ok(sectors.saturating_mul(512))
}

pub fn scan_block_devices() -> HalResult<Vec<BlockDeviceInfo>> {
    scan_block_devices_in(Path::new("/sys/block"))
}

pub fn scan_block_devices_in(sys_block_root: &Path) -> HalResult<Vec<BlockDeviceInfo>> {
    let mut out = Vec::new();
    for entry in fs::read_dir(sys_block_root)?.flatten() {
        let name = entry.file_name().to_string_lossy().to_string();
        if should_skip_block_device(&name) {
            continue;
        }
        let sysfs_path = sys_block_root.join(&name);
        // Empty card readers report size 0.
        let Ok(size_bytes @ 1..) = block_device_size_bytes(&sysfs_path) else {
            continue;
        };
        let removable = read_trimmed(sysfs_path.join("removable")).as_deref() == Some("1");

        out.push(BlockDeviceInfo {
            dev_path: PathBuf::from("/dev").join(&name),
            size_bytes,
            vendor: read_trimmed(sysfs_path.join("device/vendor")),
            model: read_trimmed(sysfs_path.join("device/model")),
            serial: read_trimmed(sysfs_path.join("device/serial"))
                .or_else(|| read_trimmed(sysfs_path.join("serial"))),
            transport: detect_transport(&name, &sysfs_path),
            removable,
            partitions: scan_partitions(&sysfs_path),
            name,
        });
    }
    out.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(out)
}

/// Partitions show up as child directories carrying a `partition` attribute.
fn scan_partitions(sysfs_path: &Path) -> Vec<PathBuf> {
    let mut parts: Vec<PathBuf> = fs::read_dir(sysfs_path)
        .map(|entries| {
            entries
                .flatten()
                .filter(|e| e.path().join("partition").exists())
                .map(|e| PathBuf::from("/dev").join(e.file_name()))
                .collect()
        })
        .unwrap_or_default();
    parts.sort();
    parts
}

fn detect_transport(dev_name: &str, sysfs_base: &Path) -> Transport {
    // The resolved device link names the bus path, e.g.
    // ../devices/pci0000:00/.../usb2/2-1/2-1:1.0/host0/... for USB mass storage.
    let link = fs::read_link(sysfs_base)
        .or_else(|_| fs::read_link(sysfs_base.join("device")))
        .map(|p| p.to_string_lossy().to_lowercase())
        .unwrap_or_default();

    if link.contains("/usb") {
        return Transport::Usb;
    }
    if link.contains("/virtual/") {
        return Transport::Virtual;
    }
    if dev_name.starts_with("nvme") {
        return Transport::Nvme;
    }
    if dev_name.starts_with("mmcblk") {
        return Transport::Mmc;
    }
    if dev_name.starts_with("sd") {
        if link.contains("ata") {
            return Transport::Sata;
        }
        return Transport::Scsi;
    }
    Transport::Unknown
}

fn read_trimmed(path: PathBuf) -> Option<String> {
    fs::read_to_string(path)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Kernel name prefixes of devices that are never provisioning targets.
const VIRTUAL_PREFIXES: &[&str] = &["loop", "ram", "zram", "dm-", "md", "sr", "nbd"];

/// Virtual devices, optical drives and eMMC hardware partitions
/// (`mmcblk0boot0`, `mmcblk0rpmb`).
fn should_skip_block_device(name: &str) -> bool {
    VIRTUAL_PREFIXES.iter().any(|p| name.starts_with(p))
        || (name.starts_with("mmcblk") && (name.contains("boot") || name.contains("rpmb")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn block_device_size_bytes_reads_sectors() {
        let tmp = tempdir().unwrap();
        fs::write(tmp.path().join("size"), "8\n").unwrap();
        assert_eq!(block_device_size_bytes(tmp.path()).unwrap(), 4096);
    }

    #[test]
    fn scan_block_devices_in_skips_virtual_and_reads_partitions() {
        let tmp = tempdir().unwrap();
        fs::create_dir_all(tmp.path().join("nvme0n1/nvme0n1p1")).unwrap();
        fs::write(tmp.path().join("nvme0n1/size"), "8\n").unwrap();
        fs::write(tmp.path().join("nvme0n1/nvme0n1p1/partition"), "1\n").unwrap();
        fs::create_dir_all(tmp.path().join("nvme0n1/queue")).unwrap();
        fs::create_dir_all(tmp.path().join("loop0")).unwrap();
        fs::write(tmp.path().join("loop0/size"), "8\n").unwrap();
        fs::create_dir_all(tmp.path().join("mmcblk0boot0")).unwrap();
        fs::write(tmp.path().join("mmcblk0boot0/size"), "8\n").unwrap();

        let disks = scan_block_devices_in(tmp.path()).unwrap();
        assert_eq!(disks.len(), 1);
        assert_eq!(disks[0].name, "nvme0n1");
        assert_eq!(disks[0].size_bytes, 4096);
        assert_eq!(disks[0].transport, Transport::Nvme);
        assert_eq!(disks[0].partitions, vec![PathBuf::from("/dev/nvme0n1p1")]);
    }

    #[test]
    fn zero_sized_devices_are_skipped() {
        let tmp = tempdir().unwrap();
        fs::create_dir_all(tmp.path().join("sdb")).unwrap();
        fs::write(tmp.path().join("sdb/size"), "0\n").unwrap();
        assert!(scan_block_devices_in(tmp.path()).unwrap().is_empty());
    }
}
