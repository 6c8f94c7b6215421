//! Device enumerator: storage devices the host can see, and which one backs `/`.

use anyhow::{Context, Result};
use edgeflash_hal::procfs::mountinfo;
use edgeflash_hal::{BlockDeviceInfo, HostInfoOps, ProbeOps, Transport};
use std::fmt;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceRole {
    /// Is, or holds a partition that is, the running root filesystem.
    RootBacking,
    /// Eligible for selection.
    Candidate,
}

impl fmt::Display for DeviceRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DeviceRole::RootBacking => "root",
            DeviceRole::Candidate => "candidate",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Device {
    pub name: String,
    pub path: PathBuf,
    pub alias: Option<PathBuf>,
    pub transport: Transport,
    pub removable: bool,
    pub role: DeviceRole,
    pub size_bytes: u64,
    pub model: Option<String>,
    pub serial: Option<String>,
    pub partitions: Vec<PathBuf>,
    /// Filesystem labels found on the disk or its partitions.
    pub labels: Vec<String>,
}

impl Device {
    pub fn is_usb(&self) -> bool {
        self.transport.is_usb()
    }

    /// One-line summary for listings and prompts.
    pub fn summary(&self) -> String {
        let mut s = format!(
            "{:<10} {:>9}  {:<7}",
            self.name,
            human_size(self.size_bytes),
            self.transport
        );
        if self.removable {
            s.push_str(" removable");
        }
        let ident = [self.model.as_deref(), self.serial.as_deref()]
            .into_iter()
            .flatten()
            .collect::<Vec<_>>()
            .join(" ");
        if !ident.is_empty() {
            s.push_str(&format!("  {}", ident));
        }
        if !self.labels.is_empty() {
            s.push_str(&format!("  [{}]", self.labels.join(", ")));
        }
        s
    }
}

#[derive(Debug, Clone, Default)]
pub struct Inventory {
    pub devices: Vec<Device>,
    /// Whole disk backing `/`, when it could be resolved.
    pub root_disk: Option<PathBuf>,
}

impl Inventory {
    pub fn candidates(&self) -> Vec<&Device> {
        self.devices
            .iter()
            .filter(|d| d.role == DeviceRole::Candidate)
            .collect()
    }

    pub fn find(&self, name_or_path: &str) -> Option<&Device> {
        let wanted = name_or_path.trim();
        let wanted = wanted.strip_prefix("/dev/").unwrap_or(wanted);
        self.devices.iter().find(|d| d.name == wanted)
    }
}

pub fn human_size(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} {}", bytes, UNITS[0])
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}

/// Resolve the whole disk that backs the live root filesystem.
///
/// `None` when `/` is not on a block device we can name (overlay, tmpfs, NFS).
pub fn root_disk<H: ProbeOps + HostInfoOps + ?Sized>(hal: &H) -> Result<Option<PathBuf>> {
    let content = hal
        .proc_mountinfo()
        .context("failed to read mount table")?;
    let entries = mountinfo::parse_mountinfo(&content);
    let Some(source) = mountinfo::root_mount_source(&entries) else {
        return Ok(None);
    };
    if !source.starts_with('/') {
        log::debug!("root is mounted from {source}, not a block device");
        return Ok(None);
    }
    let device = hal
        .resolve_device(Path::new(&source))
        .with_context(|| format!("failed to resolve root source {source}"))?;
    let disk = hal
        .parent_disk(&device)
        .with_context(|| format!("failed to find the disk holding {}", device.display()))?
        .unwrap_or(device);
    Ok(Some(disk))
}

/// Enumerate storage devices and classify them. Read-only.
pub fn scan<H: ProbeOps + HostInfoOps + ?Sized>(hal: &H) -> Result<Inventory> {
    let root_disk = root_disk(hal)?;
    let infos = hal.block_devices().context("failed to list block devices")?;
    let devices = infos
        .into_iter()
        .map(|info| classify(hal, info, root_disk.as_deref()))
        .collect();
    Ok(Inventory { devices, root_disk })
}

fn classify<H: ProbeOps + ?Sized>(hal: &H, info: BlockDeviceInfo, root: Option<&Path>) -> Device {
    let role = if root == Some(info.dev_path.as_path()) {
        DeviceRole::RootBacking
    } else {
        DeviceRole::Candidate
    };

    // Labels are informational; a failed probe just shows fewer of them.
    let labels = std::iter::once(&info.dev_path)
        .chain(info.partitions.iter())
        .filter_map(|p| hal.fs_label(p).ok().flatten())
        .collect();
    let alias = hal.stable_alias(&info.dev_path).ok().flatten();

    Device {
        name: info.name,
        path: info.dev_path,
        alias,
        transport: info.transport,
        removable: info.removable,
        role,
        size_bytes: info.size_bytes,
        model: info.model,
        serial: info.serial,
        partitions: info.partitions,
        labels,
    }
}
