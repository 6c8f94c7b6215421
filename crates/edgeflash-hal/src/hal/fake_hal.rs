//! In-memory HAL for tests.
//!
//! Queries are answered from scripted state: the USB bus, network interfaces,
//! systemd units, block devices, filesystem signatures and a small in-memory
//! file table. Every call that would change the host is appended to an
//! [`Operation`] log instead.
//!
//! Clones share state, so a test can unplug the module from another thread
//! while the watchdog is polling.

use super::{
    CopyOps, CopyProgress, FlashOps, FlashOptions, FormatOps, FormatOptions,
    HostInfoOps, MountOps, MountOptions, NetOps, OsReleaseInfo, PartedOp, PartedOptions,
    PartitionOps, ProbeOps, ProcessOps, ServiceOps, SysfsOps, SystemOps, UsbId, UsbOps,
};
use crate::path::partition_path;
use crate::procfs::mountinfo;
use crate::{BlockDeviceInfo, HalError, HalResult};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Output};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// A host-changing call the fake accepted, in call order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    Mount {
        device: PathBuf,
        target: PathBuf,
        fstype: Option<String>,
    },
    Unmount {
        target: PathBuf,
    },
    FormatExt4 {
        device: PathBuf,
        label: String,
    },
    FlashImage {
        image: PathBuf,
        target: PathBuf,
    },
    Parted {
        disk: PathBuf,
        op: PartedOp,
    },
    CopyTree {
        src: PathBuf,
        dst: PathBuf,
    },
    Sync,
    UdevSettle,
    UdevReload,
    CreateDir {
        path: PathBuf,
    },
    AppendText {
        path: PathBuf,
        text: String,
    },
    WriteText {
        path: PathBuf,
    },
    WriteAttr {
        path: PathBuf,
        value: String,
    },
    SetOffload {
        iface: String,
        feature: String,
        enabled: bool,
    },
    StartUnit {
        unit: String,
    },
    StopUnit {
        unit: String,
    },
    Command {
        program: String,
        args: Vec<String>,
        timeout_secs: u64,
    },
}

#[derive(Debug, Clone, Default)]
struct CommandReply {
    code: i32,
    stdout: String,
    stderr: String,
}

#[derive(Debug, Default)]
struct FakeHalState {
    operations: Vec<Operation>,
    /// target -> device
    mounts: BTreeMap<PathBuf, PathBuf>,
    mountinfo: String,
    os_release: OsReleaseInfo,
    device_tree_model: Option<Vec<u8>>,
    usb_ids: Vec<UsbId>,
    interfaces: BTreeSet<String>,
    offloads: BTreeMap<String, BTreeMap<String, bool>>,
    services: BTreeMap<String, bool>,
    attrs: BTreeMap<PathBuf, String>,
    block_devices: Vec<BlockDeviceInfo>,
    aliases: BTreeMap<PathBuf, PathBuf>,
    fs_types: BTreeMap<PathBuf, String>,
    fs_labels: BTreeMap<PathBuf, String>,
    fs_uuids: BTreeMap<PathBuf, String>,
    pt_types: BTreeMap<PathBuf, String>,
    commands: HashMap<String, CommandReply>,
    missing_commands: BTreeSet<String>,
    free_bytes: Option<u64>,
    tree_sizes: BTreeMap<PathBuf, u64>,
    files: BTreeMap<PathBuf, String>,
    dirs: BTreeSet<PathBuf>,
    next_uuid: u32,
}

#[derive(Debug, Clone, Default)]
pub struct FakeHal {
    state: Arc<Mutex<FakeHalState>>,
}

impl FakeHal {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, FakeHalState> {
        // A panicking test thread must not wedge the others.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn operations(&self) -> Vec<Operation> {
        self.state().operations.clone()
    }

    pub fn operation_count(&self) -> usize {
        self.state().operations.len()
    }

    pub fn has_operation(&self, matches: impl Fn(&Operation) -> bool) -> bool {
        self.state().operations.iter().any(matches)
    }

    /// Recorded invocations of one external program, as argument vectors.
    pub fn commands_for(&self, program: &str) -> Vec<Vec<String>> {
        self.state()
            .operations
            .iter()
            .filter_map(|op| match op {
                Operation::Command { program: p, args, .. } if p == program => Some(args.clone()),
                _ => None,
            })
            .collect()
    }

    /// Clear all recorded operations (scripted state is kept).
    pub fn clear(&self) {
        self.state().operations.clear();
    }

    fn record(&self, op: Operation) {
        self.state().operations.push(op);
    }

    /// Gate shared by the destructive fakes. `Ok(false)` means dry run: log
    /// and record nothing.
    fn proceed(what: impl FnOnce() -> String, dry_run: bool, confirmed: bool) -> HalResult<bool> {
        if dry_run {
            log::info!("FAKE HAL DRY RUN: {}", what());
            return Ok(false);
        }
        if !confirmed {
            return Err(HalError::SafetyLock);
        }
        Ok(true)
    }

    pub fn set_usb_ids(&self, ids: Vec<UsbId>) {
        self.state().usb_ids = ids;
    }

    pub fn set_interface(&self, name: &str) {
        self.state().interfaces.insert(name.to_string());
    }

    pub fn set_offloads(&self, iface: &str, features: &[(&str, bool)]) {
        let map = features
            .iter()
            .map(|(name, on)| (name.to_string(), *on))
            .collect();
        self.state().offloads.insert(iface.to_string(), map);
    }

    pub fn offloads(&self, iface: &str) -> BTreeMap<String, bool> {
        self.state().offloads.get(iface).cloned().unwrap_or_default()
    }

    pub fn set_service(&self, unit: &str, active: bool) {
        self.state().services.insert(unit.to_string(), active);
    }

    pub fn service_active(&self, unit: &str) -> bool {
        self.state().services.get(unit).copied().unwrap_or(false)
    }

    pub fn set_attr(&self, path: impl Into<PathBuf>, value: &str) {
        self.state().attrs.insert(path.into(), value.to_string());
    }

    pub fn attr(&self, path: &Path) -> Option<String> {
        self.state().attrs.get(path).cloned()
    }

    pub fn set_mountinfo(&self, content: &str) {
        self.state().mountinfo = content.to_string();
    }

    pub fn set_os_release(&self, id: &str, version_id: &str) {
        self.state().os_release = OsReleaseInfo {
            id: Some(id.to_string()),
            version_id: Some(version_id.to_string()),
        };
    }

    pub fn set_device_tree_model(&self, raw: Option<&[u8]>) {
        self.state().device_tree_model = raw.map(<[u8]>::to_vec);
    }

    pub fn add_block_device(&self, info: BlockDeviceInfo) {
        let mut state = self.state();
        state.block_devices.retain(|d| d.name != info.name);
        state.block_devices.push(info);
        state.block_devices.sort_by(|a, b| a.name.cmp(&b.name));
    }

    /// Make `alias` (e.g. a `/dev/disk/by-id` path) resolve to `device`.
    pub fn add_alias(&self, alias: impl Into<PathBuf>, device: impl Into<PathBuf>) {
        self.state().aliases.insert(alias.into(), device.into());
    }

    /// Give a device or partition an existing filesystem signature.
    pub fn set_fs_signature(&self, device: impl Into<PathBuf>, fs_type: &str, label: &str, uuid: &str) {
        let device = device.into();
        let mut state = self.state();
        state.fs_types.insert(device.clone(), fs_type.to_string());
        if !label.is_empty() {
            state.fs_labels.insert(device.clone(), label.to_string());
        }
        state.fs_uuids.insert(device, uuid.to_string());
    }

    pub fn set_partition_table(&self, disk: impl Into<PathBuf>, pt_type: &str) {
        self.state().pt_types.insert(disk.into(), pt_type.to_string());
    }

    /// Script the reply of an external program (matched by program name).
    pub fn set_command_result(&self, program: &str, code: i32, stdout: &str) {
        self.state().commands.insert(
            program.to_string(),
            CommandReply {
                code,
                stdout: stdout.to_string(),
                stderr: if code == 0 { String::new() } else { format!("{program} failed") },
            },
        );
    }

    /// Make an external program look absent from `PATH`.
    pub fn set_command_missing(&self, program: &str) {
        self.state().missing_commands.insert(program.to_string());
    }

    pub fn set_free_bytes(&self, bytes: u64) {
        self.state().free_bytes = Some(bytes);
    }

    pub fn set_tree_size(&self, path: impl Into<PathBuf>, bytes: u64) {
        self.state().tree_sizes.insert(path.into(), bytes);
    }

    /// Seed a file, e.g. an image-baked `/etc/fstab`.
    pub fn set_file(&self, path: impl Into<PathBuf>, content: &str) {
        self.state().files.insert(path.into(), content.to_string());
    }

    pub fn file(&self, path: &Path) -> Option<String> {
        self.state().files.get(path).cloned()
    }

    pub fn remove_file(&self, path: &Path) {
        self.state().files.remove(path);
    }

    pub fn dir_exists(&self, path: &Path) -> bool {
        self.state().dirs.contains(path)
    }

    /// Filesystem type currently recorded for a device.
    pub fn fs_signature(&self, device: &Path) -> Option<(String, String)> {
        let state = self.state();
        let fs_type = state.fs_types.get(device)?.clone();
        let uuid = state.fs_uuids.get(device).cloned().unwrap_or_default();
        Some((fs_type, uuid))
    }

    fn disk_of<'a>(state: &'a mut FakeHalState, disk: &Path) -> Option<&'a mut BlockDeviceInfo> {
        state.block_devices.iter_mut().find(|d| d.dev_path == disk)
    }
}

impl HostInfoOps for FakeHal {
    fn os_release(&self) -> HalResult<OsReleaseInfo> {
        Ok(self.state().os_release.clone())
    }

    fn proc_mountinfo(&self) -> HalResult<String> {
        Ok(self.state().mountinfo.clone())
    }

    fn device_tree_model(&self) -> HalResult<Option<Vec<u8>>> {
        Ok(self.state().device_tree_model.clone())
    }

    fn read_text(&self, path: &Path) -> HalResult<Option<String>> {
        Ok(self.file(path))
    }
}

impl ProcessOps for FakeHal {
    fn command_output_with_cwd(
        &self,
        program: &str,
        args: &[&str],
        _cwd: Option<&Path>,
        timeout: Duration,
    ) -> HalResult<Output> {
        let mut state = self.state();
        state.operations.push(Operation::Command {
            program: program.to_string(),
            args: args.iter().map(ToString::to_string).collect(),
            timeout_secs: timeout.as_secs(),
        });
        if state.missing_commands.contains(program) {
            return Err(HalError::CommandNotFound(program.to_string()));
        }

        let reply = state.commands.get(program).cloned().unwrap_or_default();
        // Wait status layout: exit code in the second byte.
        Ok(Output {
            status: ExitStatus::from_raw(reply.code << 8),
            stdout: reply.stdout.into_bytes(),
            stderr: reply.stderr.into_bytes(),
        })
    }

    fn command_status_with_cwd(
        &self,
        program: &str,
        args: &[&str],
        cwd: Option<&Path>,
        timeout: Duration,
    ) -> HalResult<()> {
        let output = self.command_output_with_cwd(program, args, cwd, timeout)?;
        match output.status.code() {
            Some(0) => Ok(()),
            code => Err(HalError::CommandFailed {
                program: program.to_string(),
                code,
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            }),
        }
    }
}

impl MountOps for FakeHal {
    fn mount_device(
        &self,
        device: &Path,
        target: &Path,
        fstype: Option<&str>,
        _options: MountOptions,
        dry_run: bool,
    ) -> HalResult<()> {
        let what = || format!("mount {} on {}", device.display(), target.display());
        if !Self::proceed(what, dry_run, true)? {
            return Ok(());
        }
        let mut state = self.state();
        state.operations.push(Operation::Mount {
            device: device.to_path_buf(),
            target: target.to_path_buf(),
            fstype: fstype.map(String::from),
        });
        state.mounts.insert(target.to_path_buf(), device.to_path_buf());
        Ok(())
    }

    fn unmount(&self, target: &Path, dry_run: bool) -> HalResult<()> {
        if !Self::proceed(|| format!("umount {}", target.display()), dry_run, true)? {
            return Ok(());
        }
        let mut state = self.state();
        state.operations.push(Operation::Unmount {
            target: target.to_path_buf(),
        });
        state.mounts.remove(target);
        Ok(())
    }

    fn is_mounted(&self, path: &Path) -> HalResult<bool> {
        let state = self.state();
        if state.mounts.contains_key(path) {
            return Ok(true);
        }
        let entries = mountinfo::parse_mountinfo(&state.mountinfo);
        Ok(mountinfo::is_mounted_from_info(path, &entries))
    }

    fn mountpoints_on(&self, disk: &Path) -> HalResult<Vec<PathBuf>> {
        let state = self.state();
        let disk_str = disk.to_string_lossy();
        let entries = mountinfo::parse_mountinfo(&state.mountinfo);
        let mut points = mountinfo::mounted_under_device(&entries, disk);
        points.extend(
            state
                .mounts
                .iter()
                .filter(|(_, dev)| mountinfo::source_on_disk(&dev.to_string_lossy(), &disk_str))
                .map(|(target, _)| target.clone()),
        );
        points.sort();
        points.dedup();
        Ok(points)
    }
}

impl FormatOps for FakeHal {
    fn format_ext4(&self, device: &Path, label: &str, opts: &FormatOptions) -> HalResult<()> {
        let what = || format!("mkfs.ext4 -L {label} {}", device.display());
        if !Self::proceed(what, opts.dry_run, opts.confirmed)? {
            return Ok(());
        }
        let mut state = self.state();
        state.operations.push(Operation::FormatExt4 {
            device: device.to_path_buf(),
            label: label.to_string(),
        });
        state.next_uuid += 1;
        let uuid = format!("00000000-0000-4000-8000-{:012x}", state.next_uuid);
        state.fs_types.insert(device.to_path_buf(), "ext4".to_string());
        state.fs_labels.insert(device.to_path_buf(), label.to_string());
        state.fs_uuids.insert(device.to_path_buf(), uuid);
        Ok(())
    }
}

impl FlashOps for FakeHal {
    fn flash_raw_image(
        &self,
        image_path: &Path,
        target_disk: &Path,
        opts: &FlashOptions,
    ) -> HalResult<()> {
        let what = || format!("write {} to {}", image_path.display(), target_disk.display());
        if !Self::proceed(what, opts.dry_run, opts.confirmed)? {
            return Ok(());
        }
        self.record(Operation::FlashImage {
            image: image_path.to_path_buf(),
            target: target_disk.to_path_buf(),
        });
        Ok(())
    }
}

impl PartitionOps for FakeHal {
    fn parted(&self, disk: &Path, op: PartedOp, opts: &PartedOptions) -> HalResult<String> {
        if op.is_destructive() {
            let what = || format!("parted -s {} {}", disk.display(), op.script().join(" "));
            if !Self::proceed(what, opts.dry_run, opts.confirmed)? {
                return Ok(String::new());
            }
        }

        let mut state = self.state();
        state.operations.push(Operation::Parted {
            disk: disk.to_path_buf(),
            op: op.clone(),
        });
        match op {
            PartedOp::MkLabel { label } => {
                state.pt_types.insert(disk.to_path_buf(), label);
                if let Some(info) = Self::disk_of(&mut state, disk) {
                    info.partitions.clear();
                }
            }
            PartedOp::MkPart { .. } => {
                let Some(info) = Self::disk_of(&mut state, disk) else {
                    return Err(HalError::NoSuchDevice(disk.to_path_buf()));
                };
                let num = info.partitions.len() as u32 + 1;
                info.partitions
                    .push(PathBuf::from(partition_path(&disk.to_string_lossy(), num)));
            }
            PartedOp::Print => {}
        }
        Ok(String::new())
    }
}

impl CopyOps for FakeHal {
    fn copy_tree(
        &self,
        src: &Path,
        dst: &Path,
        on_progress: &mut dyn FnMut(CopyProgress) -> bool,
    ) -> HalResult<()> {
        self.record(Operation::CopyTree {
            src: src.to_path_buf(),
            dst: dst.to_path_buf(),
        });
        let total = self.tree_size(src)?;
        if !on_progress(CopyProgress { done: total, total }) {
            return Err(HalError::CopyCancelled(src.to_path_buf()));
        }
        Ok(())
    }

    fn tree_size(&self, path: &Path) -> HalResult<u64> {
        Ok(self.state().tree_sizes.get(path).copied().unwrap_or(0))
    }
}

impl SystemOps for FakeHal {
    fn sync(&self) -> HalResult<()> {
        self.record(Operation::Sync);
        Ok(())
    }

    fn udev_settle(&self) -> HalResult<()> {
        self.record(Operation::UdevSettle);
        Ok(())
    }

    fn udev_reload(&self) -> HalResult<()> {
        self.record(Operation::UdevReload);
        Ok(())
    }

    fn free_bytes(&self, _path: &Path) -> HalResult<u64> {
        Ok(self.state().free_bytes.unwrap_or(u64::MAX))
    }

    fn create_dir_all(&self, path: &Path, dry_run: bool) -> HalResult<()> {
        if !Self::proceed(|| format!("mkdir -p {}", path.display()), dry_run, true)? {
            return Ok(());
        }
        let mut state = self.state();
        state.operations.push(Operation::CreateDir {
            path: path.to_path_buf(),
        });
        state.dirs.extend(path.ancestors().map(Path::to_path_buf));
        Ok(())
    }

    fn append_text(&self, path: &Path, text: &str, dry_run: bool) -> HalResult<()> {
        if !Self::proceed(|| format!("append to {}", path.display()), dry_run, true)? {
            return Ok(());
        }
        let mut state = self.state();
        state.operations.push(Operation::AppendText {
            path: path.to_path_buf(),
            text: text.to_string(),
        });
        state.files.entry(path.to_path_buf()).or_default().push_str(text);
        Ok(())
    }

    fn write_text(&self, path: &Path, text: &str, dry_run: bool) -> HalResult<()> {
        if !Self::proceed(|| format!("write {}", path.display()), dry_run, true)? {
            return Ok(());
        }
        let mut state = self.state();
        state.operations.push(Operation::WriteText {
            path: path.to_path_buf(),
        });
        state.files.insert(path.to_path_buf(), text.to_string());
        Ok(())
    }
}

impl SysfsOps for FakeHal {
    fn read_attr(&self, path: &Path) -> HalResult<String> {
        self.state().attrs.get(path).cloned().ok_or_else(|| {
            HalError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                path.display().to_string(),
            ))
        })
    }

    fn write_attr(&self, path: &Path, value: &str) -> HalResult<()> {
        self.record(Operation::WriteAttr {
            path: path.to_path_buf(),
            value: value.to_string(),
        });
        self.state()
            .attrs
            .insert(path.to_path_buf(), value.to_string());
        Ok(())
    }
}

impl UsbOps for FakeHal {
    fn usb_ids(&self, vendor: Option<u16>) -> HalResult<Vec<UsbId>> {
        Ok(self
            .state()
            .usb_ids
            .iter()
            .copied()
            .filter(|id| vendor.map_or(true, |v| id.vendor == v))
            .collect())
    }
}

impl NetOps for FakeHal {
    fn interfaces(&self) -> HalResult<Vec<String>> {
        Ok(self.state().interfaces.iter().cloned().collect())
    }

    fn offload_features(&self, iface: &str) -> HalResult<BTreeMap<String, bool>> {
        Ok(self.offloads(iface))
    }

    fn set_offload(&self, iface: &str, feature: &str, enabled: bool) -> HalResult<()> {
        self.record(Operation::SetOffload {
            iface: iface.to_string(),
            feature: feature.to_string(),
            enabled,
        });
        self.state()
            .offloads
            .entry(iface.to_string())
            .or_default()
            .insert(feature.to_string(), enabled);
        Ok(())
    }
}

impl ServiceOps for FakeHal {
    fn unit_active(&self, unit: &str) -> HalResult<bool> {
        Ok(self.service_active(unit))
    }

    fn start_unit(&self, unit: &str) -> HalResult<()> {
        self.record(Operation::StartUnit {
            unit: unit.to_string(),
        });
        self.set_service(unit, true);
        Ok(())
    }

    fn stop_unit(&self, unit: &str) -> HalResult<()> {
        self.record(Operation::StopUnit {
            unit: unit.to_string(),
        });
        self.set_service(unit, false);
        Ok(())
    }
}

impl ProbeOps for FakeHal {
    fn block_devices(&self) -> HalResult<Vec<BlockDeviceInfo>> {
        Ok(self.state().block_devices.clone())
    }

    fn parent_disk(&self, device: &Path) -> HalResult<Option<PathBuf>> {
        let resolved = self.resolve_device(device)?;
        Ok(self
            .state()
            .block_devices
            .iter()
            .find(|d| d.partitions.contains(&resolved))
            .map(|d| d.dev_path.clone()))
    }

    fn resolve_device(&self, source: &Path) -> HalResult<PathBuf> {
        Ok(self
            .state()
            .aliases
            .get(source)
            .cloned()
            .unwrap_or_else(|| source.to_path_buf()))
    }

    fn stable_alias(&self, device: &Path) -> HalResult<Option<PathBuf>> {
        Ok(self
            .state()
            .aliases
            .iter()
            .find(|(alias, target)| {
                target.as_path() == device && alias.starts_with("/dev/disk/by-id")
            })
            .map(|(alias, _)| alias.clone()))
    }

    fn fs_type(&self, device: &Path) -> HalResult<Option<String>> {
        Ok(self.state().fs_types.get(device).cloned())
    }

    fn fs_label(&self, device: &Path) -> HalResult<Option<String>> {
        Ok(self.state().fs_labels.get(device).cloned())
    }

    fn partition_table_type(&self, disk: &Path) -> HalResult<Option<String>> {
        Ok(self.state().pt_types.get(disk).cloned())
    }

    fn blkid_uuid(&self, device: &Path) -> HalResult<String> {
        self.state()
            .fs_uuids
            .get(device)
            .cloned()
            .ok_or_else(|| HalError::CommandFailed {
                program: "blkid".to_string(),
                code: Some(2),
                stderr: String::new(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Transport;

    #[test]
    fn fake_hal_records_mount_and_unmount() {
        let hal = FakeHal::new();
        let target = Path::new("/data");

        hal.mount_device(
            Path::new("/dev/nvme1n1p1"),
            target,
            Some("ext4"),
            MountOptions::default(),
            false,
        )
        .unwrap();
        assert!(hal.is_mounted(target).unwrap());
        assert_eq!(
            hal.mountpoints_on(Path::new("/dev/nvme1n1")).unwrap(),
            vec![PathBuf::from("/data")]
        );

        hal.unmount(target, false).unwrap();
        assert_eq!(hal.operation_count(), 2);
        assert!(!hal.is_mounted(target).unwrap());
    }

    #[test]
    fn fake_hal_requires_confirmation() {
        let hal = FakeHal::new();
        let err = hal
            .format_ext4(Path::new("/dev/sda1"), "EDGEDATA", &FormatOptions::new(false, false))
            .unwrap_err();
        assert!(matches!(err, HalError::SafetyLock));

        let err = hal
            .flash_raw_image(
                Path::new("/tmp/image.img"),
                Path::new("/dev/sda"),
                &FlashOptions::new(false, false),
            )
            .unwrap_err();
        assert!(matches!(err, HalError::SafetyLock));
        assert_eq!(hal.operation_count(), 0);
    }

    #[test]
    fn format_ext4_creates_signature() {
        let hal = FakeHal::new();
        let dev = Path::new("/dev/nvme1n1p1");
        hal.format_ext4(dev, "EDGEDATA", &FormatOptions::new(false, true))
            .unwrap();
        assert_eq!(hal.fs_type(dev).unwrap().as_deref(), Some("ext4"));
        assert_eq!(hal.fs_label(dev).unwrap().as_deref(), Some("EDGEDATA"));
        assert!(!hal.blkid_uuid(dev).unwrap().is_empty());
    }

    #[test]
    fn parted_mkpart_adds_partition_to_disk() {
        let hal = FakeHal::new();
        hal.add_block_device(BlockDeviceInfo::new("nvme1n1", 1 << 40, Transport::Nvme));
        let disk = Path::new("/dev/nvme1n1");
        let opts = PartedOptions::new(false, true);

        hal.parted(disk, PartedOp::MkLabel { label: "gpt".into() }, &opts)
            .unwrap();
        hal.parted(
            disk,
            PartedOp::MkPart {
                name: "data".into(),
                fs_type: "ext4".into(),
                start: "0%".into(),
                end: "100%".into(),
            },
            &opts,
        )
        .unwrap();

        assert_eq!(hal.partition_table_type(disk).unwrap().as_deref(), Some("gpt"));
        assert_eq!(
            hal.parent_disk(Path::new("/dev/nvme1n1p1")).unwrap(),
            Some(disk.to_path_buf())
        );
    }

    #[test]
    fn scripted_commands_fail_and_go_missing() {
        let hal = FakeHal::new();
        hal.set_command_result("ssh", 255, "");
        hal.set_command_missing("ethtool");

        let err = hal
            .command_status("ssh", &["root@fc00:1:1::1", "true"], Duration::from_secs(1))
            .unwrap_err();
        assert!(matches!(err, HalError::CommandFailed { code: Some(255), .. }));

        let err = hal
            .command_output("ethtool", &["-k", "usb0"], Duration::from_secs(1))
            .unwrap_err();
        assert!(matches!(err, HalError::CommandNotFound(_)));
        assert_eq!(hal.commands_for("ssh").len(), 1);
    }

    #[test]
    fn file_writes_are_recorded_unless_dry_run() {
        let hal = FakeHal::new();
        let table = Path::new("/etc/fstab");
        hal.set_file(table, "UUID=aaaa  /  ext4  defaults  0  1\n");

        hal.append_text(table, "UUID=bbbb  /data  ext4  defaults  0  2\n", true).unwrap();
        hal.create_dir_all(Path::new("/data"), true).unwrap();
        assert_eq!(hal.operation_count(), 0);

        hal.append_text(table, "UUID=bbbb  /data  ext4  defaults  0  2\n", false).unwrap();
        hal.create_dir_all(Path::new("/var/lib/edgeflash"), false).unwrap();
        hal.write_text(Path::new("/var/lib/edgeflash/firstboot.done"), "", false).unwrap();

        assert_eq!(hal.read_text(table).unwrap().unwrap().lines().count(), 2);
        assert!(hal.dir_exists(Path::new("/var/lib")));
        assert!(hal.has_operation(|op| matches!(op, Operation::WriteText { path } if path.ends_with("firstboot.done"))));
        assert_eq!(hal.operation_count(), 3);
        assert_eq!(hal.read_text(Path::new("/etc/hosts")).unwrap(), None);
    }

    #[test]
    fn clones_share_state() {
        let hal = FakeHal::new();
        let other = hal.clone();
        other.set_usb_ids(vec![UsbId::new(0x0955, 0x7523)]);
        assert_eq!(hal.usb_ids(Some(0x0955)).unwrap().len(), 1);
        assert!(hal.usb_ids(Some(0x1d6b)).unwrap().is_empty());
    }
}
