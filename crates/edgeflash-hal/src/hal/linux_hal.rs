//! The HAL backed by the running Linux host.
//!
//! Short-lived tools (`blkid`, `parted`, `ethtool`, `udevadm`) run with a
//! timeout and captured output. Mounts and `sync` go straight to the kernel
//! through nix, and unit control goes to systemd over D-Bus.

use super::{
    CopyOps, CopyProgress, FlashOps, FlashOptions, FormatOps, FormatOptions, HostInfoOps,
    MountOps, MountOptions, NetOps, OsReleaseInfo, PartedOp, PartedOptions, PartitionOps,
    ProbeOps, ProcessOps, ServiceOps, SysfsOps, SystemOps, UsbId, UsbOps,
};
use crate::procfs::mountinfo;
use crate::sysfs::{block, usb};
use crate::{BlockDeviceInfo, HalError, HalResult};
use nix::errno::Errno;
use nix::mount::MntFlags;
use std::collections::BTreeMap;
use std::fs;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Output, Stdio};
use std::thread;
use std::time::Duration;
use wait_timeout::ChildExt;
use walkdir::WalkDir;
use zbus::blocking::{Connection, Proxy};
use zbus::zvariant::OwnedObjectPath;

#[derive(Debug, Clone, Default)]
pub struct LinuxHal;

impl LinuxHal {
    pub fn new() -> Self {
        Self
    }
}

const PROBE_TIMEOUT: Duration = Duration::from_secs(10);
const UDEV_TIMEOUT: Duration = Duration::from_secs(60);
const MKFS_TIMEOUT: Duration = Duration::from_secs(10 * 60);
const PARTED_TIMEOUT: Duration = Duration::from_secs(5 * 60);
const ETHTOOL_TIMEOUT: Duration = Duration::from_secs(10);

/// Image writes go through a buffer this size; NVMe and USB sticks both
/// stall on small writes.
const WRITE_CHUNK: usize = 4 << 20;

const SYSTEMD_DESTINATION: &str = "org.freedesktop.systemd1";
const SYSTEMD_PATH: &str = "/org/freedesktop/systemd1";
const SYSTEMD_MANAGER: &str = "org.freedesktop.systemd1.Manager";
const SYSTEMD_UNIT: &str = "org.freedesktop.systemd1.Unit";

const DEVICE_TREE_MODEL: &str = "/proc/device-tree/model";
const DISK_BY_ID: &str = "/dev/disk/by-id";

fn io_error(err: io::Error) -> HalError {
    match err.kind() {
        io::ErrorKind::PermissionDenied => HalError::PermissionDenied,
        _ => HalError::Io(err),
    }
}

fn spawn_error(program: &str, err: io::Error) -> HalError {
    match err.kind() {
        io::ErrorKind::NotFound => HalError::CommandNotFound(program.to_string()),
        _ => HalError::Io(err),
    }
}

fn errno(err: Errno) -> HalError {
    match err {
        Errno::EBUSY => HalError::DiskBusy,
        Errno::EACCES | Errno::EPERM => HalError::PermissionDenied,
        other => HalError::Nix(other),
    }
}

fn drain(pipe: Option<impl Read>) -> Vec<u8> {
    let mut buf = Vec::new();
    if let Some(mut pipe) = pipe {
        let _ = pipe.read_to_end(&mut buf);
    }
    buf
}

/// Run `cmd` to completion, killing it once `timeout` passes. Both pipes are
/// drained on their own threads so a chatty tool cannot wedge on a full pipe.
fn run_captured(program: &str, cmd: &mut Command, timeout: Duration) -> HalResult<Output> {
    let mut child = cmd
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| spawn_error(program, e))?;
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();

    thread::scope(|s| {
        let out = s.spawn(move || drain(stdout));
        let err = s.spawn(move || drain(stderr));

        let status = match child.wait_timeout(timeout) {
            Ok(Some(status)) => Ok(status),
            Ok(None) => Err(HalError::CommandTimeout {
                program: program.to_string(),
                timeout_secs: timeout.as_secs(),
            }),
            Err(e) => Err(HalError::Io(e)),
        };
        if status.is_err() {
            let _ = child.kill();
            let _ = child.wait();
        }

        let stdout = out.join().unwrap_or_default();
        let stderr = err.join().unwrap_or_default();
        status.map(|status| Output {
            status,
            stdout,
            stderr,
        })
    })
}

/// Like [`run_captured`], but a non-zero exit is an error.
fn run_checked(program: &str, cmd: &mut Command, timeout: Duration) -> HalResult<Output> {
    let output = run_captured(program, cmd, timeout)?;
    if output.status.success() {
        return Ok(output);
    }
    Err(HalError::CommandFailed {
        program: program.to_string(),
        code: output.status.code(),
        stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
    })
}

fn stdout_text(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).trim().to_string()
}

/// One blkid tag in low-level probe mode. blkid exits 2 when the tag is absent.
fn blkid_tag(device: &Path, tag: &str) -> HalResult<Option<String>> {
    let mut cmd = Command::new("blkid");
    cmd.args(["-p", "-s", tag, "-o", "value"]).arg(device);
    let output = run_captured("blkid", &mut cmd, PROBE_TIMEOUT)?;
    match output.status.code() {
        Some(2) => Ok(None),
        Some(0) => Ok(Some(stdout_text(&output)).filter(|v| !v.is_empty())),
        code => Err(HalError::CommandFailed {
            program: "blkid".to_string(),
            code,
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        }),
    }
}

fn kernel_name(device: &Path) -> HalResult<String> {
    device
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| HalError::NoSuchDevice(device.to_path_buf()))
}

fn systemd(conn: &Connection) -> HalResult<Proxy<'_>> {
    Ok(Proxy::new(
        conn,
        SYSTEMD_DESTINATION,
        SYSTEMD_PATH,
        SYSTEMD_MANAGER,
    )?)
}

fn image_reader(image: &Path) -> HalResult<Box<dyn Read>> {
    let file = BufReader::with_capacity(WRITE_CHUNK, fs::File::open(image)?);
    if image.extension().is_some_and(|e| e == "xz") {
        Ok(Box::new(xz2::bufread::XzDecoder::new(file)))
    } else {
        Ok(Box::new(file))
    }
}

fn walk_error(root: &Path, err: walkdir::Error) -> HalError {
    HalError::Walk {
        path: root.to_path_buf(),
        message: err.to_string(),
    }
}

impl ProcessOps for LinuxHal {
    fn command_output_with_cwd(
        &self,
        program: &str,
        args: &[&str],
        cwd: Option<&Path>,
        timeout: Duration,
    ) -> HalResult<Output> {
        let mut cmd = Command::new(program);
        cmd.args(args);
        if let Some(dir) = cwd {
            cmd.current_dir(dir);
        }
        run_captured(program, &mut cmd, timeout)
    }

    fn command_status_with_cwd(
        &self,
        program: &str,
        args: &[&str],
        cwd: Option<&Path>,
        timeout: Duration,
    ) -> HalResult<()> {
        let mut cmd = Command::new(program);
        cmd.args(args);
        if let Some(dir) = cwd {
            cmd.current_dir(dir);
        }
        run_checked(program, &mut cmd, timeout).map(drop)
    }
}

impl MountOps for LinuxHal {
    fn mount_device(
        &self,
        device: &Path,
        target: &Path,
        fstype: Option<&str>,
        options: MountOptions,
        dry_run: bool,
    ) -> HalResult<()> {
        if dry_run {
            log::info!(
                "DRY RUN: mount {} on {} ({})",
                device.display(),
                target.display(),
                options.options.as_deref().unwrap_or("defaults")
            );
            return Ok(());
        }
        let (flags, data) = options.split();
        nix::mount::mount(Some(device), target, fstype, flags, data.as_deref()).map_err(errno)
    }

    fn unmount(&self, target: &Path, dry_run: bool) -> HalResult<()> {
        if dry_run {
            log::info!("DRY RUN: umount {}", target.display());
            return Ok(());
        }
        nix::mount::umount2(target, MntFlags::empty()).map_err(errno)
    }

    fn is_mounted(&self, path: &Path) -> HalResult<bool> {
        let entries = mountinfo::parse_mountinfo(&self.proc_mountinfo()?);
        Ok(mountinfo::is_mounted_from_info(path, &entries))
    }

    fn mountpoints_on(&self, disk: &Path) -> HalResult<Vec<PathBuf>> {
        let entries = mountinfo::parse_mountinfo(&self.proc_mountinfo()?);
        Ok(mountinfo::mounted_under_device(&entries, disk))
    }
}

impl FormatOps for LinuxHal {
    fn format_ext4(&self, device: &Path, label: &str, opts: &FormatOptions) -> HalResult<()> {
        if opts.dry_run {
            log::info!("DRY RUN: mkfs.ext4 -F -L {label} {}", device.display());
            return Ok(());
        }
        if !opts.confirmed {
            return Err(HalError::SafetyLock);
        }
        let mut cmd = Command::new("mkfs.ext4");
        cmd.arg("-F").arg("-L").arg(label).arg(device);
        run_checked("mkfs.ext4", &mut cmd, MKFS_TIMEOUT).map(drop)
    }
}

impl FlashOps for LinuxHal {
    fn flash_raw_image(
        &self,
        image_path: &Path,
        target_disk: &Path,
        opts: &FlashOptions,
    ) -> HalResult<()> {
        if opts.dry_run {
            log::info!(
                "DRY RUN: write {} to {}",
                image_path.display(),
                target_disk.display()
            );
            return Ok(());
        }
        if !opts.confirmed {
            return Err(HalError::SafetyLock);
        }

        let mut reader = image_reader(image_path)?;
        let target = fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(target_disk)?;
        // Plain files (tests) shrink to the image; block devices refuse and
        // keep their size.
        let _ = target.set_len(0);

        let mut out = BufWriter::with_capacity(WRITE_CHUNK, target);
        let written = io::copy(&mut reader, &mut out)?;
        let target = out.into_inner().map_err(|e| HalError::Io(e.into_error()))?;
        target.sync_all()?;
        log::info!("Wrote {written} bytes to {}", target_disk.display());
        Ok(())
    }
}

impl PartitionOps for LinuxHal {
    fn parted(&self, disk: &Path, op: PartedOp, opts: &PartedOptions) -> HalResult<String> {
        let script = op.script();
        if op.is_destructive() {
            if opts.dry_run {
                log::info!("DRY RUN: parted -s {} {}", disk.display(), script.join(" "));
                return Ok(String::new());
            }
            if !opts.confirmed {
                return Err(HalError::SafetyLock);
            }
        }

        let mut cmd = Command::new("parted");
        cmd.arg("-s").arg(disk).args(&script);
        let output = run_checked("parted", &mut cmd, PARTED_TIMEOUT)?;
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

impl CopyOps for LinuxHal {
    fn copy_tree(
        &self,
        src: &Path,
        dst: &Path,
        on_progress: &mut dyn FnMut(CopyProgress) -> bool,
    ) -> HalResult<()> {
        let mut progress = CopyProgress {
            done: 0,
            total: self.tree_size(src)?,
        };

        fs::create_dir_all(dst)?;
        for entry in WalkDir::new(src).min_depth(1) {
            let entry = entry.map_err(|e| walk_error(src, e))?;
            let Ok(rel) = entry.path().strip_prefix(src) else {
                continue;
            };
            let target = dst.join(rel);
            let kind = entry.file_type();

            if kind.is_dir() {
                fs::create_dir_all(&target)?;
            } else if kind.is_symlink() {
                if target.symlink_metadata().is_ok() {
                    fs::remove_file(&target)?;
                }
                std::os::unix::fs::symlink(fs::read_link(entry.path())?, &target)?;
            } else {
                // fs::copy carries the mode bits across.
                progress.done += fs::copy(entry.path(), &target)?;
                if !on_progress(progress) {
                    return Err(HalError::CopyCancelled(src.to_path_buf()));
                }
            }
        }
        Ok(())
    }

    fn tree_size(&self, path: &Path) -> HalResult<u64> {
        let mut total = 0;
        for entry in WalkDir::new(path) {
            let entry = entry.map_err(|e| walk_error(path, e))?;
            if entry.file_type().is_file() {
                total += entry.metadata().map_or(0, |m| m.len());
            }
        }
        Ok(total)
    }
}

impl SystemOps for LinuxHal {
    fn sync(&self) -> HalResult<()> {
        nix::unistd::sync();
        Ok(())
    }

    fn udev_settle(&self) -> HalResult<()> {
        let mut cmd = Command::new("udevadm");
        cmd.arg("settle");
        run_checked("udevadm", &mut cmd, UDEV_TIMEOUT).map(drop)
    }

    fn udev_reload(&self) -> HalResult<()> {
        let mut cmd = Command::new("udevadm");
        cmd.args(["control", "--reload"]);
        run_checked("udevadm", &mut cmd, UDEV_TIMEOUT).map(drop)
    }

    fn free_bytes(&self, path: &Path) -> HalResult<u64> {
        let stat = nix::sys::statvfs::statvfs(path).map_err(errno)?;
        #[allow(clippy::unnecessary_cast)]
        Ok(stat.blocks_available() as u64 * stat.fragment_size() as u64)
    }

    fn create_dir_all(&self, path: &Path, dry_run: bool) -> HalResult<()> {
        if dry_run {
            log::info!("DRY RUN: mkdir -p {}", path.display());
            return Ok(());
        }
        fs::create_dir_all(path).map_err(io_error)
    }

    fn append_text(&self, path: &Path, text: &str, dry_run: bool) -> HalResult<()> {
        if dry_run {
            log::info!("DRY RUN: append to {}: {}", path.display(), text.trim_end());
            return Ok(());
        }
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(io_error)?;
        file.write_all(text.as_bytes())?;
        Ok(file.sync_all()?)
    }

    fn write_text(&self, path: &Path, text: &str, dry_run: bool) -> HalResult<()> {
        if dry_run {
            log::info!("DRY RUN: write {}", path.display());
            return Ok(());
        }
        let mut file = fs::File::create(path).map_err(io_error)?;
        file.write_all(text.as_bytes())?;
        Ok(file.sync_all()?)
    }
}

impl SysfsOps for LinuxHal {
    fn read_attr(&self, path: &Path) -> HalResult<String> {
        Ok(fs::read_to_string(path)?.trim().to_string())
    }

    fn write_attr(&self, path: &Path, value: &str) -> HalResult<()> {
        fs::write(path, value).map_err(io_error)
    }
}

impl HostInfoOps for LinuxHal {
    fn os_release(&self) -> HalResult<OsReleaseInfo> {
        let content = fs::read_to_string("/etc/os-release")
            .or_else(|_| fs::read_to_string("/usr/lib/os-release"))?;
        Ok(super::host_info_ops::parse_os_release(&content))
    }

    fn proc_mountinfo(&self) -> HalResult<String> {
        Ok(fs::read_to_string("/proc/self/mountinfo")?)
    }

    fn device_tree_model(&self) -> HalResult<Option<Vec<u8>>> {
        match fs::read(DEVICE_TREE_MODEL) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn read_text(&self, path: &Path) -> HalResult<Option<String>> {
        match fs::read_to_string(path) {
            Ok(text) => Ok(Some(text)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(io_error(e)),
        }
    }
}

impl UsbOps for LinuxHal {
    fn usb_ids(&self, vendor: Option<u16>) -> HalResult<Vec<UsbId>> {
        let ids = usb::scan_usb_ids()?;
        Ok(ids
            .into_iter()
            .filter(|id| vendor.map_or(true, |v| id.vendor == v))
            .collect())
    }
}

impl NetOps for LinuxHal {
    fn interfaces(&self) -> HalResult<Vec<String>> {
        let mut names: Vec<String> = fs::read_dir("/sys/class/net")?
            .flatten()
            .map(|e| e.file_name().to_string_lossy().to_string())
            .collect();
        names.sort();
        Ok(names)
    }

    fn interface_exists(&self, name: &str) -> HalResult<bool> {
        Ok(Path::new("/sys/class/net").join(name).exists())
    }

    fn offload_features(&self, iface: &str) -> HalResult<BTreeMap<String, bool>> {
        let mut cmd = Command::new("ethtool");
        cmd.args(["-k", iface]);
        let output = run_checked("ethtool", &mut cmd, ETHTOOL_TIMEOUT)?;
        Ok(super::net_ops::parse_ethtool_features(&stdout_text(&output)))
    }

    fn set_offload(&self, iface: &str, feature: &str, enabled: bool) -> HalResult<()> {
        let state = if enabled { "on" } else { "off" };
        let mut cmd = Command::new("ethtool");
        cmd.args(["-K", iface, feature, state]);
        run_checked("ethtool", &mut cmd, ETHTOOL_TIMEOUT).map(drop)
    }
}

impl ServiceOps for LinuxHal {
    fn unit_active(&self, unit: &str) -> HalResult<bool> {
        let conn = Connection::system()?;
        let manager = systemd(&conn)?;
        // LoadUnit succeeds for unknown units too; they report "inactive".
        let unit_path: OwnedObjectPath = manager.call("LoadUnit", &(unit,))?;
        let unit_proxy = Proxy::new(
            &conn,
            SYSTEMD_DESTINATION,
            unit_path.into_inner(),
            SYSTEMD_UNIT,
        )?;
        let state: String = unit_proxy.get_property("ActiveState")?;
        Ok(state == "active" || state == "activating" || state == "reloading")
    }

    fn start_unit(&self, unit: &str) -> HalResult<()> {
        let conn = Connection::system()?;
        let _: OwnedObjectPath = systemd(&conn)?.call("StartUnit", &(unit, "replace"))?;
        Ok(())
    }

    fn stop_unit(&self, unit: &str) -> HalResult<()> {
        let conn = Connection::system()?;
        let _: OwnedObjectPath = systemd(&conn)?.call("StopUnit", &(unit, "replace"))?;
        Ok(())
    }
}

impl ProbeOps for LinuxHal {
    fn block_devices(&self) -> HalResult<Vec<BlockDeviceInfo>> {
        block::scan_block_devices()
    }

    fn parent_disk(&self, device: &Path) -> HalResult<Option<PathBuf>> {
        let name = kernel_name(&self.resolve_device(device)?)?;
        let class_entry = Path::new("/sys/class/block").join(&name);
        if !class_entry.join("partition").exists() {
            return Ok(None);
        }
        // /sys/class/block/nvme0n1p1 -> ../../devices/.../nvme0n1/nvme0n1p1
        let link = fs::read_link(&class_entry)?;
        let parent = link
            .parent()
            .and_then(|p| p.file_name())
            .map(|n| PathBuf::from("/dev").join(n));
        Ok(parent)
    }

    fn resolve_device(&self, source: &Path) -> HalResult<PathBuf> {
        match fs::canonicalize(source) {
            Ok(p) => Ok(p),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(source.to_path_buf()),
            Err(e) => Err(e.into()),
        }
    }

    fn stable_alias(&self, device: &Path) -> HalResult<Option<PathBuf>> {
        let resolved = self.resolve_device(device)?;
        let entries = match fs::read_dir(DISK_BY_ID) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let mut aliases: Vec<PathBuf> = entries
            .flatten()
            .map(|e| e.path())
            .filter(|p| fs::canonicalize(p).map(|c| c == resolved).unwrap_or(false))
            .collect();
        // wwn-* names are opaque; prefer bus/model/serial style names.
        aliases.sort_by_key(|p| {
            let name = p.file_name().map(|n| n.to_string_lossy().to_string());
            (name.as_deref().is_some_and(|n| n.starts_with("wwn-")), name)
        });
        Ok(aliases.into_iter().next())
    }

    fn fs_type(&self, device: &Path) -> HalResult<Option<String>> {
        blkid_tag(device, "TYPE")
    }

    fn fs_label(&self, device: &Path) -> HalResult<Option<String>> {
        blkid_tag(device, "LABEL")
    }

    fn partition_table_type(&self, disk: &Path) -> HalResult<Option<String>> {
        blkid_tag(disk, "PTTYPE")
    }

    fn blkid_uuid(&self, device: &Path) -> HalResult<String> {
        let mut cmd = Command::new("blkid");
        cmd.args(["-s", "UUID", "-o", "value"]).arg(device);
        let output = run_checked("blkid", &mut cmd, PROBE_TIMEOUT)?;
        Ok(stdout_text(&output))
    }
}
