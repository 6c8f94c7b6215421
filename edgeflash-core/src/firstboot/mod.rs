//! First-boot storage initializer.
//!
//! Runs once on the module itself: confirm the hardware, find the data disk
//! (the storage device that does not back `/`), give it a filesystem unless
//! it already has one, persist and perform the mount, then write the
//! completion marker. Nothing is rolled back on failure; every step checks
//! the current state, so a re-run picks up where the last one stopped.

pub mod fstab;

use crate::config::FirstBootConfig;
use crate::enumerator;
use crate::errors::FirstBootError;
use crate::identity;
use edgeflash_hal::path::partition_path;
use edgeflash_hal::{
    BlockDeviceInfo, FormatOptions, HalError, MountOptions, PartedOp, PartedOptions, ProvisionHal,
};
use fstab::FstabEntry;
use serde::Serialize;
use std::path::{Path, PathBuf};

/// What first boot did to the data disk. In a dry run the flags say what
/// it would have done.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DataVolumeRecord {
    pub boot_disk: PathBuf,
    pub data_disk: PathBuf,
    pub partition: PathBuf,
    /// `None` only in a dry run that would have formatted.
    pub uuid: Option<String>,
    pub partitioned: bool,
    pub formatted: bool,
    pub fstab_updated: bool,
    pub mounted_now: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FirstBootOutcome {
    /// The marker exists; nothing was checked or touched.
    AlreadyDone,
    Initialized(DataVolumeRecord),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FormatPlan {
    Keep,
    FormatPartition,
    PartitionAndFormat,
}

pub struct FirstBoot<'a, H: ProvisionHal + ?Sized> {
    hal: &'a H,
    cfg: &'a FirstBootConfig,
    dry_run: bool,
}

impl<'a, H: ProvisionHal + ?Sized> FirstBoot<'a, H> {
    pub fn new(hal: &'a H, cfg: &'a FirstBootConfig, dry_run: bool) -> Self {
        Self { hal, cfg, dry_run }
    }

    pub fn run(&self) -> Result<FirstBootOutcome, FirstBootError> {
        let marker = &self.cfg.marker;
        let done = self
            .hal
            .read_text(marker)
            .map_err(|e| FirstBootError::Marker(format!("{}: {e}", marker.display())))?;
        if done.is_some() {
            log::info!("First boot already completed ({} exists)", marker.display());
            return Ok(FirstBootOutcome::AlreadyDone);
        }

        let model = identity::check_device_tree(self.hal, &self.cfg.model_substring)
            .map_err(|e| FirstBootError::UnsupportedHardware(e.to_string()))?;
        log::info!("Running on {model}");

        let boot_disk = match enumerator::root_disk(self.hal) {
            Ok(Some(disk)) => disk,
            Ok(None) => {
                return Err(FirstBootError::BootDiskUnresolved(
                    "/ is not mounted from a block device".to_string(),
                ))
            }
            Err(e) => return Err(FirstBootError::BootDiskUnresolved(format!("{e:#}"))),
        };
        log::info!("Boot disk: {}", boot_disk.display());

        let data = self.data_disk(&boot_disk)?;
        let partition = PathBuf::from(partition_path(&data.dev_path.to_string_lossy(), 1));
        log::info!("Data disk: {} (partition {})", data.dev_path.display(), partition.display());

        let plan = self.plan_format(&data, &partition)?;
        let kept_uuid = match plan {
            FormatPlan::Keep => Some(self.uuid(&partition)?),
            _ => None,
        };
        let table = fstab::read_table(self.hal, &self.cfg.fstab).map_err(|e| self.table_error(e))?;
        self.check_claims(&table, kept_uuid.as_deref())?;

        let mut record = DataVolumeRecord {
            boot_disk,
            data_disk: data.dev_path.clone(),
            partition: partition.clone(),
            uuid: None,
            partitioned: false,
            formatted: false,
            fstab_updated: false,
            mounted_now: false,
        };
        self.apply_format(plan, &data.dev_path, &partition, &mut record)?;

        if self.dry_run && record.formatted {
            log::info!("DRY RUN: filesystem UUID is only known after formatting; stopping here");
            return Ok(FirstBootOutcome::Initialized(record));
        }

        let uuid = match kept_uuid {
            Some(uuid) => uuid,
            None => self.uuid(&partition)?,
        };
        let entry = FstabEntry {
            label: &self.cfg.label,
            uuid: &uuid,
            mount_point: &self.cfg.mount_point,
            fs_type: &self.cfg.fs_type,
            options: &self.cfg.mount_options,
        };
        record.fstab_updated =
            fstab::ensure_entry(self.hal, &self.cfg.fstab, &table, &entry, self.dry_run)
                .map_err(|e| self.table_error(e))?;
        record.uuid = Some(uuid);

        record.mounted_now = self.mount(&partition)?;
        self.write_marker()?;
        Ok(FirstBootOutcome::Initialized(record))
    }

    fn uuid(&self, partition: &Path) -> Result<String, FirstBootError> {
        let uuid = self
            .hal
            .blkid_uuid(partition)
            .map_err(|e| FirstBootError::UuidUnreadable(e.to_string()))?;
        if uuid.trim().is_empty() {
            return Err(FirstBootError::UuidUnreadable(format!(
                "{} has no UUID",
                partition.display()
            )));
        }
        Ok(uuid)
    }

    fn table_error(&self, err: HalError) -> FirstBootError {
        FirstBootError::MountTable(format!("{}: {err}", self.cfg.fstab.display()))
    }

    /// Runs before anything is written: a mount point already given to some
    /// other source would leave the new volume out of the table for good.
    fn check_claims(&self, table: &str, kept_uuid: Option<&str>) -> Result<(), FirstBootError> {
        let mut accepted = vec![format!("LABEL={}", self.cfg.label)];
        accepted.extend(kept_uuid.map(|uuid| format!("UUID={uuid}")));
        match fstab::foreign_claim(table, &self.cfg.mount_point, &accepted) {
            Some(claimed_by) => Err(FirstBootError::MountPointClaimed {
                mount_point: self.cfg.mount_point.clone(),
                claimed_by,
            }),
            None => Ok(()),
        }
    }

    fn data_disk(&self, boot_disk: &Path) -> Result<BlockDeviceInfo, FirstBootError> {
        let devices: Vec<BlockDeviceInfo> = self
            .hal
            .block_devices()
            .map_err(|e| FirstBootError::DataDiskUnresolved(format!("cannot list block devices: {e}")))?
            .into_iter()
            .filter(|d| d.name.starts_with(&self.cfg.device_prefix))
            .collect();
        if devices.len() < 2 {
            return Err(FirstBootError::TooFewDevices {
                found: devices.len(),
            });
        }

        let mut others: Vec<BlockDeviceInfo> =
            devices.into_iter().filter(|d| d.dev_path != boot_disk).collect();
        match others.len() {
            1 => Ok(others.remove(0)),
            n => Err(FirstBootError::DataDiskUnresolved(format!(
                "{n} {} devices besides the boot disk {}: {}",
                self.cfg.device_prefix,
                boot_disk.display(),
                others
                    .iter()
                    .map(|d| d.name.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            ))),
        }
    }

    /// An existing filesystem on partition 1 is kept as is. A disk without
    /// partition 1 is only partitioned if it carries nothing else either; an
    /// empty partition table (a run stopped after `mklabel`) counts as blank.
    fn plan_format(&self, data: &BlockDeviceInfo, partition: &Path) -> Result<FormatPlan, FirstBootError> {
        let probe = |p: &Path| {
            self.hal
                .fs_type(p)
                .map_err(|e| FirstBootError::FormatFailed(format!("cannot probe {}: {e}", p.display())))
        };

        if data.partitions.iter().any(|p| p == partition) {
            return Ok(match probe(partition)? {
                Some(fs) => {
                    log::info!("{} already holds {fs}; leaving it untouched", partition.display());
                    FormatPlan::Keep
                }
                None => FormatPlan::FormatPartition,
            });
        }

        if let Some(fs) = probe(&data.dev_path)? {
            return Err(FirstBootError::ExistingData(format!(
                "{} carries a whole-disk {fs} filesystem",
                data.dev_path.display()
            )));
        }
        if !data.partitions.is_empty() {
            let table = self
                .hal
                .partition_table_type(&data.dev_path)
                .map_err(|e| FirstBootError::PartitionFailed(e.to_string()))?
                .unwrap_or_else(|| "unknown".to_string());
            return Err(FirstBootError::ExistingData(format!(
                "{} has a {table} partition table with {} other partition(s) but no {}",
                data.dev_path.display(),
                data.partitions.len(),
                partition.display()
            )));
        }
        Ok(FormatPlan::PartitionAndFormat)
    }

    fn apply_format(
        &self,
        plan: FormatPlan,
        disk: &Path,
        partition: &Path,
        record: &mut DataVolumeRecord,
    ) -> Result<(), FirstBootError> {
        if plan == FormatPlan::PartitionAndFormat {
            let opts = PartedOptions::new(self.dry_run, true);
            let ops = [
                PartedOp::MkLabel {
                    label: "gpt".to_string(),
                },
                PartedOp::MkPart {
                    name: "data".to_string(),
                    fs_type: self.cfg.fs_type.clone(),
                    start: "0%".to_string(),
                    end: "100%".to_string(),
                },
            ];
            for op in ops {
                self.hal
                    .parted(disk, op, &opts)
                    .map_err(|e| FirstBootError::PartitionFailed(e.to_string()))?;
            }
            if !self.dry_run {
                self.hal
                    .udev_settle()
                    .map_err(|e| FirstBootError::PartitionFailed(format!("udev settle: {e}")))?;
            }
            record.partitioned = true;
        }

        if plan != FormatPlan::Keep {
            self.hal
                .format_ext4(partition, &self.cfg.label, &FormatOptions::new(self.dry_run, true))
                .map_err(|e| FirstBootError::FormatFailed(e.to_string()))?;
            record.formatted = true;
        }
        Ok(())
    }

    /// Returns whether a mount was made, or would be in a dry run.
    fn mount(&self, partition: &Path) -> Result<bool, FirstBootError> {
        let target = &self.cfg.mount_point;
        let err = |e: HalError| FirstBootError::MountFailed(format!("{}: {e}", target.display()));
        if self.hal.is_mounted(target).map_err(err)? {
            log::info!("{} is already mounted", target.display());
            return Ok(false);
        }
        self.hal.create_dir_all(target, self.dry_run).map_err(err)?;
        self.hal
            .mount_device(
                partition,
                target,
                Some(&self.cfg.fs_type),
                MountOptions::with_options(self.cfg.mount_options.clone()),
                self.dry_run,
            )
            .map_err(err)?;
        Ok(true)
    }

    fn write_marker(&self) -> Result<(), FirstBootError> {
        let marker = &self.cfg.marker;
        let err = |e: HalError| FirstBootError::Marker(format!("{}: {e}", marker.display()));
        if let Some(parent) = marker.parent() {
            self.hal.create_dir_all(parent, self.dry_run).map_err(err)?;
        }
        self.hal.write_text(marker, "", self.dry_run).map_err(err)?;
        if !self.dry_run {
            log::info!("First boot complete; marker written to {}", marker.display());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use edgeflash_hal::{FakeHal, Operation, Transport};

    const MODEL: &[u8] = b"NVIDIA Jetson Orin Nano Developer Kit\0";

    fn cfg() -> FirstBootConfig {
        FirstBootConfig {
            marker: PathBuf::from("/var/lib/edgeflash/state/firstboot.done"),
            ..FirstBootConfig::default()
        }
    }

    fn module() -> FakeHal {
        let hal = FakeHal::new();
        hal.set_device_tree_model(Some(MODEL));
        let mut boot = BlockDeviceInfo::new("nvme0n1", 256 << 30, Transport::Nvme);
        boot.partitions = vec![PathBuf::from("/dev/nvme0n1p1")];
        hal.add_block_device(boot);
        hal.add_block_device(BlockDeviceInfo::new("nvme1n1", 1 << 40, Transport::Nvme));
        hal.set_mountinfo("25 1 259:1 / / rw,relatime - ext4 /dev/nvme0n1p1 rw\n");
        hal
    }

    #[test]
    fn blank_disk_is_partitioned_formatted_and_mounted() {
        let cfg = cfg();
        let hal = module();

        let FirstBootOutcome::Initialized(rec) = FirstBoot::new(&hal, &cfg, false).run().unwrap() else {
            panic!("expected initialization");
        };
        assert_eq!(rec.data_disk, PathBuf::from("/dev/nvme1n1"));
        assert_eq!(rec.partition, PathBuf::from("/dev/nvme1n1p1"));
        assert!(rec.partitioned && rec.formatted && rec.fstab_updated && rec.mounted_now);
        assert!(hal.has_operation(|op| matches!(op, Operation::FormatExt4 { label, .. } if label == "EDGEDATA")));
        assert!(hal.has_operation(|op| matches!(op, Operation::UdevSettle)));
        assert!(hal.dir_exists(&cfg.mount_point));
        assert!(hal.dir_exists(Path::new("/var/lib/edgeflash/state")));
        assert_eq!(hal.file(&cfg.marker).as_deref(), Some(""));

        let table = hal.file(&cfg.fstab).unwrap();
        assert!(table.contains(&format!("UUID={}", rec.uuid.unwrap())));
    }

    #[test]
    fn mount_point_taken_by_another_volume_stops_before_formatting() {
        let cfg = cfg();
        let hal = module();
        hal.set_file(&cfg.fstab, "UUID=0000-stale  /data  ext4  defaults,nofail  0  2\n");

        let err = FirstBoot::new(&hal, &cfg, false).run().unwrap_err();
        assert!(matches!(&err, FirstBootError::MountPointClaimed { claimed_by, .. } if claimed_by == "UUID=0000-stale"));
        assert_eq!(err.exit_code(), 21);
        assert_eq!(hal.operation_count(), 0);
        assert_eq!(hal.file(&cfg.marker), None);
    }

    #[test]
    fn wrong_model_is_refused() {
        let hal = module();
        hal.set_device_tree_model(Some(&b"Raspberry Pi 4 Model B\0"[..]));
        let err = FirstBoot::new(&hal, &cfg(), false).run().unwrap_err();
        assert_eq!(err.exit_code(), 10);
        assert_eq!(hal.operation_count(), 0);
    }

    #[test]
    fn single_device_is_too_few() {
        let hal = FakeHal::new();
        hal.set_device_tree_model(Some(MODEL));
        hal.add_block_device(BlockDeviceInfo::new("nvme0n1", 256 << 30, Transport::Nvme));
        hal.add_block_device(BlockDeviceInfo::new("sda", 32 << 30, Transport::Usb));
        hal.set_mountinfo("25 1 259:1 / / rw - ext4 /dev/nvme0n1 rw\n");
        let err = FirstBoot::new(&hal, &cfg(), false).run().unwrap_err();
        assert!(matches!(err, FirstBootError::TooFewDevices { found: 1 }));
    }

    #[test]
    fn boot_disk_outside_the_class_is_unresolved() {
        let hal = module();
        hal.set_mountinfo("25 1 179:1 / / rw - ext4 /dev/mmcblk0p1 rw\n");
        let err = FirstBoot::new(&hal, &cfg(), false).run().unwrap_err();
        assert!(matches!(err, FirstBootError::DataDiskUnresolved(_)));
    }

    #[test]
    fn overlay_root_cannot_name_a_boot_disk() {
        let hal = module();
        hal.set_mountinfo("25 1 0:30 / / rw - overlay overlay rw\n");
        let err = FirstBoot::new(&hal, &cfg(), false).run().unwrap_err();
        assert_eq!(err.exit_code(), 11);
    }

    #[test]
    fn foreign_content_is_not_overwritten() {
        let hal = FakeHal::new();
        hal.set_device_tree_model(Some(MODEL));
        hal.add_block_device(BlockDeviceInfo::new("nvme0n1", 256 << 30, Transport::Nvme));
        let mut data = BlockDeviceInfo::new("nvme1n1", 1 << 40, Transport::Nvme);
        data.partitions = vec![PathBuf::from("/dev/nvme1n1p2")];
        hal.add_block_device(data);
        hal.set_partition_table("/dev/nvme1n1", "dos");
        hal.set_mountinfo("25 1 259:1 / / rw - ext4 /dev/nvme0n1 rw\n");

        let err = FirstBoot::new(&hal, &cfg(), false).run().unwrap_err();
        assert!(matches!(err, FirstBootError::ExistingData(_)));
        assert_eq!(err.exit_code(), 14);
        assert!(!hal.has_operation(|op| matches!(op, Operation::Parted { .. } | Operation::FormatExt4 { .. })));

        let hal = module();
        hal.set_fs_signature("/dev/nvme1n1", "xfs", "scratch", "1234");
        let err = FirstBoot::new(&hal, &cfg(), false).run().unwrap_err();
        assert!(matches!(err, FirstBootError::ExistingData(_)));
    }

    #[test]
    fn empty_table_left_by_an_earlier_run_is_resumed() {
        let hal = module();
        hal.set_partition_table("/dev/nvme1n1", "gpt");
        let FirstBootOutcome::Initialized(rec) = FirstBoot::new(&hal, &cfg(), false).run().unwrap() else {
            panic!("expected initialization");
        };
        assert!(rec.partitioned && rec.formatted);
    }

    #[test]
    fn empty_partition_is_formatted_without_repartitioning() {
        let hal = FakeHal::new();
        hal.set_device_tree_model(Some(MODEL));
        hal.add_block_device(BlockDeviceInfo::new("nvme0n1", 256 << 30, Transport::Nvme));
        let mut data = BlockDeviceInfo::new("nvme1n1", 1 << 40, Transport::Nvme);
        data.partitions = vec![PathBuf::from("/dev/nvme1n1p1")];
        hal.add_block_device(data);
        hal.set_partition_table("/dev/nvme1n1", "gpt");
        hal.set_mountinfo("25 1 259:1 / / rw - ext4 /dev/nvme0n1 rw\n");

        let FirstBootOutcome::Initialized(rec) = FirstBoot::new(&hal, &cfg(), false).run().unwrap() else {
            panic!("expected initialization");
        };
        assert!(!rec.partitioned);
        assert!(rec.formatted);
        assert!(!hal.has_operation(|op| matches!(op, Operation::Parted { .. })));
    }

    #[test]
    fn dry_run_touches_nothing() {
        let cfg = cfg();
        let hal = module();
        let FirstBootOutcome::Initialized(rec) = FirstBoot::new(&hal, &cfg, true).run().unwrap() else {
            panic!("expected a plan");
        };
        assert!(rec.partitioned && rec.formatted);
        assert_eq!(rec.uuid, None);
        assert_eq!(hal.operation_count(), 0);
        assert_eq!(hal.file(&cfg.marker), None);
        assert_eq!(hal.file(&cfg.fstab), None);
    }

    #[test]
    fn dry_run_on_a_kept_filesystem_plans_every_write() {
        let cfg = cfg();
        let hal = FakeHal::new();
        hal.set_device_tree_model(Some(MODEL));
        hal.add_block_device(BlockDeviceInfo::new("nvme0n1", 256 << 30, Transport::Nvme));
        let mut data = BlockDeviceInfo::new("nvme1n1", 1 << 40, Transport::Nvme);
        data.partitions = vec![PathBuf::from("/dev/nvme1n1p1")];
        hal.add_block_device(data);
        hal.set_fs_signature("/dev/nvme1n1p1", "ext4", "EDGEDATA", "5e1f-77");
        hal.set_mountinfo("25 1 259:1 / / rw - ext4 /dev/nvme0n1 rw\n");

        let FirstBootOutcome::Initialized(rec) = FirstBoot::new(&hal, &cfg, true).run().unwrap() else {
            panic!("expected a plan");
        };
        assert_eq!(rec.uuid.as_deref(), Some("5e1f-77"));
        assert!(rec.fstab_updated && rec.mounted_now);
        assert!(!rec.formatted);
        assert_eq!(hal.operation_count(), 0);
        assert_eq!(hal.file(&cfg.fstab), None);
        assert!(!hal.dir_exists(&cfg.mount_point));
    }
}
