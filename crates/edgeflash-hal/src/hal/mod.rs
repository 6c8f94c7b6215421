//! HAL trait definitions and implementations.
//!
//! This module defines the core traits for system operations and provides
//! both real (LinuxHal) and fake (FakeHal) implementations.

pub mod copy_ops;
pub mod fake_hal;
pub mod flash_ops;
pub mod format_ops;
pub mod host_info_ops;
pub mod linux_hal;
pub mod mount_ops;
pub mod net_ops;
pub mod partition_ops;
pub mod probe_ops;
pub mod process_ops;
pub mod service_ops;
pub mod system_ops;
pub mod usb_ops;

pub use copy_ops::{CopyOps, CopyProgress};
pub use fake_hal::{FakeHal, Operation};
pub use flash_ops::{FlashOps, FlashOptions};
pub use format_ops::{FormatOps, FormatOptions};
pub use host_info_ops::{HostInfoOps, OsReleaseInfo};
pub use linux_hal::LinuxHal;
pub use mount_ops::{MountOps, MountOptions};
pub use net_ops::NetOps;
pub use partition_ops::{PartedOp, PartedOptions, PartitionOps};
pub use probe_ops::ProbeOps;
pub use process_ops::ProcessOps;
pub use service_ops::ServiceOps;
pub use system_ops::{SysfsOps, SystemOps};
pub use usb_ops::{UsbId, UsbOps};

/// Complete HAL combining every system operation trait the provisioning
/// workflow and the first-boot initializer need.
pub trait ProvisionHal:
    MountOps
    + FormatOps
    + FlashOps
    + PartitionOps
    + ProbeOps
    + ProcessOps
    + CopyOps
    + SystemOps
    + SysfsOps
    + HostInfoOps
    + UsbOps
    + NetOps
    + ServiceOps
    + Send
    + Sync
{
}

impl<T> ProvisionHal for T where
    T: MountOps
        + FormatOps
        + FlashOps
        + PartitionOps
        + ProbeOps
        + ProcessOps
        + CopyOps
        + SystemOps
        + SysfsOps
        + HostInfoOps
        + UsbOps
        + NetOps
        + ServiceOps
        + Send
        + Sync
{
}
