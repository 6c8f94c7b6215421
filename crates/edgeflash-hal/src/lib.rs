//! edgeflash hardware abstraction layer (HAL).
//!
//! Everything that touches the host or the target (block devices, USB bus,
//! network links, systemd units, external commands) goes through the traits
//! in [`hal`], so provisioning and first-boot logic can run against
//! [`FakeHal`] in tests and [`LinuxHal`] on real hardware.

mod error;
pub mod hal;
pub mod path;
pub mod procfs;
pub mod sysfs;

pub use error::{HalError, HalResult};
pub use hal::*;
pub use sysfs::block::{BlockDeviceInfo, Transport};
