//! systemd unit control.

use crate::HalResult;

pub trait ServiceOps {
    /// Whether the unit's `ActiveState` is `active`. Unknown units are inactive.
    fn unit_active(&self, unit: &str) -> HalResult<bool>;
    fn start_unit(&self, unit: &str) -> HalResult<()>;
    fn stop_unit(&self, unit: &str) -> HalResult<()>;
}
