//! Hardware identity gate.
//!
//! The allow-list is a closed enumeration: one variant per supported module
//! SKU, matched on structured USB ids (host side) or on a required substring
//! of the device-tree model (target side). Anything else is refused.

use crate::errors::IdentityError;
use edgeflash_hal::{HostInfoOps, UsbId, UsbOps};
use serde::Serialize;
use std::fmt;

/// USB vendor id the modules enumerate with in recovery mode.
pub const RECOVERY_VENDOR: u16 = 0x0955;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ModuleVariant {
    OrinNano8Gb,
    OrinNano4Gb,
}

impl ModuleVariant {
    pub const ALL: [ModuleVariant; 2] = [ModuleVariant::OrinNano8Gb, ModuleVariant::OrinNano4Gb];

    pub const fn recovery_id(self) -> UsbId {
        match self {
            ModuleVariant::OrinNano8Gb => UsbId::new(RECOVERY_VENDOR, 0x7523),
            ModuleVariant::OrinNano4Gb => UsbId::new(RECOVERY_VENDOR, 0x7623),
        }
    }

    pub fn from_recovery_id(id: UsbId) -> Option<Self> {
        Self::ALL.into_iter().find(|v| v.recovery_id() == id)
    }

    pub fn label(self) -> &'static str {
        match self {
            ModuleVariant::OrinNano8Gb => "Jetson Orin Nano 8GB",
            ModuleVariant::OrinNano4Gb => "Jetson Orin Nano 4GB",
        }
    }
}

impl fmt::Display for ModuleVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Decide PASS/FAIL for a set of observed bus ids.
///
/// Every attached device counts, so two identical modules are ambiguous too.
pub fn gate(ids: &[UsbId]) -> Result<ModuleVariant, IdentityError> {
    let matches: Vec<ModuleVariant> = ids
        .iter()
        .filter_map(|id| ModuleVariant::from_recovery_id(*id))
        .collect();
    match matches.as_slice() {
        [] => Err(IdentityError::NoDevice),
        [one] => Ok(*one),
        many => Err(IdentityError::Ambiguous(
            many.iter()
                .map(|v| v.label())
                .collect::<Vec<_>>()
                .join(", "),
        )),
    }
}

/// Query the USB bus and run [`gate`] on what is attached right now.
pub fn gate_usb<H: UsbOps + ?Sized>(hal: &H) -> Result<ModuleVariant, IdentityError> {
    let ids = hal
        .usb_ids(Some(RECOVERY_VENDOR))
        .map_err(|e| IdentityError::Unreadable(e.to_string()))?;
    gate(&ids)
}

/// Check a raw device-tree model string (NUL-terminated) for `required`.
pub fn check_model(raw: &[u8], required: &str) -> Result<String, IdentityError> {
    let model = String::from_utf8_lossy(raw)
        .trim_end_matches('\0')
        .trim()
        .to_string();
    if !required.is_empty() && model.contains(required) {
        Ok(model)
    } else {
        Err(IdentityError::Unsupported(model))
    }
}

/// Target-side identity: read the device-tree model and check it.
pub fn check_device_tree<H: HostInfoOps + ?Sized>(
    hal: &H,
    required: &str,
) -> Result<String, IdentityError> {
    match hal.device_tree_model() {
        Ok(Some(raw)) => check_model(&raw, required),
        Ok(None) => Err(IdentityError::Unreadable(
            "no device-tree model on this platform".to_string(),
        )),
        Err(e) => Err(IdentityError::Unreadable(e.to_string())),
    }
}
