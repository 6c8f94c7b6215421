//! USB bus enumeration.

use crate::HalResult;
use std::fmt;

/// A USB vendor/product identifier pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UsbId {
    pub vendor: u16,
    pub product: u16,
}

impl UsbId {
    pub const fn new(vendor: u16, product: u16) -> Self {
        Self { vendor, product }
    }
}

impl fmt::Display for UsbId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04x}:{:04x}", self.vendor, self.product)
    }
}

pub trait UsbOps {
    /// Identifiers of every attached USB device, optionally filtered to one vendor.
    fn usb_ids(&self, vendor: Option<u16>) -> HalResult<Vec<UsbId>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usb_id_displays_as_lsusb_pair() {
        assert_eq!(UsbId::new(0x0955, 0x7523).to_string(), "0955:7523");
    }
}
