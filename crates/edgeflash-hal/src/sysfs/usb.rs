//! USB device identifiers from `/sys/bus/usb/devices`.

use crate::{HalResult, UsbId};
use std::fs;
use std::path::Path;

pub fn scan_usb_ids() -> HalResult<Vec<UsbId>> {
    scan_usb_ids_in(Path::new("/sys/bus/usb/devices"))
}

/// Reads `idVendor`/`idProduct` from every device directory under `root`.
///
/// Interface directories (`1-1:1.0`) carry no ids and are skipped.
pub fn scan_usb_ids_in(root: &Path) -> HalResult<Vec<UsbId>> {
    let mut ids = Vec::new();
    for entry in fs::read_dir(root)?.flatten() {
        let dir = entry.path();
        let vendor = read_hex(&dir.join("idVendor"));
        let product = read_hex(&dir.join("idProduct"));
        if let (Some(vendor), Some(product)) = (vendor, product) {
            ids.push(UsbId::new(vendor, product));
        }
    }
    ids.sort();
    Ok(ids)
}

fn read_hex(path: &Path) -> Option<u16> {
    let raw = fs::read_to_string(path).ok()?;
    u16::from_str_radix(raw.trim(), 16).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn scan_usb_ids_reads_pairs_and_skips_interfaces() {
        let tmp = tempdir().unwrap();
        fs::create_dir_all(tmp.path().join("1-2")).unwrap();
        fs::write(tmp.path().join("1-2/idVendor"), "0955\n").unwrap();
        fs::write(tmp.path().join("1-2/idProduct"), "7523\n").unwrap();
        fs::create_dir_all(tmp.path().join("1-2:1.0")).unwrap();

        let ids = scan_usb_ids_in(tmp.path()).unwrap();
        assert_eq!(ids, vec![UsbId::new(0x0955, 0x7523)]);
    }
}
