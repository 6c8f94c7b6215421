//! USB network link stabilization and conflict detection.

use crate::config::FlashConfig;
use crate::errors::ProvisionError;
use crate::identity::RECOVERY_VENDOR;
use anyhow::{Context, Result};
use edgeflash_hal::{NetOps, SystemOps};
use std::fs;
use std::path::Path;

/// Offloads known to stall the link under sustained transfer, as
/// (`ethtool -K` short name, `ethtool -k` feature name).
pub const OFFLOAD_FEATURES: [(&str, &str); 5] = [
    ("tso", "tcp-segmentation-offload"),
    ("gso", "generic-segmentation-offload"),
    ("gro", "generic-receive-offload"),
    ("tx", "tx-checksumming"),
    ("rx", "rx-checksumming"),
];

/// udev rule pinning the recovery link name and disabling offloads whenever
/// the interface (re)appears, e.g. across the target's reboot into its
/// flashing initrd.
pub fn udev_rule_text(iface: &str) -> String {
    let offloads = OFFLOAD_FEATURES
        .iter()
        .map(|(short, _)| format!("{short} off"))
        .collect::<Vec<_>>()
        .join(" ");
    format!(
        "# Managed by edgeflash. Pins the recovery-mode USB network link name.\n\
         SUBSYSTEM==\"net\", ACTION==\"add\", ATTRS{{idVendor}}==\"{vendor:04x}\", \
         NAME=\"{iface}\", RUN+=\"/usr/sbin/ethtool -K {iface} {offloads}\"\n",
        vendor = RECOVERY_VENDOR,
    )
}

/// Write the naming rule if it differs from what is installed and reload
/// udev. Returns whether anything changed.
pub fn install_udev_rule<H: SystemOps + ?Sized>(
    hal: &H,
    path: &Path,
    iface: &str,
    dry_run: bool,
) -> Result<bool> {
    let wanted = udev_rule_text(iface);
    if fs::read_to_string(path).ok().as_deref() == Some(wanted.as_str()) {
        log::debug!("udev rule {} already current", path.display());
        return Ok(false);
    }
    if dry_run {
        log::info!("DRY RUN: write udev rule {} for {iface}", path.display());
        return Ok(true);
    }
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    fs::write(path, wanted).with_context(|| format!("Failed to write {}", path.display()))?;
    hal.udev_reload().context("Failed to reload udev rules")?;
    log::info!("Installed udev rule {}", path.display());
    Ok(true)
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InterfaceConflicts {
    /// Active interfaces that refuse the run.
    pub refused: Vec<String>,
    /// Overlay interfaces to pause for the run.
    pub pausable: Vec<String>,
}

pub fn classify_interfaces(ifaces: &[String], cfg: &FlashConfig) -> InterfaceConflicts {
    let mut out = InterfaceConflicts::default();
    for iface in ifaces {
        if cfg.pausable_interfaces.contains(iface) {
            out.pausable.push(iface.clone());
        } else if cfg
            .conflict_prefixes
            .iter()
            .any(|prefix| iface.starts_with(prefix.as_str()))
        {
            out.refused.push(iface.clone());
        }
    }
    out
}

/// Refuse when a VPN/overlay interface is up; report the ones to pause.
pub fn check_conflicts<H: NetOps + ?Sized>(
    hal: &H,
    cfg: &FlashConfig,
) -> Result<Vec<String>, ProvisionError> {
    let ifaces = hal.interfaces()?;
    let conflicts = classify_interfaces(&ifaces, cfg);
    if let Some(first) = conflicts.refused.first() {
        return Err(ProvisionError::ConflictingInterface(first.clone()));
    }
    Ok(conflicts.pausable)
}
