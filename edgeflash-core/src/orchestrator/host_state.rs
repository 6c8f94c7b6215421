//! Host state changed for the duration of a run, and its restoration.
//!
//! [`HostStateGuard`] records every change it makes and undoes them in
//! reverse order exactly once, either through [`HostStateGuard::restore`] or
//! on drop. Restoration never fails the run; problems are logged.

use crate::config::FlashConfig;
use super::transport::OFFLOAD_FEATURES;
use anyhow::{Context, Result};
use edgeflash_hal::{NetOps, ProcessOps, ServiceOps, SysfsOps};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

const OVERLAY_TIMEOUT: Duration = Duration::from_secs(30);

/// Host settings a run may touch, as observed at one point in time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HostStateSnapshot {
    pub autosuspend: Option<String>,
    /// Unit -> active, for every pausable service and firewall unit.
    pub units: BTreeMap<String, bool>,
    /// Offload feature states of the transport interface, when it exists.
    pub offloads: BTreeMap<String, bool>,
    /// Pausable overlay interface -> present.
    pub overlays: BTreeMap<String, bool>,
}

impl HostStateSnapshot {
    /// Probe current host state. Unreadable values are recorded as absent.
    pub fn capture<H: SysfsOps + ServiceOps + NetOps + ?Sized>(hal: &H, cfg: &FlashConfig) -> Self {
        let autosuspend = hal
            .read_attr(&cfg.autosuspend_param)
            .ok()
            .map(|v| v.trim().to_string());
        let units = cfg
            .pause_services
            .iter()
            .chain(cfg.firewall_units.iter())
            .map(|u| (u.clone(), hal.unit_active(u).unwrap_or(false)))
            .collect();
        let offloads = hal
            .offload_features(&cfg.interface)
            .map(|all| {
                all.into_iter()
                    .filter(|(name, _)| OFFLOAD_FEATURES.iter().any(|(_, f)| f == name))
                    .collect()
            })
            .unwrap_or_default();
        let overlays = cfg
            .pausable_interfaces
            .iter()
            .map(|i| (i.clone(), hal.interface_exists(i).unwrap_or(false)))
            .collect();
        Self {
            autosuspend,
            units,
            offloads,
            overlays,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Undo {
    Attr { path: PathBuf, value: String },
    StartUnit(String),
    Offload { iface: String, feature: String },
    OverlayUp(String),
}

pub struct HostStateGuard<'a, H: SysfsOps + ServiceOps + NetOps + ProcessOps + ?Sized> {
    hal: &'a H,
    snapshot: HostStateSnapshot,
    undo: Vec<Undo>,
    dry_run: bool,
    restored: bool,
}

impl<'a, H: SysfsOps + ServiceOps + NetOps + ProcessOps + ?Sized> HostStateGuard<'a, H> {
    pub fn acquire(hal: &'a H, cfg: &FlashConfig, dry_run: bool) -> Self {
        let snapshot = HostStateSnapshot::capture(hal, cfg);
        log::debug!("Host state before run: {:?}", snapshot);
        Self {
            hal,
            snapshot,
            undo: Vec::new(),
            dry_run,
            restored: false,
        }
    }

    pub fn snapshot(&self) -> &HostStateSnapshot {
        &self.snapshot
    }

    /// Number of changes that will be undone.
    pub fn pending(&self) -> usize {
        self.undo.len()
    }

    pub fn disable_autosuspend(&mut self, param: &Path) -> Result<()> {
        let Some(prior) = self.snapshot.autosuspend.clone() else {
            log::warn!("USB autosuspend parameter {} not readable; leaving it", param.display());
            return Ok(());
        };
        if prior == "-1" {
            return Ok(());
        }
        if self.dry_run {
            log::info!("DRY RUN: write -1 to {} (was {prior})", param.display());
            return Ok(());
        }
        self.hal
            .write_attr(param, "-1")
            .with_context(|| format!("Failed to disable USB autosuspend via {}", param.display()))?;
        self.undo.push(Undo::Attr {
            path: param.to_path_buf(),
            value: prior,
        });
        log::info!("USB autosuspend disabled");
        Ok(())
    }

    /// Stop each unit that was active at snapshot time.
    pub fn stop_units(&mut self, units: &[String]) -> Result<()> {
        for unit in units {
            if !self.snapshot.units.get(unit).copied().unwrap_or(false) {
                continue;
            }
            if self.dry_run {
                log::info!("DRY RUN: stop {unit}");
                continue;
            }
            self.hal
                .stop_unit(unit)
                .with_context(|| format!("Failed to stop {unit}"))?;
            self.undo.push(Undo::StartUnit(unit.clone()));
            log::info!("Stopped {unit} for the run");
        }
        Ok(())
    }

    /// Turn off the link-stalling offloads that are currently on.
    pub fn disable_offloads(&mut self, iface: &str) -> Result<()> {
        let enabled: Vec<String> = OFFLOAD_FEATURES
            .iter()
            .filter(|(_, name)| self.snapshot.offloads.get(*name).copied().unwrap_or(false))
            .map(|(_, name)| name.to_string())
            .collect();
        if enabled.is_empty() {
            log::debug!("No offloads to disable on {iface} (absent or already off)");
            return Ok(());
        }
        for feature in enabled {
            if self.dry_run {
                log::info!("DRY RUN: ethtool -K {iface} {feature} off");
                continue;
            }
            self.hal
                .set_offload(iface, &feature, false)
                .with_context(|| format!("Failed to disable {feature} on {iface}"))?;
            self.undo.push(Undo::Offload {
                iface: iface.to_string(),
                feature,
            });
        }
        Ok(())
    }

    /// Bring an overlay interface down (`tailscale down`) for the run.
    pub fn pause_overlay(&mut self, iface: &str) -> Result<()> {
        if self.dry_run {
            log::info!("DRY RUN: pause overlay {iface}");
            return Ok(());
        }
        let program = overlay_program(iface);
        self.hal
            .command_status(program, &["down"], OVERLAY_TIMEOUT)
            .with_context(|| format!("Failed to pause {iface}"))?;
        self.undo.push(Undo::OverlayUp(iface.to_string()));
        log::info!("Paused {iface} for the run");
        Ok(())
    }

    /// Undo every recorded change, newest first. Idempotent.
    pub fn restore(&mut self) {
        if self.restored {
            return;
        }
        self.restored = true;
        while let Some(step) = self.undo.pop() {
            let result: Result<()> = match &step {
                Undo::Attr { path, value } => self.hal.write_attr(path, value).map_err(Into::into),
                Undo::StartUnit(unit) => self.hal.start_unit(unit).map_err(Into::into),
                Undo::Offload { iface, feature } => {
                    self.hal.set_offload(iface, feature, true).map_err(Into::into)
                }
                Undo::OverlayUp(iface) => self
                    .hal
                    .command_status(overlay_program(iface), &["up"], OVERLAY_TIMEOUT)
                    .map_err(Into::into),
            };
            if let Err(e) = result {
                log::warn!("Failed to restore host state ({step:?}): {e:#}");
            }
        }
        log::info!("Host state restored");
    }
}

impl<H: SysfsOps + ServiceOps + NetOps + ProcessOps + ?Sized> Drop for HostStateGuard<'_, H> {
    fn drop(&mut self) {
        self.restore();
    }
}

fn overlay_program(iface: &str) -> &str {
    iface.trim_end_matches(|c: char| c.is_ascii_digit())
}
