#![allow(dead_code)]

use edgeflash_core::config::{Config, StagingPolicy};
use edgeflash_core::identity::ModuleVariant;
use edgeflash_hal::FakeHal;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

pub const AUTOSUSPEND: &str = "/sys/module/usbcore/parameters/autosuspend";

/// A toolkit directory whose flash command is the given shell script body.
pub fn toolkit(tmp: &TempDir, script: &str) -> PathBuf {
    let dir = tmp.path().join("Linux_for_Tegra");
    let cfg = Config::default();
    let command = dir.join(cfg.flash.command.trim_start_matches("./"));
    let layout = dir.join(&cfg.flash.layout);
    fs::create_dir_all(command.parent().unwrap()).unwrap();
    fs::create_dir_all(layout.parent().unwrap()).unwrap();
    fs::write(&layout, "<partition_layout/>").unwrap();
    fs::write(&command, format!("#!/bin/sh\n{script}\n")).unwrap();
    fs::set_permissions(&command, fs::Permissions::from_mode(0o755)).unwrap();
    dir
}

/// Config pointing every host path into `tmp`, with a fast watchdog and no
/// dependency installation. The fake HAL copies no files, so the script runs
/// from where [`toolkit`] wrote it.
pub fn config(tmp: &TempDir, toolkit: &Path) -> Config {
    let mut cfg = Config::default();
    cfg.flash.toolkit = toolkit.to_path_buf();
    cfg.flash.staging = StagingPolicy::Never;
    cfg.flash.scratch_dir = tmp.path().join("scratch");
    cfg.flash.log_dir = tmp.path().join("logs");
    cfg.flash.udev_rule = tmp.path().join("rules.d/70-edgeflash-usbnet.rules");
    cfg.flash.packages.clear();
    cfg.flash.tools.clear();
    cfg.flash.inhibit_sleep = false;
    cfg.watchdog.poll_interval_ms = 50;
    cfg.watchdog.grace_polls = 3;
    cfg.watchdog.probe_enabled = false;
    cfg
}

/// Provisioning host with one 8 GB module attached, the USB link up with
/// offloads on, and the pausable services running.
pub fn host() -> FakeHal {
    let hal = FakeHal::new();
    hal.set_os_release("ubuntu", "22.04");
    hal.set_usb_ids(vec![ModuleVariant::OrinNano8Gb.recovery_id()]);
    hal.set_interface("usb0");
    hal.set_interface("eth0");
    hal.set_offloads(
        "usb0",
        &[
            ("tcp-segmentation-offload", true),
            ("generic-segmentation-offload", true),
            ("generic-receive-offload", true),
            ("tx-checksumming", true),
            ("rx-checksumming", false),
        ],
    );
    hal.set_attr(AUTOSUSPEND, "2");
    hal.set_service("NetworkManager.service", true);
    hal.set_service("power-profiles-daemon.service", false);
    hal.set_service("ufw.service", true);
    hal.set_service("firewalld.service", false);
    hal
}

pub fn process_gone(pid: u32) -> bool {
    let stat = format!("/proc/{pid}/stat");
    match fs::read_to_string(stat) {
        Err(_) => true,
        // Reaped by init but not yet gone.
        Ok(s) => s.rsplit(')').next().is_some_and(|rest| rest.trim_start().starts_with('Z')),
    }
}
