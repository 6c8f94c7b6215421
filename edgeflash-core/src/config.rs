//! edgeflash configuration (`/etc/edgeflash/edgeflash.toml`).
//!
//! Read once at start. A missing default file means built-in defaults; a file
//! named explicitly with `--config` must exist. Unknown keys are rejected so a
//! typo never silently falls back to a default.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/edgeflash/edgeflash.toml";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub defaults: DefaultsConfig,
    pub flash: FlashConfig,
    pub watchdog: WatchdogConfig,
    pub firstboot: FirstBootConfig,
    pub medium: MediumConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DefaultsConfig {
    /// Target-side storage slot that receives the OS; the other one becomes DATA.
    pub os_slot: String,
    /// The two interchangeable target storage slots.
    pub slots: Vec<String>,
    pub hostname: Option<String>,
    pub account: Option<String>,
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            os_slot: "nvme0n1".to_string(),
            slots: vec!["nvme0n1".to_string(), "nvme1n1".to_string()],
            hostname: None,
            account: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StagingPolicy {
    /// Copy or extract the toolkit into a fresh stage on every run.
    Always,
    /// Run a toolkit directory where it is, leftovers from earlier runs
    /// included. For toolkit development only; archives are still extracted.
    Never,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FlashConfig {
    /// Flashing toolkit directory, or a tar archive of it.
    pub toolkit: PathBuf,
    /// Flash script, relative to the toolkit directory.
    pub command: String,
    pub board: String,
    /// Partition layout descriptor, relative to the toolkit directory.
    pub layout: String,
    /// Secondary config override passed through `-p`.
    pub config_override: String,
    pub interface: String,
    pub udev_rule: PathBuf,
    pub staging: StagingPolicy,
    pub scratch_dir: PathBuf,
    pub log_dir: PathBuf,
    pub diagnostics_keep: usize,
    /// Host packages the flash script needs (installed with apt-get when missing).
    pub packages: Vec<String>,
    /// Executables that must be on PATH once packages are in place.
    pub tools: Vec<String>,
    pub pause_services: Vec<String>,
    pub firewall_units: Vec<String>,
    /// Interface name prefixes that refuse the run (VPNs, overlays).
    pub conflict_prefixes: Vec<String>,
    /// Overlay interfaces that are paused for the run instead of refused.
    pub pausable_interfaces: Vec<String>,
    pub inhibit_sleep: bool,
    pub autosuspend_param: PathBuf,
}

impl Default for FlashConfig {
    fn default() -> Self {
        Self {
            toolkit: PathBuf::from("/opt/edgeflash/Linux_for_Tegra"),
            command: "./tools/kernel_flash/l4t_initrd_flash.sh".to_string(),
            board: "jetson-orin-nano-devkit".to_string(),
            layout: "tools/kernel_flash/flash_l4t_t234_nvme.xml".to_string(),
            config_override: "-c bootloader/generic/cfg/flash_t234_qspi.xml".to_string(),
            interface: "usb0".to_string(),
            udev_rule: PathBuf::from("/etc/udev/rules.d/70-edgeflash-usbnet.rules"),
            staging: StagingPolicy::Always,
            scratch_dir: PathBuf::from("/var/tmp"),
            log_dir: PathBuf::from(crate::logging::LOG_DIR),
            diagnostics_keep: 5,
            packages: [
                "abootimg",
                "binutils",
                "cpio",
                "nfs-kernel-server",
                "openssh-client",
                "sshpass",
                "udev",
                "uuid-runtime",
                "whois",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            tools: ["ssh", "ethtool", "exportfs", "tar", "systemd-inhibit"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            pause_services: vec![
                "NetworkManager.service".to_string(),
                "power-profiles-daemon.service".to_string(),
            ],
            firewall_units: vec!["ufw.service".to_string(), "firewalld.service".to_string()],
            conflict_prefixes: ["tun", "wg", "ppp", "zt", "ipsec"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            pausable_interfaces: vec!["tailscale0".to_string()],
            inhibit_sleep: true,
            autosuspend_param: PathBuf::from("/sys/module/usbcore/parameters/autosuspend"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WatchdogConfig {
    pub poll_interval_ms: u64,
    /// Consecutive failed polls tolerated before aborting.
    pub grace_polls: u32,
    /// Log line fragment announcing the large-payload transfer phase.
    pub transfer_marker: String,
    pub probe_enabled: bool,
    /// `user@host` of the target on the transport link.
    pub probe_target: String,
    /// Path of the served image as seen from the target.
    pub probe_image: String,
    pub probe_mib: u64,
    pub min_mib_per_sec: f64,
    pub probe_timeout_secs: u64,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 2000,
            grace_polls: 5,
            transfer_marker: "Writing partition APP".to_string(),
            probe_enabled: true,
            probe_target: "root@fc00:1:1:0::2".to_string(),
            probe_image: "/mnt/external/system.img".to_string(),
            probe_mib: 64,
            min_mib_per_sec: 5.0,
            probe_timeout_secs: 60,
        }
    }
}

impl WatchdogConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FirstBootConfig {
    /// Kernel name prefix of the storage class considered (e.g. `nvme`).
    pub device_prefix: String,
    pub model_substring: String,
    pub mount_point: PathBuf,
    pub label: String,
    pub fs_type: String,
    pub mount_options: String,
    pub fstab: PathBuf,
    pub marker: PathBuf,
}

impl Default for FirstBootConfig {
    fn default() -> Self {
        Self {
            device_prefix: "nvme".to_string(),
            model_substring: "Jetson Orin Nano".to_string(),
            mount_point: PathBuf::from("/data"),
            label: "EDGEDATA".to_string(),
            fs_type: "ext4".to_string(),
            mount_options: "defaults,nofail,noatime".to_string(),
            fstab: PathBuf::from("/etc/fstab"),
            marker: PathBuf::from("/var/lib/edgeflash/firstboot.done"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MediumConfig {
    /// Typed confirmation is `<phrase> <device name>`.
    pub confirm_phrase: String,
}

impl Default for MediumConfig {
    fn default() -> Self {
        Self {
            confirm_phrase: "ERASE".to_string(),
        }
    }
}

impl Config {
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let cfg: Config = toml::from_str(content).context("invalid edgeflash config")?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Load from `path`, or from the default location when `path` is `None`.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let (path, required) = match path {
            Some(p) => (p.to_path_buf(), true),
            None => (PathBuf::from(DEFAULT_CONFIG_PATH), false),
        };
        match fs::read_to_string(&path) {
            Ok(content) => {
                log::info!("Loading config from {}", path.display());
                Self::from_toml_str(&content)
                    .with_context(|| format!("while reading {}", path.display()))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound && !required => {
                log::info!("No config at {}; using defaults", path.display());
                Ok(Self::default())
            }
            Err(e) => Err(e).with_context(|| format!("failed to read {}", path.display())),
        }
    }

    fn validate(&self) -> Result<()> {
        if self.defaults.slots.len() != 2 || self.defaults.slots[0] == self.defaults.slots[1] {
            anyhow::bail!("defaults.slots must name exactly two distinct storage slots");
        }
        if !self.defaults.slots.contains(&self.defaults.os_slot) {
            anyhow::bail!(
                "defaults.os_slot {:?} is not one of {:?}",
                self.defaults.os_slot,
                self.defaults.slots
            );
        }
        if self.watchdog.grace_polls == 0 || self.watchdog.poll_interval_ms == 0 {
            anyhow::bail!("watchdog.grace_polls and watchdog.poll_interval_ms must be non-zero");
        }
        if self.flash.interface.trim().is_empty() {
            anyhow::bail!("flash.interface must not be empty");
        }
        Ok(())
    }
}
