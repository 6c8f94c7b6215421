//! Dependency preflight.
//!
//! Everything the delegated flash tool needs is checked once, before any host
//! state is touched: the toolkit files, host packages (installed on demand)
//! and the executables the run itself calls.

use crate::config::FlashConfig;
use crate::errors::ProvisionError;
use anyhow::{Context, Result};
use edgeflash_hal::{HalError, HostInfoOps, ProcessOps};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

const QUERY_TIMEOUT: Duration = Duration::from_secs(10);
const INSTALL_TIMEOUT: Duration = Duration::from_secs(30 * 60);
const SUPPORTED_HOST_OS: &str = "ubuntu";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
}

impl CommandSpec {
    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

pub fn install_command_spec(pkgs: &[String]) -> CommandSpec {
    let mut args = vec![
        "install".to_string(),
        "-y".to_string(),
        "--no-install-recommends".to_string(),
    ];
    args.extend(pkgs.iter().cloned());
    CommandSpec {
        program: "apt-get".to_string(),
        args,
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PreflightReport {
    /// Packages that were missing (and installed unless dry-run).
    pub installed: Vec<String>,
    /// Host OS advisory, when the host is not a supported release.
    pub advisory: Option<String>,
}

pub struct Preflight<'a> {
    cfg: &'a FlashConfig,
    dry_run: bool,
    path_env: String,
}

impl<'a> Preflight<'a> {
    pub fn new(cfg: &'a FlashConfig, dry_run: bool) -> Self {
        Self {
            cfg,
            dry_run,
            path_env: std::env::var("PATH").unwrap_or_default(),
        }
    }

    pub fn with_path_env(mut self, path_env: impl Into<String>) -> Self {
        self.path_env = path_env.into();
        self
    }

    pub fn run<H: ProcessOps + HostInfoOps + ?Sized>(&self, hal: &H) -> Result<PreflightReport> {
        log::info!("Preflight checks");
        let mut report = PreflightReport {
            advisory: host_advisory(hal),
            ..PreflightReport::default()
        };
        if let Some(advisory) = &report.advisory {
            log::warn!("{advisory}");
        }

        check_toolkit(self.cfg)?;

        let missing = self.missing_packages(hal)?;
        if !missing.is_empty() {
            let spec = install_command_spec(&missing);
            if self.dry_run {
                log::info!("DRY RUN: {}", spec.display());
            } else {
                log::info!("Installing missing packages: {}", missing.join(" "));
                let args: Vec<&str> = spec.args.iter().map(String::as_str).collect();
                hal.command_status(&spec.program, &args, INSTALL_TIMEOUT)
                    .context("Failed to install flash tool dependencies")?;
            }
            report.installed = missing;
        }

        let absent: Vec<String> = self
            .cfg
            .tools
            .iter()
            .filter(|bin| find_executable_in_path(bin, &self.path_env).is_none())
            .cloned()
            .collect();
        if !absent.is_empty() {
            let msg = format!("Missing required binaries on PATH: {}", absent.join(", "));
            // Packages not installed in a dry run may be what provides them.
            if self.dry_run && !report.installed.is_empty() {
                log::warn!("{msg}");
            } else {
                return Err(ProvisionError::Precondition(msg).into());
            }
        }

        log::info!("Preflight complete");
        Ok(report)
    }

    fn missing_packages<H: ProcessOps + ?Sized>(&self, hal: &H) -> Result<Vec<String>> {
        let mut missing = Vec::new();
        for pkg in &self.cfg.packages {
            let out = match hal.command_output("dpkg-query", &["-W", "-f=${Status}", pkg.as_str()], QUERY_TIMEOUT) {
                Ok(out) => out,
                Err(HalError::CommandNotFound(_)) => {
                    return Err(ProvisionError::Precondition(
                        "dpkg-query not found; the host must be a Debian-family system".to_string(),
                    )
                    .into())
                }
                Err(e) => return Err(e).context("Failed to query installed packages"),
            };
            let status = String::from_utf8_lossy(&out.stdout);
            if !(out.status.success() && status.contains("install ok installed")) {
                missing.push(pkg.clone());
            }
        }
        Ok(missing)
    }
}

/// Warn-only check of `/etc/os-release`.
pub fn host_advisory<H: HostInfoOps + ?Sized>(hal: &H) -> Option<String> {
    let info = match hal.os_release() {
        Ok(info) => info,
        Err(e) => return Some(format!("Cannot read host OS release ({e}); the flash tool expects Ubuntu")),
    };
    match info.id.as_deref() {
        Some(SUPPORTED_HOST_OS) => None,
        other => Some(format!(
            "Host OS is {} {}; the flash tool is only supported on Ubuntu",
            other.unwrap_or("unknown"),
            info.version_id.as_deref().unwrap_or("")
        )),
    }
}

pub fn is_archive(path: &Path) -> bool {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default();
    [".tar", ".tar.gz", ".tgz", ".tar.bz2", ".tbz2", ".tar.xz", ".txz"]
        .iter()
        .any(|ext| name.ends_with(ext))
}

/// Path of a toolkit-relative file (`./tools/x.sh` -> `<toolkit>/tools/x.sh`).
pub fn toolkit_file(toolkit: &Path, relative: &str) -> PathBuf {
    toolkit.join(relative.trim_start_matches("./"))
}

/// A toolkit directory must hold the flash command and the layout file. An
/// archive is only checked for existence here; its contents are checked
/// after extraction.
pub fn check_toolkit(cfg: &FlashConfig) -> Result<(), ProvisionError> {
    let toolkit = &cfg.toolkit;
    let meta = fs::metadata(toolkit).map_err(|_| {
        ProvisionError::Precondition(format!("flash toolkit not found at {}", toolkit.display()))
    })?;
    if meta.is_file() && is_archive(toolkit) {
        return Ok(());
    }
    if !meta.is_dir() {
        return Err(ProvisionError::Precondition(format!(
            "{} is neither a toolkit directory nor a tar archive",
            toolkit.display()
        )));
    }
    check_toolkit_dir(toolkit, cfg)
}

pub fn check_toolkit_dir(dir: &Path, cfg: &FlashConfig) -> Result<(), ProvisionError> {
    let command = toolkit_file(dir, &cfg.command);
    let executable = fs::metadata(&command)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false);
    if !executable {
        return Err(ProvisionError::Precondition(format!(
            "flash command {} is missing or not executable",
            command.display()
        )));
    }
    let layout = toolkit_file(dir, &cfg.layout);
    if !layout.is_file() {
        return Err(ProvisionError::Precondition(format!(
            "partition layout {} not found",
            layout.display()
        )));
    }
    Ok(())
}

pub fn find_executable_in_path(binary: &str, path_env: &str) -> Option<PathBuf> {
    for dir in path_env.split(':').filter(|dir| !dir.is_empty()) {
        let candidate = Path::new(dir).join(binary);
        if let Ok(metadata) = fs::metadata(&candidate) {
            if metadata.is_file() && metadata.permissions().mode() & 0o111 != 0 {
                return Some(candidate);
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use edgeflash_hal::FakeHal;
    use tempfile::tempdir;

    fn write_exec(path: &Path) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, "#!/bin/sh\nexit 0\n").unwrap();
        fs::set_permissions(path, fs::Permissions::from_mode(0o755)).unwrap();
    }

    fn toolkit_cfg(root: &Path) -> FlashConfig {
        let toolkit = root.join("Linux_for_Tegra");
        let cfg = FlashConfig {
            toolkit: toolkit.clone(),
            packages: vec!["abootimg".to_string(), "sshpass".to_string()],
            tools: vec!["ssh".to_string()],
            ..FlashConfig::default()
        };
        write_exec(&toolkit_file(&toolkit, &cfg.command));
        fs::write(toolkit_file(&toolkit, &cfg.layout), "<partition_layout/>").unwrap();
        write_exec(&root.join("bin/ssh"));
        cfg
    }

    #[test]
    fn installs_only_missing_packages() {
        let tmp = tempdir().unwrap();
        let cfg = toolkit_cfg(tmp.path());
        let hal = FakeHal::new();
        hal.set_os_release("ubuntu", "22.04");
        hal.set_command_result("dpkg-query", 1, "");

        let path_env = tmp.path().join("bin").display().to_string();
        let report = Preflight::new(&cfg, false)
            .with_path_env(path_env)
            .run(&hal)
            .unwrap();
        assert_eq!(report.installed, vec!["abootimg", "sshpass"]);
        assert!(report.advisory.is_none());
        let apt = hal.commands_for("apt-get");
        assert_eq!(apt.len(), 1);
        assert!(apt[0].ends_with(&["abootimg".to_string(), "sshpass".to_string()]));
    }

    #[test]
    fn installed_packages_are_left_alone_and_dry_run_never_installs() {
        let tmp = tempdir().unwrap();
        let cfg = toolkit_cfg(tmp.path());
        let hal = FakeHal::new();
        hal.set_command_result("dpkg-query", 0, "install ok installed");
        let path_env = tmp.path().join("bin").display().to_string();
        let report = Preflight::new(&cfg, true)
            .with_path_env(path_env)
            .run(&hal)
            .unwrap();
        assert!(report.installed.is_empty());
        assert!(hal.commands_for("apt-get").is_empty());
    }

    #[test]
    fn missing_tool_is_a_precondition_failure() {
        let tmp = tempdir().unwrap();
        let mut cfg = toolkit_cfg(tmp.path());
        cfg.tools.push("exportfs".to_string());
        let hal = FakeHal::new();
        hal.set_command_result("dpkg-query", 0, "install ok installed");
        let err = Preflight::new(&cfg, false)
            .with_path_env(tmp.path().join("bin").display().to_string())
            .run(&hal)
            .unwrap_err();
        assert!(err.to_string().contains("exportfs"));
        assert!(err.downcast_ref::<ProvisionError>().is_some());
    }

    #[test]
    fn toolkit_without_layout_is_refused() {
        let tmp = tempdir().unwrap();
        let cfg = toolkit_cfg(tmp.path());
        fs::remove_file(toolkit_file(&cfg.toolkit, &cfg.layout)).unwrap();
        let err = check_toolkit(&cfg).unwrap_err();
        assert!(err.to_string().contains("layout"));
    }

    #[test]
    fn archives_are_recognised() {
        assert!(is_archive(Path::new("/media/usb/jetson_linux.tbz2")));
        assert!(is_archive(Path::new("L4T.tar.xz")));
        assert!(!is_archive(Path::new("/opt/edgeflash/Linux_for_Tegra")));
    }

    #[test]
    fn non_ubuntu_host_gets_an_advisory_only() {
        let hal = FakeHal::new();
        hal.set_os_release("fedora", "40");
        let advisory = host_advisory(&hal).unwrap();
        assert!(advisory.contains("fedora 40"));
    }
}
