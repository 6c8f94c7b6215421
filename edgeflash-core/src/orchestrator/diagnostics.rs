//! Failure diagnostics: a snapshot of the run log tail and host link state,
//! written as `diagnostics-<unix-ms>.txt` next to the run logs.

use crate::config::FlashConfig;
use crate::identity::RECOVERY_VENDOR;
use anyhow::{Context, Result};
use edgeflash_hal::{NetOps, ProcessOps, ServiceOps, UsbOps};
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

const PROBE_TIMEOUT: Duration = Duration::from_secs(10);
const LOG_TAIL_LINES: usize = 80;
const KERNEL_LINES: usize = 40;
const PREFIX: &str = "diagnostics-";

/// Last `n` lines of a text file; empty if unreadable.
pub fn tail_lines(path: &Path, n: usize) -> Vec<String> {
    let Ok(bytes) = fs::read(path) else {
        return Vec::new();
    };
    let text = String::from_utf8_lossy(&bytes);
    let lines: Vec<&str> = text.lines().collect();
    lines[lines.len().saturating_sub(n)..]
        .iter()
        .map(|l| l.to_string())
        .collect()
}

fn command_text<H: ProcessOps + ?Sized>(hal: &H, program: &str, args: &[&str]) -> Result<String, String> {
    match hal.command_output(program, args, PROBE_TIMEOUT) {
        Ok(out) if out.status.success() => Ok(String::from_utf8_lossy(&out.stdout).into_owned()),
        Ok(out) => Err(format!(
            "{program} exited with {:?}: {}",
            out.status.code(),
            String::from_utf8_lossy(&out.stderr).trim()
        )),
        Err(e) => Err(e.to_string()),
    }
}

/// Build the diagnostic block. Each probe that fails is reported inline.
pub fn collect<H>(hal: &H, cfg: &FlashConfig, log_path: Option<&Path>, reason: &str) -> String
where
    H: ProcessOps + ServiceOps + NetOps + UsbOps + ?Sized,
{
    let mut out = String::new();
    let _ = writeln!(out, "== edgeflash failure diagnostics ==");
    let _ = writeln!(out, "reason: {reason}");

    if let Some(path) = log_path {
        let _ = writeln!(out, "\n== run log tail ({}) ==", path.display());
        for line in tail_lines(path, LOG_TAIL_LINES) {
            let _ = writeln!(out, "{line}");
        }
    }

    let _ = writeln!(out, "\n== network interfaces ==");
    match command_text(hal, "ip", &["-brief", "address"]) {
        Ok(text) => out.push_str(&text),
        Err(e) => {
            let _ = writeln!(out, "(ip unavailable: {e})");
            match hal.interfaces() {
                Ok(list) => {
                    let _ = writeln!(out, "{}", list.join(" "));
                }
                Err(e) => {
                    let _ = writeln!(out, "(interfaces unavailable: {e})");
                }
            }
        }
    }
    let link = hal.interface_exists(&cfg.interface).unwrap_or(false);
    let _ = writeln!(out, "transport {}: {}", cfg.interface, if link { "present" } else { "absent" });

    let _ = writeln!(out, "\n== services ==");
    for unit in cfg.pause_services.iter().chain(cfg.firewall_units.iter()) {
        let state = match hal.unit_active(unit) {
            Ok(true) => "active".to_string(),
            Ok(false) => "inactive".to_string(),
            Err(e) => format!("unknown ({e})"),
        };
        let _ = writeln!(out, "{unit}: {state}");
    }

    let _ = writeln!(out, "\n== recovery-mode USB devices ==");
    match hal.usb_ids(Some(RECOVERY_VENDOR)) {
        Ok(ids) if ids.is_empty() => {
            let _ = writeln!(out, "(none)");
        }
        Ok(ids) => {
            for id in ids {
                let _ = writeln!(out, "{id}");
            }
        }
        Err(e) => {
            let _ = writeln!(out, "(unavailable: {e})");
        }
    }

    let _ = writeln!(out, "\n== kernel USB events ==");
    match command_text(hal, "journalctl", &["-k", "-n", "400", "--no-pager", "-o", "short-monotonic"]) {
        Ok(text) => {
            let usb: Vec<&str> = text
                .lines()
                .filter(|l| {
                    let l = l.to_ascii_lowercase();
                    l.contains("usb") || l.contains("rndis") || l.contains("cdc_")
                })
                .collect();
            for line in &usb[usb.len().saturating_sub(KERNEL_LINES)..] {
                let _ = writeln!(out, "{line}");
            }
        }
        Err(e) => {
            let _ = writeln!(out, "(kernel log unavailable: {e})");
        }
    }
    out
}

/// Write a dump into `dir` and keep only the newest `keep`.
pub fn write_dump(dir: &Path, content: &str, keep: usize) -> Result<PathBuf> {
    fs::create_dir_all(dir).with_context(|| format!("Failed to create {}", dir.display()))?;
    let path = dir.join(format!("{PREFIX}{}.txt", crate::now_unix_ms()));
    fs::write(&path, content).with_context(|| format!("Failed to write {}", path.display()))?;
    let removed = rotate(dir, keep)?;
    if removed > 0 {
        log::debug!("Rotated {removed} old diagnostics dumps");
    }
    Ok(path)
}

/// Remove all but the newest `keep` diagnostics dumps. Returns how many were
/// removed.
pub fn rotate(dir: &Path, keep: usize) -> Result<usize> {
    let mut dumps: Vec<(u64, PathBuf)> = fs::read_dir(dir)
        .with_context(|| format!("Failed to read {}", dir.display()))?
        .filter_map(|e| e.ok())
        .filter_map(|e| {
            let name = e.file_name().to_string_lossy().into_owned();
            let stamp = name.strip_prefix(PREFIX)?.strip_suffix(".txt")?.parse().ok()?;
            Some((stamp, e.path()))
        })
        .collect();
    dumps.sort_by(|a, b| b.0.cmp(&a.0));
    let mut removed = 0;
    for (_, path) in dumps.into_iter().skip(keep) {
        fs::remove_file(&path).with_context(|| format!("Failed to remove {}", path.display()))?;
        removed += 1;
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use edgeflash_hal::FakeHal;
    use tempfile::tempdir;

    #[test]
    fn dump_contains_log_tail_and_host_state() {
        let tmp = tempdir().unwrap();
        let log = tmp.path().join("flash-1.log");
        let body: String = (0..200).map(|i| format!("line {i}\n")).collect();
        fs::write(&log, body).unwrap();

        let hal = FakeHal::new();
        hal.set_command_result("ip", 0, "lo UNKNOWN 127.0.0.1/8\nusb0 UP fc00:1:1::1/64\n");
        hal.set_command_result(
            "journalctl",
            0,
            "[ 1.0] eth0: link up\n[ 2.0] usb 1-2: USB disconnect, device number 9\n",
        );
        hal.set_service("NetworkManager.service", false);

        let text = collect(&hal, &FlashConfig::default(), Some(&log), "target left recovery mode");
        assert!(text.contains("reason: target left recovery mode"));
        assert!(text.contains("line 199"));
        assert!(!text.contains("line 100\n"));
        assert!(text.contains("usb0 UP"));
        assert!(text.contains("NetworkManager.service: inactive"));
        assert!(text.contains("USB disconnect"));
        assert!(!text.contains("eth0: link up"));
        assert!(text.contains("(none)"));
    }

    #[test]
    fn failed_probes_are_reported_not_raised() {
        let hal = FakeHal::new();
        hal.set_command_missing("ip");
        hal.set_command_result("journalctl", 1, "");
        hal.set_interface("usb0");
        let text = collect(&hal, &FlashConfig::default(), None, "exit 1");
        assert!(text.contains("ip unavailable"));
        assert!(text.contains("transport usb0: present"));
        assert!(text.contains("kernel log unavailable"));
    }

    #[test]
    fn rotation_keeps_newest() {
        let tmp = tempdir().unwrap();
        for stamp in [10u64, 30, 20, 50, 40] {
            fs::write(tmp.path().join(format!("diagnostics-{stamp}.txt")), "x").unwrap();
        }
        fs::write(tmp.path().join("flash-10.log"), "keep me").unwrap();
        assert_eq!(rotate(tmp.path(), 2).unwrap(), 3);
        let mut left: Vec<String> = fs::read_dir(tmp.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        left.sort();
        assert_eq!(left, vec!["diagnostics-40.txt", "diagnostics-50.txt", "flash-10.log"]);
    }
}
