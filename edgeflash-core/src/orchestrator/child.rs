//! The delegated flash tool as a child process.
//!
//! The child runs in its own process group so an abort can take down the
//! whole tree (the vendor script forks helpers, NFS/SSH sessions, etc.).
//! Both output pipes are pumped line by line into the run log and onto a
//! channel the watchdog reads.

use super::preflight::toolkit_file;
use crate::config::FlashConfig;
use crate::selector::SlotAssignment;
use anyhow::{Context, Result};
use edgeflash_hal::path::partition_path;
use nix::errno::Errno;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Read, Write};
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

const INHIBIT_WHAT: &str = "--what=sleep:idle:handle-lid-switch";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlashInvocation {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
}

impl FlashInvocation {
    pub fn build(cfg: &FlashConfig, slots: &SlotAssignment, toolkit_dir: &Path) -> Self {
        let command = toolkit_file(toolkit_dir, &cfg.command)
            .to_string_lossy()
            .into_owned();
        let tool_args = vec![
            "--external-device".to_string(),
            partition_path(&slots.os, 1),
            "-c".to_string(),
            cfg.layout.clone(),
            "-p".to_string(),
            cfg.config_override.clone(),
            "--showlogs".to_string(),
            "--network".to_string(),
            cfg.interface.clone(),
            cfg.board.clone(),
            "internal".to_string(),
        ];

        let (program, args) = if cfg.inhibit_sleep {
            let mut args = vec![
                INHIBIT_WHAT.to_string(),
                "--who=edgeflash".to_string(),
                "--why=Flashing edge module".to_string(),
                command,
            ];
            args.extend(tool_args);
            ("systemd-inhibit".to_string(), args)
        } else {
            (command, tool_args)
        };

        Self {
            program,
            args,
            cwd: toolkit_dir.to_path_buf(),
        }
    }

    /// Shell-like rendering for logs and dry runs.
    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .map(|a| {
                if a.contains(char::is_whitespace) {
                    format!("\"{a}\"")
                } else {
                    a.to_string()
                }
            })
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Sends SIGKILL to the child's process group.
#[derive(Debug, Clone, Copy)]
pub struct GroupKiller {
    pgid: Pid,
}

impl GroupKiller {
    pub fn kill(&self) {
        match killpg(self.pgid, Signal::SIGKILL) {
            Ok(()) => log::warn!("Killed flash process group {}", self.pgid),
            Err(Errno::ESRCH) => {}
            Err(e) => log::error!("Failed to kill process group {}: {e}", self.pgid),
        }
    }
}

pub struct FlashChild {
    child: Child,
    killer: GroupKiller,
    pumps: Vec<JoinHandle<()>>,
}

impl FlashChild {
    /// Start the tool. Output is appended to `log_path` and sent on `lines`.
    pub fn spawn(inv: &FlashInvocation, log_path: &Path, lines: Sender<String>) -> Result<Self> {
        let log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_path)
            .with_context(|| format!("Failed to open run log {}", log_path.display()))?;
        let log = Arc::new(Mutex::new(log));

        let mut child = Command::new(&inv.program)
            .args(&inv.args)
            .current_dir(&inv.cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .spawn()
            .with_context(|| format!("Failed to start {}", inv.program))?;

        let killer = GroupKiller {
            pgid: Pid::from_raw(child.id() as i32),
        };
        let mut pumps = Vec::new();
        if let Some(out) = child.stdout.take() {
            pumps.push(pump(out, Arc::clone(&log), lines.clone()));
        }
        if let Some(err) = child.stderr.take() {
            pumps.push(pump(err, Arc::clone(&log), lines));
        }
        log::info!("Flash tool started (pid {})", child.id());

        Ok(Self {
            child,
            killer,
            pumps,
        })
    }

    pub fn killer(&self) -> GroupKiller {
        self.killer
    }

    /// Wait for the tool, then reap anything it left in its group and drain
    /// the output pumps.
    pub fn wait(mut self) -> Result<ExitStatus> {
        let status = self.child.wait().context("Failed to wait for flash tool")?;
        match killpg(self.killer.pgid, Signal::SIGKILL) {
            Ok(()) => log::debug!("Killed leftover processes in group {}", self.killer.pgid),
            Err(Errno::ESRCH) => {}
            Err(e) => log::warn!("Failed to clean process group {}: {e}", self.killer.pgid),
        }
        for pump in self.pumps.drain(..) {
            let _ = pump.join();
        }
        Ok(status)
    }
}

fn pump<R: Read + Send + 'static>(
    source: R,
    log: Arc<Mutex<File>>,
    lines: Sender<String>,
) -> JoinHandle<()> {
    std::thread::spawn(move || {
        let mut reader = BufReader::new(source);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf) {
                Ok(0) | Err(_) => break,
                Ok(_) => {}
            }
            if let Ok(mut file) = log.lock() {
                let _ = file.write_all(&buf);
            }
            let line = String::from_utf8_lossy(&buf).trim_end().to_string();
            // The watchdog may already be gone; the log still gets everything.
            let _ = lines.send(line);
        }
    })
}
