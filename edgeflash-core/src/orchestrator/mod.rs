//! Provisioning orchestrator.
//!
//! One flash attempt against a confirmed target: preflight, transport
//! stabilization, conflict checks, staging, the delegated flash tool under
//! the link watchdog, and outcome handling. Host state is restored on every
//! exit path by [`host_state::HostStateGuard`]; the staged toolkit is removed
//! by [`staging::StagedToolkit`].

pub mod child;
pub mod diagnostics;
pub mod host_state;
pub mod preflight;
pub mod report;
pub mod staging;
pub mod transport;

use crate::config::Config;
use crate::errors::{exit_code_for, EXIT_FAILURE, EXIT_INTERRUPTED, EXIT_OK, EXIT_WATCHDOG};
use crate::identity::ModuleVariant;
use crate::selector::{ConfirmationToken, SlotAssignment};
use crate::watchdog::{AbortReason, SshTransferProbe, TransferProbe, Watchdog, WatchdogReport};
use anyhow::{anyhow, Context, Result};
use child::{FlashChild, FlashInvocation};
use edgeflash_hal::ProvisionHal;
use host_state::HostStateGuard;
use preflight::Preflight;
use report::RunReport;
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitStatus;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RunOutcome {
    Success,
    /// The flash tool failed, or the run stopped before it could start.
    Failed { code: Option<i32>, message: String },
    /// The watchdog killed the tool. Overrides the tool's own exit code.
    WatchdogAbort { reason: String },
    Interrupted,
    /// Operator declined a confirmation; nothing was touched.
    Declined,
}

impl RunOutcome {
    pub fn exit_code(&self) -> i32 {
        match self {
            RunOutcome::Success | RunOutcome::Declined => EXIT_OK,
            RunOutcome::Failed { .. } => EXIT_FAILURE,
            RunOutcome::WatchdogAbort { .. } => EXIT_WATCHDOG,
            RunOutcome::Interrupted => EXIT_INTERRUPTED,
        }
    }

    /// Decide the outcome of a finished tool run. A watchdog abort always
    /// wins over the tool's exit status.
    pub fn from_run(code: Option<i32>, success: bool, watchdog: Option<&AbortReason>) -> Self {
        match watchdog {
            Some(AbortReason::Interrupted) => RunOutcome::Interrupted,
            Some(reason) => RunOutcome::WatchdogAbort {
                reason: reason.to_string(),
            },
            None if success => RunOutcome::Success,
            None => RunOutcome::Failed {
                code,
                message: match code {
                    Some(c) => format!("flash tool exited with status {c}"),
                    None => "flash tool was terminated by a signal".to_string(),
                },
            },
        }
    }
}

/// A confirmed provisioning target.
#[derive(Debug)]
pub struct ProvisionRequest {
    pub variant: ModuleVariant,
    pub slots: SlotAssignment,
    /// Proof the operator confirmed the slot assignment.
    pub token: ConfirmationToken,
}

#[derive(Debug)]
pub struct RunSummary {
    pub outcome: RunOutcome,
    pub log_path: Option<PathBuf>,
    pub report_path: Option<PathBuf>,
    pub diagnostics_path: Option<PathBuf>,
    pub flash_command: Option<String>,
    /// Diagnostic block shown to the operator on failure.
    pub diagnostics: Option<String>,
    pub watchdog: Option<WatchdogReport>,
}

impl RunSummary {
    fn new(outcome: RunOutcome) -> Self {
        Self {
            outcome,
            log_path: None,
            report_path: None,
            diagnostics_path: None,
            flash_command: None,
            diagnostics: None,
            watchdog: None,
        }
    }
}

pub struct Orchestrator<'a, H: ProvisionHal + ?Sized> {
    hal: &'a H,
    cfg: &'a Config,
    dry_run: bool,
    interrupt: &'a AtomicBool,
    path_env: Option<String>,
}

impl<'a, H: ProvisionHal + ?Sized> Orchestrator<'a, H> {
    pub fn new(hal: &'a H, cfg: &'a Config, dry_run: bool, interrupt: &'a AtomicBool) -> Self {
        Self {
            hal,
            cfg,
            dry_run,
            interrupt,
            path_env: None,
        }
    }

    /// Search path used for the tool check (defaults to `$PATH`).
    pub fn with_path_env(mut self, path_env: impl Into<String>) -> Self {
        self.path_env = Some(path_env.into());
        self
    }

    /// Run one attempt and write its report. Errors are steps that failed
    /// before or around the flash tool; the report still records them.
    pub fn run(&self, req: &ProvisionRequest) -> Result<RunSummary> {
        let started = crate::now_unix_ms();
        log::info!(
            "Provisioning {} (OS -> {}, DATA -> {}){}",
            req.variant,
            req.slots.os,
            req.slots.data,
            if self.dry_run { " [dry run]" } else { "" }
        );
        if let Some(hostname) = &self.cfg.defaults.hostname {
            log::info!("Module hostname: {hostname}");
        }
        if let Some(account) = &self.cfg.defaults.account {
            log::info!("Module account: {account}");
        }

        let mut result = self.execute(req, started);
        if self.dry_run {
            return result;
        }

        let (outcome, exit_code) = match &result {
            Ok(summary) => (summary.outcome.clone(), summary.outcome.exit_code()),
            Err(e) => (
                RunOutcome::Failed {
                    code: None,
                    message: format!("{e:#}"),
                },
                exit_code_for(e),
            ),
        };
        let ok = result.as_ref().ok();
        let report = RunReport {
            started_at_unix_ms: started,
            finished_at_unix_ms: crate::now_unix_ms(),
            variant: req.variant,
            slots: req.slots.clone(),
            hostname: self.cfg.defaults.hostname.clone(),
            account: self.cfg.defaults.account.clone(),
            dry_run: self.dry_run,
            outcome,
            exit_code,
            log_path: ok.and_then(|s| s.log_path.clone()),
            diagnostics_path: ok.and_then(|s| s.diagnostics_path.clone()),
            flash_command: ok.and_then(|s| s.flash_command.clone()),
        };
        match report.write(&self.cfg.flash.log_dir) {
            Ok(path) => {
                log::info!("Run report written to {}", path.display());
                if let Ok(summary) = result.as_mut() {
                    summary.report_path = Some(path);
                }
            }
            Err(e) => log::warn!("Failed to write run report: {e:#}"),
        }
        result
    }

    fn interrupted(&self) -> bool {
        self.interrupt.load(Ordering::SeqCst)
    }

    fn execute(&self, req: &ProvisionRequest, started: u64) -> Result<RunSummary> {
        let flash = &self.cfg.flash;

        // 1. Dependencies.
        let mut preflight = Preflight::new(flash, self.dry_run);
        if let Some(path_env) = &self.path_env {
            preflight = preflight.with_path_env(path_env.clone());
        }
        preflight.run(self.hal)?;

        // 2. Transport stabilization. Everything from here on is undone by
        //    the guard, whatever happens.
        let mut guard = HostStateGuard::acquire(self.hal, flash, self.dry_run);
        transport::install_udev_rule(self.hal, &flash.udev_rule, &flash.interface, self.dry_run)?;
        guard.disable_autosuspend(&flash.autosuspend_param)?;
        guard.stop_units(&flash.pause_services)?;
        guard.stop_units(&flash.firewall_units)?;
        guard.disable_offloads(&flash.interface)?;

        // 3. Conflicts.
        for overlay in transport::check_conflicts(self.hal, flash)? {
            guard.pause_overlay(&overlay)?;
        }

        // 4. Staging.
        if self.interrupted() {
            return Ok(RunSummary::new(RunOutcome::Interrupted));
        }
        let staged = staging::prepare(self.hal, flash, self.dry_run)?;

        // 5. Delegated flash.
        let invocation = FlashInvocation::build(flash, &req.slots, &staged.dir);
        if self.dry_run {
            log::info!("DRY RUN: {} (in {})", invocation.display(), invocation.cwd.display());
            let mut summary = RunSummary::new(RunOutcome::Success);
            summary.flash_command = Some(invocation.display());
            return Ok(summary);
        }
        if self.interrupted() {
            return Ok(RunSummary::new(RunOutcome::Interrupted));
        }

        fs::create_dir_all(&flash.log_dir)
            .with_context(|| format!("Failed to create {}", flash.log_dir.display()))?;
        let log_path = flash.log_dir.join(format!("flash-{started}.log"));
        log::info!("Running: {}", invocation.display());
        log::info!("Flash output is logged to {}", log_path.display());

        let (status, wd) = self.flash_under_watchdog(&invocation, &log_path)?;

        // 6. Outcome.
        let outcome = RunOutcome::from_run(status.code(), status.success(), wd.reason.as_ref());
        let mut summary = RunSummary::new(outcome);
        summary.log_path = Some(log_path.clone());
        summary.flash_command = Some(invocation.display());

        match &summary.outcome {
            RunOutcome::Success => log::info!("Flash completed successfully"),
            RunOutcome::Interrupted => log::warn!("Flash interrupted by operator"),
            RunOutcome::WatchdogAbort { reason } => log::error!("Watchdog abort: {reason}"),
            RunOutcome::Failed { message, .. } => log::error!("Flash failed: {message}"),
            RunOutcome::Declined => {}
        }

        if matches!(
            summary.outcome,
            RunOutcome::Failed { .. } | RunOutcome::WatchdogAbort { .. }
        ) {
            let reason = match &summary.outcome {
                RunOutcome::WatchdogAbort { reason } => reason.clone(),
                RunOutcome::Failed { message, .. } => message.clone(),
                _ => String::new(),
            };
            let text = diagnostics::collect(self.hal, flash, Some(&log_path), &reason);
            match diagnostics::write_dump(&flash.log_dir, &text, flash.diagnostics_keep) {
                Ok(path) => {
                    log::info!("Diagnostics written to {}", path.display());
                    summary.diagnostics_path = Some(path);
                }
                Err(e) => log::warn!("Failed to write diagnostics: {e:#}"),
            }
            summary.diagnostics = Some(text);
        }
        summary.watchdog = Some(wd);

        guard.restore();
        drop(staged);
        Ok(summary)
    }

    /// Spawn the tool, supervise it, and return its status together with the
    /// watchdog's report. The watchdog is joined before its report is read.
    fn flash_under_watchdog(
        &self,
        invocation: &FlashInvocation,
        log_path: &Path,
    ) -> Result<(ExitStatus, WatchdogReport)> {
        let wd_cfg = &self.cfg.watchdog;
        let ssh_probe = SshTransferProbe::new(self.hal, wd_cfg);
        let probe: Option<&dyn TransferProbe> = if wd_cfg.probe_enabled {
            Some(&ssh_probe)
        } else {
            None
        };
        let watchdog = Watchdog::new(self.hal, wd_cfg, &self.cfg.flash.interface, probe);

        let (tx, rx) = mpsc::channel();
        let child = FlashChild::spawn(invocation, log_path, tx)?;
        let killer = child.killer();
        let kill = move || killer.kill();
        let stop = AtomicBool::new(false);

        std::thread::scope(|scope| -> Result<(ExitStatus, WatchdogReport)> {
            let handle = scope.spawn(|| watchdog.run(rx, &stop, self.interrupt, &kill));
            let status = child.wait();
            stop.store(true, Ordering::SeqCst);
            let report = handle
                .join()
                .map_err(|_| anyhow!("watchdog thread panicked"))?;
            Ok((status?, report))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn watchdog_overrides_a_clean_exit() {
        let lost = AbortReason::DeviceLost { polls: 5 };
        let outcome = RunOutcome::from_run(Some(0), true, Some(&lost));
        assert!(matches!(outcome, RunOutcome::WatchdogAbort { .. }));
        assert_eq!(outcome.exit_code(), EXIT_WATCHDOG);
    }

    #[test]
    fn interrupt_and_plain_outcomes() {
        assert_eq!(
            RunOutcome::from_run(None, false, Some(&AbortReason::Interrupted)),
            RunOutcome::Interrupted
        );
        assert_eq!(RunOutcome::from_run(Some(0), true, None), RunOutcome::Success);
        let failed = RunOutcome::from_run(Some(4), false, None);
        assert_eq!(failed.exit_code(), EXIT_FAILURE);
        assert!(matches!(failed, RunOutcome::Failed { code: Some(4), .. }));
        assert_eq!(RunOutcome::Declined.exit_code(), EXIT_OK);
    }
}
