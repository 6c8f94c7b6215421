//! Subcommand handlers.
//!
//! Each handler returns the process exit status. Operator-facing lines go
//! through the [`Prompter`], logs through `log`.

use crate::cli::Command;
use crate::config::Config;
use crate::enumerator;
use crate::errors::{exit_code_for, EXIT_OK};
use crate::firstboot::{FirstBoot, FirstBootOutcome};
use crate::identity;
use crate::interrupt;
use crate::medium;
use crate::orchestrator::preflight::Preflight;
use crate::orchestrator::{Orchestrator, ProvisionRequest, RunOutcome};
use crate::selector::{self, Prompter, Selection, SlotChoice};
use anyhow::Result;
use edgeflash_hal::ProvisionHal;
use std::path::Path;

pub struct Session<'a, H: ProvisionHal + ?Sized> {
    hal: &'a H,
    cfg: &'a Config,
    dry_run: bool,
    path_env: Option<String>,
}

impl<'a, H: ProvisionHal + ?Sized> Session<'a, H> {
    pub fn new(hal: &'a H, cfg: &'a Config, dry_run: bool) -> Self {
        Self {
            hal,
            cfg,
            dry_run,
            path_env: None,
        }
    }

    /// Search path for the preflight tool check (defaults to `$PATH`).
    pub fn with_path_env(mut self, path_env: impl Into<String>) -> Self {
        self.path_env = Some(path_env.into());
        self
    }

    /// Run one subcommand and map its result to an exit status.
    pub fn dispatch(&self, command: &Command, prompter: &mut dyn Prompter) -> i32 {
        let result = match command {
            Command::List => self.list(prompter),
            Command::Identify => self.identify(prompter),
            Command::Preflight => self.preflight(prompter),
            Command::Flash { os_slot, yes_slot } => self.flash(prompter, os_slot.as_deref(), *yes_slot),
            Command::WriteMedium { image } => self.write_medium(prompter, image),
            Command::Firstboot => self.firstboot(prompter),
        };
        match result {
            Ok(code) => code,
            Err(e) => {
                log::error!("{e:#}");
                prompter.say(&format!("Error: {e:#}"));
                exit_code_for(&e)
            }
        }
    }

    fn list(&self, prompter: &mut dyn Prompter) -> Result<i32> {
        let inventory = enumerator::scan(self.hal)?;
        match &inventory.root_disk {
            Some(root) => prompter.say(&format!("Running system is on {}", root.display())),
            None => prompter.say("Running system disk could not be determined"),
        }
        if inventory.devices.is_empty() {
            prompter.say("No storage devices found.");
        }
        for dev in &inventory.devices {
            prompter.say(&format!("  {:<9} {}", dev.role, dev.summary()));
        }
        Ok(EXIT_OK)
    }

    fn identify(&self, prompter: &mut dyn Prompter) -> Result<i32> {
        let variant = identity::gate_usb(self.hal)?;
        prompter.say(&format!("{variant} ({}) in recovery mode", variant.recovery_id()));
        Ok(EXIT_OK)
    }

    fn preflight_runner(&self) -> Preflight<'_> {
        let preflight = Preflight::new(&self.cfg.flash, self.dry_run);
        match &self.path_env {
            Some(path_env) => preflight.with_path_env(path_env.clone()),
            None => preflight,
        }
    }

    fn preflight(&self, prompter: &mut dyn Prompter) -> Result<i32> {
        let report = self.preflight_runner().run(self.hal)?;
        if let Some(advisory) = &report.advisory {
            prompter.say(&format!("Warning: {advisory}"));
        }
        if report.installed.is_empty() {
            prompter.say("All flash dependencies are present.");
        } else if self.dry_run {
            prompter.say(&format!("Would install: {}", report.installed.join(" ")));
        } else {
            prompter.say(&format!("Installed: {}", report.installed.join(" ")));
        }
        Ok(EXIT_OK)
    }

    fn flash(&self, prompter: &mut dyn Prompter, os_slot: Option<&str>, yes_slot: bool) -> Result<i32> {
        let variant = identity::gate_usb(self.hal)?;
        prompter.say(&format!("Found {variant} in recovery mode."));

        let preset = os_slot.unwrap_or(&self.cfg.defaults.os_slot);
        let (slots, token) =
            match selector::select_slots(prompter, &self.cfg.defaults.slots, Some(preset), yes_slot)? {
                SlotChoice::Confirmed { slots, token } => (slots, token),
                SlotChoice::Quit => {
                    prompter.say("Nothing was written.");
                    return Ok(RunOutcome::Declined.exit_code());
                }
            };

        // The module may have been unplugged while the operator was typing.
        let again = identity::gate_usb(self.hal)?;
        if again != variant {
            anyhow::bail!("attached module changed from {variant} to {again} during confirmation");
        }

        interrupt::install()?;
        let mut orchestrator = Orchestrator::new(self.hal, self.cfg, self.dry_run, interrupt::flag());
        if let Some(path_env) = &self.path_env {
            orchestrator = orchestrator.with_path_env(path_env.clone());
        }
        let summary = orchestrator.run(&ProvisionRequest {
            variant,
            slots,
            token,
        })?;

        match &summary.outcome {
            RunOutcome::Success if self.dry_run => {
                if let Some(cmd) = &summary.flash_command {
                    prompter.say(&format!("Dry run complete. Would run: {cmd}"));
                }
            }
            RunOutcome::Success => prompter.say("Flash completed. Reboot the module to finish setup."),
            RunOutcome::WatchdogAbort { reason } => {
                prompter.say(&format!("Watchdog abort: {reason}"));
            }
            RunOutcome::Failed { message, .. } => prompter.say(&format!("Flash failed: {message}")),
            RunOutcome::Interrupted => prompter.say("Interrupted; host state restored."),
            RunOutcome::Declined => {}
        }
        if let Some(block) = &summary.diagnostics {
            prompter.say(block);
        }
        if let Some(log_path) = &summary.log_path {
            prompter.say(&format!("Run log: {}", log_path.display()));
        }
        Ok(summary.outcome.exit_code())
    }

    fn write_medium(&self, prompter: &mut dyn Prompter, image: &Path) -> Result<i32> {
        let selection = match selector::select_target(self.hal, prompter, &self.cfg.medium.confirm_phrase)? {
            Selection::Confirmed(sel) => sel,
            Selection::Quit => {
                prompter.say("Nothing was written.");
                return Ok(RunOutcome::Declined.exit_code());
            }
        };
        let done = medium::write_medium(self.hal, selection, image, self.dry_run)?;
        let verb = if self.dry_run { "Would write" } else { "Wrote" };
        prompter.say(&format!("{verb} {} to {}", done.image.display(), done.device.display()));
        Ok(EXIT_OK)
    }

    fn firstboot(&self, prompter: &mut dyn Prompter) -> Result<i32> {
        match FirstBoot::new(self.hal, &self.cfg.firstboot, self.dry_run).run()? {
            FirstBootOutcome::AlreadyDone => prompter.say("Data storage already initialized."),
            FirstBootOutcome::Initialized(rec) => {
                prompter.say(&format!(
                    "Data disk {} ({}) mounted at {}{}",
                    rec.data_disk.display(),
                    rec.uuid.as_deref().unwrap_or("new filesystem"),
                    self.cfg.firstboot.mount_point.display(),
                    if rec.formatted { ", freshly formatted" } else { "" }
                ));
                if let Ok(json) = serde_json::to_string(&rec) {
                    log::info!("First boot record: {json}");
                }
            }
        }
        Ok(EXIT_OK)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::EXIT_PRECONDITION;
    use crate::identity::ModuleVariant;
    use crate::selector::ScriptedPrompter;
    use edgeflash_hal::{BlockDeviceInfo, FakeHal, Transport};
    use std::path::PathBuf;

    #[test]
    fn identify_reports_the_variant() {
        let hal = FakeHal::new();
        hal.set_usb_ids(vec![ModuleVariant::OrinNano4Gb.recovery_id()]);
        let cfg = Config::default();
        let mut p = ScriptedPrompter::new(Vec::<String>::new());
        assert_eq!(Session::new(&hal, &cfg, false).dispatch(&Command::Identify, &mut p), EXIT_OK);
        assert!(p.transcript.iter().any(|l| l.contains("Orin Nano 4GB") && l.contains("0955:7623")));
    }

    #[test]
    fn no_module_is_a_precondition_failure() {
        let hal = FakeHal::new();
        let cfg = Config::default();
        let mut p = ScriptedPrompter::new(Vec::<String>::new());
        let code = Session::new(&hal, &cfg, false).dispatch(&Command::Identify, &mut p);
        assert_eq!(code, EXIT_PRECONDITION);
        assert!(p.transcript.iter().any(|l| l.starts_with("Error: no supported device")));
    }

    #[test]
    fn declined_flash_exits_cleanly_without_touching_the_host() {
        let hal = FakeHal::new();
        hal.set_usb_ids(vec![ModuleVariant::OrinNano8Gb.recovery_id()]);
        let cfg = Config::default();
        let mut p = ScriptedPrompter::new(["q"]);
        let code = Session::new(&hal, &cfg, false).dispatch(
            &Command::Flash {
                os_slot: None,
                yes_slot: false,
            },
            &mut p,
        );
        assert_eq!(code, EXIT_OK);
        assert_eq!(hal.operation_count(), 0);
    }

    #[test]
    fn list_marks_the_root_disk() {
        let hal = FakeHal::new();
        let mut sda = BlockDeviceInfo::new("sda", 256 << 30, Transport::Sata);
        sda.partitions = vec![PathBuf::from("/dev/sda1")];
        hal.add_block_device(sda);
        hal.add_block_device(BlockDeviceInfo::new("sdb", 16 << 30, Transport::Usb));
        hal.set_mountinfo("22 1 8:1 / / rw - ext4 /dev/sda1 rw\n");
        let cfg = Config::default();
        let mut p = ScriptedPrompter::new(Vec::<String>::new());
        assert_eq!(Session::new(&hal, &cfg, false).dispatch(&Command::List, &mut p), EXIT_OK);
        assert!(p.transcript.iter().any(|l| l.contains("root") && l.contains("sda")));
        assert!(p.transcript.iter().any(|l| l.contains("candidate") && l.contains("sdb")));
    }
}
