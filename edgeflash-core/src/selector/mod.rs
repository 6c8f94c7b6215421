//! Target selector.
//!
//! Picks one whole-disk host device with a two-step commit: choose it (by
//! ordinal or name), then type a confirmation phrase that differs from the
//! choice. The root-backing disk is filtered from the list and rejected again
//! at revalidation, because devices can change between listing and choosing.

pub mod prompt;
pub mod slots;

pub use prompt::{Prompter, ScriptedPrompter, TerminalPrompter};
pub use slots::{select_slots, SlotAssignment, SlotChoice};

use crate::enumerator::{self, Device, DeviceRole};
use crate::errors::ProvisionError;
use anyhow::Result;
use edgeflash_hal::{HostInfoOps, ProbeOps};
use std::path::{Path, PathBuf};

/// Proof that the operator typed the confirmation phrase.
///
/// Only this module can mint one.
#[derive(Debug, PartialEq, Eq)]
pub struct ConfirmationToken(());

impl ConfirmationToken {
    pub(crate) fn issue() -> Self {
        Self(())
    }
}

/// A confirmed, revalidated device choice.
#[derive(Debug)]
pub struct SelectionResult {
    pub device: PathBuf,
    /// Most stable alias (`/dev/disk/by-id/...`) at confirmation time.
    pub alias: Option<PathBuf>,
    pub token: ConfirmationToken,
}

#[derive(Debug)]
pub enum Selection {
    Confirmed(SelectionResult),
    /// Operator chose to quit; nothing was touched.
    Quit,
}

enum Choice {
    Quit,
    Rescan,
    Device(String),
    Invalid(String),
}

fn parse_choice(answer: &str, candidates: &[&Device]) -> Choice {
    let answer = answer.trim();
    match answer.to_ascii_lowercase().as_str() {
        "q" | "quit" => return Choice::Quit,
        "r" | "rescan" | "" => return Choice::Rescan,
        _ => {}
    }
    if let Ok(n) = answer.parse::<usize>() {
        return match n.checked_sub(1).and_then(|i| candidates.get(i)) {
            Some(d) => Choice::Device(d.name.clone()),
            None => Choice::Invalid(format!("No device #{n} in the list.")),
        };
    }
    // Literal names are resolved against a fresh scan during revalidation,
    // so a listed-but-filtered device (the root disk) is still caught there.
    Choice::Device(answer.strip_prefix("/dev/").unwrap_or(answer).to_string())
}

/// Structural checks on a chosen device against the current system state.
pub fn revalidate<H: ProbeOps + HostInfoOps + ?Sized>(
    hal: &H,
    name: &str,
) -> Result<Device, ProvisionError> {
    let inventory = enumerator::scan(hal).map_err(|e| ProvisionError::Selection(format!("{e:#}")))?;
    let Some(root) = inventory.root_disk.as_deref() else {
        return Err(ProvisionError::Selection(
            "cannot determine which disk backs the running system; refusing to select".to_string(),
        ));
    };

    let path = Path::new("/dev").join(name);
    if hal.parent_disk(&path)?.is_some() {
        return Err(ProvisionError::Selection(format!(
            "{} is a partition; choose the whole disk",
            path.display()
        )));
    }
    let Some(device) = inventory.find(name) else {
        return Err(ProvisionError::Selection(format!(
            "{} is not a disk visible to this host",
            path.display()
        )));
    };
    if device.path == root || device.role == DeviceRole::RootBacking {
        return Err(ProvisionError::Selection(format!(
            "{} backs the running system and can never be a target",
            device.path.display()
        )));
    }
    Ok(device.clone())
}

/// Interactive selection loop.
///
/// Runs until the operator confirms a valid device or quits. An empty
/// candidate set offers a rescan instead of failing, since removable media
/// may be attached late. A declined or mistyped confirmation goes back to the
/// list.
pub fn select_target<H: ProbeOps + HostInfoOps + ?Sized>(
    hal: &H,
    prompter: &mut dyn Prompter,
    confirm_phrase: &str,
) -> Result<Selection> {
    loop {
        let inventory = enumerator::scan(hal)?;
        if inventory.root_disk.is_none() {
            return Err(ProvisionError::Selection(
                "cannot determine which disk backs the running system; refusing to select"
                    .to_string(),
            )
            .into());
        }
        let candidates = inventory.candidates();

        if candidates.is_empty() {
            prompter.say("No candidate devices found. Attach the target device.");
            let answer = prompter.ask("[r]escan or [q]uit", Some("r"))?;
            if matches!(parse_choice(&answer, &[]), Choice::Quit) {
                return Ok(Selection::Quit);
            }
            continue;
        }

        prompter.say("Candidate devices:");
        for (i, dev) in candidates.iter().enumerate() {
            prompter.say(&format!("  {}) {}", i + 1, dev.summary()));
        }

        let answer = prompter.ask("Device number or name ([r]escan, [q]uit)", None)?;
        let name = match parse_choice(&answer, &candidates) {
            Choice::Quit => return Ok(Selection::Quit),
            Choice::Rescan => continue,
            Choice::Invalid(msg) => {
                prompter.say(&msg);
                continue;
            }
            Choice::Device(name) => name,
        };

        let device = match revalidate(hal, &name) {
            Ok(d) => d,
            Err(e) => {
                log::warn!("Rejected selection {name}: {e}");
                prompter.say(&format!("Rejected: {e}"));
                continue;
            }
        };

        let phrase = format!("{} {}", confirm_phrase, device.name);
        prompter.say(&format!(
            "ALL DATA on {} ({}) will be destroyed.",
            device.path.display(),
            device.summary().trim()
        ));
        let typed = prompter.ask(&format!("Type '{phrase}' to continue"), None)?;
        if typed.trim() != phrase {
            prompter.say("Confirmation did not match; nothing was written.");
            log::info!("Operator declined confirmation for {}", device.path.display());
            continue;
        }

        log::info!("Operator confirmed {}", device.path.display());
        return Ok(Selection::Confirmed(SelectionResult {
            alias: device.alias.clone(),
            device: device.path,
            token: ConfirmationToken::issue(),
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use edgeflash_hal::{BlockDeviceInfo, FakeHal, Transport};

    fn host() -> FakeHal {
        let hal = FakeHal::new();
        let mut alpha = BlockDeviceInfo::new("sda", 256 << 30, Transport::Sata);
        alpha.partitions = vec![PathBuf::from("/dev/sda1"), PathBuf::from("/dev/sda2")];
        hal.add_block_device(alpha);
        hal.add_block_device(BlockDeviceInfo::new("sdb", 16 << 30, Transport::Usb));
        hal.add_block_device(BlockDeviceInfo::new("sdc", 64 << 30, Transport::Usb));
        hal.add_alias("/dev/disk/by-id/usb-SanDisk_Ultra-0:0", "/dev/sdc");
        hal.set_mountinfo("22 1 8:2 / / rw - ext4 /dev/sda2 rw\n");
        hal
    }

    #[test]
    fn ordinal_choice_then_typed_phrase_confirms() {
        let hal = host();
        let mut p = ScriptedPrompter::new(["2", "ERASE sdc"]);
        let Selection::Confirmed(sel) = select_target(&hal, &mut p, "ERASE").unwrap() else {
            panic!("expected confirmation");
        };
        assert_eq!(sel.device, PathBuf::from("/dev/sdc"));
        assert_eq!(
            sel.alias,
            Some(PathBuf::from("/dev/disk/by-id/usb-SanDisk_Ultra-0:0"))
        );
    }

    #[test]
    fn root_disk_by_name_is_rejected_even_though_unlisted() {
        let hal = host();
        let mut p = ScriptedPrompter::new(["/dev/sda", "q"]);
        assert!(matches!(
            select_target(&hal, &mut p, "ERASE").unwrap(),
            Selection::Quit
        ));
        assert!(p.transcript.iter().any(|l| l.contains("backs the running system")));
        assert!(!p.transcript.iter().any(|l| l.contains(") sda ")));
    }

    #[test]
    fn partitions_are_rejected() {
        let hal = host();
        let err = revalidate(&hal, "sda1").unwrap_err();
        assert!(err.to_string().contains("partition"));
    }

    #[test]
    fn plain_yes_does_not_confirm_and_loop_reselects() {
        let hal = host();
        let mut p = ScriptedPrompter::new(["sdb", "y", "sdb", "yes", "1", "ERASE sdb"]);
        let sel = select_target(&hal, &mut p, "ERASE").unwrap();
        assert!(matches!(sel, Selection::Confirmed(ref s) if s.device == Path::new("/dev/sdb")));
        assert_eq!(
            p.transcript
                .iter()
                .filter(|l| l.contains("did not match"))
                .count(),
            2
        );
    }

    #[test]
    fn empty_candidate_set_offers_rescan_until_device_appears() {
        let hal = FakeHal::new();
        let mut root = BlockDeviceInfo::new("nvme0n1", 1 << 40, Transport::Nvme);
        root.partitions = vec![PathBuf::from("/dev/nvme0n1p2")];
        hal.add_block_device(root);
        hal.set_mountinfo("22 1 259:2 / / rw - ext4 /dev/nvme0n1p2 rw\n");

        struct AttachOnRescan {
            inner: ScriptedPrompter,
            hal: FakeHal,
        }
        impl Prompter for AttachOnRescan {
            fn ask(&mut self, prompt: &str, default: Option<&str>) -> Result<String> {
                if prompt.starts_with("[r]escan") {
                    self.hal
                        .add_block_device(BlockDeviceInfo::new("sdb", 8 << 30, Transport::Usb));
                }
                self.inner.ask(prompt, default)
            }
            fn say(&mut self, line: &str) {
                self.inner.say(line);
            }
        }

        let mut p = AttachOnRescan {
            inner: ScriptedPrompter::new(["", "1", "ERASE sdb"]),
            hal: hal.clone(),
        };
        let sel = select_target(&hal, &mut p, "ERASE").unwrap();
        assert!(matches!(sel, Selection::Confirmed(ref s) if s.device == Path::new("/dev/sdb")));
    }

    #[test]
    fn unknown_root_refuses_selection() {
        let hal = host();
        hal.set_mountinfo("22 1 0:30 / / rw - overlay overlay rw\n");
        let mut p = ScriptedPrompter::new(["1", "ERASE sdb"]);
        assert!(select_target(&hal, &mut p, "ERASE").is_err());
    }
}
