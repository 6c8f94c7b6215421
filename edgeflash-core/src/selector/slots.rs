//! Two-slot OS/DATA assignment on the target module.
//!
//! The module carries two interchangeable storage slots. The operator picks
//! the OS slot; DATA is always the other one.

use super::{ConfirmationToken, Prompter};
use crate::errors::ProvisionError;
use anyhow::Result;
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SlotAssignment {
    pub os: String,
    pub data: String,
}

impl SlotAssignment {
    /// Derive the DATA slot as whichever of `slots` is not `os`.
    pub fn derive(slots: &[String], os: &str) -> Result<Self, ProvisionError> {
        let [a, b] = slots else {
            return Err(ProvisionError::Selection(format!(
                "expected exactly two storage slots, got {}",
                slots.len()
            )));
        };
        if a == b {
            return Err(ProvisionError::Selection(format!(
                "storage slots must differ (both are {a})"
            )));
        }
        let os = os.trim();
        let os = os.strip_prefix("/dev/").unwrap_or(os);
        let data = if os == a {
            b
        } else if os == b {
            a
        } else {
            return Err(ProvisionError::Selection(format!(
                "{os} is not a storage slot (choose {a} or {b})"
            )));
        };
        Ok(Self {
            os: os.to_string(),
            data: data.clone(),
        })
    }
}

#[derive(Debug)]
pub enum SlotChoice {
    Confirmed {
        slots: SlotAssignment,
        token: ConfirmationToken,
    },
    Quit,
}

/// Ask for the OS slot (unless `preset` is given and `skip_prompt` is set),
/// show the derived assignment and require the typed phrase `FLASH <os>`.
///
/// A mismatched confirmation re-asks from the slot question.
pub fn select_slots(
    prompter: &mut dyn Prompter,
    slots: &[String],
    preset: Option<&str>,
    skip_prompt: bool,
) -> Result<SlotChoice> {
    let mut preset = preset.map(str::to_string);
    loop {
        let answer = match (preset.take(), skip_prompt) {
            (Some(p), true) => p,
            (p, _) => {
                let default = p.as_deref().or(slots.first().map(String::as_str));
                prompter.ask(
                    &format!("OS storage slot ({}) or [q]uit", slots.join("/")),
                    default,
                )?
            }
        };
        if matches!(answer.trim(), "q" | "quit") {
            return Ok(SlotChoice::Quit);
        }

        let assignment = match SlotAssignment::derive(slots, &answer) {
            Ok(a) => a,
            Err(e) => {
                prompter.say(&e.to_string());
                continue;
            }
        };

        prompter.say(&format!(
            "OS   -> {} (flashed, all data destroyed)\nDATA -> {} (initialized on first boot)",
            assignment.os, assignment.data
        ));
        let phrase = format!("FLASH {}", assignment.os);
        let typed = prompter.ask(&format!("Type '{phrase}' to continue"), None)?;
        if typed.trim() == phrase {
            log::info!("Slots confirmed: OS={} DATA={}", assignment.os, assignment.data);
            return Ok(SlotChoice::Confirmed {
                slots: assignment,
                token: ConfirmationToken::issue(),
            });
        }
        prompter.say("Confirmation did not match; nothing was written.");
    }
}
