//! SIGINT/SIGTERM handling for the flashing phase.
//!
//! The handler only sets a flag. The watchdog polls it, kills the flash
//! tool's process group and the orchestrator unwinds normally, so host state
//! is restored by the usual guards.

use anyhow::{Context, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::OnceLock;

static INTERRUPTED: AtomicBool = AtomicBool::new(false);
static HANDLER_SET: OnceLock<()> = OnceLock::new();

/// Install the handler for SIGINT, SIGTERM and SIGHUP. Idempotent.
pub fn install() -> Result<()> {
    if HANDLER_SET.get().is_some() {
        return Ok(());
    }

    ctrlc::set_handler(|| {
        INTERRUPTED.store(true, Ordering::SeqCst);
        log::info!("Interrupt received; stopping the flash tool");
    })
    .context("failed to install interrupt handler")?;

    let _ = HANDLER_SET.set(());
    log::debug!("Interrupt handler installed");
    Ok(())
}

/// Process-wide interrupt flag.
pub fn flag() -> &'static AtomicBool {
    &INTERRUPTED
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn install_twice_is_fine() {
        install().unwrap();
        install().unwrap();
        assert!(!flag().load(Ordering::SeqCst));
    }
}
