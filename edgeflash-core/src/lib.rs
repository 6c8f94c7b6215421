//! edgeflash core library.
//!
//! Device enumeration, hardware identity gating, target selection, the
//! provisioning orchestrator with its link watchdog, and the first-boot
//! storage initializer. All host access goes through `edgeflash-hal`.

pub mod cli;
pub mod commands;
pub mod config;
pub mod enumerator;
pub mod errors;
pub mod firstboot;
pub mod identity;
pub mod interrupt;
pub mod logging;
pub mod medium;
pub mod orchestrator;
pub mod selector;
pub mod watchdog;

pub(crate) fn now_unix_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
