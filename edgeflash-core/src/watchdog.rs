//! Link watchdog.
//!
//! Runs beside the delegated flash tool. Every poll it re-runs the identity
//! gate on the USB bus and checks the transport interface; a signal missing
//! for `grace_polls` consecutive polls aborts the run. It also scans the
//! tool's output for the transfer-phase marker and, on first sighting, probes
//! that the served image is readable from the target at a useful rate.
//!
//! The watchdog owns its [`WatchdogState`]; the orchestrator reads the final
//! [`WatchdogReport`] only after joining the thread.

use crate::config::WatchdogConfig;
use crate::errors::IdentityError;
use crate::identity;
use edgeflash_hal::{NetOps, ProcessOps, UsbOps};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::time::{Duration, Instant};

/// Upper bound on how long the loop sleeps before re-checking stop/interrupt.
const WAKE_SLICE: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, PartialEq)]
pub enum AbortReason {
    DeviceLost { polls: u32 },
    DeviceAmbiguous(String),
    LinkLost { interface: String, polls: u32 },
    TransferStalled(String),
    Interrupted,
}

impl AbortReason {
    /// Operator interrupts are not watchdog failures.
    pub fn is_interrupt(&self) -> bool {
        matches!(self, AbortReason::Interrupted)
    }
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AbortReason::DeviceLost { polls } => write!(
                f,
                "target left recovery mode: USB identity missing for {polls} consecutive polls"
            ),
            AbortReason::DeviceAmbiguous(which) => {
                write!(f, "more than one supported device appeared during flashing ({which})")
            }
            AbortReason::LinkLost { interface, polls } => write!(
                f,
                "transport interface {interface} disappeared for {polls} consecutive polls"
            ),
            AbortReason::TransferStalled(detail) => {
                write!(f, "image transfer would stall: {detail}")
            }
            AbortReason::Interrupted => write!(f, "interrupted by operator"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DevicePresence {
    Present,
    Missing,
    Ambiguous(String),
}

/// One liveness poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sample {
    pub device: DevicePresence,
    pub link_present: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct WatchdogState {
    pub missing_device: u32,
    pub missing_link: u32,
    /// The interface only exists once the target's flashing initrd is up, so
    /// it is counted as missing only after it has been seen once.
    pub link_seen: bool,
    reason: Option<AbortReason>,
}

impl WatchdogState {
    pub fn reason(&self) -> Option<&AbortReason> {
        self.reason.as_ref()
    }

    /// Record an abort. The first reason wins; the state is terminal after.
    pub fn abort(&mut self, reason: AbortReason) -> &AbortReason {
        self.reason.get_or_insert(reason)
    }

    /// Fold one poll into the counters; returns the abort reason once tripped.
    pub fn observe(&mut self, sample: &Sample, interface: &str, grace: u32) -> Option<&AbortReason> {
        if self.reason.is_some() {
            return self.reason.as_ref();
        }

        match &sample.device {
            DevicePresence::Present => self.missing_device = 0,
            DevicePresence::Missing => self.missing_device += 1,
            DevicePresence::Ambiguous(which) => {
                return Some(self.abort(AbortReason::DeviceAmbiguous(which.clone())));
            }
        }

        if sample.link_present {
            self.link_seen = true;
            self.missing_link = 0;
        } else if self.link_seen {
            self.missing_link += 1;
        }

        if self.missing_device >= grace {
            let polls = self.missing_device;
            return Some(self.abort(AbortReason::DeviceLost { polls }));
        }
        if self.missing_link >= grace {
            let polls = self.missing_link;
            return Some(self.abort(AbortReason::LinkLost {
                interface: interface.to_string(),
                polls,
            }));
        }
        None
    }
}

/// Throughput check of the served image, run from the target.
pub trait TransferProbe: Send + Sync {
    /// Measured read rate in MiB/s.
    fn measure(&self) -> Result<f64, String>;
}

/// Reads the first `probe_mib` MiB of the image on the target over ssh.
pub struct SshTransferProbe<'a, H: ProcessOps + ?Sized> {
    hal: &'a H,
    cfg: WatchdogConfig,
}

impl<'a, H: ProcessOps + ?Sized> SshTransferProbe<'a, H> {
    pub fn new(hal: &'a H, cfg: &WatchdogConfig) -> Self {
        Self {
            hal,
            cfg: cfg.clone(),
        }
    }

    pub fn args(&self) -> Vec<String> {
        vec![
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            "StrictHostKeyChecking=no".to_string(),
            "-o".to_string(),
            "UserKnownHostsFile=/dev/null".to_string(),
            "-o".to_string(),
            "ConnectTimeout=10".to_string(),
            self.cfg.probe_target.clone(),
            format!(
                "dd if={} of=/dev/null bs=1M count={}",
                self.cfg.probe_image, self.cfg.probe_mib
            ),
        ]
    }
}

impl<H: ProcessOps + Sync + ?Sized> TransferProbe for SshTransferProbe<'_, H> {
    fn measure(&self) -> Result<f64, String> {
        let args = self.args();
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        let started = Instant::now();
        self.hal
            .command_status("ssh", &args, self.cfg.probe_timeout())
            .map_err(|e| e.to_string())?;
        let secs = started.elapsed().as_secs_f64().max(0.001);
        Ok(self.cfg.probe_mib as f64 / secs)
    }
}

fn check_transfer(probe: &dyn TransferProbe, min_mib_per_sec: f64) -> Result<f64, AbortReason> {
    match probe.measure() {
        Ok(rate) if rate >= min_mib_per_sec => Ok(rate),
        Ok(rate) => Err(AbortReason::TransferStalled(format!(
            "read probe got {rate:.1} MiB/s, need {min_mib_per_sec:.1} MiB/s"
        ))),
        Err(e) => Err(AbortReason::TransferStalled(format!("read probe failed: {e}"))),
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct WatchdogReport {
    pub reason: Option<AbortReason>,
    pub marker_seen: bool,
    pub probe_rate: Option<f64>,
    pub polls: u64,
}

pub struct Watchdog<'a, H: ?Sized> {
    hal: &'a H,
    cfg: &'a WatchdogConfig,
    interface: &'a str,
    probe: Option<&'a dyn TransferProbe>,
}

impl<'a, H: UsbOps + NetOps + ?Sized> Watchdog<'a, H> {
    pub fn new(
        hal: &'a H,
        cfg: &'a WatchdogConfig,
        interface: &'a str,
        probe: Option<&'a dyn TransferProbe>,
    ) -> Self {
        Self {
            hal,
            cfg,
            interface,
            probe,
        }
    }

    /// Poll the bus and the link once. Never fails: an unreadable bus counts
    /// as a missing device.
    pub fn sample(&self) -> Sample {
        let device = match identity::gate_usb(self.hal) {
            Ok(_) => DevicePresence::Present,
            Err(IdentityError::Ambiguous(which)) => DevicePresence::Ambiguous(which),
            Err(e) => {
                log::debug!("watchdog: device poll: {e}");
                DevicePresence::Missing
            }
        };
        let link_present = self.hal.interface_exists(self.interface).unwrap_or(false);
        Sample {
            device,
            link_present,
        }
    }

    /// Supervise until `stop` is set or an abort fires. On abort `kill` is
    /// called exactly once before returning.
    pub fn run(
        &self,
        lines: Receiver<String>,
        stop: &AtomicBool,
        interrupt: &AtomicBool,
        kill: &(dyn Fn() + Sync),
    ) -> WatchdogReport {
        let interval = self.cfg.poll_interval();
        let mut state = WatchdogState::default();
        let mut report = WatchdogReport::default();
        let mut lines_open = true;
        let mut next_poll = Instant::now() + interval;

        log::info!(
            "Watchdog armed: poll {:?}, grace {} polls, interface {}",
            interval,
            self.cfg.grace_polls,
            self.interface
        );

        loop {
            if stop.load(Ordering::SeqCst) {
                // The tool is done; only record what it printed last.
                if !report.marker_seen {
                    report.marker_seen = lines
                        .try_iter()
                        .any(|line| line.contains(&self.cfg.transfer_marker));
                }
                break;
            }
            if interrupt.load(Ordering::SeqCst) {
                state.abort(AbortReason::Interrupted);
                break;
            }

            let wait = next_poll
                .saturating_duration_since(Instant::now())
                .min(WAKE_SLICE);
            if lines_open {
                match lines.recv_timeout(wait) {
                    Ok(line) => {
                        if !report.marker_seen && line.contains(&self.cfg.transfer_marker) {
                            report.marker_seen = true;
                            log::info!("Watchdog: transfer phase started ({line})");
                            if let Some(probe) = self.probe {
                                match check_transfer(probe, self.cfg.min_mib_per_sec) {
                                    Ok(rate) => {
                                        log::info!("Watchdog: read probe {rate:.1} MiB/s");
                                        report.probe_rate = Some(rate);
                                    }
                                    Err(reason) => {
                                        state.abort(reason);
                                        break;
                                    }
                                }
                            }
                        }
                        continue;
                    }
                    Err(RecvTimeoutError::Timeout) => {}
                    Err(RecvTimeoutError::Disconnected) => lines_open = false,
                }
            } else {
                std::thread::sleep(wait);
            }

            if Instant::now() < next_poll {
                continue;
            }
            next_poll = Instant::now() + interval;
            report.polls += 1;

            let sample = self.sample();
            if sample.device != DevicePresence::Present || !sample.link_present {
                log::debug!("Watchdog poll {}: {:?}", report.polls, sample);
            }
            if state
                .observe(&sample, self.interface, self.cfg.grace_polls)
                .is_some()
            {
                break;
            }
        }

        if let Some(reason) = state.reason() {
            if reason.is_interrupt() {
                log::warn!("Watchdog: {reason}; stopping flash tool");
            } else {
                log::error!("Watchdog abort: {reason}");
            }
            kill();
        }
        report.reason = state.reason().cloned();
        report
    }
}
