mod common;

use common::{config, host, process_gone, toolkit, AUTOSUSPEND};
use edgeflash_core::errors::{exit_code_for, EXIT_INTERRUPTED, EXIT_PRECONDITION, EXIT_WATCHDOG};
use edgeflash_core::identity::ModuleVariant;
use edgeflash_core::orchestrator::host_state::HostStateSnapshot;
use edgeflash_core::orchestrator::{Orchestrator, ProvisionRequest, RunOutcome};
use edgeflash_core::selector::{select_slots, ScriptedPrompter, SlotChoice};
use edgeflash_hal::{Operation, SysfsOps};
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};
use tempfile::tempdir;

fn request() -> ProvisionRequest {
    let mut prompter = ScriptedPrompter::new(["nvme0n1", "FLASH nvme0n1"]);
    let slots = vec!["nvme0n1".to_string(), "nvme1n1".to_string()];
    match select_slots(&mut prompter, &slots, None, false).unwrap() {
        SlotChoice::Confirmed { slots, token } => ProvisionRequest {
            variant: ModuleVariant::OrinNano8Gb,
            slots,
            token,
        },
        SlotChoice::Quit => panic!("scripted confirmation was refused"),
    }
}

fn report_json(dir: &Path) -> serde_json::Value {
    let report = fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().path())
        .find(|p| p.file_name().unwrap().to_string_lossy().starts_with("run-"))
        .expect("run report written");
    serde_json::from_str(&fs::read_to_string(report).unwrap()).unwrap()
}

#[test]
fn vanished_module_aborts_the_run_and_kills_the_tool() {
    let tmp = tempdir().unwrap();
    let pidfile = tmp.path().join("tool.pid");
    let kit = toolkit(&tmp, &format!("echo $$ > {}\nexec sleep 30", pidfile.display()));
    let cfg = config(&tmp, &kit);
    let hal = host();
    let before = HostStateSnapshot::capture(&hal, &cfg.flash);

    let unplug = hal.clone();
    let pidfile_seen = pidfile.clone();
    let unplugger = thread::spawn(move || {
        let deadline = Instant::now() + Duration::from_secs(10);
        while !pidfile_seen.exists() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(20));
        }
        unplug.set_usb_ids(Vec::new());
    });

    let interrupt = AtomicBool::new(false);
    let started = Instant::now();
    let summary = Orchestrator::new(&hal, &cfg, false, &interrupt)
        .run(&request())
        .unwrap();
    unplugger.join().unwrap();

    assert!(
        matches!(summary.outcome, RunOutcome::WatchdogAbort { ref reason } if reason.contains("recovery")),
        "got {:?}",
        summary.outcome
    );
    assert_eq!(summary.outcome.exit_code(), EXIT_WATCHDOG);
    assert!(started.elapsed() < Duration::from_secs(20));

    let pid: u32 = fs::read_to_string(&pidfile).unwrap().trim().parse().unwrap();
    assert!(process_gone(pid), "flash tool {pid} still running");

    assert!(summary.diagnostics.as_deref().unwrap().contains("reason:"));
    assert!(summary.diagnostics_path.unwrap().exists());
    assert_eq!(report_json(&cfg.flash.log_dir)["outcome"]["kind"], "watchdog_abort");
    assert_eq!(HostStateSnapshot::capture(&hal, &cfg.flash), before);
}

#[test]
fn host_state_is_restored_after_a_failed_tool() {
    let tmp = tempdir().unwrap();
    let kit = toolkit(&tmp, "echo 'Error: flashing failed' >&2\nexit 1");
    let cfg = config(&tmp, &kit);
    let hal = host();
    let before = HostStateSnapshot::capture(&hal, &cfg.flash);

    let interrupt = AtomicBool::new(false);
    let summary = Orchestrator::new(&hal, &cfg, false, &interrupt)
        .run(&request())
        .unwrap();

    assert!(matches!(summary.outcome, RunOutcome::Failed { code: Some(1), .. }));
    // The run did change things while it was going.
    assert!(hal.has_operation(|op| matches!(op, Operation::StopUnit { unit } if unit == "ufw.service")));
    assert!(hal.has_operation(|op| matches!(op, Operation::SetOffload { enabled: false, .. })));
    assert!(!hal.has_operation(
        |op| matches!(op, Operation::StopUnit { unit } if unit == "firewalld.service")
    ));

    assert_eq!(HostStateSnapshot::capture(&hal, &cfg.flash), before);
    assert_eq!(hal.read_attr(Path::new(AUTOSUSPEND)).unwrap(), "2");

    let log = fs::read_to_string(summary.log_path.unwrap()).unwrap();
    assert!(log.contains("Error: flashing failed"));
    assert!(summary.diagnostics.unwrap().contains("Error: flashing failed"));
}

#[test]
fn conflicting_vpn_is_refused_and_nothing_is_left_changed() {
    let tmp = tempdir().unwrap();
    let kit = toolkit(&tmp, "exit 0");
    let cfg = config(&tmp, &kit);
    let hal = host();
    hal.set_interface("wg0");
    let before = HostStateSnapshot::capture(&hal, &cfg.flash);

    let interrupt = AtomicBool::new(false);
    let err = Orchestrator::new(&hal, &cfg, false, &interrupt)
        .run(&request())
        .unwrap_err();

    assert_eq!(exit_code_for(&err), EXIT_PRECONDITION);
    assert!(format!("{err:#}").contains("wg0"));
    assert_eq!(HostStateSnapshot::capture(&hal, &cfg.flash), before);
    assert_eq!(report_json(&cfg.flash.log_dir)["exit_code"], EXIT_PRECONDITION);
}

#[test]
fn clean_run_succeeds_and_pins_the_link() {
    let tmp = tempdir().unwrap();
    let kit = toolkit(&tmp, "echo \"$@\"\necho 'Writing partition APP'\nexit 0");
    let cfg = config(&tmp, &kit);
    let hal = host();

    let interrupt = AtomicBool::new(false);
    let summary = Orchestrator::new(&hal, &cfg, false, &interrupt)
        .run(&request())
        .unwrap();

    assert_eq!(summary.outcome, RunOutcome::Success);
    assert!(summary.diagnostics.is_none());
    let wd = summary.watchdog.unwrap();
    assert!(wd.marker_seen);
    assert!(wd.reason.is_none());

    let log = fs::read_to_string(summary.log_path.unwrap()).unwrap();
    assert!(log.contains("--external-device nvme0n1p1"));
    assert!(log.contains("--network usb0"));

    let rule = fs::read_to_string(&cfg.flash.udev_rule).unwrap();
    assert!(rule.contains("0955"));
    assert!(hal.has_operation(|op| matches!(op, Operation::UdevReload)));

    let report = report_json(&cfg.flash.log_dir);
    assert_eq!(report["outcome"]["kind"], "success");
    assert_eq!(report["slots"]["data"], "nvme1n1");
}

#[test]
fn operator_interrupt_stops_the_tool() {
    let tmp = tempdir().unwrap();
    let kit = toolkit(&tmp, "exec sleep 30");
    let cfg = config(&tmp, &kit);
    let hal = host();
    let before = HostStateSnapshot::capture(&hal, &cfg.flash);

    let interrupt = AtomicBool::new(false);
    let summary = thread::scope(|s| {
        s.spawn(|| {
            thread::sleep(Duration::from_millis(300));
            interrupt.store(true, Ordering::SeqCst);
        });
        Orchestrator::new(&hal, &cfg, false, &interrupt)
            .run(&request())
            .unwrap()
    });

    assert_eq!(summary.outcome, RunOutcome::Interrupted);
    assert_eq!(summary.outcome.exit_code(), EXIT_INTERRUPTED);
    assert!(summary.diagnostics.is_none());
    assert_eq!(HostStateSnapshot::capture(&hal, &cfg.flash), before);
}

#[test]
fn dry_run_changes_nothing_and_writes_no_report() {
    let tmp = tempdir().unwrap();
    let kit = toolkit(&tmp, "exit 1");
    let cfg = config(&tmp, &kit);
    let hal = host();

    let interrupt = AtomicBool::new(false);
    let summary = Orchestrator::new(&hal, &cfg, true, &interrupt)
        .run(&request())
        .unwrap();

    assert_eq!(summary.outcome, RunOutcome::Success);
    assert!(summary.flash_command.unwrap().contains("l4t_initrd_flash.sh"));
    assert!(!hal.has_operation(|op| !matches!(op, Operation::Command { .. })));
    assert!(!cfg.flash.udev_rule.exists());
    assert!(!cfg.flash.log_dir.exists());
}
