use std::fs;
use std::process::Command;
use tempfile::tempdir;

fn edgeflash() -> Command {
    Command::new(env!("CARGO_BIN_EXE_edgeflash"))
}

#[test]
fn malformed_config_is_fatal() {
    let tmp = tempdir().unwrap();
    let cfg = tmp.path().join("edgeflash.toml");
    fs::write(&cfg, "[flash]\nno_such_key = 1\n").unwrap();

    let out = edgeflash()
        .args(["list", "--config"])
        .arg(&cfg)
        .output()
        .unwrap();
    assert_eq!(out.status.code(), Some(1));
    assert!(String::from_utf8_lossy(&out.stderr).contains("invalid edgeflash config"));
}

#[test]
fn firstboot_short_circuits_on_marker() {
    let tmp = tempdir().unwrap();
    let marker = tmp.path().join("firstboot.done");
    fs::write(&marker, "").unwrap();
    let cfg = tmp.path().join("edgeflash.toml");
    fs::write(&cfg, format!("[firstboot]\nmarker = {:?}\n", marker.display().to_string())).unwrap();

    let out = edgeflash()
        .args(["firstboot", "--config"])
        .arg(&cfg)
        .output()
        .unwrap();
    assert_eq!(out.status.code(), Some(0));
    assert!(String::from_utf8_lossy(&out.stdout).contains("already initialized"));
}

#[test]
fn missing_subcommand_is_a_usage_error() {
    let out = edgeflash().output().unwrap();
    assert_eq!(out.status.code(), Some(2));
}
