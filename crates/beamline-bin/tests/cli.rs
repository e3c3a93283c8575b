//! Runs the `beamline` binary against the shipped configuration.

use std::io::Write;
use std::path::PathBuf;
use std::process::{Command, Output};

fn shipped_config() -> PathBuf {
    let mut path = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
    path.push("../../config/beamline.toml");
    path
}

fn beamline(config: &PathBuf, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_beamline"))
        .arg("--config")
        .arg(config)
        .args(args)
        .env("BEAMLINE_APPLICATION__LOG_LEVEL", "warn")
        .output()
        .unwrap()
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

#[test]
fn help_lists_commands() {
    let output = Command::new(env!("CARGO_BIN_EXE_beamline"))
        .arg("--help")
        .output()
        .unwrap();
    assert!(output.status.success());
    let text = stdout(&output);
    for command in ["inspect", "get", "set", "scan"] {
        assert!(text.contains(command), "missing {command} in help");
    }
}

#[test]
fn inspect_prints_enabled_devices() {
    let output = beamline(&shipped_config(), &["inspect"]);
    assert!(output.status.success());

    let text = stdout(&output);
    assert!(text.contains("sample-x (motor)"));
    assert!(text.contains("detector (camera)"));
    assert!(text.contains("mono (monochromator)"));
    assert!(text.contains("wavelength"));
    assert!(!text.contains("spare"));
}

#[test]
fn get_reads_json() {
    let output = beamline(
        &shipped_config(),
        &["get", "--device", "mono", "--parameter", "energy"],
    );
    assert!(output.status.success());
    let value: serde_json::Value = serde_json::from_str(stdout(&output).trim()).unwrap();
    assert_eq!(value["unit"], "eV");
    assert_eq!(value["magnitude"], 12000.0);
}

#[test]
fn set_rejects_owner_only_parameter() {
    let output = beamline(
        &shipped_config(),
        &[
            "set",
            "--device",
            "detector",
            "--parameter",
            "trigger-mode",
            "\"external\"",
        ],
    );
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("cannot be written"));
}

#[test]
fn scan_prints_each_position() {
    let output = beamline(
        &shipped_config(),
        &[
            "scan",
            "--device",
            "sample-x",
            "--start",
            "-1",
            "--stop",
            "1",
            "--steps",
            "3",
            "--shutter",
            "fast-shutter",
        ],
    );
    assert!(output.status.success());
    let text = stdout(&output);
    assert!(text.contains("-1 mm"));
    assert!(text.contains("0 mm"));
    assert!(text.contains("1 mm"));
}

#[test]
fn scan_refuses_non_motor() {
    let output = beamline(
        &shipped_config(),
        &["scan", "--device", "mono", "--start", "0", "--stop", "1"],
    );
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("not a motor"));
}

#[test]
fn duplicate_device_ids_are_rejected() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(
        file,
        "[[devices]]\nid = \"a\"\ntype = \"dummy\"\n\n[[devices]]\nid = \"a\"\ntype = \"shutter\""
    )
    .unwrap();

    let output = beamline(&file.path().to_path_buf(), &["inspect"]);
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("Duplicate device ID"));
}
