//! End-to-end CLI tests against a stub virtualization engine.
//!
//! The engine contract is small enough to fake with a shell script that
//! records defined instances next to itself, which lets the whole
//! bootstrap-and-define flow run unprivileged.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::Command;

fn have_ssh_keygen() -> bool {
    Command::new("ssh-keygen").arg("-?").output().is_ok()
}

fn write_stub_engine(dir: &Path) -> PathBuf {
    let script = dir.join("engine.sh");
    let body = r#"#!/bin/sh
set -eu
here="$(dirname "$0")"
case "$1" in
  list)
    cat "$here/instances" 2>/dev/null || true
    ;;
  define)
    name="$4"
    if [ -f "$here/instances" ] && grep -qx "$name" "$here/instances"; then
      echo "instance already exists" >&2
      exit 1
    fi
    cp "$2" "$here/$name.json"
    echo "$name" >> "$here/instances"
    ;;
  run)
    exit 0
    ;;
esac
"#;
    fs::write(&script, body).unwrap();
    fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();
    script
}

fn buildvm() -> Command {
    Command::new(env!("CARGO_BIN_EXE_buildvm"))
}

struct Fixture {
    _td: tempfile::TempDir,
    state_dir: PathBuf,
    engine: PathBuf,
    image: PathBuf,
}

fn fixture() -> Fixture {
    let td = tempfile::TempDir::new().unwrap();
    let state_dir = td.path().join("state");
    let engine = write_stub_engine(td.path());
    let image = td.path().join("disk.raw");
    fs::write(&image, "").unwrap();
    Fixture {
        _td: td,
        state_dir,
        engine,
        image,
    }
}

fn base_args(fx: &Fixture) -> Vec<String> {
    vec![
        "--name".into(),
        "builder".into(),
        "--image".into(),
        fx.image.display().to_string(),
        "--state-dir".into(),
        fx.state_dir.display().to_string(),
        "--engine".into(),
        fx.engine.display().to_string(),
    ]
}

#[test]
fn test_ensure_is_idempotent() {
    if !have_ssh_keygen() {
        eprintln!("skipping: ssh-keygen not found");
        return;
    }
    let fx = fixture();

    let output = buildvm()
        .arg("ensure")
        .args(base_args(&fx))
        .output()
        .expect("Failed to run buildvm ensure");
    assert!(
        output.status.success(),
        "ensure failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    assert!(String::from_utf8_lossy(&output.stdout).contains("created"));

    // Full bootstrap state landed in the working directory
    for artifact in [
        "keys/host_ed25519",
        "keys/host_ed25519.pub",
        "keys/user_ed25519",
        "keys/user_ed25519.pub",
        "known_hosts",
        "ssh_config",
        "channel/host_ed25519",
        "channel/user_ed25519.pub",
    ] {
        assert!(
            fx.state_dir.join(artifact).exists(),
            "missing artifact {artifact}"
        );
    }

    // The engine saw one define with the channel mount bound by tag
    let instances = fs::read_to_string(fx.engine.parent().unwrap().join("instances")).unwrap();
    assert_eq!(instances, "builder\n");
    let descriptor: serde_json::Value = serde_json::from_str(
        &fs::read_to_string(fx.engine.parent().unwrap().join("builder.json")).unwrap(),
    )
    .unwrap();
    assert_eq!(descriptor["mounts"][0]["tag"], "credentials");
    assert_eq!(descriptor["sshPort"], 2222);

    // A second run short-circuits without touching anything
    let pubkey_before = fs::read_to_string(fx.state_dir.join("keys/host_ed25519.pub")).unwrap();
    let output = buildvm()
        .arg("ensure")
        .args(base_args(&fx))
        .output()
        .expect("Failed to run buildvm ensure");
    assert!(output.status.success());
    assert!(String::from_utf8_lossy(&output.stdout).contains("already defined"));

    let instances = fs::read_to_string(fx.engine.parent().unwrap().join("instances")).unwrap();
    assert_eq!(instances, "builder\n");
    let pubkey_after = fs::read_to_string(fx.state_dir.join("keys/host_ed25519.pub")).unwrap();
    assert_eq!(pubkey_before, pubkey_after);
}

#[test]
fn test_run_treats_vm_exit_as_normal() {
    if !have_ssh_keygen() {
        eprintln!("skipping: ssh-keygen not found");
        return;
    }
    let fx = fixture();

    // `run` defines on first use, boots, and returns cleanly when the
    // stub engine's run exits
    let output = buildvm()
        .arg("run")
        .args(base_args(&fx))
        .output()
        .expect("Failed to run buildvm run");
    assert!(
        output.status.success(),
        "run failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
}

#[test]
fn test_status_json() {
    if !have_ssh_keygen() {
        eprintln!("skipping: ssh-keygen not found");
        return;
    }
    let fx = fixture();

    let output = buildvm()
        .arg("status")
        .args(base_args(&fx))
        .arg("--json")
        .output()
        .expect("Failed to run buildvm status");
    assert!(output.status.success());
    let status: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(status["state"], "not-defined");
    assert_eq!(status["credentials"]["host_key"], false);

    buildvm().arg("ensure").args(base_args(&fx)).output().unwrap();

    let output = buildvm()
        .arg("status")
        .args(base_args(&fx))
        .arg("--json")
        .output()
        .expect("Failed to run buildvm status");
    let status: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(status["state"], "stopped");
    assert_eq!(status["credentials"]["host_key"], true);
    assert_eq!(status["credentials"]["ssh_config"], true);
}

#[test]
fn test_emit_guest_units() {
    let td = tempfile::TempDir::new().unwrap();
    let units = td.path().join("units");

    let output = buildvm()
        .args(["guest-install", "--emit-units"])
        .arg(&units)
        .arg("--debug")
        .output()
        .expect("Failed to run buildvm guest-install");
    assert!(
        output.status.success(),
        "guest-install failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );

    let unit = fs::read_to_string(units.join("credential-install.service")).unwrap();
    assert!(unit.contains("Before=sshd.service"));
    assert!(unit.contains("ConditionPathExists=!/root/.ssh/authorized_keys"));
    assert!(units.join("sshd.service.d/10-credential-install.conf").exists());
    assert!(units
        .join("serial-getty@ttyS0.service.d/10-autologin.conf")
        .exists());
}
