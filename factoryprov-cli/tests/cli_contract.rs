//! Integration tests for core CLI contract behavior.

use {predicates::prelude::*, std::fs, tempfile::tempdir};

fn cli_cmd() -> assert_cmd::Command {
    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("factoryprov");
    cmd.env_remove("RUST_LOG")
        .env_remove("FACTORYPROV_PORT")
        .env_remove("FACTORYPROV_TARGET");
    cmd
}

#[test]
fn help_exits_zero_and_writes_stdout_only() {
    let mut cmd = cli_cmd();
    cmd.arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("factoryprov"))
        .stderr(predicate::str::is_empty());
}

#[test]
fn version_exits_zero_and_writes_stdout_only() {
    let mut cmd = cli_cmd();
    cmd.arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("factoryprov"))
        .stderr(predicate::str::is_empty());
}

#[test]
fn exit_code_two_for_usage_error_unknown_command() {
    let mut cmd = cli_cmd();
    cmd.arg("frobnicate")
        .assert()
        .code(2)
        .stdout(predicate::str::is_empty());
}

#[test]
fn exit_code_two_for_usage_error_invalid_flag() {
    let mut cmd = cli_cmd();
    cmd.args(["status", "--no-such-flag"])
        .assert()
        .code(2);
}

#[test]
fn flash_without_target_is_usage_error() {
    let dir = tempdir().expect("tempdir should be created");
    let firmware = dir
        .path()
        .join("fw.bin");
    fs::write(&firmware, [0u8; 16]).expect("firmware should be written");

    let mut cmd = cli_cmd();
    cmd.arg("flash")
        .arg(&firmware)
        .assert()
        .code(2)
        .stdout(predicate::str::is_empty())
        .stderr(predicate::str::contains("--target"));
}

#[test]
fn unknown_target_is_usage_error() {
    let mut cmd = cli_cmd();
    cmd.args(["read-uid", "--target", "toaster"])
        .assert()
        .code(2);
}

#[test]
fn unknown_test_profile_is_usage_error() {
    let mut cmd = cli_cmd();
    cmd.args(["test", "toaster"])
        .assert()
        .code(2);
}

#[test]
fn derive_address_prints_formatted_address() {
    let mut cmd = cli_cmd();
    cmd.args(["derive-address", "12345678", "9abcdef0", "00000000"])
        .assert()
        .success()
        .stdout("88:C0:88:88\n");
}

#[test]
fn derive_address_honours_version_byte() {
    let mut cmd = cli_cmd();
    cmd.args(["derive-address", "0x12345678", "0x9ABC_DEF0", "0", "--version-byte", "C1"])
        .assert()
        .success()
        .stdout("88:C1:88:88\n");
}

#[test]
fn derive_address_needs_three_words() {
    let mut cmd = cli_cmd();
    cmd.args(["derive-address", "12345678", "9abcdef0"])
        .assert()
        .code(2);
}

#[test]
fn derive_address_json_is_success_envelope() {
    let mut cmd = cli_cmd();
    let output = cmd
        .args(["derive-address", "12345678", "9abcdef0", "00000000", "--json"])
        .output()
        .expect("command should execute");
    assert!(output.status.success());

    let parsed: serde_json::Value =
        serde_json::from_slice(&output.stdout).expect("stdout should be JSON");
    assert_eq!(parsed["success"], true);
    assert_eq!(parsed["data"]["address"]["formatted"], "88:C0:88:88");
    assert_eq!(parsed["data"]["address"]["hex"], "88C08888");
}

#[test]
fn local_config_version_byte_is_used() {
    let dir = tempdir().expect("tempdir should be created");
    fs::write(
        dir.path()
            .join("factoryprov.toml"),
        "[flash]\nversion_byte = 194\n",
    )
    .expect("config should be written");

    let mut cmd = cli_cmd();
    cmd.current_dir(dir.path())
        .args(["derive-address", "12345678", "9abcdef0", "00000000"])
        .assert()
        .success()
        .stdout("88:C2:88:88\n");
}

#[test]
fn invalid_local_config_warns_and_falls_back() {
    let dir = tempdir().expect("tempdir should be created");
    fs::write(
        dir.path()
            .join("factoryprov.toml"),
        "invalid toml [[[",
    )
    .expect("config should be written");

    let mut cmd = cli_cmd();
    cmd.current_dir(dir.path())
        .args(["derive-address", "12345678", "9abcdef0", "00000000"])
        .assert()
        .success()
        .stdout("88:C0:88:88\n")
        .stderr(predicate::str::contains("TOML"));
}

#[test]
fn status_json_reports_missing_tools() {
    let dir = tempdir().expect("tempdir should be created");
    let config = dir
        .path()
        .join("config.toml");
    fs::write(
        &config,
        "[flash]\nopenocd = \"/nonexistent/openocd\"\ncube_cli = \"/nonexistent/cube\"\n",
    )
    .expect("config should be written");

    let mut cmd = cli_cmd();
    let output = cmd
        .arg("--config")
        .arg(&config)
        .args(["status", "--json"])
        .output()
        .expect("command should execute");
    assert!(output.status.success());

    let parsed: serde_json::Value =
        serde_json::from_slice(&output.stdout).expect("stdout should be JSON");
    assert_eq!(parsed["success"], true);
    assert_eq!(parsed["data"]["primaryAvailable"], false);
    assert_eq!(parsed["data"]["secondaryAvailable"], false);
}

#[test]
fn unlock_non_interactive_without_yes_is_refused() {
    let mut cmd = cli_cmd();
    cmd.args(["--non-interactive", "unlock", "--target", "droplet"])
        .assert()
        .code(2)
        .stdout(predicate::str::is_empty())
        .stderr(predicate::str::contains("--yes"));
}

#[test]
fn flash_missing_firmware_keeps_stdout_clean() {
    let dir = tempdir().expect("tempdir should be created");
    let config = dir
        .path()
        .join("config.toml");
    fs::write(&config, "[flash]\ndiagnostics_log = \"\"\n").expect("config should be written");

    let mut cmd = cli_cmd();
    cmd.arg("--config")
        .arg(&config)
        .args(["flash", "--target", "droplet", "--json"])
        .arg(
            dir.path()
                .join("missing.bin"),
        )
        .assert()
        .code(1)
        .stdout(predicate::str::is_empty())
        .stderr(predicate::str::contains("Firmware not found"));
}

#[test]
fn completions_command_writes_to_stdout() {
    let mut cmd = cli_cmd();
    cmd.args(["completions", "bash"])
        .assert()
        .success()
        .stdout(predicate::str::contains("factoryprov"));
}
