use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use std::path::Path;
use std::time::Duration;
use tempfile::TempDir;

fn keeper(home: &Path) -> Command {
    let mut cmd: Command = cargo_bin_cmd!("comfy-keeper").into();
    cmd.env("COMFY_KEEPER_DATA_DIR", home.join("data"));
    cmd.env("HOME", home);
    cmd.env_remove("RUST_LOG");
    cmd.timeout(Duration::from_secs(30));
    cmd
}

fn write_settings(home: &Path, content: &str) {
    let data = home.join("data");
    std::fs::create_dir_all(&data).unwrap();
    std::fs::write(data.join("settings.toml"), content).unwrap();
}

#[test]
fn test_no_subcommand_prints_help() {
    let dir = TempDir::new().unwrap();
    keeper(dir.path())
        .assert()
        .success()
        .stdout(predicate::str::contains("Usage"));
}

#[test]
fn test_settings_json_defaults() {
    let dir = TempDir::new().unwrap();
    let output = keeper(dir.path())
        .args(["settings", "--json"])
        .output()
        .unwrap();
    assert!(output.status.success());

    let value: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(value["auto_start_on_launch"], false);
    assert_eq!(value["flags"]["port"], 8188);
    assert_eq!(value["timings"]["stop_timeout_ms"], 5000);
    assert!(value.get("root_directory").is_none());
}

#[test]
fn test_settings_table_shows_file_values() {
    let dir = TempDir::new().unwrap();
    write_settings(
        dir.path(),
        "root_directory = \"/srv/comfy\"\nauto_restart_on_crash = true\n\n[flags]\nport = 8190\n",
    );

    keeper(dir.path())
        .arg("settings")
        .assert()
        .success()
        .stdout(predicate::str::contains("/srv/comfy"))
        .stdout(predicate::str::contains("8190"))
        .stdout(predicate::str::contains("auto restart"));
}

#[test]
fn test_settings_rejects_invalid_file() {
    let dir = TempDir::new().unwrap();
    write_settings(dir.path(), "auto_start_on_launch = \"sometimes\"\n");

    keeper(dir.path())
        .arg("settings")
        .assert()
        .failure()
        .stderr(predicate::str::contains("invalid settings file"));
}

#[test]
fn test_args_without_root_prints_flags() {
    let dir = TempDir::new().unwrap();
    keeper(dir.path())
        .arg("args")
        .assert()
        .success()
        .stdout(predicate::str::contains("--use-pytorch-cross-attention"))
        .stdout(predicate::str::contains("ComfyUI_frontend@latest"));
}

#[test]
fn test_args_with_root_prints_command_line() {
    let dir = TempDir::new().unwrap();
    write_settings(
        dir.path(),
        "root_directory = \"/srv/comfy\"\n\n[flags]\nprocessor = \"cpu\"\n",
    );

    let output = keeper(dir.path())
        .args(["args", "--json"])
        .output()
        .unwrap();
    assert!(output.status.success());
    let value: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    let line = value["command_line"].as_str().unwrap();
    assert!(line.contains("python_embeded"));
    assert!(line.contains("-s \"/srv/comfy"));
    assert!(line.contains("--cpu"));
    assert!(value["arguments"].as_str().unwrap().contains("--cpu"));
}

#[test]
fn test_scan_requires_root() {
    let dir = TempDir::new().unwrap();
    keeper(dir.path())
        .arg("scan")
        .assert()
        .failure()
        .stderr(predicate::str::contains("no server folder configured"));
}

#[test]
fn test_scan_finds_nothing_for_fresh_root() {
    let dir = TempDir::new().unwrap();
    let root = dir.path().join("comfy");
    std::fs::create_dir_all(&root).unwrap();
    write_settings(
        dir.path(),
        &format!("root_directory = \"{}\"\n", root.display()),
    );

    keeper(dir.path())
        .args(["scan", "--json"])
        .assert()
        .success()
        .stdout(predicate::str::contains(r#"{"pid":null}"#));
}

#[test]
fn test_init_piped_writes_settings() {
    let dir = TempDir::new().unwrap();
    let root = dir.path().join("comfy");
    std::fs::create_dir_all(&root).unwrap();

    keeper(dir.path())
        .arg("init")
        .write_stdin(format!("{}\n8189\ngpu_only\ny\nn\nn\n", root.display()))
        .assert()
        .success();

    let saved = std::fs::read_to_string(dir.path().join("data/settings.toml")).unwrap();
    assert!(saved.contains("auto_start_on_launch = true"));
    assert!(saved.contains("port = 8189"));
    assert!(saved.contains("gpu_only"));
}

#[test]
fn test_run_status_then_exit() {
    let dir = TempDir::new().unwrap();
    keeper(dir.path())
        .args(["run", "--no-adopt"])
        .write_stdin("status\nexit\n")
        .assert()
        .success()
        .stdout(predicate::str::contains("server: "))
        .stdout(predicate::str::contains("stopped"))
        .stderr(predicate::str::contains("run `comfy-keeper init` first"));
}

#[test]
fn test_run_json_status() {
    let dir = TempDir::new().unwrap();
    keeper(dir.path())
        .args(["--json", "run", "--no-adopt"])
        .write_stdin("status\nexit\n")
        .assert()
        .success()
        .stdout(predicate::str::contains(r#"{"state":"stopped"}"#));
}

#[test]
fn test_run_reports_unknown_command() {
    let dir = TempDir::new().unwrap();
    keeper(dir.path())
        .args(["run", "--no-adopt"])
        .write_stdin("launch\nexit\n")
        .assert()
        .success()
        .stderr(predicate::str::contains("unknown command 'launch'"));
}

#[test]
fn test_run_start_without_root_hints_init() {
    let dir = TempDir::new().unwrap();
    keeper(dir.path())
        .args(["run", "--no-adopt"])
        .write_stdin("start\nexit\n")
        .assert()
        .success()
        .stdout(predicate::str::contains("Error: server root directory is not set"))
        .stderr(predicate::str::contains("hint:"));
}

#[test]
fn test_run_set_persists_toggle() {
    let dir = TempDir::new().unwrap();
    keeper(dir.path())
        .args(["run", "--no-adopt"])
        .write_stdin("set auto-restart on\nexit\n")
        .assert()
        .success();

    let saved = std::fs::read_to_string(dir.path().join("data/settings.toml")).unwrap();
    assert!(saved.contains("auto_restart_on_crash = true"));
}

#[cfg(unix)]
#[test]
fn test_run_starts_and_stops_server() {
    use std::os::unix::fs::PermissionsExt;

    let dir = TempDir::new().unwrap();
    let root = dir.path().join("comfy");
    let interpreter = root.join("python_embeded/bin/python");
    std::fs::create_dir_all(interpreter.parent().unwrap()).unwrap();
    std::fs::write(
        &interpreter,
        "#!/bin/sh\necho \"To see the GUI go to: http://127.0.0.1:8188\"\nexec sleep 60\n",
    )
    .unwrap();
    std::fs::set_permissions(&interpreter, std::fs::Permissions::from_mode(0o755)).unwrap();
    std::fs::create_dir_all(root.join("ComfyUI")).unwrap();
    std::fs::write(root.join("ComfyUI/main.py"), "").unwrap();
    write_settings(
        dir.path(),
        &format!("root_directory = \"{}\"\n", root.display()),
    );

    // exit lands right after start, so the server is stopped while starting.
    keeper(dir.path())
        .args(["run", "--no-adopt"])
        .write_stdin("start\nexit\n")
        .assert()
        .success()
        .stdout(predicate::str::contains("Server process starting..."))
        .stdout(predicate::str::contains("Shutting down..."))
        .stdout(predicate::str::contains("Server stopped."));
}
