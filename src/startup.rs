use crate::paths::Paths;
use color_eyre::eyre::{WrapErr, bail};
use std::path::{Path, PathBuf};

pub const LAUNCHD_LABEL: &str = "com.comfy-keeper.agent";
pub const SYSTEMD_UNIT: &str = "comfy-keeper.service";

/// Register the manager to launch at login, running `comfy-keeper run`.
pub fn install(paths: &Paths) -> color_eyre::Result<PathBuf> {
    let exe = std::env::current_exe().wrap_err("could not determine comfy-keeper executable path")?;
    let exe_path = exe.to_string_lossy();
    let path = service_file_path()?;

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .wrap_err_with(|| format!("could not create directory {}", parent.display()))?;
    }
    std::fs::create_dir_all(paths.log_dir()).wrap_err_with(|| {
        format!("could not create directory {}", paths.log_dir().display())
    })?;

    let content = generate_service_content(&exe_path, &paths.service_log());
    std::fs::write(&path, content)
        .wrap_err_with(|| format!("could not write service file {}", path.display()))?;

    eprintln!("Launch at login enabled: {}", path.display());
    post_install(&path);
    Ok(path)
}

/// Remove the login registration. Absent registration is not an error.
pub fn uninstall() -> color_eyre::Result<()> {
    let path = service_file_path()?;

    if !path.exists() {
        eprintln!("No login registration found at {}", path.display());
        return Ok(());
    }

    pre_uninstall(&path);
    std::fs::remove_file(&path)
        .wrap_err_with(|| format!("could not remove service file {}", path.display()))?;

    eprintln!("Launch at login disabled: {}", path.display());
    Ok(())
}

pub fn is_installed() -> bool {
    service_file_path().is_ok_and(|p| p.exists())
}

#[cfg(target_os = "macos")]
fn service_file_path() -> color_eyre::Result<PathBuf> {
    let Some(home) = dirs::home_dir() else {
        bail!("could not determine home directory");
    };
    Ok(home
        .join("Library/LaunchAgents")
        .join(format!("{LAUNCHD_LABEL}.plist")))
}

#[cfg(target_os = "linux")]
fn service_file_path() -> color_eyre::Result<PathBuf> {
    let Some(home) = dirs::home_dir() else {
        bail!("could not determine home directory");
    };
    Ok(home.join(".config/systemd/user").join(SYSTEMD_UNIT))
}

#[cfg(not(any(target_os = "macos", target_os = "linux")))]
fn service_file_path() -> color_eyre::Result<PathBuf> {
    bail!("launch at login is not supported on this platform");
}

#[cfg(target_os = "macos")]
fn generate_service_content(exe_path: &str, log: &Path) -> String {
    generate_launchd_plist(exe_path, log)
}

#[cfg(not(target_os = "macos"))]
fn generate_service_content(exe_path: &str, _log: &Path) -> String {
    generate_systemd_unit(exe_path)
}

#[cfg(target_os = "macos")]
fn post_install(path: &Path) {
    run_quiet("launchctl", &["load", &path.to_string_lossy()]);
}

#[cfg(target_os = "macos")]
fn pre_uninstall(path: &Path) {
    run_quiet("launchctl", &["unload", &path.to_string_lossy()]);
}

#[cfg(target_os = "linux")]
fn post_install(_path: &Path) {
    run_quiet("systemctl", &["--user", "daemon-reload"]);
    run_quiet("systemctl", &["--user", "enable", SYSTEMD_UNIT]);
}

#[cfg(target_os = "linux")]
fn pre_uninstall(_path: &Path) {
    run_quiet("systemctl", &["--user", "disable", SYSTEMD_UNIT]);
    run_quiet("systemctl", &["--user", "daemon-reload"]);
}

#[cfg(not(any(target_os = "macos", target_os = "linux")))]
fn post_install(_path: &Path) {}

#[cfg(not(any(target_os = "macos", target_os = "linux")))]
fn pre_uninstall(_path: &Path) {}

#[cfg(any(target_os = "macos", target_os = "linux"))]
fn run_quiet(program: &str, args: &[&str]) {
    match std::process::Command::new(program).args(args).status() {
        Ok(s) if s.success() => {}
        Ok(s) => eprintln!("warning: {program} {} exited with {s}", args.join(" ")),
        Err(e) => eprintln!("warning: could not run {program}: {e}"),
    }
}

pub fn generate_launchd_plist(exe_path: &str, log: &Path) -> String {
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<!DOCTYPE plist PUBLIC "-//Apple//DTD PLIST 1.0//EN" "http://www.apple.com/DTDs/PropertyList-1.0.dtd">
<plist version="1.0">
<dict>
    <key>Label</key>
    <string>{LAUNCHD_LABEL}</string>
    <key>ProgramArguments</key>
    <array>
        <string>{exe_path}</string>
        <string>run</string>
    </array>
    <key>RunAtLoad</key>
    <true/>
    <key>StandardOutPath</key>
    <string>{log}</string>
    <key>StandardErrorPath</key>
    <string>{log}</string>
</dict>
</plist>
"#,
        log = log.display(),
    )
}

pub fn generate_systemd_unit(exe_path: &str) -> String {
    format!(
        r#"[Unit]
Description=comfy-keeper ComfyUI server manager
After=network.target

[Service]
Type=simple
ExecStart={exe_path} run
KillMode=mixed

[Install]
WantedBy=default.target
"#
    )
}
