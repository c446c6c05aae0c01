use std::io;

// =========================================================================
// Unix implementation
// =========================================================================

#[cfg(unix)]
mod platform {
    use super::*;
    use nix::errno::Errno;
    use nix::sys::signal::{self, Signal};
    use nix::unistd::Pid;

    pub fn is_pid_alive(pid: u32) -> bool {
        if pid == 0 {
            return false;
        }
        match signal::kill(Pid::from_raw(pid as i32), None) {
            Ok(()) => true,
            Err(Errno::EPERM) => true,
            Err(_) => false,
        }
    }

    /// SIGKILL the process group led by `pid`, falling back to the single
    /// process when `pid` does not lead a group (e.g. an adopted process).
    pub fn kill_tree(pid: u32) -> io::Result<()> {
        let target = Pid::from_raw(pid as i32);
        match signal::killpg(target, Signal::SIGKILL) {
            Ok(()) => Ok(()),
            Err(Errno::ESRCH) => match signal::kill(target, Signal::SIGKILL) {
                Ok(()) | Err(Errno::ESRCH) => Ok(()),
                Err(e) => Err(io::Error::other(e)),
            },
            Err(e) => Err(io::Error::other(e)),
        }
    }

    /// Put the child in its own process group so `kill_tree` reaches every
    /// worker it forks.
    pub fn configure_server_cmd(cmd: &mut tokio::process::Command) {
        cmd.process_group(0);
    }

    /// No raw command line exists here; the text becomes a single argument.
    pub fn append_raw_args(cmd: &mut tokio::process::Command, line: &str) {
        if !line.is_empty() {
            cmd.arg(line);
        }
    }
}

// =========================================================================
// Windows implementation
// =========================================================================

#[cfg(windows)]
mod platform {
    use super::*;

    const CREATE_NO_WINDOW: u32 = 0x0800_0000;
    const CREATE_NEW_PROCESS_GROUP: u32 = 0x0000_0200;

    pub fn is_pid_alive(pid: u32) -> bool {
        use windows_sys::Win32::Foundation::CloseHandle;
        use windows_sys::Win32::System::Threading::{
            GetExitCodeProcess, OpenProcess, PROCESS_QUERY_LIMITED_INFORMATION,
        };

        unsafe {
            let handle = OpenProcess(PROCESS_QUERY_LIMITED_INFORMATION, 0, pid);
            if handle.is_null() {
                return false;
            }
            let mut exit_code: u32 = 0;
            let result = GetExitCodeProcess(handle, &mut exit_code);
            CloseHandle(handle);
            // STILL_ACTIVE = 259
            result != 0 && exit_code == 259
        }
    }

    /// Terminate `pid` and all of its descendants.
    pub fn kill_tree(pid: u32) -> io::Result<()> {
        let output = std::process::Command::new("taskkill")
            .args(["/PID", &pid.to_string(), "/T", "/F"])
            .output()?;
        if output.status.success() || !is_pid_alive(pid) {
            return Ok(());
        }
        terminate_process(pid)
    }

    fn terminate_process(pid: u32) -> io::Result<()> {
        use windows_sys::Win32::Foundation::CloseHandle;
        use windows_sys::Win32::System::Threading::{
            OpenProcess, PROCESS_TERMINATE, TerminateProcess,
        };

        unsafe {
            let handle = OpenProcess(PROCESS_TERMINATE, 0, pid);
            if handle.is_null() {
                return Err(io::Error::last_os_error());
            }
            let result = TerminateProcess(handle, 1);
            CloseHandle(handle);
            if result == 0 {
                return Err(io::Error::last_os_error());
            }
        }
        Ok(())
    }

    pub fn configure_server_cmd(cmd: &mut tokio::process::Command) {
        cmd.creation_flags(CREATE_NO_WINDOW | CREATE_NEW_PROCESS_GROUP);
    }

    /// Append `line` to the command line as-is, without quoting or escaping.
    pub fn append_raw_args(cmd: &mut tokio::process::Command, line: &str) {
        if !line.is_empty() {
            cmd.raw_arg(line);
        }
    }
}

pub use platform::*;
