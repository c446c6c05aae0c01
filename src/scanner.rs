use crate::launcher::{INTERPRETER_NAME, interpreter_relative, script_relative};
use std::path::{Path, PathBuf};
use sysinfo::{ProcessRefreshKind, ProcessesToUpdate, System, UpdateKind};

/// What a candidate process must look like to be adopted or re-attached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReattachSignature {
    /// Expected process name; `None` accepts any name.
    pub executable_name: Option<String>,
    /// Every fragment must appear in the command line.
    pub fragments: Vec<String>,
}

impl ReattachSignature {
    /// Used once at manager startup: the embedded interpreter running the
    /// entry script of the configured root.
    pub fn for_adoption(root: &Path) -> Self {
        Self {
            executable_name: Some(INTERPRETER_NAME.to_string()),
            fragments: vec![
                interpreter_relative().to_string_lossy().into_owned(),
                root.join(script_relative()).to_string_lossy().into_owned(),
            ],
        }
    }

    /// Used after an unexpected exit: any interpreter running the script we
    /// last launched.
    pub fn for_script(script: &Path) -> Self {
        Self {
            executable_name: Some(INTERPRETER_NAME.to_string()),
            fragments: vec![script.to_string_lossy().into_owned()],
        }
    }

    pub fn matches(&self, name: &str, cmdline: &str) -> bool {
        if let Some(expected) = &self.executable_name {
            let same = if cfg!(windows) {
                name.eq_ignore_ascii_case(expected)
            } else {
                name == expected
            };
            if !same {
                return false;
            }
        }
        !self.fragments.is_empty() && self.fragments.iter().all(|f| cmdline.contains(f.as_str()))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ScanError {
    #[error("process enumeration is not supported on this platform")]
    Unsupported,
    #[error("process scan failed: {0}")]
    Failed(String),
}

/// Queries the OS process table. Blocking; call from a blocking context.
pub trait ProcessScanner: Send + Sync {
    fn find_match(&self, signature: &ReattachSignature) -> Result<Option<u32>, ScanError>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemScanner;

impl ProcessScanner for SystemScanner {
    fn find_match(&self, signature: &ReattachSignature) -> Result<Option<u32>, ScanError> {
        if !sysinfo::IS_SUPPORTED_SYSTEM {
            return Err(ScanError::Unsupported);
        }

        let mut system = System::new();
        system.refresh_processes_specifics(
            ProcessesToUpdate::All,
            true,
            ProcessRefreshKind::new().with_cmd(UpdateKind::Always),
        );

        let own_pid = std::process::id();
        // Lowest pid wins so a thread entry never shadows its process.
        let found = system
            .processes()
            .iter()
            .filter(|(pid, _)| pid.as_u32() != own_pid)
            .filter(|(_, process)| {
                let name = Path::new(process.name()).to_string_lossy();
                signature.matches(&name, &command_line(process.cmd()))
            })
            .map(|(pid, _)| pid.as_u32())
            .min();
        Ok(found)
    }
}

fn command_line<S: AsRef<std::ffi::OsStr>>(args: &[S]) -> String {
    args.iter()
        .map(|a| Path::new(a.as_ref()).to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Entry script expected under `root`, the identity recorded for re-attach.
pub fn script_for_root(root: &Path) -> PathBuf {
    root.join(script_relative())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
