use crate::settings::AppSettings;
use crate::sys;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tracing::{debug, info};

// ---------------------------------------------------------------------------
// Layout of a portable ComfyUI install
// ---------------------------------------------------------------------------

/// Process name of the embedded interpreter, as the OS process table reports it.
#[cfg(windows)]
pub const INTERPRETER_NAME: &str = "python.exe";
#[cfg(not(windows))]
pub const INTERPRETER_NAME: &str = "python";

pub fn interpreter_relative() -> PathBuf {
    #[cfg(windows)]
    {
        Path::new("python_embeded").join(INTERPRETER_NAME)
    }
    #[cfg(not(windows))]
    {
        Path::new("python_embeded").join("bin").join(INTERPRETER_NAME)
    }
}

pub fn script_relative() -> PathBuf {
    Path::new("ComfyUI").join("main.py")
}

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    #[error("server root directory is not set; configure it in settings")]
    PathNotConfigured,
    #[error("server root directory does not exist: {}", .0.display())]
    RootNotFound(PathBuf),
    #[error("required file not found: {}", .0.display())]
    MissingExecutable(PathBuf),
    #[error("invalid server arguments: {0}")]
    InvalidArguments(String),
    #[error("failed to start server process: {0}")]
    LaunchFailed(#[from] std::io::Error),
}

impl LaunchError {
    /// Configuration problems the user has to fix, as opposed to spawn failures.
    pub fn is_configuration(&self) -> bool {
        !matches!(self, LaunchError::LaunchFailed(_))
    }
}

// ---------------------------------------------------------------------------
// LaunchSpec
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub interpreter: PathBuf,
    pub script: PathBuf,
    pub working_dir: PathBuf,
    /// Opaque flag string produced by [`crate::flags::ServerFlags`].
    pub arguments: String,
}

impl LaunchSpec {
    pub fn for_root(root: &Path, arguments: impl Into<String>) -> Self {
        Self {
            interpreter: root.join(interpreter_relative()),
            script: root.join(script_relative()),
            working_dir: root.to_path_buf(),
            arguments: arguments.into(),
        }
    }

    /// Resolve the launch parameters from settings, checking the root directory.
    pub fn from_settings(settings: &AppSettings) -> Result<Self, LaunchError> {
        let root = settings
            .root_directory
            .as_deref()
            .filter(|p| !p.as_os_str().is_empty())
            .ok_or(LaunchError::PathNotConfigured)?;
        if !root.is_dir() {
            return Err(LaunchError::RootNotFound(root.to_path_buf()));
        }
        Ok(Self::for_root(root, settings.argument_string()))
    }

    pub fn validate(&self) -> Result<(), LaunchError> {
        for path in [&self.interpreter, &self.script] {
            if !path.is_file() {
                return Err(LaunchError::MissingExecutable(path.clone()));
            }
        }
        Ok(())
    }

    /// Fixed arguments handed to the interpreter ahead of the flag string.
    pub fn base_args(&self) -> Vec<String> {
        let mut args = vec!["-s".to_string(), self.script.to_string_lossy().into_owned()];
        if cfg!(windows) {
            args.push("--windows-standalone-build".to_string());
        }
        args
    }

    /// The flag string in the form the current platform launches it with.
    pub fn extra_args(&self) -> Result<ExtraArgs, LaunchError> {
        ExtraArgs::parse(&self.arguments, cfg!(windows))
    }

    /// Human-readable command line, for narration only.
    pub fn command_line(&self) -> String {
        let mut line = format!(
            "{} -s \"{}\"",
            self.interpreter.display(),
            self.script.display()
        );
        if cfg!(windows) {
            line.push_str(" --windows-standalone-build");
        }
        if !self.arguments.is_empty() {
            line.push(' ');
            line.push_str(&self.arguments);
        }
        line
    }
}

/// Server flags after platform handling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExtraArgs {
    /// Split with POSIX shell-word rules, one argv entry per word.
    Words(Vec<String>),
    /// Appended to the command line unchanged. Windows programs split their
    /// own command line, and backslashes in paths must survive.
    Verbatim(String),
}

impl ExtraArgs {
    pub fn parse(arguments: &str, verbatim: bool) -> Result<Self, LaunchError> {
        if verbatim {
            return Ok(ExtraArgs::Verbatim(arguments.trim().to_string()));
        }
        shell_words::split(arguments)
            .map(ExtraArgs::Words)
            .map_err(|e| LaunchError::InvalidArguments(e.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Spawning
// ---------------------------------------------------------------------------

pub struct LaunchedProcess {
    pub pid: u32,
    pub child: Child,
    pub stdout: Option<ChildStdout>,
    pub stderr: Option<ChildStderr>,
}

/// Start the server. Returns as soon as the OS has created the process.
pub fn launch(spec: &LaunchSpec) -> Result<LaunchedProcess, LaunchError> {
    spec.validate()?;
    let extra = spec.extra_args()?;

    let mut cmd = Command::new(&spec.interpreter);
    cmd.args(spec.base_args());
    match extra {
        ExtraArgs::Words(words) => {
            cmd.args(words);
        }
        ExtraArgs::Verbatim(line) => sys::append_raw_args(&mut cmd, &line),
    }
    cmd.current_dir(&spec.working_dir);
    // Line-at-a-time output, otherwise the readiness banner sits in a pipe buffer.
    cmd.env("PYTHONUNBUFFERED", "1");
    cmd.env("PYTHONIOENCODING", "utf-8");
    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    sys::configure_server_cmd(&mut cmd);

    debug!("spawning {}", spec.command_line());
    let mut child = cmd.spawn()?;
    let pid = child.id().ok_or_else(|| {
        std::io::Error::other("server process exited before its pid could be read")
    })?;
    info!(pid, "server process spawned");

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    Ok(LaunchedProcess {
        pid,
        child,
        stdout,
        stderr,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn settings_with_root(root: Option<PathBuf>) -> AppSettings {
        AppSettings {
            root_directory: root,
            ..AppSettings::default()
        }
    }

    fn touch(path: &Path) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, "").unwrap();
    }

    #[test]
    fn test_layout() {
        assert!(script_relative().ends_with("ComfyUI/main.py"));
        assert!(interpreter_relative().starts_with("python_embeded"));
        assert!(interpreter_relative().ends_with(INTERPRETER_NAME));
    }

    #[test]
    fn test_from_settings_without_root() {
        let result = LaunchSpec::from_settings(&settings_with_root(None));
        assert!(matches!(result, Err(LaunchError::PathNotConfigured)));
    }

    #[test]
    fn test_from_settings_with_empty_root() {
        let result = LaunchSpec::from_settings(&settings_with_root(Some(PathBuf::new())));
        assert!(matches!(result, Err(LaunchError::PathNotConfigured)));
    }

    #[test]
    fn test_from_settings_with_missing_root() {
        let result = LaunchSpec::from_settings(&settings_with_root(Some(PathBuf::from(
            "/nonexistent/comfy-keeper/root",
        ))));
        assert!(matches!(result, Err(LaunchError::RootNotFound(_))));
    }

    #[test]
    fn test_from_settings_uses_flags() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = settings_with_root(Some(dir.path().to_path_buf()));
        settings.flags.port = 9000;

        let spec = LaunchSpec::from_settings(&settings).unwrap();
        assert_eq!(spec.working_dir, dir.path());
        assert_eq!(spec.script, dir.path().join("ComfyUI").join("main.py"));
        assert!(spec.arguments.starts_with("--port 9000"));
    }

    #[test]
    fn test_validate_missing_script() {
        let dir = tempfile::tempdir().unwrap();
        let spec = LaunchSpec::for_root(dir.path(), "");
        touch(&spec.interpreter);

        match spec.validate() {
            Err(LaunchError::MissingExecutable(path)) => assert_eq!(path, spec.script),
            other => panic!("expected MissingExecutable, got {other:?}"),
        }
    }

    #[test]
    fn test_validate_missing_interpreter() {
        let dir = tempfile::tempdir().unwrap();
        let spec = LaunchSpec::for_root(dir.path(), "");
        touch(&spec.script);

        match spec.validate() {
            Err(LaunchError::MissingExecutable(path)) => assert_eq!(path, spec.interpreter),
            other => panic!("expected MissingExecutable, got {other:?}"),
        }
    }

    #[test]
    fn test_validate_ok() {
        let dir = tempfile::tempdir().unwrap();
        let spec = LaunchSpec::for_root(dir.path(), "");
        touch(&spec.interpreter);
        touch(&spec.script);
        assert!(spec.validate().is_ok());
    }

    #[test]
    fn test_base_args_prefix() {
        let spec = LaunchSpec::for_root(Path::new("/srv/comfy"), "--cpu");
        let args = spec.base_args();
        assert_eq!(args[0], "-s");
        assert_eq!(PathBuf::from(&args[1]), spec.script);
        assert_eq!(args.len(), if cfg!(windows) { 3 } else { 2 });
    }

    #[test]
    fn test_words_split_quoted_path() {
        let extra = ExtraArgs::parse("--port 8190 --output-directory \"/srv/out dir\"", false);
        assert_eq!(
            extra.unwrap(),
            ExtraArgs::Words(vec![
                "--port".to_string(),
                "8190".to_string(),
                "--output-directory".to_string(),
                "/srv/out dir".to_string(),
            ])
        );
    }

    #[test]
    fn test_words_unbalanced_quote() {
        assert!(matches!(
            ExtraArgs::parse("--output-directory \"/srv", false),
            Err(LaunchError::InvalidArguments(_))
        ));
    }

    #[test]
    fn test_verbatim_keeps_unc_output_directory() {
        let flags = crate::flags::ServerFlags {
            output_directory: r"\\nas\renders".to_string(),
            ..Default::default()
        };
        let arguments = flags.argument_string();
        let extra = ExtraArgs::parse(&arguments, true).unwrap();

        let ExtraArgs::Verbatim(line) = extra else {
            panic!("expected verbatim arguments");
        };
        assert!(line.contains(r#"--output-directory "\\nas\renders""#));
        assert_eq!(line, arguments);
    }

    #[test]
    fn test_verbatim_accepts_trailing_backslash() {
        let arguments = r#"--output-directory "D:\renders\""#;
        assert_eq!(
            ExtraArgs::parse(arguments, true).unwrap(),
            ExtraArgs::Verbatim(arguments.to_string())
        );
    }

    #[test]
    fn test_extra_args_follow_platform() {
        let spec = LaunchSpec::for_root(Path::new("/srv/comfy"), "--cpu");
        let expected = if cfg!(windows) {
            ExtraArgs::Verbatim("--cpu".to_string())
        } else {
            ExtraArgs::Words(vec!["--cpu".to_string()])
        };
        assert_eq!(spec.extra_args().unwrap(), expected);
    }

    #[test]
    fn test_command_line_contains_script() {
        let spec = LaunchSpec::for_root(Path::new("/srv/comfy"), "--cpu");
        let line = spec.command_line();
        assert!(line.contains("main.py"));
        assert!(line.ends_with("--cpu"));
    }

    #[test]
    fn test_error_classification() {
        assert!(LaunchError::PathNotConfigured.is_configuration());
        assert!(LaunchError::MissingExecutable(PathBuf::from("x")).is_configuration());
        assert!(!LaunchError::LaunchFailed(std::io::Error::other("boom")).is_configuration());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_launch_fake_interpreter() {
        use std::os::unix::fs::PermissionsExt;
        use tokio::io::AsyncReadExt;

        let dir = tempfile::tempdir().unwrap();
        let spec = LaunchSpec::for_root(dir.path(), "--cpu");
        touch(&spec.script);
        std::fs::create_dir_all(spec.interpreter.parent().unwrap()).unwrap();
        std::fs::write(&spec.interpreter, "#!/bin/sh\necho \"args: $*\"\n").unwrap();
        std::fs::set_permissions(&spec.interpreter, std::fs::Permissions::from_mode(0o755))
            .unwrap();

        let mut launched = launch(&spec).unwrap();
        assert!(launched.pid > 0);

        let mut out = String::new();
        launched
            .stdout
            .take()
            .unwrap()
            .read_to_string(&mut out)
            .await
            .unwrap();
        assert!(out.contains("-s"));
        assert!(out.contains("main.py --cpu"));
        assert!(launched.child.wait().await.unwrap().success());
    }

    #[cfg(unix)]
    #[test]
    fn test_launch_non_executable_interpreter_fails() {
        let dir = tempfile::tempdir().unwrap();
        let spec = LaunchSpec::for_root(dir.path(), "");
        touch(&spec.interpreter);
        touch(&spec.script);

        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let result = rt.block_on(async { launch(&spec).map(|p| p.pid) });
        assert!(matches!(result, Err(LaunchError::LaunchFailed(_))));
    }
}
