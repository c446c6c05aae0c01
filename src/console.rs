use crate::events::SupervisorListener;
use crate::log::{LogLine, LogSource};
use crate::paths::Paths;
use crate::scanner::SystemScanner;
use crate::settings::{SettingsSource, SettingsStore};
use crate::startup;
use crate::state::{ServerState, ServerStatus};
use crate::supervisor::{Supervisor, SupervisorError};
use owo_colors::OwoColorize;
use serde_json::json;
use std::ops::ControlFlow;
use std::str::FromStr;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, warn};

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Toggle {
    AutoStart,
    AutoRestart,
    LaunchOnLogin,
}

/// What the user can ask of a running session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Start,
    Stop,
    Restart,
    Status,
    /// Show the log backlog, optionally only the last `n` lines.
    Logs(Option<usize>),
    Set(Toggle, bool),
    Help,
    Exit,
}

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum CommandError {
    #[error("unknown command '{0}' (try 'help')")]
    Unknown(String),
    #[error("{0}")]
    Usage(&'static str),
}

impl FromStr for Command {
    type Err = CommandError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let lowered = input.trim().to_lowercase();
        let mut words = lowered.split_whitespace();
        let Some(head) = words.next() else {
            return Err(CommandError::Usage("empty command"));
        };
        let rest: Vec<&str> = words.collect();

        let command = match (head, rest.as_slice()) {
            ("start", []) => Command::Start,
            ("stop", []) => Command::Stop,
            ("restart", []) => Command::Restart,
            ("status", []) => Command::Status,
            ("logs", []) => Command::Logs(None),
            ("logs", [n]) => Command::Logs(Some(
                n.parse()
                    .map_err(|_| CommandError::Usage("usage: logs [count]"))?,
            )),
            ("set", [name, value]) => {
                let toggle = match *name {
                    "auto-start" => Toggle::AutoStart,
                    "auto-restart" => Toggle::AutoRestart,
                    "launch-on-login" => Toggle::LaunchOnLogin,
                    _ => {
                        return Err(CommandError::Usage(
                            "usage: set <auto-start|auto-restart|launch-on-login> <on|off>",
                        ));
                    }
                };
                let enabled = match *value {
                    "on" | "true" | "yes" => true,
                    "off" | "false" | "no" => false,
                    _ => return Err(CommandError::Usage("value must be 'on' or 'off'")),
                };
                Command::Set(toggle, enabled)
            }
            ("help" | "?", []) => Command::Help,
            ("exit" | "quit" | "q", []) => Command::Exit,
            _ => return Err(CommandError::Unknown(input.trim().to_string())),
        };
        Ok(command)
    }
}

const HELP: &str = "\
commands:
  start                 launch the server
  stop                  stop the server
  restart               stop, wait, start again
  status                show server state and pid
  logs [count]          show the log backlog
  set auto-start on|off       start the server when comfy-keeper starts
  set auto-restart on|off     restart the server after a crash
  set launch-on-login on|off  launch comfy-keeper at login
  exit                  stop the server and quit";

// ---------------------------------------------------------------------------
// Rendering
// ---------------------------------------------------------------------------

fn source_name(source: LogSource) -> &'static str {
    match source {
        LogSource::Stdout => "stdout",
        LogSource::Stderr => "stderr",
        LogSource::Manager => "manager",
    }
}

pub fn state_label(state: ServerState) -> String {
    let label = state.to_string();
    match state {
        ServerState::Running => label.green().bold().to_string(),
        ServerState::Starting => label.yellow().to_string(),
        ServerState::Stopped => label.dimmed().to_string(),
    }
}

pub fn format_status(status: &ServerStatus) -> String {
    match status.pid {
        Some(pid) => format!("server: {} (pid {pid})", state_label(status.state)),
        None => format!("server: {}", state_label(status.state)),
    }
}

fn format_line(line: &LogLine) -> String {
    match line.source {
        LogSource::Manager => line.to_string().cyan().to_string(),
        LogSource::Stdout | LogSource::Stderr => line.to_string(),
    }
}

fn line_json(line: &LogLine) -> serde_json::Value {
    json!({
        "event": "log",
        "time": line.timestamp.to_rfc3339(),
        "source": source_name(line.source),
        "text": line.text,
    })
}

/// Prints supervisor events to stdout as they happen.
pub struct TerminalListener {
    json: bool,
}

impl TerminalListener {
    pub fn new(json: bool) -> Self {
        Self { json }
    }
}

impl SupervisorListener for TerminalListener {
    fn on_state_changed(&self, state: ServerState) {
        if self.json {
            println!("{}", json!({ "event": "state", "state": state }));
        } else {
            println!("{} {}", "●".bold(), state_label(state));
        }
    }

    fn on_log_line(&self, line: &LogLine) {
        if self.json {
            println!("{}", line_json(line));
        } else {
            println!("{}", format_line(line));
        }
    }

    fn on_error(&self, error: &SupervisorError) {
        if self.json {
            println!(
                "{}",
                json!({
                    "event": "error",
                    "message": error.to_string(),
                    "configuration": error.is_configuration(),
                })
            );
        } else if error.is_configuration() {
            eprintln!(
                "{} run `comfy-keeper init` to configure the server folder",
                "hint:".yellow().bold()
            );
        }
    }
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
pub struct RunOptions {
    /// Look for a server left running by an earlier session before anything else.
    pub adopt: bool,
    pub json: bool,
}

/// Apply one command. `Break` ends the session.
pub async fn execute(
    supervisor: &Supervisor,
    store: &SettingsStore,
    paths: &Paths,
    command: Command,
    json: bool,
) -> ControlFlow<()> {
    // Command failures are already reported through the listener.
    match command {
        Command::Start => {
            let _ = supervisor.start().await;
        }
        Command::Stop => {
            let _ = supervisor.stop().await;
        }
        Command::Restart => {
            let _ = supervisor.restart().await;
        }
        Command::Status => {
            let status = supervisor.status();
            if json {
                println!("{}", json!(status));
            } else {
                println!("{}", format_status(&status));
            }
        }
        Command::Logs(count) => {
            let lines = supervisor.log_snapshot();
            let skip = count.map_or(0, |n| lines.len().saturating_sub(n));
            for line in &lines[skip..] {
                if json {
                    println!("{}", line_json(line));
                } else {
                    println!("{}", format_line(line));
                }
            }
        }
        Command::Set(toggle, enabled) => apply_toggle(store, paths, toggle, enabled),
        Command::Help => println!("{HELP}"),
        Command::Exit => {
            let _ = supervisor.shutdown().await;
            return ControlFlow::Break(());
        }
    }
    ControlFlow::Continue(())
}

fn apply_toggle(store: &SettingsStore, paths: &Paths, toggle: Toggle, enabled: bool) {
    if toggle == Toggle::LaunchOnLogin {
        let registered = if enabled {
            startup::install(paths).map(|_| ())
        } else {
            startup::uninstall()
        };
        if let Err(e) = registered {
            eprintln!("{} {e}", "error:".red().bold());
            return;
        }
    }

    store.update(|s| match toggle {
        Toggle::AutoStart => s.auto_start_on_launch = enabled,
        Toggle::AutoRestart => s.auto_restart_on_crash = enabled,
        Toggle::LaunchOnLogin => s.launch_on_os_start = enabled,
    });
    match store.save() {
        Ok(()) => println!("{}", "saved".green()),
        Err(e) => eprintln!("{} {e}", "error:".red().bold()),
    }
}

/// Supervise the server until `exit`, Ctrl-C or SIGTERM. Commands are read
/// from stdin; when stdin closes the session keeps running until a signal.
pub async fn run(paths: &Paths, options: RunOptions) -> color_eyre::Result<()> {
    let store = Arc::new(SettingsStore::load(paths.settings_file()));
    if store.is_first_run() {
        eprintln!(
            "{} no settings at {}; run `comfy-keeper init` first",
            "warning:".yellow().bold(),
            store.path().display()
        );
    } else if store.current().root_directory.is_none() {
        eprintln!(
            "{} no server folder configured; run `comfy-keeper init` first",
            "warning:".yellow().bold()
        );
    }

    let supervisor = Supervisor::new(store.clone(), Arc::new(SystemScanner));
    supervisor.subscribe(Arc::new(TerminalListener::new(options.json)));

    let adopted = if options.adopt {
        supervisor.adopt_existing().await
    } else {
        None
    };
    if adopted.is_none() && store.current().auto_start_on_launch {
        let _ = supervisor.start().await;
    }
    if !options.json {
        eprintln!("{}", "type 'help' for commands".dimmed());
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    loop {
        tokio::select! {
            line = lines.next_line(), if stdin_open => match line {
                Ok(Some(text)) if text.trim().is_empty() => {}
                Ok(Some(text)) => match text.parse::<Command>() {
                    Ok(command) => {
                        let flow = execute(&supervisor, &store, paths, command, options.json).await;
                        if flow.is_break() {
                            return Ok(());
                        }
                    }
                    Err(e) => eprintln!("{} {e}", "error:".red().bold()),
                },
                Ok(None) => {
                    debug!("stdin closed; waiting for a termination signal");
                    stdin_open = false;
                }
                Err(e) => {
                    warn!("reading commands failed: {e}");
                    stdin_open = false;
                }
            },
            _ = shutdown_signal() => break,
        }
    }

    if let Err(e) = supervisor.shutdown().await {
        warn!("shutdown: {e}");
    }
    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = sigterm.recv() => {}
                    _ = tokio::signal::ctrl_c() => {}
                }
            }
            Err(e) => {
                warn!("could not install SIGTERM handler: {e}");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
