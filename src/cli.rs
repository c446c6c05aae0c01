use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(
    name = "comfy-keeper",
    about = "Launches and supervises a local ComfyUI server",
    version
)]
pub struct Cli {
    /// Machine-readable output
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Supervise the server and read commands from stdin
    Run {
        /// Do not look for a server left running by an earlier session
        #[arg(long)]
        no_adopt: bool,
    },
    /// Configure the server folder and manager options
    Init,
    /// Show the effective settings
    Settings,
    /// Print the command line the server would be launched with
    Args,
    /// Look for a running server process belonging to the configured folder
    Scan,
    /// Launch comfy-keeper at login
    Startup,
    /// Stop launching comfy-keeper at login
    Unstartup,
}
