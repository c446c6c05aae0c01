use clap::{CommandFactory, Parser};
use color_eyre::eyre::{bail, eyre};
use comfy_keeper::cli::{Cli, Command};
use comfy_keeper::console::{self, RunOptions};
use comfy_keeper::launcher::LaunchSpec;
use comfy_keeper::paths::Paths;
use comfy_keeper::scanner::{ProcessScanner, ReattachSignature, SystemScanner};
use comfy_keeper::settings::{self, AppSettings, SettingsStore};
use comfy_table::{Attribute, Cell, Color, Table, presets::UTF8_FULL_CONDENSED};
use owo_colors::OwoColorize;
use serde_json::json;

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;
    comfy_keeper::logging::init();
    let cli = Cli::parse();

    let Some(command) = cli.command else {
        Cli::command().print_help()?;
        return Ok(());
    };
    let paths = Paths::new()?;

    match command {
        Command::Run { no_adopt } => {
            console::run(
                &paths,
                RunOptions {
                    adopt: !no_adopt,
                    json: cli.json,
                },
            )
            .await?;
        }
        Command::Init => {
            let settings = comfy_keeper::init::run(&paths.settings_file())?;
            sync_startup_registration(&paths, &settings)?;
        }
        Command::Settings => {
            let settings = load_settings(&paths)?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&settings)?);
            } else {
                print_settings(&paths, &settings);
            }
        }
        Command::Args => {
            let settings = load_settings(&paths)?;
            let arguments = settings.argument_string();
            let command_line = settings
                .root_directory
                .as_deref()
                .map(|root| LaunchSpec::for_root(root, arguments.clone()).command_line());
            if cli.json {
                println!(
                    "{}",
                    json!({ "arguments": arguments, "command_line": command_line })
                );
            } else {
                println!("{}", command_line.unwrap_or(arguments));
            }
        }
        Command::Scan => {
            let settings = load_settings(&paths)?;
            let Some(root) = settings.root_directory else {
                bail!("no server folder configured; run `comfy-keeper init` first");
            };
            let signature = ReattachSignature::for_adoption(&root);
            let found = tokio::task::spawn_blocking(move || SystemScanner.find_match(&signature))
                .await?
                .map_err(|e| eyre!("{e}"))?;
            if cli.json {
                println!("{}", json!({ "pid": found }));
            } else {
                match found {
                    Some(pid) => println!("{} (pid {pid})", "server running".green()),
                    None => println!("{}", "no running server found".yellow()),
                }
            }
        }
        Command::Startup => {
            comfy_keeper::startup::install(&paths)?;
            set_launch_on_os_start(&paths, true)?;
        }
        Command::Unstartup => {
            comfy_keeper::startup::uninstall()?;
            set_launch_on_os_start(&paths, false)?;
        }
    }

    Ok(())
}

fn load_settings(paths: &Paths) -> color_eyre::Result<AppSettings> {
    let settings = settings::read_settings(&paths.settings_file())
        .map_err(|e| eyre!("{e}"))?
        .unwrap_or_default();
    Ok(settings)
}

fn set_launch_on_os_start(paths: &Paths, enabled: bool) -> color_eyre::Result<()> {
    let store = SettingsStore::load(paths.settings_file());
    store.update(|s| s.launch_on_os_start = enabled);
    store.save().map_err(|e| eyre!("{e}"))
}

fn sync_startup_registration(paths: &Paths, settings: &AppSettings) -> color_eyre::Result<()> {
    let installed = comfy_keeper::startup::is_installed();
    if settings.launch_on_os_start && !installed {
        comfy_keeper::startup::install(paths)?;
    } else if !settings.launch_on_os_start && installed {
        comfy_keeper::startup::uninstall()?;
    }
    Ok(())
}

fn on_off(value: bool) -> Cell {
    if value {
        Cell::new("on").fg(Color::Green)
    } else {
        Cell::new("off")
    }
}

fn print_settings(paths: &Paths, settings: &AppSettings) {
    let mut table = Table::new();
    table.load_preset(UTF8_FULL_CONDENSED);
    table.set_header(vec![
        Cell::new("setting").add_attribute(Attribute::Bold),
        Cell::new("value").add_attribute(Attribute::Bold),
    ]);

    let root = settings
        .root_directory
        .as_ref()
        .map(|p| p.display().to_string());
    table.add_row(vec![
        Cell::new("server folder").fg(Color::Cyan),
        match root {
            Some(root) => Cell::new(root),
            None => Cell::new("not configured").fg(Color::Red),
        },
    ]);
    table.add_row(vec![
        Cell::new("port").fg(Color::Cyan),
        Cell::new(settings.flags.port),
    ]);
    table.add_row(vec![
        Cell::new("auto start").fg(Color::Cyan),
        on_off(settings.auto_start_on_launch),
    ]);
    table.add_row(vec![
        Cell::new("auto restart").fg(Color::Cyan),
        on_off(settings.auto_restart_on_crash),
    ]);
    table.add_row(vec![
        Cell::new("launch at login").fg(Color::Cyan),
        on_off(settings.launch_on_os_start),
    ]);
    table.add_row(vec![
        Cell::new("log capacity").fg(Color::Cyan),
        Cell::new(
            settings
                .log_capacity
                .map_or_else(|| "unbounded".to_string(), |n| n.to_string()),
        ),
    ]);
    table.add_row(vec![
        Cell::new("arguments").fg(Color::Cyan),
        Cell::new(settings.argument_string()),
    ]);
    println!("{table}");
    println!("  {} {}", "file:".dimmed(), paths.settings_file().display());
}
