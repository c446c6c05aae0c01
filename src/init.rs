use std::io::{BufRead, IsTerminal, Write};
use std::path::{Path, PathBuf};

use color_eyre::eyre::eyre;

use crate::flags::ProcessingUnit;
use crate::launcher::LaunchSpec;
use crate::settings::{self, AppSettings};

fn validate_root(input: &str) -> Result<PathBuf, String> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err("a folder is required".to_string());
    }
    let path = PathBuf::from(trimmed);
    if !path.is_dir() {
        return Err(format!("{} is not a directory", path.display()));
    }
    Ok(path)
}

/// Describes what is missing from a root that exists but does not look like
/// a portable install. The server cannot start until it is fixed.
fn layout_warning(root: &Path) -> Option<String> {
    LaunchSpec::for_root(root, "")
        .validate()
        .err()
        .map(|e| format!("{e}; the server will not start until this is fixed"))
}

fn parse_port(input: &str) -> Result<u16, String> {
    match input.trim().parse::<u16>() {
        Ok(0) | Err(_) => Err("port must be a number between 1 and 65535".to_string()),
        Ok(port) => Ok(port),
    }
}

fn parse_processor(input: &str) -> Result<ProcessingUnit, String> {
    match input.trim() {
        "default_gpu" | "gpu" => Ok(ProcessingUnit::DefaultGpu),
        "gpu_only" => Ok(ProcessingUnit::GpuOnly),
        "cpu" => Ok(ProcessingUnit::Cpu),
        _ => Err("must be one of: default_gpu, gpu_only, cpu".to_string()),
    }
}

fn processor_name(unit: ProcessingUnit) -> &'static str {
    match unit {
        ProcessingUnit::DefaultGpu => "default_gpu",
        ProcessingUnit::GpuOnly => "gpu_only",
        ProcessingUnit::Cpu => "cpu",
    }
}

fn finalize(path: &Path, settings: &AppSettings) -> color_eyre::Result<()> {
    settings::write_settings(path, settings).map_err(|e| eyre!("{e}"))
}

/// Ask for the server folder and manager policy, starting from the values
/// already in `settings_path`, and write the result back.
pub fn run(settings_path: &Path) -> color_eyre::Result<AppSettings> {
    let current = settings::read_settings(settings_path)
        .map_err(|e| eyre!("{e}"))?
        .unwrap_or_default();
    if std::io::stdin().is_terminal() {
        run_interactive(settings_path, current)
    } else {
        let stdin = std::io::stdin();
        let mut reader = stdin.lock();
        run_piped(settings_path, current, &mut reader)
    }
}

// ── Interactive mode (cliclack) ─────────────────────────────────────

fn run_interactive(path: &Path, mut settings: AppSettings) -> color_eyre::Result<AppSettings> {
    cliclack::intro("comfy-keeper init")?;

    let mut root_prompt = cliclack::input("ComfyUI portable folder")
        .placeholder("folder containing python_embeded and ComfyUI")
        .required(true)
        .validate(|input: &String| validate_root(input).map(|_| ()));
    if let Some(existing) = &settings.root_directory {
        root_prompt = root_prompt.default_input(&existing.to_string_lossy());
    }
    let root: String = root_prompt.interact()?;
    let root = validate_root(&root).map_err(|e| eyre!(e))?;
    if let Some(warning) = layout_warning(&root) {
        cliclack::log::warning(warning)?;
    }
    settings.root_directory = Some(root);

    let port: String = cliclack::input("Server port")
        .default_input(&settings.flags.port.to_string())
        .validate(|input: &String| parse_port(input).map(|_| ()))
        .interact()?;
    settings.flags.port = parse_port(&port).map_err(|e| eyre!(e))?;

    settings.flags.processor = cliclack::select("Processing unit")
        .item(ProcessingUnit::DefaultGpu, "Default GPU", "let ComfyUI decide")
        .item(ProcessingUnit::GpuOnly, "GPU only", "keep everything on the GPU")
        .item(ProcessingUnit::Cpu, "CPU", "no GPU acceleration")
        .initial_value(settings.flags.processor)
        .interact()?;

    settings.auto_start_on_launch = cliclack::confirm("Start the server when comfy-keeper starts?")
        .initial_value(settings.auto_start_on_launch)
        .interact()?;
    settings.auto_restart_on_crash = cliclack::confirm("Restart the server if it crashes?")
        .initial_value(settings.auto_restart_on_crash)
        .interact()?;
    settings.launch_on_os_start = cliclack::confirm("Launch comfy-keeper at login?")
        .initial_value(settings.launch_on_os_start)
        .interact()?;

    finalize(path, &settings)?;
    cliclack::outro(format!("Saved {}", path.display()))?;
    Ok(settings)
}

// ── Piped mode (plain stdin/stderr for scripted setup) ──────────────

fn plain_prompt(
    reader: &mut impl BufRead,
    prompt: &str,
    default: Option<&str>,
) -> color_eyre::Result<String> {
    let stderr = std::io::stderr();
    let mut stderr = stderr.lock();
    match default {
        Some(def) if !def.is_empty() => write!(stderr, "{prompt} [{def}]: ")?,
        _ => write!(stderr, "{prompt}: ")?,
    }
    stderr.flush()?;

    let mut line = String::new();
    if reader.read_line(&mut line)? == 0 {
        return Err(eyre!("unexpected end of input at prompt: {prompt}"));
    }
    let line = line.trim_end_matches('\n').trim_end_matches('\r');

    if line.is_empty()
        && let Some(def) = default
    {
        return Ok(def.to_string());
    }

    Ok(line.to_string())
}

fn plain_prompt_valid<T>(
    reader: &mut impl BufRead,
    prompt: &str,
    default: Option<&str>,
    parse: impl Fn(&str) -> Result<T, String>,
) -> color_eyre::Result<T> {
    loop {
        let value = plain_prompt(reader, prompt, default)?;
        match parse(&value) {
            Ok(v) => return Ok(v),
            Err(e) => eprintln!("{e}"),
        }
    }
}

fn plain_prompt_confirm(
    reader: &mut impl BufRead,
    prompt_text: &str,
    default: bool,
) -> color_eyre::Result<bool> {
    let def_str = if default { "Y/n" } else { "y/N" };
    let stderr = std::io::stderr();
    let mut stderr = stderr.lock();
    write!(stderr, "{prompt_text} [{def_str}]: ")?;
    stderr.flush()?;

    let mut line = String::new();
    reader.read_line(&mut line)?;
    let line = line.trim().to_lowercase();

    match line.as_str() {
        "y" | "yes" => Ok(true),
        "n" | "no" => Ok(false),
        _ => Ok(default),
    }
}

fn run_piped(
    path: &Path,
    mut settings: AppSettings,
    reader: &mut impl BufRead,
) -> color_eyre::Result<AppSettings> {
    let existing_root = settings
        .root_directory
        .as_ref()
        .map(|p| p.to_string_lossy().into_owned());
    let root = plain_prompt_valid(
        reader,
        "ComfyUI portable folder",
        existing_root.as_deref(),
        validate_root,
    )?;
    if let Some(warning) = layout_warning(&root) {
        eprintln!("warning: {warning}");
    }
    settings.root_directory = Some(root);

    let port = settings.flags.port.to_string();
    settings.flags.port = plain_prompt_valid(reader, "Server port", Some(&port), parse_port)?;

    settings.flags.processor = plain_prompt_valid(
        reader,
        "Processing unit (default_gpu/gpu_only/cpu)",
        Some(processor_name(settings.flags.processor)),
        parse_processor,
    )?;

    settings.auto_start_on_launch = plain_prompt_confirm(
        reader,
        "Start the server when comfy-keeper starts?",
        settings.auto_start_on_launch,
    )?;
    settings.auto_restart_on_crash = plain_prompt_confirm(
        reader,
        "Restart the server if it crashes?",
        settings.auto_restart_on_crash,
    )?;
    settings.launch_on_os_start = plain_prompt_confirm(
        reader,
        "Launch comfy-keeper at login?",
        settings.launch_on_os_start,
    )?;

    finalize(path, &settings)?;
    println!("Saved {}", path.display());
    Ok(settings)
}
