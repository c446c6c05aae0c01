use crate::flags::ServerFlags;
use crate::supervisor::Timings;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppSettings {
    /// Portable ComfyUI folder (contains `python_embeded/` and `ComfyUI/`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub root_directory: Option<PathBuf>,
    pub auto_start_on_launch: bool,
    pub auto_restart_on_crash: bool,
    pub launch_on_os_start: bool,
    /// Keep at most this many log lines in memory. Unbounded when absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_capacity: Option<usize>,
    pub flags: ServerFlags,
    pub timings: Timings,
}

impl AppSettings {
    pub fn argument_string(&self) -> String {
        self.flags.argument_string()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("could not read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid settings file {}: {message}", path.display())]
    Parse { path: PathBuf, message: String },
    #[error("could not serialize settings: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("could not write {}: {source}", path.display())]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Read access to the current settings. The supervisor reads through this at
/// every decision point and never caches the result.
pub trait SettingsSource: Send + Sync {
    fn current(&self) -> AppSettings;
}

pub fn parse_settings(content: &str, path: &Path) -> Result<AppSettings, SettingsError> {
    toml::from_str(content).map_err(|e| SettingsError::Parse {
        path: path.to_path_buf(),
        message: e.to_string(),
    })
}

pub fn read_settings(path: &Path) -> Result<Option<AppSettings>, SettingsError> {
    let content = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(SettingsError::Read {
                path: path.to_path_buf(),
                source,
            });
        }
    };
    parse_settings(&content, path).map(Some)
}

pub fn write_settings(path: &Path, settings: &AppSettings) -> Result<(), SettingsError> {
    let content = toml::to_string_pretty(settings)?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|source| SettingsError::Write {
            path: parent.to_path_buf(),
            source,
        })?;
    }
    std::fs::write(path, content).map_err(|source| SettingsError::Write {
        path: path.to_path_buf(),
        source,
    })
}

/// Owns the settings file and the in-memory copy of it.
#[derive(Debug)]
pub struct SettingsStore {
    path: PathBuf,
    current: RwLock<AppSettings>,
    first_run: bool,
}

impl SettingsStore {
    pub fn new(path: PathBuf, settings: AppSettings) -> Self {
        Self {
            path,
            current: RwLock::new(settings),
            first_run: false,
        }
    }

    /// Load settings from `path`. A missing file yields defaults; an
    /// unreadable or invalid file is reported and also yields defaults.
    pub fn load(path: PathBuf) -> Self {
        let (settings, first_run) = match read_settings(&path) {
            Ok(Some(settings)) => (settings, false),
            Ok(None) => (AppSettings::default(), true),
            Err(e) => {
                warn!("{e}; defaults will be used");
                (AppSettings::default(), false)
            }
        };
        Self {
            path,
            current: RwLock::new(settings),
            first_run,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// True when no settings file existed at load time.
    pub fn is_first_run(&self) -> bool {
        self.first_run
    }

    pub fn update(&self, f: impl FnOnce(&mut AppSettings)) {
        let mut guard = self.current.write().unwrap_or_else(|e| e.into_inner());
        f(&mut guard);
    }

    pub fn save(&self) -> Result<(), SettingsError> {
        let settings = self.current();
        write_settings(&self.path, &settings)
    }
}

impl SettingsSource for SettingsStore {
    fn current(&self) -> AppSettings {
        self.current
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flags::{ProcessingUnit, VramPreset};

    #[test]
    fn test_empty_file_is_defaults() {
        let settings = parse_settings("", Path::new("settings.toml")).unwrap();
        assert_eq!(settings, AppSettings::default());
        assert_eq!(settings.flags.port, 8188);
        assert!(settings.flags.use_latest_front_end);
    }

    #[test]
    fn test_parse_partial_file() {
        let content = r#"
root_directory = "/opt/ComfyUI_windows_portable"
auto_restart_on_crash = true

[flags]
port = 8190
processor = "cpu"
vram_mode = "lowvram"
"#;
        let settings = parse_settings(content, Path::new("settings.toml")).unwrap();
        assert_eq!(
            settings.root_directory,
            Some(PathBuf::from("/opt/ComfyUI_windows_portable"))
        );
        assert!(settings.auto_restart_on_crash);
        assert!(!settings.auto_start_on_launch);
        assert_eq!(settings.flags.port, 8190);
        assert_eq!(settings.flags.processor, ProcessingUnit::Cpu);
        assert_eq!(settings.flags.vram_mode, VramPreset::Lowvram);
        assert_eq!(settings.timings, Timings::default());
    }

    #[test]
    fn test_parse_timings_override() {
        let content = r#"
[timings]
stop_timeout_ms = 2000
reattach_attempts = 3
"#;
        let settings = parse_settings(content, Path::new("settings.toml")).unwrap();
        assert_eq!(settings.timings.stop_timeout_ms, 2000);
        assert_eq!(settings.timings.reattach_attempts, 3);
        assert_eq!(
            settings.timings.restart_delay_ms,
            Timings::default().restart_delay_ms
        );
    }

    #[test]
    fn test_parse_invalid_toml() {
        let result = parse_settings("root_directory = [", Path::new("settings.toml"));
        assert!(matches!(result, Err(SettingsError::Parse { .. })));
    }

    #[test]
    fn test_parse_wrong_type() {
        let result = parse_settings("auto_restart_on_crash = \"yes\"", Path::new("s.toml"));
        assert!(matches!(result, Err(SettingsError::Parse { .. })));
    }

    #[test]
    fn test_read_missing_file_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let result = read_settings(&dir.path().join("missing.toml")).unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("settings.toml");

        let store = SettingsStore::new(path.clone(), AppSettings::default());
        store.update(|s| {
            s.root_directory = Some(PathBuf::from("/srv/comfy"));
            s.auto_start_on_launch = true;
            s.flags.cuda_device = 1;
        });
        store.save().unwrap();

        let loaded = SettingsStore::load(path);
        assert!(!loaded.is_first_run());
        let current = loaded.current();
        assert_eq!(current.root_directory, Some(PathBuf::from("/srv/comfy")));
        assert!(current.auto_start_on_launch);
        assert_eq!(current.flags.cuda_device, 1);
    }

    #[test]
    fn test_load_missing_is_first_run() {
        let dir = tempfile::tempdir().unwrap();
        let store = SettingsStore::load(dir.path().join("settings.toml"));
        assert!(store.is_first_run());
        assert_eq!(store.current(), AppSettings::default());
    }

    #[test]
    fn test_load_invalid_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.toml");
        std::fs::write(&path, "this is not toml = = =").unwrap();

        let store = SettingsStore::load(path);
        assert!(!store.is_first_run());
        assert_eq!(store.current(), AppSettings::default());
    }

    #[test]
    fn test_current_is_a_snapshot() {
        let store = SettingsStore::new(PathBuf::from("unused.toml"), AppSettings::default());
        let before = store.current();
        store.update(|s| s.auto_restart_on_crash = true);
        assert!(!before.auto_restart_on_crash);
        assert!(store.current().auto_restart_on_crash);
    }
}
