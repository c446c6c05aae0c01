use color_eyre::eyre::bail;
use std::path::{Path, PathBuf};

pub const DATA_DIR_ENV: &str = "COMFY_KEEPER_DATA_DIR";

#[derive(Debug, Clone)]
pub struct Paths {
    data_dir: PathBuf,
}

impl Paths {
    pub fn new() -> color_eyre::Result<Self> {
        if let Ok(path) = std::env::var(DATA_DIR_ENV) {
            return Ok(Self {
                data_dir: PathBuf::from(path),
            });
        }
        let Some(base) = dirs::config_dir() else {
            bail!("could not determine configuration directory");
        };
        Ok(Self {
            data_dir: base.join("comfy-keeper"),
        })
    }

    pub fn with_base(base: PathBuf) -> Self {
        Self { data_dir: base }
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn settings_file(&self) -> PathBuf {
        self.data_dir.join("settings.toml")
    }

    pub fn log_dir(&self) -> PathBuf {
        self.data_dir.join("logs")
    }

    /// Where the login service sends the manager's own stdout/stderr.
    pub fn service_log(&self) -> PathBuf {
        self.log_dir().join("comfy-keeper.log")
    }
}
