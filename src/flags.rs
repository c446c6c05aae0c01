use serde::{Deserialize, Serialize};

pub const DEFAULT_PORT: u16 = 8188;
pub const FRONT_END_REPO: &str = "Comfy-Org/ComfyUI_frontend";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Attention {
    #[default]
    Pytorch,
    Split,
    Quad,
    Sage,
    Flash,
}

impl Attention {
    fn flag(self) -> &'static str {
        match self {
            Attention::Pytorch => "--use-pytorch-cross-attention",
            Attention::Split => "--use-split-cross-attention",
            Attention::Quad => "--use-quad-cross-attention",
            Attention::Sage => "--use-sage-attention",
            Attention::Flash => "--use-flash-attention",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VramPreset {
    #[default]
    Normalvram,
    Highvram,
    Lowvram,
    Novram,
}

impl VramPreset {
    fn flag(self) -> &'static str {
        match self {
            VramPreset::Normalvram => "--normalvram",
            VramPreset::Highvram => "--highvram",
            VramPreset::Lowvram => "--lowvram",
            VramPreset::Novram => "--novram",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingUnit {
    #[default]
    DefaultGpu,
    GpuOnly,
    Cpu,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum VerboseLevel {
    #[default]
    None,
    Debug,
    Info,
    Warning,
    Error,
    Critical,
}

impl VerboseLevel {
    fn as_arg(self) -> Option<&'static str> {
        match self {
            VerboseLevel::None => None,
            VerboseLevel::Debug => Some("DEBUG"),
            VerboseLevel::Info => Some("INFO"),
            VerboseLevel::Warning => Some("WARNING"),
            VerboseLevel::Error => Some("ERROR"),
            VerboseLevel::Critical => Some("CRITICAL"),
        }
    }
}

/// Command-line flags passed to the ComfyUI server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerFlags {
    pub port: u16,
    pub disable_auto_launch: bool,
    pub disable_metadata: bool,
    pub multi_user: bool,
    pub dont_print_server: bool,

    pub attention: Attention,
    pub force_fp16: bool,
    pub force_fp32: bool,
    pub disable_xformers: bool,

    pub vram_mode: VramPreset,
    pub processor: ProcessingUnit,
    pub cuda_device: u32,

    pub disable_all_custom_nodes: bool,
    pub verbose: VerboseLevel,
    pub output_directory: String,
    pub extra_model_paths_config: String,
    pub custom_front_end_version: String,
    pub use_latest_front_end: bool,
}

impl Default for ServerFlags {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            disable_auto_launch: false,
            disable_metadata: false,
            multi_user: false,
            dont_print_server: false,
            attention: Attention::default(),
            force_fp16: false,
            force_fp32: false,
            disable_xformers: false,
            vram_mode: VramPreset::default(),
            processor: ProcessingUnit::default(),
            cuda_device: 0,
            disable_all_custom_nodes: false,
            verbose: VerboseLevel::default(),
            output_directory: String::new(),
            extra_model_paths_config: String::new(),
            custom_front_end_version: String::new(),
            use_latest_front_end: true,
        }
    }
}

impl ServerFlags {
    /// Space-joined flag string, in a fixed order, with defaults omitted.
    pub fn argument_string(&self) -> String {
        let mut parts: Vec<String> = Vec::new();

        if self.port != DEFAULT_PORT {
            parts.push(format!("--port {}", self.port));
        }
        if self.disable_auto_launch {
            parts.push("--disable-auto-launch".into());
        }
        if self.disable_metadata {
            parts.push("--disable-metadata".into());
        }
        if self.multi_user {
            parts.push("--multi-user".into());
        }
        if self.dont_print_server {
            parts.push("--dont-print-server".into());
        }

        if self.force_fp16 {
            parts.push("--force-fp16".into());
        }
        if self.force_fp32 {
            parts.push("--force-fp32".into());
        }
        if self.disable_xformers {
            parts.push("--disable-xformers".into());
        }
        parts.push(self.attention.flag().into());

        match self.processor {
            ProcessingUnit::Cpu => parts.push("--cpu".into()),
            ProcessingUnit::GpuOnly => {
                parts.push("--gpu-only".into());
                self.push_gpu_flags(&mut parts);
            }
            ProcessingUnit::DefaultGpu => self.push_gpu_flags(&mut parts),
        }

        if self.disable_all_custom_nodes {
            parts.push("--disable-all-custom-nodes".into());
        }
        if let Some(level) = self.verbose.as_arg() {
            parts.push(format!("--verbose {level}"));
        }
        if !self.output_directory.trim().is_empty() {
            parts.push(format!("--output-directory \"{}\"", self.output_directory));
        }
        if !self.extra_model_paths_config.trim().is_empty() {
            parts.push(format!(
                "--extra-model-paths-config \"{}\"",
                self.extra_model_paths_config
            ));
        }

        if self.use_latest_front_end {
            parts.push(format!("--front-end-version {FRONT_END_REPO}@latest"));
        } else if !self.custom_front_end_version.trim().is_empty() {
            parts.push(format!(
                "--front-end-version {FRONT_END_REPO}@{}",
                self.custom_front_end_version.trim()
            ));
        }

        parts.join(" ")
    }

    fn push_gpu_flags(&self, parts: &mut Vec<String>) {
        parts.push(self.vram_mode.flag().into());
        if self.cuda_device != 0 {
            parts.push(format!("--cuda-device {}", self.cuda_device));
        }
    }
}
