//! Broker configuration.
//!
//! Every section carries `#[serde(default)]`, so a JSON file only needs the
//! keys it changes. Defaults reproduce the original RK3588 deployment.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub const DEFAULT_REQUEST_FILE: &str = "/tmp/qwen_command.txt";
pub const DEFAULT_RESPONSE_FILE: &str = "/tmp/qwen_response.txt";
pub const DEFAULT_COMPLETION_MARKER: &str = "/tmp/qwen_response.lock";
pub const DEFAULT_READY_MARKER: &str = "/tmp/qwen_service_ready.signal";

pub const DEFAULT_POLL_INTERVAL_MS: u64 = 200;
pub const DEFAULT_IMAGE_SIZE: u32 = 392;
pub const DEFAULT_N_IMAGE_TOKENS: usize = 196;
pub const DEFAULT_IMAGE_EMBED_LEN: usize = 1536;

pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful assistant.";
pub const DEFAULT_IMAGE_PLACEHOLDER: &str = "<image>\n";
pub const DEFAULT_INSTRUCTION: &str = "你现在是一个专业的、服务于盲人的导盲设备。你的任务是只描述当前画面的道路状况,请用中文，精简且完整地描述对盲人出行至关重要的路况信息，例如：是否有障碍物、台阶、车辆、道路是否平坦、交通信号灯状态等。";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read config {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot parse config {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// The four filesystem artifacts of the request/response protocol.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IpcPaths {
    pub request_file: PathBuf,
    pub response_file: PathBuf,
    pub completion_marker: PathBuf,
    pub ready_marker: PathBuf,
}

impl Default for IpcPaths {
    fn default() -> Self {
        Self {
            request_file: PathBuf::from(DEFAULT_REQUEST_FILE),
            response_file: PathBuf::from(DEFAULT_RESPONSE_FILE),
            completion_marker: PathBuf::from(DEFAULT_COMPLETION_MARKER),
            ready_marker: PathBuf::from(DEFAULT_READY_MARKER),
        }
    }
}

impl IpcPaths {
    /// Same file names as the defaults, rooted at `dir`.
    pub fn in_dir(dir: impl AsRef<Path>) -> Self {
        let dir = dir.as_ref();
        Self {
            request_file: dir.join("qwen_command.txt"),
            response_file: dir.join("qwen_response.txt"),
            completion_marker: dir.join("qwen_response.lock"),
            ready_marker: dir.join("qwen_service_ready.signal"),
        }
    }

    pub fn all(&self) -> [&Path; 4] {
        [
            &self.request_file,
            &self.response_file,
            &self.completion_marker,
            &self.ready_marker,
        ]
    }
}

/// How the text generation engine is hosted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TextBackend {
    /// External worker program speaking JSON Lines on stdin/stdout.
    Worker {
        command: String,
        #[serde(default)]
        args: Vec<String>,
    },
    /// Scripted engine (requires the `mock` feature).
    Mock {
        #[serde(default)]
        reply: Vec<String>,
    },
}

impl Default for TextBackend {
    fn default() -> Self {
        TextBackend::Worker {
            command: "./rkllm_worker".to_string(),
            args: Vec::new(),
        }
    }
}

/// How the vision encoder is hosted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum VisionBackend {
    Worker {
        command: String,
        #[serde(default)]
        args: Vec<String>,
    },
    /// ONNX Runtime session over `encoder_model_path` (requires the `onnx` feature).
    Onnx,
    /// Zero embedding of the configured shape (requires the `mock` feature).
    Mock,
}

impl Default for VisionBackend {
    fn default() -> Self {
        VisionBackend::Worker {
            command: "./rknn_worker".to_string(),
            args: Vec::new(),
        }
    }
}

/// Engine parameters. Field names follow the runtime's own parameter names.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub text_backend: TextBackend,
    pub vision_backend: VisionBackend,
    pub llm_model_path: PathBuf,
    pub encoder_model_path: PathBuf,
    pub max_new_tokens: i32,
    pub max_context_len: i32,
    pub top_k: i32,
    pub skip_special_token: bool,
    pub img_start: String,
    pub img_end: String,
    pub img_content: String,
    pub image_size: u32,
    pub n_image_tokens: usize,
    pub image_embed_len: usize,
    /// Seconds to wait for a worker to answer a load or encode command.
    pub worker_timeout_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            text_backend: TextBackend::default(),
            vision_backend: VisionBackend::default(),
            llm_model_path: PathBuf::from("./qwen2-vl-llm_rk3588.rkllm"),
            encoder_model_path: PathBuf::from("./qwen2_vl_2b_vision_rk3588.rknn"),
            max_new_tokens: 1024,
            max_context_len: 1024,
            top_k: 1,
            skip_special_token: true,
            img_start: "<|vision_start|>".to_string(),
            img_end: "<|vision_end|>".to_string(),
            img_content: "<|image_pad|>".to_string(),
            image_size: DEFAULT_IMAGE_SIZE,
            n_image_tokens: DEFAULT_N_IMAGE_TOKENS,
            image_embed_len: DEFAULT_IMAGE_EMBED_LEN,
            worker_timeout_secs: 30,
        }
    }
}

impl EngineConfig {
    pub fn worker_timeout(&self) -> Duration {
        Duration::from_secs(self.worker_timeout_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PromptConfig {
    pub system_prompt: String,
    pub image_placeholder: String,
    pub instruction: String,
}

impl Default for PromptConfig {
    fn default() -> Self {
        Self {
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            image_placeholder: DEFAULT_IMAGE_PLACEHOLDER.to_string(),
            instruction: DEFAULT_INSTRUCTION.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// `error`, `warn`, `info`, `debug` or `trace`.
    pub level: String,
    /// When set, logs are also written to `<dir>/<timestamp>.log`.
    pub dir: Option<PathBuf>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            dir: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub ipc: IpcPaths,
    pub engine: EngineConfig,
    pub prompt: PromptConfig,
    pub log: LogConfig,
    pub poll_interval_ms: u64,
    /// `None` waits for the terminal callback indefinitely.
    pub inference_timeout_secs: Option<u64>,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            ipc: IpcPaths::default(),
            engine: EngineConfig::default(),
            prompt: PromptConfig::default(),
            log: LogConfig::default(),
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            inference_timeout_secs: None,
        }
    }
}

impl BrokerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn inference_timeout(&self) -> Option<Duration> {
        self.inference_timeout_secs.map(Duration::from_secs)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let engine = &self.engine;
        if engine.max_new_tokens <= 0 {
            return Err(ConfigError::Invalid("max_new_tokens must be positive".into()));
        }
        if engine.max_context_len <= 0 {
            return Err(ConfigError::Invalid("max_context_len must be positive".into()));
        }
        if engine.max_new_tokens > engine.max_context_len {
            return Err(ConfigError::Invalid(format!(
                "max_new_tokens ({}) exceeds max_context_len ({})",
                engine.max_new_tokens, engine.max_context_len
            )));
        }
        if engine.image_size == 0 || engine.n_image_tokens == 0 || engine.image_embed_len == 0 {
            return Err(ConfigError::Invalid(
                "image_size, n_image_tokens and image_embed_len must be non-zero".into(),
            ));
        }
        if self.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid("poll_interval_ms must be non-zero".into()));
        }
        if self.inference_timeout_secs == Some(0) {
            return Err(ConfigError::Invalid(
                "inference_timeout_secs must be non-zero when set".into(),
            ));
        }
        let distinct: HashSet<&Path> = self.ipc.all().into_iter().collect();
        if distinct.len() != 4 {
            return Err(ConfigError::Invalid("IPC paths must be distinct".into()));
        }
        Ok(())
    }
}

/// Load configuration from a JSON file, or defaults when no file is given.
pub fn load_config(path: Option<&Path>) -> Result<BrokerConfig, ConfigError> {
    let config = match path {
        None => BrokerConfig::default(),
        Some(path) => {
            let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
                path: path.to_path_buf(),
                source,
            })?;
            serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?
        }
    };
    config.validate()?;
    Ok(config)
}
