//! Backend, model and instance configuration.

use crate::error::{Error, Result};
use crate::memory::{DEFAULT_BYTE_SIZE, DEFAULT_GROWTH_BYTE_SIZE, MIN_DEFAULT_BYTE_SIZE};
use serde_json::Value;
use std::path::PathBuf;
use std::time::Duration;

/// Name of the model entry file inside `<repository>/<version>/`.
pub const MODEL_FILENAME: &str = "model.py";

/// Name of the stub executable.
pub const STUB_BINARY_NAME: &str = "tandem_stub";

/// Default bound on the initialization handshake.
pub const DEFAULT_STUB_TIMEOUT: Duration = Duration::from_secs(30);

/// Backend-wide settings, parsed from the host-provided configuration JSON.
#[derive(Clone, Debug)]
pub struct BackendConfig {
    /// Initial arena size per instance.
    pub shm_default_byte_size: u64,
    /// Arena growth step.
    pub shm_growth_byte_size: u64,
    /// Bound on the stub initialization handshake.
    pub stub_timeout: Duration,
    /// Directory holding the backend-global stub binary.
    pub backend_lib_path: PathBuf,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            shm_default_byte_size: DEFAULT_BYTE_SIZE,
            shm_growth_byte_size: DEFAULT_GROWTH_BYTE_SIZE,
            stub_timeout: DEFAULT_STUB_TIMEOUT,
            backend_lib_path: PathBuf::new(),
        }
    }
}

impl BackendConfig {
    /// Parse the `cmdline` section of the backend configuration JSON.
    ///
    /// Recognized keys: `shm-default-byte-size` (at least 4 MiB),
    /// `shm-growth-byte-size` (positive), `stub-timeout-seconds` (positive).
    /// Values may be strings or integers; unknown keys are ignored. An empty
    /// document yields the defaults.
    pub fn from_backend_config(json: &str, backend_lib_path: impl Into<PathBuf>) -> Result<Self> {
        let mut config = Self { backend_lib_path: backend_lib_path.into(), ..Self::default() };
        if json.trim().is_empty() {
            return Ok(config);
        }

        let root: Value = serde_json::from_str(json)
            .map_err(|e| Error::Config(format!("malformed backend configuration: {e}")))?;
        let Some(cmdline) = root.get("cmdline") else {
            return Ok(config);
        };

        if let Some(value) = cmdline.get("shm-growth-byte-size") {
            let growth = parse_integer(value, "shm-growth-byte-size")?;
            if growth <= 0 {
                return Err(Error::Config("shm-growth-byte-size must be greater than zero".into()));
            }
            config.shm_growth_byte_size = growth as u64;
        }

        if let Some(value) = cmdline.get("shm-default-byte-size") {
            let default = parse_integer(value, "shm-default-byte-size")?;
            if default < MIN_DEFAULT_BYTE_SIZE as i64 {
                return Err(Error::Config("shm-default-byte-size must be at least 4 MiB".into()));
            }
            config.shm_default_byte_size = default as u64;
        }

        if let Some(value) = cmdline.get("stub-timeout-seconds") {
            let seconds = parse_integer(value, "stub-timeout-seconds")?;
            if seconds <= 0 {
                return Err(Error::Config("stub-timeout-seconds must be greater than zero".into()));
            }
            config.stub_timeout = Duration::from_secs(seconds as u64);
        }

        tracing::debug!(
            shm_default_byte_size = config.shm_default_byte_size,
            shm_growth_byte_size = config.shm_growth_byte_size,
            stub_timeout_seconds = config.stub_timeout.as_secs(),
            "backend configuration"
        );
        Ok(config)
    }
}

fn parse_integer(value: &Value, key: &str) -> Result<i64> {
    match value {
        Value::String(text) => text
            .trim()
            .parse()
            .map_err(|_| Error::Config(format!("{key} must be an integer, got '{text}'"))),
        Value::Number(number) => number
            .as_i64()
            .ok_or_else(|| Error::Config(format!("{key} must be an integer"))),
        other => Err(Error::Config(format!("{key} must be an integer, got {other}"))),
    }
}

/// Everything the runtime needs to know about one model.
#[derive(Clone, Debug)]
pub struct ModelSpec {
    /// Model name.
    pub name: String,
    /// Model version; the entry file lives under `<repository>/<version>/`.
    pub version: u64,
    /// Model repository directory.
    pub repository_path: PathBuf,
    /// Largest total batch the model accepts; zero disables batching.
    pub max_batch_size: u32,
    /// Raw model configuration JSON, forwarded verbatim to the stub.
    pub config_json: String,
    /// Extracted execution environment directory, when the model declares one.
    pub execution_env: Option<PathBuf>,
}

impl ModelSpec {
    /// Build a spec from the model configuration JSON, reading
    /// `max_batch_size` and `parameters.EXECUTION_ENV_PATH.string_value`.
    pub fn from_config_json(
        name: impl Into<String>,
        version: u64,
        repository_path: impl Into<PathBuf>,
        config_json: &str,
    ) -> Result<Self> {
        let root: Value = serde_json::from_str(config_json)
            .map_err(|e| Error::Config(format!("malformed model configuration: {e}")))?;

        let max_batch_size = root.get("max_batch_size").and_then(Value::as_u64).unwrap_or(0) as u32;
        let execution_env = root
            .get("parameters")
            .and_then(|parameters| parameters.get("EXECUTION_ENV_PATH"))
            .and_then(|parameter| parameter.get("string_value"))
            .and_then(Value::as_str)
            .map(PathBuf::from);

        if let Some(env) = &execution_env {
            tracing::info!(env = %env.display(), "using execution environment");
        }

        Ok(Self {
            name: name.into(),
            version,
            repository_path: repository_path.into(),
            max_batch_size,
            config_json: config_json.to_string(),
            execution_env,
        })
    }

    /// Path of the model entry file.
    pub fn model_file(&self) -> PathBuf {
        self.repository_path.join(self.version.to_string()).join(MODEL_FILENAME)
    }
}

/// Device class an instance is pinned to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InstanceKind {
    /// CPU-resident instance.
    Cpu,
    /// GPU-resident instance.
    Gpu,
}

impl InstanceKind {
    /// Stable string used in the arena name and the initialization map.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Cpu => "cpu",
            Self::Gpu => "gpu",
        }
    }
}

impl std::fmt::Display for InstanceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of one model instance.
#[derive(Clone, Debug)]
pub struct InstanceSpec {
    /// Instance name, unique within the server.
    pub name: String,
    /// Device class.
    pub kind: InstanceKind,
    /// Device ordinal.
    pub device_id: i32,
}

impl InstanceSpec {
    /// POSIX shared-memory object name for this instance's arena.
    pub fn shm_region_name(&self) -> String {
        format!("/{}_{}_{}", self.name, self.kind.as_str(), self.device_id)
    }
}
