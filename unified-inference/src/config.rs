//! Configuration for the orchestrator.

use std::time::Duration;

use config::{Config as ConfigLoader, ConfigError, Environment, File};
use serde::Deserialize;
use unified_inference_common::ExecutionMode;

/// Main configuration structure.
///
/// The execution mode is static for the lifetime of the process: every
/// descriptor of the other mode is rejected when it is requested.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub execution_mode: ExecutionMode,
    /// Path to the YAML model descriptor list.
    #[serde(default = "default_models_config_path")]
    pub models_config_path: String,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub lifecycle: LifecycleConfig,
    #[serde(default)]
    pub offload: OffloadConfig,
    #[serde(default)]
    pub proxy: ProxyConfig,
    #[serde(default)]
    pub process: ProcessConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Largest request body accepted on the proxy surface (MiB).
    #[serde(default = "default_max_body_mb")]
    pub max_body_mb: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            max_body_mb: default_max_body_mb(),
        }
    }
}

/// Backend lifecycle timing.
#[derive(Debug, Clone, Deserialize)]
pub struct LifecycleConfig {
    /// First port handed out to descriptors without an explicit port.
    #[serde(default = "default_base_port")]
    pub base_port: u16,
    /// Idle timeout for descriptors that do not set one. 0 = never stop.
    #[serde(default = "default_idle_timeout")]
    pub default_idle_timeout_secs: u64,
    #[serde(default = "default_health_check_interval")]
    pub health_check_interval_secs: u64,
    #[serde(default = "default_idle_check_interval")]
    pub idle_check_interval_secs: u64,
    /// How long a starting backend has to answer its health endpoint.
    #[serde(default = "default_startup_timeout")]
    pub startup_timeout_secs: u64,
    /// How long a stopping backend gets between SIGTERM and SIGKILL.
    #[serde(default = "default_shutdown_grace_period")]
    pub shutdown_grace_period_secs: u64,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            base_port: default_base_port(),
            default_idle_timeout_secs: default_idle_timeout(),
            health_check_interval_secs: default_health_check_interval(),
            idle_check_interval_secs: default_idle_check_interval(),
            startup_timeout_secs: default_startup_timeout(),
            shutdown_grace_period_secs: default_shutdown_grace_period(),
        }
    }
}

/// GPU to CPU offload policy. Only consulted in gpu mode.
#[derive(Debug, Clone, Deserialize)]
pub struct OffloadConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Offload when the GPU backend queue is at or above this length.
    #[serde(default = "default_queue_threshold")]
    pub queue_threshold: u32,
    /// Retry hint handed to rejected clients.
    #[serde(default = "default_retry_after")]
    pub retry_after_secs: u64,
}

impl Default for OffloadConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            queue_threshold: default_queue_threshold(),
            retry_after_secs: default_retry_after(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProxyConfig {
    /// Per-request timeout for forwarded calls.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    /// Ceiling for the proxy HTTP client as a whole.
    #[serde(default = "default_proxy_timeout")]
    pub proxy_timeout_secs: u64,
    /// Fall back to the default model of the endpoint's type when the
    /// request names no model.
    #[serde(default)]
    pub infer_default_model: bool,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: default_request_timeout(),
            proxy_timeout_secs: default_proxy_timeout(),
            infer_default_model: false,
        }
    }
}

/// How process backends are launched.
///
/// Each process backend runs one inference server subprocess. The command is
/// `program args... --model-path <path> --host <host> --port <port> ... extra_args...`.
#[derive(Debug, Clone, Deserialize)]
pub struct ProcessConfig {
    /// Program or wrapper command to execute.
    #[serde(default = "default_program")]
    pub program: String,
    /// Arguments inserted BEFORE the model args.
    /// Example: `["-m", "sglang.launch_server"]`
    #[serde(default = "default_program_args")]
    pub args: Vec<String>,
    /// Interface the backend binds and the orchestrator connects to.
    #[serde(default = "default_process_host")]
    pub host: String,
    #[serde(default = "default_max_running_requests")]
    pub max_running_requests: u32,
    #[serde(default)]
    pub max_total_tokens: u32,
    /// Extra arguments appended AFTER the standard flags.
    #[serde(default)]
    pub extra_args: Vec<String>,
    #[serde(default = "default_startup_poll_interval")]
    pub startup_poll_interval_ms: u64,
    /// Timeout of a single health or metrics probe.
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_secs: u64,
    /// Introspection endpoint reporting queue length.
    #[serde(default = "default_metrics_path")]
    pub metrics_path: String,
    /// Log backend stdout/stderr at INFO instead of DEBUG.
    #[serde(default)]
    pub log_output: bool,
    /// Output lines kept for "process died" diagnostics.
    #[serde(default = "default_output_tail_lines")]
    pub output_tail_lines: usize,
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            program: default_program(),
            args: default_program_args(),
            host: default_process_host(),
            max_running_requests: default_max_running_requests(),
            max_total_tokens: 0,
            extra_args: vec![],
            startup_poll_interval_ms: default_startup_poll_interval(),
            probe_timeout_secs: default_probe_timeout(),
            metrics_path: default_metrics_path(),
            log_output: false,
            output_tail_lines: default_output_tail_lines(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            execution_mode: ExecutionMode::default(),
            models_config_path: default_models_config_path(),
            server: ServerConfig::default(),
            lifecycle: LifecycleConfig::default(),
            offload: OffloadConfig::default(),
            proxy: ProxyConfig::default(),
            process: ProcessConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

// Default values
fn default_models_config_path() -> String {
    "config/models.yaml".to_string()
}
fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    3001
}
fn default_max_body_mb() -> usize {
    32
}
fn default_base_port() -> u16 {
    30000
}
fn default_idle_timeout() -> u64 {
    300
}
fn default_health_check_interval() -> u64 {
    10
}
fn default_idle_check_interval() -> u64 {
    30
}
fn default_startup_timeout() -> u64 {
    120
}
fn default_shutdown_grace_period() -> u64 {
    30
}
fn default_true() -> bool {
    true
}
fn default_queue_threshold() -> u32 {
    3
}
fn default_retry_after() -> u64 {
    5
}
fn default_request_timeout() -> u64 {
    300
}
fn default_proxy_timeout() -> u64 {
    310
}
fn default_program() -> String {
    "python".to_string()
}
fn default_program_args() -> Vec<String> {
    vec!["-m".to_string(), "sglang.launch_server".to_string()]
}
fn default_process_host() -> String {
    "127.0.0.1".to_string()
}
fn default_max_running_requests() -> u32 {
    3
}
fn default_startup_poll_interval() -> u64 {
    2000
}
fn default_probe_timeout() -> u64 {
    5
}
fn default_metrics_path() -> String {
    "/get_model_info".to_string()
}
fn default_output_tail_lines() -> usize {
    50
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    /// Load configuration from file and environment variables.
    ///
    /// Configuration sources (in order of precedence):
    /// 1. Environment variables (ORCHESTRATOR__SECTION__KEY format)
    /// 2. The given TOML file, or config.toml if present
    /// 3. Built-in defaults
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        let file = match path {
            Some(path) => File::with_name(path).required(true),
            None => File::with_name("config").required(false),
        };

        let config = ConfigLoader::builder()
            .add_source(file)
            .add_source(
                Environment::with_prefix("ORCHESTRATOR")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("process.args")
                    .with_list_parse_key("process.extra_args"),
            )
            .build()?;

        config.try_deserialize()
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.lifecycle.health_check_interval_secs)
    }

    pub fn idle_check_interval(&self) -> Duration {
        Duration::from_secs(self.lifecycle.idle_check_interval_secs)
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.lifecycle.startup_timeout_secs)
    }

    pub fn shutdown_grace_period(&self) -> Duration {
        Duration::from_secs(self.lifecycle.shutdown_grace_period_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_server_config() {
        let server = ServerConfig::default();
        assert_eq!(server.host, "0.0.0.0");
        assert_eq!(server.port, 3001);
    }

    #[test]
    fn test_default_lifecycle_config() {
        let lifecycle = LifecycleConfig::default();
        assert_eq!(lifecycle.base_port, 30000);
        assert_eq!(lifecycle.default_idle_timeout_secs, 300);
        assert_eq!(lifecycle.health_check_interval_secs, 10);
        assert_eq!(lifecycle.idle_check_interval_secs, 30);
        assert_eq!(lifecycle.startup_timeout_secs, 120);
        assert_eq!(lifecycle.shutdown_grace_period_secs, 30);
    }

    #[test]
    fn test_default_offload_config() {
        let offload = OffloadConfig::default();
        assert!(offload.enabled);
        assert_eq!(offload.queue_threshold, 3);
        assert_eq!(offload.retry_after_secs, 5);
    }

    #[test]
    fn test_load_from_toml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("orchestrator.toml");
        std::fs::write(
            &path,
            r#"
execution_mode = "cpu"
models_config_path = "/etc/models.yaml"

[server]
port = 4000

[offload]
enabled = false

[process]
program = "llama-server"
args = []
"#,
        )
        .unwrap();

        let config = Config::load(Some(path.to_str().unwrap())).unwrap();
        assert_eq!(config.execution_mode, ExecutionMode::Cpu);
        assert_eq!(config.models_config_path, "/etc/models.yaml");
        assert_eq!(config.server.port, 4000);
        assert_eq!(config.server.host, "0.0.0.0");
        assert!(!config.offload.enabled);
        assert_eq!(config.process.program, "llama-server");
        assert!(config.process.args.is_empty());
        assert_eq!(config.lifecycle.startup_timeout_secs, 120);
    }

    #[test]
    fn test_missing_explicit_file_is_an_error() {
        let result = Config::load(Some("/nonexistent/orchestrator.toml"));
        assert!(result.is_err());
    }

    #[test]
    fn test_duration_helpers() {
        let config = Config::default();
        assert_eq!(config.health_check_interval(), Duration::from_secs(10));
        assert_eq!(config.idle_check_interval(), Duration::from_secs(30));
        assert_eq!(config.startup_timeout(), Duration::from_secs(120));
        assert_eq!(config.shutdown_grace_period(), Duration::from_secs(30));
    }
}
