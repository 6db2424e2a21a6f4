//! TOML Configuration File Support
//!
//! Centralized configuration loading for the relay, supporting a TOML file at
//! `~/.config/screenshot-relay/relay.toml`.
//!
//! # Configuration Priority
//!
//! Configuration values are loaded with the following priority (highest first):
//! 1. CLI arguments (applied by the caller via [`ConfigOverrides`])
//! 2. Environment variables
//! 3. TOML configuration file
//! 4. Default values
//!
//! # Example Configuration
//!
//! ```toml
//! [backend]
//! host = "http://127.0.0.1:11434"
//! model = "llava"
//! request_timeout_secs = 120
//!
//! [conversation]
//! max_turns = 12
//! system_prompt = "You answer questions about the user's screen."
//! session_idle_secs = 1800
//! max_sessions = 256
//!
//! [sampling]
//! temperature = 0.6
//! top_p = 0.9
//! num_predict = -1
//!
//! [server]
//! bind = "127.0.0.1:8787"
//! max_body_bytes = 26214400
//! ```

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::backend::{SamplingOptions, DEFAULT_OLLAMA_HOST};
use crate::request::DEFAULT_PROMPT;
use crate::session::{DEFAULT_MAX_SESSIONS, DEFAULT_MAX_TURNS, DEFAULT_SESSION_IDLE};

/// Default system instruction
pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a concise desktop assistant. The user shares \
screenshots of their screen and asks about them. Answer plainly and briefly.";

/// Default model identifier
pub const DEFAULT_MODEL: &str = "llava";

/// Default listen address for the daemon
pub const DEFAULT_BIND: &str = "127.0.0.1:8787";

// =============================================================================
// Error Types
// =============================================================================

/// Errors that can occur when loading configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read config file
    #[error("Failed to read config file at {path}: {source}")]
    ReadError {
        /// The path that was attempted
        path: PathBuf,
        /// The underlying IO error
        source: std::io::Error,
    },

    /// Failed to parse TOML
    #[error("Failed to parse TOML config: {0}")]
    ParseError(#[from] toml::de::Error),

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

// =============================================================================
// Configuration Source Tracking
// =============================================================================

/// Tracks where a configuration value came from
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigSource {
    /// Value from command-line argument
    Cli,
    /// Value from environment variable
    Env,
    /// Value from TOML configuration file
    File,
    /// Default value
    Default,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cli => write!(f, "CLI"),
            Self::Env => write!(f, "environment"),
            Self::File => write!(f, "config file"),
            Self::Default => write!(f, "default"),
        }
    }
}

// =============================================================================
// TOML Configuration Structures
// =============================================================================

/// Backend section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendToml {
    /// Ollama address
    pub host: Option<String>,

    /// Model identifier
    pub model: Option<String>,

    /// HTTP request timeout in seconds
    pub request_timeout_secs: Option<u64>,
}

/// Conversation section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConversationToml {
    /// Turns retained per session
    pub max_turns: Option<usize>,

    /// System instruction text
    pub system_prompt: Option<String>,

    /// Prompt used when the user sends no text
    pub default_prompt: Option<String>,

    /// Idle seconds after which a session is evicted
    pub session_idle_secs: Option<u64>,

    /// Maximum live sessions
    pub max_sessions: Option<usize>,
}

/// Sampling section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplingToml {
    /// Sampling temperature
    pub temperature: Option<f32>,

    /// Nucleus sampling cutoff
    pub top_p: Option<f32>,

    /// Maximum tokens to generate (-1 = unbounded)
    pub num_predict: Option<i32>,
}

/// Server section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerToml {
    /// Listen address
    pub bind: Option<String>,

    /// Maximum accepted request body size in bytes
    pub max_body_bytes: Option<usize>,
}

/// Top-level TOML configuration structure
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayToml {
    /// Backend configuration section
    pub backend: BackendToml,

    /// Conversation configuration section
    pub conversation: ConversationToml,

    /// Sampling configuration section
    pub sampling: SamplingToml,

    /// Server configuration section
    pub server: ServerToml,
}

// =============================================================================
// Main Configuration Struct
// =============================================================================

/// Centralized configuration for the relay
#[derive(Clone, Debug)]
pub struct RelayConfig {
    /// Ollama address
    pub ollama_host: String,

    /// Model identifier
    pub model: String,

    /// HTTP request timeout
    pub request_timeout: Duration,

    /// Turns retained per session
    pub max_turns: usize,

    /// System instruction text
    pub system_prompt: String,

    /// Prompt used when the user sends no text
    pub default_prompt: String,

    /// Idle time after which a session is evicted
    pub session_idle: Duration,

    /// Maximum live sessions
    pub max_sessions: usize,

    /// Sampling options for every backend call
    pub sampling: SamplingOptions,

    /// Daemon listen address
    pub bind: String,

    /// Maximum accepted request body size in bytes
    pub max_body_bytes: usize,

    /// Path to the config file that was loaded (if any)
    pub config_file_path: Option<PathBuf>,

    /// Source of configuration values
    source: ConfigSource,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            ollama_host: DEFAULT_OLLAMA_HOST.to_string(),
            model: DEFAULT_MODEL.to_string(),
            request_timeout: Duration::from_secs(120),
            max_turns: DEFAULT_MAX_TURNS,
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            default_prompt: DEFAULT_PROMPT.to_string(),
            session_idle: DEFAULT_SESSION_IDLE,
            max_sessions: DEFAULT_MAX_SESSIONS,
            sampling: SamplingOptions::default(),
            bind: DEFAULT_BIND.to_string(),
            max_body_bytes: 25 * 1024 * 1024, // screenshots are large
            config_file_path: None,
            source: ConfigSource::Default,
        }
    }
}

impl RelayConfig {
    /// Create a new configuration with default values
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the primary source of this configuration
    #[must_use]
    pub fn source(&self) -> ConfigSource {
        self.source
    }

    /// Set the configuration source
    pub fn set_source(&mut self, source: ConfigSource) {
        self.source = source;
    }

    /// Check values that would make the relay misbehave
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ValidationError`] describing the first bad value.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_turns == 0 {
            return Err(ConfigError::ValidationError(
                "max_turns must be at least 1".to_string(),
            ));
        }
        if self.max_sessions == 0 {
            return Err(ConfigError::ValidationError(
                "max_sessions must be at least 1".to_string(),
            ));
        }
        if self.session_idle.is_zero() {
            return Err(ConfigError::ValidationError(
                "session_idle_secs must be at least 1".to_string(),
            ));
        }
        if self.model.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "model must not be empty".to_string(),
            ));
        }
        if self.ollama_host.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "backend host must not be empty".to_string(),
            ));
        }
        if !(0.0..=2.0).contains(&self.sampling.temperature) {
            return Err(ConfigError::ValidationError(format!(
                "temperature {} is outside 0.0..=2.0",
                self.sampling.temperature
            )));
        }
        if !(0.0..=1.0).contains(&self.sampling.top_p) {
            return Err(ConfigError::ValidationError(format!(
                "top_p {} is outside 0.0..=1.0",
                self.sampling.top_p
            )));
        }
        Ok(())
    }
}

// =============================================================================
// Configuration Loading
// =============================================================================

/// Get the default configuration file path
///
/// Returns `$XDG_CONFIG_HOME/screenshot-relay/relay.toml` or
/// `~/.config/screenshot-relay/relay.toml` if `XDG_CONFIG_HOME` is not set.
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("screenshot-relay").join("relay.toml"))
}

/// Load configuration from all sources with proper priority
///
/// # Errors
///
/// Returns an error if the config file exists but cannot be parsed.
/// A missing config file is not an error (defaults are used).
pub fn load_config() -> Result<RelayConfig, ConfigError> {
    load_config_from_path(default_config_path())
}

/// Load configuration from a specific path
///
/// # Arguments
///
/// * `path` - Optional path to the configuration file. If `None`, only defaults
///   and environment variables are used.
///
/// # Errors
///
/// Returns an error if the specified config file cannot be read or parsed.
pub fn load_config_from_path(path: Option<PathBuf>) -> Result<RelayConfig, ConfigError> {
    load_config_with_env(path, |key| std::env::var(key).ok())
}

/// Load configuration, reading environment values through `env`
///
/// # Errors
///
/// Returns an error if the specified config file cannot be read or parsed.
pub fn load_config_with_env<F>(path: Option<PathBuf>, env: F) -> Result<RelayConfig, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    // Start with defaults
    let mut config = RelayConfig::default();

    // Try to load from file
    if let Some(ref config_path) = path {
        if config_path.exists() {
            let toml_content =
                std::fs::read_to_string(config_path).map_err(|e| ConfigError::ReadError {
                    path: config_path.clone(),
                    source: e,
                })?;

            let toml_config: RelayToml = toml::from_str(&toml_content)?;
            apply_toml_config(&mut config, &toml_config);
            config.config_file_path = Some(config_path.clone());
            config.source = ConfigSource::File;

            tracing::info!(
                path = %config_path.display(),
                "Loaded configuration from file"
            );
        } else {
            tracing::debug!(
                path = %config_path.display(),
                "Config file not found, using defaults"
            );
        }
    }

    // Apply environment variables (overrides file values)
    apply_env_config(&mut config, env);

    Ok(config)
}

/// Apply TOML configuration values to the config struct
fn apply_toml_config(config: &mut RelayConfig, toml: &RelayToml) {
    // Backend settings
    if let Some(ref host) = toml.backend.host {
        config.ollama_host.clone_from(host);
    }
    if let Some(ref model) = toml.backend.model {
        config.model.clone_from(model);
    }
    if let Some(secs) = toml.backend.request_timeout_secs {
        config.request_timeout = Duration::from_secs(secs);
    }

    // Conversation settings
    if let Some(max_turns) = toml.conversation.max_turns {
        config.max_turns = max_turns;
    }
    if let Some(ref prompt) = toml.conversation.system_prompt {
        config.system_prompt.clone_from(prompt);
    }
    if let Some(ref prompt) = toml.conversation.default_prompt {
        config.default_prompt.clone_from(prompt);
    }
    if let Some(secs) = toml.conversation.session_idle_secs {
        config.session_idle = Duration::from_secs(secs);
    }
    if let Some(max_sessions) = toml.conversation.max_sessions {
        config.max_sessions = max_sessions;
    }

    // Sampling settings
    if let Some(temperature) = toml.sampling.temperature {
        config.sampling.temperature = temperature;
    }
    if let Some(top_p) = toml.sampling.top_p {
        config.sampling.top_p = top_p;
    }
    if let Some(num_predict) = toml.sampling.num_predict {
        config.sampling.num_predict = num_predict;
    }

    // Server settings
    if let Some(ref bind) = toml.server.bind {
        config.bind.clone_from(bind);
    }
    if let Some(size) = toml.server.max_body_bytes {
        config.max_body_bytes = size;
    }
}

/// Apply environment variable overrides to the config
fn apply_env_config<F>(config: &mut RelayConfig, env: F)
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(host) = env("OLLAMA_HOST") {
        config.ollama_host = host;
        config.source = ConfigSource::Env;
    }
    if let Some(model) = env("RELAY_MODEL") {
        config.model = model;
        config.source = ConfigSource::Env;
    }
    if let Some(secs) = env("RELAY_REQUEST_TIMEOUT_SECS").and_then(|v| v.parse::<u64>().ok()) {
        config.request_timeout = Duration::from_secs(secs);
        config.source = ConfigSource::Env;
    }
    if let Some(turns) = env("RELAY_MAX_TURNS").and_then(|v| v.parse::<usize>().ok()) {
        config.max_turns = turns;
        config.source = ConfigSource::Env;
    }
    if let Some(prompt) = env("RELAY_SYSTEM_PROMPT") {
        config.system_prompt = prompt;
        config.source = ConfigSource::Env;
    }
    if let Some(temperature) = env("RELAY_TEMPERATURE").and_then(|v| v.parse::<f32>().ok()) {
        config.sampling.temperature = temperature;
        config.source = ConfigSource::Env;
    }
    if let Some(top_p) = env("RELAY_TOP_P").and_then(|v| v.parse::<f32>().ok()) {
        config.sampling.top_p = top_p;
        config.source = ConfigSource::Env;
    }
    if let Some(bind) = env("RELAY_BIND") {
        config.bind = bind;
        config.source = ConfigSource::Env;
    }
}

// =============================================================================
// CLI Override Support
// =============================================================================

/// Builder for applying CLI overrides to configuration
///
/// Use this after [`load_config`] to apply command-line argument overrides.
#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    /// Listen address override
    pub bind: Option<String>,

    /// Ollama address override
    pub ollama_host: Option<String>,

    /// Model override
    pub model: Option<String>,

    /// Turn limit override
    pub max_turns: Option<usize>,
}

impl ConfigOverrides {
    /// Create a new empty set of overrides
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set listen address override
    #[must_use]
    pub fn with_bind(mut self, bind: String) -> Self {
        self.bind = Some(bind);
        self
    }

    /// Set Ollama address override
    #[must_use]
    pub fn with_ollama_host(mut self, host: String) -> Self {
        self.ollama_host = Some(host);
        self
    }

    /// Set model override
    #[must_use]
    pub fn with_model(mut self, model: String) -> Self {
        self.model = Some(model);
        self
    }

    /// Set turn limit override
    #[must_use]
    pub fn with_max_turns(mut self, max_turns: usize) -> Self {
        self.max_turns = Some(max_turns);
        self
    }

    /// Apply overrides to a configuration
    pub fn apply(&self, config: &mut RelayConfig) {
        let mut applied = false;

        if let Some(ref bind) = self.bind {
            config.bind.clone_from(bind);
            applied = true;
        }
        if let Some(ref host) = self.ollama_host {
            config.ollama_host.clone_from(host);
            applied = true;
        }
        if let Some(ref model) = self.model {
            config.model.clone_from(model);
            applied = true;
        }
        if let Some(max_turns) = self.max_turns {
            config.max_turns = max_turns;
            applied = true;
        }

        if applied {
            config.source = ConfigSource::Cli;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn no_env(_: &str) -> Option<String> {
        None
    }

    fn write_config(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_default_config() {
        let config = RelayConfig::default();
        assert_eq!(config.ollama_host, DEFAULT_OLLAMA_HOST);
        assert_eq!(config.model, DEFAULT_MODEL);
        assert_eq!(config.max_turns, 12);
        assert_eq!(config.default_prompt, "Describe this screenshot briefly.");
        assert_eq!(config.sampling.num_predict, -1);
        assert_eq!(config.source(), ConfigSource::Default);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_default_config_path() {
        if let Some(path) = default_config_path() {
            assert!(path.ends_with("screenshot-relay/relay.toml"));
        }
    }

    #[test]
    fn test_parse_valid_toml() {
        let file = write_config(
            r#"
[backend]
host = "http://gpu.lan:11434"
model = "llava:13b"
request_timeout_secs = 30

[conversation]
max_turns = 4
system_prompt = "Answer in one sentence."
session_idle_secs = 600
max_sessions = 8

[sampling]
temperature = 0.2

[server]
bind = "0.0.0.0:9000"
"#,
        );

        let config = load_config_with_env(Some(file.path().to_path_buf()), no_env).unwrap();
        assert_eq!(config.ollama_host, "http://gpu.lan:11434");
        assert_eq!(config.model, "llava:13b");
        assert_eq!(config.request_timeout, Duration::from_secs(30));
        assert_eq!(config.max_turns, 4);
        assert_eq!(config.system_prompt, "Answer in one sentence.");
        assert_eq!(config.session_idle, Duration::from_secs(600));
        assert_eq!(config.max_sessions, 8);
        assert!((config.sampling.temperature - 0.2).abs() < f32::EPSILON);
        assert!((config.sampling.top_p - 0.9).abs() < f32::EPSILON);
        assert_eq!(config.bind, "0.0.0.0:9000");
        assert_eq!(config.source(), ConfigSource::File);
        assert_eq!(config.config_file_path, Some(file.path().to_path_buf()));
    }

    #[test]
    fn test_missing_file_graceful() {
        let config = load_config_with_env(
            Some(PathBuf::from("/nonexistent/screenshot-relay/relay.toml")),
            no_env,
        )
        .unwrap();
        assert_eq!(config.source(), ConfigSource::Default);
        assert!(config.config_file_path.is_none());
    }

    #[test]
    fn test_malformed_toml_error() {
        let file = write_config("[backend\nhost = ");
        let result = load_config_with_env(Some(file.path().to_path_buf()), no_env);
        assert!(matches!(result, Err(ConfigError::ParseError(_))));
    }

    #[test]
    fn test_env_overrides_file() {
        let file = write_config("[backend]\nmodel = \"from-file\"\n[conversation]\nmax_turns = 4\n");
        let env: HashMap<&str, &str> = [
            ("RELAY_MODEL", "from-env"),
            ("OLLAMA_HOST", "10.0.0.5:11434"),
            ("RELAY_MAX_TURNS", "not-a-number"),
        ]
        .into_iter()
        .collect();

        let config = load_config_with_env(Some(file.path().to_path_buf()), |key| {
            env.get(key).map(|v| (*v).to_string())
        })
        .unwrap();

        assert_eq!(config.model, "from-env");
        assert_eq!(config.ollama_host, "10.0.0.5:11434");
        // Unparseable values are ignored
        assert_eq!(config.max_turns, 4);
        assert_eq!(config.source(), ConfigSource::Env);
    }

    #[test]
    fn test_cli_overrides_env() {
        let mut config =
            load_config_with_env(None, |key| (key == "RELAY_MODEL").then(|| "env".to_string()))
                .unwrap();
        ConfigOverrides::new()
            .with_model("cli".to_string())
            .with_max_turns(2)
            .apply(&mut config);

        assert_eq!(config.model, "cli");
        assert_eq!(config.max_turns, 2);
        assert_eq!(config.source(), ConfigSource::Cli);
    }

    #[test]
    fn test_config_overrides_empty_no_change() {
        let mut config = RelayConfig::default();
        ConfigOverrides::new().apply(&mut config);
        assert_eq!(config.source(), ConfigSource::Default);
        assert_eq!(config.bind, DEFAULT_BIND);
    }

    #[test]
    fn test_validation() {
        let mut config = RelayConfig::default();
        config.max_turns = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ValidationError(_))
        ));

        let mut config = RelayConfig::default();
        config.sampling.top_p = 1.5;
        assert!(config.validate().is_err());

        let mut config = RelayConfig::default();
        config.max_sessions = 0;
        assert!(config.validate().is_err());

        let mut config = RelayConfig::default();
        config.session_idle = Duration::ZERO;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_source_display() {
        assert_eq!(ConfigSource::Cli.to_string(), "CLI");
        assert_eq!(ConfigSource::Env.to_string(), "environment");
        assert_eq!(ConfigSource::File.to_string(), "config file");
        assert_eq!(ConfigSource::Default.to_string(), "default");
    }
}
