//! Configuration loading from chatline.toml.

use mcp::ServerConfig;
use runtime::{AnthropicAuth, DEFAULT_MAX_TOOL_ITERATIONS, DEFAULT_SYSTEM_PROMPT, EngineConfig};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Looked up in the working directory when `--config` is not given.
pub const CONFIG_FILE: &str = "chatline.toml";

/// Top-level configuration.
#[derive(Debug, Default, Deserialize)]
pub struct Config {
    /// Backend configuration.
    #[serde(default)]
    pub backend: BackendConfig,

    /// Tool server launch settings.
    #[serde(default)]
    pub server: ServerSection,

    /// Chat loop settings.
    #[serde(default)]
    pub engine: EngineSection,
}

/// Backend provider configuration.
#[derive(Debug, Deserialize)]
pub struct BackendConfig {
    /// Model to use.
    #[serde(default = "default_model")]
    pub model: String,

    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    /// Standard Anthropic API key (sk-ant-api01-...).
    /// Mutually exclusive with oauth_token.
    pub api_key: Option<String>,

    /// OAuth access token (sk-ant-oat-...).
    /// Mutually exclusive with api_key.
    pub oauth_token: Option<String>,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            model: default_model(),
            max_tokens: default_max_tokens(),
            api_key: None,
            oauth_token: None,
        }
    }
}

fn default_model() -> String {
    "claude-sonnet-4-20250514".to_string()
}

fn default_max_tokens() -> u32 {
    4096
}

/// How to launch the tool server.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    pub name: String,
    pub command: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: HashMap<String, String>,
    /// Per-request deadline. Unset waits forever.
    pub request_timeout_secs: Option<u64>,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            name: "whatsapp".to_string(),
            command: "uv".to_string(),
            args: vec!["run".to_string(), "main.py".to_string()],
            cwd: Some(PathBuf::from("../whatsapp-mcp-server")),
            env: HashMap::new(),
            request_timeout_secs: None,
        }
    }
}

impl ServerSection {
    pub fn to_server_config(&self) -> ServerConfig {
        ServerConfig {
            name: self.name.clone(),
            command: self.command.clone(),
            args: self.args.clone(),
            env: self.env.clone(),
            cwd: self.cwd.clone(),
            request_timeout: self.request_timeout_secs.map(Duration::from_secs),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct EngineSection {
    pub max_tool_iterations: usize,
    pub system_prompt: Option<String>,
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            max_tool_iterations: DEFAULT_MAX_TOOL_ITERATIONS,
            system_prompt: None,
        }
    }
}

impl EngineSection {
    pub fn to_engine_config(&self) -> EngineConfig {
        EngineConfig {
            system_prompt: self
                .system_prompt
                .clone()
                .unwrap_or_else(|| DEFAULT_SYSTEM_PROMPT.to_string()),
            max_tool_iterations: self.max_tool_iterations,
        }
    }
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::parse(&content)
    }

    /// Load `path`, or [`CONFIG_FILE`] if present, or defaults; then apply
    /// environment overrides.
    pub fn discover(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::load(path)?,
            None if Path::new(CONFIG_FILE).exists() => Self::load(CONFIG_FILE)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Parse configuration from TOML string.
    pub fn parse(toml: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(toml).map_err(|e| ConfigError::Parse(e.to_string()))?;
        if config.engine.max_tool_iterations == 0 {
            return Err(ConfigError::Invalid(
                "engine.max_tool_iterations must be at least 1".into(),
            ));
        }
        Ok(config)
    }

    /// `ANTHROPIC_API_KEY` fills in a missing credential; `CHATLINE_MODEL`
    /// replaces the model.
    pub fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        if self.backend.api_key.is_none() && self.backend.oauth_token.is_none() {
            self.backend.api_key = var("ANTHROPIC_API_KEY").filter(|key| !key.is_empty());
        }
        if let Some(model) = var("CHATLINE_MODEL").filter(|model| !model.is_empty()) {
            self.backend.model = model;
        }
    }

    /// Build the authentication from config.
    ///
    /// Requires exactly one of api_key or oauth_token to be set.
    pub fn auth(&self) -> Result<AnthropicAuth, ConfigError> {
        match (&self.backend.api_key, &self.backend.oauth_token) {
            (Some(key), None) => Ok(AnthropicAuth::ApiKey(key.clone())),
            (None, Some(token)) => Ok(AnthropicAuth::OauthToken(token.clone())),
            (Some(_), Some(_)) => Err(ConfigError::AmbiguousAuth),
            (None, None) => Err(ConfigError::MissingAuth),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(String),

    #[error("invalid config: {0}")]
    Invalid(String),

    #[error(
        "authentication not configured: set backend.api_key, backend.oauth_token or ANTHROPIC_API_KEY"
    )]
    MissingAuth,

    #[error(
        "ambiguous authentication: set either backend.api_key OR backend.oauth_token, not both"
    )]
    AmbiguousAuth,
}
