use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub slack: SlackConfig,
    pub crm: CrmConfig,
    pub embedding: EmbeddingConfig,
    pub indexing: IndexingConfig,
    pub server: ServerConfig,
    pub logging: LoggingConfig,
}

#[derive(Clone, Debug)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub timeout_secs: u64,
}

#[derive(Clone, Debug)]
pub struct SlackConfig {
    pub bot_token: SecretString,
    /// Separate token used for history syncing when the bot token's scopes
    /// are not sufficient; falls back to the bot token when absent.
    pub sync_token: Option<SecretString>,
    pub base_url: String,
}

#[derive(Clone, Debug)]
pub struct CrmConfig {
    pub enabled: bool,
    /// Snapshot file with known entity records, consumed by the static
    /// directory. The live CRM client is an external collaborator.
    pub entities_file: Option<PathBuf>,
}

#[derive(Clone, Debug)]
pub struct EmbeddingConfig {
    pub api_key: Option<SecretString>,
    pub base_url: String,
    pub model: String,
    pub timeout_secs: u64,
}

#[derive(Clone, Debug)]
pub struct IndexingConfig {
    /// Minimum spacing between outbound calls to the same remote service.
    pub min_call_spacing_secs: u64,
    /// First backoff step after a rate-limit response; doubles per attempt.
    pub backoff_base_secs: u64,
    pub max_rate_limit_attempts: u32,
    /// Safety margin added to any server-provided retry hint.
    pub retry_hint_buffer_secs: u64,
    pub page_size: u32,
    pub default_page_budget: u32,
    pub default_max_channels: u32,
    pub default_lookback_days: i64,
    pub min_message_chars: usize,
}

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub bind_address: String,
    pub port: u16,
}

#[derive(Clone, Debug)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Compact,
    Pretty,
    Json,
}

impl std::str::FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "compact" => Ok(Self::Compact),
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(ConfigError::Validation(format!(
                "unsupported log format `{other}` (expected compact|pretty|json)"
            ))),
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    pub database_url: Option<String>,
    pub slack_bot_token: Option<String>,
    pub slack_sync_token: Option<String>,
    pub embedding_api_key: Option<String>,
    pub crm_enabled: Option<bool>,
    pub crm_entities_file: Option<PathBuf>,
    pub log_level: Option<String>,
}

#[derive(Clone, Debug, Default)]
pub struct LoadOptions {
    pub config_path: Option<PathBuf>,
    pub require_file: bool,
    pub overrides: ConfigOverrides,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file `{path}`: {source}")]
    ReadFile { path: PathBuf, source: std::io::Error },
    #[error("could not parse config file `{path}`: {source}")]
    ParseFile { path: PathBuf, source: toml::de::Error },
    #[error("required config file was not found: `{0}`")]
    MissingConfigFile(PathBuf),
    #[error("invalid environment override for `{key}`: `{value}`")]
    InvalidEnvOverride { key: String, value: String },
    #[error("configuration validation failed: {0}")]
    Validation(String),
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig {
                url: "sqlite://salesrag.db".to_string(),
                max_connections: 5,
                timeout_secs: 30,
            },
            slack: SlackConfig {
                bot_token: String::new().into(),
                sync_token: None,
                base_url: "https://slack.com/api".to_string(),
            },
            crm: CrmConfig { enabled: false, entities_file: None },
            embedding: EmbeddingConfig {
                api_key: None,
                base_url: "https://api.openai.com/v1".to_string(),
                model: "text-embedding-ada-002".to_string(),
                timeout_secs: 30,
            },
            indexing: IndexingConfig {
                min_call_spacing_secs: 2,
                backoff_base_secs: 60,
                max_rate_limit_attempts: 3,
                retry_hint_buffer_secs: 5,
                page_size: 100,
                default_page_budget: 10,
                default_max_channels: 10,
                default_lookback_days: 90,
                min_message_chars: 3,
            },
            server: ServerConfig { bind_address: "127.0.0.1".to_string(), port: 8080 },
            logging: LoggingConfig { level: "info".to_string(), format: LogFormat::Compact },
        }
    }
}

impl AppConfig {
    pub fn load(options: LoadOptions) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        let maybe_path = resolve_config_path(options.config_path.as_deref());

        if let Some(path) = maybe_path {
            let patch = read_patch(&path)?;
            config.apply_patch(patch);
        } else if options.require_file {
            let expected = options.config_path.unwrap_or_else(|| PathBuf::from("salesrag.toml"));
            return Err(ConfigError::MissingConfigFile(expected));
        }

        config.apply_env_overrides()?;
        config.apply_overrides(options.overrides);
        config.validate()?;

        Ok(config)
    }

    fn apply_patch(&mut self, patch: ConfigPatch) {
        if let Some(database) = patch.database {
            if let Some(url) = database.url {
                self.database.url = url;
            }
            if let Some(max_connections) = database.max_connections {
                self.database.max_connections = max_connections;
            }
            if let Some(timeout_secs) = database.timeout_secs {
                self.database.timeout_secs = timeout_secs;
            }
        }

        if let Some(slack) = patch.slack {
            if let Some(bot_token_value) = slack.bot_token {
                self.slack.bot_token = bot_token_value.into();
            }
            if let Some(sync_token_value) = slack.sync_token {
                self.slack.sync_token = Some(sync_token_value.into());
            }
            if let Some(base_url) = slack.base_url {
                self.slack.base_url = base_url;
            }
        }

        if let Some(crm) = patch.crm {
            if let Some(enabled) = crm.enabled {
                self.crm.enabled = enabled;
            }
            if let Some(entities_file) = crm.entities_file {
                self.crm.entities_file = Some(entities_file);
            }
        }

        if let Some(embedding) = patch.embedding {
            if let Some(api_key_value) = embedding.api_key {
                self.embedding.api_key = Some(api_key_value.into());
            }
            if let Some(base_url) = embedding.base_url {
                self.embedding.base_url = base_url;
            }
            if let Some(model) = embedding.model {
                self.embedding.model = model;
            }
            if let Some(timeout_secs) = embedding.timeout_secs {
                self.embedding.timeout_secs = timeout_secs;
            }
        }

        if let Some(indexing) = patch.indexing {
            if let Some(min_call_spacing_secs) = indexing.min_call_spacing_secs {
                self.indexing.min_call_spacing_secs = min_call_spacing_secs;
            }
            if let Some(backoff_base_secs) = indexing.backoff_base_secs {
                self.indexing.backoff_base_secs = backoff_base_secs;
            }
            if let Some(max_rate_limit_attempts) = indexing.max_rate_limit_attempts {
                self.indexing.max_rate_limit_attempts = max_rate_limit_attempts;
            }
            if let Some(retry_hint_buffer_secs) = indexing.retry_hint_buffer_secs {
                self.indexing.retry_hint_buffer_secs = retry_hint_buffer_secs;
            }
            if let Some(page_size) = indexing.page_size {
                self.indexing.page_size = page_size;
            }
            if let Some(default_page_budget) = indexing.default_page_budget {
                self.indexing.default_page_budget = default_page_budget;
            }
            if let Some(default_max_channels) = indexing.default_max_channels {
                self.indexing.default_max_channels = default_max_channels;
            }
            if let Some(default_lookback_days) = indexing.default_lookback_days {
                self.indexing.default_lookback_days = default_lookback_days;
            }
            if let Some(min_message_chars) = indexing.min_message_chars {
                self.indexing.min_message_chars = min_message_chars;
            }
        }

        if let Some(server) = patch.server {
            if let Some(bind_address) = server.bind_address {
                self.server.bind_address = bind_address;
            }
            if let Some(port) = server.port {
                self.server.port = port;
            }
        }

        if let Some(logging) = patch.logging {
            if let Some(level) = logging.level {
                self.logging.level = level;
            }
            if let Some(format) = logging.format {
                self.logging.format = format;
            }
        }
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Ok(url) = env::var("SALESRAG_DATABASE_URL") {
            self.database.url = url;
        }
        if let Ok(token) = env::var("SALESRAG_SLACK_BOT_TOKEN") {
            self.slack.bot_token = token.into();
        }
        if let Ok(token) = env::var("SALESRAG_SLACK_SYNC_TOKEN") {
            self.slack.sync_token = Some(token.into());
        }
        if let Ok(key) = env::var("SALESRAG_EMBEDDING_API_KEY") {
            self.embedding.api_key = Some(key.into());
        }
        if let Ok(value) = env::var("SALESRAG_CRM_ENABLED") {
            self.crm.enabled = parse_bool("SALESRAG_CRM_ENABLED", &value)?;
        }
        if let Ok(path) = env::var("SALESRAG_CRM_ENTITIES_FILE") {
            self.crm.entities_file = Some(PathBuf::from(path));
        }
        if let Ok(level) = env::var("SALESRAG_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Ok(format) = env::var("SALESRAG_LOG_FORMAT") {
            self.logging.format = format
                .parse()
                .map_err(|_| ConfigError::InvalidEnvOverride {
                    key: "SALESRAG_LOG_FORMAT".to_string(),
                    value: format,
                })?;
        }
        Ok(())
    }

    fn apply_overrides(&mut self, overrides: ConfigOverrides) {
        if let Some(url) = overrides.database_url {
            self.database.url = url;
        }
        if let Some(token) = overrides.slack_bot_token {
            self.slack.bot_token = token.into();
        }
        if let Some(token) = overrides.slack_sync_token {
            self.slack.sync_token = Some(token.into());
        }
        if let Some(key) = overrides.embedding_api_key {
            self.embedding.api_key = Some(key.into());
        }
        if let Some(enabled) = overrides.crm_enabled {
            self.crm.enabled = enabled;
        }
        if let Some(path) = overrides.crm_entities_file {
            self.crm.entities_file = Some(path);
        }
        if let Some(level) = overrides.log_level {
            self.logging.level = level;
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.database.url.trim().is_empty() {
            return Err(ConfigError::Validation("database.url must not be empty".to_string()));
        }
        let bot_token = self.slack.bot_token.expose_secret();
        if !bot_token.is_empty() && !bot_token.starts_with("xox") {
            return Err(ConfigError::Validation(
                "slack.bot_token does not look like a Slack token (expected `xox...` prefix)"
                    .to_string(),
            ));
        }
        if self.indexing.max_rate_limit_attempts == 0 {
            return Err(ConfigError::Validation(
                "indexing.max_rate_limit_attempts must be at least 1".to_string(),
            ));
        }
        if self.indexing.page_size == 0 || self.indexing.page_size > 1000 {
            return Err(ConfigError::Validation(
                "indexing.page_size must be between 1 and 1000".to_string(),
            ));
        }
        if self.indexing.default_lookback_days <= 0 {
            return Err(ConfigError::Validation(
                "indexing.default_lookback_days must be positive".to_string(),
            ));
        }
        if self.crm.enabled && self.crm.entities_file.is_none() {
            return Err(ConfigError::Validation(
                "crm.enabled requires crm.entities_file to be set".to_string(),
            ));
        }
        Ok(())
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" => Ok(false),
        _ => Err(ConfigError::InvalidEnvOverride {
            key: key.to_string(),
            value: value.to_string(),
        }),
    }
}

fn resolve_config_path(explicit: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return path.exists().then(|| path.to_path_buf());
    }
    let default = PathBuf::from("salesrag.toml");
    default.exists().then_some(default)
}

fn read_patch(path: &Path) -> Result<ConfigPatch, ConfigError> {
    let raw = fs::read_to_string(path)
        .map_err(|source| ConfigError::ReadFile { path: path.to_path_buf(), source })?;
    toml::from_str(&raw)
        .map_err(|source| ConfigError::ParseFile { path: path.to_path_buf(), source })
}

#[derive(Debug, Default, Deserialize)]
struct ConfigPatch {
    database: Option<DatabasePatch>,
    slack: Option<SlackPatch>,
    crm: Option<CrmPatch>,
    embedding: Option<EmbeddingPatch>,
    indexing: Option<IndexingPatch>,
    server: Option<ServerPatch>,
    logging: Option<LoggingPatch>,
}

#[derive(Debug, Default, Deserialize)]
struct DatabasePatch {
    url: Option<String>,
    max_connections: Option<u32>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct SlackPatch {
    bot_token: Option<String>,
    sync_token: Option<String>,
    base_url: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct CrmPatch {
    enabled: Option<bool>,
    entities_file: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize)]
struct EmbeddingPatch {
    api_key: Option<String>,
    base_url: Option<String>,
    model: Option<String>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct IndexingPatch {
    min_call_spacing_secs: Option<u64>,
    backoff_base_secs: Option<u64>,
    max_rate_limit_attempts: Option<u32>,
    retry_hint_buffer_secs: Option<u64>,
    page_size: Option<u32>,
    default_page_budget: Option<u32>,
    default_max_channels: Option<u32>,
    default_lookback_days: Option<i64>,
    min_message_chars: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
struct ServerPatch {
    bind_address: Option<String>,
    port: Option<u16>,
}

#[derive(Debug, Default, Deserialize)]
struct LoggingPatch {
    level: Option<String>,
    format: Option<LogFormat>,
}
