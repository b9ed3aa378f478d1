use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use salesrag_core::config::{AppConfig, LoadOptions};
use secrecy::ExposeSecret;
use toml::Value;

pub fn run() -> String {
    let config = match AppConfig::load(LoadOptions::default()) {
        Ok(config) => config,
        Err(error) => return format!("config validation failed: {error}"),
    };

    let config_file_path = detect_config_path();
    let config_file_doc = load_config_file_doc(config_file_path.as_deref());
    let source = |key_path: &str, env_key: Option<&str>| {
        field_source(key_path, env_key, config_file_doc.as_ref(), config_file_path.as_deref())
    };

    let mut lines = vec!["effective config (source precedence: env > file > default):".to_string()];

    lines.push(render_line(
        "database.url",
        &config.database.url,
        source("database.url", Some("SALESRAG_DATABASE_URL")),
    ));
    lines.push(render_line(
        "database.max_connections",
        &config.database.max_connections.to_string(),
        source("database.max_connections", None),
    ));
    lines.push(render_line(
        "database.timeout_secs",
        &config.database.timeout_secs.to_string(),
        source("database.timeout_secs", None),
    ));

    lines.push(render_line(
        "slack.bot_token",
        &redact_token(config.slack.bot_token.expose_secret()),
        source("slack.bot_token", Some("SALESRAG_SLACK_BOT_TOKEN")),
    ));
    let sync_token = match &config.slack.sync_token {
        Some(token) => redact_token(token.expose_secret()),
        None => "<unset>".to_string(),
    };
    lines.push(render_line(
        "slack.sync_token",
        &sync_token,
        source("slack.sync_token", Some("SALESRAG_SLACK_SYNC_TOKEN")),
    ));
    lines.push(render_line(
        "slack.base_url",
        &config.slack.base_url,
        source("slack.base_url", None),
    ));

    lines.push(render_line(
        "crm.enabled",
        &config.crm.enabled.to_string(),
        source("crm.enabled", Some("SALESRAG_CRM_ENABLED")),
    ));
    let entities_file = config
        .crm
        .entities_file
        .as_ref()
        .map(|path| path.display().to_string())
        .unwrap_or_else(|| "<unset>".to_string());
    lines.push(render_line(
        "crm.entities_file",
        &entities_file,
        source("crm.entities_file", Some("SALESRAG_CRM_ENTITIES_FILE")),
    ));

    let embedding_api_key = if config.embedding.api_key.is_some() { "<redacted>" } else { "<unset>" };
    lines.push(render_line(
        "embedding.api_key",
        embedding_api_key,
        source("embedding.api_key", Some("SALESRAG_EMBEDDING_API_KEY")),
    ));
    lines.push(render_line(
        "embedding.model",
        &config.embedding.model,
        source("embedding.model", None),
    ));
    lines.push(render_line(
        "embedding.base_url",
        &config.embedding.base_url,
        source("embedding.base_url", None),
    ));

    lines.push(render_line(
        "indexing.page_size",
        &config.indexing.page_size.to_string(),
        source("indexing.page_size", None),
    ));
    lines.push(render_line(
        "indexing.default_max_channels",
        &config.indexing.default_max_channels.to_string(),
        source("indexing.default_max_channels", None),
    ));
    lines.push(render_line(
        "indexing.default_page_budget",
        &config.indexing.default_page_budget.to_string(),
        source("indexing.default_page_budget", None),
    ));
    lines.push(render_line(
        "indexing.default_lookback_days",
        &config.indexing.default_lookback_days.to_string(),
        source("indexing.default_lookback_days", None),
    ));
    lines.push(render_line(
        "indexing.backoff_base_secs",
        &config.indexing.backoff_base_secs.to_string(),
        source("indexing.backoff_base_secs", None),
    ));
    lines.push(render_line(
        "indexing.max_rate_limit_attempts",
        &config.indexing.max_rate_limit_attempts.to_string(),
        source("indexing.max_rate_limit_attempts", None),
    ));

    lines.push(render_line(
        "server.bind_address",
        &config.server.bind_address,
        source("server.bind_address", None),
    ));
    lines.push(render_line(
        "server.port",
        &config.server.port.to_string(),
        source("server.port", None),
    ));

    lines.push(render_line(
        "logging.level",
        &config.logging.level,
        source("logging.level", Some("SALESRAG_LOG_LEVEL")),
    ));
    lines.push(render_line(
        "logging.format",
        &format!("{:?}", config.logging.format),
        source("logging.format", Some("SALESRAG_LOG_FORMAT")),
    ));

    lines.join("\n")
}

fn detect_config_path() -> Option<PathBuf> {
    let root = PathBuf::from("salesrag.toml");
    root.exists().then_some(root)
}

fn load_config_file_doc(path: Option<&Path>) -> Option<Value> {
    let path = path?;
    let raw = fs::read_to_string(path).ok()?;
    raw.parse::<Value>().ok()
}

fn field_source(
    key_path: &str,
    env_key: Option<&str>,
    config_file_doc: Option<&Value>,
    config_file_path: Option<&Path>,
) -> String {
    if let Some(env_key) = env_key {
        if env::var_os(env_key).is_some() {
            return format!("env ({env_key})");
        }
    }

    if let Some(doc) = config_file_doc {
        if contains_path(doc, key_path) {
            let file_path = config_file_path
                .map(|path| path.display().to_string())
                .unwrap_or_else(|| "config file".to_string());
            return format!("file ({file_path})");
        }
    }

    "default".to_string()
}

fn contains_path(root: &Value, key_path: &str) -> bool {
    let mut current = root;
    for key in key_path.split('.') {
        let Some(next) = current.get(key) else {
            return false;
        };
        current = next;
    }
    true
}

fn render_line(key: &str, value: &str, source: String) -> String {
    format!("- {key} = {value} (source: {source})")
}

fn redact_token(token: &str) -> String {
    let trimmed = token.trim();
    if trimmed.is_empty() {
        return "<empty>".to_string();
    }

    if let Some((prefix, _)) = trimmed.split_once('-') {
        return format!("{prefix}-***");
    }

    "<redacted>".to_string()
}
