use std::sync::Arc;
use std::time::Duration;

use salesrag_core::config::{AppConfig, LoadOptions};
use salesrag_core::{CrmDirectory, NoopCrmDirectory};
use salesrag_db::repositories::{SqlChannelRepository, SqlMessageRepository};
use salesrag_index::{IndexingRun, RunRequest, StaticCrmDirectory};
use salesrag_slack::client::HttpSlackGateway;
use salesrag_slack::gate::{ApiGate, BackoffPolicy};
use salesrag_vector::{Embedder, HashEmbedder, OpenAiEmbedder, SqlVectorStore};

use crate::commands::{build_runtime, open_migrated_pool, CommandResult};

pub fn run(
    max_channels: Option<u32>,
    page_budget: Option<u32>,
    lookback_days: Option<i64>,
) -> CommandResult {
    let config = match AppConfig::load(LoadOptions::default()) {
        Ok(config) => config,
        Err(error) => {
            return CommandResult::failure(
                "index",
                "config_validation",
                format!("configuration issue: {error}"),
                2,
            );
        }
    };

    let runtime = match build_runtime("index") {
        Ok(runtime) => runtime,
        Err(result) => return result,
    };

    let result = runtime.block_on(async {
        let pool = open_migrated_pool(&config).await?;

        let gate = Arc::new(ApiGate::new(
            Duration::from_secs(config.indexing.min_call_spacing_secs),
            BackoffPolicy {
                base: Duration::from_secs(config.indexing.backoff_base_secs),
                max_attempts: config.indexing.max_rate_limit_attempts,
                hint_buffer: Duration::from_secs(config.indexing.retry_hint_buffer_secs),
            },
        ));
        let token =
            config.slack.sync_token.clone().unwrap_or_else(|| config.slack.bot_token.clone());
        let gateway = Arc::new(HttpSlackGateway::new(config.slack.base_url.clone(), token));

        let embedder: Arc<dyn Embedder> = match &config.embedding.api_key {
            Some(api_key) => Arc::new(
                OpenAiEmbedder::new(
                    config.embedding.base_url.clone(),
                    config.embedding.model.clone(),
                    api_key.clone(),
                    Duration::from_secs(config.embedding.timeout_secs),
                )
                .map_err(|error| ("embedder_init", error.to_string(), 6u8))?,
            ),
            None => Arc::new(HashEmbedder::default()),
        };

        let crm: Arc<dyn CrmDirectory> = match (config.crm.enabled, &config.crm.entities_file) {
            (true, Some(path)) => Arc::new(StaticCrmDirectory::new(path.clone())),
            _ => Arc::new(NoopCrmDirectory),
        };

        let run = IndexingRun::new(
            gate,
            gateway,
            Arc::new(SqlChannelRepository::new(pool.clone())),
            Arc::new(SqlMessageRepository::new(pool.clone())),
            Arc::new(SqlVectorStore::new(pool.clone())),
            embedder,
            crm,
            config.crm.enabled,
            config.indexing.clone(),
        );

        let summary = run
            .execute(RunRequest { max_channels, page_budget, lookback_days })
            .await
            .map_err(|error| ("indexing_run", error.to_string(), 6u8))?;
        pool.close().await;

        serde_json::to_string_pretty(&summary)
            .map_err(|error| ("serialization", error.to_string(), 6u8))
    });

    match result {
        Ok(summary) => CommandResult::success("index", summary),
        Err((error_class, message, exit_code)) => {
            CommandResult::failure("index", error_class, message, exit_code)
        }
    }
}
