use std::time::Duration;

use serde::Serialize;

use salesrag_core::config::{AppConfig, LoadOptions};
use salesrag_core::{ChannelId, EntityKind};
use salesrag_vector::{
    Embedder, HashEmbedder, OpenAiEmbedder, SearchFilter, SearchHit, Source, SqlVectorStore,
    VectorIndex,
};

use crate::commands::{build_runtime, open_migrated_pool, CommandResult};

#[derive(Debug)]
pub struct SearchArgs {
    pub query: String,
    pub top_k: usize,
    pub source: Option<String>,
    pub channel: Option<String>,
    pub entity: Option<String>,
    pub kind: Option<String>,
}

#[derive(Debug, Serialize)]
struct SearchReport {
    query: String,
    hits: Vec<SearchHit>,
}

pub fn run(args: SearchArgs) -> CommandResult {
    let config = match AppConfig::load(LoadOptions::default()) {
        Ok(config) => config,
        Err(error) => {
            return CommandResult::failure(
                "search",
                "config_validation",
                format!("configuration issue: {error}"),
                2,
            );
        }
    };

    let mut filter = SearchFilter::new();
    if let Some(raw) = &args.source {
        match Source::parse(raw) {
            Some(source) => filter = filter.with_source(source),
            None => {
                return CommandResult::failure(
                    "search",
                    "invalid_argument",
                    format!("unknown source `{raw}` (expected slack|salesforce)"),
                    2,
                );
            }
        }
    }
    if let Some(raw) = &args.kind {
        match EntityKind::parse(raw) {
            Some(kind) => filter = filter.with_kind(kind),
            None => {
                return CommandResult::failure(
                    "search",
                    "invalid_argument",
                    format!("unknown entity kind `{raw}` (expected company|contact|opportunity)"),
                    2,
                );
            }
        }
    }
    if let Some(channel) = &args.channel {
        filter = filter.with_channel(ChannelId(channel.clone()));
    }
    if let Some(entity) = &args.entity {
        filter = filter.with_entity(entity.clone());
    }

    let runtime = match build_runtime("search") {
        Ok(runtime) => runtime,
        Err(result) => return result,
    };

    let result = runtime.block_on(async {
        let pool = open_migrated_pool(&config).await?;

        let embedding = match &config.embedding.api_key {
            Some(api_key) => {
                let embedder = OpenAiEmbedder::new(
                    config.embedding.base_url.clone(),
                    config.embedding.model.clone(),
                    api_key.clone(),
                    Duration::from_secs(config.embedding.timeout_secs),
                )
                .map_err(|error| ("embedder_init", error.to_string(), 6u8))?;
                embedder.embed(&args.query).await
            }
            None => HashEmbedder::default().embed(&args.query).await,
        }
        .map_err(|error| ("embedding", error.to_string(), 6u8))?;

        let store = SqlVectorStore::new(pool.clone());
        let hits = store
            .search(&embedding, &filter, args.top_k)
            .await
            .map_err(|error| ("vector_store", error.to_string(), 6u8))?;
        pool.close().await;

        serde_json::to_string_pretty(&SearchReport { query: args.query.clone(), hits })
            .map_err(|error| ("serialization", error.to_string(), 6u8))
    });

    match result {
        Ok(report) => CommandResult::success("search", report),
        Err((error_class, message, exit_code)) => {
            CommandResult::failure("search", error_class, message, exit_code)
        }
    }
}
