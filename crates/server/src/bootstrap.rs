use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{info, warn};

use salesrag_core::config::{AppConfig, ConfigError, LoadOptions};
use salesrag_core::{CrmDirectory, NoopCrmDirectory};
use salesrag_db::repositories::{
    ChannelRepository, SqlChannelRepository, SqlMessageRepository,
};
use salesrag_db::{connect_with_settings, migrations, DbPool};
use salesrag_index::{IndexingRun, StaticCrmDirectory};
use salesrag_slack::client::HttpSlackGateway;
use salesrag_slack::gate::{ApiGate, BackoffPolicy};
use salesrag_vector::{
    EmbedError, Embedder, HashEmbedder, OpenAiEmbedder, SqlVectorStore, VectorIndex,
};

pub struct Application {
    pub config: AppConfig,
    pub db_pool: DbPool,
    pub run: Arc<IndexingRun>,
    pub channels: Arc<dyn ChannelRepository>,
    pub vector: Arc<dyn VectorIndex>,
    pub embedder: Arc<dyn Embedder>,
}

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("database connection failed: {0}")]
    DatabaseConnect(#[source] sqlx::Error),
    #[error("database migration failed: {0}")]
    Migration(#[source] sqlx::migrate::MigrateError),
    #[error("embedder initialization failed: {0}")]
    Embedder(#[from] EmbedError),
}

pub async fn bootstrap(options: LoadOptions) -> Result<Application, BootstrapError> {
    let config = AppConfig::load(options)?;
    bootstrap_with_config(config).await
}

pub async fn bootstrap_with_config(config: AppConfig) -> Result<Application, BootstrapError> {
    info!(event_name = "bootstrap.start", "starting application bootstrap");

    let db_pool = connect_with_settings(
        &config.database.url,
        config.database.max_connections,
        config.database.timeout_secs,
    )
    .await
    .map_err(BootstrapError::DatabaseConnect)?;
    info!(event_name = "bootstrap.database_connected", "database connection established");

    migrations::run_pending(&db_pool).await.map_err(BootstrapError::Migration)?;
    info!(event_name = "bootstrap.migrations_applied", "database migrations applied");

    let gate = Arc::new(ApiGate::new(
        Duration::from_secs(config.indexing.min_call_spacing_secs),
        BackoffPolicy {
            base: Duration::from_secs(config.indexing.backoff_base_secs),
            max_attempts: config.indexing.max_rate_limit_attempts,
            hint_buffer: Duration::from_secs(config.indexing.retry_hint_buffer_secs),
        },
    ));

    // History syncing prefers the dedicated sync token when one is set.
    let token =
        config.slack.sync_token.clone().unwrap_or_else(|| config.slack.bot_token.clone());
    let gateway = Arc::new(HttpSlackGateway::new(config.slack.base_url.clone(), token));

    let embedder: Arc<dyn Embedder> = match &config.embedding.api_key {
        Some(api_key) => Arc::new(OpenAiEmbedder::new(
            config.embedding.base_url.clone(),
            config.embedding.model.clone(),
            api_key.clone(),
            Duration::from_secs(config.embedding.timeout_secs),
        )?),
        None => {
            warn!(
                event_name = "bootstrap.embedder_fallback",
                "no embedding api key configured; using local deterministic embedder"
            );
            Arc::new(HashEmbedder::default())
        }
    };

    let crm: Arc<dyn CrmDirectory> = match (config.crm.enabled, &config.crm.entities_file) {
        (true, Some(path)) => Arc::new(StaticCrmDirectory::new(path.clone())),
        _ => Arc::new(NoopCrmDirectory),
    };

    let channels: Arc<dyn ChannelRepository> =
        Arc::new(SqlChannelRepository::new(db_pool.clone()));
    let vector: Arc<dyn VectorIndex> = Arc::new(SqlVectorStore::new(db_pool.clone()));

    let run = Arc::new(IndexingRun::new(
        gate,
        gateway,
        channels.clone(),
        Arc::new(SqlMessageRepository::new(db_pool.clone())),
        vector.clone(),
        embedder.clone(),
        crm,
        config.crm.enabled,
        config.indexing.clone(),
    ));

    Ok(Application { config, db_pool, run, channels, vector, embedder })
}
