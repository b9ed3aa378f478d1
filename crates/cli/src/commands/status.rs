use serde::Serialize;

use salesrag_core::config::{AppConfig, LoadOptions};
use salesrag_core::{SkipReason, StatusSummary};
use salesrag_db::repositories::{ChannelRepository, SqlChannelRepository};

use crate::commands::{build_runtime, open_migrated_pool, CommandResult};

#[derive(Debug, Serialize)]
struct ChannelRow {
    channel_id: String,
    name: String,
    status: &'static str,
    skip_reason: Option<SkipReason>,
    oldest_indexed_ts: Option<String>,
    last_indexed_at: Option<String>,
}

#[derive(Debug, Serialize)]
struct StatusReport {
    summary: StatusSummary,
    remaining: u64,
    channels: Vec<ChannelRow>,
}

pub fn run() -> CommandResult {
    let config = match AppConfig::load(LoadOptions::default()) {
        Ok(config) => config,
        Err(error) => {
            return CommandResult::failure(
                "status",
                "config_validation",
                format!("configuration issue: {error}"),
                2,
            );
        }
    };

    let runtime = match build_runtime("status") {
        Ok(runtime) => runtime,
        Err(result) => return result,
    };

    let result = runtime.block_on(async {
        let pool = open_migrated_pool(&config).await?;
        let repository = SqlChannelRepository::new(pool.clone());

        let summary = repository
            .status_summary()
            .await
            .map_err(|error| ("repository", error.to_string(), 6u8))?;
        let channels = repository
            .list_all()
            .await
            .map_err(|error| ("repository", error.to_string(), 6u8))?
            .into_iter()
            .map(|record| ChannelRow {
                channel_id: record.id.0,
                name: record.name,
                status: record.state.as_str(),
                skip_reason: record.skip_reason,
                oldest_indexed_ts: record.oldest_indexed_ts,
                last_indexed_at: record.last_indexed_at.map(|value| value.to_rfc3339()),
            })
            .collect();
        pool.close().await;

        let report = StatusReport { remaining: summary.remaining(), summary, channels };
        serde_json::to_string_pretty(&report)
            .map_err(|error| ("serialization", error.to_string(), 6u8))
    });

    match result {
        Ok(report) => CommandResult::success("status", report),
        Err((error_class, message, exit_code)) => {
            CommandResult::failure("status", error_class, message, exit_code)
        }
    }
}
