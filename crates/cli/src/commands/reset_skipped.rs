use salesrag_core::config::{AppConfig, LoadOptions};
use salesrag_db::repositories::{ChannelRepository, SqlChannelRepository};

use crate::commands::{build_runtime, open_migrated_pool, CommandResult};

pub fn run() -> CommandResult {
    let config = match AppConfig::load(LoadOptions::default()) {
        Ok(config) => config,
        Err(error) => {
            return CommandResult::failure(
                "reset-skipped",
                "config_validation",
                format!("configuration issue: {error}"),
                2,
            );
        }
    };

    let runtime = match build_runtime("reset-skipped") {
        Ok(runtime) => runtime,
        Err(result) => return result,
    };

    let result = runtime.block_on(async {
        let pool = open_migrated_pool(&config).await?;
        let repository = SqlChannelRepository::new(pool.clone());
        let reset = repository
            .reset_skipped()
            .await
            .map_err(|error| ("repository", error.to_string(), 6u8))?;
        pool.close().await;
        Ok::<u64, (&'static str, String, u8)>(reset)
    });

    match result {
        Ok(reset) => CommandResult::success(
            "reset-skipped",
            format!("returned {reset} skipped channel(s) to the eligible pool"),
        ),
        Err((error_class, message, exit_code)) => {
            CommandResult::failure("reset-skipped", error_class, message, exit_code)
        }
    }
}
