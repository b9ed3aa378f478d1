pub mod commands;

use clap::{Parser, Subcommand};
use std::process::ExitCode;

#[derive(Debug, Parser)]
#[command(
    name = "salesrag",
    about = "Salesrag operator CLI",
    long_about = "Operate the Slack indexing pipeline: migrations, readiness checks, \
                  indexing runs, channel status, and semantic search.",
    after_help = "Examples:\n  salesrag doctor --json\n  salesrag index --max-channels 5\n  salesrag search \"Zillow renewal\" --kind company"
)]
pub struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    #[command(about = "Apply pending database migrations and return structured status output")]
    Migrate,
    #[command(
        about = "Inspect effective configuration values with source attribution and redaction"
    )]
    Config,
    #[command(about = "Validate config, Slack token readiness, and DB connectivity checks")]
    Doctor {
        #[arg(long, help = "Emit machine-readable JSON output")]
        json: bool,
    },
    #[command(about = "Run one bounded indexing pass and print the run summary")]
    Index {
        #[arg(long, help = "Channels to process this run (defaults to config)")]
        max_channels: Option<u32>,
        #[arg(long, help = "History pages per channel this run (defaults to config)")]
        page_budget: Option<u32>,
        #[arg(long, help = "Only index messages newer than this many days (0 = unbounded)")]
        lookback_days: Option<i64>,
    },
    #[command(about = "Show per-channel indexing progress and the tracker summary")]
    Status,
    #[command(
        name = "reset-skipped",
        about = "Return skipped channels to the eligible pool for the next run"
    )]
    ResetSkipped,
    #[command(about = "Semantic search over the indexed corpus")]
    Search {
        #[arg(help = "Query text to embed and match")]
        query: String,
        #[arg(long, default_value_t = 5, help = "Maximum number of hits to return")]
        top_k: usize,
        #[arg(long, help = "Restrict to one source (slack|salesforce)")]
        source: Option<String>,
        #[arg(long, help = "Restrict to one channel id")]
        channel: Option<String>,
        #[arg(long, help = "Only documents mentioning this entity name")]
        entity: Option<String>,
        #[arg(long, help = "Entity kind filter (company|contact|opportunity)")]
        kind: Option<String>,
    },
}

pub fn run() -> ExitCode {
    let cli = Cli::parse();

    let result = match cli.command {
        Command::Migrate => commands::migrate::run(),
        Command::Config => {
            commands::CommandResult { exit_code: 0, output: commands::config::run() }
        }
        Command::Doctor { json } => {
            commands::CommandResult { exit_code: 0, output: commands::doctor::run(json) }
        }
        Command::Index { max_channels, page_budget, lookback_days } => {
            commands::index::run(max_channels, page_budget, lookback_days)
        }
        Command::Status => commands::status::run(),
        Command::ResetSkipped => commands::reset_skipped::run(),
        Command::Search { query, top_k, source, channel, entity, kind } => {
            commands::search::run(commands::search::SearchArgs {
                query,
                top_k,
                source,
                channel,
                entity,
                kind,
            })
        }
    };

    println!("{}", result.output);
    ExitCode::from(result.exit_code)
}
