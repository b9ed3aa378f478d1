pub mod crm;
pub mod discovery;
pub mod error;
pub mod indexer;
pub mod propagate;
pub mod run;

pub use crm::{ingest_crm_records, StaticCrmDirectory};
pub use discovery::{discover_channels, DiscoverySummary};
pub use error::IndexError;
pub use indexer::{BatchOutcome, IndexerSettings, MessageIndexer};
pub use propagate::propagate_channel;
pub use run::{IndexingRun, RunRequest, RunSummary, SkippedChannel};
