pub mod config;
pub mod domain;
pub mod entity;
pub mod errors;
pub mod thread;

pub use chrono;

pub use domain::channel::{
    BatchProgress, ChannelId, ChannelRecord, DiscoveredChannel, IndexState, SkipReason,
    StatusSummary,
};
pub use domain::message::{normalize_mentions, EntityKind, EntityMention, MessageId, MessageRecord};
pub use entity::{CrmDirectory, CrmRecord, EntityCatalog, NoopCrmDirectory};
pub use errors::{ApplicationError, DomainError};
