use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::channel::ChannelId;

/// Slack message timestamps double as stable per-channel identifiers.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MessageId(pub String);

impl MessageId {
    /// Numeric value of the timestamp, for chronological comparisons. The
    /// wire format is `"<epoch_secs>.<suffix>"`.
    pub fn as_epoch(&self) -> Option<f64> {
        self.0.parse::<f64>().ok()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Company,
    Contact,
    Opportunity,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Company => "company",
            Self::Contact => "contact",
            Self::Opportunity => "opportunity",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "company" => Some(Self::Company),
            "contact" => Some(Self::Contact),
            "opportunity" => Some(Self::Opportunity),
            _ => None,
        }
    }
}

/// A detected reference to a known business object inside message text.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityMention {
    pub kind: EntityKind,
    pub name: String,
}

impl EntityMention {
    pub fn new(kind: EntityKind, name: impl Into<String>) -> Self {
        Self { kind, name: name.into() }
    }
}

/// Sort and de-duplicate a mention list so mention sets compare by value.
pub fn normalize_mentions(mut mentions: Vec<EntityMention>) -> Vec<EntityMention> {
    mentions.sort();
    mentions.dedup();
    mentions
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MessageRecord {
    pub channel_id: ChannelId,
    pub id: MessageId,
    /// Root timestamp of the thread this message belongs to; `None` for
    /// messages outside any multi-message thread.
    pub thread_ts: Option<String>,
    pub author_id: String,
    pub text: String,
    pub posted_at: DateTime<Utc>,
    /// Entities detected directly in this message's text.
    pub mentions: Vec<EntityMention>,
    /// Thread-level union, backfilled by propagation. Always a superset of
    /// `mentions`.
    pub thread_mentions: Vec<EntityMention>,
    pub indexed_at: DateTime<Utc>,
}

impl MessageRecord {
    pub fn in_thread(&self) -> bool {
        self.thread_ts.is_some()
    }

    /// Overwrite the thread-level mention set. The direct mentions are folded
    /// in so the superset invariant holds regardless of the input.
    pub fn set_thread_mentions(&mut self, union: Vec<EntityMention>) {
        let mut merged = union;
        merged.extend(self.mentions.iter().cloned());
        self.thread_mentions = normalize_mentions(merged);
    }
}
