use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::DomainError;

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChannelId(pub String);

/// Indexing lifecycle for a channel. `Skipped` is terminal until an operator
/// resets it; `InProgress` exists so concurrent runs cannot claim the same
/// channel twice.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexState {
    NotStarted,
    InProgress,
    Partial,
    Complete,
    Skipped,
}

impl IndexState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotStarted => "not_started",
            Self::InProgress => "in_progress",
            Self::Partial => "partial",
            Self::Complete => "complete",
            Self::Skipped => "skipped",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "not_started" => Some(Self::NotStarted),
            "in_progress" => Some(Self::InProgress),
            "partial" => Some(Self::Partial),
            "complete" => Some(Self::Complete),
            "skipped" => Some(Self::Skipped),
            _ => None,
        }
    }

    /// Eligible for selection by the discovery tracker.
    pub fn is_eligible(&self) -> bool {
        matches!(self, Self::NotStarted | Self::Partial)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    Archived,
    AccessDenied,
    JoinFailed,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Archived => "archived",
            Self::AccessDenied => "access_denied",
            Self::JoinFailed => "join_failed",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "archived" => Some(Self::Archived),
            "access_denied" => Some(Self::AccessDenied),
            "join_failed" => Some(Self::JoinFailed),
            _ => None,
        }
    }
}

/// A channel as reported by the messaging platform's discovery call, before
/// it is merged into the tracked set.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveredChannel {
    pub id: ChannelId,
    pub name: String,
    pub is_archived: bool,
    pub is_private: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChannelRecord {
    pub id: ChannelId,
    pub name: String,
    pub is_archived: bool,
    pub is_private: bool,
    pub state: IndexState,
    pub skip_reason: Option<SkipReason>,
    /// Opaque pagination token to resume the history walk from.
    pub cursor: Option<String>,
    /// Timestamp of the oldest committed message; the processed boundary only
    /// ever moves backward in time.
    pub oldest_indexed_ts: Option<String>,
    pub last_indexed_at: Option<DateTime<Utc>>,
    pub discovered_at: DateTime<Utc>,
}

impl ChannelRecord {
    pub fn can_transition_to(&self, next: IndexState) -> bool {
        matches!(
            (&self.state, next),
            (IndexState::NotStarted, IndexState::InProgress)
                | (IndexState::Partial, IndexState::InProgress)
                | (IndexState::InProgress, IndexState::Partial)
                | (IndexState::InProgress, IndexState::Complete)
                | (IndexState::InProgress, IndexState::Skipped)
                | (IndexState::NotStarted, IndexState::Skipped)
                | (IndexState::Partial, IndexState::Skipped)
                | (IndexState::Skipped, IndexState::NotStarted)
        )
    }

    pub fn transition_to(&mut self, next: IndexState) -> Result<(), DomainError> {
        if self.can_transition_to(next) {
            if next != IndexState::Skipped {
                self.skip_reason = None;
            }
            self.state = next;
            return Ok(());
        }

        Err(DomainError::InvalidChannelTransition { from: self.state, to: next })
    }
}

/// Outcome of one channel batch, applied to the channel record when the batch
/// commits.
#[derive(Clone, Debug, PartialEq)]
pub struct BatchProgress {
    pub state: IndexState,
    pub cursor: Option<String>,
    pub oldest_indexed_ts: Option<String>,
    pub finished_at: DateTime<Utc>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusSummary {
    pub not_started: u64,
    pub in_progress: u64,
    pub partial: u64,
    pub complete: u64,
    pub skipped: u64,
}

impl StatusSummary {
    pub fn remaining(&self) -> u64 {
        self.not_started + self.in_progress + self.partial
    }
}
