//! Slack Web API access for the indexing pipeline.
//!
//! Two layers:
//! - **Gateway** (`client`) - the narrow trait the pipeline consumes
//!   (`conversations.list`, `conversations.history`, `conversations.join`)
//!   plus the reqwest-backed implementation
//! - **Gate** (`gate`) - the single place that enforces call spacing and
//!   rate-limit backoff; nothing outside it retries
//!
//! All pipeline traffic to Slack goes through one [`gate::ApiGate`] instance,
//! because the limiting resource is the workspace's rate budget as a whole,
//! not any individual endpoint.

pub mod client;
pub mod gate;

pub use client::{
    ApiError, ChannelPage, HistoryPage, HttpSlackGateway, RawMessage, SlackGateway,
};
pub use gate::{ApiGate, BackoffPolicy, GateError, Sleeper, TokioSleeper};
