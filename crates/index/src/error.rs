use std::time::Duration;

use thiserror::Error;

use salesrag_core::ApplicationError;
use salesrag_db::repositories::RepositoryError;
use salesrag_slack::gate::GateError;
use salesrag_vector::{EmbedError, VectorError};

/// Pipeline error taxonomy. `RateLimited` defers the remaining work to a
/// later run, `Access` skips the channel, everything else aborts the run.
#[derive(Debug, Error)]
pub enum IndexError {
    #[error("rate limited after {attempts} attempts (last wait {last_wait:?})")]
    RateLimited { attempts: u32, last_wait: Duration },
    #[error("access denied: {0}")]
    Access(String),
    #[error("repository failure: {0}")]
    Repository(#[from] RepositoryError),
    #[error("vector store failure: {0}")]
    Vector(#[from] VectorError),
    #[error("embedding failure: {0}")]
    Embedding(#[from] EmbedError),
    #[error("entity source failure: {0}")]
    EntitySource(String),
    #[error("fatal gateway failure: {0}")]
    Fatal(String),
}

impl From<GateError> for IndexError {
    fn from(error: GateError) -> Self {
        match error {
            GateError::RateLimited { attempts, last_wait } => {
                Self::RateLimited { attempts, last_wait }
            }
            GateError::Access(code) => Self::Access(code),
            GateError::Fatal(message) => Self::Fatal(message),
        }
    }
}

impl From<ApplicationError> for IndexError {
    fn from(error: ApplicationError) -> Self {
        match error {
            ApplicationError::RateLimited { attempts, last_wait_secs } => Self::RateLimited {
                attempts,
                last_wait: Duration::from_secs(last_wait_secs),
            },
            ApplicationError::Access(code) => Self::Access(code),
            other => Self::EntitySource(other.to_string()),
        }
    }
}
