use thiserror::Error;

use crate::types::StreamToken;

/// Errors surfaced by the persistence coordination layer.
///
/// `AllocationUnavailable` may be retried by the caller. `Construction` and
/// `ConfigurationDrift` are fatal to process startup.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("stream position allocation for {stream} failed: durable counter unavailable")]
    AllocationUnavailable {
        stream: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("failed to construct {store} store")]
    Construction {
        store: &'static str,
        #[source]
        source: Box<StoreError>,
    },

    #[error("{store} store invariant violated: {message}")]
    Invariant { store: &'static str, message: String },

    #[error(
        "Found users in database not native to {configured} (e.g. {stored})!\n\
         You cannot change a server_name after it's been configured"
    )]
    ConfigurationDrift { configured: String, stored: String },

    #[error("stored identity {0:?} has no domain part")]
    InvalidIdentity(String),

    #[error("stream {stream} reservation {token} lies below the durable baseline")]
    StaleReservation { stream: String, token: StreamToken },

    #[error("database error: {0:#}")]
    Database(#[from] anyhow::Error),
}

impl StoreError {
    /// Whether the caller may retry the failed operation.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StoreError::AllocationUnavailable { .. } | StoreError::Database(_)
        )
    }

    /// Whether startup must abort.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            StoreError::Construction { .. }
                | StoreError::ConfigurationDrift { .. }
                | StoreError::InvalidIdentity(_)
                | StoreError::Invariant { .. }
        )
    }
}

pub type Result<T, E = StoreError> = std::result::Result<T, E>;
