//! Storage port and backend drivers.
//!
//! The outbox core never talks to a database directly. It depends on three
//! narrow traits instead:
//!
//! - [`InsertEnvelopes`]: persist a buffered batch, all or nothing
//! - [`FetchEnvelopes`]: claim a bounded batch of unprocessed envelopes
//! - [`AcknowledgeEnvelopes`]: record the outcome of a dispatch attempt
//!
//! The [`Store`](crate::Store) only needs the first; workers need the other
//! two. Backends are free to implement them on one type or on several.
//!
//! Concrete implementations live in [`inmemory`] and, behind the `sqlx`
//! feature, in [`sqlx`].

pub mod inmemory;

#[cfg(feature = "sqlx")]
pub mod sqlx;

use std::time::Duration;

use tracing_error::SpanTrace;

use crate::{Envelope, EnvelopeId};

/// Trait for persisting buffered envelopes.
///
/// Implementations must make a batch visible to fetches atomically: either
/// every envelope of the batch is persisted or none is.
#[async_trait::async_trait]
pub trait InsertEnvelopes: Send + Sync {
    /// Backend-specific error type.
    type Error: Into<tower::BoxError> + Send;

    /// Insert a batch of `PENDING` envelopes, preserving their order.
    async fn insert_batch(&self, envelopes: Vec<Envelope>) -> Result<(), Self::Error>;
}

/// Trait for claiming envelopes that are ready for dispatch.
#[async_trait::async_trait]
pub trait FetchEnvelopes: Send + Sync {
    /// Backend-specific error type.
    type Error: Into<tower::BoxError> + Send;

    /// Claim up to `limit` envelopes, in the order they should be dispatched.
    ///
    /// Returned envelopes are `IN_PROGRESS` and must not be handed to another
    /// live worker until their claim goes stale.
    async fn fetch_batch(&self, limit: usize) -> Result<Vec<Envelope>, Self::Error>;

    /// How long a claim stays exclusive, counted from the envelope's
    /// `locked_at`. After that the envelope may be handed to another worker.
    ///
    /// Workers refuse to dispatch an envelope whose claim would expire before
    /// `timeout_per_message` elapses. `None` means claims never go stale.
    fn claim_lease(&self) -> Option<Duration> {
        None
    }
}

/// Trait for recording dispatch outcomes.
#[async_trait::async_trait]
pub trait AcknowledgeEnvelopes: Send + Sync {
    /// Backend-specific error type.
    type Error: Into<tower::BoxError> + Send;

    /// Mark an envelope as successfully processed.
    ///
    /// Must be idempotent: acknowledging an already processed envelope is not
    /// an error.
    async fn mark_processed(&self, id: EnvelopeId) -> Result<(), Self::Error>;

    /// Record a failed attempt. The envelope stays claimable once its claim
    /// goes stale.
    async fn record_failure(&self, _id: EnvelopeId, _reason: &str) -> Result<(), Self::Error> {
        Ok(())
    }

    /// Move an envelope to the terminal `FAILED` state.
    async fn mark_failed(&self, _id: EnvelopeId, _reason: &str) -> Result<(), Self::Error> {
        Ok(())
    }
}

/// Error returned when a storage backend call fails.
///
/// Wraps the underlying backend error and captures a tracing span backtrace
/// for improved diagnostics.
#[derive(Debug)]
pub struct StorageError {
    context: SpanTrace,
    source: tower::BoxError,
}

impl StorageError {
    pub(crate) fn backend(err: impl Into<tower::BoxError>) -> Self {
        Self {
            context: SpanTrace::capture(),
            source: err.into(),
        }
    }

    /// Backend error that caused this failure.
    pub fn inner(&self) -> &(dyn std::error::Error + Send + Sync + 'static) {
        self.source.as_ref()
    }
}

impl std::fmt::Display for StorageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Storage error: {}", self.source)?;
        self.context.fmt(f)
    }
}

impl std::error::Error for StorageError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.source.as_ref())
    }
}
