use std::{collections::BTreeMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;

use crate::{
    Envelope, EnvelopeId, EnvelopeState,
    storage::{AcknowledgeEnvelopes, FetchEnvelopes, InsertEnvelopes},
};

/// An in-memory storage backend for testing or single-process usage.
///
/// Envelopes are kept in a `BTreeMap` keyed by id, so fetches hand them out in
/// creation order. Claims are lease based: an `IN_PROGRESS` envelope whose
/// `locked_at` is older than the lease is offered again on the next fetch.
#[derive(Clone)]
pub struct InMemoryStorage {
    envelopes: Arc<Mutex<BTreeMap<EnvelopeId, Envelope>>>,
    owner: String,
    lease: Duration,
}

impl Default for InMemoryStorage {
    fn default() -> Self {
        Self {
            envelopes: Arc::new(Mutex::new(BTreeMap::new())),
            owner: "inmemory".to_owned(),
            lease: Duration::from_secs(30),
        }
    }
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Name written to `locked_by` when envelopes are claimed.
    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = owner.into();
        self
    }

    /// How long a claim stays valid before the envelope is offered again.
    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }

    /// Copy of a stored envelope.
    pub async fn get(&self, id: EnvelopeId) -> Option<Envelope> {
        self.envelopes.lock().await.get(&id).cloned()
    }

    /// Copy of every stored envelope, in id order.
    pub async fn snapshot(&self) -> Vec<Envelope> {
        self.envelopes.lock().await.values().cloned().collect()
    }

    /// Number of envelopes in the given state.
    pub async fn count(&self, state: EnvelopeState) -> usize {
        self.envelopes
            .lock()
            .await
            .values()
            .filter(|e| e.state == state)
            .count()
    }

    fn is_claimable(&self, envelope: &Envelope, now: chrono::DateTime<Utc>) -> bool {
        match envelope.state {
            EnvelopeState::Pending => true,
            EnvelopeState::InProgress => envelope.locked_at.is_none_or(|locked_at| {
                now.signed_duration_since(locked_at)
                    .to_std()
                    .is_ok_and(|held| held >= self.lease)
            }),
            EnvelopeState::Succeeded | EnvelopeState::Failed => false,
        }
    }
}

#[async_trait]
impl InsertEnvelopes for InMemoryStorage {
    type Error = InMemoryStorageError;

    /// Insert envelopes, rejecting the whole batch if any id already exists.
    async fn insert_batch(&self, envelopes: Vec<Envelope>) -> Result<(), Self::Error> {
        let mut stored = self.envelopes.lock().await;

        let mut seen = std::collections::HashSet::with_capacity(envelopes.len());
        for envelope in &envelopes {
            if stored.contains_key(&envelope.id) || !seen.insert(envelope.id) {
                return Err(InMemoryStorageError::duplicate(envelope.id));
            }
        }

        for envelope in envelopes {
            stored.insert(envelope.id, envelope);
        }
        Ok(())
    }
}

#[async_trait]
impl FetchEnvelopes for InMemoryStorage {
    type Error = InMemoryStorageError;

    /// Claim up to `limit` pending or stale envelopes, oldest first.
    async fn fetch_batch(&self, limit: usize) -> Result<Vec<Envelope>, Self::Error> {
        let now = Utc::now();
        let mut stored = self.envelopes.lock().await;

        let claimed = stored
            .values_mut()
            .filter(|e| self.is_claimable(e, now))
            .take(limit)
            .map(|envelope| {
                envelope.state = EnvelopeState::InProgress;
                envelope.locked_at = Some(now);
                envelope.locked_by = Some(self.owner.clone());
                envelope.last_attempted_at = Some(now);
                envelope.number_of_attempts += 1;
                envelope.clone()
            })
            .collect();

        Ok(claimed)
    }

    fn claim_lease(&self) -> Option<Duration> {
        Some(self.lease)
    }
}

#[async_trait]
impl AcknowledgeEnvelopes for InMemoryStorage {
    type Error = InMemoryStorageError;

    async fn mark_processed(&self, id: EnvelopeId) -> Result<(), Self::Error> {
        let mut stored = self.envelopes.lock().await;
        let envelope = stored
            .get_mut(&id)
            .ok_or(InMemoryStorageError::not_found(id))?;

        if envelope.state == EnvelopeState::Succeeded {
            return Ok(());
        }
        transition(envelope, EnvelopeState::Succeeded)?;
        envelope.locked_at = None;
        envelope.locked_by = None;
        Ok(())
    }

    async fn record_failure(&self, id: EnvelopeId, reason: &str) -> Result<(), Self::Error> {
        let mut stored = self.envelopes.lock().await;
        let envelope = stored
            .get_mut(&id)
            .ok_or(InMemoryStorageError::not_found(id))?;

        if !envelope.state.is_terminal() {
            envelope.error = Some(reason.to_owned());
        }
        Ok(())
    }

    async fn mark_failed(&self, id: EnvelopeId, reason: &str) -> Result<(), Self::Error> {
        let mut stored = self.envelopes.lock().await;
        let envelope = stored
            .get_mut(&id)
            .ok_or(InMemoryStorageError::not_found(id))?;

        if envelope.state == EnvelopeState::Failed {
            return Ok(());
        }
        transition(envelope, EnvelopeState::Failed)?;
        envelope.error = Some(reason.to_owned());
        envelope.locked_at = None;
        envelope.locked_by = None;
        Ok(())
    }
}

fn transition(envelope: &mut Envelope, next: EnvelopeState) -> Result<(), InMemoryStorageError> {
    if !envelope.state.can_transition_to(next) {
        return Err(InMemoryStorageError::illegal_transition(
            envelope.id,
            envelope.state,
            next,
        ));
    }
    envelope.state = next;
    Ok(())
}

/// Error type for `InMemoryStorage` operations.
#[derive(Debug)]
pub struct InMemoryStorageError {
    kind: InMemoryStorageErrorKind,
}

impl InMemoryStorageError {
    fn not_found(id: EnvelopeId) -> Self {
        Self {
            kind: InMemoryStorageErrorKind::NotFound(id),
        }
    }

    fn duplicate(id: EnvelopeId) -> Self {
        Self {
            kind: InMemoryStorageErrorKind::Duplicate(id),
        }
    }

    fn illegal_transition(id: EnvelopeId, from: EnvelopeState, to: EnvelopeState) -> Self {
        Self {
            kind: InMemoryStorageErrorKind::IllegalTransition { id, from, to },
        }
    }

    pub fn kind(&self) -> &InMemoryStorageErrorKind {
        &self.kind
    }
}

impl std::fmt::Display for InMemoryStorageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            InMemoryStorageErrorKind::NotFound(id) => {
                write!(f, "Envelope {id} not found in in-memory storage")
            }
            InMemoryStorageErrorKind::Duplicate(id) => {
                write!(f, "Envelope {id} already exists in in-memory storage")
            }
            InMemoryStorageErrorKind::IllegalTransition { id, from, to } => {
                write!(f, "Envelope {id} cannot move from {from} to {to}")
            }
        }
    }
}

impl std::error::Error for InMemoryStorageError {}

#[derive(Debug, PartialEq, Eq)]
pub enum InMemoryStorageErrorKind {
    NotFound(EnvelopeId),
    Duplicate(EnvelopeId),
    IllegalTransition {
        id: EnvelopeId,
        from: EnvelopeState,
        to: EnvelopeState,
    },
}
