use std::time::Duration;

use async_trait::async_trait;
use sqlx::{PgPool, Row, postgres::PgRow};
use uuid::Uuid;

use crate::{
    Envelope, EnvelopeId, EnvelopeState, Payload,
    envelope::UnknownState,
    storage::{AcknowledgeEnvelopes, FetchEnvelopes, InsertEnvelopes},
};

const COLUMNS: &str = "id, driver_name, payload, state, created_at, locked_at, locked_by, \
                       last_attempted_at, number_of_attempts, error";

/// Postgres storage backend.
///
/// Claims use `FOR UPDATE SKIP LOCKED`, so any number of workers, in this
/// process or others, can poll the same table without handing out an
/// envelope twice while its claim is fresh.
#[derive(Clone)]
pub struct PgStorage {
    pool: PgPool,
    owner: String,
    lease: Duration,
}

impl PgStorage {
    /// Creates a storage on an existing table.
    pub fn new_uninitialized(pool: PgPool) -> Self {
        Self {
            pool,
            owner: "pigeonhole".to_owned(),
            lease: Duration::from_secs(30),
        }
    }

    /// Creates a storage and ensures the outbox table exists.
    #[tracing::instrument(skip_all)]
    pub async fn try_new(pool: PgPool) -> Result<Self, Error> {
        create_table(&pool).await?;
        Ok(Self::new_uninitialized(pool))
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

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Load a stored envelope.
    pub async fn get(&self, id: EnvelopeId) -> Result<Option<Envelope>, Error> {
        let row = sqlx::query(&format!("SELECT {COLUMNS} FROM outbox WHERE id = $1"))
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(envelope_from_row).transpose()
    }

    /// Moves a claimed envelope to a terminal state.
    async fn settle(
        &self,
        id: EnvelopeId,
        next: EnvelopeState,
        reason: Option<&str>,
    ) -> Result<(), Error> {
        let updated = sqlx::query(
            "UPDATE outbox
             SET state = $2, error = COALESCE($3, error), locked_at = NULL, locked_by = NULL
             WHERE id = $1 AND state = 'IN_PROGRESS'",
        )
        .bind(id.as_uuid())
        .bind(next.as_str())
        .bind(reason)
        .execute(&self.pool)
        .await?;

        if updated.rows_affected() > 0 {
            return Ok(());
        }

        let state: Option<String> = sqlx::query_scalar("SELECT state FROM outbox WHERE id = $1")
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await?;
        match state {
            None => Err(Error::not_found(id)),
            Some(state) => {
                let state = state.parse::<EnvelopeState>()?;
                if state == next {
                    Ok(())
                } else {
                    Err(Error::illegal_transition(id, state, next))
                }
            }
        }
    }
}

#[async_trait]
impl InsertEnvelopes for PgStorage {
    type Error = Error;

    #[tracing::instrument(skip_all, fields(batch_size = envelopes.len()))]
    async fn insert_batch(&self, envelopes: Vec<Envelope>) -> Result<(), Self::Error> {
        let mut tx = self.pool.begin().await?;
        for envelope in envelopes {
            sqlx::query(
                "INSERT INTO outbox (id, driver_name, payload, state, created_at, number_of_attempts)
                 VALUES ($1, $2, $3, $4, $5, $6)",
            )
            .bind(envelope.id.as_uuid())
            .bind(envelope.driver_name)
            .bind(envelope.payload.into_inner())
            .bind(envelope.state.as_str())
            .bind(envelope.created_at)
            .bind(i32::try_from(envelope.number_of_attempts).unwrap_or(i32::MAX))
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }
}

#[async_trait]
impl FetchEnvelopes for PgStorage {
    type Error = Error;

    #[tracing::instrument(skip_all, fields(limit))]
    async fn fetch_batch(&self, limit: usize) -> Result<Vec<Envelope>, Self::Error> {
        let rows = sqlx::query(&format!(
            "UPDATE outbox
             SET state = 'IN_PROGRESS',
                 locked_at = now(),
                 locked_by = $1,
                 last_attempted_at = now(),
                 number_of_attempts = number_of_attempts + 1
             WHERE id IN (
                 SELECT id FROM outbox
                 WHERE state = 'PENDING'
                    OR (state = 'IN_PROGRESS' AND locked_at <= now() - make_interval(secs => $2))
                 ORDER BY id
                 LIMIT $3
                 FOR UPDATE SKIP LOCKED
             )
             RETURNING {COLUMNS}"
        ))
        .bind(&self.owner)
        .bind(self.lease.as_secs_f64())
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;

        let mut envelopes = rows
            .iter()
            .map(envelope_from_row)
            .collect::<Result<Vec<_>, _>>()?;
        // RETURNING does not keep the subquery order
        envelopes.sort_by_key(|envelope| envelope.id);
        Ok(envelopes)
    }

    fn claim_lease(&self) -> Option<Duration> {
        Some(self.lease)
    }
}

#[async_trait]
impl AcknowledgeEnvelopes for PgStorage {
    type Error = Error;

    #[tracing::instrument(skip(self))]
    async fn mark_processed(&self, id: EnvelopeId) -> Result<(), Self::Error> {
        self.settle(id, EnvelopeState::Succeeded, None).await
    }

    #[tracing::instrument(skip(self))]
    async fn record_failure(&self, id: EnvelopeId, reason: &str) -> Result<(), Self::Error> {
        let updated = sqlx::query(
            "UPDATE outbox SET error = $2 WHERE id = $1 AND state IN ('PENDING', 'IN_PROGRESS')",
        )
        .bind(id.as_uuid())
        .bind(reason)
        .execute(&self.pool)
        .await?;

        if updated.rows_affected() == 0 && self.get(id).await?.is_none() {
            return Err(Error::not_found(id));
        }
        Ok(())
    }

    #[tracing::instrument(skip(self))]
    async fn mark_failed(&self, id: EnvelopeId, reason: &str) -> Result<(), Self::Error> {
        self.settle(id, EnvelopeState::Failed, Some(reason)).await
    }
}

fn envelope_from_row(row: &PgRow) -> Result<Envelope, Error> {
    let state: String = row.try_get("state")?;
    let attempts: i32 = row.try_get("number_of_attempts")?;

    Ok(Envelope {
        id: EnvelopeId::from(row.try_get::<Uuid, _>("id")?),
        driver_name: row.try_get("driver_name")?,
        payload: Payload::from(row.try_get::<Vec<u8>, _>("payload")?),
        state: state.parse()?,
        created_at: row.try_get("created_at")?,
        locked_at: row.try_get("locked_at")?,
        locked_by: row.try_get("locked_by")?,
        last_attempted_at: row.try_get("last_attempted_at")?,
        number_of_attempts: u32::try_from(attempts).unwrap_or_default(),
        error: row.try_get("error")?,
    })
}

/// Ensures the outbox table exists.
async fn create_table(pool: &PgPool) -> Result<(), Error> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS outbox (
            id UUID PRIMARY KEY,
            driver_name TEXT NOT NULL,
            payload BYTEA NOT NULL,
            state TEXT NOT NULL DEFAULT 'PENDING',
            created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
            locked_at TIMESTAMPTZ,
            locked_by TEXT,
            last_attempted_at TIMESTAMPTZ,
            number_of_attempts INT NOT NULL DEFAULT 0,
            error TEXT
        )",
    )
    .execute(pool)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS outbox_claimable ON outbox (state, id)")
        .execute(pool)
        .await?;
    Ok(())
}

/// Postgres storage errors.
#[derive(Debug)]
pub struct Error {
    context: tracing_error::SpanTrace,
    kind: PgStorageErrorKind,
}

/// Kinds of Postgres storage errors.
#[derive(Debug)]
pub enum PgStorageErrorKind {
    Database(sqlx::Error),
    /// A row holds a state this crate does not know.
    State(UnknownState),
    NotFound(EnvelopeId),
    IllegalTransition {
        id: EnvelopeId,
        from: EnvelopeState,
        to: EnvelopeState,
    },
}

impl Error {
    fn not_found(id: EnvelopeId) -> Self {
        Self {
            context: tracing_error::SpanTrace::capture(),
            kind: PgStorageErrorKind::NotFound(id),
        }
    }

    fn illegal_transition(id: EnvelopeId, from: EnvelopeState, to: EnvelopeState) -> Self {
        Self {
            context: tracing_error::SpanTrace::capture(),
            kind: PgStorageErrorKind::IllegalTransition { id, from, to },
        }
    }

    pub fn kind(&self) -> &PgStorageErrorKind {
        &self.kind
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            PgStorageErrorKind::Database(err) => writeln!(f, "Database error: {err}"),
            PgStorageErrorKind::State(err) => writeln!(f, "Corrupt row: {err}"),
            PgStorageErrorKind::NotFound(id) => writeln!(f, "Envelope {id} not found"),
            PgStorageErrorKind::IllegalTransition { id, from, to } => {
                writeln!(f, "Envelope {id} cannot move from {from} to {to}")
            }
        }?;
        self.context.fmt(f)
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            PgStorageErrorKind::Database(err) => Some(err),
            PgStorageErrorKind::State(err) => Some(err),
            PgStorageErrorKind::NotFound(_) | PgStorageErrorKind::IllegalTransition { .. } => None,
        }
    }
}

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        Self {
            context: tracing_error::SpanTrace::capture(),
            kind: PgStorageErrorKind::Database(err),
        }
    }
}

impl From<UnknownState> for Error {
    fn from(err: UnknownState) -> Self {
        Self {
            context: tracing_error::SpanTrace::capture(),
            kind: PgStorageErrorKind::State(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    fn id(n: u128) -> EnvelopeId {
        EnvelopeId::from(Uuid::from_u128(n))
    }

    fn envelopes(ids: std::ops::RangeInclusive<u128>) -> Vec<Envelope> {
        ids.map(|i| {
            Envelope::pending(
                id(i),
                "email",
                Payload::json(&format!("m{i}")).unwrap(),
            )
        })
        .collect()
    }

    #[sqlx::test]
    async fn insert_and_claim_in_id_order(pool: PgPool) {
        let storage = PgStorage::try_new(pool).await.unwrap().with_owner("node-1");
        storage.insert_batch(envelopes(1..=3)).await.unwrap();

        let claimed = storage.fetch_batch(2).await.unwrap();

        let ids: Vec<_> = claimed.iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![id(1), id(2)]);
        for envelope in &claimed {
            assert_eq!(envelope.state, EnvelopeState::InProgress);
            assert_eq!(envelope.locked_by.as_deref(), Some("node-1"));
            assert!(envelope.locked_at.is_some());
            assert_eq!(envelope.number_of_attempts, 1);
        }
        assert_eq!(claimed[0].payload.decode::<String>().unwrap(), "m1");

        let rest = storage.fetch_batch(10).await.unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].id, id(3));
        assert!(storage.fetch_batch(10).await.unwrap().is_empty());
    }

    #[sqlx::test]
    async fn duplicate_id_rejects_the_whole_batch(pool: PgPool) {
        let storage = PgStorage::try_new(pool).await.unwrap();
        storage.insert_batch(envelopes(1..=1)).await.unwrap();

        let err = storage.insert_batch(envelopes(1..=3)).await.unwrap_err();
        assert!(matches!(err.kind(), PgStorageErrorKind::Database(_)));

        assert!(storage.get(id(2)).await.unwrap().is_none());
        assert!(storage.get(id(3)).await.unwrap().is_none());
    }

    #[sqlx::test]
    async fn stale_claims_are_offered_again(pool: PgPool) {
        let storage = PgStorage::try_new(pool).await.unwrap().with_lease(Duration::ZERO);
        storage.insert_batch(envelopes(1..=1)).await.unwrap();

        storage.fetch_batch(1).await.unwrap();
        let reclaimed = storage.fetch_batch(1).await.unwrap();

        assert_eq!(reclaimed.len(), 1);
        assert_eq!(reclaimed[0].number_of_attempts, 2);
    }

    #[sqlx::test]
    async fn concurrent_fetches_never_share_envelopes(pool: PgPool) {
        let storage = PgStorage::try_new(pool).await.unwrap();
        storage.insert_batch(envelopes(1..=20)).await.unwrap();

        let (a, b) = tokio::join!(storage.fetch_batch(10), storage.fetch_batch(10));
        let (a, b) = (a.unwrap(), b.unwrap());

        let ids: HashSet<_> = a.iter().chain(&b).map(|e| e.id).collect();
        assert_eq!(ids.len(), a.len() + b.len());
        assert_eq!(ids.len(), 20);
    }

    #[sqlx::test]
    async fn mark_processed_is_idempotent(pool: PgPool) {
        let storage = PgStorage::try_new(pool).await.unwrap();
        storage.insert_batch(envelopes(1..=1)).await.unwrap();
        let id = storage.fetch_batch(1).await.unwrap()[0].id;

        storage.mark_processed(id).await.unwrap();
        storage.mark_processed(id).await.unwrap();

        let envelope = storage.get(id).await.unwrap().unwrap();
        assert_eq!(envelope.state, EnvelopeState::Succeeded);
        assert!(envelope.locked_by.is_none());
        assert!(storage.fetch_batch(1).await.unwrap().is_empty());
    }

    #[sqlx::test]
    async fn unknown_and_unclaimed_envelopes_cannot_be_acknowledged(pool: PgPool) {
        let storage = PgStorage::try_new(pool).await.unwrap();
        storage.insert_batch(envelopes(1..=1)).await.unwrap();

        let err = storage.mark_processed(id(42)).await.unwrap_err();
        assert!(matches!(err.kind(), PgStorageErrorKind::NotFound(_)));

        let err = storage.mark_processed(id(1)).await.unwrap_err();
        assert!(matches!(
            err.kind(),
            PgStorageErrorKind::IllegalTransition {
                from: EnvelopeState::Pending,
                to: EnvelopeState::Succeeded,
                ..
            }
        ));
    }

    #[sqlx::test]
    async fn failures_are_recorded_and_failed_is_terminal(pool: PgPool) {
        let storage = PgStorage::try_new(pool).await.unwrap().with_lease(Duration::ZERO);
        storage.insert_batch(envelopes(1..=1)).await.unwrap();
        let id = storage.fetch_batch(1).await.unwrap()[0].id;

        storage.record_failure(id, "timeout").await.unwrap();
        let envelope = storage.get(id).await.unwrap().unwrap();
        assert_eq!(envelope.state, EnvelopeState::InProgress);
        assert_eq!(envelope.error.as_deref(), Some("timeout"));

        storage.mark_failed(id, "gave up").await.unwrap();
        let envelope = storage.get(id).await.unwrap().unwrap();
        assert_eq!(envelope.state, EnvelopeState::Failed);
        assert_eq!(envelope.error.as_deref(), Some("gave up"));

        assert!(storage.fetch_batch(1).await.unwrap().is_empty());
        assert!(storage.mark_processed(id).await.is_err());
    }
}
