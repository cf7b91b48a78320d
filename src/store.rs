//! Outbox writer: buffering and batched persistence.
//!
//! The [`Store`] accepts messages from the application, wraps each one into a
//! `PENDING` [`Envelope`] and appends it to an in-memory buffer. The buffer is
//! persisted through an [`InsertEnvelopes`] backend when either:
//!
//! - it reaches `max_batch_size`, in which case the producing call pays for
//!   the insert (back-pressure), or
//! - the background flush timer driven by [`Store::run`] fires.
//!
//! A batch that cannot be persisted is never dropped: after the retry budget
//! is spent, the error hands the unpersisted envelopes back to the caller
//! (see [`StoreError::into_unflushed`]).
//!
//! Once the flush loop has returned, the store is closed: later dispatches
//! are inserted synchronously, as if the store were unbuffered.

use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing_error::SpanTrace;

use crate::{
    Envelope, EnvelopeId, Payload,
    config::{ConfigError, StoreSettings},
    storage::{InsertEnvelopes, StorageError},
};

/// Outbox writer.
///
/// Share it between producers and the flush loop through an `Arc`:
///
/// ```rust
/// use std::sync::Arc;
///
/// use pigeonhole::{InMemoryStorage, Store, StoreSettings};
/// use tokio_util::sync::CancellationToken;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> Result<(), pigeonhole::StoreError> {
/// let storage = InMemoryStorage::new();
/// let store = Arc::new(Store::new(storage.clone(), StoreSettings::default())?);
///
/// let cancel = CancellationToken::new();
/// let flusher = tokio::spawn({
///     let store = Arc::clone(&store);
///     let cancel = cancel.clone();
///     async move { store.run(cancel).await }
/// });
///
/// store.dispatch("email", &"welcome").await?;
///
/// cancel.cancel();
/// flusher.await.expect("flush loop panicked")?;
/// assert_eq!(storage.snapshot().await.len(), 1);
/// # Ok(())
/// # }
/// ```
pub struct Store<S, HK = DefaultStoreHook> {
    storage: S,
    hook: HK,
    settings: StoreSettings,
    buffer: Mutex<Vec<Envelope>>,
    closed: AtomicBool,
}

impl<S> Store<S, DefaultStoreHook>
where
    S: InsertEnvelopes,
{
    /// Create a new store with the default hook implementation.
    ///
    /// Fails if `settings` do not pass [`StoreSettings::validate`].
    pub fn new(storage: S, settings: StoreSettings) -> Result<Self, StoreError> {
        settings.validate().map_err(StoreError::invalid_settings)?;
        Ok(Self {
            buffer: Mutex::new(Vec::with_capacity(settings.max_batch_size)),
            closed: AtomicBool::new(false),
            storage,
            hook: DefaultStoreHook,
            settings,
        })
    }
}

impl<S, HK> Store<S, HK>
where
    S: InsertEnvelopes,
    HK: StoreHook,
{
    /// Replace the store hook.
    pub fn with_hook<HK2: StoreHook>(self, hook: HK2) -> Store<S, HK2> {
        Store {
            storage: self.storage,
            hook,
            settings: self.settings,
            buffer: self.buffer,
            closed: self.closed,
        }
    }

    pub fn settings(&self) -> &StoreSettings {
        &self.settings
    }

    /// Number of envelopes waiting in the buffer.
    pub fn buffered(&self) -> usize {
        self.buffer.lock().len()
    }

    /// Whether the flush loop has ended. A closed store persists every
    /// dispatch before returning.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Buffer one message, encoded as JSON.
    ///
    /// Returns once the message is buffered, or once it is persisted if this
    /// call filled the buffer up to `max_batch_size`.
    #[tracing::instrument(skip(self, message))]
    pub async fn dispatch<T>(&self, driver_name: &str, message: &T) -> Result<(), StoreError>
    where
        T: Serialize + ?Sized,
    {
        let payload = Payload::json(message).map_err(StoreError::serde)?;
        self.enqueue(driver_name, vec![payload]).await
    }

    /// Buffer several messages for the same driver name.
    ///
    /// The messages enter the buffer contiguously and in iteration order.
    #[tracing::instrument(skip(self, messages))]
    pub async fn dispatch_many<T, I>(&self, driver_name: &str, messages: I) -> Result<(), StoreError>
    where
        T: Serialize,
        I: IntoIterator<Item = T>,
    {
        let payloads = messages
            .into_iter()
            .map(|message| Payload::json(&message))
            .collect::<Result<Vec<_>, _>>()
            .map_err(StoreError::serde)?;
        self.enqueue(driver_name, payloads).await
    }

    /// Buffer an already encoded payload.
    #[tracing::instrument(skip(self, payload))]
    pub async fn dispatch_payload(
        &self,
        driver_name: &str,
        payload: Payload,
    ) -> Result<(), StoreError> {
        self.enqueue(driver_name, vec![payload]).await
    }

    /// Persist everything currently buffered.
    #[tracing::instrument(skip_all)]
    pub async fn flush(&self) -> Result<(), StoreError> {
        let batch = std::mem::take(&mut *self.buffer.lock());
        if batch.is_empty() {
            return Ok(());
        }
        self.persist(batch).await
    }

    /// Run the background flush loop.
    ///
    /// Every `flush_interval` the buffer is flushed if it holds anything. The
    /// loop ends:
    /// - with `Ok` after one final flush once `cancel` fires
    /// - with `Err` as soon as a flush fails for good, handing back whatever
    ///   was still buffered along with the failed batch
    ///
    /// Either way the store is closed when this returns. Calling `run` again
    /// reopens it.
    #[tracing::instrument(skip_all)]
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), StoreError> {
        self.closed.store(false, Ordering::Release);
        self.hook.on_startup();

        let mut ticker = tokio::time::interval(self.settings.flush_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // the first tick completes immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    let remainder = self.close();
                    let result = if remainder.is_empty() {
                        Ok(())
                    } else {
                        self.persist(remainder).await
                    };
                    self.hook.on_shutdown();
                    return result;
                }
                _ = ticker.tick() => {
                    if let Err(mut err) = self.flush().await {
                        err.unflushed.extend(self.close());
                        self.hook.on_shutdown();
                        return Err(err);
                    }
                }
            }
        }
    }

    /// Mark the store closed and take the buffer in one step, so no dispatch
    /// can slip into the buffer after the last flush.
    fn close(&self) -> Vec<Envelope> {
        let mut buffer = self.buffer.lock();
        self.closed.store(true, Ordering::Release);
        std::mem::take(&mut *buffer)
    }

    async fn enqueue(&self, driver_name: &str, payloads: Vec<Payload>) -> Result<(), StoreError> {
        if driver_name.is_empty() {
            return Err(StoreError::invalid_driver_name());
        }
        if payloads.is_empty() {
            return Ok(());
        }

        let envelopes: Vec<_> = payloads
            .into_iter()
            .map(|payload| Envelope::pending(EnvelopeId::new(), driver_name, payload))
            .collect();

        if !self.settings.buffered {
            return self.persist(envelopes).await;
        }

        let mut batches = {
            let mut buffer = self.buffer.lock();
            if self.closed.load(Ordering::Acquire) {
                // no flush loop left to pick the buffer up
                envelopes
                    .chunks(self.settings.max_batch_size)
                    .map(<[Envelope]>::to_vec)
                    .collect::<Vec<_>>()
            } else {
                buffer.extend(envelopes);

                let max = self.settings.max_batch_size;
                let mut full = Vec::new();
                while buffer.len() >= max {
                    full.push(buffer.drain(..max).collect::<Vec<_>>());
                }
                full
            }
        }
        .into_iter();

        while let Some(batch) = batches.next() {
            if let Err(mut err) = self.persist(batch).await {
                err.unflushed.extend(batches.by_ref().flatten());
                return Err(err);
            }
        }
        Ok(())
    }

    /// Persist one batch with hooks and retries.
    async fn persist(&self, batch: Vec<Envelope>) -> Result<(), StoreError> {
        if let Err(err) = self.hook.before_flush(&batch) {
            self.hook.on_flush_failed(&batch, err.as_ref());
            return Err(StoreError::hook(err, batch));
        }

        let attempts = self.settings.backoff.attempts();
        let mut attempt = 1;
        loop {
            match self.storage.insert_batch(batch.clone()).await {
                Ok(()) => break,
                Err(err) => {
                    let err = StorageError::backend(err);
                    if attempt >= attempts {
                        self.hook.on_flush_failed(&batch, &err);
                        return Err(StoreError::storage(err, attempt, batch));
                    }
                    self.hook.on_flush_retry(&batch, attempt, &err);
                    tokio::time::sleep(self.settings.backoff.delay).await;
                    attempt += 1;
                }
            }
        }

        self.hook.on_flushed(&batch);
        // the batch is durable at this point, so nothing is handed back
        self.hook
            .after_flush(&batch)
            .map_err(|err| StoreError::hook(err, Vec::new()))
    }
}

/// Error returned by the store.
#[derive(Debug)]
pub struct StoreError {
    context: SpanTrace,
    kind: StoreErrorKind,
    unflushed: Vec<Envelope>,
}

/// Classification of store errors.
#[derive(Debug)]
pub enum StoreErrorKind {
    /// The settings passed to [`Store::new`] are out of range.
    InvalidSettings(ConfigError),
    /// The driver name was empty.
    InvalidDriverName,
    /// A message could not be encoded.
    Serde(serde_json::Error),
    /// The backend rejected the batch on every attempt.
    Storage { attempts: u32, source: StorageError },
    /// A before- or after-flush hook failed.
    Hook(tower::BoxError),
}

impl StoreError {
    fn invalid_settings(err: ConfigError) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: StoreErrorKind::InvalidSettings(err),
            unflushed: Vec::new(),
        }
    }

    fn invalid_driver_name() -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: StoreErrorKind::InvalidDriverName,
            unflushed: Vec::new(),
        }
    }

    fn serde(err: serde_json::Error) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: StoreErrorKind::Serde(err),
            unflushed: Vec::new(),
        }
    }

    fn storage(source: StorageError, attempts: u32, batch: Vec<Envelope>) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: StoreErrorKind::Storage { attempts, source },
            unflushed: batch,
        }
    }

    fn hook(err: tower::BoxError, batch: Vec<Envelope>) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: StoreErrorKind::Hook(err),
            unflushed: batch,
        }
    }

    pub fn kind(&self) -> &StoreErrorKind {
        &self.kind
    }

    /// Envelopes that were taken out of the buffer but not persisted.
    pub fn unflushed(&self) -> &[Envelope] {
        &self.unflushed
    }

    /// Take ownership of the unpersisted envelopes, e.g. to hand them to
    /// another store.
    pub fn into_unflushed(self) -> Vec<Envelope> {
        self.unflushed
    }
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            StoreErrorKind::InvalidSettings(err) => write!(f, "Invalid store settings: {err}"),
            StoreErrorKind::InvalidDriverName => writeln!(f, "Driver name must not be empty"),
            StoreErrorKind::Serde(err) => writeln!(f, "Serde error: {err}"),
            StoreErrorKind::Storage { attempts, source } => writeln!(
                f,
                "Flush failed after {attempts} attempt(s), {} envelope(s) not persisted: {}",
                self.unflushed.len(),
                source.inner()
            ),
            StoreErrorKind::Hook(err) => writeln!(f, "Flush hook error: {err}"),
        }?;
        self.context.fmt(f)
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            StoreErrorKind::InvalidSettings(err) => Some(err),
            StoreErrorKind::InvalidDriverName => None,
            StoreErrorKind::Serde(err) => Some(err),
            StoreErrorKind::Storage { source, .. } => Some(source),
            StoreErrorKind::Hook(err) => Some(err.as_ref()),
        }
    }
}

/// Hook trait for observing and extending the store's flushes.
///
/// Hooks are invoked synchronously and should avoid heavy or blocking work.
/// `before_flush` and `after_flush` may veto a flush by returning an error,
/// which is reported like a storage failure.
pub trait StoreHook: Send + Sync {
    fn on_startup(&self);
    fn on_shutdown(&self);
    fn on_flushed(&self, batch: &[Envelope]);
    fn on_flush_retry(&self, batch: &[Envelope], attempt: u32, error: &dyn std::error::Error);
    fn on_flush_failed(&self, batch: &[Envelope], error: &dyn std::error::Error);

    /// Called with a batch right before it is persisted.
    fn before_flush(&self, _batch: &[Envelope]) -> Result<(), tower::BoxError> {
        Ok(())
    }

    /// Called with a batch right after it was persisted.
    fn after_flush(&self, _batch: &[Envelope]) -> Result<(), tower::BoxError> {
        Ok(())
    }
}

/// Default store hook implementation.
///
/// Logs lifecycle events using `tracing`.
pub struct DefaultStoreHook;

impl StoreHook for DefaultStoreHook {
    fn on_startup(&self) {
        tracing::info!("Store flush loop is starting up");
    }

    fn on_shutdown(&self) {
        tracing::info!("Store flush loop is shutting down");
    }

    fn on_flushed(&self, batch: &[Envelope]) {
        tracing::debug!(batch_size = batch.len(), "Batch persisted");
    }

    fn on_flush_retry(&self, batch: &[Envelope], attempt: u32, error: &dyn std::error::Error) {
        tracing::warn!(
            batch_size = batch.len(),
            attempt,
            error = %error,
            "Persisting batch failed, retrying"
        );
    }

    fn on_flush_failed(&self, batch: &[Envelope], error: &dyn std::error::Error) {
        tracing::error!(
            batch_size = batch.len(),
            error = %error,
            cause = ?error.source(),
            "Persisting batch failed"
        );
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::HashSet,
        sync::{
            Arc,
            atomic::{AtomicU32, Ordering},
        },
        time::Duration,
    };

    use async_trait::async_trait;

    use super::*;
    use crate::{EnvelopeState, config::BackoffSettings};

    /// Records successful inserts and fails the first `failures` attempts.
    #[derive(Clone, Default)]
    struct RecordingStorage {
        batches: Arc<Mutex<Vec<Vec<Envelope>>>>,
        attempts: Arc<AtomicU32>,
        failures: Arc<AtomicU32>,
    }

    impl RecordingStorage {
        fn failing(failures: u32) -> Self {
            let storage = Self::default();
            storage.failures.store(failures, Ordering::SeqCst);
            storage
        }

        fn batches(&self) -> Vec<Vec<Envelope>> {
            self.batches.lock().clone()
        }

        fn payloads(&self) -> Vec<Vec<String>> {
            self.batches()
                .iter()
                .map(|batch| batch.iter().map(|e| e.payload.decode().unwrap()).collect())
                .collect()
        }
    }

    #[async_trait]
    impl InsertEnvelopes for RecordingStorage {
        type Error = tower::BoxError;

        async fn insert_batch(&self, envelopes: Vec<Envelope>) -> Result<(), Self::Error> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            let remaining = self.failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures.store(remaining - 1, Ordering::SeqCst);
                return Err("database unavailable".into());
            }
            self.batches.lock().push(envelopes);
            Ok(())
        }
    }

    fn settings(batch: usize) -> StoreSettings {
        StoreSettings::default()
            .with_max_batch_size(batch)
            .with_flush_interval(Duration::from_secs(1))
    }

    fn message(i: usize) -> String {
        format!("m{i}")
    }

    #[tokio::test]
    async fn full_batches_are_flushed_by_the_producing_call() {
        let storage = RecordingStorage::default();
        let store = Store::new(storage.clone(), settings(3)).unwrap();

        for i in 0..9 {
            store.dispatch("x", &message(i)).await.unwrap();
        }

        assert_eq!(
            storage.payloads(),
            vec![
                vec!["m0", "m1", "m2"],
                vec!["m3", "m4", "m5"],
                vec!["m6", "m7", "m8"],
            ]
        );
        assert_eq!(store.buffered(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn remainder_waits_for_the_timer() {
        let storage = RecordingStorage::default();
        let store = Arc::new(Store::new(storage.clone(), settings(2)).unwrap());

        let cancel = CancellationToken::new();
        let flusher = tokio::spawn({
            let store = Arc::clone(&store);
            let cancel = cancel.clone();
            async move { store.run(cancel).await }
        });

        for i in 0..5 {
            store.dispatch("x", &message(i)).await.unwrap();
        }
        assert_eq!(storage.payloads(), vec![vec!["m0", "m1"], vec!["m2", "m3"]]);
        assert_eq!(store.buffered(), 1);

        tokio::time::sleep(Duration::from_millis(1_100)).await;
        assert_eq!(storage.batches().len(), 3);
        assert_eq!(storage.payloads()[2], vec!["m4"]);
        assert_eq!(store.buffered(), 0);

        cancel.cancel();
        flusher.await.unwrap().unwrap();
        assert_eq!(storage.batches().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn empty_buffer_never_reaches_storage() {
        let storage = RecordingStorage::default();
        let store = Arc::new(Store::new(storage.clone(), settings(2)).unwrap());

        let cancel = CancellationToken::new();
        let flusher = tokio::spawn({
            let store = Arc::clone(&store);
            let cancel = cancel.clone();
            async move { store.run(cancel).await }
        });

        tokio::time::sleep(Duration::from_secs(10)).await;
        cancel.cancel();
        flusher.await.unwrap().unwrap();

        assert_eq!(storage.attempts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_flushes_the_remainder_once() {
        let storage = RecordingStorage::default();
        let store = Arc::new(Store::new(
            storage.clone(),
            settings(10).with_flush_interval(Duration::from_secs(3600)),
        ).unwrap());

        let cancel = CancellationToken::new();
        let flusher = tokio::spawn({
            let store = Arc::clone(&store);
            let cancel = cancel.clone();
            async move { store.run(cancel).await }
        });

        store.dispatch("x", &message(0)).await.unwrap();
        store.dispatch("x", &message(1)).await.unwrap();
        cancel.cancel();
        flusher.await.unwrap().unwrap();

        assert_eq!(storage.payloads(), vec![vec!["m0", "m1"]]);
        assert_eq!(storage.attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_are_retried_without_duplicates() {
        let storage = RecordingStorage::failing(2);
        let store = Store::new(
            storage.clone(),
            settings(2).with_backoff(BackoffSettings::fixed(3, Duration::from_millis(50))),
        ).unwrap();

        store.dispatch("x", &message(0)).await.unwrap();
        store.dispatch("x", &message(1)).await.unwrap();

        assert_eq!(storage.attempts.load(Ordering::SeqCst), 3);
        assert_eq!(storage.payloads(), vec![vec!["m0", "m1"]]);
        let ids: HashSet<_> = storage.batches()[0].iter().map(|e| e.id).collect();
        assert_eq!(ids.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_hand_the_batch_back() {
        let storage = RecordingStorage::failing(u32::MAX);
        let store = Store::new(
            storage.clone(),
            settings(2).with_backoff(BackoffSettings::fixed(2, Duration::from_millis(50))),
        ).unwrap();

        store.dispatch("x", &message(0)).await.unwrap();
        let err = store.dispatch("x", &message(1)).await.unwrap_err();

        assert!(matches!(err.kind(), StoreErrorKind::Storage { attempts: 3, .. }));
        assert_eq!(storage.attempts.load(Ordering::SeqCst), 3);
        let unflushed: Vec<String> = err
            .into_unflushed()
            .iter()
            .map(|e| e.payload.decode().unwrap())
            .collect();
        assert_eq!(unflushed, vec!["m0", "m1"]);
        assert!(storage.batches().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn failing_timer_flush_stops_the_loop() {
        let storage = RecordingStorage::failing(u32::MAX);
        let store = Arc::new(Store::new(storage.clone(), settings(10)).unwrap());

        store.dispatch("x", &message(0)).await.unwrap();

        let err = store.run(CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err.kind(), StoreErrorKind::Storage { attempts: 1, .. }));
        assert_eq!(err.unflushed().len(), 1);
        assert_eq!(err.unflushed()[0].state, EnvelopeState::Pending);
        assert!(store.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn dispatch_after_the_loop_ended_is_persisted_right_away() {
        let storage = RecordingStorage::default();
        let store = Arc::new(Store::new(storage.clone(), settings(10)).unwrap());

        let cancel = CancellationToken::new();
        cancel.cancel();
        store.run(cancel).await.unwrap();
        assert!(store.is_closed());

        store.dispatch("x", &message(0)).await.unwrap();
        store.dispatch_many("x", (1..3).map(message)).await.unwrap();

        assert_eq!(storage.payloads(), vec![vec!["m0"], vec!["m1", "m2"]]);
        assert_eq!(store.buffered(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn closed_store_hands_back_a_failed_dispatch() {
        let storage = RecordingStorage::failing(u32::MAX);
        let store = Store::new(storage.clone(), settings(10)).unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();
        store.run(cancel).await.unwrap();

        let err = store.dispatch("x", &message(0)).await.unwrap_err();
        assert_eq!(err.unflushed().len(), 1);
        assert_eq!(store.buffered(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn rerunning_reopens_the_buffer() {
        let storage = RecordingStorage::default();
        let store = Arc::new(Store::new(storage.clone(), settings(10)).unwrap());

        let cancel = CancellationToken::new();
        cancel.cancel();
        store.run(cancel).await.unwrap();

        let cancel = CancellationToken::new();
        let flusher = tokio::spawn({
            let store = Arc::clone(&store);
            let cancel = cancel.clone();
            async move { store.run(cancel).await }
        });
        tokio::task::yield_now().await;
        assert!(!store.is_closed());

        store.dispatch("x", &message(0)).await.unwrap();
        assert_eq!(store.buffered(), 1);

        cancel.cancel();
        flusher.await.unwrap().unwrap();
        assert_eq!(storage.payloads(), vec![vec!["m0"]]);
    }

    #[test]
    fn out_of_range_settings_are_rejected() {
        let zero_batch = Store::new(RecordingStorage::default(), settings(0));
        assert!(matches!(
            zero_batch.err().map(|err| err.kind),
            Some(StoreErrorKind::InvalidSettings(_))
        ));

        let zero_interval = Store::new(
            RecordingStorage::default(),
            settings(10).with_flush_interval(Duration::ZERO),
        );
        assert!(matches!(
            zero_interval.err().map(|err| err.kind),
            Some(StoreErrorKind::InvalidSettings(_))
        ));
    }

    #[tokio::test]
    async fn dispatch_many_keeps_call_order_and_chunks() {
        let storage = RecordingStorage::default();
        let store = Store::new(storage.clone(), settings(3)).unwrap();

        store
            .dispatch_many("x", (0..7).map(message))
            .await
            .unwrap();

        assert_eq!(
            storage.payloads(),
            vec![vec!["m0", "m1", "m2"], vec!["m3", "m4", "m5"]]
        );
        assert_eq!(store.buffered(), 1);

        store.flush().await.unwrap();
        assert_eq!(storage.payloads()[2], vec!["m6"]);

        let ids: Vec<_> = storage.batches().concat().iter().map(|e| e.id).collect();
        assert!(ids.windows(2).all(|w| w[0] < w[1]));
    }

    #[tokio::test]
    async fn failed_chunk_hands_back_every_drained_envelope() {
        let storage = RecordingStorage::failing(1);
        let store = Store::new(storage.clone(), settings(2)).unwrap();

        let err = store
            .dispatch_many("x", (0..5).map(message))
            .await
            .unwrap_err();

        assert_eq!(err.unflushed().len(), 4);
        assert_eq!(store.buffered(), 1);
        assert!(storage.batches().is_empty());
    }

    #[tokio::test]
    async fn envelopes_start_pending_with_driver_name() {
        let storage = RecordingStorage::default();
        let store = Store::new(storage.clone(), settings(1)).unwrap();

        store.dispatch("email", &serde_json::json!({"to": "a@b.c"})).await.unwrap();

        let envelope = &storage.batches()[0][0];
        assert_eq!(envelope.driver_name, "email");
        assert_eq!(envelope.state, EnvelopeState::Pending);
        assert_eq!(envelope.number_of_attempts, 0);
        assert!(envelope.locked_by.is_none());
    }

    #[tokio::test]
    async fn empty_driver_name_is_rejected() {
        let storage = RecordingStorage::default();
        let store = Store::new(storage.clone(), settings(1)).unwrap();

        let err = store.dispatch("", &message(0)).await.unwrap_err();
        assert!(matches!(err.kind(), StoreErrorKind::InvalidDriverName));
        assert_eq!(store.buffered(), 0);
    }

    #[tokio::test]
    async fn unbuffered_store_inserts_synchronously() {
        let storage = RecordingStorage::default();
        let store = Store::new(storage.clone(), settings(100).unbuffered()).unwrap();

        store.dispatch("x", &message(0)).await.unwrap();
        assert_eq!(storage.payloads(), vec![vec!["m0"]]);
        assert_eq!(store.buffered(), 0);
    }

    struct VetoHook;

    impl StoreHook for VetoHook {
        fn on_startup(&self) {}
        fn on_shutdown(&self) {}
        fn on_flushed(&self, _batch: &[Envelope]) {}
        fn on_flush_retry(&self, _: &[Envelope], _: u32, _: &dyn std::error::Error) {}
        fn on_flush_failed(&self, _: &[Envelope], _: &dyn std::error::Error) {}

        fn before_flush(&self, batch: &[Envelope]) -> Result<(), tower::BoxError> {
            if batch.iter().any(|e| e.driver_name == "forbidden") {
                return Err("forbidden driver".into());
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn before_flush_hook_failure_is_a_flush_failure() {
        let storage = RecordingStorage::default();
        let store = Store::new(storage.clone(), settings(1)).unwrap().with_hook(VetoHook);

        store.dispatch("allowed", &message(0)).await.unwrap();
        let err = store.dispatch("forbidden", &message(1)).await.unwrap_err();

        assert!(matches!(err.kind(), StoreErrorKind::Hook(_)));
        assert_eq!(err.unflushed().len(), 1);
        assert_eq!(storage.batches().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_producers_lose_nothing() {
        let storage = RecordingStorage::default();
        let store = Arc::new(Store::new(storage.clone(), settings(10)).unwrap());

        let mut handles = Vec::new();
        for producer in 0..8 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                for i in 0..25 {
                    store
                        .dispatch("x", &message(producer * 100 + i))
                        .await
                        .unwrap();
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        store.flush().await.unwrap();

        let batches = storage.batches();
        assert!(batches.iter().all(|batch| batch.len() <= 10));
        let ids: HashSet<_> = batches.concat().iter().map(|e| e.id).collect();
        assert_eq!(ids.len(), 200);
    }
}
