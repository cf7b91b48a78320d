//! Polling worker: claims envelopes and dispatches them to providers.
//!
//! A [`Worker`] repeatedly:
//!
//! - claims up to `batch_size` envelopes from a [`FetchEnvelopes`] backend
//! - hands each one, in order, to the provider registered for its driver name,
//!   bounded by `timeout_per_message`
//! - acknowledges successes and records failures through an
//!   [`AcknowledgeEnvelopes`] backend
//! - sleeps for `delay_when_no_messages` when a fetch fails or comes back empty
//!
//! Failures never stop the loop. Only cancellation of the run token or a
//! graceful stop ([`Worker::stop`]) does.
//!
//! When the backend reports a [claim lease](FetchEnvelopes::claim_lease), an
//! envelope is only dispatched if its claim outlives a dispatch that runs up
//! to `timeout_per_message`. Otherwise it is skipped and left for whichever
//! worker claims it next, so two workers never dispatch it at the same time.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing_error::SpanTrace;

use crate::{
    Envelope, EnvelopeId,
    config::{ConfigError, WorkerSettings},
    provider::{DispatchError, Providers},
    storage::{AcknowledgeEnvelopes, FetchEnvelopes},
};

/// Outbox worker.
///
/// Generic parameters:
/// - `S`: Storage backend used to claim and acknowledge envelopes
/// - `HK`: Hook implementation for lifecycle events
pub struct Worker<S, HK = DefaultWorkerHook> {
    id: usize,
    providers: Arc<Providers>,
    storage: S,
    hook: Arc<HK>,
    settings: WorkerSettings,
    in_flight: Mutex<Vec<EnvelopeId>>,
    graceful_stop: AtomicBool,
    wake: Notify,
    running: AtomicBool,
    stopped: AtomicBool,
}

impl<S> Worker<S, DefaultWorkerHook>
where
    S: FetchEnvelopes + AcknowledgeEnvelopes,
{
    /// Create a new worker with the default hook implementation.
    pub fn new(id: usize, providers: Arc<Providers>, storage: S, settings: WorkerSettings) -> Self {
        Self {
            id,
            providers,
            storage,
            hook: Arc::new(DefaultWorkerHook),
            settings,
            in_flight: Mutex::new(Vec::new()),
            graceful_stop: AtomicBool::new(false),
            wake: Notify::new(),
            running: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
        }
    }
}

impl<S, HK> Worker<S, HK>
where
    S: FetchEnvelopes + AcknowledgeEnvelopes,
    HK: WorkerHook,
{
    /// Replace the worker hook.
    pub fn with_hook<HK2: WorkerHook>(self, hook: HK2) -> Worker<S, HK2> {
        self.with_shared_hook(Arc::new(hook))
    }

    pub(crate) fn with_shared_hook<HK2: WorkerHook>(self, hook: Arc<HK2>) -> Worker<S, HK2> {
        Worker {
            id: self.id,
            providers: self.providers,
            storage: self.storage,
            hook,
            settings: self.settings,
            in_flight: self.in_flight,
            graceful_stop: self.graceful_stop,
            wake: self.wake,
            running: self.running,
            stopped: self.stopped,
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn settings(&self) -> &WorkerSettings {
        &self.settings
    }

    /// Ids of the envelopes claimed by the current batch and not yet handled.
    pub fn in_flight(&self) -> Vec<EnvelopeId> {
        self.in_flight.lock().clone()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Whether the worker has left its loop.
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Request a graceful stop.
    ///
    /// The worker stops fetching, finishes the in-flight batch (or, with
    /// `drain_on_stop` disabled, the envelope currently being dispatched) and
    /// then returns from [`Worker::start`]. A stopped worker stays stopped.
    pub fn stop(&self) {
        if !self.graceful_stop.swap(true, Ordering::AcqRel) {
            self.hook.on_stop_requested(self.id);
        }
        self.wake.notify_one();
    }

    /// Run the polling loop until `cancel` fires or a graceful stop completes.
    ///
    /// Cancelling abandons the in-flight dispatch immediately. Abandoned
    /// envelopes keep their claim and are offered again once it goes stale.
    ///
    /// Fails without polling if the settings are invalid, or if the backend's
    /// claim lease is not longer than `timeout_per_message`.
    #[tracing::instrument(skip_all, fields(worker_id = self.id))]
    pub async fn start(&self, cancel: CancellationToken) -> Result<(), WorkerError> {
        self.settings.validate().map_err(WorkerError::settings)?;
        if self
            .storage
            .claim_lease()
            .is_some_and(|lease| lease <= self.settings.timeout_per_message)
        {
            return Err(WorkerError::settings(ConfigError::invalid(
                "claim lease must be longer than workers.timeout_per_message",
            )));
        }
        if self.running.swap(true, Ordering::AcqRel) {
            return Err(WorkerError::already_running(self.id));
        }

        let reason = {
            // resets the run flags even if a provider panics
            let _run = RunGuard {
                in_flight: &self.in_flight,
                running: &self.running,
                stopped: &self.stopped,
            };
            self.hook.on_startup(self.id);
            self.poll(&cancel).await
        };
        self.hook.on_shutdown(self.id, reason);
        Ok(())
    }

    async fn poll(&self, cancel: &CancellationToken) -> StopReason {
        loop {
            if self.graceful_stop.load(Ordering::Acquire) && self.in_flight.lock().is_empty() {
                return StopReason::Graceful;
            }
            if cancel.is_cancelled() {
                return StopReason::Cancelled;
            }

            let fetched = tokio::select! {
                biased;
                _ = cancel.cancelled() => return StopReason::Cancelled,
                fetched = self.storage.fetch_batch(self.settings.batch_size) => fetched,
            };

            let batch = match fetched {
                Ok(batch) if batch.is_empty() => {
                    self.hook.on_idle(self.id);
                    if !self.idle(cancel).await {
                        return StopReason::Cancelled;
                    }
                    continue;
                }
                Ok(batch) => batch,
                Err(err) => {
                    let err: tower::BoxError = err.into();
                    self.hook.on_fetch_error(self.id, err.as_ref());
                    if !self.idle(cancel).await {
                        return StopReason::Cancelled;
                    }
                    continue;
                }
            };

            self.hook.on_batch_fetched(self.id, &batch);
            if !self.process_batch(batch, cancel).await {
                return StopReason::Cancelled;
            }
        }
    }

    /// Returns `false` when the batch was abandoned because `cancel` fired.
    async fn process_batch(&self, batch: Vec<Envelope>, cancel: &CancellationToken) -> bool {
        {
            let mut in_flight = self.in_flight.lock();
            in_flight.clear();
            in_flight.extend(batch.iter().map(|envelope| envelope.id));
        }

        let lease = self.storage.claim_lease();
        for envelope in batch {
            if cancel.is_cancelled() {
                return false;
            }
            if self.graceful_stop.load(Ordering::Acquire) && !self.settings.drain_on_stop {
                // the rest of the batch keeps its claim until it goes stale
                let released = std::mem::take(&mut *self.in_flight.lock());
                self.hook.on_batch_released(self.id, &released);
                return true;
            }
            if lease.is_some_and(|lease| !self.claim_covers_dispatch(&envelope, lease)) {
                self.hook.on_claim_expiring(self.id, &envelope);
                self.in_flight.lock().retain(|id| *id != envelope.id);
                continue;
            }

            let finished = self.process(&envelope, cancel).await;
            self.in_flight.lock().retain(|id| *id != envelope.id);
            if !finished {
                return false;
            }
        }
        true
    }

    /// Whether the claim on `envelope` is still held when a dispatch started
    /// now runs into `timeout_per_message`.
    fn claim_covers_dispatch(&self, envelope: &Envelope, lease: Duration) -> bool {
        let Some(locked_at) = envelope.locked_at else {
            return true;
        };
        let held = Utc::now()
            .signed_duration_since(locked_at)
            .to_std()
            .unwrap_or_default();
        held.saturating_add(self.settings.timeout_per_message) < lease
    }

    /// Dispatch one envelope and record the outcome.
    ///
    /// Returns `false` when the dispatch was abandoned because `cancel` fired.
    async fn process(&self, envelope: &Envelope, cancel: &CancellationToken) -> bool {
        let timeout = self.settings.timeout_per_message;
        let dispatched = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                self.hook.on_dispatch_abandoned(self.id, envelope);
                return false;
            }
            dispatched = tokio::time::timeout(timeout, self.providers.dispatch(envelope)) => {
                dispatched.unwrap_or_else(|_| Err(DispatchError::timeout(timeout)))
            }
        };

        match dispatched {
            Ok(()) => {
                self.hook.on_dispatched(self.id, envelope);
                if let Err(err) = self.storage.mark_processed(envelope.id).await {
                    let err: tower::BoxError = err.into();
                    self.hook.on_acknowledge_error(self.id, envelope, err.as_ref());
                }
            }
            Err(err) => {
                self.hook.on_dispatch_error(self.id, envelope, &err);
                self.record_failure(envelope, &err).await;
            }
        }
        true
    }

    async fn record_failure(&self, envelope: &Envelope, err: &DispatchError) {
        let reason = err.kind().to_string();
        let exhausted = self
            .settings
            .max_attempts
            .is_some_and(|max| envelope.number_of_attempts >= max);

        let recorded = if exhausted {
            self.storage.mark_failed(envelope.id, &reason).await
        } else {
            self.storage.record_failure(envelope.id, &reason).await
        };

        match recorded {
            Ok(()) if exhausted => self.hook.on_dead_lettered(self.id, envelope),
            Ok(()) => {}
            Err(err) => {
                let err: tower::BoxError = err.into();
                self.hook.on_acknowledge_error(self.id, envelope, err.as_ref());
            }
        }
    }

    /// Wait before the next poll. Returns `false` when `cancel` fired.
    async fn idle(&self, cancel: &CancellationToken) -> bool {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => false,
            _ = self.wake.notified() => true,
            _ = tokio::time::sleep(self.settings.delay_when_no_messages) => true,
        }
    }
}

/// Clears the in-flight list and flips the worker to stopped when `start`
/// leaves its loop, including by unwinding.
struct RunGuard<'a> {
    in_flight: &'a Mutex<Vec<EnvelopeId>>,
    running: &'a AtomicBool,
    stopped: &'a AtomicBool,
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.in_flight.lock().clear();
        self.stopped.store(true, Ordering::Release);
        self.running.store(false, Ordering::Release);
    }
}

/// Why a worker left its loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// A graceful stop was requested and the in-flight work is done.
    Graceful,
    /// The run token was cancelled.
    Cancelled,
}

/// Error returned when a worker cannot run.
#[derive(Debug)]
pub struct WorkerError {
    context: SpanTrace,
    kind: WorkerErrorKind,
}

/// Classification of worker errors.
#[derive(Debug)]
pub enum WorkerErrorKind {
    /// `start` was called while the worker was already running.
    AlreadyRunning(usize),
    /// The worker settings are unusable.
    InvalidSettings(ConfigError),
}

impl WorkerError {
    fn already_running(id: usize) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: WorkerErrorKind::AlreadyRunning(id),
        }
    }

    fn settings(err: ConfigError) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: WorkerErrorKind::InvalidSettings(err),
        }
    }

    pub fn kind(&self) -> &WorkerErrorKind {
        &self.kind
    }
}

impl std::fmt::Display for WorkerErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkerErrorKind::AlreadyRunning(id) => write!(f, "Worker {id} is already running"),
            WorkerErrorKind::InvalidSettings(err) => write!(f, "Invalid worker settings: {err}"),
        }
    }
}

impl std::fmt::Display for WorkerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "{}", self.kind)?;
        self.context.fmt(f)
    }
}

impl std::error::Error for WorkerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            WorkerErrorKind::AlreadyRunning(_) => None,
            WorkerErrorKind::InvalidSettings(err) => Some(err),
        }
    }
}

/// Hook trait for observing worker lifecycle events.
///
/// Hooks are invoked synchronously and should avoid heavy or blocking work.
/// One hook instance is shared by every worker of a pool, so each callback
/// receives the id of the calling worker.
pub trait WorkerHook: Send + Sync {
    fn on_startup(&self, worker_id: usize);
    fn on_shutdown(&self, worker_id: usize, reason: StopReason);
    fn on_stop_requested(&self, worker_id: usize);
    fn on_idle(&self, worker_id: usize);
    fn on_fetch_error(&self, worker_id: usize, error: &dyn std::error::Error);
    fn on_batch_fetched(&self, worker_id: usize, batch: &[Envelope]);
    fn on_batch_released(&self, worker_id: usize, ids: &[EnvelopeId]);
    /// An envelope was skipped because its claim could lapse mid-dispatch.
    fn on_claim_expiring(&self, worker_id: usize, envelope: &Envelope);
    fn on_dispatched(&self, worker_id: usize, envelope: &Envelope);
    fn on_dispatch_error(&self, worker_id: usize, envelope: &Envelope, error: &DispatchError);
    fn on_dispatch_abandoned(&self, worker_id: usize, envelope: &Envelope);
    fn on_acknowledge_error(
        &self,
        worker_id: usize,
        envelope: &Envelope,
        error: &dyn std::error::Error,
    );
    fn on_dead_lettered(&self, worker_id: usize, envelope: &Envelope);
}

/// Default worker hook implementation.
///
/// Logs lifecycle events using `tracing`.
pub struct DefaultWorkerHook;

impl WorkerHook for DefaultWorkerHook {
    fn on_startup(&self, worker_id: usize) {
        tracing::info!(worker_id, "Worker is starting up");
    }

    fn on_shutdown(&self, worker_id: usize, reason: StopReason) {
        tracing::info!(worker_id, ?reason, "Worker is shutting down");
    }

    fn on_stop_requested(&self, worker_id: usize) {
        tracing::info!(worker_id, "Graceful stop requested");
    }

    fn on_idle(&self, worker_id: usize) {
        tracing::trace!(worker_id, "No envelopes to dispatch");
    }

    fn on_fetch_error(&self, worker_id: usize, error: &dyn std::error::Error) {
        tracing::error!(worker_id, %error, "Error fetching envelopes");
    }

    fn on_batch_fetched(&self, worker_id: usize, batch: &[Envelope]) {
        tracing::debug!(worker_id, batch_size = batch.len(), "Batch claimed");
    }

    fn on_batch_released(&self, worker_id: usize, ids: &[EnvelopeId]) {
        tracing::info!(
            worker_id,
            released = ids.len(),
            "Stopping before the end of the batch"
        );
    }

    fn on_claim_expiring(&self, worker_id: usize, envelope: &Envelope) {
        tracing::warn!(
            worker_id,
            envelope_id = %envelope.id,
            locked_at = ?envelope.locked_at,
            "Claim too close to expiry, leaving envelope for the next claim"
        );
    }

    fn on_dispatched(&self, worker_id: usize, envelope: &Envelope) {
        tracing::debug!(
            worker_id,
            envelope_id = %envelope.id,
            driver_name = %envelope.driver_name,
            "Envelope dispatched"
        );
    }

    fn on_dispatch_error(&self, worker_id: usize, envelope: &Envelope, error: &DispatchError) {
        tracing::warn!(
            worker_id,
            envelope_id = %envelope.id,
            driver_name = %envelope.driver_name,
            attempt = envelope.number_of_attempts,
            timed_out = error.is_timeout(),
            error = %error.kind(),
            "Error dispatching envelope"
        );
    }

    fn on_dispatch_abandoned(&self, worker_id: usize, envelope: &Envelope) {
        tracing::info!(worker_id, envelope_id = %envelope.id, "Dispatch abandoned");
    }

    fn on_acknowledge_error(
        &self,
        worker_id: usize,
        envelope: &Envelope,
        error: &dyn std::error::Error,
    ) {
        tracing::error!(
            worker_id,
            envelope_id = %envelope.id,
            %error,
            "Failed to record dispatch outcome"
        );
    }

    fn on_dead_lettered(&self, worker_id: usize, envelope: &Envelope) {
        tracing::error!(
            worker_id,
            envelope_id = %envelope.id,
            driver_name = %envelope.driver_name,
            attempts = envelope.number_of_attempts,
            "Envelope moved to FAILED"
        );
    }
}
