//! A fixed-size pool of [`Worker`]s sharing one registry and one backend.

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing_error::SpanTrace;

use crate::{
    config::{ConfigError, WorkerPoolSettings},
    provider::Providers,
    storage::{AcknowledgeEnvelopes, FetchEnvelopes},
    worker::{DefaultWorkerHook, Worker, WorkerError, WorkerHook},
};

/// Runs `count_of_workers` workers concurrently.
///
/// Every worker gets a clone of the storage backend, so `S` is usually a
/// cheap handle such as a connection pool.
pub struct WorkerPool<S, HK = DefaultWorkerHook> {
    providers: Arc<Providers>,
    storage: S,
    settings: WorkerPoolSettings,
    workers: Vec<Arc<Worker<S, HK>>>,
    stopping: AtomicBool,
    shutdown: CancellationToken,
}

impl<S> WorkerPool<S, DefaultWorkerHook>
where
    S: FetchEnvelopes + AcknowledgeEnvelopes + Clone + 'static,
{
    pub fn new(providers: Arc<Providers>, storage: S, settings: WorkerPoolSettings) -> Self {
        Self::build(providers, storage, settings, Arc::new(DefaultWorkerHook))
    }
}

impl<S, HK> WorkerPool<S, HK>
where
    S: FetchEnvelopes + AcknowledgeEnvelopes + Clone + 'static,
    HK: WorkerHook + 'static,
{
    fn build(
        providers: Arc<Providers>,
        storage: S,
        settings: WorkerPoolSettings,
        hook: Arc<HK>,
    ) -> Self {
        let workers = (0..settings.count_of_workers)
            .map(|id| {
                let worker = Worker::new(
                    id,
                    Arc::clone(&providers),
                    storage.clone(),
                    settings.worker.clone(),
                );
                Arc::new(worker.with_shared_hook(Arc::clone(&hook)))
            })
            .collect();

        Self {
            providers,
            storage,
            settings,
            workers,
            stopping: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
        }
    }

    /// Replace the hook shared by every worker of the pool.
    pub fn with_hook<HK2: WorkerHook + 'static>(self, hook: HK2) -> WorkerPool<S, HK2> {
        let pool = WorkerPool::build(self.providers, self.storage, self.settings, Arc::new(hook));
        if self.stopping.load(Ordering::Acquire) {
            pool.stop();
        }
        pool
    }

    pub fn settings(&self) -> &WorkerPoolSettings {
        &self.settings
    }

    pub fn workers(&self) -> &[Arc<Worker<S, HK>>] {
        &self.workers
    }

    /// Run every worker and wait for all of them to exit.
    ///
    /// The first worker that fails (or panics) cancels its siblings. The
    /// error of that first failure is returned once every worker has exited.
    #[tracing::instrument(skip_all, fields(count_of_workers = self.settings.count_of_workers))]
    pub async fn start_blocking(&self, cancel: CancellationToken) -> Result<(), WorkerPoolError> {
        self.settings.validate().map_err(WorkerPoolError::settings)?;

        let run = cancel.child_token();
        if self.stopping.load(Ordering::Acquire) {
            self.workers.iter().for_each(|worker| worker.stop());
        }

        let mut tasks = JoinSet::new();
        for worker in &self.workers {
            let worker = Arc::clone(worker);
            let run = run.clone();
            tasks.spawn(async move {
                let id = worker.id();
                (id, worker.start(run).await)
            });
        }
        tracing::info!("Worker pool started");

        let mut first_error = None;
        loop {
            let joined = tokio::select! {
                _ = self.shutdown.cancelled(), if !run.is_cancelled() => {
                    run.cancel();
                    continue;
                }
                joined = tasks.join_next() => joined,
            };
            let Some(joined) = joined else {
                break;
            };

            let failure = match joined {
                Ok((_, Ok(()))) => None,
                Ok((id, Err(err))) => Some(WorkerPoolError::worker(id, err)),
                Err(err) => Some(WorkerPoolError::join(err)),
            };
            if let Some(err) = failure {
                tracing::error!(error = %err, "Worker failed, cancelling the pool");
                run.cancel();
                first_error.get_or_insert(err);
            }
        }

        tracing::info!("Worker pool stopped");
        first_error.map_or(Ok(()), Err)
    }

    /// Gracefully stop every worker. Non-blocking.
    pub fn stop(&self) {
        self.stopping.store(true, Ordering::Release);
        self.workers.iter().for_each(|worker| worker.stop());
    }

    /// Cancel the running pool, abandoning in-flight dispatches.
    pub fn cancel(&self) {
        self.shutdown.cancel();
    }

    /// Whether every worker has left its loop.
    pub fn is_stopped(&self) -> bool {
        self.workers.iter().all(|worker| worker.is_stopped())
    }
}

/// Error returned when the pool cannot run or one of its workers failed.
#[derive(Debug)]
pub struct WorkerPoolError {
    context: SpanTrace,
    kind: WorkerPoolErrorKind,
}

/// Classification of pool errors.
#[derive(Debug)]
pub enum WorkerPoolErrorKind {
    InvalidSettings(ConfigError),
    Worker { id: usize, source: WorkerError },
    /// A worker task panicked or was aborted.
    Join(JoinError),
}

impl WorkerPoolError {
    fn settings(err: ConfigError) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: WorkerPoolErrorKind::InvalidSettings(err),
        }
    }

    fn worker(id: usize, source: WorkerError) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: WorkerPoolErrorKind::Worker { id, source },
        }
    }

    fn join(err: JoinError) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: WorkerPoolErrorKind::Join(err),
        }
    }

    pub fn kind(&self) -> &WorkerPoolErrorKind {
        &self.kind
    }
}

impl std::fmt::Display for WorkerPoolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            WorkerPoolErrorKind::InvalidSettings(err) => {
                writeln!(f, "Invalid pool settings: {err}")
            }
            WorkerPoolErrorKind::Worker { id, source } => {
                writeln!(f, "Worker {id} failed: {}", source.kind())
            }
            WorkerPoolErrorKind::Join(err) => writeln!(f, "Worker task failed: {err}"),
        }?;
        self.context.fmt(f)
    }
}

impl std::error::Error for WorkerPoolError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            WorkerPoolErrorKind::InvalidSettings(err) => Some(err),
            WorkerPoolErrorKind::Worker { source, .. } => Some(source),
            WorkerPoolErrorKind::Join(err) => Some(err),
        }
    }
}
