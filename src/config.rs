//! Runtime settings for the store and the worker pool.
//!
//! Settings are plain values with defaults and `with_*` builders. They can
//! also be loaded from a TOML file merged with `PIGEONHOLE_`-prefixed
//! environment variables through [`OutboxConfig`]:
//!
//! ```toml
//! [store]
//! max_batch_size = 100
//! flush_interval_ms = 5000
//!
//! [store.backoff]
//! enabled = true
//! max_retries = 3
//! delay_ms = 200
//!
//! [workers]
//! count = 4
//! batch_size = 100
//! timeout_per_message_ms = 5000
//! delay_when_no_messages_ms = 1000
//! ```
//!
//! Nested keys are separated by a double underscore in the environment, e.g.
//! `PIGEONHOLE_WORKERS__COUNT=8`.

use std::{path::Path, time::Duration};

use figment::{
    Figment,
    providers::{Env, Format, Toml},
};
use serde::Deserialize;
use tracing_error::SpanTrace;

/// Settings of the outbox writer.
#[derive(Debug, Clone, PartialEq)]
pub struct StoreSettings {
    /// When false every dispatch is inserted synchronously.
    pub buffered: bool,
    /// Buffer length that triggers a flush from the producing call.
    pub max_batch_size: usize,
    /// Period of the background flush timer.
    pub flush_interval: Duration,
    pub backoff: BackoffSettings,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            buffered: true,
            max_batch_size: 100,
            flush_interval: Duration::from_secs(5),
            backoff: BackoffSettings::default(),
        }
    }
}

impl StoreSettings {
    pub fn with_max_batch_size(mut self, size: usize) -> Self {
        self.max_batch_size = size;
        self
    }

    pub fn with_flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = interval;
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffSettings) -> Self {
        self.backoff = backoff;
        self
    }

    /// Insert every dispatched message immediately instead of buffering it.
    pub fn unbuffered(mut self) -> Self {
        self.buffered = false;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_batch_size == 0 {
            return Err(ConfigError::invalid("store.max_batch_size must be positive"));
        }
        if self.flush_interval.is_zero() {
            return Err(ConfigError::invalid("store.flush_interval must be positive"));
        }
        Ok(())
    }
}

/// Retry policy applied when persisting a batch fails.
///
/// A flush makes `1 + max_retries` attempts with a fixed `delay` in between.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffSettings {
    pub enabled: bool,
    pub max_retries: u32,
    pub delay: Duration,
}

impl Default for BackoffSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            max_retries: 3,
            delay: Duration::from_millis(500),
        }
    }
}

impl BackoffSettings {
    /// Enabled policy with the given retry budget and delay.
    pub fn fixed(max_retries: u32, delay: Duration) -> Self {
        Self {
            enabled: true,
            max_retries,
            delay,
        }
    }

    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    /// Total number of insert attempts per flush.
    pub fn attempts(&self) -> u32 {
        if self.enabled {
            self.max_retries.saturating_add(1)
        } else {
            1
        }
    }
}

/// Settings of a single worker.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerSettings {
    /// Maximum number of envelopes claimed per fetch.
    pub batch_size: usize,
    pub timeout_per_message: Duration,
    /// Wait between polls when a fetch fails or returns nothing.
    pub delay_when_no_messages: Duration,
    /// Finish the in-flight batch on graceful stop instead of stopping at the
    /// next envelope.
    pub drain_on_stop: bool,
    /// Attempts after which an envelope is moved to `FAILED`. `None` keeps
    /// retrying forever.
    pub max_attempts: Option<u32>,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            batch_size: 100,
            timeout_per_message: Duration::from_secs(5),
            delay_when_no_messages: Duration::from_secs(1),
            drain_on_stop: true,
            max_attempts: None,
        }
    }
}

impl WorkerSettings {
    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size;
        self
    }

    pub fn with_timeout_per_message(mut self, timeout: Duration) -> Self {
        self.timeout_per_message = timeout;
        self
    }

    pub fn with_delay_when_no_messages(mut self, delay: Duration) -> Self {
        self.delay_when_no_messages = delay;
        self
    }

    pub fn with_drain_on_stop(mut self, drain: bool) -> Self {
        self.drain_on_stop = drain;
        self
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts);
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.batch_size == 0 {
            return Err(ConfigError::invalid("workers.batch_size must be positive"));
        }
        if self.timeout_per_message.is_zero() {
            return Err(ConfigError::invalid(
                "workers.timeout_per_message must be positive",
            ));
        }
        if self.max_attempts == Some(0) {
            return Err(ConfigError::invalid("workers.max_attempts must be positive"));
        }
        Ok(())
    }
}

/// Settings of a worker pool.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerPoolSettings {
    pub count_of_workers: usize,
    pub worker: WorkerSettings,
}

impl Default for WorkerPoolSettings {
    fn default() -> Self {
        Self {
            count_of_workers: 4,
            worker: WorkerSettings::default(),
        }
    }
}

impl WorkerPoolSettings {
    pub fn with_count_of_workers(mut self, count: usize) -> Self {
        self.count_of_workers = count;
        self
    }

    pub fn with_worker(mut self, worker: WorkerSettings) -> Self {
        self.worker = worker;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.count_of_workers == 0 {
            return Err(ConfigError::invalid("workers.count must be positive"));
        }
        self.worker.validate()
    }
}

/// File and environment representation of the outbox settings.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct OutboxConfig {
    pub store: StoreConfig,
    pub workers: WorkersConfig,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct StoreConfig {
    pub buffered: bool,
    pub max_batch_size: usize,
    pub flush_interval_ms: u64,
    pub backoff: BackoffConfig,
}

impl Default for StoreConfig {
    fn default() -> Self {
        let settings = StoreSettings::default();
        Self {
            buffered: settings.buffered,
            max_batch_size: settings.max_batch_size,
            flush_interval_ms: millis(settings.flush_interval),
            backoff: BackoffConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct BackoffConfig {
    pub enabled: bool,
    pub max_retries: u32,
    pub delay_ms: u64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        let settings = BackoffSettings::default();
        Self {
            enabled: settings.enabled,
            max_retries: settings.max_retries,
            delay_ms: millis(settings.delay),
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct WorkersConfig {
    pub count: usize,
    pub batch_size: usize,
    pub timeout_per_message_ms: u64,
    pub delay_when_no_messages_ms: u64,
    pub drain_on_stop: bool,
    pub max_attempts: Option<u32>,
}

impl Default for WorkersConfig {
    fn default() -> Self {
        let pool = WorkerPoolSettings::default();
        Self {
            count: pool.count_of_workers,
            batch_size: pool.worker.batch_size,
            timeout_per_message_ms: millis(pool.worker.timeout_per_message),
            delay_when_no_messages_ms: millis(pool.worker.delay_when_no_messages),
            drain_on_stop: pool.worker.drain_on_stop,
            max_attempts: pool.worker.max_attempts,
        }
    }
}

impl OutboxConfig {
    /// Figment reading `path` and `PIGEONHOLE_*` environment variables, the
    /// latter taking precedence.
    pub fn figment(path: impl AsRef<Path>) -> Figment {
        Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("PIGEONHOLE_").split("__"))
    }

    /// Load the configuration from `path` and the environment.
    ///
    /// A missing file is not an error; defaults and environment variables
    /// still apply.
    #[tracing::instrument(skip_all, fields(path = %path.as_ref().display()))]
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let config: Self = Self::figment(path).extract().map_err(ConfigError::load)?;
        config.store_settings()?;
        config.pool_settings()?;
        Ok(config)
    }

    /// Validated store settings.
    pub fn store_settings(&self) -> Result<StoreSettings, ConfigError> {
        let store = &self.store;
        let settings = StoreSettings {
            buffered: store.buffered,
            max_batch_size: store.max_batch_size,
            flush_interval: Duration::from_millis(store.flush_interval_ms),
            backoff: BackoffSettings {
                enabled: store.backoff.enabled,
                max_retries: store.backoff.max_retries,
                delay: Duration::from_millis(store.backoff.delay_ms),
            },
        };
        settings.validate()?;
        Ok(settings)
    }

    /// Validated worker pool settings.
    pub fn pool_settings(&self) -> Result<WorkerPoolSettings, ConfigError> {
        let workers = &self.workers;
        let settings = WorkerPoolSettings {
            count_of_workers: workers.count,
            worker: WorkerSettings {
                batch_size: workers.batch_size,
                timeout_per_message: Duration::from_millis(workers.timeout_per_message_ms),
                delay_when_no_messages: Duration::from_millis(workers.delay_when_no_messages_ms),
                drain_on_stop: workers.drain_on_stop,
                max_attempts: workers.max_attempts,
            },
        };
        settings.validate()?;
        Ok(settings)
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Error returned when configuration cannot be loaded or is invalid.
#[derive(Debug)]
pub struct ConfigError {
    context: SpanTrace,
    kind: ConfigErrorKind,
}

#[derive(Debug)]
pub enum ConfigErrorKind {
    /// The file or environment could not be read or deserialized.
    Load(Box<figment::Error>),
    /// A value is out of range.
    Invalid(&'static str),
}

impl ConfigError {
    fn load(err: figment::Error) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: ConfigErrorKind::Load(Box::new(err)),
        }
    }

    pub(crate) fn invalid(reason: &'static str) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: ConfigErrorKind::Invalid(reason),
        }
    }

    pub fn kind(&self) -> &ConfigErrorKind {
        &self.kind
    }
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            ConfigErrorKind::Load(err) => writeln!(f, "Failed to load config: {err}"),
            ConfigErrorKind::Invalid(reason) => writeln!(f, "Invalid config: {reason}"),
        }?;
        self.context.fmt(f)
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            ConfigErrorKind::Load(err) => Some(err.as_ref()),
            ConfigErrorKind::Invalid(_) => None,
        }
    }
}
