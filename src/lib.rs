#![doc = include_str!("../README.md")]

pub mod config;
pub mod envelope;
pub mod pool;
pub mod provider;
pub mod storage;
pub mod store;
pub mod worker;

#[doc(inline)]
pub use envelope::{Envelope, EnvelopeId, EnvelopeState, Payload};

#[doc(inline)]
pub use config::{
    BackoffSettings, ConfigError, OutboxConfig, StoreSettings, WorkerPoolSettings, WorkerSettings,
};

#[doc(inline)]
pub use storage::{
    AcknowledgeEnvelopes, FetchEnvelopes, InsertEnvelopes, StorageError,
    inmemory::InMemoryStorage,
};

#[doc(inline)]
pub use provider::{DispatchError, DispatchErrorKind, Provider, Providers, ServiceProvider};

#[doc(inline)]
pub use store::{DefaultStoreHook, Store, StoreError, StoreErrorKind, StoreHook};

#[doc(inline)]
pub use worker::{DefaultWorkerHook, StopReason, Worker, WorkerError, WorkerErrorKind, WorkerHook};

#[doc(inline)]
pub use pool::{WorkerPool, WorkerPoolError, WorkerPoolErrorKind};

/// Boxed error returned by providers and storage backends.
pub use tower::BoxError;
