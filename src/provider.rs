//! Provider registry and handler adapters.
//!
//! A *provider* is whatever finally does something with an envelope: publish
//! it to a broker, call a webhook, send an email. Providers are keyed by the
//! driver name they declare, and [`Providers`] routes each envelope to the
//! provider matching its `driver_name`.
//!
//! ## Key components
//!
//! - [`Provider`]: Trait implemented by handlers
//! - [`Providers`]: Thread-safe registry, shared with workers through an `Arc`
//! - [`ServiceProvider`]: Adapter turning a `tower::Service` into a provider
//! - [`from_fn`]: Adapter turning an async closure into a provider
//! - [`DispatchError`]: Routing and handler failures with tracing context

mod inmemory;

use std::{
    collections::HashMap,
    fmt,
    future::Future,
    sync::Arc,
    time::Duration,
};

use parking_lot::RwLock;
use tower::{Service, ServiceExt as _};
use tracing_error::SpanTrace;

use crate::Envelope;

pub use inmemory::InMemoryProvider;

/// Handler for envelopes of one driver name.
///
/// Delivery is at-least-once: `handle` may be called several times for the
/// same envelope and should treat a redelivery as a no-op when it can.
#[async_trait::async_trait]
pub trait Provider: Send + Sync {
    /// Routing key this provider serves. Must not be empty.
    fn driver_name(&self) -> &str;

    /// Process one envelope.
    async fn handle(&self, envelope: &Envelope) -> Result<(), tower::BoxError>;
}

/// Registry mapping driver names to providers.
///
/// Registration and lookup may happen concurrently; lookups only take a read
/// lock and never hold it across a handler call.
#[derive(Default)]
pub struct Providers {
    providers: RwLock<HashMap<String, Arc<dyn Provider>>>,
}

impl Providers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a provider under its own driver name.
    ///
    /// Registering a second provider for the same name replaces the first.
    pub fn register<P>(&self, provider: P) -> &Self
    where
        P: Provider + 'static,
    {
        self.register_arc(Arc::new(provider))
    }

    /// Register an already shared provider.
    pub fn register_arc(&self, provider: Arc<dyn Provider>) -> &Self {
        let name = provider.driver_name().to_owned();
        if self.providers.write().insert(name.clone(), provider).is_some() {
            tracing::debug!(driver_name = %name, "Provider replaced");
        }
        self
    }

    /// Look up the provider for a driver name.
    pub fn get(&self, driver_name: &str) -> Option<Arc<dyn Provider>> {
        self.providers.read().get(driver_name).cloned()
    }

    /// Registered driver names, sorted.
    pub fn driver_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.providers.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.providers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.read().is_empty()
    }

    /// Route an envelope to its provider and run it.
    ///
    /// Fails with [`DispatchErrorKind::ProviderNotFound`] when nothing is
    /// registered for the envelope's driver name.
    #[tracing::instrument(skip_all, fields(envelope_id = %envelope.id, driver_name = %envelope.driver_name))]
    pub async fn dispatch(&self, envelope: &Envelope) -> Result<(), DispatchError> {
        let provider = self
            .get(&envelope.driver_name)
            .ok_or_else(|| DispatchError::provider_not_found(&envelope.driver_name))?;

        provider
            .handle(envelope)
            .await
            .map_err(DispatchError::handler)
    }
}

impl fmt::Debug for Providers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Providers")
            .field("driver_names", &self.driver_names())
            .finish()
    }
}

/// Provider backed by a `tower::Service`.
///
/// Lets any Tower stack (with retries, rate limits, tracing layers...) act as
/// the handler for a driver name.
#[derive(Clone)]
pub struct ServiceProvider<S> {
    driver_name: String,
    service: S,
}

impl<S> ServiceProvider<S> {
    pub fn new(driver_name: impl Into<String>, service: S) -> Self {
        Self {
            driver_name: driver_name.into(),
            service,
        }
    }

    /// Apply a Tower layer to the wrapped service.
    pub fn layer<L>(self, layer: L) -> ServiceProvider<L::Service>
    where
        L: tower::Layer<S>,
    {
        ServiceProvider {
            driver_name: self.driver_name,
            service: layer.layer(self.service),
        }
    }
}

#[async_trait::async_trait]
impl<S> Provider for ServiceProvider<S>
where
    S: Service<Envelope, Response = ()> + Clone + Send + Sync + 'static,
    S::Error: Into<tower::BoxError>,
    S::Future: Send,
{
    fn driver_name(&self) -> &str {
        &self.driver_name
    }

    async fn handle(&self, envelope: &Envelope) -> Result<(), tower::BoxError> {
        self.service
            .clone()
            .oneshot(envelope.clone())
            .await
            .map_err(Into::into)
    }
}

/// Build a provider from an async closure.
///
/// ```rust
/// use pigeonhole::{Providers, provider};
///
/// let providers = Providers::new();
/// providers.register(provider::from_fn("audit", |envelope| async move {
///     println!("{} bytes", envelope.payload.len());
///     Ok::<_, pigeonhole::BoxError>(())
/// }));
/// assert!(providers.get("audit").is_some());
/// ```
pub fn from_fn<F, Fut>(driver_name: impl Into<String>, f: F) -> FnProvider<F>
where
    F: Fn(Envelope) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), tower::BoxError>> + Send + 'static,
{
    FnProvider {
        driver_name: driver_name.into(),
        f,
    }
}

/// Provider created by [`from_fn`].
pub struct FnProvider<F> {
    driver_name: String,
    f: F,
}

#[async_trait::async_trait]
impl<F, Fut> Provider for FnProvider<F>
where
    F: Fn(Envelope) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), tower::BoxError>> + Send + 'static,
{
    fn driver_name(&self) -> &str {
        &self.driver_name
    }

    async fn handle(&self, envelope: &Envelope) -> Result<(), tower::BoxError> {
        (self.f)(envelope.clone()).await
    }
}

/// Error returned when an envelope could not be dispatched.
///
/// Each error captures:
/// - The underlying error kind
/// - A tracing span backtrace for improved diagnostics
#[derive(Debug)]
pub struct DispatchError {
    context: SpanTrace,
    kind: DispatchErrorKind,
}

/// Dispatch errors kind.
#[derive(Debug)]
pub enum DispatchErrorKind {
    /// No provider is registered for the driver name.
    ProviderNotFound(String),
    /// The provider returned an error.
    Handler(tower::BoxError),
    /// The provider did not finish within the per-message timeout.
    Timeout(Duration),
}

impl DispatchError {
    pub(crate) fn provider_not_found(driver_name: &str) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: DispatchErrorKind::ProviderNotFound(driver_name.to_owned()),
        }
    }

    pub(crate) fn handler(err: tower::BoxError) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: DispatchErrorKind::Handler(err),
        }
    }

    pub(crate) fn timeout(after: Duration) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: DispatchErrorKind::Timeout(after),
        }
    }

    pub fn kind(&self) -> &DispatchErrorKind {
        &self.kind
    }

    pub fn is_provider_not_found(&self) -> bool {
        matches!(self.kind, DispatchErrorKind::ProviderNotFound(_))
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self.kind, DispatchErrorKind::Timeout(_))
    }
}

impl fmt::Display for DispatchErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DispatchErrorKind::ProviderNotFound(name) => {
                write!(f, "Provider not found for driver name {name:?}")
            }
            DispatchErrorKind::Handler(err) => write!(f, "Handler error: {err}"),
            DispatchErrorKind::Timeout(after) => write!(f, "Handler timed out after {after:?}"),
        }
    }
}

impl fmt::Display for DispatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", self.kind)?;
        self.context.fmt(f)
    }
}

impl std::error::Error for DispatchError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            DispatchErrorKind::Handler(err) => Some(err.as_ref()),
            DispatchErrorKind::ProviderNotFound(_) | DispatchErrorKind::Timeout(_) => None,
        }
    }
}
