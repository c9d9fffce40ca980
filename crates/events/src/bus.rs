//! Event bus facade.
//!
//! The bus composes an [`EnvelopeFactory`], a [`MiddlewarePipeline`], a
//! [`SubscriptionRegistry`] and an optional [`Transport`]. It is an explicitly
//! constructed handle: clone it and pass it to every collaborator that needs
//! to publish or subscribe. Tests build isolated instances per case.
//!
//! ## Publish flow
//!
//! ```text
//! publish(data) → build envelope → middleware (fail-closed)
//!               → local dispatch (awaited, handler failures absorbed)
//!               → transport publish (best-effort, bounded, failures logged)
//! ```
//!
//! Only a middleware failure surfaces to the publisher. Without a transport
//! the bus runs local-only and everything else behaves the same.
//!
//! ## Lifecycle
//!
//! ```text
//! New → (Connecting) → Ready → ShuttingDown → Closed
//! ```
//!
//! `Closed` is terminal; build a new bus to resume.

use std::future::Future;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use erpbus_core::ServiceName;

use crate::catalog::{EventData, EventName, EventPayload};
use crate::envelope::{EnvelopeFactory, EventEnvelope};
use crate::failure::FailureKind;
use crate::handler::{EventHandler, HandlerResult, handler_fn, payload_handler};
use crate::middleware::{Middleware, MiddlewareError, MiddlewarePipeline};
use crate::registry::{Subscription, SubscriptionRegistry};
use crate::transport::{Inbound, Transport, TransportError, TransportStatus};

pub const DEFAULT_HANDLER_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_MIDDLEWARE_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_FORWARD_TIMEOUT: Duration = Duration::from_secs(5);

/// Per-bus limits. `None` disables the corresponding timeout.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct BusOptions {
    /// Upper bound for one handler invocation.
    pub handler_timeout: Option<Duration>,
    /// Upper bound for one middleware step.
    pub middleware_timeout: Option<Duration>,
    /// Upper bound for handing one event to the broker.
    pub forward_timeout: Option<Duration>,
}

impl Default for BusOptions {
    fn default() -> Self {
        Self {
            handler_timeout: Some(DEFAULT_HANDLER_TIMEOUT),
            middleware_timeout: Some(DEFAULT_MIDDLEWARE_TIMEOUT),
            forward_timeout: Some(DEFAULT_FORWARD_TIMEOUT),
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum BusState {
    New = 0,
    Connecting = 1,
    Ready = 2,
    ShuttingDown = 3,
    Closed = 4,
}

impl BusState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => BusState::New,
            1 => BusState::Connecting,
            2 => BusState::Ready,
            3 => BusState::ShuttingDown,
            _ => BusState::Closed,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BusState::New => "new",
            BusState::Connecting => "connecting",
            BusState::Ready => "ready",
            BusState::ShuttingDown => "shutting_down",
            BusState::Closed => "closed",
        }
    }

    /// Whether the bus still accepts publishes and subscriptions.
    pub fn is_open(self) -> bool {
        self < BusState::ShuttingDown
    }
}

impl core::fmt::Display for BusState {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum PublishError {
    #[error(transparent)]
    Middleware(#[from] MiddlewareError),

    #[error("event bus is closed")]
    Closed,
}

#[derive(Debug, Error)]
pub enum SubscribeError {
    #[error("event bus is closed")]
    Closed,
}

struct Inner {
    factory: EnvelopeFactory,
    registry: Arc<SubscriptionRegistry>,
    pipeline: MiddlewarePipeline,
    transport: Option<Arc<dyn Transport>>,
    options: BusOptions,
    state: AtomicU8,
    inbound_task: Mutex<Option<JoinHandle<()>>>,
}

/// Cloneable handle to one bus instance.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<Inner>,
}

impl core::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("EventBus")
            .field("source", self.source())
            .field("state", &self.state())
            .field("pipeline", &self.inner.pipeline)
            .field("registry", &self.inner.registry)
            .field("transport", &self.transport_status())
            .finish()
    }
}

impl EventBus {
    /// Local-only bus with default options.
    pub fn local(source: ServiceName) -> Self {
        Self::builder(source).build()
    }

    pub fn builder(source: ServiceName) -> EventBusBuilder {
        EventBusBuilder {
            source,
            transport: None,
            options: BusOptions::default(),
            middleware: Vec::new(),
        }
    }

    /// Identity stamped on every envelope this instance produces.
    pub fn source(&self) -> &ServiceName {
        self.inner.factory.source()
    }

    pub fn state(&self) -> BusState {
        BusState::from_u8(self.inner.state.load(Ordering::Acquire))
    }

    pub fn options(&self) -> BusOptions {
        self.inner.options
    }

    /// `None` when the bus runs local-only.
    pub fn transport_status(&self) -> Option<TransportStatus> {
        self.inner.transport.as_ref().map(|t| t.status())
    }

    pub fn subscriber_count(&self, name: EventName) -> usize {
        self.inner.registry.count(name)
    }

    /// Append a middleware step. Steps run in registration order.
    pub fn use_middleware(&self, middleware: Arc<dyn Middleware>) {
        self.inner.pipeline.push(middleware);
    }

    /// Build, transform and deliver one event.
    ///
    /// Returns the envelope exactly as every recipient observed it. Fails only
    /// when a middleware step fails or the bus is closed; in both cases nothing
    /// was dispatched.
    pub async fn publish(
        &self,
        data: impl Into<EventData>,
    ) -> Result<Arc<EventEnvelope>, PublishError> {
        if !self.state().is_open() {
            return Err(PublishError::Closed);
        }

        let envelope = self.inner.factory.build(data);
        let name = envelope.event_name();
        let event_id = envelope.event_id().clone();

        let envelope = match self
            .inner
            .pipeline
            .run(envelope, self.inner.options.middleware_timeout)
            .await
        {
            Ok(envelope) => Arc::new(envelope),
            Err(err) => {
                warn!(
                    kind = %FailureKind::MiddlewareFailure,
                    event_name = %name,
                    event_id = %event_id,
                    middleware = err.middleware(),
                    error = %err,
                    "publish aborted by middleware"
                );
                return Err(err.into());
            }
        };

        self.inner
            .registry
            .dispatch_local(envelope.clone(), self.inner.options.handler_timeout)
            .await;

        if let Some(transport) = &self.inner.transport {
            let forwarded = match self.inner.options.forward_timeout {
                Some(limit) => tokio::time::timeout(limit, transport.publish(&envelope))
                    .await
                    .unwrap_or(Err(TransportError::Timeout(limit))),
                None => transport.publish(&envelope).await,
            };
            if let Err(err) = forwarded {
                log_forward_failure(&envelope, &err);
            }
        }

        debug!(event_name = %name, event_id = %envelope.event_id(), "event published");
        Ok(envelope)
    }

    /// Register a handler for `name`.
    ///
    /// The first local interest in an event name also subscribes the
    /// transport to that name's broker channel. Transport errors are logged;
    /// local registration always succeeds on an open bus.
    pub fn subscribe(
        &self,
        name: EventName,
        handler: Arc<dyn EventHandler>,
    ) -> Result<Subscription, SubscribeError> {
        if !self.state().is_open() {
            return Err(SubscribeError::Closed);
        }

        let handler_name = handler.name().to_string();
        let registration = self.inner.registry.insert(name, handler);

        if registration.first_for_name {
            if let Some(transport) = &self.inner.transport {
                if let Err(err) = transport.subscribe(name) {
                    warn!(
                        kind = %transport_failure_kind(&err),
                        event_name = %name,
                        error = %err,
                        "distributed subscription unavailable; local delivery only"
                    );
                }
            }
        }

        debug!(
            event_name = %name,
            handler = %handler_name,
            handler_id = registration.id.as_u64(),
            "handler subscribed"
        );
        Ok(Subscription::new(name, registration.id, &self.inner.registry))
    }

    /// Register an async closure for `name`.
    pub fn subscribe_fn<F, Fut>(&self, name: EventName, f: F) -> Result<Subscription, SubscribeError>
    where
        F: Fn(Arc<EventEnvelope>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.subscribe(name, Arc::new(handler_fn(name.as_str(), f)))
    }

    /// Register an async closure that receives the typed payload `P`.
    pub fn on<P, F, Fut>(&self, f: F) -> Result<Subscription, SubscribeError>
    where
        P: EventPayload,
        F: Fn(P, Arc<EventEnvelope>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.subscribe(P::NAME, Arc::new(payload_handler::<P, _, _>(P::NAME.as_str(), f)))
    }

    /// Idempotent. Returns `true` only on the call that removed the handler.
    pub fn unsubscribe(&self, subscription: &Subscription) -> bool {
        let removed = subscription.unsubscribe();
        if removed {
            debug!(
                event_name = %subscription.event_name(),
                handler_id = subscription.id().as_u64(),
                "handler unsubscribed"
            );
        }
        removed
    }

    /// Release broker connections and drop every registration.
    ///
    /// Idempotent, and safe on a bus that never connected.
    pub async fn shutdown(&self) {
        let previous = BusState::from_u8(
            self.inner
                .state
                .fetch_max(BusState::ShuttingDown as u8, Ordering::AcqRel),
        );
        if !previous.is_open() {
            return;
        }

        if let Some(task) = self
            .inner
            .inbound_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            task.abort();
        }
        if let Some(transport) = &self.inner.transport {
            transport.close().await;
        }
        self.inner.registry.clear();

        self.inner
            .state
            .store(BusState::Closed as u8, Ordering::Release);
        info!(source = %self.source(), "event bus closed");
    }
}

fn transport_failure_kind(err: &TransportError) -> FailureKind {
    match err {
        TransportError::Failed => FailureKind::TerminalBrokerFailure,
        _ => FailureKind::TransientBrokerError,
    }
}

fn log_forward_failure(envelope: &EventEnvelope, err: &TransportError) {
    match err {
        // Already reported once when the connection failed.
        TransportError::Failed | TransportError::Closed => debug!(
            kind = %transport_failure_kind(err),
            event_name = %envelope.event_name(),
            event_id = %envelope.event_id(),
            "event not forwarded to broker"
        ),
        _ => warn!(
            kind = %transport_failure_kind(err),
            event_name = %envelope.event_name(),
            event_id = %envelope.event_id(),
            error = %err,
            "failed to forward event to broker"
        ),
    }
}

pub struct EventBusBuilder {
    source: ServiceName,
    transport: Option<Arc<dyn Transport>>,
    options: BusOptions,
    middleware: Vec<Arc<dyn Middleware>>,
}

impl EventBusBuilder {
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn options(mut self, options: BusOptions) -> Self {
        self.options = options;
        self
    }

    pub fn middleware(mut self, middleware: Arc<dyn Middleware>) -> Self {
        self.middleware.push(middleware);
        self
    }

    /// Assemble the bus and start the transport.
    ///
    /// A transport needs a Tokio runtime for its inbound task; without one,
    /// or if the transport refuses to start, the bus falls back to
    /// local-only.
    pub fn build(self) -> EventBus {
        let registry = Arc::new(SubscriptionRegistry::new());
        let pipeline = MiddlewarePipeline::new();
        for middleware in self.middleware {
            pipeline.push(middleware);
        }

        let state = AtomicU8::new(BusState::New as u8);
        let (transport, inbound_task) = match self.transport {
            Some(transport) => {
                state.store(BusState::Connecting as u8, Ordering::Release);
                match start_transport(
                    transport.as_ref(),
                    &self.source,
                    registry.clone(),
                    self.options.handler_timeout,
                ) {
                    Ok(task) => (Some(transport), Some(task)),
                    Err(err) => {
                        warn!(
                            kind = %FailureKind::ConfigurationDegraded,
                            error = %err,
                            "event transport did not start; local delivery only"
                        );
                        (None, None)
                    }
                }
            }
            None => (None, None),
        };
        state.store(BusState::Ready as u8, Ordering::Release);

        info!(
            source = %self.source,
            distributed = transport.is_some(),
            "event bus ready"
        );

        EventBus {
            inner: Arc::new(Inner {
                factory: EnvelopeFactory::new(self.source),
                registry,
                pipeline,
                transport,
                options: self.options,
                state,
                inbound_task: Mutex::new(inbound_task),
            }),
        }
    }
}

/// Spawn the task that dispatches remote envelopes, then start the transport.
fn start_transport(
    transport: &dyn Transport,
    source: &ServiceName,
    registry: Arc<SubscriptionRegistry>,
    handler_timeout: Option<Duration>,
) -> Result<JoinHandle<()>, TransportError> {
    let runtime = tokio::runtime::Handle::try_current()
        .map_err(|e| TransportError::Unavailable(e.to_string()))?;

    let (tx, mut rx) = mpsc::unbounded_channel::<EventEnvelope>();
    transport.start(Inbound::new(source.clone(), tx))?;

    Ok(runtime.spawn(async move {
        while let Some(envelope) = rx.recv().await {
            registry
                .dispatch_local(Arc::new(envelope), handler_timeout)
                .await;
        }
    }))
}
