use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;

use crate::catalog::EventPayload;
use crate::envelope::EventEnvelope;

pub type HandlerResult = anyhow::Result<()>;

/// Handles envelopes dispatched to a subscription.
///
/// Handlers should be:
/// - **Idempotent**: delivery is best-effort, and collaborators must tolerate
///   both loss and the odd duplicate from other producers.
/// - **Quick**: `publish()` awaits every local handler in turn.
/// - **Isolated**: an error, panic or timeout is logged and never reaches the
///   publisher or sibling handlers.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, envelope: Arc<EventEnvelope>) -> HandlerResult;

    /// Handler name for logging.
    fn name(&self) -> &str {
        "anonymous"
    }
}

/// Adapts an async closure into an [`EventHandler`].
pub struct FnHandler<F> {
    name: String,
    f: F,
}

pub fn handler_fn<F, Fut>(name: impl Into<String>, f: F) -> FnHandler<F>
where
    F: Fn(Arc<EventEnvelope>) -> Fut + Send + Sync,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    FnHandler {
        name: name.into(),
        f,
    }
}

#[async_trait]
impl<F, Fut> EventHandler for FnHandler<F>
where
    F: Fn(Arc<EventEnvelope>) -> Fut + Send + Sync,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    async fn handle(&self, envelope: Arc<EventEnvelope>) -> HandlerResult {
        (self.f)(envelope).await
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Adapts an async closure over a concrete payload type.
///
/// The closure receives its own copy of the payload plus the shared envelope
/// for metadata (id, source, timestamp).
pub struct PayloadHandler<P, F> {
    name: String,
    f: F,
    _payload: PhantomData<fn() -> P>,
}

pub fn payload_handler<P, F, Fut>(name: impl Into<String>, f: F) -> PayloadHandler<P, F>
where
    P: EventPayload,
    F: Fn(P, Arc<EventEnvelope>) -> Fut + Send + Sync,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    PayloadHandler {
        name: name.into(),
        f,
        _payload: PhantomData,
    }
}

#[async_trait]
impl<P, F, Fut> EventHandler for PayloadHandler<P, F>
where
    P: EventPayload,
    F: Fn(P, Arc<EventEnvelope>) -> Fut + Send + Sync,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    async fn handle(&self, envelope: Arc<EventEnvelope>) -> HandlerResult {
        let Some(payload) = envelope.payload::<P>().cloned() else {
            anyhow::bail!(
                "expected a {} payload, got {}",
                P::NAME,
                envelope.event_name()
            );
        };
        (self.f)(payload, envelope).await
    }

    fn name(&self) -> &str {
        &self.name
    }
}
