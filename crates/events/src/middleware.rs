//! Middleware pipeline: ordered envelope transforms applied once per publish.
//!
//! The pipeline is fail-closed. If any step errors, panics or times out the
//! publish is aborted before anything is dispatched, so recipients never see
//! a half-transformed envelope.

use std::panic::AssertUnwindSafe;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use thiserror::Error;

use crate::catalog::EventName;
use crate::envelope::EventEnvelope;
use crate::registry::panic_message;

/// A transform step applied to every published envelope.
///
/// Implementations may enrich, redact or log; they may not change the event
/// kind of the envelope.
#[async_trait]
pub trait Middleware: Send + Sync {
    async fn process(&self, name: EventName, envelope: EventEnvelope)
    -> anyhow::Result<EventEnvelope>;

    /// Middleware name for logging and errors.
    fn name(&self) -> &str {
        "anonymous"
    }
}

#[derive(Debug, Error)]
pub enum MiddlewareError {
    #[error("middleware `{middleware}` failed: {error:#}")]
    Failed {
        middleware: String,
        error: anyhow::Error,
    },

    #[error("middleware `{middleware}` panicked: {message}")]
    Panicked { middleware: String, message: String },

    #[error("middleware `{middleware}` timed out after {timeout:?}")]
    TimedOut {
        middleware: String,
        timeout: Duration,
    },

    #[error("middleware `{middleware}` changed the event from {expected} to {found}")]
    KindChanged {
        middleware: String,
        expected: EventName,
        found: EventName,
    },
}

impl MiddlewareError {
    pub fn middleware(&self) -> &str {
        match self {
            MiddlewareError::Failed { middleware, .. }
            | MiddlewareError::Panicked { middleware, .. }
            | MiddlewareError::TimedOut { middleware, .. }
            | MiddlewareError::KindChanged { middleware, .. } => middleware,
        }
    }
}

/// Adapts a synchronous closure into a [`Middleware`].
pub struct FnMiddleware<F> {
    name: String,
    f: F,
}

pub fn middleware_fn<F>(name: impl Into<String>, f: F) -> FnMiddleware<F>
where
    F: Fn(EventName, EventEnvelope) -> anyhow::Result<EventEnvelope> + Send + Sync,
{
    FnMiddleware {
        name: name.into(),
        f,
    }
}

#[async_trait]
impl<F> Middleware for FnMiddleware<F>
where
    F: Fn(EventName, EventEnvelope) -> anyhow::Result<EventEnvelope> + Send + Sync,
{
    async fn process(
        &self,
        name: EventName,
        envelope: EventEnvelope,
    ) -> anyhow::Result<EventEnvelope> {
        (self.f)(name, envelope)
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[derive(Default)]
pub struct MiddlewarePipeline {
    steps: RwLock<Vec<Arc<dyn Middleware>>>,
}

impl core::fmt::Debug for MiddlewarePipeline {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let names: Vec<String> = self.snapshot().iter().map(|m| m.name().to_string()).collect();
        f.debug_struct("MiddlewarePipeline")
            .field("steps", &names)
            .finish()
    }
}

impl MiddlewarePipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a step; steps run in registration order.
    pub fn push(&self, middleware: Arc<dyn Middleware>) {
        self.steps
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(middleware);
    }

    pub fn len(&self) -> usize {
        self.steps.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn snapshot(&self) -> Vec<Arc<dyn Middleware>> {
        self.steps
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Run every step in order, each awaited before the next.
    pub async fn run(
        &self,
        mut envelope: EventEnvelope,
        timeout: Option<Duration>,
    ) -> Result<EventEnvelope, MiddlewareError> {
        let expected = envelope.event_name();

        for step in self.snapshot() {
            let middleware = step.name().to_string();
            let call = AssertUnwindSafe(step.process(expected, envelope)).catch_unwind();

            let outcome = match timeout {
                Some(limit) => tokio::time::timeout(limit, call).await.map_err(|_| {
                    MiddlewareError::TimedOut {
                        middleware: middleware.clone(),
                        timeout: limit,
                    }
                })?,
                None => call.await,
            };

            envelope = match outcome {
                Ok(Ok(next)) => next,
                Ok(Err(error)) => return Err(MiddlewareError::Failed { middleware, error }),
                Err(panic) => {
                    return Err(MiddlewareError::Panicked {
                        middleware,
                        message: panic_message(panic.as_ref()).to_string(),
                    });
                }
            };

            let found = envelope.event_name();
            if found != expected {
                return Err(MiddlewareError::KindChanged {
                    middleware,
                    expected,
                    found,
                });
            }
        }

        Ok(envelope)
    }
}
