//! Subscription registry and local dispatch.
//!
//! The registry is owned by one bus instance. Handlers for an event name form
//! a set: invocation order across handlers is unspecified and must not be
//! relied on.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, Weak};
use std::time::Duration;

use futures::FutureExt;
use tracing::{debug, warn};

use crate::catalog::EventName;
use crate::envelope::EventEnvelope;
use crate::failure::FailureKind;
use crate::handler::EventHandler;

/// Identifies one registration in a registry.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandlerId(u64);

impl HandlerId {
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

/// Outcome of [`SubscriptionRegistry::insert`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Registration {
    pub id: HandlerId,
    /// Whether this is the only handler now registered for the event name.
    pub first_for_name: bool,
}

/// Counts from one local dispatch.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub delivered: usize,
    pub failed: usize,
}

type HandlerSet = HashMap<HandlerId, Arc<dyn EventHandler>>;

#[derive(Default)]
pub struct SubscriptionRegistry {
    handlers: RwLock<HashMap<EventName, HandlerSet>>,
    next_id: AtomicU64,
}

impl core::fmt::Debug for SubscriptionRegistry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let handlers = self.handlers.read().unwrap_or_else(PoisonError::into_inner);
        let counts: HashMap<_, _> = handlers.iter().map(|(k, v)| (*k, v.len())).collect();
        f.debug_struct("SubscriptionRegistry")
            .field("handlers", &counts)
            .finish()
    }
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, name: EventName, handler: Arc<dyn EventHandler>) -> Registration {
        let id = HandlerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        // A poisoned lock only means a writer panicked between two complete
        // map operations; the map itself is still consistent.
        let mut handlers = self.handlers.write().unwrap_or_else(PoisonError::into_inner);
        let set = handlers.entry(name).or_default();
        set.insert(id, handler);
        Registration {
            id,
            first_for_name: set.len() == 1,
        }
    }

    /// Remove a registration. Returns `false` if it was not present.
    pub fn remove(&self, name: EventName, id: HandlerId) -> bool {
        let mut handlers = self.handlers.write().unwrap_or_else(PoisonError::into_inner);
        let Some(set) = handlers.get_mut(&name) else {
            return false;
        };
        let removed = set.remove(&id).is_some();
        if set.is_empty() {
            handlers.remove(&name);
        }
        removed
    }

    pub fn handlers_for(&self, name: EventName) -> Vec<Arc<dyn EventHandler>> {
        let handlers = self.handlers.read().unwrap_or_else(PoisonError::into_inner);
        handlers
            .get(&name)
            .map(|set| set.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn count(&self, name: EventName) -> usize {
        let handlers = self.handlers.read().unwrap_or_else(PoisonError::into_inner);
        handlers.get(&name).map_or(0, HashMap::len)
    }

    pub fn clear(&self) {
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// Invoke every handler currently registered for the envelope's name, one
    /// after another.
    ///
    /// Failures (errors, panics, timeouts) are logged and counted; they never
    /// stop the remaining handlers.
    pub async fn dispatch_local(
        &self,
        envelope: Arc<EventEnvelope>,
        timeout: Option<Duration>,
    ) -> DispatchReport {
        let name = envelope.event_name();

        // Snapshot so the lock is not held across handler awaits.
        let handlers = self.handlers_for(name);
        let mut report = DispatchReport::default();

        for handler in handlers {
            match invoke(handler.as_ref(), envelope.clone(), timeout).await {
                Ok(()) => report.delivered += 1,
                Err(reason) => {
                    report.failed += 1;
                    warn!(
                        kind = %FailureKind::SubscriberFailure,
                        event_name = %name,
                        event_id = %envelope.event_id(),
                        handler = handler.name(),
                        error = %reason,
                        "event handler failed"
                    );
                }
            }
        }

        debug!(
            event_name = %name,
            event_id = %envelope.event_id(),
            delivered = report.delivered,
            failed = report.failed,
            "local dispatch complete"
        );
        report
    }
}

async fn invoke(
    handler: &dyn EventHandler,
    envelope: Arc<EventEnvelope>,
    timeout: Option<Duration>,
) -> Result<(), String> {
    let call = AssertUnwindSafe(handler.handle(envelope)).catch_unwind();
    let outcome = match timeout {
        Some(limit) => match tokio::time::timeout(limit, call).await {
            Ok(outcome) => outcome,
            Err(_) => return Err(format!("timed out after {limit:?}")),
        },
        None => call.await,
    };

    match outcome {
        Ok(Ok(())) => Ok(()),
        Ok(Err(err)) => Err(format!("{err:#}")),
        Err(panic) => Err(format!("panicked: {}", panic_message(panic.as_ref()))),
    }
}

pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> &str {
    if let Some(msg) = panic.downcast_ref::<&'static str>() {
        msg
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg
    } else {
        "non-string panic payload"
    }
}

/// Handle to one registration.
///
/// Dropping the handle keeps the handler registered; call
/// [`Subscription::unsubscribe`] to remove it. Unsubscribing is idempotent.
#[derive(Debug)]
pub struct Subscription {
    name: EventName,
    id: HandlerId,
    registry: Weak<SubscriptionRegistry>,
    active: AtomicBool,
}

impl Subscription {
    pub(crate) fn new(name: EventName, id: HandlerId, registry: &Arc<SubscriptionRegistry>) -> Self {
        Self {
            name,
            id,
            registry: Arc::downgrade(registry),
            active: AtomicBool::new(true),
        }
    }

    pub fn event_name(&self) -> EventName {
        self.name
    }

    pub fn id(&self) -> HandlerId {
        self.id
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Remove the handler. Returns `true` only on the call that removed it.
    pub fn unsubscribe(&self) -> bool {
        if !self.active.swap(false, Ordering::AcqRel) {
            return false;
        }
        match self.registry.upgrade() {
            Some(registry) => registry.remove(self.name, self.id),
            None => false,
        }
    }
}
