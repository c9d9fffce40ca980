//! ERP integration events.
//!
//! A lightweight pub/sub bus that lets independent ERP services (customer
//! registry, project lifecycle, estimation approval, invoicing) notify each
//! other of business events. Delivery is local first, then best-effort across
//! processes through an optional [`Transport`].

pub mod bus;
pub mod catalog;
pub mod channel;
pub mod envelope;
pub mod failure;
pub mod handler;
pub mod in_memory_bus;
pub mod middleware;
pub mod registry;
pub mod transport;
pub mod wire;

pub use bus::{
    BusOptions, BusState, DEFAULT_FORWARD_TIMEOUT, DEFAULT_HANDLER_TIMEOUT,
    DEFAULT_MIDDLEWARE_TIMEOUT, EventBus, EventBusBuilder, PublishError, SubscribeError,
};
pub use catalog::{
    CustomerCreated, CustomerUpdated, EstimationApproved, EventData, EventName, EventPayload,
    InvoiceCreated, ProjectStatusChanged, UnknownEventName,
};
pub use channel::{DEFAULT_NAMESPACE, channel_name, event_name_from_channel};
pub use envelope::{EnvelopeFactory, EventEnvelope};
pub use failure::FailureKind;
pub use handler::{EventHandler, FnHandler, HandlerResult, PayloadHandler, handler_fn, payload_handler};
pub use in_memory_bus::{InMemoryBroker, InMemoryTransport};
pub use middleware::{FnMiddleware, Middleware, MiddlewareError, MiddlewarePipeline, middleware_fn};
pub use registry::{DispatchReport, HandlerId, Registration, Subscription, SubscriptionRegistry};
pub use transport::{
    ConnectionState, ConnectionStateCell, Delivery, Inbound, Transport, TransportError,
    TransportStatus,
};
pub use wire::WireError;

pub use erpbus_core::{EventId, ServiceName};
