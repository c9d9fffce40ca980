//! Failure taxonomy, attached to log records as the `kind` field.

/// How a failure is treated by the bus.
///
/// Only [`FailureKind::MiddlewareFailure`] ever reaches a publisher; every
/// other kind is absorbed and logged.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum FailureKind {
    /// No broker configured; distributed delivery disabled.
    ConfigurationDegraded,
    /// Broker connection dropped; retried automatically.
    TransientBrokerError,
    /// Retry budget exhausted; distributed delivery disabled for good.
    TerminalBrokerFailure,
    /// A subscriber returned an error, panicked or timed out.
    SubscriberFailure,
    /// A middleware step failed; the publish is aborted.
    MiddlewareFailure,
}

impl FailureKind {
    pub fn as_str(self) -> &'static str {
        match self {
            FailureKind::ConfigurationDegraded => "configuration_degraded",
            FailureKind::TransientBrokerError => "transient_broker_error",
            FailureKind::TerminalBrokerFailure => "terminal_broker_failure",
            FailureKind::SubscriberFailure => "subscriber_failure",
            FailureKind::MiddlewareFailure => "middleware_failure",
        }
    }
}

impl core::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}
