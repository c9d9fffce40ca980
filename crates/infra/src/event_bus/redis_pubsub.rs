//! Redis pub/sub transport.
//!
//! Each event name maps to one channel (`<namespace>:events:<eventName>`).
//! Two connections are held per instance:
//! - a multiplexed async connection for `PUBLISH`,
//! - a blocking connection in subscribe mode, driven by a dedicated thread.
//!
//! Redis pub/sub is not durable: an instance that is disconnected when a
//! message is published misses it. Both connections reconnect with bounded,
//! jittered backoff and enter `Failed` once the budget is spent; the bus keeps
//! delivering locally.
//!
//! A `PUBLISH` that gets no answer within the publish timeout abandons the
//! publisher connection and reconnects. The subscriber sends `PING` after a
//! quiet period and reconnects when that goes unanswered too.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, TryRecvError};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use redis::AsyncCommands;
use redis::aio::MultiplexedConnection;
use redis::{Cmd, ErrorKind, Msg, RedisError};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use erpbus_events::{
    ConnectionState, ConnectionStateCell, EventEnvelope, EventName, FailureKind, Inbound,
    Transport, TransportError, TransportStatus, channel_name, wire,
};

use crate::backoff::{Backoff, ReconnectPolicy};

/// How long one connection attempt may take.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Read timeout of the subscriber connection; bounds how quickly the worker
/// notices new subscriptions and shutdown.
const POLL_INTERVAL: Duration = Duration::from_millis(250);

pub const DEFAULT_PUBLISH_TIMEOUT: Duration = Duration::from_secs(5);

/// Quiet period after which the subscriber pings the broker; an unanswered
/// ping for as long again drops the connection.
pub const DEFAULT_HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(15);

#[derive(Debug, thiserror::Error)]
pub enum RedisTransportError {
    #[error("invalid redis url: {0}")]
    InvalidUrl(#[source] redis::RedisError),

    #[error("failed to spawn subscriber thread: {0}")]
    Spawn(#[source] std::io::Error),
}

struct Shared {
    client: redis::Client,
    namespace: String,
    policy: ReconnectPolicy,
    closed: AtomicBool,
    publisher: ConnectionStateCell,
    subscriber: ConnectionStateCell,
    publish_conn: tokio::sync::Mutex<Option<MultiplexedConnection>>,
    publisher_reconnecting: AtomicBool,
}

impl Shared {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn channel(&self, name: EventName) -> String {
        channel_name(&self.namespace, name)
    }
}

pub struct RedisTransport {
    shared: Arc<Shared>,
    commands: mpsc::Sender<EventName>,
    command_rx: Mutex<Option<mpsc::Receiver<EventName>>>,
    publisher_task: Mutex<Option<JoinHandle<()>>>,
    worker: Mutex<Option<thread::JoinHandle<()>>>,
    publish_timeout: Option<Duration>,
    health_check_interval: Duration,
}

impl core::fmt::Debug for RedisTransport {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RedisTransport")
            .field("namespace", &self.shared.namespace)
            .field("status", &self.status())
            .finish()
    }
}

impl RedisTransport {
    /// Validate the URL; no connection is made until [`Transport::start`].
    pub fn new(
        redis_url: impl AsRef<str>,
        namespace: impl Into<String>,
        policy: ReconnectPolicy,
    ) -> Result<Self, RedisTransportError> {
        let client =
            redis::Client::open(redis_url.as_ref()).map_err(RedisTransportError::InvalidUrl)?;
        let (commands, command_rx) = mpsc::channel();

        Ok(Self {
            shared: Arc::new(Shared {
                client,
                namespace: namespace.into(),
                policy,
                closed: AtomicBool::new(false),
                publisher: ConnectionStateCell::new("publisher"),
                subscriber: ConnectionStateCell::new("subscriber"),
                publish_conn: tokio::sync::Mutex::new(None),
                publisher_reconnecting: AtomicBool::new(false),
            }),
            commands,
            command_rx: Mutex::new(Some(command_rx)),
            publisher_task: Mutex::new(None),
            worker: Mutex::new(None),
            publish_timeout: Some(DEFAULT_PUBLISH_TIMEOUT),
            health_check_interval: DEFAULT_HEALTH_CHECK_INTERVAL,
        })
    }

    /// Upper bound for one `PUBLISH` round trip. `None` waits indefinitely.
    pub fn with_publish_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.publish_timeout = timeout;
        self
    }

    pub fn with_health_check_interval(mut self, interval: Duration) -> Self {
        self.health_check_interval = interval;
        self
    }

    /// Drop the publisher connection and start reconnecting it.
    async fn abandon_publisher(&self) {
        self.shared.publish_conn.lock().await.take();
        if self.shared.publisher.set(ConnectionState::Reconnecting) {
            self.spawn_publisher_reconnect(&tokio::runtime::Handle::current());
        }
    }

    fn spawn_publisher_reconnect(&self, runtime: &tokio::runtime::Handle) {
        if self.shared.publisher_reconnecting.swap(true, Ordering::AcqRel) {
            return;
        }
        let task = runtime.spawn(maintain_publisher(self.shared.clone()));
        *self
            .publisher_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(task);
    }
}

#[async_trait]
impl Transport for RedisTransport {
    fn start(&self, inbound: Inbound) -> Result<(), TransportError> {
        let Some(commands) = self
            .command_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        else {
            return Ok(());
        };
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| TransportError::Unavailable(e.to_string()))?;

        self.shared.publisher.set(ConnectionState::Connecting);
        self.spawn_publisher_reconnect(&runtime);

        let shared = self.shared.clone();
        let health_check = self.health_check_interval;
        let worker = thread::Builder::new()
            .name("erpbus-redis-subscriber".to_string())
            .spawn(move || run_subscriber(shared, commands, inbound, health_check))
            .map_err(|e| TransportError::Unavailable(RedisTransportError::Spawn(e).to_string()))?;
        *self.worker.lock().unwrap_or_else(PoisonError::into_inner) = Some(worker);

        Ok(())
    }

    async fn publish(&self, envelope: &EventEnvelope) -> Result<(), TransportError> {
        if self.shared.is_closed() {
            return Err(TransportError::Closed);
        }
        match self.shared.publisher.get() {
            ConnectionState::Failed => return Err(TransportError::Failed),
            ConnectionState::Connected => {}
            other => return Err(TransportError::Unavailable(format!("publisher is {other}"))),
        }

        let payload = wire::encode(envelope)?;
        let channel = self.shared.channel(envelope.event_name());

        let Some(mut conn) = self.shared.publish_conn.lock().await.clone() else {
            return Err(TransportError::Unavailable(
                "publisher is not connected".to_string(),
            ));
        };

        let sent = conn.publish::<_, _, i64>(channel.as_str(), payload);
        let outcome = match self.publish_timeout {
            Some(limit) => match tokio::time::timeout(limit, sent).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    self.abandon_publisher().await;
                    return Err(TransportError::Timeout(limit));
                }
            },
            None => sent.await,
        };

        match outcome {
            Ok(receivers) => {
                debug!(
                    channel = %channel,
                    event_id = %envelope.event_id(),
                    receivers,
                    "published to broker"
                );
                Ok(())
            }
            Err(err) => {
                if is_connection_error(&err) {
                    self.abandon_publisher().await;
                }
                Err(TransportError::Command(err.to_string()))
            }
        }
    }

    fn subscribe(&self, name: EventName) -> Result<(), TransportError> {
        if self.shared.is_closed() {
            return Err(TransportError::Closed);
        }
        if self.shared.subscriber.get().is_terminal() {
            return Err(TransportError::Failed);
        }
        // Queued until the worker runs; the worker dedupes.
        self.commands
            .send(name)
            .map_err(|_| TransportError::Unavailable("subscriber worker stopped".to_string()))
    }

    fn status(&self) -> TransportStatus {
        TransportStatus {
            publisher: self.shared.publisher.get(),
            subscriber: self.shared.subscriber.get(),
        }
    }

    async fn close(&self) {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        let task = self
            .publisher_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            task.abort();
        }
        self.shared.publish_conn.lock().await.take();
        self.shared.publisher.set(ConnectionState::Disconnected);

        let worker = self.worker.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(worker) = worker {
            if tokio::task::spawn_blocking(move || worker.join()).await.is_err() {
                warn!("redis subscriber worker did not stop cleanly");
            }
        }
        self.shared.subscriber.set(ConnectionState::Disconnected);
        info!(namespace = %self.shared.namespace, "redis transport closed");
    }
}

fn is_connection_error(err: &redis::RedisError) -> bool {
    err.is_io_error()
        || err.is_connection_dropped()
        || err.is_connection_refusal()
        || err.is_timeout()
}

/// Connect the publisher, retrying per the policy. Ends `Connected` or
/// `Failed`.
#[instrument(skip(shared), fields(namespace = %shared.namespace))]
async fn maintain_publisher(shared: Arc<Shared>) {
    let mut backoff = shared.policy.backoff();
    loop {
        if shared.is_closed() {
            return;
        }

        let error = match tokio::time::timeout(
            CONNECT_TIMEOUT,
            shared.client.get_multiplexed_async_connection(),
        )
        .await
        {
            Ok(Ok(conn)) => {
                *shared.publish_conn.lock().await = Some(conn);
                shared.publisher_reconnecting.store(false, Ordering::Release);
                if !shared.is_closed() {
                    shared.publisher.set(ConnectionState::Connected);
                }
                return;
            }
            Ok(Err(err)) => err.to_string(),
            Err(_) => format!("connect timed out after {CONNECT_TIMEOUT:?}"),
        };

        let Some(delay) = backoff.next_delay() else {
            shared.publisher.set(ConnectionState::Failed);
            return;
        };
        shared.publisher.set(ConnectionState::Reconnecting);
        debug!(
            kind = %FailureKind::TransientBrokerError,
            connection = "publisher",
            attempt = backoff.attempts(),
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "retrying broker connection"
        );
        tokio::time::sleep(delay).await;
    }
}

enum SessionEnd {
    Closed,
    Lost(redis::RedisError),
}

/// Subscriber worker: connect, (re)subscribe, pump messages into `inbound`.
fn run_subscriber(
    shared: Arc<Shared>,
    commands: mpsc::Receiver<EventName>,
    inbound: Inbound,
    health_check: Duration,
) {
    let mut channels = BTreeSet::new();
    let mut backoff = shared.policy.backoff();
    shared.subscriber.set(ConnectionState::Connecting);

    loop {
        if shared.is_closed() {
            return;
        }

        let outcome = match shared.client.get_connection_with_timeout(CONNECT_TIMEOUT) {
            Ok(mut conn) => session(
                &shared,
                &mut conn,
                &mut channels,
                &commands,
                &inbound,
                &mut backoff,
                health_check,
            ),
            Err(err) => SessionEnd::Lost(err),
        };

        let error = match outcome {
            SessionEnd::Closed => return,
            SessionEnd::Lost(err) => err,
        };
        if shared.is_closed() {
            return;
        }

        let Some(delay) = backoff.next_delay() else {
            shared.subscriber.set(ConnectionState::Failed);
            return;
        };
        shared.subscriber.set(ConnectionState::Reconnecting);
        debug!(
            kind = %FailureKind::TransientBrokerError,
            connection = "subscriber",
            attempt = backoff.attempts(),
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "retrying broker connection"
        );
        sleep_unless_closed(&shared, delay);
    }
}

/// One subscriber connection, driven at the protocol level so the worker can
/// interleave `SUBSCRIBE`/`PING` with reading. Subscribe confirmations and
/// pongs are not messages and only count as signs of life.
fn session(
    shared: &Shared,
    conn: &mut redis::Connection,
    channels: &mut BTreeSet<EventName>,
    commands: &mpsc::Receiver<EventName>,
    inbound: &Inbound,
    backoff: &mut Backoff,
    health_check: Duration,
) -> SessionEnd {
    if let Err(err) = conn.set_read_timeout(Some(POLL_INTERVAL)) {
        return SessionEnd::Lost(err);
    }

    for name in channels.iter() {
        if let Err(err) = send(conn, redis::cmd("SUBSCRIBE").arg(shared.channel(*name))) {
            return SessionEnd::Lost(err);
        }
    }
    if shared.is_closed() {
        return SessionEnd::Closed;
    }
    shared.subscriber.set(ConnectionState::Connected);
    backoff.reset();
    if !channels.is_empty() {
        info!(channels = channels.len(), "resubscribed broker channels");
    }

    let mut last_heard = Instant::now();
    let mut ping_sent: Option<Instant> = None;

    loop {
        if shared.is_closed() {
            return SessionEnd::Closed;
        }

        loop {
            match commands.try_recv() {
                Ok(name) => {
                    if !channels.insert(name) {
                        continue;
                    }
                    let channel = shared.channel(name);
                    if let Err(err) = send(conn, redis::cmd("SUBSCRIBE").arg(channel.as_str())) {
                        return SessionEnd::Lost(err);
                    }
                    debug!(channel = %channel, "subscribed to broker channel");
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => return SessionEnd::Closed,
            }
        }

        match conn.recv_response() {
            Ok(value) => {
                last_heard = Instant::now();
                ping_sent = None;
                let Some(msg) = Msg::from_value(&value) else {
                    continue;
                };
                let channel = msg.get_channel_name();
                match msg.get_payload::<String>() {
                    Ok(payload) => {
                        inbound.deliver_raw(&shared.namespace, channel, &payload);
                    }
                    Err(err) => warn!(channel, error = %err, "ignoring non-text broker message"),
                }
            }
            Err(err) if err.is_timeout() => match ping_sent {
                Some(sent) if sent.elapsed() >= health_check => {
                    return SessionEnd::Lost(RedisError::from((
                        ErrorKind::IoError,
                        "broker stopped answering",
                        format!("no reply to PING within {health_check:?}"),
                    )));
                }
                None if last_heard.elapsed() >= health_check => {
                    if let Err(err) = send(conn, &redis::cmd("PING")) {
                        return SessionEnd::Lost(err);
                    }
                    ping_sent = Some(Instant::now());
                }
                _ => {}
            },
            Err(err) => return SessionEnd::Lost(err),
        }
    }
}

fn send(conn: &mut redis::Connection, cmd: &Cmd) -> redis::RedisResult<()> {
    conn.send_packed_command(&cmd.get_packed_command())
}

fn sleep_unless_closed(shared: &Shared, delay: Duration) {
    let deadline = Instant::now() + delay;
    while !shared.is_closed() {
        let now = Instant::now();
        if now >= deadline {
            break;
        }
        thread::sleep((deadline - now).min(POLL_INTERVAL));
    }
}
