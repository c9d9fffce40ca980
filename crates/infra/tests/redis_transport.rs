#![cfg(feature = "redis")]

//! `RedisTransport` against a scripted in-process RESP server.

use std::io::{BufRead, BufReader, Read, Write};
use std::net::{Shutdown, TcpListener, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use erpbus_events::{
    BusOptions, ConnectionState, EstimationApproved, EventBus, EventEnvelope, EventName, Inbound,
    ServiceName, Transport, TransportError,
};
use erpbus_infra::ReconnectPolicy;
use erpbus_infra::event_bus::RedisTransport;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy)]
struct Script {
    answer_publish: bool,
    answer_ping: bool,
}

const HEALTHY: Script = Script {
    answer_publish: true,
    answer_ping: true,
};

#[derive(Debug, Clone)]
struct Received {
    connection: usize,
    command: Vec<String>,
}

/// Accepts any number of connections and records every command it reads.
struct FakeRedis {
    port: u16,
    received: Arc<Mutex<Vec<Received>>>,
    streams: Arc<Mutex<Vec<TcpStream>>>,
}

impl FakeRedis {
    fn start(script: Script) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let received = Arc::new(Mutex::new(Vec::new()));
        let streams = Arc::new(Mutex::new(Vec::new()));

        let (log, open) = (received.clone(), streams.clone());
        thread::spawn(move || {
            for (connection, stream) in listener.incoming().enumerate() {
                let Ok(stream) = stream else { return };
                open.lock().unwrap().push(stream.try_clone().unwrap());
                let log = log.clone();
                thread::spawn(move || serve(connection, stream, script, log));
            }
        });

        Self {
            port,
            received,
            streams,
        }
    }

    fn url(&self) -> String {
        format!("redis://127.0.0.1:{}", self.port)
    }

    /// Connections that sent `<verb> <arg>`, in arrival order.
    fn connections_sending(&self, verb: &str, arg: &str) -> Vec<usize> {
        self.received
            .lock()
            .unwrap()
            .iter()
            .filter(|r| {
                r.command.first().is_some_and(|v| v.eq_ignore_ascii_case(verb))
                    && r.command.get(1).is_some_and(|a| a == arg)
            })
            .map(|r| r.connection)
            .collect()
    }

    fn count(&self, verb: &str) -> usize {
        self.received
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.command.first().is_some_and(|v| v.eq_ignore_ascii_case(verb)))
            .count()
    }

    /// Server-side close of every connection accepted so far.
    fn drop_connections(&self) {
        for stream in self.streams.lock().unwrap().iter() {
            let _ = stream.shutdown(Shutdown::Both);
        }
    }
}

fn serve(connection: usize, stream: TcpStream, script: Script, log: Arc<Mutex<Vec<Received>>>) {
    let Ok(mut writer) = stream.try_clone() else {
        return;
    };
    let mut reader = BufReader::new(stream);

    while let Some(command) = read_command(&mut reader) {
        let verb = command.first().map(|v| v.to_ascii_uppercase()).unwrap_or_default();
        let reply = match verb.as_str() {
            "SUBSCRIBE" => command[1..]
                .iter()
                .enumerate()
                .map(|(i, channel)| {
                    format!(
                        "*3\r\n$9\r\nsubscribe\r\n${}\r\n{}\r\n:{}\r\n",
                        channel.len(),
                        channel,
                        i + 1
                    )
                })
                .collect(),
            "PING" if script.answer_ping => "*2\r\n$4\r\npong\r\n$0\r\n\r\n".to_string(),
            "PUBLISH" if script.answer_publish => ":0\r\n".to_string(),
            "PING" | "PUBLISH" => String::new(),
            _ => "+OK\r\n".to_string(),
        };
        log.lock().unwrap().push(Received {
            connection,
            command,
        });
        if !reply.is_empty() && writer.write_all(reply.as_bytes()).is_err() {
            return;
        }
    }
}

fn read_command(reader: &mut impl BufRead) -> Option<Vec<String>> {
    let count: usize = read_line(reader)?.strip_prefix('*')?.parse().ok()?;
    (0..count)
        .map(|_| {
            let len: usize = read_line(reader)?.strip_prefix('$')?.parse().ok()?;
            let mut buf = vec![0; len + 2];
            reader.read_exact(&mut buf).ok()?;
            buf.truncate(len);
            String::from_utf8(buf).ok()
        })
        .collect()
}

fn read_line(reader: &mut impl BufRead) -> Option<String> {
    let mut line = String::new();
    match reader.read_line(&mut line) {
        Ok(0) | Err(_) => None,
        Ok(_) => Some(line.trim_end().to_string()),
    }
}

fn policy(max_attempts: u32) -> ReconnectPolicy {
    ReconnectPolicy {
        max_attempts,
        base_delay: Duration::from_millis(10),
        max_delay: Duration::from_millis(50),
    }
}

fn start(transport: &RedisTransport) {
    let (tx, _rx) = mpsc::unbounded_channel();
    transport
        .start(Inbound::new(ServiceName::new("billing").unwrap(), tx))
        .unwrap();
}

fn approval() -> EstimationApproved {
    EstimationApproved {
        estimation_id: "EST-3".to_string(),
        project_id: "P-3".to_string(),
        project_name: "Cold storage".to_string(),
        approved_by: "dina".to_string(),
        approved_at: Utc.with_ymd_and_hms(2025, 4, 2, 8, 0, 0).unwrap(),
        total_amount: 125_000_000.0,
    }
}

async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    let waited = tokio::time::timeout(Duration::from_secs(10), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await;
    assert!(waited.is_ok(), "timed out waiting for {what}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn resubscribes_every_channel_after_the_connection_drops() {
    let redis = FakeRedis::start(HEALTHY);
    // Fewer attempts than drops: only a counter reset on success keeps it alive.
    let transport = RedisTransport::new(redis.url(), "erp", policy(2)).unwrap();
    start(&transport);
    transport.subscribe(EventName::InvoiceCreated).unwrap();
    transport.subscribe(EventName::CustomerCreated).unwrap();

    let invoices = "erp:events:invoice:created";
    let customers = "erp:events:customer:created";
    eventually("initial subscriptions", || {
        redis.connections_sending("SUBSCRIBE", invoices).len() == 1
            && redis.connections_sending("SUBSCRIBE", customers).len() == 1
    })
    .await;

    for round in 2..=4 {
        redis.drop_connections();
        eventually("resubscription", || {
            redis.connections_sending("SUBSCRIBE", invoices).len() == round
                && redis.connections_sending("SUBSCRIBE", customers).len() == round
        })
        .await;
        eventually("subscriber connected", || {
            transport.status().subscriber == ConnectionState::Connected
        })
        .await;
    }

    let mut sessions = redis.connections_sending("SUBSCRIBE", invoices);
    sessions.dedup();
    assert_eq!(sessions.len(), 4, "each session subscribes on its own connection");
    assert_eq!(
        redis.connections_sending("SUBSCRIBE", customers),
        redis.connections_sending("SUBSCRIBE", invoices)
    );

    transport.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unanswered_publish_times_out_and_replaces_the_connection() {
    let redis = FakeRedis::start(Script {
        answer_publish: false,
        answer_ping: true,
    });
    let transport = RedisTransport::new(redis.url(), "erp", policy(3))
        .unwrap()
        .with_publish_timeout(Some(Duration::from_millis(200)));
    start(&transport);
    eventually("publisher connected", || {
        transport.status().publisher == ConnectionState::Connected
    })
    .await;

    let envelope = EventEnvelope::build(approval(), ServiceName::new("billing").unwrap());
    let channel = "erp:events:estimation:approved";

    let first = tokio::time::timeout(Duration::from_secs(5), transport.publish(&envelope))
        .await
        .expect("publish must give up on a silent broker");
    assert!(matches!(first, Err(TransportError::Timeout(_))));

    eventually("publisher reconnected", || {
        transport.status().publisher == ConnectionState::Connected
    })
    .await;
    let second = tokio::time::timeout(Duration::from_secs(5), transport.publish(&envelope))
        .await
        .expect("publish must give up on a silent broker");
    assert!(matches!(second, Err(TransportError::Timeout(_))));

    let publishers = redis.connections_sending("PUBLISH", channel);
    assert_eq!(publishers.len(), 2);
    assert_ne!(publishers[0], publishers[1], "stalled connection must be replaced");

    transport.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn publish_returns_when_the_broker_goes_silent() {
    let redis = FakeRedis::start(Script {
        answer_publish: false,
        answer_ping: true,
    });
    let transport = Arc::new(RedisTransport::new(redis.url(), "erp", policy(3)).unwrap());
    let bus = EventBus::builder(ServiceName::new("estimation-service").unwrap())
        .transport(transport.clone())
        .options(BusOptions {
            forward_timeout: Some(Duration::from_millis(200)),
            ..BusOptions::default()
        })
        .build();
    eventually("publisher connected", || {
        transport.status().publisher == ConnectionState::Connected
    })
    .await;

    let hits = Arc::new(AtomicUsize::new(0));
    let seen = hits.clone();
    bus.subscribe_fn(EventName::EstimationApproved, move |_env| {
        let seen = seen.clone();
        async move {
            seen.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    })
    .unwrap();

    let published = tokio::time::timeout(Duration::from_secs(5), bus.publish(approval())).await;
    assert!(matches!(published, Ok(Ok(_))), "publish blocked on the broker");
    assert_eq!(hits.load(Ordering::SeqCst), 1);

    bus.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unanswered_ping_replaces_the_subscriber_connection() {
    let redis = FakeRedis::start(Script {
        answer_publish: true,
        answer_ping: false,
    });
    let transport = RedisTransport::new(redis.url(), "erp", policy(3))
        .unwrap()
        .with_health_check_interval(Duration::from_millis(300));
    start(&transport);
    transport.subscribe(EventName::InvoiceCreated).unwrap();

    let invoices = "erp:events:invoice:created";
    eventually("subscriber replaced after silent ping", || {
        redis.connections_sending("SUBSCRIBE", invoices).len() >= 2
    })
    .await;

    let sessions = redis.connections_sending("SUBSCRIBE", invoices);
    assert_ne!(sessions[0], sessions[1]);
    assert!(redis.count("PING") >= 1);
    assert_ne!(transport.status().subscriber, ConnectionState::Failed);

    transport.close().await;
}
