#![allow(dead_code)]

use async_trait::async_trait;
use rebus_core::connection::BackoffPolicy;
use rebus_core::transport::InMemoryBroker;
use rebus_core::{
    BrokerConnection, ConnectionConfig, EventBus, EventBusConfig, IntegrationEventHandler,
};
use rebus_macros::integration_event;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[integration_event]
pub struct Ping {
    pub seq: u32,
}

#[integration_event]
pub struct Pong {
    pub seq: u32,
}

impl Ping {
    pub fn new(seq: u32) -> Self {
        Self {
            id: uuid::Uuid::new_v4(),
            occurred_at: chrono::Utc::now(),
            seq,
        }
    }
}

impl Pong {
    pub fn new(seq: u32) -> Self {
        Self {
            id: uuid::Uuid::new_v4(),
            occurred_at: chrono::Utc::now(),
            seq,
        }
    }
}

pub fn fast_connection_config() -> ConnectionConfig {
    ConnectionConfig::builder()
        .reconnect_interval(Duration::from_millis(50))
        .health_check_interval(Duration::from_millis(50))
        .retry_count(2)
        .backoff(BackoffPolicy::new(
            Duration::from_millis(10),
            2.0,
            Duration::from_millis(40),
        ))
        .build()
}

pub fn fast_bus_config() -> EventBusConfig {
    EventBusConfig::builder()
        .exchange_name("test_exchange")
        .queue_name("test_queue")
        .consumer_watch_interval(Duration::from_millis(20))
        .consumer_watch_timeout(Duration::from_secs(5))
        .replay_delay(Duration::from_millis(1))
        .build()
}

pub fn bus_with(
    broker: &InMemoryBroker,
    connection_config: ConnectionConfig,
    bus_config: EventBusConfig,
) -> EventBus {
    let connection = BrokerConnection::new(Arc::new(broker.clone()), connection_config);
    EventBus::new(connection, bus_config)
}

pub fn fast_bus(broker: &InMemoryBroker) -> EventBus {
    bus_with(broker, fast_connection_config(), fast_bus_config())
}

/// 轮询直到条件成立，最多等待 10 秒
pub async fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
    tokio::time::timeout(Duration::from_secs(10), async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .is_ok()
}

/// 记录调用的处理器；可配置前 N 次调用失败
pub struct Recorder {
    name: String,
    calls: AtomicUsize,
    fail_first: AtomicUsize,
    seen: Mutex<Vec<uuid::Uuid>>,
}

impl Recorder {
    pub fn new(name: &str) -> Arc<Self> {
        Self::failing(name, 0)
    }

    pub fn failing(name: &str, failures: usize) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            calls: AtomicUsize::new(0),
            fail_first: AtomicUsize::new(failures),
            seen: Mutex::new(Vec::new()),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn seen(&self) -> Vec<uuid::Uuid> {
        self.seen.lock().unwrap().clone()
    }

    fn record(&self, id: uuid::Uuid) -> anyhow::Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen.lock().unwrap().push(id);
        let remaining = self.fail_first.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_first.store(remaining - 1, Ordering::SeqCst);
            anyhow::bail!("{} failed on purpose", self.name);
        }
        Ok(())
    }
}

#[async_trait]
impl IntegrationEventHandler<Ping> for Recorder {
    fn handler_name(&self) -> &str {
        &self.name
    }

    async fn handle(&self, event: &Ping) -> anyhow::Result<()> {
        self.record(event.id)
    }
}

#[async_trait]
impl IntegrationEventHandler<Pong> for Recorder {
    fn handler_name(&self) -> &str {
        &self.name
    }

    async fn handle(&self, event: &Pong) -> anyhow::Result<()> {
        self.record(event.id)
    }
}
