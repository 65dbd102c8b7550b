use async_trait::async_trait;
use rebus_core::config::Settings;
use rebus_core::transport::BrokerTransport;
use rebus_core::{BrokerConnection, EventBus, IntegrationEvent, IntegrationEventHandler};
use rebus_macros::integration_event;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[integration_event]
struct OrderPlaced {
    order_no: String,
    amount_cents: i64,
}

#[integration_event(name = "billing.payment_captured")]
struct PaymentCaptured {
    order_no: String,
    amount_cents: i64,
}

impl OrderPlaced {
    fn new(order_no: &str, amount_cents: i64) -> Self {
        Self {
            id: uuid::Uuid::new_v4(),
            occurred_at: chrono::Utc::now(),
            order_no: order_no.to_string(),
            amount_cents,
        }
    }
}

impl PaymentCaptured {
    fn new(order_no: &str, amount_cents: i64) -> Self {
        Self {
            id: uuid::Uuid::new_v4(),
            occurred_at: chrono::Utc::now(),
            order_no: order_no.to_string(),
            amount_cents,
        }
    }
}

struct Shipping;

#[async_trait]
impl IntegrationEventHandler<OrderPlaced> for Shipping {
    fn handler_name(&self) -> &str {
        "shipping"
    }

    async fn handle(&self, event: &OrderPlaced) -> anyhow::Result<()> {
        info!(order_no = %event.order_no, "shipment scheduled");
        Ok(())
    }
}

/// 第一次收到某类事件时故意失败，用来演示重投
#[derive(Default)]
struct FlakyNotifier {
    calls: AtomicUsize,
}

#[async_trait]
impl IntegrationEventHandler<OrderPlaced> for FlakyNotifier {
    fn handler_name(&self) -> &str {
        "notifier"
    }

    async fn handle(&self, event: &OrderPlaced) -> anyhow::Result<()> {
        if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
            anyhow::bail!("mail gateway timed out for order {}", event.order_no);
        }
        info!(order_no = %event.order_no, "customer notified");
        Ok(())
    }
}

struct Ledger;

#[async_trait]
impl IntegrationEventHandler<PaymentCaptured> for Ledger {
    fn handler_name(&self) -> &str {
        "ledger"
    }

    async fn handle(&self, event: &PaymentCaptured) -> anyhow::Result<()> {
        info!(
            order_no = %event.order_no,
            amount_cents = event.amount_cents,
            "payment booked"
        );
        Ok(())
    }
}

async fn wire(settings: &Settings, transport: Arc<dyn BrokerTransport>) -> anyhow::Result<EventBus> {
    let connection = BrokerConnection::new(transport, settings.connection_config());
    let bus = EventBus::new(connection, settings.bus_config());

    bus.subscribe::<OrderPlaced, _>(Arc::new(Shipping)).await?;
    bus.subscribe::<OrderPlaced, _>(Arc::new(FlakyNotifier::default()))
        .await?;
    bus.subscribe::<PaymentCaptured, _>(Arc::new(Ledger)).await?;

    let outcome = settings.startup().run(bus.connection()).await;
    info!(?outcome, "startup finished");
    Ok(bus)
}

async fn settle(bus: &EventBus, timeout: Duration) {
    let deadline = tokio::time::Instant::now() + timeout;
    while (bus.pending_len() > 0 || !bus.is_connected()) && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

#[cfg(not(feature = "amqp"))]
async fn run(mut settings: Settings) -> anyhow::Result<()> {
    use rebus_core::transport::InMemoryBroker;

    // 内存 broker 下缩短各周期，便于观察
    settings.network_recovery_interval_secs = 1;
    settings.health_check_interval_secs = 1;
    settings.consumer_watch_interval_secs = 1;
    settings.startup_attempts = 2;
    settings.startup_delay_secs = 1;

    let broker = InMemoryBroker::unavailable();
    let bus = wire(&settings, Arc::new(broker.clone())).await?;

    info!("broker is down, publishing into the pending buffer");
    bus.publish(&OrderPlaced::new("A-1001", 4200)).await?;
    bus.publish(&PaymentCaptured::new("A-1001", 4200)).await?;
    info!(pending = bus.pending_len(), "events buffered");

    broker.start();
    settle(&bus, Duration::from_secs(10)).await;
    info!(
        consumers = ?bus.active_consumers().await,
        published = broker.published().len(),
        "broker back, buffer replayed"
    );

    broker.stop();
    tokio::time::sleep(Duration::from_millis(200)).await;
    bus.publish(&OrderPlaced::new("A-1002", 1999)).await?;
    broker.start();
    settle(&bus, Duration::from_secs(10)).await;

    tokio::time::sleep(Duration::from_millis(500)).await;
    info!(
        acked = broker.acked().len(),
        requeued = broker.requeued().len(),
        "deliveries settled"
    );

    bus.shutdown().await;
    Ok(())
}

#[cfg(feature = "amqp")]
async fn run(settings: Settings) -> anyhow::Result<()> {
    use rebus_core::transport::amqp::AmqpTransport;

    let transport = AmqpTransport::new(&settings)?;
    let bus = wire(&settings, Arc::new(transport)).await?;

    bus.publish(&OrderPlaced::new("A-1001", 4200)).await?;
    bus.publish(&PaymentCaptured::new("A-1001", 4200)).await?;
    if !bus.is_connected() {
        warn!(pending = bus.pending_len(), "broker unreachable, events kept for replay");
    }

    settle(&bus, Duration::from_secs(30)).await;
    tokio::time::sleep(Duration::from_secs(2)).await;
    bus.shutdown().await;
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let settings = Settings::load("rebus")?;
    info!(
        host = %settings.host,
        exchange = %settings.exchange_name,
        event_types = ?[OrderPlaced::EVENT_TYPE, PaymentCaptured::EVENT_TYPE],
        "demo starting"
    );
    if let Err(err) = run(settings).await {
        warn!(error = %err, "demo failed");
        return Err(err);
    }
    Ok(())
}
