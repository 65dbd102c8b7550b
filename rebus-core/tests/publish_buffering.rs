mod common;

use common::{Ping, bus_with, fast_bus, fast_bus_config, fast_connection_config, wait_until};
use rebus_core::transport::InMemoryBroker;
use rebus_core::{BusError, ConnectionConfig, IntegrationEvent};
use std::time::Duration;

#[tokio::test(flavor = "multi_thread")]
async fn publish_while_connected_reaches_broker_once() {
    let broker = InMemoryBroker::new();
    let bus = fast_bus(&broker);
    assert!(bus.connection().try_connect().await);

    let event = Ping::new(1);
    bus.publish(&event).await.unwrap();

    let published = broker.published();
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].message_id, event.id.to_string());
    assert_eq!(published[0].routing_key, Ping::EVENT_TYPE);
    assert!(published[0].persistent);
    assert_eq!(published[0].content_type, "application/json");
    assert_eq!(bus.pending_len(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn outage_buffers_then_replays_after_reconnect() {
    let broker = InMemoryBroker::unavailable();
    let bus = fast_bus(&broker);
    assert!(!bus.connection().try_connect().await);

    let event = Ping::new(1);
    bus.publish(&event).await.unwrap();
    assert!(!bus.is_connected());
    assert_eq!(bus.pending_len(), 1);
    assert!(broker.published().is_empty());

    broker.start();

    let expected = event.id.to_string();
    assert!(wait_until(|| bus.pending_len() == 0 && !broker.published().is_empty()).await);
    assert!(bus.is_connected());

    let published = broker.published();
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].message_id, expected);
}

#[tokio::test(flavor = "multi_thread")]
async fn full_buffer_evicts_oldest_and_replays_in_order() {
    let broker = InMemoryBroker::unavailable();
    let mut config = fast_bus_config();
    config.pending_capacity = 3;
    let bus = bus_with(&broker, fast_connection_config(), config);
    assert!(!bus.connection().try_connect().await);

    let events: Vec<Ping> = (0..4).map(Ping::new).collect();
    for event in &events {
        bus.publish(event).await.unwrap();
    }
    assert_eq!(bus.pending_len(), 3);

    broker.start();
    assert!(wait_until(|| broker.published().len() == 3).await);
    assert!(wait_until(|| bus.pending_len() == 0).await);

    let replayed: Vec<String> = broker
        .published()
        .into_iter()
        .map(|m| m.message_id)
        .collect();
    let expected: Vec<String> = events[1..].iter().map(|e| e.id.to_string()).collect();
    assert_eq!(replayed, expected);
    assert!(!replayed.contains(&events[0].id.to_string()));
}

#[tokio::test(flavor = "multi_thread")]
async fn expired_pending_events_are_not_replayed() {
    let broker = InMemoryBroker::unavailable();
    let mut config = fast_bus_config();
    config.pending_ttl = Duration::from_millis(50);
    let bus = bus_with(
        &broker,
        ConnectionConfig::builder()
            .automatic_recovery(false)
            .build(),
        config,
    );
    assert!(!bus.connection().try_connect().await);

    bus.publish(&Ping::new(1)).await.unwrap();
    assert_eq!(bus.pending_len(), 1);
    tokio::time::sleep(Duration::from_millis(120)).await;

    broker.start();
    assert!(bus.connection().try_connect().await);

    assert!(wait_until(|| bus.pending_len() == 0).await);
    assert!(broker.published().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn failed_publish_is_buffered_and_swallowed_by_default() {
    let broker = InMemoryBroker::new();
    let connection_config = ConnectionConfig::builder()
        .reconnect_interval(Duration::from_millis(50))
        .health_check_interval(Duration::from_secs(60))
        .build();
    let bus = bus_with(&broker, connection_config, fast_bus_config());
    assert!(bus.connection().try_connect().await);

    // 连接在本地仍显示为已连接，但物理连接已断开
    broker.sever_silently();
    let event = Ping::new(1);
    bus.publish(&event).await.unwrap();

    let expected = event.id.to_string();
    assert!(
        wait_until(|| broker
            .published()
            .iter()
            .any(|m| m.message_id == expected))
        .await
    );
    assert!(wait_until(|| bus.pending_len() == 0).await);
    assert!(bus.is_connected());
}

#[tokio::test(flavor = "multi_thread")]
async fn failed_publish_is_reported_when_propagation_enabled() {
    let broker = InMemoryBroker::new();
    let connection_config = ConnectionConfig::builder()
        .automatic_recovery(false)
        .health_check_interval(Duration::from_secs(60))
        .build();
    let mut config = fast_bus_config();
    config.propagate_publish_errors = true;
    let bus = bus_with(&broker, connection_config, config);
    assert!(bus.connection().try_connect().await);

    broker.sever_silently();
    let err = bus.publish(&Ping::new(1)).await.unwrap_err();

    assert!(matches!(err, BusError::PublishFailed { ref event_type, .. } if event_type == "Ping"));
    assert_eq!(bus.pending_len(), 1);
    assert!(!bus.is_connected());
}

#[tokio::test(flavor = "multi_thread")]
async fn startup_gives_up_without_blocking_and_recovers_later() {
    let broker = InMemoryBroker::unavailable();
    let bus = fast_bus(&broker);

    let outcome = rebus_core::StartupCoordinator::builder()
        .attempts(3)
        .delay(Duration::from_millis(10))
        .build()
        .run(bus.connection())
        .await;
    assert!(!outcome.is_connected());
    assert!(broker.connect_attempts() >= 3);

    bus.publish(&Ping::new(7)).await.unwrap();
    broker.start();

    assert!(wait_until(|| bus.is_connected() && bus.pending_len() == 0).await);
    assert_eq!(broker.published().len(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn blocked_broker_buffers_until_unblocked() {
    let broker = InMemoryBroker::new();
    let bus = fast_bus(&broker);
    assert!(bus.connection().try_connect().await);

    broker.block("memory alarm");
    assert!(bus.connection().is_blocked());

    let first = Ping::new(1);
    let second = Ping::new(2);
    bus.publish(&first).await.unwrap();
    bus.publish(&second).await.unwrap();
    assert!(bus.is_connected());
    assert_eq!(bus.pending_len(), 2);
    assert!(broker.published().is_empty());

    broker.unblock();
    assert!(wait_until(|| bus.pending_len() == 0 && broker.published().len() == 2).await);

    let replayed: Vec<String> = broker
        .published()
        .into_iter()
        .map(|m| m.message_id)
        .collect();
    assert_eq!(replayed, vec![first.id.to_string(), second.id.to_string()]);
    assert_eq!(bus.connection().generation(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn blocked_broker_without_buffer_reports_publish_failure() {
    let broker = InMemoryBroker::new();
    let mut config = fast_bus_config();
    config.pending_capacity = 0;
    let bus = bus_with(&broker, fast_connection_config(), config);
    assert!(bus.connection().try_connect().await);

    broker.block("disk alarm");
    let err = bus.publish(&Ping::new(1)).await.unwrap_err();

    assert!(matches!(err, BusError::PublishFailed { ref reason, .. } if reason.contains("blocked")));
    assert!(broker.published().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn replay_does_not_hold_up_startup() {
    let broker = InMemoryBroker::unavailable();
    let mut config = fast_bus_config();
    config.replay_delay = Duration::from_millis(50);
    let bus = bus_with(
        &broker,
        ConnectionConfig::builder()
            .automatic_recovery(false)
            .build(),
        config,
    );
    assert!(!bus.connection().try_connect().await);

    for seq in 0..30 {
        bus.publish(&Ping::new(seq)).await.unwrap();
    }
    assert_eq!(bus.pending_len(), 30);

    broker.start();
    let started = std::time::Instant::now();
    let outcome = rebus_core::StartupCoordinator::builder()
        .attempts(1)
        .build()
        .run(bus.connection())
        .await;
    let elapsed = started.elapsed();

    assert!(outcome.is_connected());
    // 30 条事件逐条间隔 50ms 重放，至少需要 1.4s
    assert!(elapsed < Duration::from_millis(500), "startup took {elapsed:?}");
    assert!(broker.published().len() < 30);

    assert!(wait_until(|| broker.published().len() == 30).await);
    assert_eq!(bus.pending_len(), 0);
}
