//! AMQP 0-9-1 传输实现（基于 lapin，feature `amqp`）
//!
//! 连接错误经 `on_error` 转为 `LinkObserver::on_shutdown`。
//! lapin 不提供 `connection.blocked` / `connection.unblocked` 的回调，
//! 因此该实现不会触发 `on_blocked` / `on_unblocked`：broker 阻塞期间发布会等待
//! publisher confirm，直到解除阻塞或连接断开。
//!
use super::broker::{
    BrokerChannel, BrokerLink, BrokerTransport, Delivery, DeliveryAcker, DeliveryStream,
    LinkObserver,
};
use super::error::{ErrorClass, TransportError, TransportResult};
use super::message::{InboundMessage, OutboundMessage};
use crate::config::Settings;
use crate::error::BusResult;
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions, BasicQosOptions,
    ConfirmSelectOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::{FieldTable, ShortString};
use lapin::{BasicProperties, Connection, ConnectionProperties, ExchangeKind};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

type ObserverSlot = Arc<Mutex<Option<Arc<dyn LinkObserver>>>>;

/// 按 lapin 错误种类划分可重试性
pub fn classify(err: &lapin::Error) -> ErrorClass {
    match err {
        lapin::Error::IOError(_)
        | lapin::Error::InvalidConnectionState(_)
        | lapin::Error::InvalidChannelState(_)
        | lapin::Error::MissingHeartbeatError => ErrorClass::Transient,
        _ => ErrorClass::Fatal,
    }
}

fn map_err(err: lapin::Error) -> TransportError {
    TransportError::new(classify(&err), err.to_string())
}

/// AMQP 连接工厂
pub struct AmqpTransport {
    uri: String,
    connect_timeout: Duration,
}

impl AmqpTransport {
    pub fn new(settings: &Settings) -> BusResult<Self> {
        Ok(Self {
            uri: settings.amqp_uri()?,
            connect_timeout: Duration::from_secs(settings.connection_timeout_secs),
        })
    }

    pub fn from_uri(uri: impl Into<String>, connect_timeout: Duration) -> Self {
        Self {
            uri: uri.into(),
            connect_timeout,
        }
    }
}

#[async_trait]
impl BrokerTransport for AmqpTransport {
    async fn connect(&self) -> TransportResult<Arc<dyn BrokerLink>> {
        let connecting = Connection::connect(&self.uri, ConnectionProperties::default());
        let conn = tokio::time::timeout(self.connect_timeout, connecting)
            .await
            .map_err(|_| {
                TransportError::transient(format!(
                    "connect timed out after {:?}",
                    self.connect_timeout
                ))
            })?
            .map_err(map_err)?;

        let observer: ObserverSlot = Arc::new(Mutex::new(None));
        let slot = observer.clone();
        conn.on_error(move |err| {
            let current = slot
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone();
            if let Some(observer) = current {
                observer.on_shutdown(&err.to_string());
            }
        });

        Ok(Arc::new(AmqpLink { conn, observer }))
    }
}

struct AmqpLink {
    conn: Connection,
    observer: ObserverSlot,
}

#[async_trait]
impl BrokerLink for AmqpLink {
    fn is_open(&self) -> bool {
        self.conn.status().connected()
    }

    fn set_observer(&self, observer: Arc<dyn LinkObserver>) {
        *self.observer.lock().unwrap_or_else(PoisonError::into_inner) = Some(observer);
    }

    async fn open_channel(&self) -> TransportResult<Box<dyn BrokerChannel>> {
        let channel = self.conn.create_channel().await.map_err(map_err)?;
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(map_err)?;
        Ok(Box::new(AmqpChannel { channel }))
    }

    async fn close(&self) {
        // 主动关闭前摘除观察者，避免被当作非预期断开
        self.observer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Err(err) = self.conn.close(200, "Bye").await {
            tracing::debug!(error = %err, "amqp connection close failed");
        }
    }
}

struct AmqpChannel {
    channel: lapin::Channel,
}

#[async_trait]
impl BrokerChannel for AmqpChannel {
    async fn declare_exchange(&self, exchange: &str) -> TransportResult<()> {
        self.channel
            .exchange_declare(
                exchange,
                ExchangeKind::Direct,
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(map_err)
    }

    async fn declare_queue(&self, queue: &str) -> TransportResult<()> {
        self.channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    durable: true,
                    exclusive: false,
                    auto_delete: false,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map(|_| ())
            .map_err(map_err)
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> TransportResult<()> {
        self.channel
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(map_err)
    }

    async fn unbind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> TransportResult<()> {
        self.channel
            .queue_unbind(queue, exchange, routing_key, FieldTable::default())
            .await
            .map_err(map_err)
    }

    async fn set_prefetch(&self, count: u16) -> TransportResult<()> {
        self.channel
            .basic_qos(count, BasicQosOptions::default())
            .await
            .map_err(map_err)
    }

    async fn publish(&self, exchange: &str, message: &OutboundMessage) -> TransportResult<()> {
        let delivery_mode = if message.persistent { 2 } else { 1 };
        let properties = BasicProperties::default()
            .with_delivery_mode(delivery_mode)
            .with_message_id(ShortString::from(message.message_id.clone()))
            .with_timestamp(message.timestamp)
            .with_content_type(ShortString::from(message.content_type.clone()));

        let confirm = self
            .channel
            .basic_publish(
                exchange,
                &message.routing_key,
                BasicPublishOptions::default(),
                &message.body,
                properties,
            )
            .await
            .map_err(map_err)?;

        let confirmation = confirm.await.map_err(map_err)?;
        if confirmation.is_nack() {
            return Err(TransportError::transient("publish was nacked by broker"));
        }
        Ok(())
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> TransportResult<DeliveryStream> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_ack: false,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(map_err)?;

        let deliveries = consumer.map(|item| item.map(into_delivery).map_err(map_err));
        Ok(Box::pin(deliveries))
    }

    async fn close(&self) {
        if let Err(err) = self.channel.close(200, "Bye").await {
            tracing::debug!(error = %err, "amqp channel close failed");
        }
    }
}

fn into_delivery(delivery: lapin::message::Delivery) -> Delivery {
    let message = InboundMessage {
        routing_key: delivery.routing_key.as_str().to_string(),
        message_id: delivery
            .properties
            .message_id()
            .as_ref()
            .map(|id| id.as_str().to_string()),
        timestamp: *delivery.properties.timestamp(),
        delivery_tag: delivery.delivery_tag,
        redelivered: delivery.redelivered,
        body: delivery.data,
    };
    Delivery::new(
        message,
        Box::new(AmqpAcker {
            acker: delivery.acker,
        }),
    )
}

struct AmqpAcker {
    acker: lapin::acker::Acker,
}

#[async_trait]
impl DeliveryAcker for AmqpAcker {
    async fn ack(&self) -> TransportResult<()> {
        self.acker
            .ack(BasicAckOptions::default())
            .await
            .map_err(map_err)
    }

    async fn nack(&self, requeue: bool) -> TransportResult<()> {
        self.acker
            .nack(BasicNackOptions {
                requeue,
                ..Default::default()
            })
            .await
            .map_err(map_err)
    }
}
