//! broker 协议（BrokerTransport / BrokerLink / BrokerChannel）
//!
//! 只定义能力边界，不绑定具体实现：`InMemoryBroker` 与 `AmqpTransport`（feature `amqp`）各自实现。
//!
use super::error::TransportResult;
use super::message::{InboundMessage, OutboundMessage};
use async_trait::async_trait;
use futures_core::stream::BoxStream;
use std::sync::Arc;

/// 连接工厂：每次调用尝试建立一条新的物理连接
#[async_trait]
pub trait BrokerTransport: Send + Sync {
    async fn connect(&self) -> TransportResult<Arc<dyn BrokerLink>>;
}

/// 连接事件观察者
///
/// 回调可能在传输库自己的线程上同步触发，实现方不得阻塞。
pub trait LinkObserver: Send + Sync {
    /// 连接被非预期关闭（网络中断、broker 关闭等）
    fn on_shutdown(&self, reason: &str);

    /// broker 因资源告警阻塞了发布
    fn on_blocked(&self, _reason: &str) {}

    fn on_unblocked(&self) {}
}

/// 一条存活的物理连接
#[async_trait]
pub trait BrokerLink: Send + Sync {
    fn is_open(&self) -> bool;

    /// 安装观察者（覆盖之前的观察者）
    fn set_observer(&self, observer: Arc<dyn LinkObserver>);

    async fn open_channel(&self) -> TransportResult<Box<dyn BrokerChannel>>;

    /// 主动关闭：不会触发观察者的 `on_shutdown`
    async fn close(&self);
}

pub type DeliveryStream = BoxStream<'static, TransportResult<Delivery>>;

/// 通道：声明拓扑、发布与消费
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    /// 声明持久化的 direct 交换机（幂等）
    async fn declare_exchange(&self, exchange: &str) -> TransportResult<()>;

    /// 声明持久化、非自动删除的队列（幂等）
    async fn declare_queue(&self, queue: &str) -> TransportResult<()>;

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str)
    -> TransportResult<()>;

    async fn unbind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> TransportResult<()>;

    /// 设置预取数量（未确认消息上限）
    async fn set_prefetch(&self, count: u16) -> TransportResult<()>;

    /// 发布消息，返回前等待 broker 接收
    async fn publish(&self, exchange: &str, message: &OutboundMessage) -> TransportResult<()>;

    /// 以手动确认模式消费队列
    async fn consume(&self, queue: &str, consumer_tag: &str) -> TransportResult<DeliveryStream>;

    async fn close(&self);
}

/// 单条投递的确认句柄
#[async_trait]
pub trait DeliveryAcker: Send + Sync {
    async fn ack(&self) -> TransportResult<()>;
    async fn nack(&self, requeue: bool) -> TransportResult<()>;
}

/// 一次投递：消息 + 确认句柄
pub struct Delivery {
    message: InboundMessage,
    acker: Box<dyn DeliveryAcker>,
}

impl Delivery {
    pub fn new(message: InboundMessage, acker: Box<dyn DeliveryAcker>) -> Self {
        Self { message, acker }
    }

    pub fn message(&self) -> &InboundMessage {
        &self.message
    }

    pub async fn ack(self) -> TransportResult<()> {
        self.acker.ack().await
    }

    pub async fn nack(self, requeue: bool) -> TransportResult<()> {
        self.acker.nack(requeue).await
    }
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("message", &self.message)
            .finish_non_exhaustive()
    }
}
