//! 传输层（transport）
//!
//! 将 broker 抽象为三层协议，以便 `BrokerConnection`/`EventBus` 不绑定具体客户端库：
//! - `BrokerTransport`：建立物理连接；
//! - `BrokerLink`：一条存活的连接，可打开通道并上报关闭/阻塞通知；
//! - `BrokerChannel`：声明拓扑、发布消息、以手动确认方式消费。
//!
//! 底层错误统一映射为 `TransportError`，并按 `{Transient, Fatal}` 分类，
//! 调用方据此决定重试还是放弃，而不依赖具体库的异常类型。
//!
//! 内置实现：
//! - `InMemoryBroker`：进程内 broker，用于测试、示例与本地开发；
//! - `AmqpTransport`（`amqp` 特性）：基于 lapin 的 AMQP 0-9-1 适配。
//!
mod broker;
mod error;
mod inmemory;
mod message;

#[cfg(feature = "amqp")]
pub mod amqp;

pub use broker::{
    BrokerChannel, BrokerLink, BrokerTransport, Delivery, DeliveryAcker, DeliveryStream,
    LinkObserver,
};
pub use error::{ErrorClass, TransportError, TransportResult};
pub use inmemory::InMemoryBroker;
pub use message::{CONTENT_TYPE_JSON, InboundMessage, OutboundMessage};
