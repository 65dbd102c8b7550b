//! 事件总线统一错误定义
//!
//! 按照连接、发布、消费、订阅与配置划分最小必要集合：
//! - 基础设施类（连接不可用、消费者建立失败）由 `BrokerConnection`/`EventBus` 内部吸收；
//! - 仅编程错误（重复订阅、事件类型冲突）与显式要求的发布失败会返回给调用方。
//!
use crate::transport::TransportError;
use thiserror::Error;

/// 统一错误类型
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum BusError {
    // --- 连接 ---
    #[error("broker connection unavailable")]
    ConnectionUnavailable,
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    // --- 发布/消费 ---
    #[error("publish failed: event_type={event_type}, reason={reason}")]
    PublishFailed { event_type: String, reason: String },
    #[error("consumer setup failed: event_type={event_type}, reason={reason}")]
    ConsumerSetupFailed { event_type: String, reason: String },
    #[error("event handler error: handler={handler}, reason={reason}")]
    HandlerFailed { handler: String, reason: String },
    #[error("deserialization failed: event_type={event_type}, reason={reason}")]
    DeserializationFailed { event_type: String, reason: String },

    // --- 订阅 ---
    #[error("duplicate subscription: event_type={event_type}, handler={handler}")]
    DuplicateSubscription { event_type: String, handler: String },
    #[error("event type conflict: {event_type} is already registered by another type")]
    EventTypeConflict { event_type: String },

    // --- 序列化/配置/生命周期 ---
    #[error("serialization error: {source}")]
    Serialization {
        #[from]
        source: serde_json::Error,
    },
    #[error("invalid config: {reason}")]
    Config { reason: String },
    #[error("event bus has been shut down")]
    ShutDown,
}

/// 统一 Result 类型别名
pub type BusResult<T> = Result<T, BusError>;

impl BusError {
    pub(crate) fn consumer_setup(event_type: impl Into<String>, reason: impl ToString) -> Self {
        BusError::ConsumerSetupFailed {
            event_type: event_type.into(),
            reason: reason.to_string(),
        }
    }
}

impl From<config::ConfigError> for BusError {
    fn from(err: config::ConfigError) -> Self {
        BusError::Config {
            reason: err.to_string(),
        }
    }
}
