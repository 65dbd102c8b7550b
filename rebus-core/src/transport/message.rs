//! 线路消息形态
//!
//! 消息体为事件的 UTF-8 JSON 编码；元数据包含持久化投递标记、
//! message-id（事件 ID）、时间戳（事件发生时间，秒）与 content-type。
//!
use crate::event::IntegrationEvent;
use serde::{Deserialize, Serialize};

pub const CONTENT_TYPE_JSON: &str = "application/json";

/// 待发布消息（已序列化，可进入待发缓冲区并原样重放）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundMessage {
    /// 路由键，即事件类型名
    pub routing_key: String,
    /// message-id，即事件 ID
    pub message_id: String,
    /// 事件发生时间（Unix 秒）
    pub timestamp: u64,
    pub content_type: String,
    /// 是否持久化投递（delivery-mode = 2）
    pub persistent: bool,
    pub body: Vec<u8>,
}

impl OutboundMessage {
    /// 将集成事件编码为线路消息
    pub fn from_event<E: IntegrationEvent>(event: &E) -> Result<Self, serde_json::Error> {
        let body = serde_json::to_vec(event)?;
        Ok(Self {
            routing_key: E::EVENT_TYPE.to_string(),
            message_id: event.event_id().to_string(),
            timestamp: u64::try_from(event.occurred_at().timestamp()).unwrap_or_default(),
            content_type: CONTENT_TYPE_JSON.to_string(),
            persistent: true,
            body,
        })
    }
}

/// 收到的消息
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub routing_key: String,
    pub message_id: Option<String>,
    pub timestamp: Option<u64>,
    pub delivery_tag: u64,
    /// broker 是否标记为重投
    pub redelivered: bool,
    pub body: Vec<u8>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, TimeZone, Utc};
    use serde::Deserialize;
    use uuid::Uuid;

    #[derive(Debug, Serialize, Deserialize)]
    struct CustomerRegistered {
        id: Uuid,
        occurred_at: DateTime<Utc>,
        email: String,
    }

    impl IntegrationEvent for CustomerRegistered {
        const EVENT_TYPE: &'static str = "CustomerRegistered";

        fn event_id(&self) -> Uuid {
            self.id
        }

        fn occurred_at(&self) -> DateTime<Utc> {
            self.occurred_at
        }
    }

    #[test]
    fn outbound_message_carries_event_metadata() {
        let id = Uuid::new_v4();
        let occurred_at = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let ev = CustomerRegistered {
            id,
            occurred_at,
            email: "a@b.c".into(),
        };

        let msg = OutboundMessage::from_event(&ev).unwrap();

        assert_eq!(msg.routing_key, "CustomerRegistered");
        assert_eq!(msg.message_id, id.to_string());
        assert_eq!(msg.timestamp, occurred_at.timestamp() as u64);
        assert_eq!(msg.content_type, CONTENT_TYPE_JSON);
        assert!(msg.persistent);

        let body: serde_json::Value = serde_json::from_slice(&msg.body).unwrap();
        assert_eq!(body["email"], "a@b.c");
    }
}
