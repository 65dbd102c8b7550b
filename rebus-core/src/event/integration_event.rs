use chrono::{DateTime, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;

/// 集成事件需要满足的通用能力边界
///
/// 事件一经创建即不可变；事件类型名同时作为路由键使用，
/// 通常由 `#[integration_event]` 宏根据结构体名称生成。
pub trait IntegrationEvent: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// 事件类型名（路由键）
    const EVENT_TYPE: &'static str;

    /// 事件唯一标识（同时作为消息 message-id）
    fn event_id(&self) -> uuid::Uuid;

    /// 事件发生时间
    fn occurred_at(&self) -> DateTime<Utc>;

    fn event_type(&self) -> &'static str {
        Self::EVENT_TYPE
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use uuid::Uuid;

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct TenantCreated {
        id: Uuid,
        occurred_at: DateTime<Utc>,
        name: String,
    }

    impl IntegrationEvent for TenantCreated {
        const EVENT_TYPE: &'static str = "TenantCreated";

        fn event_id(&self) -> Uuid {
            self.id
        }

        fn occurred_at(&self) -> DateTime<Utc> {
            self.occurred_at
        }
    }

    #[test]
    fn event_type_defaults_to_associated_const() {
        let ev = TenantCreated {
            id: Uuid::new_v4(),
            occurred_at: Utc::now(),
            name: "acme".into(),
        };
        assert_eq!(ev.event_type(), "TenantCreated");
    }
}
