use rebus_core::IntegrationEvent;
use rebus_macros::integration_event;
use serde::{Deserialize, Serialize};

#[integration_event]
#[derive(Debug, Serialize, Deserialize)]
struct UserRenamed {
    to: String,
    occurred_at: chrono::DateTime<chrono::Utc>,
    id: uuid::Uuid,
}

fn main() {
    let id = uuid::Uuid::new_v4();
    let ev = UserRenamed {
        id,
        occurred_at: chrono::Utc::now(),
        to: "bob".into(),
    };
    assert_eq!(ev.event_id(), id);
}
