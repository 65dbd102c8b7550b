use rebus_core::IntegrationEvent;
use rebus_macros::integration_event;

#[integration_event]
pub struct TenantCreated {
    pub name: String,
}

fn main() {
    let ev = TenantCreated {
        id: uuid::Uuid::new_v4(),
        occurred_at: chrono::Utc::now(),
        name: "acme".into(),
    };
    assert_eq!(ev.event_type(), "TenantCreated");
    let _ = ev.clone();
}
