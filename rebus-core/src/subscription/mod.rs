//! 订阅（subscription）
//!
//! 处理器协议与订阅注册表。
//!
mod handler;
mod registry;

pub use handler::IntegrationEventHandler;
pub use registry::{DecodedEvent, EventTypeDescriptor, HandlerEntry, SubscriptionRegistry};
