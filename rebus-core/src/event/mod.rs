//! 集成事件（Integration Event）
//!
//! 定义跨服务传递的事件需要实现的最小接口（`IntegrationEvent`），
//! 以及事件在线路上的编码形态（见 `transport::OutboundMessage`）。

mod integration_event;

pub use integration_event::IntegrationEvent;
