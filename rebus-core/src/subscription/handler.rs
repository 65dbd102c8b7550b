//! 集成事件处理器（IntegrationEventHandler）
//!
use crate::event::IntegrationEvent;
use async_trait::async_trait;

/// 处理某一类集成事件
///
/// 投递语义为至少一次：同一事件可能被重复投递，实现需保证幂等。
#[async_trait]
pub trait IntegrationEventHandler<E: IntegrationEvent>: Send + Sync {
    /// 处理器名称（订阅身份：同一事件类型下唯一）
    fn handler_name(&self) -> &str;

    /// 处理事件；返回错误会导致消息重新入队
    async fn handle(&self, event: &E) -> anyhow::Result<()>;
}
