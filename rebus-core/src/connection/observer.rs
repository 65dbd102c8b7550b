use async_trait::async_trait;

/// 连接状态变化的观察者
///
/// 回调在检测到状态变化的任务上按注册顺序依次 await。
#[async_trait]
pub trait ConnectionObserver: Send + Sync {
    /// 建立了新的物理连接（包括首次连接）
    async fn on_reconnected(&self);

    /// 检测到连接丢失（非主动关闭）
    async fn on_connection_lost(&self) {}

    /// broker 解除了对发布的阻塞（连接未断开）
    async fn on_unblocked(&self) {}
}
