//! 事件总线（EventBus）
//!
//! 组合连接、订阅注册表与待发缓冲区，对外提供发布/订阅/退订：
//! - 发布：已连接则立即发布到持久化 direct 交换机；未连接、broker 阻塞或发布失败则进入待发缓冲区；
//! - 订阅：先写入注册表，已连接则创建消费者，否则由后台观察任务等待连接后创建；
//! - 重连：销毁全部消费者，按注册表重建，再在后台重放缓冲区中未过期的事件；
//! - 解除阻塞：在后台重放缓冲区；
//! - 断连：销毁全部消费者，等待下一次重连重建。
//!
//! 消费者集合与注册表的修改在同一把锁内完成，保证“应当消费”与“正在消费”一致。
//!
mod consumer;

use crate::buffer::{PendingEvent, PendingEventBuffer};
use crate::connection::{BrokerConnection, ConnectionObserver};
use crate::error::{BusError, BusResult};
use crate::event::IntegrationEvent;
use crate::subscription::{IntegrationEventHandler, SubscriptionRegistry};
use crate::transport::OutboundMessage;
use async_trait::async_trait;
use bon::Builder;
use consumer::{ConsumerWorker, LoopExit};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, instrument, warn};

/// 事件总线配置
#[derive(Debug, Clone, Builder)]
pub struct EventBusConfig {
    #[builder(into, default = String::from("rebus_event_bus"))]
    pub exchange_name: String,
    /// 本进程消费使用的持久化队列
    #[builder(into, default = String::from("rebus_events"))]
    pub queue_name: String,
    /// 重连后是否重建消费者
    #[builder(default = true)]
    pub topology_recovery: bool,
    #[builder(default = crate::buffer::DEFAULT_CAPACITY)]
    pub pending_capacity: usize,
    #[builder(default = crate::buffer::DEFAULT_TTL)]
    pub pending_ttl: Duration,
    /// 订阅观察任务的轮询周期
    #[builder(default = Duration::from_secs(5))]
    pub consumer_watch_interval: Duration,
    /// 订阅观察任务的最长等待时间，超时后静默退出
    #[builder(default = Duration::from_secs(300))]
    pub consumer_watch_timeout: Duration,
    /// 重放缓冲事件时的间隔
    #[builder(default = Duration::from_millis(100))]
    pub replay_delay: Duration,
    /// 发布失败（已缓冲）时是否仍向调用方返回 `PublishFailed`
    #[builder(default = false)]
    pub propagate_publish_errors: bool,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

struct BusInner {
    connection: BrokerConnection,
    config: EventBusConfig,
    registry: Arc<SubscriptionRegistry>,
    consumers: tokio::sync::Mutex<HashMap<String, ConsumerWorker>>,
    buffer: PendingEventBuffer,
    shutdown: CancellationToken,
    tasks: TaskTracker,
    watching: Mutex<HashSet<String>>,
    next_worker_id: AtomicU64,
}

impl Drop for BusInner {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl EventBus {
    /// 创建总线并注册为连接观察者（不会主动连接，见 `StartupCoordinator`）
    pub fn new(connection: BrokerConnection, config: EventBusConfig) -> Self {
        let inner = Arc::new(BusInner {
            buffer: PendingEventBuffer::new(config.pending_capacity, config.pending_ttl),
            connection,
            config,
            registry: Arc::new(SubscriptionRegistry::new()),
            consumers: tokio::sync::Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
            tasks: TaskTracker::new(),
            watching: Mutex::new(HashSet::new()),
            next_worker_id: AtomicU64::new(0),
        });

        inner.connection.add_observer(Arc::new(BusObserver {
            bus: Arc::downgrade(&inner),
        }));
        Self { inner }
    }

    pub fn connection(&self) -> &BrokerConnection {
        &self.inner.connection
    }

    pub fn config(&self) -> &EventBusConfig {
        &self.inner.config
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connection.is_connected()
    }

    pub fn pending_len(&self) -> usize {
        self.inner.buffer.len()
    }

    /// 当前拥有消费者的事件类型（已排序）
    pub async fn active_consumers(&self) -> Vec<String> {
        let mut types: Vec<String> = self.inner.consumers.lock().await.keys().cloned().collect();
        types.sort();
        types
    }

    pub fn subscribed_event_types(&self) -> BTreeSet<String> {
        self.inner.registry.all_subscribed_event_types()
    }

    pub fn handler_names(&self, event_type: &str) -> Vec<String> {
        self.inner.registry.handler_names_for(event_type)
    }

    /// 预先注册事件类型的解码函数（无需订阅）
    pub fn register_event_type<E: IntegrationEvent>(&self) -> BusResult<()> {
        self.inner.registry.register_event_type::<E>()
    }

    pub fn add_connection_observer(&self, observer: Arc<dyn ConnectionObserver>) {
        self.inner.connection.add_observer(observer);
    }

    /// 发布事件
    ///
    /// 未连接时进入待发缓冲区并返回 `Ok`；发布失败时同样先缓冲，
    /// 仅在缓冲不可用或配置了 `propagate_publish_errors` 时返回 `PublishFailed`。
    #[instrument(skip_all, fields(event_type = E::EVENT_TYPE, event_id = %event.event_id()))]
    pub async fn publish<E: IntegrationEvent>(&self, event: &E) -> BusResult<()> {
        if self.inner.shutdown.is_cancelled() {
            return Err(BusError::ShutDown);
        }
        let message = OutboundMessage::from_event(event)?;
        self.publish_message(message).await
    }

    async fn publish_message(&self, message: OutboundMessage) -> BusResult<()> {
        let state = self.inner.connection.state();
        if !state.connected || state.blocked {
            let condition = if state.connected { "blocked" } else { "disconnected" };
            return match self.buffer(message) {
                Ok(()) => {
                    debug!(condition, "broker unavailable for publishing, event buffered");
                    Ok(())
                }
                Err(event_type) => Err(BusError::PublishFailed {
                    event_type,
                    reason: format!("broker {condition} and pending buffer is disabled"),
                }),
            };
        }

        let err = match self.send(&message).await {
            Ok(()) => {
                debug!("event published");
                return Ok(());
            }
            Err(err) => err,
        };

        let event_type = message.routing_key.clone();
        warn!(error = %err, "publish failed, event buffered");
        let buffered = self.buffer(message).is_ok();

        let transient = match &err {
            BusError::Transport(e) => e.is_transient(),
            BusError::ConnectionUnavailable => true,
            _ => false,
        };
        if transient {
            self.inner.connection.report_failure().await;
        }

        if !buffered || self.inner.config.propagate_publish_errors {
            return Err(BusError::PublishFailed {
                event_type,
                reason: err.to_string(),
            });
        }
        Ok(())
    }

    // 每次发布使用独立通道
    async fn send(&self, message: &OutboundMessage) -> BusResult<()> {
        let exchange = &self.inner.config.exchange_name;
        let channel = self.inner.connection.create_channel().await?;
        let result = async {
            channel.declare_exchange(exchange).await?;
            channel.publish(exchange, message).await
        }
        .await;
        channel.close().await;
        Ok(result?)
    }

    // 返回 Err(event_type) 表示缓冲不可用、事件被丢弃
    fn buffer(&self, message: OutboundMessage) -> Result<(), String> {
        if self.inner.buffer.capacity() == 0 {
            warn!(event_type = %message.routing_key, "pending buffer disabled, event dropped");
            return Err(message.routing_key);
        }
        if let Some(evicted) = self.inner.buffer.enqueue(PendingEvent::new(message)) {
            warn!(
                evicted_event_id = evicted.event_id(),
                evicted_event_type = %evicted.event_type,
                "pending buffer full, oldest event evicted"
            );
        }
        Ok(())
    }

    /// 订阅事件；同一事件类型下重名处理器返回 `DuplicateSubscription`
    #[instrument(skip_all, fields(event_type = E::EVENT_TYPE, handler = handler.handler_name()))]
    pub async fn subscribe<E, H>(&self, handler: Arc<H>) -> BusResult<()>
    where
        E: IntegrationEvent,
        H: IntegrationEventHandler<E> + 'static,
    {
        if self.inner.shutdown.is_cancelled() {
            return Err(BusError::ShutDown);
        }

        let mut consumers = self.inner.consumers.lock().await;
        self.inner.registry.add::<E, H>(handler)?;
        info!("handler subscribed");

        if consumers.contains_key(E::EVENT_TYPE) {
            return Ok(());
        }

        if self.is_connected() {
            match self.start_consumer(E::EVENT_TYPE).await {
                Ok(worker) => {
                    consumers.insert(E::EVENT_TYPE.to_string(), worker);
                    info!("consumer started");
                }
                Err(err) => {
                    warn!(error = %err, "consumer setup failed, watching for connection");
                    self.spawn_watcher(E::EVENT_TYPE);
                }
            }
        } else {
            debug!("broker disconnected, watching for connection");
            self.spawn_watcher(E::EVENT_TYPE);
        }
        Ok(())
    }

    /// 退订处理器；返回是否确实移除了该处理器
    pub async fn unsubscribe<E, H>(&self, handler: &H) -> bool
    where
        E: IntegrationEvent,
        H: IntegrationEventHandler<E>,
    {
        self.unsubscribe_by_name(E::EVENT_TYPE, handler.handler_name())
            .await
    }

    /// 按事件类型与处理器名称退订；最后一个处理器移除后解除绑定并销毁消费者
    #[instrument(skip(self))]
    pub async fn unsubscribe_by_name(&self, event_type: &str, handler_name: &str) -> bool {
        let mut consumers = self.inner.consumers.lock().await;
        let removed = self.inner.registry.remove(event_type, handler_name);
        if !removed || self.inner.registry.has_subscriptions(event_type) {
            return removed;
        }

        let (exchange, queue) = (
            self.inner.config.exchange_name.as_str(),
            self.inner.config.queue_name.as_str(),
        );
        match consumers.remove(event_type) {
            Some(worker) => worker.dispose(Some((queue, exchange))).await,
            None if self.is_connected() => {
                // 绑定可能残留自之前的连接
                if let Ok(channel) = self.inner.connection.create_channel().await {
                    if let Err(err) = channel.unbind_queue(queue, exchange, event_type).await {
                        warn!(error = %err, "unbind failed");
                    }
                    channel.close().await;
                }
            }
            None => {}
        }
        info!("last handler removed, consumer disposed");
        removed
    }

    /// 关闭：取消观察任务，销毁消费者，关闭连接（之后发布返回 `ShutDown`）
    pub async fn shutdown(&self) {
        if self.inner.shutdown.is_cancelled() {
            return;
        }
        self.inner.shutdown.cancel();
        self.inner.tasks.close();

        {
            let mut consumers = self.inner.consumers.lock().await;
            dispose_all(&mut consumers).await;
        }
        self.inner.connection.close().await;
        self.inner.tasks.wait().await;
        info!(pending = self.pending_len(), "event bus shut down");
    }

    async fn start_consumer(&self, event_type: &str) -> BusResult<ConsumerWorker> {
        let channel = self
            .inner
            .connection
            .create_channel()
            .await
            .map_err(|err| BusError::consumer_setup(event_type, err))?;

        let id = self.inner.next_worker_id.fetch_add(1, Ordering::SeqCst) + 1;
        let (worker, deliveries) = ConsumerWorker::open(
            channel,
            &self.inner.config.exchange_name,
            &self.inner.config.queue_name,
            event_type,
            id,
            &self.inner.shutdown,
        )
        .await?;

        let weak = Arc::downgrade(&self.inner);
        let registry = self.inner.registry.clone();
        let token = worker.token();
        let event_type = event_type.to_string();
        self.inner.tasks.spawn(async move {
            let exit = consumer::receive_loop(deliveries, registry, token).await;
            if exit == LoopExit::StreamEnded
                && let Some(inner) = weak.upgrade()
            {
                EventBus { inner }.consumer_stopped(&event_type, id).await;
            }
        });
        Ok(worker)
    }

    // 消费流意外结束：移除自身，并在仍有订阅时重新等待创建
    // 物理连接已断开时交给断连流程统一处理，由重连重建
    async fn consumer_stopped(&self, event_type: &str, id: u64) {
        self.inner.connection.report_failure().await;
        if !self.is_connected() {
            return;
        }

        let mut consumers = self.inner.consumers.lock().await;
        if !consumers.get(event_type).is_some_and(|w| w.id() == id) {
            return;
        }
        if let Some(worker) = consumers.remove(event_type) {
            worker.dispose(None).await;
        }
        drop(consumers);

        warn!(event_type, worker = id, "consumer stream ended");
        if self.inner.registry.has_subscriptions(event_type) {
            self.spawn_watcher(event_type);
        }
    }

    fn spawn_watcher(&self, event_type: &str) {
        if self.inner.shutdown.is_cancelled() {
            return;
        }
        if !self
            .inner
            .watching
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(event_type.to_string())
        {
            return;
        }

        let weak = Arc::downgrade(&self.inner);
        let token = self.inner.shutdown.clone();
        let interval = self.inner.config.consumer_watch_interval;
        let deadline = Instant::now() + self.inner.config.consumer_watch_timeout;
        let event_type = event_type.to_string();

        self.inner.tasks.spawn(async move {
            loop {
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                if (EventBus { inner }).try_activate(&event_type).await {
                    break;
                }
                if Instant::now() >= deadline {
                    debug!(event_type, "consumer watcher expired");
                    break;
                }
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
            }

            if let Some(inner) = weak.upgrade() {
                inner
                    .watching
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .remove(&event_type);
            }
        });
    }

    // 返回 true 表示无需继续等待
    async fn try_activate(&self, event_type: &str) -> bool {
        if self.inner.shutdown.is_cancelled() || !self.inner.registry.has_subscriptions(event_type)
        {
            return true;
        }
        if !self.is_connected() {
            return false;
        }

        let mut consumers = self.inner.consumers.lock().await;
        if consumers.contains_key(event_type) || !self.inner.registry.has_subscriptions(event_type)
        {
            return true;
        }
        match self.start_consumer(event_type).await {
            Ok(worker) => {
                consumers.insert(event_type.to_string(), worker);
                info!(event_type, "consumer started by watcher");
                true
            }
            Err(err) => {
                warn!(event_type, error = %err, "consumer setup failed");
                false
            }
        }
    }

    #[instrument(skip(self))]
    async fn handle_reconnected(&self) {
        if self.inner.shutdown.is_cancelled() {
            return;
        }

        {
            let mut consumers = self.inner.consumers.lock().await;
            dispose_all(&mut consumers).await;

            if self.inner.config.topology_recovery {
                for event_type in self.inner.registry.all_subscribed_event_types() {
                    match self.start_consumer(&event_type).await {
                        Ok(worker) => {
                            consumers.insert(event_type, worker);
                        }
                        Err(err) => {
                            warn!(%event_type, error = %err, "consumer rebuild failed");
                            self.spawn_watcher(&event_type);
                        }
                    }
                }
                info!(consumers = consumers.len(), "consumers rebuilt");
            }
        }

        self.spawn_replay();
    }

    async fn handle_unblocked(&self) {
        if self.inner.shutdown.is_cancelled() || !self.is_connected() {
            return;
        }
        self.spawn_replay();
    }

    // 重放在后台进行，不阻塞连接回调
    fn spawn_replay(&self) {
        if self.inner.shutdown.is_cancelled() || self.inner.buffer.is_empty() {
            return;
        }
        let weak = Arc::downgrade(&self.inner);
        self.inner.tasks.spawn(async move {
            if let Some(inner) = weak.upgrade() {
                EventBus { inner }.replay_pending().await;
            }
        });
    }

    async fn handle_connection_lost(&self) {
        let mut consumers = self.inner.consumers.lock().await;
        if !consumers.is_empty() {
            warn!(consumers = consumers.len(), "connection lost, disposing consumers");
        }
        dispose_all(&mut consumers).await;
    }

    async fn replay_pending(&self) {
        let pending = self.inner.buffer.drain_valid();
        if pending.is_empty() {
            return;
        }
        info!(count = pending.len(), "replaying pending events");

        for (i, event) in pending.into_iter().enumerate() {
            if i > 0 {
                tokio::select! {
                    _ = self.inner.shutdown.cancelled() => return,
                    _ = tokio::time::sleep(self.inner.config.replay_delay) => {}
                }
            }
            let event_id = event.event_id().to_string();
            if let Err(err) = self.publish_message(event.message).await {
                warn!(event_id, error = %err, "replay failed");
            }
        }
    }
}

async fn dispose_all(consumers: &mut HashMap<String, ConsumerWorker>) {
    for (_, worker) in consumers.drain() {
        worker.dispose(None).await;
    }
}

struct BusObserver {
    bus: Weak<BusInner>,
}

#[async_trait]
impl ConnectionObserver for BusObserver {
    async fn on_reconnected(&self) {
        if let Some(inner) = self.bus.upgrade() {
            EventBus { inner }.handle_reconnected().await;
        }
    }

    async fn on_connection_lost(&self) {
        if let Some(inner) = self.bus.upgrade() {
            EventBus { inner }.handle_connection_lost().await;
        }
    }

    async fn on_unblocked(&self) {
        if let Some(inner) = self.bus.upgrade() {
            EventBus { inner }.handle_unblocked().await;
        }
    }
}
