//! 内存版 broker（InMemoryBroker）
//!
//! 在进程内模拟 broker 的最小语义，满足传输层协议：
//! - 持久化 direct 交换机 + 命名队列 + 路由键绑定；
//! - 手动确认消费：`prefetch` 限制未确认消息数，`nack(requeue)` 将消息放回队首并标记重投；
//! - 故障模拟：`stop`/`start` 模拟 broker 下线/恢复，`sever_silently` 模拟未被上报的断连；
//! - 记录发布、确认、重投，便于测试断言。
//!
//! 典型用途：测试环境、示例与本地开发。
//!
use super::broker::{
    BrokerChannel, BrokerLink, BrokerTransport, Delivery, DeliveryAcker, DeliveryStream,
    LinkObserver,
};
use super::error::{TransportError, TransportResult};
use super::message::{InboundMessage, OutboundMessage};
use async_trait::async_trait;
use futures_util::stream;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

// prefetch = 0 表示不限制
const UNBOUNDED_PREFETCH: usize = 1024;

/// 进程内 broker，克隆后共享同一份状态
#[derive(Clone)]
pub struct InMemoryBroker {
    state: Arc<BrokerState>,
}

struct BrokerState {
    available: AtomicBool,
    connect_attempts: AtomicUsize,
    next_link_id: AtomicU64,
    next_delivery_tag: AtomicU64,
    topology: Mutex<Topology>,
    links: Mutex<Vec<Arc<LinkShared>>>,
}

#[derive(Default)]
struct Topology {
    exchanges: HashSet<String>,
    queues: HashMap<String, QueueSlot>,
    bindings: HashSet<Binding>,
    published: Vec<OutboundMessage>,
    acked: Vec<String>,
    requeued: Vec<String>,
    discarded: Vec<String>,
}

#[derive(Clone, PartialEq, Eq, Hash)]
struct Binding {
    exchange: String,
    routing_key: String,
    queue: String,
}

#[derive(Default)]
struct QueueSlot {
    ready: VecDeque<StoredMessage>,
    notify: Arc<Notify>,
}

#[derive(Clone)]
struct StoredMessage {
    message: OutboundMessage,
    redelivered: bool,
}

struct LinkShared {
    id: u64,
    closed: CancellationToken,
    observer: Mutex<Option<Arc<dyn LinkObserver>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBroker {
    /// 创建一个处于可用状态的 broker
    pub fn new() -> Self {
        Self {
            state: Arc::new(BrokerState {
                available: AtomicBool::new(true),
                connect_attempts: AtomicUsize::new(0),
                next_link_id: AtomicU64::new(0),
                next_delivery_tag: AtomicU64::new(0),
                topology: Mutex::new(Topology::default()),
                links: Mutex::new(Vec::new()),
            }),
        }
    }

    /// 创建一个处于下线状态的 broker
    pub fn unavailable() -> Self {
        let broker = Self::new();
        broker.state.available.store(false, Ordering::SeqCst);
        broker
    }

    /// 下线：拒绝新连接，并以非预期关闭的方式断开所有现存连接
    pub fn stop(&self) {
        self.state.available.store(false, Ordering::SeqCst);
        self.sever_links(Some("broker stopped"));
    }

    /// 恢复：允许新连接（拓扑与队列中的消息保留）
    pub fn start(&self) {
        self.state.available.store(true, Ordering::SeqCst);
    }

    /// 断开所有连接但不通知观察者，模拟传输层未上报的静默断连
    pub fn sever_silently(&self) {
        self.sever_links(None);
    }

    /// 向所有连接的观察者发出阻塞通知
    pub fn block(&self, reason: &str) {
        for link in lock(&self.state.links).iter() {
            if let Some(observer) = lock(&link.observer).clone() {
                observer.on_blocked(reason);
            }
        }
    }

    pub fn unblock(&self) {
        for link in lock(&self.state.links).iter() {
            if let Some(observer) = lock(&link.observer).clone() {
                observer.on_unblocked();
            }
        }
    }

    pub fn is_available(&self) -> bool {
        self.state.available.load(Ordering::SeqCst)
    }

    /// 交换机接收过的全部消息（按接收顺序）
    pub fn published(&self) -> Vec<OutboundMessage> {
        lock(&self.state.topology).published.clone()
    }

    /// 已确认消息的 message-id（按确认顺序）
    pub fn acked(&self) -> Vec<String> {
        lock(&self.state.topology).acked.clone()
    }

    /// 被放回队列重投的 message-id
    pub fn requeued(&self) -> Vec<String> {
        lock(&self.state.topology).requeued.clone()
    }

    /// 被拒绝且未放回队列的 message-id
    pub fn discarded(&self) -> Vec<String> {
        lock(&self.state.topology).discarded.clone()
    }

    /// 队列上的绑定路由键（已排序）
    pub fn bindings(&self, queue: &str) -> Vec<String> {
        let topo = lock(&self.state.topology);
        let mut keys: Vec<String> = topo
            .bindings
            .iter()
            .filter(|b| b.queue == queue)
            .map(|b| b.routing_key.clone())
            .collect();
        keys.sort();
        keys
    }

    /// 队列中等待投递的消息数（不含已投递未确认的消息）
    pub fn queue_depth(&self, queue: &str) -> usize {
        lock(&self.state.topology)
            .queues
            .get(queue)
            .map(|q| q.ready.len())
            .unwrap_or(0)
    }

    pub fn connect_attempts(&self) -> usize {
        self.state.connect_attempts.load(Ordering::SeqCst)
    }

    pub fn open_links(&self) -> usize {
        lock(&self.state.links)
            .iter()
            .filter(|l| !l.closed.is_cancelled())
            .count()
    }

    fn sever_links(&self, reason: Option<&str>) {
        let links = std::mem::take(&mut *lock(&self.state.links));
        for link in links {
            link.closed.cancel();
            if let Some(reason) = reason {
                let observer = lock(&link.observer).clone();
                if let Some(observer) = observer {
                    observer.on_shutdown(reason);
                }
            }
        }
    }
}

#[async_trait]
impl BrokerTransport for InMemoryBroker {
    async fn connect(&self) -> TransportResult<Arc<dyn BrokerLink>> {
        self.state.connect_attempts.fetch_add(1, Ordering::SeqCst);

        if !self.is_available() {
            return Err(TransportError::transient(
                "connection refused: broker unreachable",
            ));
        }

        let shared = Arc::new(LinkShared {
            id: self.state.next_link_id.fetch_add(1, Ordering::SeqCst),
            closed: CancellationToken::new(),
            observer: Mutex::new(None),
        });
        lock(&self.state.links).push(shared.clone());

        Ok(Arc::new(InMemoryLink {
            state: self.state.clone(),
            shared,
        }))
    }
}

struct InMemoryLink {
    state: Arc<BrokerState>,
    shared: Arc<LinkShared>,
}

#[async_trait]
impl BrokerLink for InMemoryLink {
    fn is_open(&self) -> bool {
        !self.shared.closed.is_cancelled()
    }

    fn set_observer(&self, observer: Arc<dyn LinkObserver>) {
        *lock(&self.shared.observer) = Some(observer);
    }

    async fn open_channel(&self) -> TransportResult<Box<dyn BrokerChannel>> {
        if !self.is_open() {
            return Err(TransportError::transient("connection closed"));
        }

        Ok(Box::new(InMemoryChannel {
            state: self.state.clone(),
            closed: self.shared.closed.child_token(),
            prefetch: AtomicU16::new(0),
        }))
    }

    async fn close(&self) {
        self.shared.closed.cancel();
        let id = self.shared.id;
        lock(&self.state.links).retain(|l| l.id != id);
    }
}

struct InMemoryChannel {
    state: Arc<BrokerState>,
    closed: CancellationToken,
    prefetch: AtomicU16,
}

impl InMemoryChannel {
    fn ensure_open(&self) -> TransportResult<()> {
        if self.closed.is_cancelled() {
            Err(TransportError::transient("channel closed"))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl BrokerChannel for InMemoryChannel {
    async fn declare_exchange(&self, exchange: &str) -> TransportResult<()> {
        self.ensure_open()?;
        lock(&self.state.topology)
            .exchanges
            .insert(exchange.to_string());
        Ok(())
    }

    async fn declare_queue(&self, queue: &str) -> TransportResult<()> {
        self.ensure_open()?;
        lock(&self.state.topology)
            .queues
            .entry(queue.to_string())
            .or_default();
        Ok(())
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> TransportResult<()> {
        self.ensure_open()?;
        let mut topo = lock(&self.state.topology);
        if !topo.exchanges.contains(exchange) {
            return Err(TransportError::fatal(format!(
                "NOT_FOUND - no exchange '{exchange}'"
            )));
        }
        if !topo.queues.contains_key(queue) {
            return Err(TransportError::fatal(format!("NOT_FOUND - no queue '{queue}'")));
        }
        topo.bindings.insert(Binding {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            queue: queue.to_string(),
        });
        Ok(())
    }

    async fn unbind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> TransportResult<()> {
        self.ensure_open()?;
        lock(&self.state.topology).bindings.remove(&Binding {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            queue: queue.to_string(),
        });
        Ok(())
    }

    async fn set_prefetch(&self, count: u16) -> TransportResult<()> {
        self.ensure_open()?;
        self.prefetch.store(count, Ordering::SeqCst);
        Ok(())
    }

    async fn publish(&self, exchange: &str, message: &OutboundMessage) -> TransportResult<()> {
        self.ensure_open()?;

        let notifies: Vec<Arc<Notify>> = {
            let mut topo = lock(&self.state.topology);
            if !topo.exchanges.contains(exchange) {
                return Err(TransportError::fatal(format!(
                    "NOT_FOUND - no exchange '{exchange}'"
                )));
            }
            topo.published.push(message.clone());

            let targets: Vec<String> = topo
                .bindings
                .iter()
                .filter(|b| b.exchange == exchange && b.routing_key == message.routing_key)
                .map(|b| b.queue.clone())
                .collect();

            targets
                .iter()
                .filter_map(|queue| {
                    let slot = topo.queues.get_mut(queue)?;
                    slot.ready.push_back(StoredMessage {
                        message: message.clone(),
                        redelivered: false,
                    });
                    Some(slot.notify.clone())
                })
                .collect()
        };

        for notify in notifies {
            notify.notify_waiters();
        }
        Ok(())
    }

    async fn consume(&self, queue: &str, _consumer_tag: &str) -> TransportResult<DeliveryStream> {
        self.ensure_open()?;
        if !lock(&self.state.topology).queues.contains_key(queue) {
            return Err(TransportError::fatal(format!("NOT_FOUND - no queue '{queue}'")));
        }

        let permits = match self.prefetch.load(Ordering::SeqCst) {
            0 => UNBOUNDED_PREFETCH,
            n => n as usize,
        };
        let consumer = QueueConsumer {
            state: self.state.clone(),
            queue: queue.to_string(),
            closed: self.closed.clone(),
            permits: Arc::new(Semaphore::new(permits)),
        };

        let deliveries = stream::unfold(consumer, |consumer| async move {
            let delivery = consumer.next_delivery().await?;
            Some((Ok::<_, TransportError>(delivery), consumer))
        });
        Ok(Box::pin(deliveries))
    }

    async fn close(&self) {
        self.closed.cancel();
    }
}

enum QueuePoll {
    Ready(StoredMessage),
    Empty(Arc<Notify>),
    Gone,
}

struct QueueConsumer {
    state: Arc<BrokerState>,
    queue: String,
    closed: CancellationToken,
    permits: Arc<Semaphore>,
}

impl QueueConsumer {
    async fn next_delivery(&self) -> Option<Delivery> {
        let permit = tokio::select! {
            _ = self.closed.cancelled() => return None,
            permit = self.permits.clone().acquire_owned() => permit.ok()?,
        };

        loop {
            let notify = match self.poll_queue() {
                QueuePoll::Ready(stored) => return self.deliver(stored, permit),
                QueuePoll::Empty(notify) => notify,
                QueuePoll::Gone => return None,
            };

            // notify_waiters 对已创建的 Notified 生效，创建后再检查一次以免错过发布
            let notified = notify.notified();
            if let QueuePoll::Ready(stored) = self.poll_queue() {
                return self.deliver(stored, permit);
            }

            tokio::select! {
                _ = self.closed.cancelled() => return None,
                _ = notified => {}
            }
        }
    }

    fn poll_queue(&self) -> QueuePoll {
        let mut topo = lock(&self.state.topology);
        match topo.queues.get_mut(&self.queue) {
            Some(slot) => match slot.ready.pop_front() {
                Some(stored) => QueuePoll::Ready(stored),
                None => QueuePoll::Empty(slot.notify.clone()),
            },
            None => QueuePoll::Gone,
        }
    }

    fn deliver(&self, stored: StoredMessage, permit: OwnedSemaphorePermit) -> Option<Delivery> {
        if self.closed.is_cancelled() {
            push_front(&self.state, &self.queue, stored);
            return None;
        }

        let tag = self.state.next_delivery_tag.fetch_add(1, Ordering::SeqCst) + 1;
        let message = InboundMessage {
            routing_key: stored.message.routing_key.clone(),
            message_id: Some(stored.message.message_id.clone()),
            timestamp: Some(stored.message.timestamp),
            delivery_tag: tag,
            redelivered: stored.redelivered,
            body: stored.message.body.clone(),
        };

        let acker = InMemoryAcker {
            state: self.state.clone(),
            queue: self.queue.clone(),
            closed: self.closed.clone(),
            stored,
            settled: AtomicBool::new(false),
            permit: Mutex::new(Some(permit)),
        };
        Some(Delivery::new(message, Box::new(acker)))
    }
}

// 放回队首并唤醒等待中的消费者
fn push_front(state: &BrokerState, queue: &str, stored: StoredMessage) {
    let notify = {
        let mut topo = lock(&state.topology);
        match topo.queues.get_mut(queue) {
            Some(slot) => {
                slot.ready.push_front(stored);
                slot.notify.clone()
            }
            None => return,
        }
    };
    notify.notify_waiters();
}

struct InMemoryAcker {
    state: Arc<BrokerState>,
    queue: String,
    closed: CancellationToken,
    stored: StoredMessage,
    settled: AtomicBool,
    permit: Mutex<Option<OwnedSemaphorePermit>>,
}

impl InMemoryAcker {
    fn settle(&self) -> TransportResult<()> {
        if self.settled.swap(true, Ordering::SeqCst) {
            return Err(TransportError::fatal("PRECONDITION_FAILED - unknown delivery tag"));
        }
        Ok(())
    }

    fn release(&self) {
        lock(&self.permit).take();
    }

    fn requeue(&self) {
        lock(&self.state.topology)
            .requeued
            .push(self.stored.message.message_id.clone());
        let stored = StoredMessage {
            message: self.stored.message.clone(),
            redelivered: true,
        };
        push_front(&self.state, &self.queue, stored);
    }

    // 通道已关闭：broker 侧会把未确认消息放回队列
    fn reject_closed(&self) -> TransportResult<()> {
        self.requeue();
        self.release();
        Err(TransportError::transient("channel closed before settlement"))
    }
}

#[async_trait]
impl DeliveryAcker for InMemoryAcker {
    async fn ack(&self) -> TransportResult<()> {
        self.settle()?;
        if self.closed.is_cancelled() {
            return self.reject_closed();
        }
        lock(&self.state.topology)
            .acked
            .push(self.stored.message.message_id.clone());
        self.release();
        Ok(())
    }

    async fn nack(&self, requeue: bool) -> TransportResult<()> {
        self.settle()?;
        if self.closed.is_cancelled() {
            return self.reject_closed();
        }
        if requeue {
            self.requeue();
        } else {
            lock(&self.state.topology)
                .discarded
                .push(self.stored.message.message_id.clone());
        }
        self.release();
        Ok(())
    }
}

impl Drop for InMemoryAcker {
    fn drop(&mut self) {
        // 未确认即丢弃的投递回到队列
        if !self.settled.swap(true, Ordering::SeqCst) {
            self.requeue();
        }
    }
}
