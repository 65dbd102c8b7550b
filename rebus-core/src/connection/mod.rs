//! broker 连接（BrokerConnection）
//!
//! 持有唯一的逻辑连接，负责：
//! - `try_connect`：幂等、可并发调用的单次连接尝试，失败不抛出，转交重连定时器；
//! - 重连定时器：每个周期内按 `BackoffPolicy` 有限次重试，成功后停止并通知观察者；
//! - 健康检查定时器：发现传输层未上报的静默断连；
//! - 传输层的非预期关闭通知一律走与检测到的故障相同的恢复路径；
//! - broker 的阻塞/解除阻塞通知记录为 `blocked` 状态，解除时通知观察者。
//!
//! 定时器与状态归实例所有，`close` 或实例释放时一并停止。
//!
mod backoff;
mod observer;
mod timer;

pub use backoff::BackoffPolicy;
pub use observer::ConnectionObserver;

use crate::error::{BusError, BusResult};
use crate::transport::{BrokerChannel, BrokerLink, BrokerTransport, LinkObserver};
use bon::Builder;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// 连接配置
#[derive(Debug, Clone, Builder)]
pub struct ConnectionConfig {
    /// 重连定时器周期
    #[builder(default = Duration::from_secs(10))]
    pub reconnect_interval: Duration,
    /// 健康检查周期
    #[builder(default = Duration::from_secs(30))]
    pub health_check_interval: Duration,
    /// 每个重连周期内的尝试次数
    #[builder(default = 3)]
    pub retry_count: u32,
    #[builder(default)]
    pub backoff: BackoffPolicy,
    /// 关闭后仅显式 `try_connect` 会重新建立连接
    #[builder(default = true)]
    pub automatic_recovery: bool,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// 连接状态快照
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectionState {
    pub connected: bool,
    pub connecting: bool,
    /// broker 因资源告警暂停接收发布
    pub blocked: bool,
}

#[derive(Clone)]
pub struct BrokerConnection {
    inner: Arc<ConnectionInner>,
}

struct LinkSlot {
    generation: u64,
    link: Arc<dyn BrokerLink>,
}

struct ConnectionInner {
    transport: Arc<dyn BrokerTransport>,
    config: ConnectionConfig,
    // 连接/重连/断开的状态转换都在此锁内完成
    connect_lock: tokio::sync::Mutex<()>,
    link: RwLock<Option<LinkSlot>>,
    connected: AtomicBool,
    connecting: AtomicBool,
    blocked: AtomicBool,
    generation: AtomicU64,
    reconnect_timer: Mutex<Option<CancellationToken>>,
    reconnect_in_flight: AtomicBool,
    health_check: Mutex<Option<CancellationToken>>,
    observers: RwLock<Vec<Arc<dyn ConnectionObserver>>>,
    shutdown: CancellationToken,
}

impl Drop for ConnectionInner {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl BrokerConnection {
    pub fn new(transport: Arc<dyn BrokerTransport>, config: ConnectionConfig) -> Self {
        Self {
            inner: Arc::new(ConnectionInner {
                transport,
                config,
                connect_lock: tokio::sync::Mutex::new(()),
                link: RwLock::new(None),
                connected: AtomicBool::new(false),
                connecting: AtomicBool::new(false),
                blocked: AtomicBool::new(false),
                generation: AtomicU64::new(0),
                reconnect_timer: Mutex::new(None),
                reconnect_in_flight: AtomicBool::new(false),
                health_check: Mutex::new(None),
                observers: RwLock::new(Vec::new()),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.inner.config
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState {
            connected: self.inner.connected.load(Ordering::SeqCst),
            connecting: self.inner.connecting.load(Ordering::SeqCst),
            blocked: self.inner.blocked.load(Ordering::SeqCst),
        }
    }

    /// 已连接但 broker 暂停接收发布
    pub fn is_blocked(&self) -> bool {
        self.inner.blocked.load(Ordering::SeqCst)
    }

    /// 已建立过的物理连接数（每次成功连接加一）
    pub fn generation(&self) -> u64 {
        self.inner.generation.load(Ordering::SeqCst)
    }

    pub fn reconnect_timer_active(&self) -> bool {
        lock(&self.inner.reconnect_timer).is_some()
    }

    /// 注册观察者（可注册多个，按注册顺序依次回调）
    pub fn add_observer(&self, observer: Arc<dyn ConnectionObserver>) {
        self.inner
            .observers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(observer);
    }

    /// 尝试连接一次
    ///
    /// 已连接时直接返回 true；失败时启动重连定时器并返回 false，从不返回错误。
    #[instrument(skip(self))]
    pub async fn try_connect(&self) -> bool {
        if self.is_closed() {
            return false;
        }

        let guard = self.inner.connect_lock.lock().await;
        if self.is_connected() {
            return true;
        }

        match self.connect_once().await {
            Ok(()) => {
                drop(guard);
                self.notify_reconnected().await;
                true
            }
            Err(err) => {
                drop(guard);
                if err.is_transient() {
                    warn!(error = %err, class = ?err.class(), "broker connect failed");
                } else {
                    error!(error = %err, class = ?err.class(), "broker connect failed");
                }
                self.start_reconnect_timer();
                false
            }
        }
    }

    /// 打开一个新通道；未连接时立即返回 `ConnectionUnavailable`
    pub async fn create_channel(&self) -> BusResult<Box<dyn BrokerChannel>> {
        if self.is_closed() {
            return Err(BusError::ShutDown);
        }
        let link = match self.current_slot() {
            Some((_, link)) if self.is_connected() => link,
            _ => return Err(BusError::ConnectionUnavailable),
        };
        Ok(link.open_channel().await?)
    }

    /// 上报一次传输失败；若当前物理连接已关闭，则按断连处理
    pub async fn report_failure(&self) {
        if let Some((generation, link)) = self.current_slot()
            && !link.is_open()
        {
            self.handle_connection_lost(Some(generation)).await;
        }
    }

    /// 关闭连接：停止所有定时器，主动关闭物理连接，不触发恢复
    pub async fn close(&self) {
        self.inner.shutdown.cancel();
        let slot = {
            let _guard = self.inner.connect_lock.lock().await;
            self.inner.connected.store(false, Ordering::SeqCst);
            self.inner.blocked.store(false, Ordering::SeqCst);
            self.inner
                .link
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .take()
        };
        lock(&self.inner.reconnect_timer).take();
        lock(&self.inner.health_check).take();

        if let Some(slot) = slot {
            slot.link.close().await;
        }
        info!("broker connection closed");
    }

    fn current_slot(&self) -> Option<(u64, Arc<dyn BrokerLink>)> {
        self.inner
            .link
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|slot| (slot.generation, slot.link.clone()))
    }

    // 调用方须持有 connect_lock
    async fn connect_once(&self) -> crate::transport::TransportResult<()> {
        self.inner.connecting.store(true, Ordering::SeqCst);
        let result = self.inner.transport.connect().await;
        self.inner.connecting.store(false, Ordering::SeqCst);

        let link = result?;
        self.install(link);
        Ok(())
    }

    fn install(&self, link: Arc<dyn BrokerLink>) {
        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;

        *self
            .inner
            .link
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(LinkSlot {
            generation,
            link: link.clone(),
        });
        link.set_observer(Arc::new(LinkWatch {
            connection: Arc::downgrade(&self.inner),
            generation,
            runtime: Handle::current(),
        }));

        self.inner.blocked.store(false, Ordering::SeqCst);
        self.inner.connected.store(true, Ordering::SeqCst);
        self.stop_reconnect_timer();
        self.ensure_health_check();
        info!(generation, "broker connection established");
    }

    async fn handle_connection_lost(&self, expected_generation: Option<u64>) {
        if self.is_closed() {
            return;
        }

        let slot = {
            let _guard = self.inner.connect_lock.lock().await;
            let mut current = self
                .inner
                .link
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            let matches = current
                .as_ref()
                .is_some_and(|s| expected_generation.is_none_or(|g| g == s.generation));
            if !matches {
                // 已被处理过或已替换为新连接
                return;
            }
            self.inner.blocked.store(false, Ordering::SeqCst);
            self.inner.connected.store(false, Ordering::SeqCst);
            current.take()
        };

        if let Some(slot) = slot {
            warn!(generation = slot.generation, "broker connection lost");
            slot.link.close().await;
        }

        self.notify_connection_lost().await;
        self.start_reconnect_timer();
    }

    fn start_reconnect_timer(&self) {
        if !self.inner.config.automatic_recovery || self.is_closed() {
            return;
        }

        let mut timer = lock(&self.inner.reconnect_timer);
        if timer.is_some() {
            return;
        }

        let token = self.inner.shutdown.child_token();
        let period = self.inner.config.reconnect_interval;
        let weak = Arc::downgrade(&self.inner);
        timer::spawn_periodic(token.clone(), period, move || {
            let weak = weak.clone();
            async move {
                if let Some(inner) = weak.upgrade() {
                    BrokerConnection { inner }.reconnect_tick().await;
                }
            }
        });
        *timer = Some(token);
        info!(interval = ?period, "reconnection timer started");
    }

    fn stop_reconnect_timer(&self) {
        if let Some(token) = lock(&self.inner.reconnect_timer).take() {
            token.cancel();
            debug!("reconnection timer stopped");
        }
    }

    fn ensure_health_check(&self) {
        let mut health = lock(&self.inner.health_check);
        if health.is_some() || self.is_closed() {
            return;
        }

        let token = self.inner.shutdown.child_token();
        let weak = Arc::downgrade(&self.inner);
        timer::spawn_periodic(
            token.clone(),
            self.inner.config.health_check_interval,
            move || {
                let weak = weak.clone();
                async move {
                    if let Some(inner) = weak.upgrade() {
                        BrokerConnection { inner }.health_tick().await;
                    }
                }
            },
        );
        *health = Some(token);
    }

    async fn health_tick(&self) {
        if let Some((generation, link)) = self.current_slot()
            && !link.is_open()
        {
            warn!(generation, "health check found a closed broker connection");
            self.handle_connection_lost(Some(generation)).await;
        }
    }

    #[instrument(skip(self))]
    async fn reconnect_tick(&self) {
        if self.inner.reconnect_in_flight.swap(true, Ordering::SeqCst) {
            debug!("reconnection already in flight");
            return;
        }
        let reconnected = self.reconnect_with_backoff().await;
        self.inner.reconnect_in_flight.store(false, Ordering::SeqCst);

        if reconnected {
            self.notify_reconnected().await;
        }
    }

    async fn reconnect_with_backoff(&self) -> bool {
        let attempts = self.inner.config.retry_count.max(1);

        for attempt in 1..=attempts {
            if self.is_closed() {
                return false;
            }

            {
                let _guard = self.inner.connect_lock.lock().await;
                if self.is_connected() {
                    // 其他路径已经连上并完成了通知
                    self.stop_reconnect_timer();
                    return false;
                }

                match self.connect_once().await {
                    Ok(()) => {
                        info!(attempt, "reconnected to broker");
                        return true;
                    }
                    Err(err) if !err.is_transient() => {
                        error!(attempt, error = %err, "fatal error while reconnecting");
                        return false;
                    }
                    Err(err) => {
                        warn!(attempt, attempts, error = %err, "reconnection attempt failed");
                    }
                }
            }

            if attempt < attempts {
                let delay = self.inner.config.backoff.delay(attempt);
                tokio::select! {
                    _ = self.inner.shutdown.cancelled() => return false,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
        false
    }

    fn observers(&self) -> Vec<Arc<dyn ConnectionObserver>> {
        self.inner
            .observers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    async fn notify_reconnected(&self) {
        for observer in self.observers() {
            observer.on_reconnected().await;
        }
    }

    async fn notify_connection_lost(&self) {
        for observer in self.observers() {
            observer.on_connection_lost().await;
        }
    }

    async fn notify_unblocked(&self) {
        for observer in self.observers() {
            observer.on_unblocked().await;
        }
    }

    // 只接受当前物理连接上报的阻塞状态
    fn set_blocked(&self, generation: u64, blocked: bool) -> bool {
        if self.generation() != generation || !self.is_connected() {
            return false;
        }
        self.inner.blocked.swap(blocked, Ordering::SeqCst) != blocked
    }
}

/// 安装到物理连接上的观察者：把非预期关闭转为断连处理
struct LinkWatch {
    connection: Weak<ConnectionInner>,
    generation: u64,
    runtime: Handle,
}

impl LinkObserver for LinkWatch {
    fn on_shutdown(&self, reason: &str) {
        warn!(reason, generation = self.generation, "broker connection shut down unexpectedly");
        let Some(inner) = self.connection.upgrade() else {
            return;
        };
        let connection = BrokerConnection { inner };
        let generation = self.generation;
        self.runtime.spawn(async move {
            connection.handle_connection_lost(Some(generation)).await;
        });
    }

    fn on_blocked(&self, reason: &str) {
        warn!(reason, generation = self.generation, "broker connection blocked");
        if let Some(inner) = self.connection.upgrade() {
            BrokerConnection { inner }.set_blocked(self.generation, true);
        }
    }

    fn on_unblocked(&self) {
        info!(generation = self.generation, "broker connection unblocked");
        let Some(inner) = self.connection.upgrade() else {
            return;
        };
        let connection = BrokerConnection { inner };
        if connection.set_blocked(self.generation, false) {
            self.runtime.spawn(async move {
                connection.notify_unblocked().await;
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::InMemoryBroker;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct CountingObserver {
        reconnected: AtomicUsize,
        lost: AtomicUsize,
        unblocked: AtomicUsize,
    }

    #[async_trait]
    impl ConnectionObserver for CountingObserver {
        async fn on_reconnected(&self) {
            self.reconnected.fetch_add(1, Ordering::SeqCst);
        }

        async fn on_connection_lost(&self) {
            self.lost.fetch_add(1, Ordering::SeqCst);
        }

        async fn on_unblocked(&self) {
            self.unblocked.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn fast_config() -> ConnectionConfig {
        ConnectionConfig::builder()
            .reconnect_interval(Duration::from_millis(50))
            .health_check_interval(Duration::from_millis(50))
            .retry_count(2)
            .backoff(BackoffPolicy::new(
                Duration::from_millis(10),
                2.0,
                Duration::from_millis(40),
            ))
            .build()
    }

    fn connection(broker: &InMemoryBroker, config: ConnectionConfig) -> BrokerConnection {
        BrokerConnection::new(Arc::new(broker.clone()), config)
    }

    async fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !cond() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .is_ok()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn try_connect_is_idempotent_and_notifies_once() {
        let broker = InMemoryBroker::new();
        let conn = connection(&broker, fast_config());
        let observer = Arc::new(CountingObserver::default());
        conn.add_observer(observer.clone());

        assert!(conn.try_connect().await);
        assert!(conn.try_connect().await);

        assert!(conn.is_connected());
        assert_eq!(
            conn.state(),
            ConnectionState {
                connected: true,
                connecting: false,
                blocked: false,
            }
        );
        assert_eq!(broker.connect_attempts(), 1);
        assert_eq!(observer.reconnected.load(Ordering::SeqCst), 1);
        assert!(!conn.reconnect_timer_active());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn failed_connect_recovers_through_timer() {
        let broker = InMemoryBroker::unavailable();
        let conn = connection(&broker, fast_config());
        let observer = Arc::new(CountingObserver::default());
        conn.add_observer(observer.clone());

        assert!(!conn.try_connect().await);
        assert!(!conn.is_connected());
        assert!(conn.reconnect_timer_active());
        assert!(matches!(
            conn.create_channel().await,
            Err(BusError::ConnectionUnavailable)
        ));

        broker.start();
        assert!(wait_until(|| conn.is_connected()).await);
        assert!(wait_until(|| observer.reconnected.load(Ordering::SeqCst) == 1).await);
        assert!(!conn.reconnect_timer_active());
        assert!(conn.create_channel().await.is_ok());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn unexpected_shutdown_triggers_recovery() {
        let broker = InMemoryBroker::new();
        let conn = connection(&broker, fast_config());
        let observer = Arc::new(CountingObserver::default());
        conn.add_observer(observer.clone());
        assert!(conn.try_connect().await);

        broker.stop();
        assert!(wait_until(|| !conn.is_connected()).await);
        assert!(wait_until(|| observer.lost.load(Ordering::SeqCst) == 1).await);

        broker.start();
        assert!(wait_until(|| observer.reconnected.load(Ordering::SeqCst) == 2).await);
        assert_eq!(conn.generation(), 2);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn health_check_detects_silent_disconnect() {
        let broker = InMemoryBroker::new();
        let conn = connection(&broker, fast_config());
        let observer = Arc::new(CountingObserver::default());
        conn.add_observer(observer.clone());
        assert!(conn.try_connect().await);

        broker.sever_silently();

        assert!(wait_until(|| observer.lost.load(Ordering::SeqCst) == 1).await);
        assert!(wait_until(|| observer.reconnected.load(Ordering::SeqCst) == 2).await);
        assert!(conn.is_connected());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn disabled_automatic_recovery_never_retries() {
        let broker = InMemoryBroker::unavailable();
        let config = ConnectionConfig::builder()
            .reconnect_interval(Duration::from_millis(20))
            .automatic_recovery(false)
            .build();
        let conn = connection(&broker, config);

        assert!(!conn.try_connect().await);
        assert!(!conn.reconnect_timer_active());
        broker.start();
        tokio::time::sleep(Duration::from_millis(150)).await;

        assert!(!conn.is_connected());
        assert_eq!(broker.connect_attempts(), 1);
        assert!(conn.try_connect().await);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn close_stops_recovery() {
        let broker = InMemoryBroker::new();
        let conn = connection(&broker, fast_config());
        assert!(conn.try_connect().await);

        conn.close().await;
        broker.stop();
        broker.start();
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert!(!conn.is_connected());
        assert_eq!(broker.connect_attempts(), 1);
        assert!(!conn.try_connect().await);
        assert!(matches!(conn.create_channel().await, Err(BusError::ShutDown)));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn blocked_state_follows_broker_notifications() {
        let broker = InMemoryBroker::new();
        let conn = connection(&broker, fast_config());
        let observer = Arc::new(CountingObserver::default());
        conn.add_observer(observer.clone());
        assert!(conn.try_connect().await);

        broker.block("memory alarm");
        assert!(conn.is_blocked());
        assert!(conn.state().connected && conn.state().blocked);

        broker.unblock();
        assert!(!conn.is_blocked());
        assert!(wait_until(|| observer.unblocked.load(Ordering::SeqCst) == 1).await);

        // 未处于阻塞时的解除通知不再回调
        broker.unblock();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(observer.unblocked.load(Ordering::SeqCst), 1);

        broker.block("disk alarm");
        broker.stop();
        assert!(wait_until(|| !conn.is_connected()).await);
        assert!(!conn.is_blocked());
    }

    fn slow_retry_config() -> ConnectionConfig {
        ConnectionConfig::builder()
            .reconnect_interval(Duration::from_secs(10))
            .health_check_interval(Duration::from_secs(60))
            .retry_count(3)
            .backoff(BackoffPolicy::new(
                Duration::from_secs(1),
                2.0,
                Duration::from_secs(30),
            ))
            .build()
    }

    #[tokio::test(start_paused = true)]
    async fn each_reconnect_tick_spends_retry_count_attempts_with_backoff() {
        let broker = InMemoryBroker::unavailable();
        let conn = connection(&broker, slow_retry_config());
        let start = tokio::time::Instant::now();
        let at = |secs: f64| tokio::time::sleep_until(start + Duration::from_secs_f64(secs));

        assert!(!conn.try_connect().await);
        assert_eq!(broker.connect_attempts(), 1);
        assert!(conn.reconnect_timer_active());

        // 第一个周期：t=10 首次尝试，随后退避 1s、2s
        at(10.5).await;
        assert_eq!(broker.connect_attempts(), 2);
        at(11.5).await;
        assert_eq!(broker.connect_attempts(), 3);
        at(12.5).await;
        assert_eq!(broker.connect_attempts(), 3);
        at(13.5).await;
        assert_eq!(broker.connect_attempts(), 4);

        // 本周期次数用尽，等待下一个周期
        at(19.5).await;
        assert_eq!(broker.connect_attempts(), 4);
        at(20.5).await;
        assert_eq!(broker.connect_attempts(), 5);
        at(29.5).await;
        assert_eq!(broker.connect_attempts(), 7);

        broker.start();
        at(30.5).await;
        assert!(conn.is_connected());
        assert_eq!(broker.connect_attempts(), 8);
        assert!(!conn.reconnect_timer_active());
    }

    #[tokio::test(start_paused = true)]
    async fn overlapping_reconnect_ticks_run_a_single_cycle() {
        let broker = InMemoryBroker::unavailable();
        let config = ConnectionConfig {
            automatic_recovery: false,
            ..slow_retry_config()
        };
        let conn = connection(&broker, config);

        tokio::join!(conn.reconnect_tick(), conn.reconnect_tick());
        assert_eq!(broker.connect_attempts(), 3);

        // 上一周期结束后允许再次进入
        conn.reconnect_tick().await;
        assert_eq!(broker.connect_attempts(), 6);
        assert!(!conn.is_connected());
    }
}
