//! 待发事件缓冲区（PendingEventBuffer）
//!
//! 有界、带过期时间的 FIFO：
//! - 入队时若已满，先淘汰最旧的条目；
//! - `drain_valid` 原子地取出全部条目，仅返回未过期的部分，过期条目静默丢弃；
//! - 纯内存、单进程，不跨进程重启保留。
//!
use crate::transport::OutboundMessage;
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

pub const DEFAULT_CAPACITY: usize = 1000;
pub const DEFAULT_TTL: Duration = Duration::from_secs(600);

/// 未能发布的事件（已编码）
#[derive(Debug, Clone)]
pub struct PendingEvent {
    pub message: OutboundMessage,
    pub event_type: String,
    pub enqueued_at: Instant,
}

impl PendingEvent {
    pub fn new(message: OutboundMessage) -> Self {
        Self {
            event_type: message.routing_key.clone(),
            message,
            enqueued_at: Instant::now(),
        }
    }

    pub fn event_id(&self) -> &str {
        &self.message.message_id
    }

    pub fn age(&self) -> Duration {
        self.enqueued_at.elapsed()
    }
}

#[derive(Debug)]
pub struct PendingEventBuffer {
    entries: Mutex<VecDeque<PendingEvent>>,
    capacity: usize,
    ttl: Duration,
}

impl Default for PendingEventBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY, DEFAULT_TTL)
    }
}

impl PendingEventBuffer {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            entries: Mutex::new(VecDeque::with_capacity(capacity.min(DEFAULT_CAPACITY))),
            capacity,
            ttl,
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<PendingEvent>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// 入队；返回因容量被淘汰的条目
    ///
    /// 容量为 0 时不保留任何条目，直接把传入的事件原样返回。
    pub fn enqueue(&self, event: PendingEvent) -> Option<PendingEvent> {
        if self.capacity == 0 {
            return Some(event);
        }

        let mut entries = self.lock();
        let evicted = if entries.len() >= self.capacity {
            entries.pop_front()
        } else {
            None
        };
        entries.push_back(event);
        evicted
    }

    /// 取出全部条目，返回未过期（age < ttl）的部分，保持入队顺序
    pub fn drain_valid(&self) -> Vec<PendingEvent> {
        let drained: Vec<PendingEvent> = self.lock().drain(..).collect();
        let total = drained.len();

        let valid: Vec<PendingEvent> = drained
            .into_iter()
            .filter(|p| p.age() < self.ttl)
            .collect();

        let expired = total - valid.len();
        if expired > 0 {
            tracing::warn!(expired, "discarded expired pending events");
        }
        valid
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }
}
