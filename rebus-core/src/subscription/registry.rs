//! 订阅注册表（SubscriptionRegistry）
//!
//! - 事件类型名 -> 处理器集合（同一事件类型下处理器名称唯一）；
//! - 事件类型名 -> 解码函数（启动期显式注册，不依赖运行时反射）；
//! - 运行时以类型擦除（Any）方式进行调度，与连接状态无关，断连期间保留订阅意图。
//!
use super::handler::IntegrationEventHandler;
use crate::error::{BusError, BusResult};
use crate::event::IntegrationEvent;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::any::{Any, TypeId};
use std::collections::BTreeSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// 解码后的事件（具体类型由 `EventTypeDescriptor` 决定）
pub type DecodedEvent = Box<dyn Any + Send + Sync>;

type HandlerFuture<'a> = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + 'a>>;

type HandlerFn =
    Arc<dyn for<'a> Fn(&'a (dyn Any + Send + Sync)) -> HandlerFuture<'a> + Send + Sync>;

fn erase<F>(f: F) -> HandlerFn
where
    F: for<'a> Fn(&'a (dyn Any + Send + Sync)) -> HandlerFuture<'a> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// 已注册的处理器
#[derive(Clone)]
pub struct HandlerEntry {
    name: String,
    invoke: HandlerFn,
}

impl HandlerEntry {
    fn new<E, H>(handler: Arc<H>) -> Self
    where
        E: IntegrationEvent,
        H: IntegrationEventHandler<E> + 'static,
    {
        let name = handler.handler_name().to_string();
        let invoke = erase(move |event| {
            let handler = handler.clone();
            Box::pin(async move {
                // 键与解码函数同为泛型 E，正常情况下 downcast 不会失败
                match event.downcast_ref::<E>() {
                    Some(event) => handler.handle(event).await,
                    None => Err(anyhow::anyhow!(
                        "type mismatch: handler expects {}",
                        E::EVENT_TYPE
                    )),
                }
            })
        });
        Self { name, invoke }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn invoke(&self, event: &(dyn Any + Send + Sync)) -> anyhow::Result<()> {
        (self.invoke)(event).await
    }
}

impl std::fmt::Debug for HandlerEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerEntry")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// 事件类型描述：名称 + 解码函数
#[derive(Clone, Copy)]
pub struct EventTypeDescriptor {
    name: &'static str,
    type_id: TypeId,
    decode: fn(&[u8]) -> Result<DecodedEvent, serde_json::Error>,
}

fn decode_as<E: IntegrationEvent>(body: &[u8]) -> Result<DecodedEvent, serde_json::Error> {
    let event: E = serde_json::from_slice(body)?;
    Ok(Box::new(event))
}

impl EventTypeDescriptor {
    pub fn of<E: IntegrationEvent>() -> Self {
        Self {
            name: E::EVENT_TYPE,
            type_id: TypeId::of::<E>(),
            decode: decode_as::<E>,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn decode(&self, body: &[u8]) -> Result<DecodedEvent, serde_json::Error> {
        (self.decode)(body)
    }
}

impl std::fmt::Debug for EventTypeDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventTypeDescriptor")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

#[derive(Default)]
pub struct SubscriptionRegistry {
    handlers: DashMap<String, Vec<HandlerEntry>>,
    event_types: DashMap<String, EventTypeDescriptor>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册事件类型的解码函数；同名但不同类型视为冲突
    pub fn register_event_type<E: IntegrationEvent>(&self) -> BusResult<()> {
        match self.event_types.entry(E::EVENT_TYPE.to_string()) {
            Entry::Occupied(existing) if existing.get().type_id != TypeId::of::<E>() => {
                Err(BusError::EventTypeConflict {
                    event_type: E::EVENT_TYPE.to_string(),
                })
            }
            Entry::Occupied(_) => Ok(()),
            Entry::Vacant(slot) => {
                slot.insert(EventTypeDescriptor::of::<E>());
                Ok(())
            }
        }
    }

    /// 添加处理器；同一事件类型下重名返回 `DuplicateSubscription`
    pub fn add<E, H>(&self, handler: Arc<H>) -> BusResult<()>
    where
        E: IntegrationEvent,
        H: IntegrationEventHandler<E> + 'static,
    {
        self.register_event_type::<E>()?;

        let entry = HandlerEntry::new::<E, H>(handler);
        let mut entries = self.handlers.entry(E::EVENT_TYPE.to_string()).or_default();
        if entries.iter().any(|h| h.name == entry.name) {
            return Err(BusError::DuplicateSubscription {
                event_type: E::EVENT_TYPE.to_string(),
                handler: entry.name,
            });
        }
        entries.push(entry);
        Ok(())
    }

    /// 移除处理器；集合为空时连同事件类型映射一起删除
    pub fn remove(&self, event_type: &str, handler_name: &str) -> bool {
        let removed = match self.handlers.get_mut(event_type) {
            Some(mut entries) => {
                let before = entries.len();
                entries.retain(|h| h.name != handler_name);
                entries.len() != before
            }
            None => false,
        };
        self.handlers
            .remove_if(event_type, |_, entries| entries.is_empty());
        removed
    }

    /// 当前处理器快照（按注册顺序）
    pub fn handlers_for(&self, event_type: &str) -> Vec<HandlerEntry> {
        self.handlers
            .get(event_type)
            .map(|entries| entries.clone())
            .unwrap_or_default()
    }

    pub fn handler_names_for(&self, event_type: &str) -> Vec<String> {
        self.handlers
            .get(event_type)
            .map(|entries| entries.iter().map(|h| h.name.clone()).collect())
            .unwrap_or_default()
    }

    pub fn has_subscriptions(&self, event_type: &str) -> bool {
        self.handlers.contains_key(event_type)
    }

    /// 所有存在订阅的事件类型（重连后据此重建消费者）
    pub fn all_subscribed_event_types(&self) -> BTreeSet<String> {
        self.handlers.iter().map(|e| e.key().clone()).collect()
    }

    pub fn resolve_event_type(&self, name: &str) -> Option<EventTypeDescriptor> {
        self.event_types.get(name).map(|d| *d)
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Serialize};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use uuid::Uuid;

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Ping {
        id: Uuid,
        occurred_at: DateTime<Utc>,
        seq: u32,
    }

    impl IntegrationEvent for Ping {
        const EVENT_TYPE: &'static str = "Ping";

        fn event_id(&self) -> Uuid {
            self.id
        }

        fn occurred_at(&self) -> DateTime<Utc> {
            self.occurred_at
        }
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct FakePing {
        id: Uuid,
        occurred_at: DateTime<Utc>,
    }

    impl IntegrationEvent for FakePing {
        const EVENT_TYPE: &'static str = "Ping";

        fn event_id(&self) -> Uuid {
            self.id
        }

        fn occurred_at(&self) -> DateTime<Utc> {
            self.occurred_at
        }
    }

    struct Recorder {
        name: &'static str,
        seen: AtomicUsize,
    }

    impl Recorder {
        fn new(name: &'static str) -> Arc<Self> {
            Arc::new(Self {
                name,
                seen: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl IntegrationEventHandler<Ping> for Recorder {
        fn handler_name(&self) -> &str {
            self.name
        }

        async fn handle(&self, event: &Ping) -> anyhow::Result<()> {
            self.seen.fetch_add(event.seq as usize, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn duplicate_handler_is_rejected() {
        let registry = SubscriptionRegistry::new();
        registry.add::<Ping, _>(Recorder::new("audit")).unwrap();

        let err = registry.add::<Ping, _>(Recorder::new("audit")).unwrap_err();
        assert!(matches!(
            err,
            BusError::DuplicateSubscription { ref event_type, ref handler }
                if event_type == "Ping" && handler == "audit"
        ));
        assert_eq!(registry.handler_names_for("Ping"), vec!["audit".to_string()]);
    }

    #[test]
    fn removing_last_handler_drops_event_type() {
        let registry = SubscriptionRegistry::new();
        registry.add::<Ping, _>(Recorder::new("a")).unwrap();
        registry.add::<Ping, _>(Recorder::new("b")).unwrap();

        assert!(registry.remove("Ping", "a"));
        assert!(registry.has_subscriptions("Ping"));
        assert!(!registry.remove("Ping", "a"));

        assert!(registry.remove("Ping", "b"));
        assert!(!registry.has_subscriptions("Ping"));
        assert!(registry.all_subscribed_event_types().is_empty());
        assert!(registry.is_empty());
        // 解码表不随订阅删除
        assert!(registry.resolve_event_type("Ping").is_some());
    }

    #[test]
    fn same_name_from_another_type_conflicts() {
        let registry = SubscriptionRegistry::new();
        registry.register_event_type::<Ping>().unwrap();
        registry.register_event_type::<Ping>().unwrap();

        let err = registry.register_event_type::<FakePing>().unwrap_err();
        assert!(matches!(err, BusError::EventTypeConflict { .. }));
    }

    #[tokio::test]
    async fn resolved_descriptor_decodes_for_handlers() {
        let registry = SubscriptionRegistry::new();
        let recorder = Recorder::new("sum");
        registry.add::<Ping, _>(recorder.clone()).unwrap();

        let body = serde_json::to_vec(&Ping {
            id: Uuid::new_v4(),
            occurred_at: Utc::now(),
            seq: 7,
        })
        .unwrap();
        let descriptor = registry.resolve_event_type("Ping").unwrap();
        assert_eq!(descriptor.name(), "Ping");
        let event = descriptor.decode(&body).unwrap();

        for handler in registry.handlers_for("Ping") {
            handler.invoke(event.as_ref()).await.unwrap();
        }
        assert_eq!(recorder.seen.load(Ordering::SeqCst), 7);

        assert!(descriptor.decode(b"not json").is_err());
    }
}
