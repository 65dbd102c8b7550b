//! 消费者（ConsumerWorker）
//!
//! 每个存在订阅的事件类型一个：持有独占通道、路由键绑定与接收循环。
//! 接收循环按投递的路由键分发，逐个隔离执行处理器：
//! - 无处理器：直接确认；
//! - 无法解析/解码：确认并丢弃（记录错误日志）；
//! - 全部成功：确认；任一失败（含 panic）：拒绝并重新入队。
//!
use crate::error::{BusError, BusResult};
use crate::subscription::SubscriptionRegistry;
use crate::transport::{BrokerChannel, Delivery, DeliveryStream, TransportResult};
use futures_util::{FutureExt, StreamExt};
use std::any::Any;
use std::panic::AssertUnwindSafe;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, instrument, warn};

/// 预取数量固定为 1：上一条消息确认或重投前不会收到下一条
const PREFETCH: u16 = 1;

pub(crate) struct ConsumerWorker {
    id: u64,
    event_type: String,
    channel: Box<dyn BrokerChannel>,
    token: CancellationToken,
}

/// 接收循环退出原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LoopExit {
    Cancelled,
    StreamEnded,
}

impl ConsumerWorker {
    /// 声明拓扑、绑定路由键并开始消费
    pub(crate) async fn open(
        channel: Box<dyn BrokerChannel>,
        exchange: &str,
        queue: &str,
        event_type: &str,
        id: u64,
        parent: &CancellationToken,
    ) -> BusResult<(Self, DeliveryStream)> {
        let consumer_tag = format!("{queue}.{event_type}.{id}");
        let setup: TransportResult<DeliveryStream> = async {
            channel.declare_exchange(exchange).await?;
            channel.declare_queue(queue).await?;
            channel.bind_queue(queue, exchange, event_type).await?;
            channel.set_prefetch(PREFETCH).await?;
            channel.consume(queue, &consumer_tag).await
        }
        .await;

        match setup {
            Ok(stream) => Ok((
                Self {
                    id,
                    event_type: event_type.to_string(),
                    channel,
                    token: parent.child_token(),
                },
                stream,
            )),
            Err(err) => {
                channel.close().await;
                Err(BusError::consumer_setup(event_type, err))
            }
        }
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// 停止接收循环并关闭通道；`unbind` 给出 (queue, exchange) 时先解除绑定
    pub(crate) async fn dispose(self, unbind: Option<(&str, &str)>) {
        if let Some((queue, exchange)) = unbind
            && let Err(err) = self
                .channel
                .unbind_queue(queue, exchange, &self.event_type)
                .await
        {
            warn!(event_type = %self.event_type, error = %err, "unbind failed");
        }
        self.token.cancel();
        self.channel.close().await;
        debug!(event_type = %self.event_type, worker = self.id, "consumer disposed");
    }
}

pub(crate) async fn receive_loop(
    mut deliveries: DeliveryStream,
    registry: std::sync::Arc<SubscriptionRegistry>,
    token: CancellationToken,
) -> LoopExit {
    loop {
        let next = tokio::select! {
            biased;
            _ = token.cancelled() => return LoopExit::Cancelled,
            next = deliveries.next() => next,
        };

        match next {
            Some(Ok(delivery)) => dispatch(&registry, delivery).await,
            Some(Err(err)) => {
                warn!(error = %err, "delivery stream failed");
                return LoopExit::StreamEnded;
            }
            None => return LoopExit::StreamEnded,
        }
    }
}

#[instrument(skip_all, fields(
    event_type = %delivery.message().routing_key,
    event_id = ?delivery.message().message_id,
    redelivered = delivery.message().redelivered,
))]
pub(crate) async fn dispatch(registry: &SubscriptionRegistry, delivery: Delivery) {
    let event_type = delivery.message().routing_key.clone();

    let handlers = registry.handlers_for(&event_type);
    if handlers.is_empty() {
        debug!("no handlers registered, acknowledging");
        settle(delivery.ack().await);
        return;
    }

    let decoded = match registry.resolve_event_type(&event_type) {
        Some(descriptor) => descriptor
            .decode(&delivery.message().body)
            .map_err(|e| e.to_string()),
        None => Err("event type is not registered".to_string()),
    };
    let event = match decoded {
        Ok(event) => event,
        Err(reason) => {
            let err = BusError::DeserializationFailed { event_type, reason };
            error!(error = %err, "dropping undecodable message");
            settle(delivery.ack().await);
            return;
        }
    };

    let mut failures = 0usize;
    for handler in &handlers {
        let outcome = AssertUnwindSafe(handler.invoke(&*event))
            .catch_unwind()
            .await;
        let reason = match outcome {
            Ok(Ok(())) => {
                debug!(handler = handler.name(), "handler succeeded");
                continue;
            }
            Ok(Err(err)) => format!("{err:#}"),
            Err(panic) => panic_message(panic.as_ref()),
        };

        failures += 1;
        let err = BusError::HandlerFailed {
            handler: handler.name().to_string(),
            reason,
        };
        error!(error = %err, "handler failed");
    }

    if failures == 0 {
        settle(delivery.ack().await);
    } else {
        warn!(failures, handlers = handlers.len(), "requeueing message");
        settle(delivery.nack(true).await);
    }
}

fn settle(result: TransportResult<()>) {
    if let Err(err) = result {
        warn!(error = %err, "failed to settle delivery");
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        format!("panicked: {msg}")
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        format!("panicked: {msg}")
    } else {
        "panicked".to_string()
    }
}
