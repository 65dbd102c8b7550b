//! 弹性事件总线（rebus-core）
//!
//! 服务间消息骨干：维护到 broker 的连接，持久化发布集成事件，
//! broker 不可达时缓冲事件并在重连后重放，以显式确认与重投语义
//! 将事件至少一次地投递给进程内注册的处理器。
//!
//! 组成（自底向上）：
//! - `connection`：唯一逻辑连接、健康检查与定时重连；
//! - `subscription`：事件类型 -> 处理器集合，断连期间保留订阅意图；
//! - `buffer`：有界、带过期时间的待发缓冲区；
//! - `bus`：发布/订阅/退订，按事件类型维护消费者，重连后重建并重放；
//! - `startup`：进程启动时有限次尝试连接，永不无限阻塞；
//! - `transport`：与具体 broker 解耦的传输协议，内置内存实现与 AMQP 适配（feature `amqp`）。
//!
//! 典型用法：
//! 1. 由 `Settings` 投影出 `ConnectionConfig` 与 `EventBusConfig`；
//! 2. 以某个 `BrokerTransport` 创建 `BrokerConnection`，再创建 `EventBus`；
//! 3. 注册处理器（`subscribe`），运行 `StartupCoordinator`；
//! 4. 业务事务提交后调用 `publish`。
//!
pub mod buffer;
pub mod bus;
pub mod config;
pub mod connection;
pub mod error;
pub mod event;
pub mod startup;
pub mod subscription;
pub mod transport;

pub use bus::{EventBus, EventBusConfig};
pub use connection::{BrokerConnection, ConnectionConfig, ConnectionObserver, ConnectionState};
pub use error::{BusError, BusResult};
pub use event::IntegrationEvent;
pub use startup::{StartupCoordinator, StartupOutcome};
pub use subscription::IntegrationEventHandler;

// 允许在本 crate 内部通过 ::rebus_core 进行自引用，
// 以便过程宏在本 crate 的单元测试中也能解析到 ::rebus_core 路径。
extern crate self as rebus_core;
