//! 启动协调（StartupCoordinator）
//!
//! 进程启动时有限次尝试连接 broker；无论结果如何都会结束，
//! broker 不可用时进程照常启动，发布与订阅分别由缓冲区与观察任务降级处理。
//!
use crate::connection::BrokerConnection;
use bon::Builder;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Debug, Clone, Builder)]
pub struct StartupCoordinator {
    #[builder(default = 10)]
    attempts: u32,
    /// 两次尝试之间的固定间隔
    #[builder(default = Duration::from_secs(2))]
    delay: Duration,
}

impl Default for StartupCoordinator {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// 启动结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartupOutcome {
    /// 在第 `attempts` 次尝试时连接成功
    Connected { attempts: u32 },
    /// 尝试用尽仍未连接，以降级模式启动
    Degraded { attempts: u32 },
}

impl StartupOutcome {
    pub fn is_connected(&self) -> bool {
        matches!(self, StartupOutcome::Connected { .. })
    }
}

impl StartupCoordinator {
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    pub async fn run(&self, connection: &BrokerConnection) -> StartupOutcome {
        let attempts = self.attempts.max(1);

        for attempt in 1..=attempts {
            if connection.try_connect().await {
                info!(attempt, "connected to broker at startup");
                return StartupOutcome::Connected { attempts: attempt };
            }
            if connection.is_closed() {
                return StartupOutcome::Degraded { attempts: attempt };
            }
            if attempt < attempts {
                warn!(attempt, attempts, "broker unavailable at startup, retrying");
                tokio::time::sleep(self.delay).await;
            }
        }

        warn!(attempts, "broker still unavailable, starting in degraded mode");
        StartupOutcome::Degraded { attempts }
    }
}
