//! 配置（Settings）
//!
//! 所有字段均有默认值；可从可选的配置文件与 `REBUS_*` 环境变量加载
//! （环境变量名为字段名大写，例如 `REBUS_HOST`、`REBUS_EXCHANGE_NAME`）。
//! 运行期结构（`ConnectionConfig`、`EventBusConfig`、`StartupCoordinator`）由此投影得到。
//!
use crate::bus::EventBusConfig;
use crate::connection::ConnectionConfig;
use crate::error::{BusError, BusResult};
use crate::startup::StartupCoordinator;
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use url::Url;

pub const ENV_PREFIX: &str = "REBUS";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_credential")]
    pub username: String,
    #[serde(default = "default_credential")]
    pub password: String,
    #[serde(default = "default_virtual_host")]
    pub virtual_host: String,
    #[serde(default = "default_exchange_name")]
    pub exchange_name: String,
    /// 本进程消费使用的队列名
    #[serde(default = "default_queue_name")]
    pub queue_name: String,
    /// 每个重连周期内的尝试次数
    #[serde(default = "default_retry_count")]
    pub retry_count: u32,
    #[serde(default = "default_heartbeat")]
    pub heartbeat_secs: u64,
    /// 重连定时器周期
    #[serde(default = "default_network_recovery_interval")]
    pub network_recovery_interval_secs: u64,
    #[serde(default = "default_true")]
    pub automatic_recovery_enabled: bool,
    #[serde(default = "default_true")]
    pub topology_recovery_enabled: bool,
    #[serde(default = "default_connection_timeout")]
    pub connection_timeout_secs: u64,
    #[serde(default = "default_health_check_interval")]
    pub health_check_interval_secs: u64,
    #[serde(default = "default_pending_capacity")]
    pub pending_capacity: usize,
    #[serde(default = "default_pending_ttl")]
    pub pending_ttl_secs: u64,
    #[serde(default = "default_consumer_watch_interval")]
    pub consumer_watch_interval_secs: u64,
    #[serde(default = "default_consumer_watch_timeout")]
    pub consumer_watch_timeout_secs: u64,
    #[serde(default = "default_replay_delay")]
    pub replay_delay_ms: u64,
    #[serde(default = "default_startup_attempts")]
    pub startup_attempts: u32,
    #[serde(default = "default_startup_delay")]
    pub startup_delay_secs: u64,
    #[serde(default)]
    pub propagate_publish_errors: bool,
}

fn default_host() -> String {
    "localhost".to_string()
}

const fn default_port() -> u16 {
    5672
}

fn default_credential() -> String {
    "guest".to_string()
}

fn default_virtual_host() -> String {
    "/".to_string()
}

fn default_exchange_name() -> String {
    "rebus_event_bus".to_string()
}

fn default_queue_name() -> String {
    "rebus_events".to_string()
}

const fn default_retry_count() -> u32 {
    3
}

const fn default_heartbeat() -> u64 {
    60
}

const fn default_network_recovery_interval() -> u64 {
    10
}

const fn default_true() -> bool {
    true
}

const fn default_connection_timeout() -> u64 {
    30
}

const fn default_health_check_interval() -> u64 {
    30
}

const fn default_pending_capacity() -> usize {
    1000
}

const fn default_pending_ttl() -> u64 {
    600
}

const fn default_consumer_watch_interval() -> u64 {
    5
}

const fn default_consumer_watch_timeout() -> u64 {
    300
}

const fn default_replay_delay() -> u64 {
    100
}

const fn default_startup_attempts() -> u32 {
    10
}

const fn default_startup_delay() -> u64 {
    2
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            username: default_credential(),
            password: default_credential(),
            virtual_host: default_virtual_host(),
            exchange_name: default_exchange_name(),
            queue_name: default_queue_name(),
            retry_count: default_retry_count(),
            heartbeat_secs: default_heartbeat(),
            network_recovery_interval_secs: default_network_recovery_interval(),
            automatic_recovery_enabled: true,
            topology_recovery_enabled: true,
            connection_timeout_secs: default_connection_timeout(),
            health_check_interval_secs: default_health_check_interval(),
            pending_capacity: default_pending_capacity(),
            pending_ttl_secs: default_pending_ttl(),
            consumer_watch_interval_secs: default_consumer_watch_interval(),
            consumer_watch_timeout_secs: default_consumer_watch_timeout(),
            replay_delay_ms: default_replay_delay(),
            startup_attempts: default_startup_attempts(),
            startup_delay_secs: default_startup_delay(),
            propagate_publish_errors: false,
        }
    }
}

impl Settings {
    /// 仅从 `REBUS_*` 环境变量加载
    pub fn from_env() -> BusResult<Self> {
        Self::from_builder(Config::builder().add_source(environment()))
    }

    /// 从配置文件（可不存在，扩展名按格式推断）加载，再以环境变量覆盖
    pub fn load(file: &str) -> BusResult<Self> {
        Self::from_builder(
            Config::builder()
                .add_source(File::with_name(file).required(false))
                .add_source(environment()),
        )
    }

    fn from_builder(
        builder: config::ConfigBuilder<config::builder::DefaultState>,
    ) -> BusResult<Self> {
        let settings: Self = builder.build()?.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> BusResult<()> {
        let invalid = |reason: &str| -> BusResult<()> {
            Err(BusError::Config {
                reason: reason.to_string(),
            })
        };

        if self.host.trim().is_empty() {
            return invalid("host must not be empty");
        }
        if self.port == 0 {
            return invalid("port must not be 0");
        }
        if self.exchange_name.trim().is_empty() || self.queue_name.trim().is_empty() {
            return invalid("exchange_name and queue_name must not be empty");
        }
        if self.network_recovery_interval_secs == 0
            || self.health_check_interval_secs == 0
            || self.consumer_watch_interval_secs == 0
        {
            return invalid("timer intervals must be at least 1 second");
        }
        Ok(())
    }

    /// broker URI：凭据与虚拟主机按 URI 规则转义，附带心跳与连接超时（毫秒）参数
    pub fn amqp_uri(&self) -> BusResult<String> {
        let config_err = |reason: String| BusError::Config { reason };

        let mut uri = Url::parse(&format!("amqp://{}:{}", self.host, self.port))
            .map_err(|e| config_err(format!("invalid broker address: {e}")))?;
        uri.set_username(&self.username)
            .map_err(|_| config_err("invalid username".to_string()))?;
        uri.set_password(Some(&self.password))
            .map_err(|_| config_err("invalid password".to_string()))?;
        uri.path_segments_mut()
            .map_err(|_| config_err("broker address cannot carry a virtual host".to_string()))?
            .clear()
            .push(&self.virtual_host);
        uri.query_pairs_mut()
            .append_pair("heartbeat", &self.heartbeat_secs.to_string())
            .append_pair(
                "connection_timeout",
                &self.connection_timeout_secs.saturating_mul(1000).to_string(),
            );
        Ok(uri.into())
    }

    pub fn connection_config(&self) -> ConnectionConfig {
        ConnectionConfig::builder()
            .reconnect_interval(Duration::from_secs(self.network_recovery_interval_secs))
            .health_check_interval(Duration::from_secs(self.health_check_interval_secs))
            .retry_count(self.retry_count)
            .automatic_recovery(self.automatic_recovery_enabled)
            .build()
    }

    pub fn bus_config(&self) -> EventBusConfig {
        EventBusConfig::builder()
            .exchange_name(self.exchange_name.clone())
            .queue_name(self.queue_name.clone())
            .topology_recovery(self.topology_recovery_enabled)
            .pending_capacity(self.pending_capacity)
            .pending_ttl(Duration::from_secs(self.pending_ttl_secs))
            .consumer_watch_interval(Duration::from_secs(self.consumer_watch_interval_secs))
            .consumer_watch_timeout(Duration::from_secs(self.consumer_watch_timeout_secs))
            .replay_delay(Duration::from_millis(self.replay_delay_ms))
            .propagate_publish_errors(self.propagate_publish_errors)
            .build()
    }

    pub fn startup(&self) -> StartupCoordinator {
        StartupCoordinator::builder()
            .attempts(self.startup_attempts)
            .delay(Duration::from_secs(self.startup_delay_secs))
            .build()
    }
}

fn environment() -> Environment {
    Environment::with_prefix(ENV_PREFIX).try_parsing(true)
}
