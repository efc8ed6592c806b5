//! 配置管理模块
//!
//! 支持多格式配置文件加载，环境变量覆盖，以及类型安全的配置访问。

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::queue::topics;
use crate::retry::RetryPolicy;

/// 队列后端类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum QueueBackend {
    #[default]
    Kafka,
    /// 进程内队列，用于本地开发和测试
    Memory,
}

/// 消息队列配置
///
/// `max_redeliveries` 相当于 broker 侧的重投上限：超过后客户端把消息移入死信队列；
/// `redelivery_backoff` 只决定两次投递之间的等待时间。
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub backend: QueueBackend,
    pub brokers: String,
    pub consumer_group: String,
    pub auto_offset_reset: String,
    pub connect_timeout_ms: u64,
    pub publish_timeout_ms: u64,
    pub max_redeliveries: u32,
    pub redelivery_backoff: BackoffSettings,
    pub dead_letter_queue: String,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            backend: QueueBackend::Kafka,
            brokers: "localhost:9092".to_string(),
            consumer_group: "order-service".to_string(),
            auto_offset_reset: "earliest".to_string(),
            connect_timeout_ms: 5000,
            publish_timeout_ms: 5000,
            max_redeliveries: 5,
            redelivery_backoff: BackoffSettings::default(),
            dead_letter_queue: topics::DEAD_LETTER_QUEUE.to_string(),
        }
    }
}

impl QueueConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn publish_timeout(&self) -> Duration {
        Duration::from_millis(self.publish_timeout_ms)
    }

    /// 重投策略：次数上限取 `max_redeliveries`，等待时间取 `redelivery_backoff`
    pub fn redelivery_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_redeliveries,
            initial_delay: Duration::from_millis(self.redelivery_backoff.initial_delay_ms),
            max_delay: Duration::from_millis(self.redelivery_backoff.max_delay_ms),
            multiplier: self.redelivery_backoff.multiplier,
        }
    }
}

/// 重投退避参数
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BackoffSettings {
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
}

impl Default for BackoffSettings {
    fn default() -> Self {
        Self {
            initial_delay_ms: 200,
            max_delay_ms: 10_000,
            multiplier: 2.0,
        }
    }
}

/// Redis 配置
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    pub url: String,
    pub pool_size: u32,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379".to_string(),
            pool_size: 10,
        }
    }
}

/// 可序列化的重试参数，加载后转换为 [`RetryPolicy`]
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_retries: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay_ms: 1000,
            max_delay_ms: 30_000,
            multiplier: 2.0,
        }
    }
}

impl RetrySettings {
    pub fn to_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            initial_delay: Duration::from_millis(self.initial_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            multiplier: self.multiplier,
        }
    }
}

/// 毒消息处理策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum PoisonPolicy {
    /// 直接确认丢弃
    #[default]
    Ack,
    /// 先写入死信队列再确认
    DeadLetter,
}

/// 消费者配置
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConsumerConfig {
    /// 下单请求队列
    pub create_order_queue: String,
    /// 用户/订单删除事件队列
    pub delete_order_queue: String,
    /// 订单创建后发布通知的队列
    pub order_placed_queue: String,
    /// 每个队列注册的订阅数，大于 1 时启用并行消费
    pub consumers_per_queue: usize,
    pub poison_policy: PoisonPolicy,
    /// 建立订阅时的重试参数，耗尽后启动失败
    pub connect_retry: RetrySettings,
    /// message-handled 事件通道容量
    pub event_buffer: usize,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            create_order_queue: topics::ORDER_REQUESTS.to_string(),
            delete_order_queue: topics::USER_DELETED.to_string(),
            order_placed_queue: topics::ORDER_PLACED.to_string(),
            consumers_per_queue: 1,
            poison_policy: PoisonPolicy::Ack,
            connect_retry: RetrySettings::default(),
            event_buffer: 256,
        }
    }
}

/// 幂等账本后端
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LedgerBackend {
    #[default]
    Memory,
    Redis,
}

/// 幂等账本配置
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    pub backend: LedgerBackend,
    pub ttl_seconds: u64,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            backend: LedgerBackend::Memory,
            ttl_seconds: 24 * 60 * 60,
        }
    }
}

impl LedgerConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_seconds)
    }
}

/// 可观测性配置
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    pub log_level: String,
    /// 日志输出格式：json（结构化）或 pretty（人类可读）
    pub log_format: String,
    pub metrics_enabled: bool,
    pub metrics_port: u16,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: "pretty".to_string(),
            metrics_enabled: true,
            metrics_port: 9090,
        }
    }
}

/// 应用配置
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub service_name: String,
    pub environment: String,
    pub queue: QueueConfig,
    pub redis: RedisConfig,
    pub consumer: ConsumerConfig,
    pub ledger: LedgerConfig,
    pub observability: ObservabilityConfig,
}

impl AppConfig {
    /// 从配置文件和环境变量加载配置
    ///
    /// 加载顺序（后加载的会覆盖先加载的同名配置项）：
    /// 1. config/default.toml（默认配置）
    /// 2. config/{environment}.toml（环境特定配置）
    /// 3. config/{service_name}.toml（服务特定配置）
    /// 4. 环境变量（ORDER_ 前缀，双下划线分隔层级，如 ORDER_QUEUE__BROKERS -> queue.brokers）
    pub fn load(service_name: &str) -> Result<Self, ConfigError> {
        let env = std::env::var("ORDER_ENV").unwrap_or_else(|_| "development".to_string());

        let config_dir = std::env::var("CONFIG_DIR").unwrap_or_else(|_| "config".to_string());

        let builder = Config::builder()
            .set_default("service_name", service_name)?
            .set_default("environment", env.clone())?
            .add_source(File::from(Path::new(&config_dir).join("default.toml")).required(false))
            .add_source(
                File::from(Path::new(&config_dir).join(format!("{}.toml", env))).required(false),
            )
            .add_source(
                File::from(Path::new(&config_dir).join(format!("{}.toml", service_name)))
                    .required(false),
            )
            .add_source(
                Environment::with_prefix("ORDER")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            );

        builder.build()?.try_deserialize()
    }

    /// 是否为生产环境
    pub fn is_production(&self) -> bool {
        self.environment == "production"
    }
}
