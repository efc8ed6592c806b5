//! 统一错误处理模块
//!
//! 定义队列基础设施共享的错误类型，使用 thiserror 提供良好的错误信息。

use thiserror::Error;

/// 队列基础设施错误类型
#[derive(Debug, Error)]
pub enum QueueError {
    // ==================== 连接错误 ====================
    #[error("连接消息队列失败: {0}")]
    Connect(String),

    #[error("消息发布失败: queue={queue}, 原因={reason}")]
    Publish { queue: String, reason: String },

    #[error("操作超时: {operation}")]
    Timeout { operation: String },

    #[error("队列客户端已关闭")]
    Closed,

    // ==================== Kafka 错误 ====================
    #[error("Kafka 错误: {0}")]
    Kafka(String),

    // ==================== 缓存错误 ====================
    #[error("Redis 错误: {0}")]
    Redis(#[from] redis::RedisError),

    // ==================== 通用错误 ====================
    #[error("序列化失败: {0}")]
    Serialization(String),

    #[error("内部错误: {0}")]
    Internal(String),
}

/// 错误结果类型别名
pub type Result<T> = std::result::Result<T, QueueError>;

impl QueueError {
    /// 构造发布错误
    pub fn publish(queue: &str, reason: impl Into<String>) -> Self {
        Self::Publish {
            queue: queue.to_string(),
            reason: reason.into(),
        }
    }

    /// 获取错误码
    pub fn code(&self) -> &'static str {
        match self {
            Self::Connect(_) => "CONNECT_ERROR",
            Self::Publish { .. } => "PUBLISH_ERROR",
            Self::Timeout { .. } => "TIMEOUT",
            Self::Closed => "CLIENT_CLOSED",
            Self::Kafka(_) => "KAFKA_ERROR",
            Self::Redis(_) => "REDIS_ERROR",
            Self::Serialization(_) => "SERIALIZATION_ERROR",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// 是否为可重试错误
    ///
    /// 客户端已关闭属于调用方的生命周期问题，重试无意义。
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Connect(_) | Self::Timeout { .. } | Self::Kafka(_) | Self::Redis(_)
        )
    }
}

impl From<serde_json::Error> for QueueError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
