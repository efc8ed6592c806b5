//! 订单服务专用错误类型
//!
//! 在共享库 QueueError 基础上区分"毒消息"（解析/校验失败、队列未绑定）
//! 与"瞬时故障"（存储、队列不可用）。前者重投也不会成功，
//! 后者应当让消息重新投递。

use order_shared::error::QueueError;

/// 订单服务错误
#[derive(Debug, thiserror::Error)]
pub enum OrderError {
    /// 消息体不是合法 JSON，或字段类型不匹配
    #[error("消息解析失败: {0}")]
    Parse(String),

    /// JSON 结构正确但不满足业务约束
    #[error("消息校验失败: {0}")]
    SchemaValidation(String),

    /// 收到的消息来自没有绑定 handler 的队列
    #[error("队列未绑定处理器: {queue}")]
    UnknownQueue { queue: String },

    #[error("订单不存在: {id}")]
    NotFound { id: u64 },

    /// 订单存储暂时不可用，可重试
    #[error("订单存储错误: {0}")]
    Storage(String),

    /// 启动器状态不允许当前操作
    #[error("状态 {state} 下不允许执行 {operation}")]
    InvalidState {
        state: &'static str,
        operation: &'static str,
    },

    /// 透传共享库错误，避免在每个 match 分支手动转换
    #[error(transparent)]
    Shared(#[from] QueueError),
}

pub type Result<T> = std::result::Result<T, OrderError>;

impl OrderError {
    /// 是否为毒消息：重新投递也不会成功，应直接确认或进入死信
    pub fn is_poison(&self) -> bool {
        matches!(
            self,
            Self::Parse(_) | Self::SchemaValidation(_) | Self::UnknownQueue { .. }
        )
    }

    /// 错误码，用于日志与死信原因
    pub fn code(&self) -> &'static str {
        match self {
            Self::Parse(_) => "PARSE_FAILED",
            Self::SchemaValidation(_) => "SCHEMA_VALIDATION_FAILED",
            Self::UnknownQueue { .. } => "UNKNOWN_QUEUE",
            Self::NotFound { .. } => "ORDER_NOT_FOUND",
            Self::Storage(_) => "STORAGE_ERROR",
            Self::InvalidState { .. } => "INVALID_STATE",
            Self::Shared(e) => e.code(),
        }
    }
}

impl From<serde_json::Error> for OrderError {
    fn from(err: serde_json::Error) -> Self {
        Self::Parse(err.to_string())
    }
}

impl From<validator::ValidationErrors> for OrderError {
    fn from(err: validator::ValidationErrors) -> Self {
        Self::SchemaValidation(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = OrderError::NotFound { id: 650 };
        assert_eq!(err.to_string(), "订单不存在: 650");

        let err = OrderError::UnknownQueue {
            queue: "audit.log".to_string(),
        };
        assert_eq!(err.to_string(), "队列未绑定处理器: audit.log");

        let err = OrderError::InvalidState {
            state: "listening",
            operation: "start",
        };
        assert_eq!(err.to_string(), "状态 listening 下不允许执行 start");

        let err = OrderError::Shared(QueueError::Closed);
        assert_eq!(err.to_string(), QueueError::Closed.to_string());
    }

    #[test]
    fn test_poison_classification() {
        assert!(OrderError::Parse("eof".into()).is_poison());
        assert!(OrderError::SchemaValidation("userId".into()).is_poison());
        assert!(
            OrderError::UnknownQueue {
                queue: "x".into()
            }
            .is_poison()
        );

        assert!(!OrderError::Storage("down".into()).is_poison());
        assert!(!OrderError::NotFound { id: 1 }.is_poison());
        assert!(!OrderError::Shared(QueueError::Connect("refused".into())).is_poison());
    }

    #[test]
    fn test_json_error_is_parse() {
        let err: OrderError = serde_json::from_str::<serde_json::Value>("{\"id\": 65")
            .unwrap_err()
            .into();
        assert!(matches!(err, OrderError::Parse(_)));
        assert_eq!(err.code(), "PARSE_FAILED");
    }
}
