//! message-handled 事件
//!
//! 每条被确认的消息都会产生一个事件，说明它最终被如何处理。
//! 未确认（重投）的消息不产生事件。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 消息处理结果
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HandleStatus {
    /// 业务效果已生效
    Processed,
    /// 毒消息，或业务上无事可做（如目标订单不存在）
    Ignored,
    /// 幂等键已存在，本次投递被跳过
    DuplicateSkipped,
}

impl HandleStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Processed => "processed",
            Self::Ignored => "ignored",
            Self::DuplicateSkipped => "duplicate-skipped",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageHandled {
    pub message_id: String,
    pub queue: String,
    pub status: HandleStatus,
    /// 解析失败的消息没有幂等键
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dedupe_key: Option<String>,
    /// ignored 的原因
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub handled_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_wire_names() {
        for status in [
            HandleStatus::Processed,
            HandleStatus::Ignored,
            HandleStatus::DuplicateSkipped,
        ] {
            let json = serde_json::to_value(status).unwrap();
            assert_eq!(json, status.as_str());
        }
    }

    #[test]
    fn test_event_serialization_omits_empty_fields() {
        let event = MessageHandled {
            message_id: "m-1".to_string(),
            queue: "user.deleted".to_string(),
            status: HandleStatus::Ignored,
            dedupe_key: None,
            reason: None,
            handled_at: Utc::now(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["messageId"], "m-1");
        assert_eq!(json["status"], "ignored");
        assert!(json.get("dedupeKey").is_none());
        assert!(json.get("reason").is_none());
    }
}
