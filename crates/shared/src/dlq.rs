//! 死信队列
//!
//! 毒消息和重投次数耗尽的消息不会被丢弃，而是包装成 [`DeadLetterMessage`]
//! 写入死信队列，等待人工排查。死信消息永远不会被自动重新投递。

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, warn};

use crate::error::Result;
use crate::queue::{Delivery, QueueClient};

/// 死信消息信封
///
/// 包装原始消息，附加失败原因、投递次数等元数据。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetterMessage {
    /// 原始消息 ID
    pub message_id: String,
    /// 原始队列
    pub source_queue: String,
    /// 原始消息内容（有损 UTF-8）
    pub payload: String,
    /// 失败原因
    pub error: String,
    /// 进入死信前的投递次数（含首次）
    pub attempts: u32,
    pub failed_at: DateTime<Utc>,
    /// 来源服务
    pub source_service: String,
}

impl DeadLetterMessage {
    pub fn from_delivery(
        delivery: &Delivery,
        error: impl Into<String>,
        source_service: impl Into<String>,
    ) -> Self {
        Self {
            message_id: delivery.message_id(),
            source_queue: delivery.queue.clone(),
            payload: delivery.payload_lossy(),
            error: error.into(),
            attempts: delivery.attempt + 1,
            failed_at: Utc::now(),
            source_service: source_service.into(),
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}

/// 通过队列客户端写入死信的发布器
///
/// 供消费侧在识别出毒消息后调用；客户端内部的重投耗尽路径直接构造信封，
/// 不经过此组件。
#[derive(Clone)]
pub struct DeadLetterPublisher {
    client: Arc<dyn QueueClient>,
    queue: String,
    source_service: String,
}

impl DeadLetterPublisher {
    pub fn new(
        client: Arc<dyn QueueClient>,
        queue: impl Into<String>,
        source_service: impl Into<String>,
    ) -> Self {
        Self {
            client,
            queue: queue.into(),
            source_service: source_service.into(),
        }
    }

    /// 将失败消息写入死信队列
    ///
    /// 写入失败只记录日志：调用方仍会确认原消息，避免毒消息反复投递。
    pub async fn publish(&self, delivery: &Delivery, reason: &str) {
        let letter = DeadLetterMessage::from_delivery(delivery, reason, &self.source_service);

        let result = match letter.to_bytes() {
            Ok(bytes) => self.client.send_message(&self.queue, &bytes).await,
            Err(e) => Err(e),
        };

        match result {
            Ok(()) => {
                metrics::counter!("queue_dead_lettered_total", "queue" => delivery.queue.clone())
                    .increment(1);
                warn!(
                    message_id = %letter.message_id,
                    source_queue = %letter.source_queue,
                    error = reason,
                    "消息已发送到死信队列"
                );
            }
            Err(e) => {
                error!(
                    message_id = %letter.message_id,
                    source_queue = %letter.source_queue,
                    error = %e,
                    "发送到死信队列失败，消息可能丢失"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn make_delivery(attempt: u32) -> Delivery {
        Delivery {
            queue: "user.deleted".to_string(),
            delivery_tag: 3,
            partition: 0,
            key: Some("msg-9".to_string()),
            payload: b"{not json".to_vec(),
            timestamp: None,
            headers: HashMap::new(),
            attempt,
        }
    }

    #[test]
    fn test_dead_letter_from_delivery() {
        let letter = DeadLetterMessage::from_delivery(&make_delivery(2), "解析失败", "order-service");

        assert_eq!(letter.message_id, "msg-9");
        assert_eq!(letter.source_queue, "user.deleted");
        assert_eq!(letter.payload, "{not json");
        assert_eq!(letter.error, "解析失败");
        assert_eq!(letter.attempts, 3);
        assert_eq!(letter.source_service, "order-service");
    }

    #[test]
    fn test_dead_letter_serialization() {
        let letter = DeadLetterMessage::from_delivery(&make_delivery(0), "schema", "svc");
        let json = String::from_utf8(letter.to_bytes().unwrap()).unwrap();

        assert!(json.contains("messageId"));
        assert!(json.contains("sourceQueue"));
        assert!(json.contains("failedAt"));
        assert!(json.contains("sourceService"));

        let back: DeadLetterMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(back.attempts, 1);
        assert_eq!(back.source_queue, "user.deleted");
    }
}
