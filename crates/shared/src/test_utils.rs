//! 测试工具模块
//!
//! 提供集成测试所需的配置辅助、消息负载生成器和异步等待工具。
//! 用于简化测试代码编写，提高测试的可重复性和可维护性。

use std::future::Future;
use std::time::Duration;

use serde_json::{Value, json};
use uuid::Uuid;

use crate::config::{
    AppConfig, BackoffSettings, ConsumerConfig, LedgerBackend, LedgerConfig, PoisonPolicy,
    QueueBackend, QueueConfig, RedisConfig, RetrySettings,
};

// ==================== 测试配置辅助 ====================

/// 创建测试用 Redis 配置
///
/// 优先使用环境变量，否则使用本地 1 号库
pub fn test_redis_config() -> RedisConfig {
    RedisConfig {
        url: std::env::var("TEST_REDIS_URL")
            .unwrap_or_else(|_| "redis://localhost:6379/1".to_string()),
        pool_size: 5,
    }
}

/// 快速失败的重试参数，避免测试等待过久
pub fn fast_retry(max_retries: u32) -> RetrySettings {
    RetrySettings {
        max_retries,
        initial_delay_ms: 1,
        max_delay_ms: 10,
        multiplier: 2.0,
    }
}

/// 进程内队列 + 内存账本的应用配置
pub fn test_app_config() -> AppConfig {
    AppConfig {
        service_name: "order-service-test".to_string(),
        environment: "test".to_string(),
        queue: QueueConfig {
            backend: QueueBackend::Memory,
            max_redeliveries: 3,
            redelivery_backoff: BackoffSettings {
                initial_delay_ms: 1,
                max_delay_ms: 10,
                multiplier: 2.0,
            },
            ..QueueConfig::default()
        },
        redis: test_redis_config(),
        consumer: ConsumerConfig {
            connect_retry: fast_retry(2),
            event_buffer: 64,
            ..ConsumerConfig::default()
        },
        ledger: LedgerConfig {
            backend: LedgerBackend::Memory,
            ttl_seconds: 60,
        },
        ..AppConfig::default()
    }
}

/// 毒消息写入死信队列的测试配置
pub fn test_dead_letter_config() -> AppConfig {
    let mut config = test_app_config();
    config.consumer.poison_policy = PoisonPolicy::DeadLetter;
    config
}

/// 生成唯一的请求 ID
pub fn test_request_id() -> String {
    format!("test-request-{}", Uuid::new_v4())
}

// ==================== 消息负载生成器 ====================

/// 测试消息负载生成器
pub struct TestDataGenerator;

impl TestDataGenerator {
    /// 下单消息
    pub fn create_order(user_id: u64, product_id: u64, mode: &str) -> Value {
        json!({
            "userId": user_id,
            "productId": product_id,
            "mode": mode,
        })
    }

    /// 带请求 ID 的下单消息
    pub fn create_order_with_request(
        user_id: u64,
        product_id: u64,
        mode: &str,
        request_id: &str,
    ) -> Value {
        json!({
            "userId": user_id,
            "productId": product_id,
            "mode": mode,
            "requestId": request_id,
        })
    }

    /// 按订单 ID 删除
    pub fn delete_order(order_id: u64) -> Value {
        json!({ "id": order_id })
    }

    /// 按用户 ID 删除其全部订单
    pub fn delete_user_orders(user_id: u64) -> Value {
        json!({ "userId": user_id })
    }

    /// 不符合任何 schema 的 JSON
    pub fn schema_mismatch() -> Value {
        json!({ "unexpected": true })
    }

    /// 无法解析为 JSON 的字节
    pub fn malformed_bytes() -> Vec<u8> {
        b"{\"id\": 65".to_vec()
    }
}

// ==================== 异步等待工具 ====================

/// 轮询直到条件成立或超时，返回条件是否成立
pub async fn wait_until<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// 为 future 加上超时，超时时 panic 并给出说明
pub async fn within<T>(timeout: Duration, what: &str, fut: impl Future<Output = T>) -> T {
    match tokio::time::timeout(timeout, fut).await {
        Ok(value) => value,
        Err(_) => panic!("等待超时: {what}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_app_config_uses_memory_backends() {
        let config = test_app_config();
        assert_eq!(config.queue.backend, QueueBackend::Memory);
        assert_eq!(config.ledger.backend, LedgerBackend::Memory);
        assert_eq!(config.consumer.poison_policy, PoisonPolicy::Ack);
        assert_eq!(
            test_dead_letter_config().consumer.poison_policy,
            PoisonPolicy::DeadLetter
        );
    }

    #[test]
    fn test_payload_generators() {
        let create = TestDataGenerator::create_order(1, 2, "approved");
        assert_eq!(create["userId"], 1);
        assert_eq!(create["productId"], 2);
        assert_eq!(create["mode"], "approved");

        assert_eq!(TestDataGenerator::delete_order(650)["id"], 650);
        assert_eq!(TestDataGenerator::delete_user_orders(9)["userId"], 9);
        assert!(serde_json::from_slice::<Value>(&TestDataGenerator::malformed_bytes()).is_err());
    }

    #[test]
    fn test_request_ids_are_unique() {
        assert_ne!(test_request_id(), test_request_id());
    }

    #[tokio::test]
    async fn test_wait_until() {
        assert!(wait_until(Duration::from_millis(50), || true).await);
        assert!(!wait_until(Duration::from_millis(20), || false).await);
    }
}
