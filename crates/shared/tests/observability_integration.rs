//! 可观测性模块集成测试
//!
//! 验证日志与指标初始化，以及消费侧指标记录函数在各种输入下不 panic。

use std::time::Duration;

use order_shared::config::ObservabilityConfig;

mod metrics_tests {
    use super::*;
    use order_shared::observability::metrics::{record_handler_failure, record_message_handled};

    #[test]
    fn test_record_message_handled_statuses() {
        for status in ["processed", "ignored", "duplicate-skipped"] {
            record_message_handled("order.requests", status, Duration::from_millis(3));
            record_message_handled("user.deleted", status, Duration::from_millis(1));
        }
    }

    #[test]
    fn test_record_handler_failure() {
        record_handler_failure("user.deleted", Duration::from_millis(12));
        record_handler_failure("order.requests", Duration::ZERO);
    }

    #[test]
    fn test_metrics_with_edge_cases() {
        // 空队列名
        record_message_handled("", "processed", Duration::ZERO);

        // 超长队列名
        let long_queue = "q.".to_string() + &"x".repeat(1000);
        record_message_handled(&long_queue, "ignored", Duration::from_secs(1));

        // 极端持续时间
        record_handler_failure("order.requests", Duration::from_secs(3600));
    }
}

mod tracing_tests {
    use super::*;
    use order_shared::observability::tracing::build_filter;

    #[test]
    fn test_build_filter_from_config() {
        let config = ObservabilityConfig {
            log_level: "order_service=debug,info".to_string(),
            ..ObservabilityConfig::default()
        };
        let filter = build_filter(&config);
        assert!(!filter.to_string().is_empty());
    }
}

mod init_tests {
    use super::*;
    use order_shared::observability::{self, ObservabilityGuard};

    #[test]
    fn test_empty_guard_drops_cleanly() {
        let guard = ObservabilityGuard::empty();
        drop(guard);
    }

    #[tokio::test]
    async fn test_init_without_metrics() {
        let config = ObservabilityConfig {
            log_level: "warn".to_string(),
            log_format: "json".to_string(),
            metrics_enabled: false,
            metrics_port: 0,
        };

        // 本测试二进制中只有这里安装全局 subscriber
        let guard = observability::init("observability-test", &config).unwrap();
        drop(guard);

        // 重复安装返回错误而非 panic
        assert!(observability::init("observability-test", &config).is_err());
    }
}
