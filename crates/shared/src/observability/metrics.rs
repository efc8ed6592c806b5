//! Prometheus 指标模块
//!
//! 基于 metrics crate 和 metrics-exporter-prometheus 实现指标收集与导出。
//! 指标通过独立的 HTTP 端口暴露，供 Prometheus 抓取。

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Result, anyhow};
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::{error, info};

use crate::config::ObservabilityConfig;

/// Metrics 资源守卫
pub struct MetricsHandle {
    _server_handle: tokio::task::JoinHandle<()>,
}

/// 初始化 Prometheus 指标导出
///
/// 必须在 tokio runtime 内调用：导出器作为后台任务运行，监听 `/metrics`。
pub fn init(service_name: &str, config: &ObservabilityConfig) -> Result<MetricsHandle> {
    let addr = SocketAddr::from(([0, 0, 0, 0], config.metrics_port));
    let (recorder, exporter) = PrometheusBuilder::new()
        .with_http_listener(addr)
        .build()?;

    metrics::set_global_recorder(recorder).map_err(|_| anyhow!("全局 metrics recorder 已存在"))?;

    register_common_metrics(service_name);

    let server_handle = tokio::spawn(async move {
        if let Err(e) = exporter.await {
            error!("Metrics exporter error: {:?}", e);
        }
    });
    info!("Metrics server listening on {}", addr);

    Ok(MetricsHandle {
        _server_handle: server_handle,
    })
}

/// 注册通用指标描述，会出现在 /metrics 的 HELP 注释中
fn register_common_metrics(service_name: &str) {
    metrics::describe_counter!(
        "queue_messages_published_total",
        "Total number of messages published"
    );
    metrics::describe_counter!(
        "queue_messages_handled_total",
        "Total number of messages handled, labelled by status"
    );
    metrics::describe_counter!(
        "queue_handler_failures_total",
        "Total number of handler failures left for redelivery"
    );
    metrics::describe_counter!(
        "queue_dead_lettered_total",
        "Total number of messages moved to the dead-letter queue"
    );
    metrics::describe_histogram!(
        "queue_handler_duration_seconds",
        "Message handler duration in seconds"
    );

    metrics::counter!("service_starts_total", "service" => service_name.to_string()).increment(1);
}

/// 记录一条消息的处理结果
#[inline]
pub fn record_message_handled(queue: &str, status: &str, duration: Duration) {
    metrics::counter!(
        "queue_messages_handled_total",
        "queue" => queue.to_string(),
        "status" => status.to_string()
    )
    .increment(1);

    metrics::histogram!("queue_handler_duration_seconds", "queue" => queue.to_string())
        .record(duration.as_secs_f64());
}

/// 记录一次 handler 失败（消息未确认）
#[inline]
pub fn record_handler_failure(queue: &str, duration: Duration) {
    metrics::counter!("queue_handler_failures_total", "queue" => queue.to_string()).increment(1);

    metrics::histogram!("queue_handler_duration_seconds", "queue" => queue.to_string())
        .record(duration.as_secs_f64());
}
