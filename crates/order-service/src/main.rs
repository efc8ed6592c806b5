//! 订单消费服务
//!
//! 消费下单与删除队列，处理结果以 message-handled 事件输出到日志。

use std::sync::Arc;

use order_service::{OrderApp, ledger, store::MemoryOrderStore};
use order_shared::{
    config::{AppConfig, QueueBackend},
    kafka::KafkaQueueClient,
    memory::InMemoryQueueClient,
    observability,
    queue::QueueClient,
};
use tracing::{debug, error, info, warn};

const SERVICE_NAME: &str = "order-service";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    // 配置加载失败时使用默认配置，便于本地直接启动
    let config = AppConfig::load(SERVICE_NAME).unwrap_or_else(|e| {
        eprintln!("加载配置失败，使用默认配置: {e}");
        AppConfig {
            service_name: SERVICE_NAME.to_string(),
            ..AppConfig::default()
        }
    });

    let _guard = observability::init(&config.service_name, &config.observability)?;

    info!(
        environment = %config.environment,
        backend = ?config.queue.backend,
        "Starting order-service..."
    );

    let client: Arc<dyn QueueClient> = match config.queue.backend {
        QueueBackend::Kafka => Arc::new(KafkaQueueClient::new(&config.queue)?),
        QueueBackend::Memory => {
            if config.is_production() {
                anyhow::bail!("生产环境不允许使用进程内队列");
            }
            warn!("使用进程内队列，消息不会跨进程共享");
            Arc::new(InMemoryQueueClient::new(config.queue.max_redeliveries))
        }
    };

    let ledger = ledger::from_config(&config.ledger, &config.redis).await?;
    let repository = Arc::new(MemoryOrderStore::new());

    let OrderApp {
        starter,
        mut events,
        ..
    } = OrderApp::new(&config, client.clone(), repository, ledger);

    let event_log = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            debug!(
                message_id = %event.message_id,
                queue = %event.queue,
                status = event.status.as_str(),
                dedupe_key = event.dedupe_key.as_deref().unwrap_or("-"),
                "message-handled"
            );
        }
    });

    if let Err(e) = starter.start().await {
        error!(error = %e, "消费者启动失败");
        if let Err(close_err) = client.close().await {
            warn!(error = %close_err, "关闭队列客户端失败");
        }
        return Err(e.into());
    }

    shutdown_signal().await;

    starter.stop().await?;
    client.close().await?;
    // starter 持有最后一个事件发送端，释放后事件任务自然退出
    drop(starter);
    if let Err(e) = event_log.await {
        warn!(error = %e, "事件日志任务异常退出");
    }

    info!("order-service shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "注册 Ctrl+C 处理器失败");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "注册 SIGTERM 处理器失败");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, initiating graceful shutdown..."),
        _ = terminate => info!("Received SIGTERM, initiating graceful shutdown..."),
    }
}
