//! Kafka 队列客户端
//!
//! 将 rdkafka 的底层 API 封装为 [`QueueClient`]：
//! - 发布使用 `FutureProducer`，等待 broker 确认，超时映射为发布错误；
//! - 每个订阅独立创建 `StreamConsumer`，关闭自动提交，handler 返回 ack 后同步提交 offset，
//!   提交完成后才回调 `on_settled`；
//! - nack 时 seek 回原 offset 并按退避策略等待，超过重投上限写入死信 topic。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::{BorrowedMessage, Header, Headers, Message, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::{Offset, TopicPartitionList};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::QueueConfig;
use crate::dlq::DeadLetterMessage;
use crate::error::{QueueError, Result};
use crate::queue::{
    Acknowledgement, Delivery, DeliveryHandler, MESSAGE_ID_HEADER, QueueClient, Subscription,
    wait_for_stop,
};
use crate::retry::RetryPolicy;

impl Delivery {
    /// 从 rdkafka 的借用消息构造，提取并拥有所有字段
    fn from_borrowed(msg: &BorrowedMessage<'_>, attempt: u32) -> Self {
        let key = msg
            .key()
            .and_then(|k| std::str::from_utf8(k).ok())
            .map(String::from);

        let payload = msg.payload().map(|p| p.to_vec()).unwrap_or_default();

        let mut headers = HashMap::new();
        if let Some(h) = msg.headers() {
            for idx in 0..h.count() {
                let header = h.get(idx);
                if let Some(raw) = header.value
                    && let Ok(value) = std::str::from_utf8(raw)
                {
                    headers.insert(header.key.to_string(), value.to_string());
                }
            }
        }

        Self {
            queue: msg.topic().to_string(),
            delivery_tag: msg.offset().max(0) as u64,
            partition: msg.partition(),
            key,
            payload,
            timestamp: msg.timestamp().to_millis(),
            headers,
            attempt,
        }
    }
}

/// 基于 Kafka 的队列客户端
pub struct KafkaQueueClient {
    producer: FutureProducer,
    config: QueueConfig,
    closed: watch::Sender<bool>,
}

impl KafkaQueueClient {
    /// 根据配置创建客户端
    ///
    /// 创建 producer 不会建立连接；真正的连通性检查发生在 `consume` 时拉取元数据。
    pub fn new(config: &QueueConfig) -> Result<Self> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &config.brokers)
            .set("message.timeout.ms", config.publish_timeout_ms.to_string())
            .create()
            .map_err(|e| QueueError::Connect(format!("创建生产者失败: {e}")))?;

        let (closed, _) = watch::channel(false);

        info!(brokers = %config.brokers, "Kafka 队列客户端已初始化");
        Ok(Self {
            producer,
            config: config.clone(),
            closed,
        })
    }

    fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    fn create_consumer(&self) -> Result<StreamConsumer> {
        ClientConfig::new()
            .set("bootstrap.servers", &self.config.brokers)
            .set("group.id", &self.config.consumer_group)
            .set("auto.offset.reset", &self.config.auto_offset_reset)
            .set("enable.auto.commit", "false")
            .create()
            .map_err(|e| QueueError::Connect(format!("创建消费者失败: {e}")))
    }

    /// 拉取 topic 元数据，验证 broker 在超时时间内可达
    async fn ensure_reachable(
        consumer: Arc<StreamConsumer>,
        queue: &str,
        timeout: Duration,
    ) -> Result<()> {
        let topic = queue.to_string();
        tokio::task::spawn_blocking(move || {
            consumer
                .fetch_metadata(Some(topic.as_str()), timeout)
                .map(|_| ())
                .map_err(|e| QueueError::Connect(format!("broker 不可达: {e}")))
        })
        .await
        .map_err(|e| QueueError::Internal(format!("元数据拉取任务异常: {e}")))?
    }
}

#[async_trait]
impl QueueClient for KafkaQueueClient {
    async fn send_message(&self, queue: &str, payload: &[u8]) -> Result<()> {
        if self.is_closed() {
            return Err(QueueError::publish(queue, "客户端已关闭"));
        }

        let message_id = Uuid::now_v7().to_string();
        let headers = OwnedHeaders::new().insert(Header {
            key: MESSAGE_ID_HEADER,
            value: Some(message_id.as_str()),
        });
        let record = FutureRecord::to(queue)
            .key(message_id.as_str())
            .payload(payload)
            .headers(headers);

        let delivery = self
            .producer
            .send(record, self.config.publish_timeout())
            .await
            .map_err(|(e, _)| QueueError::publish(queue, e.to_string()))?;

        metrics::counter!("queue_messages_published_total", "queue" => queue.to_string())
            .increment(1);
        debug!(
            queue,
            message_id,
            partition = delivery.partition,
            offset = delivery.offset,
            "消息已发送"
        );
        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        handler: Arc<dyn DeliveryHandler>,
    ) -> Result<Subscription> {
        if self.is_closed() {
            return Err(QueueError::Connect("客户端已关闭".to_string()));
        }

        let consumer = Arc::new(self.create_consumer()?);
        Self::ensure_reachable(consumer.clone(), queue, self.config.connect_timeout()).await?;
        consumer
            .subscribe(&[queue])
            .map_err(|e| QueueError::Connect(format!("订阅 topic 失败: {e}")))?;

        let (stop_tx, stop_rx) = watch::channel(false);
        let consume_loop = ConsumeLoop {
            consumer,
            handler,
            producer: self.producer.clone(),
            redelivery: self.config.redelivery_policy(),
            dead_letter_queue: self.config.dead_letter_queue.clone(),
            publish_timeout: self.config.publish_timeout(),
            source_service: self.config.consumer_group.clone(),
        };
        let task = tokio::spawn(consume_loop.run(stop_rx, self.closed.subscribe()));

        info!(queue, group_id = %self.config.consumer_group, "已订阅 Kafka topic");
        Ok(Subscription::new(queue, stop_tx, task))
    }

    async fn close(&self) -> Result<()> {
        if self.closed.send_replace(true) {
            return Ok(());
        }

        let producer = self.producer.clone();
        let timeout = self.config.publish_timeout();
        tokio::task::spawn_blocking(move || producer.flush(timeout))
            .await
            .map_err(|e| QueueError::Internal(format!("flush 任务异常: {e}")))?
            .map_err(|e| QueueError::Kafka(format!("关闭前刷新生产者失败: {e}")))?;

        info!("Kafka 队列客户端已关闭");
        Ok(())
    }
}

/// 单个订阅的消费循环
struct ConsumeLoop {
    consumer: Arc<StreamConsumer>,
    handler: Arc<dyn DeliveryHandler>,
    producer: FutureProducer,
    redelivery: RetryPolicy,
    dead_letter_queue: String,
    publish_timeout: Duration,
    source_service: String,
}

impl ConsumeLoop {
    /// 使用 `tokio::select!` 同时监听消息流和关闭信号
    ///
    /// 关闭信号只在两条消息之间生效，handler 不会被中途打断。
    async fn run(self, mut stop: watch::Receiver<bool>, mut closed: watch::Receiver<bool>) {
        use futures::StreamExt;

        // (partition, offset) -> 已投递次数
        let mut attempts: HashMap<(i32, i64), u32> = HashMap::new();
        let stream = self.consumer.stream();
        futures::pin_mut!(stream);

        loop {
            tokio::select! {
                biased;

                _ = wait_for_stop(&mut stop, &mut closed) => {
                    info!("收到关闭信号，Kafka 消费循环退出");
                    break;
                }

                msg_result = stream.next() => {
                    let Some(msg_result) = msg_result else {
                        warn!("Kafka 消息流意外结束");
                        break;
                    };

                    let borrowed = match msg_result {
                        Ok(m) => m,
                        Err(e) => {
                            error!(error = %e, "接收 Kafka 消息出错");
                            continue;
                        }
                    };

                    let position = (borrowed.partition(), borrowed.offset());
                    let attempt = attempts.get(&position).copied().unwrap_or(0);
                    let delivery = Delivery::from_borrowed(&borrowed, attempt);
                    drop(borrowed);

                    let ack = self.handler.handle(delivery.clone()).await;
                    let (settled, result) = self.settle(&delivery, position, ack).await;
                    match settled {
                        Settled::Done => {
                            attempts.remove(&position);
                        }
                        Settled::Redeliver => {
                            attempts.insert(position, attempt + 1);
                        }
                    }
                    self.handler.on_settled(&delivery, ack, result).await;
                }
            }
        }
    }

    async fn settle(
        &self,
        delivery: &Delivery,
        (partition, offset): (i32, i64),
        ack: Acknowledgement,
    ) -> (Settled, Result<()>) {
        match ack {
            Acknowledgement::Ack => {
                let result = self.commit(&delivery.queue, partition, offset).await;
                (Settled::Done, result)
            }
            Acknowledgement::Nack { requeue }
                if requeue && self.redelivery.should_retry(delivery.attempt) =>
            {
                let delay = self.redelivery.delay_for_attempt(delivery.attempt);
                debug!(
                    queue = %delivery.queue,
                    partition,
                    offset,
                    attempt = delivery.attempt,
                    delay_ms = delay.as_millis() as u64,
                    "消息未确认，退避后重投"
                );
                tokio::time::sleep(delay).await;
                if let Err(e) = self.consumer.seek(
                    &delivery.queue,
                    partition,
                    Offset::Offset(offset),
                    Duration::from_secs(5),
                ) {
                    error!(
                        queue = %delivery.queue,
                        partition,
                        offset,
                        error = %e,
                        "seek 回原 offset 失败"
                    );
                }
                (Settled::Redeliver, Ok(()))
            }
            Acknowledgement::Nack { requeue } => {
                let reason = if requeue {
                    "重投次数耗尽"
                } else {
                    "消费者拒绝且不重投"
                };
                self.dead_letter(delivery, reason).await;
                let result = self.commit(&delivery.queue, partition, offset).await;
                (Settled::Done, result)
            }
        }
    }

    /// 同步提交下一条待消费的 offset
    ///
    /// 提交在阻塞线程池执行，返回时 broker 已确认；消费循环退出时不会留下未发出的提交。
    async fn commit(&self, topic: &str, partition: i32, offset: i64) -> Result<()> {
        let mut tpl = TopicPartitionList::new();
        tpl.add_partition_offset(topic, partition, Offset::Offset(offset + 1))
            .map_err(|e| QueueError::Kafka(format!("构造提交位点失败: {e}")))?;

        let consumer = self.consumer.clone();
        let result = tokio::task::spawn_blocking(move || consumer.commit(&tpl, CommitMode::Sync))
            .await
            .map_err(|e| QueueError::Internal(format!("提交任务异常: {e}")))?
            .map_err(|e| QueueError::Kafka(format!("提交 offset 失败: {e}")));

        if let Err(e) = &result {
            error!(topic, partition, offset, error = %e, "提交 offset 失败");
        }
        result
    }

    async fn dead_letter(&self, delivery: &Delivery, reason: &str) {
        let letter = DeadLetterMessage::from_delivery(delivery, reason, &self.source_service);
        let bytes = match letter.to_bytes() {
            Ok(b) => b,
            Err(e) => {
                error!(message_id = %letter.message_id, error = %e, "死信序列化失败");
                return;
            }
        };

        let record = FutureRecord::to(&self.dead_letter_queue)
            .key(letter.message_id.as_str())
            .payload(bytes.as_slice());
        match self.producer.send(record, self.publish_timeout).await {
            Ok(_) => {
                metrics::counter!("queue_dead_lettered_total", "queue" => delivery.queue.clone())
                    .increment(1);
                warn!(
                    message_id = %letter.message_id,
                    source_queue = %letter.source_queue,
                    attempts = letter.attempts,
                    reason,
                    "消息已移入死信队列"
                );
            }
            Err((e, _)) => {
                error!(
                    message_id = %letter.message_id,
                    error = %e,
                    "发送到死信队列失败，消息可能丢失"
                );
            }
        }
    }
}

enum Settled {
    Done,
    Redeliver,
}

#[cfg(test)]
mod tests {
    use super::*;

    /// 指向不存在的 broker；创建客户端本身不需要连接
    fn unreachable_config() -> QueueConfig {
        QueueConfig {
            brokers: "127.0.0.1:1".to_string(),
            connect_timeout_ms: 200,
            publish_timeout_ms: 200,
            ..QueueConfig::default()
        }
    }

    #[tokio::test]
    async fn test_send_after_close_is_rejected() {
        let client = KafkaQueueClient::new(&unreachable_config()).unwrap();

        client.close().await.unwrap();
        // 重复关闭无副作用
        client.close().await.unwrap();

        let err = client.send_message("order.placed", b"{}").await.unwrap_err();
        assert!(matches!(err, QueueError::Publish { .. }));
    }

    #[tokio::test]
    async fn test_consume_fails_when_broker_unreachable() {
        struct NoopHandler;

        #[async_trait]
        impl DeliveryHandler for NoopHandler {
            async fn handle(&self, _delivery: Delivery) -> Acknowledgement {
                Acknowledgement::Ack
            }
        }

        let client = KafkaQueueClient::new(&unreachable_config()).unwrap();
        let result = client.consume("user.deleted", Arc::new(NoopHandler)).await;
        assert!(matches!(result, Err(QueueError::Connect(_))));
    }
}
