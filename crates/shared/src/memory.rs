//! 进程内消息队列
//!
//! 实现 [`QueueClient`]，语义与 Kafka 客户端保持一致（确认、有上限的重投、死信），
//! 用于本地开发和测试。额外提供发布记录、确认记录的查询以及故障注入。

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::{Notify, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::dlq::DeadLetterMessage;
use crate::error::{QueueError, Result};
use crate::queue::{
    Acknowledgement, Delivery, DeliveryHandler, MESSAGE_ID_HEADER, QueueClient, Subscription,
    topics, wait_for_stop,
};

/// 已发布消息记录
#[derive(Debug, Clone)]
pub struct PublishedMessage {
    pub queue: String,
    pub message_id: String,
    pub payload: Vec<u8>,
}

impl PublishedMessage {
    pub fn json(&self) -> serde_json::Value {
        serde_json::from_slice(&self.payload).unwrap_or(serde_json::Value::Null)
    }
}

/// ack / nack 记录
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckRecord {
    pub queue: String,
    pub delivery_tag: u64,
    pub message_id: String,
    pub attempt: u32,
}

impl AckRecord {
    fn of(delivery: &Delivery) -> Self {
        Self {
            queue: delivery.queue.clone(),
            delivery_tag: delivery.delivery_tag,
            message_id: delivery.message_id(),
            attempt: delivery.attempt,
        }
    }
}

#[derive(Default)]
struct QueueState {
    pending: Mutex<VecDeque<Delivery>>,
    notify: Notify,
    next_tag: AtomicU64,
}

impl QueueState {
    fn push_back(&self, delivery: Delivery) {
        self.pending.lock().push_back(delivery);
        self.notify.notify_one();
    }

    fn push_front(&self, delivery: Delivery) {
        self.pending.lock().push_front(delivery);
        self.notify.notify_one();
    }

    async fn next(&self) -> Delivery {
        loop {
            if let Some(delivery) = self.pending.lock().pop_front() {
                return delivery;
            }
            self.notify.notified().await;
        }
    }
}

struct Inner {
    queues: DashMap<String, Arc<QueueState>>,
    published: Mutex<Vec<PublishedMessage>>,
    acked: Mutex<Vec<AckRecord>>,
    nacked: Mutex<Vec<AckRecord>>,
    dead_lettered: Mutex<Vec<DeadLetterMessage>>,
    connect_failures: AtomicU32,
    fail_publishes: AtomicBool,
    closed: watch::Sender<bool>,
    max_redeliveries: u32,
    dead_letter_queue: String,
}

impl Inner {
    fn queue(&self, name: &str) -> Arc<QueueState> {
        self.queues
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(QueueState::default()))
            .clone()
    }

    fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    fn enqueue(&self, queue: &str, payload: &[u8]) -> String {
        let state = self.queue(queue);
        let message_id = Uuid::now_v7().to_string();
        let delivery = Delivery {
            queue: queue.to_string(),
            delivery_tag: state.next_tag.fetch_add(1, Ordering::SeqCst) + 1,
            partition: 0,
            key: Some(message_id.clone()),
            payload: payload.to_vec(),
            timestamp: Some(Utc::now().timestamp_millis()),
            headers: HashMap::from([(MESSAGE_ID_HEADER.to_string(), message_id.clone())]),
            attempt: 0,
        };
        state.push_back(delivery);
        message_id
    }

    /// 根据 handler 返回值执行确认动作
    fn settle(&self, state: &QueueState, delivery: Delivery, ack: Acknowledgement) {
        match ack {
            Acknowledgement::Ack => {
                self.acked.lock().push(AckRecord::of(&delivery));
            }
            Acknowledgement::Nack { requeue } => {
                self.nacked.lock().push(AckRecord::of(&delivery));

                if requeue && delivery.attempt < self.max_redeliveries {
                    debug!(
                        queue = %delivery.queue,
                        delivery_tag = delivery.delivery_tag,
                        attempt = delivery.attempt,
                        "消息未确认，重新入队"
                    );
                    let mut redelivery = delivery;
                    redelivery.attempt += 1;
                    state.push_front(redelivery);
                } else {
                    let reason = if requeue {
                        "重投次数耗尽"
                    } else {
                        "消费者拒绝且不重投"
                    };
                    self.dead_letter(&delivery, reason);
                }
            }
        }
    }

    fn dead_letter(&self, delivery: &Delivery, reason: &str) {
        let letter = DeadLetterMessage::from_delivery(delivery, reason, "memory-queue");
        warn!(
            queue = %delivery.queue,
            message_id = %letter.message_id,
            attempts = letter.attempts,
            reason,
            "消息移入死信队列"
        );
        if let Ok(bytes) = letter.to_bytes() {
            self.enqueue(&self.dead_letter_queue, &bytes);
        }
        self.dead_lettered.lock().push(letter);
    }
}

/// 进程内消息队列客户端
///
/// Clone 后共享同一份队列状态。
#[derive(Clone)]
pub struct InMemoryQueueClient {
    inner: Arc<Inner>,
}

impl Default for InMemoryQueueClient {
    fn default() -> Self {
        Self::new(5)
    }
}

impl InMemoryQueueClient {
    /// `max_redeliveries` 对应 broker 的重投上限
    pub fn new(max_redeliveries: u32) -> Self {
        let (closed, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                queues: DashMap::new(),
                published: Mutex::new(Vec::new()),
                acked: Mutex::new(Vec::new()),
                nacked: Mutex::new(Vec::new()),
                dead_lettered: Mutex::new(Vec::new()),
                connect_failures: AtomicU32::new(0),
                fail_publishes: AtomicBool::new(false),
                closed,
                max_redeliveries,
                dead_letter_queue: topics::DEAD_LETTER_QUEUE.to_string(),
            }),
        }
    }

    /// 模拟外部生产者投递一条消息，不计入发布记录
    pub fn deliver(&self, queue: &str, payload: &[u8]) -> String {
        self.inner.enqueue(queue, payload)
    }

    /// 以 JSON 形式投递
    pub fn deliver_json(&self, queue: &str, value: &serde_json::Value) -> String {
        let payload = serde_json::to_vec(value).unwrap_or_default();
        self.deliver(queue, &payload)
    }

    /// 经由 `send_message` 发布到指定队列的消息
    pub fn published(&self, queue: &str) -> Vec<PublishedMessage> {
        self.inner
            .published
            .lock()
            .iter()
            .filter(|m| m.queue == queue)
            .cloned()
            .collect()
    }

    pub fn acked(&self) -> Vec<AckRecord> {
        self.inner.acked.lock().clone()
    }

    pub fn nacked(&self) -> Vec<AckRecord> {
        self.inner.nacked.lock().clone()
    }

    pub fn dead_lettered(&self) -> Vec<DeadLetterMessage> {
        self.inner.dead_lettered.lock().clone()
    }

    /// 队列中尚未被消费的消息数
    pub fn pending(&self, queue: &str) -> usize {
        self.inner.queue(queue).pending.lock().len()
    }

    /// 接下来 n 次 `consume` 调用返回连接错误
    pub fn fail_next_connects(&self, n: u32) {
        self.inner.connect_failures.store(n, Ordering::SeqCst);
    }

    /// 开启后所有 `send_message` 返回发布错误
    pub fn fail_publishes(&self, fail: bool) {
        self.inner.fail_publishes.store(fail, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }
}

#[async_trait]
impl QueueClient for InMemoryQueueClient {
    async fn send_message(&self, queue: &str, payload: &[u8]) -> Result<()> {
        if self.inner.is_closed() {
            return Err(QueueError::publish(queue, "客户端已关闭"));
        }
        if self.inner.fail_publishes.load(Ordering::SeqCst) {
            return Err(QueueError::publish(queue, "broker 不可达"));
        }

        let message_id = self.inner.enqueue(queue, payload);
        self.inner.published.lock().push(PublishedMessage {
            queue: queue.to_string(),
            message_id: message_id.clone(),
            payload: payload.to_vec(),
        });
        metrics::counter!("queue_messages_published_total", "queue" => queue.to_string())
            .increment(1);
        debug!(queue, message_id, "消息已发布");
        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        handler: Arc<dyn DeliveryHandler>,
    ) -> Result<Subscription> {
        if self.inner.is_closed() {
            return Err(QueueError::Connect("客户端已关闭".to_string()));
        }
        let injected = self
            .inner
            .connect_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(QueueError::Connect(format!("无法订阅队列 {queue}")));
        }

        let inner = self.inner.clone();
        let state = inner.queue(queue);
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let mut closed_rx = inner.closed.subscribe();
        let queue_name = queue.to_string();

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;

                    _ = wait_for_stop(&mut stop_rx, &mut closed_rx) => {
                        // 退出时可能吞掉一次唤醒，交还给同队列的其他订阅
                        if !state.pending.lock().is_empty() {
                            state.notify.notify_one();
                        }
                        info!(queue = %queue_name, "收到关闭信号，消费循环退出");
                        break;
                    }

                    delivery = state.next() => {
                        let ack = handler.handle(delivery.clone()).await;
                        inner.settle(&state, delivery.clone(), ack);
                        handler.on_settled(&delivery, ack, Ok(())).await;
                    }
                }
            }
        });

        info!(queue, "已订阅进程内队列");
        Ok(Subscription::new(queue, stop_tx, task))
    }

    async fn close(&self) -> Result<()> {
        if !self.inner.closed.send_replace(true) {
            info!("进程内队列客户端已关闭");
        }
        Ok(())
    }
}
