//! 消息队列能力抽象
//!
//! 将 broker 的差异收敛到 [`QueueClient`] trait 后面：业务侧只关心
//! 发布、订阅和确认语义，测试时可替换为进程内实现而无需改动消费者。

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::error::{QueueError, Result};

/// 集中管理所有队列名称，防止字符串散落在各处导致拼写不一致
pub mod topics {
    pub const ORDER_REQUESTS: &str = "order.requests";
    pub const USER_DELETED: &str = "user.deleted";
    pub const ORDER_PLACED: &str = "order.placed";
    pub const DEAD_LETTER_QUEUE: &str = "order.dlq";
}

/// 消息头中携带消息 ID 的键
pub const MESSAGE_ID_HEADER: &str = "message-id";

// ---------------------------------------------------------------------------
// Delivery
// ---------------------------------------------------------------------------

/// 一次投递的消息
///
/// 拥有所有权，可以安全地跨 await 点传给异步处理函数。
/// `attempt` 为 0 表示首次投递，每次重投加 1。
#[derive(Debug, Clone)]
pub struct Delivery {
    pub queue: String,
    pub delivery_tag: u64,
    pub partition: i32,
    pub key: Option<String>,
    pub payload: Vec<u8>,
    pub timestamp: Option<i64>,
    pub headers: HashMap<String, String>,
    pub attempt: u32,
}

impl Delivery {
    /// 消息的逻辑 ID：优先取消息头，其次取 key，最后退化为队列 + 投递标签
    pub fn message_id(&self) -> String {
        self.headers
            .get(MESSAGE_ID_HEADER)
            .cloned()
            .or_else(|| self.key.clone())
            .unwrap_or_else(|| format!("{}-{}", self.queue, self.delivery_tag))
    }

    /// 将 JSON 格式负载反序列化为目标类型
    pub fn deserialize_payload<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_slice(&self.payload)
            .map_err(|e| QueueError::Serialization(format!("负载反序列化失败: {e}")))
    }

    /// 负载的有损 UTF-8 表示，用于日志与死信
    pub fn payload_lossy(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }
}

/// 处理结果对应的 broker 确认动作
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acknowledgement {
    /// 处理完成，从队列移除
    Ack,
    /// 未完成；`requeue` 为 true 时等待重投，否则直接进入死信
    Nack { requeue: bool },
}

impl Acknowledgement {
    pub fn requeue() -> Self {
        Self::Nack { requeue: true }
    }
}

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

/// 投递回调
///
/// 每条投递先调用 `handle`，返回值决定客户端向 broker 发出 ack 还是 nack；
/// 客户端执行完确认动作后再调用 `on_settled`，两次调用在同一个消费循环里串行发生。
#[async_trait]
pub trait DeliveryHandler: Send + Sync {
    async fn handle(&self, delivery: Delivery) -> Acknowledgement;

    /// 确认动作已提交给 broker
    ///
    /// `result` 为 broker 侧的提交结果；失败时消息可能被再次投递。
    async fn on_settled(
        &self,
        _delivery: &Delivery,
        _ack: Acknowledgement,
        _result: Result<()>,
    ) {
    }
}

/// 消息队列客户端能力
#[async_trait]
pub trait QueueClient: Send + Sync {
    /// 发布消息，连接丢失或确认超时返回 `Publish` 错误
    async fn send_message(&self, queue: &str, payload: &[u8]) -> Result<()>;

    /// 注册订阅并在后台启动消费循环，返回后订阅已生效
    async fn consume(&self, queue: &str, handler: Arc<dyn DeliveryHandler>)
    -> Result<Subscription>;

    /// 释放连接，重复调用无副作用
    async fn close(&self) -> Result<()>;
}

// ---------------------------------------------------------------------------
// Subscription
// ---------------------------------------------------------------------------

/// 已注册订阅的句柄
///
/// 持有消费循环的任务句柄和关闭信号。`shutdown` 是协作式的：
/// 消费循环只在两条消息之间检查信号，正在执行的 handler 会先完成。
pub struct Subscription {
    queue: String,
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl Subscription {
    pub fn new(queue: impl Into<String>, stop: watch::Sender<bool>, task: JoinHandle<()>) -> Self {
        Self {
            queue: queue.into(),
            stop,
            task,
        }
    }

    /// 消费循环是否已退出
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// 发送关闭信号并等待消费循环排空
    pub async fn shutdown(self) {
        let _ = self.stop.send(true);
        if let Err(e) = self.task.await {
            warn!(queue = %self.queue, error = %e, "消费循环异常退出");
        } else {
            info!(queue = %self.queue, "订阅已关闭");
        }
    }
}

/// 等待任一关闭信号变为 true
///
/// 订阅自身的信号和客户端级别的关闭信号都会让消费循环退出。
/// 发送端被丢弃同样视为关闭。
pub(crate) async fn wait_for_stop(
    stop: &mut watch::Receiver<bool>,
    closed: &mut watch::Receiver<bool>,
) {
    loop {
        if *stop.borrow() || *closed.borrow() {
            return;
        }
        tokio::select! {
            changed = stop.changed() => {
                if changed.is_err() {
                    return;
                }
            }
            changed = closed.changed() => {
                if changed.is_err() {
                    return;
                }
            }
        }
    }
}
