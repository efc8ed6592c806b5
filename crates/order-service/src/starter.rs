//! 消费启动器
//!
//! 负责把分发器挂到每个队列上，并管理整个消费生命周期：
//!
//! ```text
//! idle ──start──▶ starting ──首个订阅成功──▶ listening ──stop──▶ stopped
//!                    │                                            │
//!                    └──────────── 订阅失败 ──────────────────────▶┘
//! ```
//!
//! stopped 状态可以再次 start。

use std::fmt;
use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::{Mutex, watch};
use tracing::{error, info, warn};

use order_shared::config::ConsumerConfig;
use order_shared::error::QueueError;
use order_shared::queue::{DeliveryHandler, QueueClient, Subscription};
use order_shared::retry::{RetryPolicy, retry_with_policy};

use crate::dispatcher::MessageDispatcher;
use crate::error::{OrderError, Result};

/// 启动器生命周期状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StarterState {
    Idle,
    Starting,
    Listening,
    Stopped,
}

impl StarterState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Starting => "starting",
            Self::Listening => "listening",
            Self::Stopped => "stopped",
        }
    }
}

impl fmt::Display for StarterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub struct MessageQueueStarter {
    client: Arc<dyn QueueClient>,
    dispatcher: Arc<MessageDispatcher>,
    consumers_per_queue: usize,
    connect_retry: RetryPolicy,
    state: watch::Sender<StarterState>,
    subscriptions: Mutex<Vec<Subscription>>,
}

impl MessageQueueStarter {
    pub fn new(
        client: Arc<dyn QueueClient>,
        dispatcher: Arc<MessageDispatcher>,
        config: &ConsumerConfig,
    ) -> Self {
        let (state, _) = watch::channel(StarterState::Idle);
        Self {
            client,
            dispatcher,
            consumers_per_queue: config.consumers_per_queue.max(1),
            connect_retry: config.connect_retry.to_policy(),
            state,
            subscriptions: Mutex::new(Vec::new()),
        }
    }

    pub fn state(&self) -> StarterState {
        *self.state.borrow()
    }

    /// 订阅状态变化
    pub fn watch_state(&self) -> watch::Receiver<StarterState> {
        self.state.subscribe()
    }

    /// 为每个绑定的队列注册订阅
    ///
    /// 只允许在 idle 或 stopped 状态调用。订阅连接失败会按重试策略重试，
    /// 耗尽后撤销已建立的订阅，回到 stopped 并返回错误。
    pub async fn start(&self) -> Result<()> {
        let mut subscriptions = self.subscriptions.lock().await;

        let current = self.state();
        if !matches!(current, StarterState::Idle | StarterState::Stopped) {
            return Err(OrderError::InvalidState {
                state: current.as_str(),
                operation: "start",
            });
        }
        self.state.send_replace(StarterState::Starting);
        self.dispatcher.resume();

        let queues = self.dispatcher.routes().queues();
        info!(
            queues = ?queues,
            consumers_per_queue = self.consumers_per_queue,
            "开始注册订阅"
        );

        for queue in &queues {
            for _ in 0..self.consumers_per_queue {
                match self.subscribe(queue).await {
                    Ok(subscription) => {
                        subscriptions.push(subscription);
                        if self.state() == StarterState::Starting {
                            self.state.send_replace(StarterState::Listening);
                        }
                    }
                    Err(e) => {
                        error!(queue = %queue, error = %e, "订阅失败，撤销已建立的订阅");
                        self.dispatcher.begin_drain();
                        join_all(subscriptions.drain(..).map(Subscription::shutdown)).await;
                        self.state.send_replace(StarterState::Stopped);
                        return Err(e.into());
                    }
                }
            }
        }

        if subscriptions.is_empty() {
            warn!("没有绑定任何队列");
            self.state.send_replace(StarterState::Stopped);
            return Ok(());
        }

        info!(subscriptions = subscriptions.len(), "消费者已就绪");
        Ok(())
    }

    async fn subscribe(&self, queue: &str) -> std::result::Result<Subscription, QueueError> {
        let handler: Arc<dyn DeliveryHandler> = self.dispatcher.clone();
        retry_with_policy(
            &self.connect_retry,
            "subscribe",
            QueueError::is_retryable,
            || self.client.consume(queue, handler.clone()),
        )
        .await
    }

    /// 停止消费
    ///
    /// 正在执行的 handler 会先完成并确认；阻塞在事件通道上的 message-handled
    /// 事件会被丢弃，不等待接收端。非 listening 状态下调用无副作用。
    pub async fn stop(&self) -> Result<()> {
        let mut subscriptions = self.subscriptions.lock().await;

        if self.state() != StarterState::Listening {
            info!(state = %self.state(), "消费者未在运行，忽略 stop");
            return Ok(());
        }

        let count = subscriptions.len();
        self.dispatcher.begin_drain();
        join_all(subscriptions.drain(..).map(Subscription::shutdown)).await;
        self.state.send_replace(StarterState::Stopped);

        info!(subscriptions = count, "消费者已停止");
        Ok(())
    }
}
