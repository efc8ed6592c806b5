//! 消息分发器
//!
//! 作为所有订阅共享的 [`DeliveryHandler`]，按队列路由到对应的业务命令。
//!
//! 单条消息的处理流程：
//! 1. 队列 → 消息类型，未绑定的队列视为毒消息
//! 2. 解析与校验，失败视为毒消息（按策略确认或写入死信后确认）
//! 3. 按幂等键加锁，串行化同一业务实体上的并发投递
//! 4. 查询幂等账本，已存在则跳过
//! 5. 执行业务，生效后写入账本
//! 6. 确认消息；客户端提交确认后（`on_settled`）再发出 message-handled 事件
//!
//! 任何瞬时故障都会返回 `Nack { requeue: true }`，由 broker 重投。

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard, mpsc, watch};
use tracing::{debug, error, info, warn};

use order_shared::config::{ConsumerConfig, PoisonPolicy};
use order_shared::dlq::DeadLetterPublisher;
use order_shared::error::QueueError;
use order_shared::observability::metrics as queue_metrics;
use order_shared::queue::{Acknowledgement, Delivery, DeliveryHandler};

use crate::error::{OrderError, Result};
use crate::events::{HandleStatus, MessageHandled};
use crate::ledger::ProcessedLedger;
use crate::messages::{DedupeKey, MessageKind, OrderCommand};
use crate::service::OrderService;

/// 队列到消息类型的绑定
#[derive(Debug, Clone, Default)]
pub struct MessageRoutes {
    routes: Vec<(String, MessageKind)>,
}

impl MessageRoutes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bind(mut self, queue: impl Into<String>, kind: MessageKind) -> Self {
        let queue = queue.into();
        self.routes.retain(|(q, _)| *q != queue);
        self.routes.push((queue, kind));
        self
    }

    /// 下单队列与删除队列
    pub fn from_config(config: &ConsumerConfig) -> Self {
        Self::new()
            .bind(&config.create_order_queue, MessageKind::CreateOrder)
            .bind(&config.delete_order_queue, MessageKind::DeleteOrders)
    }

    pub fn kind_of(&self, queue: &str) -> Option<MessageKind> {
        self.routes
            .iter()
            .find(|(q, _)| q == queue)
            .map(|(_, kind)| *kind)
    }

    /// 按绑定顺序返回队列名
    pub fn queues(&self) -> Vec<String> {
        self.routes.iter().map(|(q, _)| q.clone()).collect()
    }
}

/// 按键粒度的异步互斥锁
///
/// 不同键互不阻塞；最后一个持有者释放后条目被移除。
#[derive(Default)]
struct KeyedLocks {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

struct KeyGuard<'a> {
    locks: &'a DashMap<String, Arc<Mutex<()>>>,
    key: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl KeyedLocks {
    async fn lock(&self, key: &str) -> KeyGuard<'_> {
        let mutex = self.locks.entry(key.to_string()).or_default().clone();
        let guard = mutex.lock_owned().await;
        KeyGuard {
            locks: &self.locks,
            key: key.to_string(),
            guard: Some(guard),
        }
    }

    fn len(&self) -> usize {
        self.locks.len()
    }
}

impl Drop for KeyGuard<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        // 只剩 map 自身持有时说明没有等待者
        self.locks
            .remove_if(&self.key, |_, mutex| Arc::strong_count(mutex) == 1);
    }
}

/// 单条消息的处理结论
#[derive(Debug)]
struct Outcome {
    status: HandleStatus,
    dedupe_key: Option<DedupeKey>,
    reason: Option<String>,
}

impl Outcome {
    fn processed(key: DedupeKey) -> Self {
        Self {
            status: HandleStatus::Processed,
            dedupe_key: Some(key),
            reason: None,
        }
    }

    fn duplicate(key: DedupeKey) -> Self {
        Self {
            status: HandleStatus::DuplicateSkipped,
            dedupe_key: Some(key),
            reason: None,
        }
    }

    fn ignored(key: Option<DedupeKey>, reason: impl Into<String>) -> Self {
        Self {
            status: HandleStatus::Ignored,
            dedupe_key: key,
            reason: Some(reason.into()),
        }
    }
}

/// 一次投递的标识，重投时 attempt 不同
type SettleKey = (String, i32, u64, u32);

fn settle_key(delivery: &Delivery) -> SettleKey {
    (
        delivery.queue.clone(),
        delivery.partition,
        delivery.delivery_tag,
        delivery.attempt,
    )
}

pub struct MessageDispatcher {
    routes: MessageRoutes,
    service: Arc<OrderService>,
    ledger: Arc<dyn ProcessedLedger>,
    locks: KeyedLocks,
    poison_policy: PoisonPolicy,
    dead_letter: Option<DeadLetterPublisher>,
    events: Option<mpsc::Sender<MessageHandled>>,
    /// 已返回 ack、等待客户端提交的处理结论
    unsettled: DashMap<SettleKey, Outcome>,
    draining: watch::Sender<bool>,
}

impl MessageDispatcher {
    pub fn new(
        routes: MessageRoutes,
        service: Arc<OrderService>,
        ledger: Arc<dyn ProcessedLedger>,
    ) -> Self {
        Self {
            routes,
            service,
            ledger,
            locks: KeyedLocks::default(),
            poison_policy: PoisonPolicy::Ack,
            dead_letter: None,
            events: None,
            unsettled: DashMap::new(),
            draining: watch::channel(false).0,
        }
    }

    /// 毒消息写入死信队列后再确认
    pub fn with_dead_letter(mut self, publisher: DeadLetterPublisher) -> Self {
        self.poison_policy = PoisonPolicy::DeadLetter;
        self.dead_letter = Some(publisher);
        self
    }

    /// 发送 message-handled 事件
    ///
    /// 通道满时处理会等待消费方；进入排空阶段后不再等待，事件直接丢弃。
    pub fn with_event_sink(mut self, sender: mpsc::Sender<MessageHandled>) -> Self {
        self.events = Some(sender);
        self
    }

    pub fn routes(&self) -> &MessageRoutes {
        &self.routes
    }

    pub fn poison_policy(&self) -> PoisonPolicy {
        self.poison_policy
    }

    /// 进入排空阶段：阻塞在事件通道上的发送立即放弃
    pub(crate) fn begin_drain(&self) {
        self.draining.send_replace(true);
    }

    pub(crate) fn resume(&self) {
        self.draining.send_replace(false);
    }

    async fn wait_for_drain(&self) {
        let mut draining = self.draining.subscribe();
        loop {
            if *draining.borrow_and_update() {
                return;
            }
            if draining.changed().await.is_err() {
                return;
            }
        }
    }

    async fn process(&self, delivery: &Delivery) -> Result<Outcome> {
        let kind = self
            .routes
            .kind_of(&delivery.queue)
            .ok_or_else(|| OrderError::UnknownQueue {
                queue: delivery.queue.clone(),
            })?;

        let command = OrderCommand::parse(kind, &delivery.payload)?;
        let key = command.dedupe_key();

        let _guard = self.locks.lock(key.as_str()).await;

        if self.ledger.contains(&key).await? {
            info!(dedupe_key = %key, queue = %delivery.queue, "重复消息，跳过处理");
            return Ok(Outcome::duplicate(key));
        }

        let outcome = self.apply(&command, key).await?;

        if outcome.status == HandleStatus::Processed
            && let Some(key) = &outcome.dedupe_key
            && let Err(e) = self.ledger.record(key).await
        {
            warn!(
                dedupe_key = %key,
                error = %e,
                "写入幂等账本失败，后续可能重复处理"
            );
        }

        Ok(outcome)
    }

    async fn apply(&self, command: &OrderCommand, key: DedupeKey) -> Result<Outcome> {
        match command {
            OrderCommand::Create(new_order) => {
                self.service.add_order(new_order.clone()).await?;
                Ok(Outcome::processed(key))
            }
            OrderCommand::DeleteOrder { id } => {
                if self.service.delete_order(*id).await? {
                    Ok(Outcome::processed(key))
                } else {
                    debug!(order_id = id, "订单不存在，无需删除");
                    Ok(Outcome::ignored(Some(key), format!("订单 {id} 不存在")))
                }
            }
            OrderCommand::DeleteUserOrders { user_id } => {
                let removed = self.service.delete_user_orders(*user_id).await?;
                if removed.is_empty() {
                    debug!(user_id, "用户没有订单，无需删除");
                    Ok(Outcome::ignored(Some(key), format!("用户 {user_id} 没有订单")))
                } else {
                    Ok(Outcome::processed(key))
                }
            }
        }
    }

    async fn reject_poison(&self, delivery: &Delivery, err: &OrderError) {
        warn!(
            queue = %delivery.queue,
            message_id = %delivery.message_id(),
            code = err.code(),
            error = %err,
            payload = %delivery.payload_lossy(),
            "无法处理的消息"
        );

        if self.poison_policy == PoisonPolicy::DeadLetter
            && let Some(publisher) = &self.dead_letter
        {
            publisher.publish(delivery, &err.to_string()).await;
        }
    }

    async fn emit(&self, delivery: &Delivery, outcome: Outcome) {
        let Some(sender) = &self.events else {
            return;
        };

        let event = MessageHandled {
            message_id: delivery.message_id(),
            queue: delivery.queue.clone(),
            status: outcome.status,
            dedupe_key: outcome.dedupe_key.map(|k| k.to_string()),
            reason: outcome.reason,
            handled_at: Utc::now(),
        };

        let message_id = event.message_id.clone();
        tokio::select! {
            biased;

            sent = sender.send(event) => {
                if sent.is_err() {
                    debug!("message-handled 接收端已关闭，事件丢弃");
                }
            }

            _ = self.wait_for_drain() => {
                warn!(
                    message_id = %message_id,
                    "消费者正在停止且事件通道已满，丢弃 message-handled 事件"
                );
            }
        }
    }
}

#[async_trait]
impl DeliveryHandler for MessageDispatcher {
    async fn handle(&self, delivery: Delivery) -> Acknowledgement {
        let started = Instant::now();

        let outcome = match self.process(&delivery).await {
            Ok(outcome) => outcome,
            Err(err) if err.is_poison() => {
                self.reject_poison(&delivery, &err).await;
                Outcome::ignored(None, err.to_string())
            }
            Err(err) => {
                error!(
                    queue = %delivery.queue,
                    message_id = %delivery.message_id(),
                    attempt = delivery.attempt,
                    code = err.code(),
                    error = %err,
                    "消息处理失败，等待重投"
                );
                queue_metrics::record_handler_failure(&delivery.queue, started.elapsed());
                return Acknowledgement::requeue();
            }
        };

        queue_metrics::record_message_handled(
            &delivery.queue,
            outcome.status.as_str(),
            started.elapsed(),
        );
        self.unsettled.insert(settle_key(&delivery), outcome);
        Acknowledgement::Ack
    }

    async fn on_settled(
        &self,
        delivery: &Delivery,
        ack: Acknowledgement,
        result: std::result::Result<(), QueueError>,
    ) {
        let Some((_, outcome)) = self.unsettled.remove(&settle_key(delivery)) else {
            return;
        };
        if ack != Acknowledgement::Ack {
            return;
        }
        if let Err(e) = result {
            // 确认未生效，消息可能被重投
            warn!(
                queue = %delivery.queue,
                message_id = %delivery.message_id(),
                error = %e,
                "确认提交失败，不发出 message-handled 事件"
            );
            return;
        }
        self.emit(delivery, outcome).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::time::Duration;

    use order_shared::memory::InMemoryQueueClient;
    use order_shared::queue::topics;

    use crate::ledger::{MemoryLedger, MockProcessedLedger};
    use crate::models::{NewOrder, OrderMode};
    use crate::store::{MemoryOrderStore, MockOrderRepository, OrderRepository};

    fn delivery(queue: &str, tag: u64, payload: serde_json::Value) -> Delivery {
        Delivery {
            queue: queue.to_string(),
            delivery_tag: tag,
            partition: 0,
            key: Some(format!("msg-{tag}")),
            payload: serde_json::to_vec(&payload).unwrap(),
            timestamp: None,
            headers: HashMap::new(),
            attempt: 0,
        }
    }

    /// 模拟消费循环：处理后按客户端提交成功回调
    async fn handle_and_settle(
        dispatcher: &MessageDispatcher,
        delivery: Delivery,
    ) -> Acknowledgement {
        let ack = dispatcher.handle(delivery.clone()).await;
        dispatcher.on_settled(&delivery, ack, Ok(())).await;
        ack
    }

    struct Fixture {
        client: InMemoryQueueClient,
        store: Arc<MemoryOrderStore>,
        dispatcher: MessageDispatcher,
        events: mpsc::Receiver<MessageHandled>,
    }

    fn fixture_with(
        repository: Option<Arc<dyn OrderRepository>>,
        ledger: Arc<dyn ProcessedLedger>,
    ) -> Fixture {
        let client = InMemoryQueueClient::default();
        let store = Arc::new(MemoryOrderStore::new());
        let repository: Arc<dyn OrderRepository> = match repository {
            Some(repository) => repository,
            None => store.clone(),
        };
        let service = Arc::new(OrderService::new(
            repository,
            Arc::new(client.clone()),
            topics::ORDER_PLACED,
        ));
        let (tx, rx) = mpsc::channel(16);
        let dispatcher = MessageDispatcher::new(
            MessageRoutes::from_config(&ConsumerConfig::default()),
            service,
            ledger,
        )
        .with_event_sink(tx);

        Fixture {
            client,
            store,
            dispatcher,
            events: rx,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(None, Arc::new(MemoryLedger::new(Duration::from_secs(60))))
    }

    #[test]
    fn test_routes_from_config() {
        let routes = MessageRoutes::from_config(&ConsumerConfig::default());
        assert_eq!(
            routes.kind_of(topics::ORDER_REQUESTS),
            Some(MessageKind::CreateOrder)
        );
        assert_eq!(
            routes.kind_of(topics::USER_DELETED),
            Some(MessageKind::DeleteOrders)
        );
        assert_eq!(routes.kind_of("audit.log"), None);
        assert_eq!(
            routes.queues(),
            vec![topics::ORDER_REQUESTS.to_string(), topics::USER_DELETED.to_string()]
        );
    }

    #[test]
    fn test_rebinding_a_queue_replaces_kind() {
        let routes = MessageRoutes::new()
            .bind("q", MessageKind::CreateOrder)
            .bind("q", MessageKind::DeleteOrders);
        assert_eq!(routes.queues().len(), 1);
        assert_eq!(routes.kind_of("q"), Some(MessageKind::DeleteOrders));
    }

    #[tokio::test]
    async fn test_delete_existing_order_is_processed() {
        let mut f = fixture();
        let order = f
            .store
            .insert(&NewOrder::new(1, 2, OrderMode::Approved))
            .await
            .unwrap();

        let ack = handle_and_settle(
            &f.dispatcher,
            delivery(topics::USER_DELETED, 1, serde_json::json!({ "id": order.id })),
        )
        .await;

        assert_eq!(ack, Acknowledgement::Ack);
        assert!(f.store.is_empty());
        let event = f.events.recv().await.unwrap();
        assert_eq!(event.status, HandleStatus::Processed);
        assert_eq!(event.message_id, "msg-1");
        assert_eq!(
            event.dedupe_key.as_deref(),
            Some(format!("delete-order:{}", order.id).as_str())
        );
    }

    #[tokio::test]
    async fn test_delete_missing_order_is_ignored() {
        let mut f = fixture();

        let ack = handle_and_settle(
            &f.dispatcher,
            delivery(topics::USER_DELETED, 1, serde_json::json!({ "id": 650 })),
        )
        .await;

        assert_eq!(ack, Acknowledgement::Ack);
        let event = f.events.recv().await.unwrap();
        assert_eq!(event.status, HandleStatus::Ignored);
        assert!(event.reason.unwrap().contains("650"));
    }

    #[tokio::test]
    async fn test_repeated_delete_is_duplicate_skipped() {
        let mut f = fixture();
        let order = f
            .store
            .insert(&NewOrder::new(1, 2, OrderMode::Approved))
            .await
            .unwrap();
        let payload = serde_json::json!({ "id": order.id });

        handle_and_settle(&f.dispatcher, delivery(topics::USER_DELETED, 1, payload.clone())).await;
        let ack = handle_and_settle(&f.dispatcher, delivery(topics::USER_DELETED, 2, payload)).await;

        assert_eq!(ack, Acknowledgement::Ack);
        assert_eq!(f.events.recv().await.unwrap().status, HandleStatus::Processed);
        assert_eq!(
            f.events.recv().await.unwrap().status,
            HandleStatus::DuplicateSkipped
        );
    }

    #[tokio::test]
    async fn test_duplicate_create_is_applied_once() {
        let mut f = fixture();
        let payload = serde_json::json!({
            "userId": 7,
            "productId": 42,
            "mode": "approved",
            "requestId": "req-1"
        });

        for tag in 1..=3 {
            let ack = handle_and_settle(
                &f.dispatcher,
                delivery(topics::ORDER_REQUESTS, tag, payload.clone()),
            )
            .await;
            assert_eq!(ack, Acknowledgement::Ack);
        }

        assert_eq!(f.store.len(), 1);
        assert_eq!(f.client.published(topics::ORDER_PLACED).len(), 1);

        let statuses: Vec<_> = [
            f.events.recv().await.unwrap(),
            f.events.recv().await.unwrap(),
            f.events.recv().await.unwrap(),
        ]
        .into_iter()
        .map(|e| e.status)
        .collect();
        assert_eq!(
            statuses,
            vec![
                HandleStatus::Processed,
                HandleStatus::DuplicateSkipped,
                HandleStatus::DuplicateSkipped
            ]
        );
    }

    #[tokio::test]
    async fn test_poison_messages_are_acked_and_ignored() {
        let mut f = fixture();

        let mut malformed = delivery(topics::USER_DELETED, 1, serde_json::json!({}));
        malformed.payload = b"{\"id\": 65".to_vec();

        let cases = vec![
            malformed,
            delivery(topics::USER_DELETED, 2, serde_json::json!({ "unexpected": true })),
            delivery("audit.log", 3, serde_json::json!({ "id": 1 })),
        ];

        for d in cases {
            assert_eq!(handle_and_settle(&f.dispatcher, d).await, Acknowledgement::Ack);
            let event = f.events.recv().await.unwrap();
            assert_eq!(event.status, HandleStatus::Ignored);
            assert!(event.dedupe_key.is_none());
        }
        assert!(f.client.published(topics::DEAD_LETTER_QUEUE).is_empty());
    }

    #[tokio::test]
    async fn test_poison_message_goes_to_dead_letter_queue() {
        let f = fixture();
        let publisher = DeadLetterPublisher::new(
            Arc::new(f.client.clone()),
            topics::DEAD_LETTER_QUEUE,
            "order-service",
        );
        let dispatcher = f.dispatcher.with_dead_letter(publisher);
        assert_eq!(dispatcher.poison_policy(), PoisonPolicy::DeadLetter);

        let ack = handle_and_settle(
            &dispatcher,
            delivery(topics::USER_DELETED, 9, serde_json::json!({ "unexpected": true })),
        )
        .await;

        assert_eq!(ack, Acknowledgement::Ack);
        let letters = f.client.published(topics::DEAD_LETTER_QUEUE);
        assert_eq!(letters.len(), 1);
        let letter = letters[0].json();
        assert_eq!(letter["messageId"], "msg-9");
        assert_eq!(letter["sourceQueue"], topics::USER_DELETED);
    }

    #[tokio::test]
    async fn test_storage_failure_requeues_without_event() {
        let mut repo = MockOrderRepository::new();
        repo.expect_delete()
            .returning(|_| Err(OrderError::Storage("连接被拒绝".to_string())));

        let mut f = fixture_with(
            Some(Arc::new(repo)),
            Arc::new(MemoryLedger::new(Duration::from_secs(60))),
        );

        let ack = handle_and_settle(
            &f.dispatcher,
            delivery(topics::USER_DELETED, 1, serde_json::json!({ "id": 1 })),
        )
        .await;

        assert_eq!(ack, Acknowledgement::Nack { requeue: true });
        assert!(f.events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_ledger_failure_requeues() {
        let mut ledger = MockProcessedLedger::new();
        ledger
            .expect_contains()
            .returning(|_| Err(order_shared::error::QueueError::Connect("redis down".into())));
        ledger.expect_record().never();

        let mut f = fixture_with(None, Arc::new(ledger));
        let order = f
            .store
            .insert(&NewOrder::new(1, 2, OrderMode::Approved))
            .await
            .unwrap();

        let ack = handle_and_settle(
            &f.dispatcher,
            delivery(topics::USER_DELETED, 1, serde_json::json!({ "id": order.id })),
        )
        .await;

        assert_eq!(ack, Acknowledgement::requeue());
        assert_eq!(f.store.len(), 1);
        assert!(f.events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_ledger_record_failure_still_acks() {
        let mut ledger = MockProcessedLedger::new();
        ledger.expect_contains().returning(|_| Ok(false));
        ledger
            .expect_record()
            .times(1)
            .returning(|_| Err(order_shared::error::QueueError::Connect("redis down".into())));

        let mut f = fixture_with(None, Arc::new(ledger));
        let order = f
            .store
            .insert(&NewOrder::new(1, 2, OrderMode::Approved))
            .await
            .unwrap();

        let ack = handle_and_settle(
            &f.dispatcher,
            delivery(topics::USER_DELETED, 1, serde_json::json!({ "id": order.id })),
        )
        .await;

        assert_eq!(ack, Acknowledgement::Ack);
        assert_eq!(f.events.recv().await.unwrap().status, HandleStatus::Processed);
    }

    #[tokio::test]
    async fn test_keyed_locks_serialize_same_key_and_clean_up() {
        let locks = Arc::new(KeyedLocks::default());
        let counter = Arc::new(std::sync::atomic::AtomicU32::new(0));
        let max_seen = Arc::new(std::sync::atomic::AtomicU32::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let locks = locks.clone();
            let counter = counter.clone();
            let max_seen = max_seen.clone();
            handles.push(tokio::spawn(async move {
                let _guard = locks.lock("delete-order:1").await;
                let now = counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst) + 1;
                max_seen.fetch_max(now, std::sync::atomic::Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(2)).await;
                counter.fetch_sub(1, std::sync::atomic::Ordering::SeqCst);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(max_seen.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert_eq!(locks.len(), 0);
    }

    #[tokio::test]
    async fn test_events_are_dropped_when_receiver_closed() {
        let f = fixture();
        drop(f.events);

        let ack = handle_and_settle(
            &f.dispatcher,
            delivery(topics::USER_DELETED, 1, serde_json::json!({ "id": 650 })),
        )
        .await;
        assert_eq!(ack, Acknowledgement::Ack);
    }

    #[tokio::test]
    async fn test_event_is_emitted_only_after_settlement() {
        let mut f = fixture();
        let d = delivery(topics::USER_DELETED, 1, serde_json::json!({ "id": 650 }));

        let ack = f.dispatcher.handle(d.clone()).await;
        assert_eq!(ack, Acknowledgement::Ack);
        assert!(f.events.try_recv().is_err());

        f.dispatcher.on_settled(&d, ack, Ok(())).await;
        assert_eq!(f.events.recv().await.unwrap().status, HandleStatus::Ignored);
        assert!(f.dispatcher.unsettled.is_empty());
    }

    #[tokio::test]
    async fn test_failed_commit_suppresses_event() {
        let mut f = fixture();
        let d = delivery(topics::USER_DELETED, 1, serde_json::json!({ "id": 650 }));

        let ack = f.dispatcher.handle(d.clone()).await;
        f.dispatcher
            .on_settled(&d, ack, Err(QueueError::Kafka("提交超时".to_string())))
            .await;

        assert!(f.events.try_recv().is_err());
        assert!(f.dispatcher.unsettled.is_empty());
    }

    #[tokio::test]
    async fn test_drain_releases_send_blocked_on_full_buffer() {
        let mut f = fixture();
        // 填满事件缓冲区
        for tag in 0..16 {
            handle_and_settle(
                &f.dispatcher,
                delivery(topics::USER_DELETED, tag, serde_json::json!({ "id": 650 })),
            )
            .await;
        }

        let blocked = handle_and_settle(
            &f.dispatcher,
            delivery(topics::USER_DELETED, 99, serde_json::json!({ "id": 650 })),
        );
        let drain = async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            f.dispatcher.begin_drain();
        };
        let (ack, ()) = tokio::time::timeout(Duration::from_secs(2), async {
            tokio::join!(blocked, drain)
        })
        .await
        .expect("排空后发送不应继续阻塞");
        assert_eq!(ack, Acknowledgement::Ack);

        let mut received = 0;
        while f.events.try_recv().is_ok() {
            received += 1;
        }
        assert_eq!(received, 16);

        // 恢复后事件照常送达
        f.dispatcher.resume();
        handle_and_settle(
            &f.dispatcher,
            delivery(topics::USER_DELETED, 100, serde_json::json!({ "id": 650 })),
        )
        .await;
        assert_eq!(f.events.recv().await.unwrap().message_id, "msg-100");
    }
}
