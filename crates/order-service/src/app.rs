//! 组件装配
//!
//! 按配置把客户端、存储、账本、服务、分发器和启动器组装起来，
//! 主程序与集成测试共用同一套装配逻辑。

use std::sync::Arc;

use tokio::sync::mpsc;

use order_shared::config::{AppConfig, PoisonPolicy};
use order_shared::dlq::DeadLetterPublisher;
use order_shared::queue::QueueClient;

use crate::dispatcher::{MessageDispatcher, MessageRoutes};
use crate::events::MessageHandled;
use crate::ledger::ProcessedLedger;
use crate::service::OrderService;
use crate::starter::MessageQueueStarter;
use crate::store::OrderRepository;

pub struct OrderApp {
    pub service: Arc<OrderService>,
    pub dispatcher: Arc<MessageDispatcher>,
    pub starter: MessageQueueStarter,
    /// message-handled 事件流，必须有人持续读取
    pub events: mpsc::Receiver<MessageHandled>,
}

impl OrderApp {
    pub fn new(
        config: &AppConfig,
        client: Arc<dyn QueueClient>,
        repository: Arc<dyn OrderRepository>,
        ledger: Arc<dyn ProcessedLedger>,
    ) -> Self {
        let service = Arc::new(OrderService::new(
            repository,
            client.clone(),
            &config.consumer.order_placed_queue,
        ));

        let (tx, events) = mpsc::channel(config.consumer.event_buffer.max(1));
        let mut dispatcher = MessageDispatcher::new(
            MessageRoutes::from_config(&config.consumer),
            service.clone(),
            ledger,
        )
        .with_event_sink(tx);

        if config.consumer.poison_policy == PoisonPolicy::DeadLetter {
            dispatcher = dispatcher.with_dead_letter(DeadLetterPublisher::new(
                client.clone(),
                &config.queue.dead_letter_queue,
                &config.service_name,
            ));
        }

        let dispatcher = Arc::new(dispatcher);
        let starter = MessageQueueStarter::new(client, dispatcher.clone(), &config.consumer);

        Self {
            service,
            dispatcher,
            starter,
            events,
        }
    }
}
