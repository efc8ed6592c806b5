//! 订单服务
//!
//! 从消息队列消费下单与删除请求，通过幂等账本保证重复投递只生效一次，
//! 每条确认的消息都会产生一个 message-handled 事件。

pub mod app;
pub mod dispatcher;
pub mod error;
pub mod events;
pub mod ledger;
pub mod messages;
pub mod models;
pub mod service;
pub mod starter;
pub mod store;

pub use app::OrderApp;
pub use error::{OrderError, Result};
pub use events::{HandleStatus, MessageHandled};
pub use starter::{MessageQueueStarter, StarterState};
