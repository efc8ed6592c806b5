//! 订单服务
//!
//! 封装订单的增删查。下单成功后向 order.placed 队列发布通知，
//! 发布失败时回滚已写入的订单，保证"订单存在"与"通知已发出"一致。

use std::sync::Arc;

use tracing::{error, info, instrument, warn};
use validator::Validate;

use order_shared::queue::QueueClient;

use crate::error::{OrderError, Result};
use crate::models::{NewOrder, Order, OrderPlaced};
use crate::store::OrderRepository;

pub struct OrderService {
    repository: Arc<dyn OrderRepository>,
    client: Arc<dyn QueueClient>,
    placed_queue: String,
}

impl OrderService {
    pub fn new(
        repository: Arc<dyn OrderRepository>,
        client: Arc<dyn QueueClient>,
        placed_queue: impl Into<String>,
    ) -> Self {
        Self {
            repository,
            client,
            placed_queue: placed_queue.into(),
        }
    }

    /// 创建订单并发布 OrderPlaced
    #[instrument(skip(self, new_order), fields(user_id = new_order.user_id))]
    pub async fn add_order(&self, new_order: NewOrder) -> Result<Order> {
        new_order.validate()?;

        let order = self.repository.insert(&new_order).await?;
        let placed = serde_json::to_vec(&OrderPlaced::from(&order))
            .map_err(|e| OrderError::Shared(e.into()))?;

        if let Err(e) = self.client.send_message(&self.placed_queue, &placed).await {
            error!(
                order_id = order.id,
                queue = %self.placed_queue,
                error = %e,
                "发布订单通知失败，回滚订单"
            );
            if let Err(rollback) = self.repository.delete(order.id).await {
                warn!(order_id = order.id, error = %rollback, "回滚订单失败");
            }
            return Err(e.into());
        }

        info!(order_id = order.id, mode = %order.mode, "订单已创建");
        Ok(order)
    }

    pub async fn get_order(&self, id: u64) -> Result<Order> {
        self.repository
            .get(id)
            .await?
            .ok_or(OrderError::NotFound { id })
    }

    /// 删除单个订单，订单不存在时返回 false
    #[instrument(skip(self))]
    pub async fn delete_order(&self, id: u64) -> Result<bool> {
        let deleted = self.repository.delete(id).await?;
        if deleted {
            info!(order_id = id, "订单已删除");
        }
        Ok(deleted)
    }

    /// 删除用户的全部订单，返回被删除的订单 ID
    #[instrument(skip(self))]
    pub async fn delete_user_orders(&self, user_id: u64) -> Result<Vec<u64>> {
        let removed = self.repository.delete_by_user(user_id).await?;
        if !removed.is_empty() {
            info!(user_id, count = removed.len(), "用户订单已删除");
        }
        Ok(removed)
    }

    pub async fn list_user_orders(&self, user_id: u64) -> Result<Vec<Order>> {
        self.repository.list_by_user(user_id).await
    }
}
