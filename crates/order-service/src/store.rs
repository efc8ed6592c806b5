//! 订单存储
//!
//! 存储层通过 trait 抽象，服务层只依赖 `OrderRepository`。
//! 内置的 `MemoryOrderStore` 基于 DashMap，适用于开发、测试和单机部署。

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;

use crate::error::{OrderError, Result};
use crate::models::{NewOrder, Order};

/// 订单存储接口
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait OrderRepository: Send + Sync {
    /// 插入订单并返回分配了 ID 的完整记录
    async fn insert(&self, order: &NewOrder) -> Result<Order>;

    async fn get(&self, id: u64) -> Result<Option<Order>>;

    /// 删除单个订单，返回是否真的删除了记录
    async fn delete(&self, id: u64) -> Result<bool>;

    /// 删除用户的全部订单，返回被删除的订单 ID
    async fn delete_by_user(&self, user_id: u64) -> Result<Vec<u64>>;

    async fn list_by_user(&self, user_id: u64) -> Result<Vec<Order>>;
}

/// 内存订单存储
#[derive(Debug)]
pub struct MemoryOrderStore {
    orders: DashMap<u64, Order>,
    next_id: AtomicU64,
    available: AtomicBool,
}

impl Default for MemoryOrderStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryOrderStore {
    pub fn new() -> Self {
        Self {
            orders: DashMap::new(),
            next_id: AtomicU64::new(1),
            available: AtomicBool::new(true),
        }
    }

    /// 模拟存储故障：关闭后所有操作返回 `Storage` 错误
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.orders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.orders.is_empty()
    }

    fn ensure_available(&self) -> Result<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(OrderError::Storage("订单存储不可用".to_string()))
        }
    }
}

#[async_trait]
impl OrderRepository for MemoryOrderStore {
    async fn insert(&self, order: &NewOrder) -> Result<Order> {
        self.ensure_available()?;

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let order = Order {
            id,
            user_id: order.user_id,
            product_id: order.product_id,
            mode: order.mode,
            request_id: order.request_id.clone(),
            created_at: Utc::now(),
        };
        self.orders.insert(id, order.clone());
        Ok(order)
    }

    async fn get(&self, id: u64) -> Result<Option<Order>> {
        self.ensure_available()?;
        Ok(self.orders.get(&id).map(|o| o.clone()))
    }

    async fn delete(&self, id: u64) -> Result<bool> {
        self.ensure_available()?;
        Ok(self.orders.remove(&id).is_some())
    }

    async fn delete_by_user(&self, user_id: u64) -> Result<Vec<u64>> {
        self.ensure_available()?;

        let mut removed = Vec::new();
        self.orders.retain(|id, order| {
            if order.user_id == user_id {
                removed.push(*id);
                false
            } else {
                true
            }
        });
        removed.sort_unstable();
        Ok(removed)
    }

    async fn list_by_user(&self, user_id: u64) -> Result<Vec<Order>> {
        self.ensure_available()?;

        let mut orders: Vec<Order> = self
            .orders
            .iter()
            .filter(|entry| entry.user_id == user_id)
            .map(|entry| entry.value().clone())
            .collect();
        orders.sort_by_key(|o| o.id);
        Ok(orders)
    }
}
