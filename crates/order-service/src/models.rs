//! 订单领域模型

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use validator::Validate;

/// 下单模式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderMode {
    Approved,
    Pending,
    Declined,
}

impl OrderMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Approved => "approved",
            Self::Pending => "pending",
            Self::Declined => "declined",
        }
    }
}

impl fmt::Display for OrderMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 已持久化的订单
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Order {
    pub id: u64,
    pub user_id: u64,
    pub product_id: u64,
    pub mode: OrderMode,
    /// 创建该订单的请求 ID，消息未携带时为空
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// 下单请求
///
/// 同时作为下单队列的消息 schema。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct NewOrder {
    #[validate(range(min = 1, message = "userId 必须为正整数"))]
    pub user_id: u64,

    #[validate(range(min = 1, message = "productId 必须为正整数"))]
    pub product_id: u64,

    pub mode: OrderMode,

    /// 上游生成的请求 ID，用作幂等键
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(length(min = 1, max = 128, message = "requestId 长度必须在1-128之间"))]
    pub request_id: Option<String>,
}

impl NewOrder {
    pub fn new(user_id: u64, product_id: u64, mode: OrderMode) -> Self {
        Self {
            user_id,
            product_id,
            mode,
            request_id: None,
        }
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }
}

/// 订单创建成功后发布的通知
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderPlaced {
    pub order_id: u64,
    pub user_id: u64,
    pub product_id: u64,
    pub mode: OrderMode,
    pub placed_at: DateTime<Utc>,
}

impl From<&Order> for OrderPlaced {
    fn from(order: &Order) -> Self {
        Self {
            order_id: order.id,
            user_id: order.user_id,
            product_id: order.product_id,
            mode: order.mode,
            placed_at: order.created_at,
        }
    }
}
