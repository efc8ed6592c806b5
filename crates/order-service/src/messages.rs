//! 队列消息 schema 与幂等键
//!
//! 每个队列绑定一种消息类型；消息体先按类型解析为强类型命令，
//! 再由命令推导出幂等键。幂等键由业务内容决定而非 broker 的投递标识，
//! 因此重投或上游重复发送都会映射到同一个键。

use std::fmt;

use serde::Deserialize;
use sha2::{Digest, Sha256};
use validator::Validate;

use crate::error::{OrderError, Result};
use crate::models::NewOrder;

/// 队列上承载的消息类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    /// 下单请求
    CreateOrder,
    /// 按订单或按用户删除
    DeleteOrders,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CreateOrder => "create-order",
            Self::DeleteOrders => "delete-orders",
        }
    }
}

/// 删除消息：`{ "id": 650 }` 或 `{ "userId": 9 }`
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct DeleteOrdersMessage {
    #[serde(default)]
    #[validate(range(min = 1, message = "id 必须为正整数"))]
    pub id: Option<u64>,

    #[serde(default)]
    #[validate(range(min = 1, message = "userId 必须为正整数"))]
    pub user_id: Option<u64>,
}

/// 解析后的业务命令
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrderCommand {
    Create(NewOrder),
    DeleteOrder { id: u64 },
    DeleteUserOrders { user_id: u64 },
}

impl OrderCommand {
    /// 按消息类型解析并校验消息体
    ///
    /// 非法 JSON 或字段类型不符返回 `Parse`，业务约束不满足返回 `SchemaValidation`。
    pub fn parse(kind: MessageKind, payload: &[u8]) -> Result<Self> {
        match kind {
            MessageKind::CreateOrder => {
                let order: NewOrder = serde_json::from_slice(payload)?;
                order.validate()?;
                Ok(Self::Create(order))
            }
            MessageKind::DeleteOrders => {
                let msg: DeleteOrdersMessage = serde_json::from_slice(payload)?;
                msg.validate()?;
                match (msg.id, msg.user_id) {
                    (Some(id), None) => Ok(Self::DeleteOrder { id }),
                    (None, Some(user_id)) => Ok(Self::DeleteUserOrders { user_id }),
                    (None, None) => Err(OrderError::SchemaValidation(
                        "删除消息必须包含 id 或 userId".to_string(),
                    )),
                    (Some(_), Some(_)) => Err(OrderError::SchemaValidation(
                        "删除消息不能同时包含 id 和 userId".to_string(),
                    )),
                }
            }
        }
    }

    /// 推导幂等键
    pub fn dedupe_key(&self) -> DedupeKey {
        match self {
            Self::Create(order) => DedupeKey::for_new_order(order),
            Self::DeleteOrder { id } => DedupeKey(format!("delete-order:{id}")),
            Self::DeleteUserOrders { user_id } => {
                DedupeKey(format!("delete-user-orders:{user_id}"))
            }
        }
    }
}

/// 幂等键
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DedupeKey(String);

impl DedupeKey {
    /// 优先使用 requestId；缺省时对 (userId, productId, mode) 取指纹
    pub fn for_new_order(order: &NewOrder) -> Self {
        match &order.request_id {
            Some(request_id) => Self(format!("create-order:{request_id}")),
            None => {
                let digest = Sha256::digest(
                    format!("{}|{}|{}", order.user_id, order.product_id, order.mode).as_bytes(),
                );
                Self(format!("create-order:{digest:x}"))
            }
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DedupeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
