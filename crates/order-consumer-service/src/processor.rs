//! 订单消息处理器
//!
//! 将消息文本解码为 OrderRecord，再交给仓储写入 Orders 表。
//! 解码和写入的错误都原样向上返回，由消费循环决定是否确认。

use std::sync::Arc;

use tracing::{debug, instrument};

use crate::error::ConsumerError;
use crate::models::OrderRecord;
use crate::repository::OrderRepositoryTrait;

/// 订单消息处理器
#[derive(Clone)]
pub struct OrderMessageProcessor {
    repository: Arc<dyn OrderRepositoryTrait>,
}

impl OrderMessageProcessor {
    pub fn new(repository: Arc<dyn OrderRepositoryTrait>) -> Self {
        Self { repository }
    }

    /// 解码消息文本
    pub fn decode(message: &str) -> Result<OrderRecord, ConsumerError> {
        Ok(serde_json::from_str::<OrderRecord>(message)?)
    }

    /// 解码并写入，成功时返回写入后的记录
    #[instrument(skip(self, message), fields(payload_len = message.len()))]
    pub async fn process(&self, message: &str) -> Result<OrderRecord, ConsumerError> {
        let order = Self::decode(message)?;
        debug!(order_id = order.id, user_name = %order.user_name, "订单消息解码成功");

        self.repository
            .insert_order(&order)
            .await
            .map_err(ConsumerError::Persist)
    }
}
