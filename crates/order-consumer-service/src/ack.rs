//! 确认策略
//!
//! 每条投递的状态流转：
//!
//! ```text
//! Delivered -> Processing -> Acknowledged            (解码 + 写入成功)
//!                         -> UnacknowledgedPending   (任一步骤失败)
//! ```
//!
//! 失败时不发送 reject / nack，消息留在 broker，等通道或连接关闭后重新投递。
//! 没有丢弃或死信终态，无法解析的消息会被无限次重投。

use crate::error::ConsumerError;

/// 单条投递处理结束后的状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryState {
    Acknowledged,
    UnacknowledgedPending,
}

/// 处理完成后对投递采取的动作
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckDecision {
    /// basic.ack 当前 delivery_tag，multiple = false
    Acknowledge,
    /// 不发送任何确认
    LeavePending,
}

impl AckDecision {
    /// 根据处理结果决定确认动作，解码失败与写入失败不做区分
    pub fn from_outcome<T>(outcome: &Result<T, ConsumerError>) -> Self {
        match outcome {
            Ok(_) => Self::Acknowledge,
            Err(_) => Self::LeavePending,
        }
    }

    /// 该动作对应的终态
    pub fn final_state(self) -> DeliveryState {
        match self {
            Self::Acknowledge => DeliveryState::Acknowledged,
            Self::LeavePending => DeliveryState::UnacknowledgedPending,
        }
    }

    /// 指标标签
    pub fn outcome_label(self) -> &'static str {
        match self {
            Self::Acknowledge => "acked",
            Self::LeavePending => "unacked",
        }
    }
}
