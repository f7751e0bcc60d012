//! 订单消费服务错误类型
//!
//! 在共享库 SharedError 基础上区分"解码失败"和"持久化失败"两类处理错误。
//! 两者对确认策略的影响相同（都不确认），区分只用于日志和指标。

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use order_shared::error::SharedError;
use serde_json::json;

/// 单条消息处理错误
#[derive(Debug, thiserror::Error)]
pub enum ConsumerError {
    /// 负载不是合法的 UTF-8
    #[error("消息编码无效: {0}")]
    InvalidEncoding(#[from] std::str::Utf8Error),

    /// JSON 格式错误、字段类型不符或缺少必填字段
    #[error("消息解析失败: {0}")]
    Decode(#[from] serde_json::Error),

    /// 写入 Orders 表失败（唯一键冲突、连接中断等）
    #[error("订单写入失败: {0}")]
    Persist(#[source] SharedError),

    /// 透传共享库错误
    #[error(transparent)]
    Shared(#[from] SharedError),
}

impl ConsumerError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidEncoding(_) => "INVALID_ENCODING",
            Self::Decode(_) => "DECODE_ERROR",
            Self::Persist(e) if e.is_unique_violation() => "DUPLICATE_ORDER",
            Self::Persist(_) => "PERSIST_ERROR",
            Self::Shared(e) => e.code(),
        }
    }

    /// 重复投递同一订单导致的主键冲突
    pub fn is_duplicate(&self) -> bool {
        matches!(self, Self::Persist(e) if e.is_unique_violation())
    }

    /// 是否为暂时性故障，重投后可能成功
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Persist(e) | Self::Shared(e) => e.is_retryable(),
            Self::InvalidEncoding(_) | Self::Decode(_) => false,
        }
    }
}

/// HTTP 查询接口错误
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("数据库错误: {0}")]
    Database(#[from] SharedError),
}

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        StatusCode::INTERNAL_SERVER_ERROR
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Database(_) => "DATABASE_ERROR",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        // 详细信息仅记录日志，防止泄露驱动错误内容
        tracing::error!(error = %self, code = self.error_code(), "查询订单失败");

        let body = json!({
            "success": false,
            "code": self.error_code(),
            "message": "服务内部错误，请稍后重试",
            "data": serde_json::Value::Null
        });

        (self.status_code(), axum::Json(body)).into_response()
    }
}
