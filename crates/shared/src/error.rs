//! 统一错误处理模块
//!
//! 定义基础设施层共享的错误类型，使用 thiserror 提供良好的错误信息。

use thiserror::Error;

/// 基础设施错误类型
#[derive(Debug, Error)]
pub enum SharedError {
    // ==================== 数据库错误 ====================
    #[error("数据库错误: {0}")]
    Database(#[from] sqlx::Error),

    #[error("数据库迁移失败: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    // ==================== 消息队列错误 ====================
    #[error("RabbitMQ 错误: {0}")]
    Amqp(#[from] lapin::Error),

    #[error("RabbitMQ 通道不可用: {0}")]
    ChannelUnavailable(String),

    // ==================== 配置错误 ====================
    #[error("配置错误: {0}")]
    Config(#[from] config::ConfigError),

    #[error("缺少必填配置项: {key}")]
    MissingConfig { key: String },

    // ==================== 通用错误 ====================
    #[error("内部错误: {0}")]
    Internal(String),
}

/// 错误结果类型别名
pub type Result<T> = std::result::Result<T, SharedError>;

impl SharedError {
    /// 获取错误码
    pub fn code(&self) -> &'static str {
        match self {
            Self::Database(_) => "DATABASE_ERROR",
            Self::Migration(_) => "MIGRATION_ERROR",
            Self::Amqp(_) => "AMQP_ERROR",
            Self::ChannelUnavailable(_) => "CHANNEL_UNAVAILABLE",
            Self::Config(_) => "CONFIG_ERROR",
            Self::MissingConfig { .. } => "MISSING_CONFIG",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// 是否为唯一键冲突（重复投递同一订单时出现）
    pub fn is_unique_violation(&self) -> bool {
        match self {
            Self::Database(sqlx::Error::Database(db_err)) => db_err.is_unique_violation(),
            _ => false,
        }
    }

    /// 是否为可重试错误
    ///
    /// 仅用于日志分级，确认策略不区分错误类型。
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Database(e) => !matches!(e, sqlx::Error::Database(_)),
            Self::Amqp(_) | Self::ChannelUnavailable(_) => true,
            _ => false,
        }
    }
}
