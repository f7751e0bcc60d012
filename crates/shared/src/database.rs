//! 数据库连接管理模块
//!
//! 提供 MySQL 连接池管理，支持健康检查、迁移和连接配置。
//! 每次写入从池中借出连接，用完即归还，连接寿命由 max_lifetime 约束。

use crate::config::DatabaseConfig;
use crate::error::{Result, SharedError};
use sqlx::mysql::{MySqlPool, MySqlPoolOptions};
use std::time::Duration;
use tracing::{info, instrument};

/// 数据库连接池包装
#[derive(Clone)]
pub struct Database {
    pool: MySqlPool,
}

impl Database {
    /// 创建数据库连接池
    #[instrument(skip(config))]
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        info!("Connecting to database...");

        let pool = Self::pool_options(config).connect(&config.url).await?;

        info!("Database connection pool created");

        Ok(Self { pool })
    }

    /// 创建惰性连接池，首次使用时才建立连接
    ///
    /// 数据库暂时不可用时服务仍可启动，写入失败的消息留在队列中等待重投。
    pub fn connect_lazy(config: &DatabaseConfig) -> Result<Self> {
        let pool = Self::pool_options(config).connect_lazy(&config.url)?;
        info!("Lazy database connection pool created");
        Ok(Self { pool })
    }

    fn pool_options(config: &DatabaseConfig) -> MySqlPoolOptions {
        MySqlPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(config.connect_timeout_seconds))
            .idle_timeout(Duration::from_secs(config.idle_timeout_seconds))
            .max_lifetime(Duration::from_secs(config.max_lifetime_seconds))
    }

    /// 获取连接池引用
    pub fn pool(&self) -> &MySqlPool {
        &self.pool
    }

    /// 健康检查
    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map(|_| ())
            .map_err(SharedError::from)
    }

    /// 关闭连接池
    pub async fn close(&self) {
        self.pool.close().await;
        info!("Database connection pool closed");
    }

    /// 运行迁移
    ///
    /// 迁移文件位于工作区根目录的 migrations/，编译期嵌入二进制。
    #[instrument(skip(self))]
    pub async fn run_migrations(&self) -> Result<()> {
        info!("Running database migrations...");
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        info!("Database migrations applied");
        Ok(())
    }
}
