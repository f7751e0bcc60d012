//! 应用状态定义
//!
//! 包含 Axum 路由共享的应用状态

use std::sync::Arc;

use async_trait::async_trait;
use order_shared::database::Database;

use crate::consumer::ConsumerStatus;
use crate::query::OrderQueryService;

/// 数据库健康检查抽象，便于在路由测试中替换
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn is_healthy(&self) -> bool;
}

#[async_trait]
impl HealthProbe for Database {
    async fn is_healthy(&self) -> bool {
        self.health_check().await.is_ok()
    }
}

/// Axum 应用共享状态
#[derive(Clone)]
pub struct AppState {
    pub orders: OrderQueryService,
    pub database: Arc<dyn HealthProbe>,
    pub consumer: ConsumerStatus,
}

impl AppState {
    pub fn new(
        orders: OrderQueryService,
        database: Arc<dyn HealthProbe>,
        consumer: ConsumerStatus,
    ) -> Self {
        Self {
            orders,
            database,
            consumer,
        }
    }
}
