//! 订单查询服务
//!
//! 只读访问 Orders 表，不做排序、分页或过滤。

use std::sync::Arc;

use tracing::instrument;

use crate::error::ApiError;
use crate::models::OrderRecord;
use crate::repository::OrderRepositoryTrait;

#[derive(Clone)]
pub struct OrderQueryService {
    repository: Arc<dyn OrderRepositoryTrait>,
}

impl OrderQueryService {
    pub fn new(repository: Arc<dyn OrderRepositoryTrait>) -> Self {
        Self { repository }
    }

    /// 返回当前全部订单，表为空时返回空列表
    #[instrument(skip(self))]
    pub async fn list_all(&self) -> Result<Vec<OrderRecord>, ApiError> {
        Ok(self.repository.list_orders().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::MockOrderRepositoryTrait;
    use order_shared::error::SharedError;

    #[tokio::test]
    async fn test_list_all_empty_table() {
        let mut repo = MockOrderRepositoryTrait::new();
        repo.expect_list_orders().times(1).returning(|| Ok(vec![]));

        let service = OrderQueryService::new(Arc::new(repo));
        assert!(service.list_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_list_all_maps_database_error() {
        let mut repo = MockOrderRepositoryTrait::new();
        repo.expect_list_orders()
            .times(1)
            .returning(|| Err(SharedError::Database(sqlx::Error::PoolTimedOut)));

        let service = OrderQueryService::new(Arc::new(repo));
        let err = service.list_all().await.unwrap_err();
        assert_eq!(err.error_code(), "DATABASE_ERROR");
    }
}
