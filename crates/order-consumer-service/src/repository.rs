//! 订单仓储
//!
//! 封装 Orders 表的写入与全量读取。
//!
//! - 写入只执行一条参数化 INSERT，不开显式事务，不做存在性检查或 upsert
//! - 审计字段 CreateBy / CreateDate 由仓储在写入时设置
//! - 定义 trait 接口以支持 mock 测试

use async_trait::async_trait;
use chrono::Utc;
use order_shared::error::Result;
use sqlx::MySqlPool;
use tracing::{debug, instrument};

use crate::models::OrderRecord;

const INSERT_ORDER_SQL: &str = r#"
    INSERT INTO Orders (
        Id, UserName, TotalPrice, FirstName, LastName, EmailAddress,
        AddressLine, Country, State, ZipCode, CardName, CardNumber,
        Expiration, CVV, PaymentMethod, CreateBy, CreateDate
    )
    VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
"#;

const SELECT_ORDERS_SQL: &str = r#"
    SELECT
        Id, UserName, TotalPrice, FirstName, LastName, EmailAddress,
        AddressLine, Country, State, ZipCode, CardName, CardNumber,
        Expiration, CVV, PaymentMethod, CreateBy, CreateDate
    FROM Orders
"#;

/// 订单仓储接口
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait OrderRepositoryTrait: Send + Sync {
    /// 写入一条订单，返回实际写入的记录（含审计字段）
    async fn insert_order(&self, order: &OrderRecord) -> Result<OrderRecord>;

    /// 读取 Orders 表的全部记录，不排序不分页
    async fn list_orders(&self) -> Result<Vec<OrderRecord>>;
}

/// 基于 MySQL 连接池的订单仓储
#[derive(Clone)]
pub struct OrderRepository {
    pool: MySqlPool,
}

impl OrderRepository {
    pub fn new(pool: MySqlPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl OrderRepositoryTrait for OrderRepository {
    #[instrument(skip(self, order), fields(order_id = order.id))]
    async fn insert_order(&self, order: &OrderRecord) -> Result<OrderRecord> {
        let stamped = order.clone().stamped(Utc::now());

        sqlx::query(INSERT_ORDER_SQL)
            .bind(stamped.id)
            .bind(&stamped.user_name)
            .bind(stamped.total_price)
            .bind(&stamped.first_name)
            .bind(&stamped.last_name)
            .bind(&stamped.email_address)
            .bind(&stamped.address_line)
            .bind(&stamped.country)
            .bind(&stamped.state)
            .bind(&stamped.zip_code)
            .bind(&stamped.card_name)
            .bind(&stamped.card_number)
            .bind(&stamped.expiration)
            .bind(&stamped.cvv)
            .bind(&stamped.payment_method)
            .bind(&stamped.create_by)
            .bind(stamped.create_date)
            .execute(&self.pool)
            .await?;

        debug!(order_id = stamped.id, "订单已写入");
        Ok(stamped)
    }

    #[instrument(skip(self))]
    async fn list_orders(&self) -> Result<Vec<OrderRecord>> {
        let orders = sqlx::query_as::<_, OrderRecord>(SELECT_ORDERS_SQL)
            .fetch_all(&self.pool)
            .await?;

        debug!(count = orders.len(), "已读取订单列表");
        Ok(orders)
    }
}
