//! 订单与商品实体定义
//!
//! 字段名与上游生产者的 JSON 以及 Orders 表的列名一致（PascalCase，CVV 全大写）。

use std::fmt;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// 写入 Orders.CreateBy 的固定服务标识
pub const CREATED_BY: &str = "RabbitConsumerService";

/// 订单记录
///
/// 由入站消息解码得到，或由查询接口从 Orders 表读出。
/// `CreateBy` / `CreateDate` 由持久化层在写入时设置，消息中携带的值会被忽略。
#[derive(Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "PascalCase")]
#[sqlx(rename_all = "PascalCase")]
pub struct OrderRecord {
    pub id: i32,
    pub user_name: String,
    #[serde(with = "rust_decimal::serde::float")]
    pub total_price: Decimal,
    pub first_name: String,
    pub last_name: String,
    pub email_address: String,
    pub address_line: String,
    pub country: String,
    pub state: String,
    pub zip_code: String,
    pub card_name: String,
    /// 明文存储，日志与 Debug 输出中脱敏
    pub card_number: String,
    pub expiration: String,
    #[serde(rename = "CVV")]
    #[sqlx(rename = "CVV")]
    pub cvv: String,
    pub payment_method: String,
    /// 只输出不读取：入站消息里的同名字段无论类型如何都被丢弃
    #[serde(skip_deserializing)]
    pub create_by: Option<String>,
    #[serde(skip_deserializing)]
    pub create_date: Option<DateTime<Utc>>,
}

impl OrderRecord {
    /// 以服务标识和给定时间覆盖审计字段
    pub fn stamped(mut self, now: DateTime<Utc>) -> Self {
        self.create_by = Some(CREATED_BY.to_string());
        self.create_date = Some(now);
        self
    }
}

impl fmt::Debug for OrderRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OrderRecord")
            .field("id", &self.id)
            .field("user_name", &self.user_name)
            .field("total_price", &self.total_price)
            .field("first_name", &self.first_name)
            .field("last_name", &self.last_name)
            .field("email_address", &self.email_address)
            .field("address_line", &self.address_line)
            .field("country", &self.country)
            .field("state", &self.state)
            .field("zip_code", &self.zip_code)
            .field("card_name", &self.card_name)
            .field("card_number", &mask_card_number(&self.card_number))
            .field("expiration", &self.expiration)
            .field("cvv", &"***")
            .field("payment_method", &self.payment_method)
            .field("create_by", &self.create_by)
            .field("create_date", &self.create_date)
            .finish()
    }
}

/// 只保留卡号后四位
pub fn mask_card_number(card_number: &str) -> String {
    let digits: Vec<char> = card_number.chars().filter(|c| !c.is_whitespace()).collect();
    if digits.len() <= 4 {
        return "*".repeat(digits.len());
    }
    let tail: String = digits[digits.len() - 4..].iter().collect();
    format!("{}{}", "*".repeat(digits.len() - 4), tail)
}

/// 商品目录实体
///
/// 与订单共享同一套命名约定，目前没有任何消费路径使用它。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ProductRecord {
    pub id: i32,
    pub product_name: String,
    pub description: String,
    pub category: String,
    /// 销售价
    #[serde(with = "rust_decimal::serde::float")]
    pub price: Decimal,
    pub stock: i32,
    /// kg、件、包、升等
    pub unit_of_measure: String,
    pub image_url: String,
}
