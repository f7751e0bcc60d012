//! 订单事件消费服务
//!
//! 监听 RabbitMQ 上的"订单已创建"事件，将每条订单写入 MySQL 的 Orders 表，
//! 成功后逐条确认；解码或写入失败时不确认，消息留在 broker 等待重投。
//! 同时提供只读 HTTP 接口返回全部已存储订单。

pub mod ack;
pub mod consumer;
pub mod error;
pub mod models;
pub mod processor;
pub mod query;
pub mod repository;
pub mod routes;
pub mod state;
