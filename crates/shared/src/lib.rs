//! 共享库
//!
//! 包含订单消费服务共用的配置、错误处理、数据库连接池、RabbitMQ 连接与拓扑管理、
//! 可观测性等基础设施代码。

pub mod amqp;
pub mod config;
pub mod database;
pub mod error;
pub mod observability;
