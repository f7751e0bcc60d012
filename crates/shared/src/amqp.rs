//! RabbitMQ 基础设施封装
//!
//! 将 lapin 的底层 API 封装为连接管理器 + 投递流两层抽象：
//! - `ConnectionManager` 持有唯一的长连接和通道，负责声明拓扑与关闭资源
//! - `DeliveryStream` 把 lapin 的投递转换为拥有所有权的 `InboundDelivery`，
//!   由上层显式拉取并决定确认与否
//!
//! 确认操作通过 `DeliveryAcker` trait 暴露，建连通过 `BrokerConnector` /
//! `BrokerSession` 暴露，便于在测试中替换为内存实现。

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::BoxStream;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicQosOptions, ExchangeDeclareOptions,
    QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::uri::{AMQPAuthority, AMQPUri, AMQPUserInfo};
use lapin::{Channel, Connection, ConnectionProperties, ExchangeKind};
use tracing::{debug, info, warn};

use crate::config::{ConsumerConfig, RabbitMqConfig, TopologyConfig};
use crate::error::{Result, SharedError};

/// AMQP 正常关闭的回复码
const REPLY_SUCCESS: u16 = 200;

// ---------------------------------------------------------------------------
// 交换机类型
// ---------------------------------------------------------------------------

/// 交换机类型
///
/// 配置中的字符串大小写不敏感，无法识别的名称按插件自定义类型原样传给 broker。
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ExchangeType {
    #[default]
    Fanout,
    Direct,
    Topic,
    Headers,
    Custom(String),
}

impl FromStr for ExchangeType {
    type Err = SharedError;

    fn from_str(s: &str) -> Result<Self> {
        let trimmed = s.trim();
        match trimmed.to_ascii_lowercase().as_str() {
            "" | "fanout" => Ok(Self::Fanout),
            "direct" => Ok(Self::Direct),
            "topic" => Ok(Self::Topic),
            "headers" => Ok(Self::Headers),
            _ => Ok(Self::Custom(trimmed.to_string())),
        }
    }
}

impl fmt::Display for ExchangeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fanout => f.write_str("fanout"),
            Self::Direct => f.write_str("direct"),
            Self::Topic => f.write_str("topic"),
            Self::Headers => f.write_str("headers"),
            Self::Custom(name) => f.write_str(name),
        }
    }
}

impl From<&ExchangeType> for ExchangeKind {
    fn from(value: &ExchangeType) -> Self {
        match value {
            ExchangeType::Fanout => ExchangeKind::Fanout,
            ExchangeType::Direct => ExchangeKind::Direct,
            ExchangeType::Topic => ExchangeKind::Topic,
            ExchangeType::Headers => ExchangeKind::Headers,
            ExchangeType::Custom(name) => ExchangeKind::Custom(name.clone()),
        }
    }
}

// ---------------------------------------------------------------------------
// 拓扑计划
// ---------------------------------------------------------------------------

/// 交换机声明参数
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeSpec {
    pub name: String,
    pub exchange_type: ExchangeType,
    pub durable: bool,
}

/// 队列声明参数
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSpec {
    pub name: String,
    pub durable: bool,
    pub exclusive: bool,
    pub auto_delete: bool,
}

/// 启动时需要声明的完整拓扑
///
/// 先以纯数据形式计算，再由 `ConnectionManager::declare` 应用到通道上。
/// 无论交换机类型如何，绑定的 routing key 始终为空。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopologyPlan {
    pub exchange: ExchangeSpec,
    pub queue: QueueSpec,
    pub binding_routing_key: String,
}

impl TopologyPlan {
    pub fn from_config(rabbitmq: &RabbitMqConfig, topology: &TopologyConfig) -> Result<Self> {
        let exchange_name = topology.exchange_name.trim();
        if exchange_name.is_empty() {
            return Err(SharedError::MissingConfig {
                key: "topology.exchange_name".to_string(),
            });
        }
        let queue_name = topology.queue_name.trim();
        if queue_name.is_empty() {
            return Err(SharedError::MissingConfig {
                key: "topology.queue_name".to_string(),
            });
        }

        Ok(Self {
            exchange: ExchangeSpec {
                name: exchange_name.to_string(),
                exchange_type: rabbitmq.exchange_type.parse()?,
                durable: true,
            },
            queue: QueueSpec {
                name: queue_name.to_string(),
                durable: true,
                exclusive: false,
                auto_delete: false,
            },
            binding_routing_key: String::new(),
        })
    }
}

/// 根据配置构造连接 URI，避免手工拼接时对用户名/密码/vhost 转义出错
pub fn build_uri(config: &RabbitMqConfig) -> AMQPUri {
    AMQPUri {
        authority: AMQPAuthority {
            userinfo: AMQPUserInfo {
                username: config.username.clone(),
                password: config.password.clone(),
            },
            host: config.host.clone(),
            port: config.port,
        },
        vhost: config.vhost.clone(),
        ..Default::default()
    }
}

// ---------------------------------------------------------------------------
// InboundDelivery
// ---------------------------------------------------------------------------

/// 从队列收到的一条投递的统一表示
///
/// 与 lapin 的 `Delivery` 解耦，只保留处理与确认所需的字段。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundDelivery {
    pub delivery_tag: u64,
    pub payload: Vec<u8>,
    /// broker 标记为重投的消息
    pub redelivered: bool,
    pub exchange: String,
    pub routing_key: String,
}

impl InboundDelivery {
    /// 将负载按 UTF-8 严格解码
    pub fn payload_str(&self) -> std::result::Result<&str, std::str::Utf8Error> {
        std::str::from_utf8(&self.payload)
    }
}

impl From<lapin::message::Delivery> for InboundDelivery {
    fn from(delivery: lapin::message::Delivery) -> Self {
        Self {
            delivery_tag: delivery.delivery_tag,
            payload: delivery.data,
            redelivered: delivery.redelivered,
            exchange: delivery.exchange.as_str().to_string(),
            routing_key: delivery.routing_key.as_str().to_string(),
        }
    }
}

/// 投递流：消费者注册后从中逐条拉取投递
pub type DeliveryStream = BoxStream<'static, Result<InboundDelivery>>;

// ---------------------------------------------------------------------------
// 确认
// ---------------------------------------------------------------------------

/// 投递确认接口
#[async_trait]
pub trait DeliveryAcker: Send + Sync {
    /// 确认单条投递（multiple = false）
    async fn ack(&self, delivery_tag: u64) -> Result<()>;
}

/// 基于 lapin 通道的确认实现
#[derive(Clone)]
pub struct ChannelAcker {
    channel: Channel,
}

impl ChannelAcker {
    pub fn new(channel: Channel) -> Self {
        Self { channel }
    }
}

#[async_trait]
impl DeliveryAcker for ChannelAcker {
    async fn ack(&self, delivery_tag: u64) -> Result<()> {
        if !self.channel.status().connected() {
            return Err(SharedError::ChannelUnavailable(format!(
                "通道已关闭，无法确认 delivery_tag={delivery_tag}"
            )));
        }
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions { multiple: false })
            .await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// 重连退避
// ---------------------------------------------------------------------------

/// 运行中断线后的重连退避策略
///
/// 第 N 次重连前等待 initial_delay * multiplier^N，不超过 max_delay。
/// 不限制次数，直到重连成功或收到关闭信号。
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::from(&ConsumerConfig::default())
    }
}

impl From<&ConsumerConfig> for ReconnectPolicy {
    fn from(config: &ConsumerConfig) -> Self {
        let initial_delay = Duration::from_millis(config.reconnect_initial_delay_ms);
        Self {
            initial_delay,
            // 上限小于初始值时以初始值为准
            max_delay: Duration::from_millis(config.reconnect_max_delay_ms).max(initial_delay),
            multiplier: 2.0,
        }
    }
}

impl ReconnectPolicy {
    /// 第 attempt 次重连前的等待时间（attempt 从 0 开始）
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base_ms = self.initial_delay.as_millis() as f64;
        let exponent = attempt.min(i32::MAX as u32) as i32;
        let delay_ms = base_ms * self.multiplier.powi(exponent);
        let capped_ms = delay_ms.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped_ms as u64)
    }
}

// ---------------------------------------------------------------------------
// 连接接口
// ---------------------------------------------------------------------------

/// 一次已建立的 broker 会话：连接 + 通道 + 已声明的拓扑
#[async_trait]
pub trait BrokerSession: Send + Sync {
    /// 设置预取数量，0 表示不限制
    async fn set_prefetch(&self, prefetch_count: u16) -> Result<()>;

    /// 以手动确认模式注册消费者并返回投递流
    async fn subscribe(&self, consumer_tag: &str) -> Result<DeliveryStream>;

    /// 绑定到本会话通道的确认器
    fn acker(&self) -> Arc<dyn DeliveryAcker>;

    /// 关闭通道和连接
    async fn shutdown(&self);
}

/// 建立 broker 会话
#[async_trait]
pub trait BrokerConnector: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn BrokerSession>>;
}

/// 基于 lapin 的连接器，每次调用都新建连接并重新声明拓扑
#[derive(Debug, Clone)]
pub struct RabbitConnector {
    config: RabbitMqConfig,
    plan: TopologyPlan,
}

impl RabbitConnector {
    pub fn new(config: RabbitMqConfig, plan: TopologyPlan) -> Self {
        Self { config, plan }
    }
}

#[async_trait]
impl BrokerConnector for RabbitConnector {
    async fn connect(&self) -> Result<Box<dyn BrokerSession>> {
        let manager = ConnectionManager::connect(&self.config, self.plan.clone()).await?;
        Ok(Box::new(manager))
    }
}

// ---------------------------------------------------------------------------
// ConnectionManager
// ---------------------------------------------------------------------------

/// RabbitMQ 连接管理器
///
/// 每个会话持有一条连接和一个通道，本会话内的投递与确认都复用该通道。
/// 关闭时先关通道再关连接，两步互不影响。
pub struct ConnectionManager {
    connection: Connection,
    channel: Channel,
    plan: TopologyPlan,
}

impl ConnectionManager {
    /// 建立连接、打开通道并声明拓扑
    ///
    /// 拓扑声明失败时会先释放已建立的连接再返回错误。
    pub async fn connect(config: &RabbitMqConfig, plan: TopologyPlan) -> Result<Self> {
        info!(
            host = %config.host,
            port = config.port,
            vhost = %config.vhost,
            "Connecting to RabbitMQ..."
        );

        let connection =
            Connection::connect_uri(build_uri(config), ConnectionProperties::default()).await?;

        let channel = match connection.create_channel().await {
            Ok(channel) => channel,
            Err(e) => {
                close_connection(&connection).await;
                return Err(e.into());
            }
        };

        let manager = Self {
            connection,
            channel,
            plan,
        };

        if let Err(e) = manager.declare().await {
            manager.shutdown().await;
            return Err(e);
        }

        info!(
            exchange = %manager.plan.exchange.name,
            exchange_type = %manager.plan.exchange.exchange_type,
            queue = %manager.plan.queue.name,
            "RabbitMQ 连接已建立，拓扑声明完成"
        );
        Ok(manager)
    }

    /// 声明交换机、队列并绑定
    async fn declare(&self) -> Result<()> {
        let exchange = &self.plan.exchange;
        self.channel
            .exchange_declare(
                &exchange.name,
                ExchangeKind::from(&exchange.exchange_type),
                ExchangeDeclareOptions {
                    durable: exchange.durable,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;

        let queue = &self.plan.queue;
        self.channel
            .queue_declare(
                &queue.name,
                QueueDeclareOptions {
                    durable: queue.durable,
                    exclusive: queue.exclusive,
                    auto_delete: queue.auto_delete,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;

        self.channel
            .queue_bind(
                &queue.name,
                &exchange.name,
                &self.plan.binding_routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await?;

        debug!(queue = %queue.name, exchange = %exchange.name, "队列已绑定到交换机");
        Ok(())
    }
}

#[async_trait]
impl BrokerSession for ConnectionManager {
    /// 0 表示不发送 basic.qos
    async fn set_prefetch(&self, prefetch_count: u16) -> Result<()> {
        if prefetch_count == 0 {
            return Ok(());
        }
        self.channel
            .basic_qos(prefetch_count, BasicQosOptions::default())
            .await?;
        info!(prefetch_count, "已设置预取数量");
        Ok(())
    }

    async fn subscribe(&self, consumer_tag: &str) -> Result<DeliveryStream> {
        let consumer = self
            .channel
            .basic_consume(
                &self.plan.queue.name,
                consumer_tag,
                BasicConsumeOptions {
                    no_ack: false,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;

        info!(
            queue = %self.plan.queue.name,
            exchange = %self.plan.exchange.name,
            consumer_tag,
            "已注册手动确认消费者"
        );

        Ok(consumer
            .map(|item| item.map(InboundDelivery::from).map_err(SharedError::from))
            .boxed())
    }

    fn acker(&self) -> Arc<dyn DeliveryAcker> {
        Arc::new(ChannelAcker::new(self.channel.clone()))
    }

    /// 未确认的投递会在通道关闭后由 broker 重新入队。
    async fn shutdown(&self) {
        if self.channel.status().connected() {
            match self.channel.close(REPLY_SUCCESS, "shutdown").await {
                Ok(()) => info!("RabbitMQ 通道已关闭"),
                Err(e) => warn!(error = %e, "关闭 RabbitMQ 通道失败"),
            }
        }
        close_connection(&self.connection).await;
    }
}

async fn close_connection(connection: &Connection) {
    if connection.status().connected() {
        match connection.close(REPLY_SUCCESS, "shutdown").await {
            Ok(()) => info!("RabbitMQ 连接已关闭"),
            Err(e) => warn!(error = %e, "关闭 RabbitMQ 连接失败"),
        }
    }
}

// ---------------------------------------------------------------------------
// 测试
// ---------------------------------------------------------------------------
