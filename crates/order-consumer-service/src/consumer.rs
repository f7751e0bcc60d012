//! RabbitMQ 消费循环与确认
//!
//! 由 BrokerConnector 建立会话（连接 + 通道 + 拓扑），之后从投递流中逐条拉取消息：
//! 解码 -> 写入 Orders -> 按确认策略决定是否 basic.ack。
//!
//! 启动时首次连接失败只记录日志，本进程不再消费，但 HTTP 查询接口照常工作。
//! 运行中连接断开（投递流结束）则按 ReconnectPolicy 退避重连，直到成功或收到关闭信号。

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use futures::{Stream, StreamExt};
use order_shared::amqp::{
    BrokerConnector, BrokerSession, DeliveryAcker, InboundDelivery, RabbitConnector,
    ReconnectPolicy, TopologyPlan,
};
use order_shared::config::{AppConfig, ConsumerConfig};
use order_shared::error::SharedError;
use order_shared::observability::metrics;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::ack::{AckDecision, DeliveryState};
use crate::error::ConsumerError;
use crate::processor::OrderMessageProcessor;

/// 消费者连接状态，供就绪探针读取
#[derive(Clone, Default)]
pub struct ConsumerStatus {
    connected: Arc<AtomicBool>,
}

impl ConsumerStatus {
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    pub(crate) fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::Relaxed);
    }
}

/// 消费循环的退出原因
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LoopExit {
    /// 收到关闭信号
    #[default]
    Shutdown,
    /// 投递流结束或 broker 报告通道错误，需要重连
    StreamClosed,
}

/// 一次消费循环的统计
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsumeSummary {
    pub acknowledged: u64,
    pub unacknowledged: u64,
    pub exit: LoopExit,
}

impl ConsumeSummary {
    fn record(&mut self, state: DeliveryState) {
        match state {
            DeliveryState::Acknowledged => self.acknowledged += 1,
            DeliveryState::UnacknowledgedPending => self.unacknowledged += 1,
        }
    }
}

/// 订单事件消费者
///
/// 组合连接器、重连策略和 OrderMessageProcessor，形成完整的消费管道。
pub struct OrderConsumer {
    connector: Arc<dyn BrokerConnector>,
    prefetch_count: u16,
    consumer_tag: String,
    backoff: ReconnectPolicy,
    processor: OrderMessageProcessor,
    status: ConsumerStatus,
}

impl OrderConsumer {
    pub fn new(config: &AppConfig, processor: OrderMessageProcessor) -> Result<Self, ConsumerError> {
        let plan = TopologyPlan::from_config(&config.rabbitmq, &config.topology)?;
        let connector = RabbitConnector::new(config.rabbitmq.clone(), plan);
        Ok(Self::with_connector(
            Arc::new(connector),
            &config.consumer,
            config.consumer_tag(),
            processor,
        ))
    }

    /// 使用自定义连接器构造，测试中传入内存实现
    pub fn with_connector(
        connector: Arc<dyn BrokerConnector>,
        consumer: &ConsumerConfig,
        consumer_tag: String,
        processor: OrderMessageProcessor,
    ) -> Self {
        Self {
            connector,
            prefetch_count: consumer.prefetch_count,
            consumer_tag,
            backoff: ReconnectPolicy::from(consumer),
            processor,
            status: ConsumerStatus::default(),
        }
    }

    pub fn status(&self) -> ConsumerStatus {
        self.status.clone()
    }

    /// 连接 broker 并运行消费循环，直到收到 shutdown 信号
    ///
    /// 首次连接或拓扑声明失败时返回 Ok(())：不重试、不退出进程。
    /// 之后每次会话结束都会关闭通道和连接，未收到关闭信号则退避重连。
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<(), ConsumerError> {
        let mut session = match self.connector.connect().await {
            Ok(session) => session,
            Err(e) => {
                metrics::record_broker_connection_failure();
                error!(
                    error = %e,
                    code = e.code(),
                    "无法连接 RabbitMQ，请确认服务器正在运行；本进程将不会消费任何消息"
                );
                return Ok(());
            }
        };

        loop {
            let exit = match self.consume(session.as_ref(), shutdown.clone()).await {
                Ok(exit) => exit,
                Err(e) => {
                    error!(error = %e, code = e.code(), "注册 RabbitMQ 消费者失败");
                    LoopExit::StreamClosed
                }
            };

            self.status.set_connected(false);
            session.shutdown().await;

            if exit == LoopExit::Shutdown || *shutdown.borrow() {
                return Ok(());
            }

            warn!("与 RabbitMQ 的会话已中断，准备重连");
            session = match self.reconnect(&mut shutdown).await {
                Some(session) => session,
                None => {
                    info!("重连等待期间收到关闭信号，订单消费者退出");
                    return Ok(());
                }
            };
        }
    }

    async fn consume(
        &self,
        session: &dyn BrokerSession,
        shutdown: watch::Receiver<bool>,
    ) -> Result<LoopExit, ConsumerError> {
        session.set_prefetch(self.prefetch_count).await?;
        let deliveries = session.subscribe(&self.consumer_tag).await?;
        self.status.set_connected(true);
        info!(consumer_tag = %self.consumer_tag, "订单消费者已启动，正在监听队列");

        let acker = session.acker();
        let summary =
            consume_deliveries(deliveries, acker.as_ref(), &self.processor, shutdown).await;

        info!(
            acknowledged = summary.acknowledged,
            unacknowledged = summary.unacknowledged,
            exit = ?summary.exit,
            "订单消费循环已停止"
        );
        Ok(summary.exit)
    }

    /// 按退避策略反复建连，收到关闭信号时返回 None
    async fn reconnect(
        &self,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Option<Box<dyn BrokerSession>> {
        let mut attempt: u32 = 0;
        loop {
            let delay = self.backoff.delay_for_attempt(attempt);
            if !wait_before_reconnect(delay, shutdown).await {
                return None;
            }

            match self.connector.connect().await {
                Ok(session) => {
                    info!(attempts = attempt + 1, "已重新连接 RabbitMQ");
                    return Some(session);
                }
                Err(e) => {
                    metrics::record_broker_connection_failure();
                    attempt = attempt.saturating_add(1);
                    warn!(
                        attempt,
                        error = %e,
                        next_delay_ms = self.backoff.delay_for_attempt(attempt).as_millis() as u64,
                        "重连 RabbitMQ 失败"
                    );
                }
            }
        }
    }
}

/// 等待 delay；期间收到关闭信号返回 false
async fn wait_before_reconnect(delay: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    if *shutdown.borrow() {
        return false;
    }

    let sleep = tokio::time::sleep(delay);
    tokio::pin!(sleep);

    loop {
        tokio::select! {
            biased;

            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    return false;
                }
            }

            _ = &mut sleep => return true,
        }
    }
}

/// 从投递流中逐条拉取并处理，直到收到关闭信号或流结束
///
/// 单条消息失败只记录日志，不中断循环。broker 通过流报告的 AMQP 错误意味着通道已失效，
/// 此时按流结束处理。
pub async fn consume_deliveries<S>(
    mut deliveries: S,
    acker: &dyn DeliveryAcker,
    processor: &OrderMessageProcessor,
    mut shutdown: watch::Receiver<bool>,
) -> ConsumeSummary
where
    S: Stream<Item = order_shared::error::Result<InboundDelivery>> + Unpin,
{
    let mut summary = ConsumeSummary::default();

    if *shutdown.borrow() {
        return summary;
    }

    loop {
        tokio::select! {
            // 偏向关闭信号，两条投递之间收到关闭时尽快退出
            biased;

            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    info!("收到关闭信号，消费循环退出");
                    break;
                }
            }

            next = deliveries.next() => {
                let Some(next) = next else {
                    warn!("RabbitMQ 投递流已结束");
                    summary.exit = LoopExit::StreamClosed;
                    break;
                };

                match next {
                    Ok(delivery) => {
                        let state = handle_delivery(processor, acker, &delivery).await;
                        summary.record(state);
                    }
                    Err(e @ SharedError::Amqp(_)) => {
                        error!(error = %e, "RabbitMQ 通道出错，投递流终止");
                        summary.exit = LoopExit::StreamClosed;
                        break;
                    }
                    Err(e) => {
                        error!(error = %e, "接收 RabbitMQ 投递出错");
                    }
                }
            }
        }
    }

    summary
}

/// 处理单条投递并执行确认策略，返回该投递的终态
///
/// 拆分为独立函数，便于在测试中直接调用而无需建立真实连接。
pub async fn handle_delivery(
    processor: &OrderMessageProcessor,
    acker: &dyn DeliveryAcker,
    delivery: &InboundDelivery,
) -> DeliveryState {
    let started = Instant::now();
    let delivery_tag = delivery.delivery_tag;

    if delivery.redelivered {
        warn!(delivery_tag, "收到重投消息");
    }

    let outcome = match delivery.payload_str() {
        Ok(text) => processor.process(text).await,
        Err(e) => Err(ConsumerError::from(e)),
    };

    let decision = AckDecision::from_outcome(&outcome);
    let mut state = decision.final_state();

    match &outcome {
        Ok(order) => match acker.ack(delivery_tag).await {
            Ok(()) => {
                info!(delivery_tag, order_id = order.id, "订单消息处理完成，已确认");
            }
            Err(e) => {
                // 确认未送达，消息仍归 broker 所有，稍后会被重投
                metrics::record_ack_failure();
                error!(
                    delivery_tag,
                    order_id = order.id,
                    error = %e,
                    "确认订单消息失败"
                );
                state = DeliveryState::UnacknowledgedPending;
            }
        },
        Err(e) if e.is_duplicate() => {
            // 同一订单已写入过，通常是确认丢失后的重投
            warn!(
                delivery_tag,
                code = e.code(),
                redelivered = delivery.redelivered,
                "订单已存在，消息保持未确认"
            );
        }
        Err(e) => {
            error!(
                delivery_tag,
                code = e.code(),
                retryable = e.is_retryable(),
                error = %e,
                payload_len = delivery.payload.len(),
                "处理或写入订单消息失败，消息保持未确认"
            );
        }
    }

    metrics::record_order_message(
        decision.outcome_label(),
        outcome.as_ref().err().map(ConsumerError::code),
        started.elapsed().as_secs_f64(),
    );

    state
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::OrderRecord;
    use crate::repository::MockOrderRepositoryTrait;
    use async_trait::async_trait;
    use chrono::Utc;
    use order_shared::amqp::DeliveryStream;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::AtomicUsize;

    const VALID_ORDER: &str = r#"{
        "Id": 7, "UserName": "carol", "TotalPrice": 10,
        "FirstName": "Carol", "LastName": "Danvers", "EmailAddress": "carol@example.com",
        "AddressLine": "2 Main St", "Country": "US", "State": "NY",
        "ZipCode": "10001", "CardName": "Carol Danvers", "CardNumber": "5500000000000004",
        "Expiration": "01/30", "CVV": "999", "PaymentMethod": "card"
    }"#;

    /// 记录被确认的 delivery_tag
    #[derive(Default)]
    struct RecordingAcker {
        acked: Mutex<Vec<u64>>,
        fail: bool,
    }

    #[async_trait]
    impl DeliveryAcker for RecordingAcker {
        async fn ack(&self, delivery_tag: u64) -> order_shared::error::Result<()> {
            if self.fail {
                return Err(SharedError::ChannelUnavailable("closed".to_string()));
            }
            self.acked.lock().unwrap().push(delivery_tag);
            Ok(())
        }
    }

    fn delivery(tag: u64, payload: &[u8]) -> InboundDelivery {
        InboundDelivery {
            delivery_tag: tag,
            payload: payload.to_vec(),
            redelivered: false,
            exchange: "order_created_topic".to_string(),
            routing_key: String::new(),
        }
    }

    fn accepting_processor(times: usize) -> OrderMessageProcessor {
        let mut repo = MockOrderRepositoryTrait::new();
        repo.expect_insert_order()
            .times(times)
            .returning(|order: &OrderRecord| Ok(order.clone().stamped(Utc::now())));
        OrderMessageProcessor::new(Arc::new(repo))
    }

    #[tokio::test]
    async fn test_handle_valid_delivery_acks_exact_tag() {
        let processor = accepting_processor(1);
        let acker = RecordingAcker::default();

        let state = handle_delivery(&processor, &acker, &delivery(42, VALID_ORDER.as_bytes())).await;

        assert_eq!(state, DeliveryState::Acknowledged);
        assert_eq!(*acker.acked.lock().unwrap(), vec![42]);
    }

    #[tokio::test]
    async fn test_handle_invalid_json_is_not_acked() {
        let processor = accepting_processor(0);
        let acker = RecordingAcker::default();

        let state = handle_delivery(&processor, &acker, &delivery(1, b"not json")).await;

        assert_eq!(state, DeliveryState::UnacknowledgedPending);
        assert!(acker.acked.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_handle_invalid_utf8_is_not_acked() {
        let processor = accepting_processor(0);
        let acker = RecordingAcker::default();

        let state = handle_delivery(&processor, &acker, &delivery(3, &[0xFF, 0xFE, 0xFD])).await;

        assert_eq!(state, DeliveryState::UnacknowledgedPending);
        assert!(acker.acked.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_handle_ack_failure_leaves_pending() {
        let processor = accepting_processor(1);
        let acker = RecordingAcker {
            fail: true,
            ..Default::default()
        };

        let state = handle_delivery(&processor, &acker, &delivery(5, VALID_ORDER.as_bytes())).await;

        assert_eq!(state, DeliveryState::UnacknowledgedPending);
    }

    #[tokio::test]
    async fn test_consume_loop_survives_bad_message() {
        let processor = accepting_processor(1);
        let acker = RecordingAcker::default();
        let (_tx, rx) = watch::channel(false);

        let deliveries = futures::stream::iter(vec![
            Ok(delivery(1, b"{broken")),
            Err(SharedError::ChannelUnavailable("transient".to_string())),
            Ok(delivery(2, VALID_ORDER.as_bytes())),
        ]);

        let summary = consume_deliveries(deliveries, &acker, &processor, rx).await;

        assert_eq!(summary.acknowledged, 1);
        assert_eq!(summary.unacknowledged, 1);
        assert_eq!(*acker.acked.lock().unwrap(), vec![2]);
    }

    #[tokio::test]
    async fn test_consume_loop_stops_on_shutdown() {
        let processor = accepting_processor(0);
        let acker = RecordingAcker::default();
        let (tx, rx) = watch::channel(false);

        let handle = tokio::spawn(async move {
            let idle = futures::stream::pending::<order_shared::error::Result<InboundDelivery>>();
            consume_deliveries(idle, &acker, &processor, rx).await
        });

        tx.send(true).unwrap();
        let summary = handle.await.unwrap();
        assert_eq!(summary, ConsumeSummary::default());
    }

    #[tokio::test]
    async fn test_consume_loop_skips_work_when_already_shut_down() {
        let processor = accepting_processor(0);
        let acker = RecordingAcker::default();
        let (_tx, rx) = watch::channel(true);

        let deliveries = futures::stream::iter(vec![Ok(delivery(1, VALID_ORDER.as_bytes()))]);
        let summary = consume_deliveries(deliveries, &acker, &processor, rx).await;

        assert_eq!(summary, ConsumeSummary::default());
        assert!(acker.acked.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_consume_loop_ends_on_channel_error() {
        let processor = accepting_processor(0);
        let acker = RecordingAcker::default();
        let (_tx, rx) = watch::channel(false);

        let deliveries = futures::stream::iter(vec![
            Err(SharedError::Amqp(lapin::Error::InvalidChannelState(
                lapin::ChannelState::Closed,
            ))),
            Ok(delivery(1, VALID_ORDER.as_bytes())),
        ]);

        let summary = consume_deliveries(deliveries, &acker, &processor, rx).await;

        assert_eq!(summary.exit, LoopExit::StreamClosed);
        assert_eq!(summary.acknowledged, 0);
        assert!(acker.acked.lock().unwrap().is_empty());
    }

    // ---- 重连 ----

    /// 每次 connect 依次取用的脚本
    enum Attempt {
        Refuse,
        /// 投递完后流结束，模拟连接中断
        Deliver(Vec<InboundDelivery>),
        /// 流一直保持打开
        Idle,
    }

    struct ScriptedSession {
        deliveries: Mutex<Option<Vec<InboundDelivery>>>,
        acker: Arc<RecordingAcker>,
    }

    #[async_trait]
    impl BrokerSession for ScriptedSession {
        async fn set_prefetch(&self, _prefetch_count: u16) -> order_shared::error::Result<()> {
            Ok(())
        }

        async fn subscribe(&self, _consumer_tag: &str) -> order_shared::error::Result<DeliveryStream> {
            let stream: DeliveryStream = match self.deliveries.lock().unwrap().take() {
                Some(items) => futures::stream::iter(items.into_iter().map(Ok)).boxed(),
                None => futures::stream::pending().boxed(),
            };
            Ok(stream)
        }

        fn acker(&self) -> Arc<dyn DeliveryAcker> {
            self.acker.clone()
        }

        async fn shutdown(&self) {}
    }

    struct ScriptedConnector {
        script: Mutex<VecDeque<Attempt>>,
        connects: AtomicUsize,
        acker: Arc<RecordingAcker>,
    }

    impl ScriptedConnector {
        fn new(script: Vec<Attempt>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
                connects: AtomicUsize::new(0),
                acker: Arc::new(RecordingAcker::default()),
            })
        }

        fn connects(&self) -> usize {
            self.connects.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl BrokerConnector for ScriptedConnector {
        async fn connect(&self) -> order_shared::error::Result<Box<dyn BrokerSession>> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            let next = self.script.lock().unwrap().pop_front().unwrap_or(Attempt::Idle);
            let deliveries = match next {
                Attempt::Refuse => {
                    return Err(SharedError::ChannelUnavailable("connection refused".to_string()));
                }
                Attempt::Deliver(items) => Some(items),
                Attempt::Idle => None,
            };
            Ok(Box::new(ScriptedSession {
                deliveries: Mutex::new(deliveries),
                acker: self.acker.clone(),
            }))
        }
    }

    fn scripted_consumer(
        connector: &Arc<ScriptedConnector>,
        initial_delay_ms: u64,
        processor: OrderMessageProcessor,
    ) -> OrderConsumer {
        let consumer = ConsumerConfig {
            reconnect_initial_delay_ms: initial_delay_ms,
            reconnect_max_delay_ms: initial_delay_ms * 5,
            ..Default::default()
        };
        OrderConsumer::with_connector(
            connector.clone(),
            &consumer,
            "orders-test".to_string(),
            processor,
        )
    }

    async fn wait_for_connects(connector: &ScriptedConnector, expected: usize) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while connector.connects() < expected {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("connect count not reached");
    }

    #[tokio::test]
    async fn test_run_reconnects_after_stream_closes() {
        let connector = ScriptedConnector::new(vec![
            Attempt::Deliver(vec![delivery(1, VALID_ORDER.as_bytes())]),
            Attempt::Idle,
        ]);
        let consumer = scripted_consumer(&connector, 10, accepting_processor(1));
        let status = consumer.status();
        let (tx, rx) = watch::channel(false);

        let handle = tokio::spawn(consumer.run(rx));
        wait_for_connects(&connector, 2).await;

        tx.send(true).unwrap();
        handle.await.unwrap().unwrap();

        assert_eq!(connector.connects(), 2);
        assert_eq!(*connector.acker.acked.lock().unwrap(), vec![1]);
        assert!(!status.is_connected());
    }

    #[tokio::test]
    async fn test_run_does_not_retry_failed_first_connect() {
        let connector = ScriptedConnector::new(vec![Attempt::Refuse, Attempt::Idle]);
        let consumer = scripted_consumer(&connector, 10, accepting_processor(0));
        let status = consumer.status();
        let (_tx, rx) = watch::channel(false);

        let result = tokio::time::timeout(Duration::from_secs(1), consumer.run(rx))
            .await
            .expect("run should return after a failed first connect");

        assert!(result.is_ok());
        assert_eq!(connector.connects(), 1);
        assert!(!status.is_connected());
    }

    #[tokio::test]
    async fn test_run_keeps_retrying_until_reconnect_succeeds() {
        let connector = ScriptedConnector::new(vec![
            Attempt::Deliver(vec![]),
            Attempt::Refuse,
            Attempt::Refuse,
            Attempt::Deliver(vec![delivery(9, VALID_ORDER.as_bytes())]),
            Attempt::Idle,
        ]);
        let consumer = scripted_consumer(&connector, 10, accepting_processor(1));
        let (tx, rx) = watch::channel(false);

        let handle = tokio::spawn(consumer.run(rx));
        wait_for_connects(&connector, 5).await;

        tx.send(true).unwrap();
        handle.await.unwrap().unwrap();

        assert_eq!(connector.connects(), 5);
        assert_eq!(*connector.acker.acked.lock().unwrap(), vec![9]);
    }

    #[tokio::test]
    async fn test_shutdown_interrupts_reconnect_backoff() {
        let connector = ScriptedConnector::new(vec![Attempt::Deliver(vec![])]);
        // 退避远长于测试超时，只有关闭信号能让 run 返回
        let consumer = scripted_consumer(&connector, 60_000, accepting_processor(0));
        let (tx, rx) = watch::channel(false);

        let handle = tokio::spawn(consumer.run(rx));
        wait_for_connects(&connector, 1).await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("shutdown should cut the backoff short")
            .unwrap()
            .unwrap();

        assert_eq!(connector.connects(), 1);
    }

    #[test]
    fn test_new_rejects_missing_queue_name() {
        let mut config = AppConfig::default();
        config.topology.exchange_name = "order_created_topic".to_string();

        let processor = accepting_processor(0);
        let result = OrderConsumer::new(&config, processor);
        assert!(matches!(result, Err(ConsumerError::Shared(SharedError::MissingConfig { .. }))));
    }

    #[test]
    fn test_status_defaults_to_disconnected() {
        let mut config = AppConfig::default();
        config.topology.exchange_name = "order_created_topic".to_string();
        config.topology.queue_name = "order_queue".to_string();

        let consumer = OrderConsumer::new(&config, accepting_processor(0)).unwrap();
        assert!(!consumer.status().is_connected());
    }
}
