//! 订单事件消费服务
//!
//! 后台任务消费 RabbitMQ 订单事件写入 MySQL，前台提供订单查询 HTTP 接口。

use std::sync::Arc;

use order_consumer_service::{
    consumer::OrderConsumer, processor::OrderMessageProcessor, query::OrderQueryService,
    repository::OrderRepository, routes, state::AppState,
};
use order_shared::{config::AppConfig, database::Database, observability};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info, warn};

const SERVICE_NAME: &str = "order-consumer-service";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::load(SERVICE_NAME)?;

    let obs_config = config
        .observability
        .clone()
        .with_service_name(&config.service_name);
    let _guard = observability::init(&obs_config).await?;

    config.validate()?;
    info!(
        environment = %config.environment,
        "Starting {} on {}",
        SERVICE_NAME,
        config.server_addr()
    );

    // 惰性连接池：数据库暂不可用时服务照常启动，由重投兜底
    let db = Database::connect_lazy(&config.database)?;
    if config.database.run_migrations {
        db.run_migrations().await?;
    }

    let repository = Arc::new(OrderRepository::new(db.pool().clone()));

    let consumer = OrderConsumer::new(&config, OrderMessageProcessor::new(repository.clone()))?;
    let consumer_status = consumer.status();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let consumer_handle = tokio::spawn(consumer.run(shutdown_rx));

    let state = AppState::new(
        OrderQueryService::new(repository),
        Arc::new(db.clone()),
        consumer_status,
    );
    let app = routes::build_router(state, &config.server.cors_origins);

    let listener = TcpListener::bind(config.server_addr()).await?;
    info!("Listening on {}", config.server_addr());

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // HTTP 停止后再通知消费者，未确认的消息由 broker 重新投递
    let _ = shutdown_tx.send(true);
    match consumer_handle.await {
        Ok(Ok(())) => info!("Consumer stopped"),
        Ok(Err(e)) => warn!(error = %e, "Consumer exited with error"),
        Err(e) => error!(error = %e, "Consumer task panicked"),
    }

    db.close().await;
    info!("Server shutdown complete");

    Ok(())
}

/// 监听关闭信号
///
/// K8s 通过 SIGTERM 通知 Pod 停止；本地开发通过 Ctrl+C。
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "注册 Ctrl+C 处理器失败");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "注册 SIGTERM 处理器失败");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, initiating graceful shutdown..."),
        _ = terminate => info!("Received SIGTERM, initiating graceful shutdown..."),
    }
}
