//! 路由配置模块
//!
//! 对外只暴露一个只读接口 `GET /api/messages/orders`，外加存活与就绪探针。

use axum::{
    Json, Router,
    extract::State,
    http::HeaderValue,
    middleware,
    routing::get,
};
use order_shared::observability::middleware as obs_middleware;
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use crate::error::ApiError;
use crate::models::OrderRecord;
use crate::state::AppState;

const SERVICE_NAME: &str = "order-consumer-service";

/// 订单消息查询路由
pub fn api_routes() -> Router<AppState> {
    Router::new().route("/messages/orders", get(list_orders))
}

/// 构建完整应用：业务路由 + 探针 + CORS + 可观测性中间件
pub fn build_router(state: AppState, cors_origins: &str) -> Router {
    Router::new()
        .nest("/api", api_routes())
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .layer(cors_layer(cors_origins))
        .layer(middleware::from_fn(obs_middleware::http_tracing))
        .layer(middleware::from_fn(obs_middleware::request_id))
        .with_state(state)
}

/// 根据逗号分隔的来源列表构建 CORS 层，"*" 表示放开所有来源
pub fn cors_layer(allowed_origins: &str) -> CorsLayer {
    if allowed_origins.trim() == "*" {
        warn!("CORS 允许所有来源，仅应在本地开发中使用");
        return CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);
    }

    let origins: Vec<HeaderValue> = allowed_origins
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .filter_map(|s| s.parse::<HeaderValue>().ok())
        .collect();
    info!(allowed_origins, "CORS 已配置");

    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods(Any)
        .allow_headers(Any)
}

/// 返回 Orders 表的全部记录
async fn list_orders(State(state): State<AppState>) -> Result<Json<Vec<OrderRecord>>, ApiError> {
    let orders = state.orders.list_all().await?;
    Ok(Json(orders))
}

/// 存活探针：服务进程正常即返回 ok
async fn health_check() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "service": SERVICE_NAME
    }))
}

/// 就绪探针：检查数据库连接和消费者状态
///
/// 消费者未连接时查询接口仍然可用，因此只报告 degraded 而不是失败。
async fn readiness_check(State(state): State<AppState>) -> Json<serde_json::Value> {
    let db_ok = state.database.is_healthy().await;
    let consumer_ok = state.consumer.is_connected();
    let all_ok = db_ok && consumer_ok;

    Json(serde_json::json!({
        "status": if all_ok { "ok" } else { "degraded" },
        "service": SERVICE_NAME,
        "checks": {
            "database": if db_ok { "ok" } else { "fail" },
            "consumer": if consumer_ok { "connected" } else { "disconnected" }
        }
    }))
}
