//! HTTP 中间件
//!
//! `request_id` 必须位于 `http_tracing` 外层，追踪 span 才能带上请求 ID。
//! 指标标签使用路由模板而不是原始路径，未匹配的请求统一归入 `unmatched`。

use std::time::Instant;

use axum::extract::{MatchedPath, Request};
use axum::http::{HeaderMap, HeaderName, HeaderValue};
use axum::middleware::Next;
use axum::response::Response;
use tracing::{Instrument, info_span, warn};

use super::metrics;

/// 请求 ID 所在的请求头与响应头
pub const REQUEST_ID_HEADER: HeaderName = HeaderName::from_static("x-request-id");

/// 上游请求 ID 的最大长度，超出则重新生成
const MAX_REQUEST_ID_LEN: usize = 128;

const UNMATCHED_ROUTE: &str = "unmatched";

/// 当前请求的 ID，由 `request_id` 中间件写入请求扩展
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RequestId(pub String);

impl RequestId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// 沿用上游传入的合法请求 ID，否则生成 UUID v4
///
/// 合法指非空、不超过 128 字节且只含可见 ASCII 字符。
pub fn resolve_request_id(headers: &HeaderMap) -> String {
    headers
        .get(&REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|id| is_acceptable_request_id(id))
        .map(str::to_string)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string())
}

fn is_acceptable_request_id(id: &str) -> bool {
    !id.is_empty() && id.len() <= MAX_REQUEST_ID_LEN && id.bytes().all(|b| b.is_ascii_graphic())
}

/// 写入 RequestId 扩展，并在响应头中回传
pub async fn request_id(mut request: Request, next: Next) -> Response {
    let id = resolve_request_id(request.headers());
    request.extensions_mut().insert(RequestId(id.clone()));

    let mut response = next.run(request).await;

    if let Ok(value) = HeaderValue::from_str(&id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    response
}

/// 请求追踪与 HTTP 指标
pub async fn http_tracing(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let route = route_label(&request);
    let request_id = request
        .extensions()
        .get::<RequestId>()
        .map(|id| id.as_str().to_string())
        .unwrap_or_default();

    let span = info_span!(
        "http_request",
        %method,
        route = %route,
        request_id = %request_id,
        status = tracing::field::Empty,
        latency_ms = tracing::field::Empty,
    );

    let started = Instant::now();
    let response = next.run(request).instrument(span.clone()).await;
    let elapsed = started.elapsed();
    let status = response.status();

    span.record("status", status.as_u16());
    span.record("latency_ms", elapsed.as_millis() as u64);

    if status.is_server_error() {
        span.in_scope(|| warn!(status = status.as_u16(), "请求处理失败"));
    }

    metrics::record_http_request(
        method.as_str(),
        &route,
        status.as_u16(),
        elapsed.as_secs_f64(),
    );

    response
}

/// 路由模板，例如 `/api/messages/orders`
fn route_label(request: &Request) -> String {
    request
        .extensions()
        .get::<MatchedPath>()
        .map(|path| path.as_str().to_string())
        .unwrap_or_else(|| UNMATCHED_ROUTE.to_string())
}
