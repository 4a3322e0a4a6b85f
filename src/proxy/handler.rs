//! # 代理请求处理
//!
//! 认证 → 全局限流 → 选择密钥 → 单密钥限流 → 构造请求头 → 演练短路或转发重试 →
//! 响应分类与状态更新 → 追踪 → 响应回传。请求路径上的任何失败都转换为 HTTP 响应。

use axum::Json;
use axum::body::Body;
use axum::extract::{Path, Request, State};
use axum::http::header::{CONTENT_TYPE, RETRY_AFTER};
use axum::http::{HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use futures::Stream;
use serde_json::json;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll};
use std::time::Instant;
use uuid::Uuid;

use super::classify::{
    REMEDIATION_MESSAGE, extract_error_hint, looks_like_payment_error, status_hint,
};
use super::context::ProxyContext;
use super::headers::{authorize, build_upstream_headers, filter_hop_by_hop};
use super::prompt::{PromptPreview, extract_prompt_preview};
use super::retry_policy::{
    AttemptOutcome, RetryPolicy, exhaustion_cooldown, log_retry_decision, parse_retry_after,
};
use super::upstream_url::build_upstream_url;
use crate::error::{ProxyError, RateLimitScope};
use crate::key_pool::KeyRecord;
use crate::logging::{LogComponent, LogStage};
use crate::scheduler::{
    CursorSnapshot, mark_blocked, mark_exhausted, revert_selection, select_key_for_request,
};
use crate::trace::{TraceEntry, TraceErrorCode};
use crate::utils::time;
use crate::{ldebug, linfo, lwarn};

/// 付费失败的封禁原因
pub const PAYMENT_BLOCK_REASON: &str = "payment_required";

/// `{base}/{*path}` 入口
pub async fn proxy_path(
    State(ctx): State<Arc<ProxyContext>>,
    Path(path): Path<String>,
    request: Request,
) -> Response {
    handle_request(ctx, path, request).await
}

/// `{base}` 入口
pub async fn proxy_root(State(ctx): State<Arc<ProxyContext>>, request: Request) -> Response {
    handle_request(ctx, String::new(), request).await
}

/// 单个请求的追踪上下文
struct RequestScope<'a> {
    request_id: String,
    method: Method,
    path: String,
    endpoint: String,
    started: Instant,
    preview: PromptPreview,
    key: Option<&'a KeyRecord>,
}

impl RequestScope<'_> {
    fn latency_ms(&self) -> u64 {
        u64::try_from(self.started.elapsed().as_millis()).unwrap_or(u64::MAX)
    }

    fn label(&self) -> &str {
        self.key.map_or("", |key| key.label.as_str())
    }

    fn trace_entry(
        &self,
        ctx: &ProxyContext,
        status: u16,
        error_code: Option<TraceErrorCode>,
        rotation_index: usize,
    ) -> TraceEntry {
        TraceEntry {
            ts: ctx.trace_timestamp(),
            request_id: self.request_id.clone(),
            method: self.method.to_string(),
            prompt_hint: self.preview.hint.clone(),
            prompt_head: self.preview.head.clone(),
            key_label: self.label().to_string(),
            key_hash: self.key.map(|key| key.hash.clone()).unwrap_or_default(),
            endpoint: self.endpoint.clone(),
            status,
            latency_ms: self.latency_ms(),
            error_code,
            rotation_index,
        }
    }
}

/// 处理一个代理请求
pub async fn handle_request(ctx: Arc<ProxyContext>, path: String, request: Request) -> Response {
    let (parts, body) = request.into_parts();
    let mut scope = RequestScope {
        request_id: Uuid::new_v4().simple().to_string(),
        method: parts.method.clone(),
        endpoint: format!("/{path}"),
        path,
        started: Instant::now(),
        preview: PromptPreview::default(),
        key: None,
    };
    let config = &ctx.config;
    ldebug!(
        &scope.request_id,
        LogStage::RequestStart,
        LogComponent::Proxy,
        "proxy_request_start",
        "收到代理请求",
        method = %scope.method,
        endpoint = %scope.endpoint
    );

    if !authorize(&parts.headers, &config.proxy_token, &config.proxy_token_header) {
        lwarn!(
            &scope.request_id,
            LogStage::Authentication,
            LogComponent::Auth,
            "proxy_unauthorized",
            "代理令牌缺失或不匹配",
            endpoint = %scope.endpoint
        );
        return ProxyError::auth_rejected("代理令牌缺失或不匹配").into_response();
    }

    if !ctx.rate_limiter.allow() {
        lwarn!(
            &scope.request_id,
            LogStage::RateLimit,
            LogComponent::RateLimiter,
            "proxy_rate_limited",
            "触发全局限流",
            endpoint = %scope.endpoint
        );
        return ProxyError::rate_limited(RateLimitScope::Global, "全局限流").into_response();
    }

    let admission = {
        let mut state = ctx.state.lock().await;
        let cursor = CursorSnapshot::capture(&state);
        let auto_rotate = state.auto_rotate && config.auto_rotate_allowed;
        let health = if auto_rotate || config.require_usage_before_request {
            Some(ctx.health_cache.snapshot().await)
        } else {
            None
        };
        let selected = select_key_for_request(
            &ctx.registry,
            &mut state,
            auto_rotate,
            health.as_deref(),
            ctx.usage_policy(),
        );
        match selected {
            None => None,
            Some(selection) if ctx.key_rate_limiter.allow(&selection.key.label) => {
                Some(Ok(selection.key))
            }
            Some(selection) => {
                revert_selection(&mut state, cursor, &selection);
                Some(Err(selection.key))
            }
        }
    };

    let key = match admission {
        Some(Ok(key)) => key,
        Some(Err(key)) => {
            ctx.persist(&scope.request_id).await;
            lwarn!(
                &scope.request_id,
                LogStage::RateLimit,
                LogComponent::RateLimiter,
                "proxy_key_rate_limited",
                "触发单密钥限流",
                endpoint = %scope.endpoint,
                key_label = %key.label
            );
            return ProxyError::rate_limited(RateLimitScope::PerKey, "单密钥限流").into_response();
        }
        None => {
            lwarn!(
                &scope.request_id,
                LogStage::Scheduling,
                LogComponent::Scheduler,
                "no_keys_available",
                "没有可用密钥",
                endpoint = %scope.endpoint
            );
            return ProxyError::no_eligible_key(REMEDIATION_MESSAGE).into_response();
        }
    };
    scope.key = Some(key);
    ctx.persist(&scope.request_id).await;

    let upstream_url = build_upstream_url(&config.upstream_base_url, &scope.path, parts.uri.query());
    let upstream_headers =
        match build_upstream_headers(&parts.headers, &config.proxy_token_header, &key.secret) {
            Ok(headers) => headers,
            Err(e) => return e.into_response(),
        };
    let body = match axum::body::to_bytes(body, usize::MAX).await {
        Ok(body) => body,
        Err(e) => {
            return ProxyError::internal_with_source("读取请求体失败", e).into_response();
        }
    };
    scope.preview = extract_prompt_preview(&body, header_str(&parts.headers, CONTENT_TYPE));

    if config.dry_run {
        return dry_run_response(&ctx, &scope, &upstream_url).await;
    }

    forward(&ctx, &scope, upstream_url, upstream_headers, body).await
}

fn header_str(headers: &HeaderMap, name: axum::http::HeaderName) -> &str {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
}

async fn dry_run_response(ctx: &ProxyContext, scope: &RequestScope<'_>, upstream_url: &str) -> Response {
    let label = scope.label();
    let rotation_index = {
        let mut state = ctx.state.lock().await;
        state.record_request(label, 200);
        state.rotation_index
    };
    ctx.persist(&scope.request_id).await;
    linfo!(
        &scope.request_id,
        LogStage::Response,
        LogComponent::Proxy,
        "proxy_request",
        "演练模式请求完成",
        endpoint = %scope.endpoint,
        status = 200,
        key_label = %label,
        latency_ms = scope.latency_ms()
    );
    ctx.trace_writer
        .enqueue(scope.trace_entry(ctx, 200, None, rotation_index));

    (
        StatusCode::OK,
        Json(json!({
            "dry_run": true,
            "upstream_url": upstream_url,
            "method": scope.method.as_str(),
            "path": scope.path,
            "key_label": label,
        })),
    )
        .into_response()
}

async fn forward(
    ctx: &ProxyContext,
    scope: &RequestScope<'_>,
    upstream_url: String,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let label = scope.label();
    let policy = RetryPolicy::new(ctx.config.proxy_retry_max, ctx.config.proxy_retry_base_ms);
    let mut attempt = 0_u32;

    let result = loop {
        let result = ctx
            .client
            .request(scope.method.clone(), &upstream_url)
            .headers(headers.clone())
            .body(body.clone())
            .send()
            .await;
        let outcome = match &result {
            Ok(response) => AttemptOutcome::Status(response.status().as_u16()),
            Err(_) => AttemptOutcome::TransportError,
        };
        let decision = policy.evaluate(attempt, outcome);
        log_retry_decision(&scope.request_id, outcome, &decision, attempt);
        if !decision.should_retry {
            break result;
        }
        drop(result);
        tokio::time::sleep(decision.delay).await;
        attempt += 1;
    };

    let upstream = match result {
        Ok(response) => response,
        Err(e) => return upstream_failure(ctx, scope, &e).await,
    };

    let status = upstream.status();
    let status_code = status.as_u16();
    let response_headers = filter_hop_by_hop(upstream.headers());
    let retry_after = upstream
        .headers()
        .get(RETRY_AFTER)
        .and_then(|value| value.to_str().ok())
        .map(str::to_owned);

    let (relay_body, payment_required) = if status_code >= 400 {
        let content_type = header_str(upstream.headers(), CONTENT_TYPE).to_owned();
        let content = match upstream.bytes().await {
            Ok(content) => content,
            Err(e) => {
                lwarn!(
                    &scope.request_id,
                    LogStage::ResponseFailure,
                    LogComponent::Upstream,
                    "upstream_body_read_failed",
                    "读取上游错误响应体失败",
                    status = status_code,
                    error = %e
                );
                Bytes::new()
            }
        };
        let hint = extract_error_hint(&content, &content_type);
        let payment_required = looks_like_payment_error(status_code, &hint);
        ldebug!(
            &scope.request_id,
            LogStage::ResponseFailure,
            LogComponent::Upstream,
            "upstream_error_response",
            "上游返回错误状态",
            status = status_code,
            hint = %hint,
            status_hint = status_hint(status_code),
            payment_required = payment_required
        );
        (Body::from(content), payment_required)
    } else {
        let request_id = scope.request_id.clone();
        let relay = RelayStream::new(
            Box::pin(upstream.bytes_stream()),
            Box::new(move |relayed| {
                ldebug!(
                    &request_id,
                    LogStage::Response,
                    LogComponent::Upstream,
                    "upstream_stream_closed",
                    "上游流已关闭",
                    relayed_bytes = relayed
                );
            }),
        );
        (Body::from_stream(relay), false)
    };

    let rotation_index = {
        let mut state = ctx.state.lock().await;
        state.record_request(label, status_code);
        if payment_required {
            mark_blocked(
                &mut state,
                label,
                PAYMENT_BLOCK_REASON,
                Some(ctx.config.payment_block_seconds),
            );
        } else if let Some(cooldown) = exhaustion_cooldown(
            status_code,
            ctx.config.rotation_cooldown_seconds,
            parse_retry_after(retry_after.as_deref(), time::now_utc()),
        ) {
            mark_exhausted(&mut state, label, cooldown);
        }
        state.rotation_index
    };
    if payment_required {
        lwarn!(
            &scope.request_id,
            LogStage::Scheduling,
            LogComponent::KeyPool,
            "proxy_key_blocked",
            "检测到付费失败，封禁密钥",
            key_label = %label,
            reason = PAYMENT_BLOCK_REASON
        );
    }
    ctx.persist(&scope.request_id).await;

    linfo!(
        &scope.request_id,
        LogStage::Response,
        LogComponent::Proxy,
        "proxy_request",
        "代理请求完成",
        endpoint = %scope.endpoint,
        status = status_code,
        key_label = %label,
        latency_ms = scope.latency_ms(),
        attempts = attempt + 1
    );
    let error_code = if payment_required {
        Some(TraceErrorCode::payment_required())
    } else {
        (status_code >= 400).then_some(TraceErrorCode::Status(status_code))
    };
    ctx.trace_writer
        .enqueue(scope.trace_entry(ctx, status_code, error_code, rotation_index));

    let mut response = Response::new(relay_body);
    *response.status_mut() = status;
    *response.headers_mut() = response_headers;
    response
}

/// 重试耗尽后的传输失败：按 503 计数，向调用方返回 502
async fn upstream_failure(
    ctx: &ProxyContext,
    scope: &RequestScope<'_>,
    error: &reqwest::Error,
) -> Response {
    const RECORDED_STATUS: u16 = 503;
    let label = scope.label();
    let rotation_index = {
        let mut state = ctx.state.lock().await;
        state.record_request(label, RECORDED_STATUS);
        state.rotation_index
    };
    ctx.persist(&scope.request_id).await;
    lwarn!(
        &scope.request_id,
        LogStage::UpstreamRequest,
        LogComponent::Upstream,
        "proxy_upstream_error",
        "上游请求失败",
        endpoint = %scope.endpoint,
        status = RECORDED_STATUS,
        key_label = %label,
        latency_ms = scope.latency_ms(),
        error = %error
    );
    ctx.trace_writer.enqueue(scope.trace_entry(
        ctx,
        RECORDED_STATUS,
        Some(TraceErrorCode::upstream_error()),
        rotation_index,
    ));
    ProxyError::upstream_transport("上游请求失败", anyhow::anyhow!(error.to_string())).into_response()
}

type ByteStream = Pin<Box<dyn Stream<Item = reqwest::Result<Bytes>> + Send>>;
type CloseCallback = Box<dyn FnOnce(u64) + Send>;

/// 透传上游数据块；流结束或被丢弃时调用一次关闭回调
pub struct RelayStream {
    inner: ByteStream,
    relayed: u64,
    on_close: Option<CloseCallback>,
}

impl RelayStream {
    /// 包装上游字节流
    #[must_use]
    pub fn new(inner: ByteStream, on_close: CloseCallback) -> Self {
        Self {
            inner,
            relayed: 0,
            on_close: Some(on_close),
        }
    }

    fn close(&mut self) {
        if let Some(callback) = self.on_close.take() {
            callback(self.relayed);
        }
    }
}

impl Stream for RelayStream {
    type Item = reqwest::Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Option<Self::Item>> {
        let polled = self.inner.as_mut().poll_next(cx);
        match &polled {
            Poll::Ready(Some(Ok(chunk))) => self.relayed += chunk.len() as u64,
            Poll::Ready(None) => self.close(),
            _ => {}
        }
        polled
    }
}

impl Drop for RelayStream {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use std::sync::atomic::{AtomicU64, Ordering};

    #[tokio::test]
    async fn relay_stream_reports_bytes_once() {
        let closed = Arc::new(AtomicU64::new(u64::MAX));
        let seen = Arc::clone(&closed);
        let chunks: Vec<reqwest::Result<Bytes>> =
            vec![Ok(Bytes::from_static(b"ab")), Ok(Bytes::from_static(b"cde"))];
        let mut relay = RelayStream::new(
            Box::pin(futures::stream::iter(chunks)),
            Box::new(move |relayed| seen.store(relayed, Ordering::SeqCst)),
        );
        let mut total = 0;
        while let Some(chunk) = relay.next().await {
            total += chunk.unwrap().len();
        }
        assert_eq!(total, 5);
        assert_eq!(closed.load(Ordering::SeqCst), 5);
        drop(relay);
        assert_eq!(closed.load(Ordering::SeqCst), 5);
    }
}
