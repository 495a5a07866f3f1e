//! HTTP 入口：OpenAI 兼容面 + provider 原生透传 + token 计数。

use crate::config::Config;
use crate::error::{AppError, DispatchError};
use crate::executor::{ExecuteOptions, ExecutionRequest};
use crate::fallback::FallbackConfig;
use crate::gateway::dispatch::resolve_chain;
use crate::logging;
use crate::pool::CredentialPool;
use crate::util::id;
use axum::body::{Body, Bytes};
use axum::extract::{OriginalUri, State};
use axum::http::{HeaderMap, Method, StatusCode, header};
use axum::response::{IntoResponse, Response};
use futures::StreamExt;
use serde::Serialize;
use sonic_rs::prelude::*;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Instant;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

#[derive(Clone)]
pub struct AppState {
    pub cfg: Config,
    pub pool: Arc<CredentialPool>,
    pub fallback: Arc<FallbackConfig>,
}

pub async fn handle_health() -> &'static str {
    "ok"
}

/// `GET /v1/models`：对外暴露已配置的虚拟模型别名。
pub async fn handle_list_models(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Response {
    if let Err(e) = check_api_key(&state.cfg, &headers) {
        return e.into_response();
    }

    #[derive(Serialize)]
    struct ModelEntry {
        id: String,
        object: &'static str,
        owned_by: &'static str,
    }

    #[derive(Serialize)]
    struct ModelsResponse {
        object: &'static str,
        data: Vec<ModelEntry>,
    }

    let settings = state.fallback.snapshot();
    let data = if settings.enabled {
        settings
            .virtual_models
            .iter()
            .map(|vm| ModelEntry {
                id: vm.name.clone(),
                object: "model",
                owned_by: "any2api",
            })
            .collect()
    } else {
        Vec::new()
    };

    axum::Json(ModelsResponse {
        object: "list",
        data,
    })
    .into_response()
}

/// `POST /v1/chat/completions`：OpenAI 兼容入口。
pub async fn handle_chat_completions(
    State(state): State<Arc<AppState>>,
    method: Method,
    uri: OriginalUri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    dispatch_request(state, method, uri, headers, body, "openai").await
}

/// `POST /v1/messages`：Anthropic 原生透传入口。
pub async fn handle_messages(
    State(state): State<Arc<AppState>>,
    method: Method,
    uri: OriginalUri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    dispatch_request(state, method, uri, headers, body, "claude").await
}

/// `POST /v1/messages/count_tokens`：provider 专属 token 计数。
pub async fn handle_count_tokens(
    State(state): State<Arc<AppState>>,
    method: Method,
    uri: OriginalUri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let start = Instant::now();
    if let Err(e) = check_api_key(&state.cfg, &headers) {
        return e.into_response();
    }
    if state.cfg.client_log_enabled() {
        logging::client_request(method.as_str(), uri.0.path(), &headers, body.as_ref());
    }

    let probe = match parse_probe(&body) {
        Ok(v) => v,
        Err(e) => return e.into_response(),
    };
    let chain = match resolve_chain(&state.fallback, &probe.model) {
        Ok(c) => c,
        Err(e) => return e.into_response(),
    };

    let req = build_request(&probe.model, &body, &headers);
    let opts = ExecuteOptions {
        stream: false,
        alt: String::new(),
        source_format: "claude".to_string(),
    };
    let cancel = CancellationToken::new();

    match state.pool.count_tokens(&chain, &req, &opts, &cancel).await {
        Ok(bytes) => {
            log_client_response(&state.cfg, StatusCode::OK.as_u16(), start, &bytes);
            json_bytes_response(StatusCode::OK, bytes)
        }
        Err(e) => e.into_response(),
    }
}

async fn dispatch_request(
    state: Arc<AppState>,
    method: Method,
    uri: OriginalUri,
    headers: HeaderMap,
    body: Bytes,
    source_format: &str,
) -> Response {
    let start = Instant::now();
    if let Err(e) = check_api_key(&state.cfg, &headers) {
        return e.into_response();
    }
    if state.cfg.client_log_enabled() {
        logging::client_request(method.as_str(), uri.0.path(), &headers, body.as_ref());
    }

    let probe = match parse_probe(&body) {
        Ok(v) => v,
        Err(e) => return e.into_response(),
    };
    let chain = match resolve_chain(&state.fallback, &probe.model) {
        Ok(c) => c,
        Err(e) => return e.into_response(),
    };

    let request_id = id::request_id();
    tracing::debug!(
        request_id = %request_id,
        model = %probe.model,
        stream = probe.stream,
        providers = chain.len(),
        "开始调度"
    );

    let req = build_request(&probe.model, &body, &headers);
    let opts = ExecuteOptions {
        stream: probe.stream,
        alt: if probe.stream { "sse".to_string() } else { String::new() },
        source_format: source_format.to_string(),
    };
    let cancel = CancellationToken::new();

    if probe.stream {
        let rx = state
            .pool
            .clone()
            .execute_stream(chain, req, opts, cancel.clone());
        return stream_response(rx, cancel).await;
    }

    match state.pool.execute(&chain, &req, &opts, &cancel).await {
        Ok(bytes) => {
            log_client_response(&state.cfg, StatusCode::OK.as_u16(), start, &bytes);
            json_bytes_response(StatusCode::OK, bytes)
        }
        Err(e) => {
            if state.cfg.client_log_enabled() {
                let v = sonic_rs::Value::from(e.to_string().as_str());
                logging::client_response(e.http_status(), start.elapsed(), Some(&v));
            }
            e.into_response()
        }
    }
}

/// 组装流式响应：首个结果决定 HTTP 状态；之后的错误以 SSE error 事件收尾。
async fn stream_response(
    mut rx: tokio::sync::mpsc::Receiver<Result<Bytes, DispatchError>>,
    cancel: CancellationToken,
) -> Response {
    let first = match rx.recv().await {
        Some(Ok(bytes)) => bytes,
        Some(Err(e)) => return e.into_response(),
        None => Bytes::new(),
    };

    // 响应体 drop（客户端断开）时取消上游。
    let guard = cancel.drop_guard();

    let rest = ReceiverStream::new(rx).map(|item| {
        Ok::<Bytes, Infallible>(match item {
            Ok(b) => b,
            Err(e) => sse_error_chunk(&e),
        })
    });
    let stream = futures::stream::iter([Ok(first)]).chain(rest).map(move |item| {
        let _ = &guard;
        item
    });

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .body(Body::from_stream(stream))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

struct Probe {
    model: String,
    stream: bool,
}

/// 只读取调度所需的两个字段，负载本身保持不透明。
fn parse_probe(body: &[u8]) -> Result<Probe, AppError> {
    let v: sonic_rs::Value = sonic_rs::from_slice(body)
        .map_err(|_| AppError::BadRequest("请求 JSON 解析失败，请检查请求体格式".to_string()))?;

    let model = v
        .get("model")
        .and_then(|m| m.as_str())
        .unwrap_or_default()
        .to_string();
    let stream = v.get("stream").and_then(|s| s.as_bool()).unwrap_or(false);

    Ok(Probe { model, stream })
}

fn build_request(model: &str, body: &Bytes, headers: &HeaderMap) -> ExecutionRequest {
    let mut req = ExecutionRequest::new(model, body.clone());
    // 透传 anthropic-beta 等扩展头给执行器。
    for (name, value) in headers.iter() {
        let key = name.as_str();
        if key.starts_with("anthropic-")
            && key != "anthropic-version"
            && let Ok(v) = value.to_str()
        {
            req.metadata.insert(key.to_string(), v.to_string());
        }
    }
    req
}

fn check_api_key(cfg: &Config, headers: &HeaderMap) -> Result<(), AppError> {
    let expected = cfg.api_key.trim();
    if expected.is_empty() {
        return Ok(());
    }

    let bearer = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().strip_prefix("Bearer "))
        .map(str::trim);
    if bearer == Some(expected) {
        return Ok(());
    }

    let api_key = headers
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .map(str::trim);
    if api_key == Some(expected) {
        return Ok(());
    }

    Err(AppError::Unauthorized("API Key 校验失败".to_string()))
}

fn json_bytes_response(status: StatusCode, bytes: Bytes) -> Response {
    (
        status,
        [(header::CONTENT_TYPE, "application/json")],
        bytes,
    )
        .into_response()
}

fn log_client_response(cfg: &Config, status: u16, start: Instant, body: &[u8]) {
    if cfg.client_log_enabled()
        && let Ok(v) = sonic_rs::from_slice::<sonic_rs::Value>(body)
    {
        logging::client_response(status, start.elapsed(), Some(&v));
    }
}

/// 流中途的终态错误：以 OpenAI 风格的 error 事件收尾。
fn sse_error_chunk(e: &DispatchError) -> Bytes {
    let mut err = sonic_rs::Object::new();
    err.insert("message", e.to_string().as_str());
    err.insert("type", "server_error");
    if let DispatchError::ModelCooldown { .. } = e {
        err.insert("code", "model_cooldown");
    }
    let mut outer = sonic_rs::Object::new();
    outer.insert("error", err);

    let json = sonic_rs::to_string(&outer.into_value()).unwrap_or_else(|_| "{}".to_string());
    Bytes::from(format!("data: {json}\n\n"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg_with_key(key: &str) -> Config {
        Config {
            host: String::new(),
            port: 0,
            api_user_agent: "test".to_string(),
            timeout_ms: 1000,
            proxy: String::new(),
            api_key: key.to_string(),
            retry_count: 0,
            max_retry_wait_ms: 0,
            select_strategy: "round-robin".to_string(),
            debug: "off".to_string(),
            data_dir: "./data".to_string(),
        }
    }

    #[test]
    fn probe_reads_model_and_stream() {
        let p = parse_probe(br#"{"model":"claude-3-opus","stream":true,"messages":[]}"#).unwrap();
        assert_eq!(p.model, "claude-3-opus");
        assert!(p.stream);

        let p = parse_probe(br#"{"model":"m"}"#).unwrap();
        assert!(!p.stream);

        assert!(parse_probe(b"not json").is_err());
    }

    #[test]
    fn api_key_check_accepts_bearer_and_x_api_key() {
        let cfg = cfg_with_key("secret");

        let mut h = HeaderMap::new();
        h.insert(header::AUTHORIZATION, "Bearer secret".parse().unwrap());
        assert!(check_api_key(&cfg, &h).is_ok());

        let mut h = HeaderMap::new();
        h.insert("x-api-key", "secret".parse().unwrap());
        assert!(check_api_key(&cfg, &h).is_ok());

        let mut h = HeaderMap::new();
        h.insert(header::AUTHORIZATION, "Bearer wrong".parse().unwrap());
        assert!(check_api_key(&cfg, &h).is_err());

        assert!(check_api_key(&cfg, &HeaderMap::new()).is_err());
    }

    #[test]
    fn empty_api_key_disables_auth() {
        let cfg = cfg_with_key("");
        assert!(check_api_key(&cfg, &HeaderMap::new()).is_ok());
    }

    #[test]
    fn metadata_collects_anthropic_headers() {
        let mut h = HeaderMap::new();
        h.insert("anthropic-beta", "tools-2024".parse().unwrap());
        h.insert("anthropic-version", "2023-06-01".parse().unwrap());
        h.insert("content-type", "application/json".parse().unwrap());

        let req = build_request("m", &Bytes::from_static(b"{}"), &h);
        assert_eq!(req.metadata.get("anthropic-beta").unwrap(), "tools-2024");
        // anthropic-version 由执行器自行设置，不透传。
        assert!(!req.metadata.contains_key("anthropic-version"));
        assert!(!req.metadata.contains_key("content-type"));
    }

    #[test]
    fn sse_error_chunk_is_valid_event() {
        let e = DispatchError::status(502, "bad gateway");
        let chunk = sse_error_chunk(&e);
        let s = String::from_utf8(chunk.to_vec()).unwrap();
        assert!(s.starts_with("data: "));
        assert!(s.ends_with("\n\n"));
        assert!(s.contains("bad gateway"));
    }
}
