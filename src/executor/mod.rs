//! Provider 执行器：对单个凭证执行一次上游请求（流式或非流式），
//! 并暴露 token 刷新能力。
//!
//! 执行器自身无共享可变状态；重试、冷却与轮换全部由凭证池负责。

pub mod claude;
pub mod codex;
pub mod gemini;

use crate::config::Config;
use crate::credential::types::StoredCredential;
use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use reqwest::header::HeaderMap;
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// 上游返回的错误：携带 HTTP 状态码与可选的 retry-after。
#[derive(Debug, Clone, Error)]
#[error("上游返回 {status}: {message}")]
pub struct StatusError {
    pub status: u16,
    pub message: String,
    pub retry_after_ms: Option<u64>,
}

impl StatusError {
    pub fn new(status: u16, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            retry_after_ms: None,
        }
    }

    /// 网络层错误折算为 HTTP 语义：超时 → 408，其余 → 502。
    pub fn transport(e: &reqwest::Error) -> Self {
        let status = if e.is_timeout() { 408 } else { 502 };
        Self::new(status, e.to_string())
    }

    pub fn retryable(&self) -> bool {
        matches!(self.status, 408 | 429 | 500..=599)
    }
}

/// 一次执行的错误：上游错误或取消。
#[derive(Debug, Clone, Error)]
pub enum ExecuteError {
    #[error(transparent)]
    Status(#[from] StatusError),

    #[error("请求已取消")]
    Cancelled,
}

/// 流式响应：惰性字节块序列；首个 Err 即标记该次尝试失败。
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<Bytes, StatusError>> + Send>>;

/// 转发给执行器的请求：模型名 + 不透明负载 + 元数据。
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub model: String,
    pub payload: Bytes,
    pub metadata: HashMap<String, String>,
}

impl ExecutionRequest {
    pub fn new(model: impl Into<String>, payload: Bytes) -> Self {
        Self {
            model: model.into(),
            payload,
            metadata: HashMap::new(),
        }
    }
}

/// 执行选项。
#[derive(Debug, Clone, Default)]
pub struct ExecuteOptions {
    pub stream: bool,
    /// 流式查询参数变体（如 Google 的 `alt=sse`）。
    pub alt: String,
    /// 入站请求的原始格式标签（openai / claude / ...）。
    pub source_format: String,
}

/// 每个 provider 一个适配器；对一个凭证执行一次请求。
#[async_trait]
pub trait ProviderExecutor: Send + Sync {
    /// provider 标签（小写），进程生命周期内稳定。
    fn identifier(&self) -> &'static str;

    /// 一次非流式请求。
    async fn execute(
        &self,
        auth: &StoredCredential,
        req: &ExecutionRequest,
        opts: &ExecuteOptions,
        cancel: &CancellationToken,
    ) -> Result<Bytes, ExecuteError>;

    /// 一次流式请求：返回惰性块序列。
    async fn execute_stream(
        &self,
        auth: &StoredCredential,
        req: &ExecutionRequest,
        opts: &ExecuteOptions,
        cancel: &CancellationToken,
    ) -> Result<ChunkStream, ExecuteError>;

    /// 尽力而为的 token 刷新：失败时返回 status=error 的凭证，绝不抛错。
    async fn refresh(&self, auth: StoredCredential) -> StoredCredential;

    /// provider 专属的 token 计数（可选能力）。
    async fn count_tokens(
        &self,
        auth: &StoredCredential,
        req: &ExecutionRequest,
        opts: &ExecuteOptions,
        cancel: &CancellationToken,
    ) -> Result<Bytes, ExecuteError> {
        let _ = (auth, req, opts, cancel);
        Err(StatusError::new(404, format!("{} 不支持 token 计数", self.identifier())).into())
    }

    /// 为透传路由附加鉴权头（可选能力）。
    fn prepare_request(
        &self,
        auth: &StoredCredential,
        builder: reqwest::RequestBuilder,
    ) -> reqwest::RequestBuilder {
        let _ = auth;
        builder
    }
}

/// provider 标签 → 执行器。
#[derive(Clone, Default)]
pub struct ExecutorRegistry {
    map: HashMap<String, Arc<dyn ProviderExecutor>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, executor: Arc<dyn ProviderExecutor>) {
        self.map.insert(executor.identifier().to_string(), executor);
    }

    pub fn get(&self, provider: &str) -> Option<Arc<dyn ProviderExecutor>> {
        self.map
            .get(&crate::util::model::normalize_provider(provider))
            .cloned()
    }
}

/// 按 Config 构建上游 HTTP client（超时、代理、连接池设置与各执行器一致）。
pub fn build_http_client(cfg: &Config) -> anyhow::Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder()
        .pool_max_idle_per_host(10)
        .pool_idle_timeout(Duration::from_secs(90))
        .user_agent(cfg.api_user_agent.clone());

    if cfg.timeout_ms > 0 {
        builder = builder.timeout(Duration::from_millis(cfg.timeout_ms));
    }

    if !cfg.proxy.trim().is_empty() {
        builder = builder.proxy(reqwest::Proxy::all(cfg.proxy.trim())?);
    }

    Ok(builder.build()?)
}

/// 从响应头解析 retry-after（秒，容忍小数），换算为毫秒。
pub fn retry_after_ms_from_headers(headers: &HeaderMap) -> Option<u64> {
    let raw = headers.get(reqwest::header::RETRY_AFTER)?.to_str().ok()?;
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(secs) = raw.parse::<u64>() {
        return Some(secs.saturating_mul(1000));
    }
    let secs: f64 = raw.parse().ok()?;
    if !(secs.is_finite() && secs >= 0.0) {
        return None;
    }
    Some((secs * 1000.0) as u64)
}

/// 把非 2xx 响应折算为 StatusError：尽量取 JSON body 里的 error.message。
pub fn error_from_response(status: u16, headers: &HeaderMap, body: &[u8]) -> StatusError {
    #[derive(Debug, serde::Deserialize)]
    struct ErrResp {
        error: ErrInner,
    }

    #[derive(Debug, serde::Deserialize)]
    struct ErrInner {
        #[serde(default)]
        message: String,
    }

    let message = match sonic_rs::from_slice::<ErrResp>(body) {
        Ok(e) if !e.error.message.trim().is_empty() => e.error.message,
        _ => {
            let text = String::from_utf8_lossy(body);
            let text = text.trim();
            if text.is_empty() {
                "Unknown error".to_string()
            } else {
                text.chars().take(512).collect()
            }
        }
    };

    StatusError {
        status,
        message,
        retry_after_ms: retry_after_ms_from_headers(headers),
    }
}

/// 将 payload 中的 model 字段替换为目标模型（thinking 后缀已剥离）。
///
/// 负载对执行器不透明，但 model 字段必须与路由选择的上游模型一致。
pub fn payload_with_model(payload: &[u8], model: &str) -> Bytes {
    use sonic_rs::JsonValueMutTrait;

    let Ok(mut v) = sonic_rs::from_slice::<sonic_rs::Value>(payload) else {
        return Bytes::copy_from_slice(payload);
    };
    let Some(obj) = v.as_object_mut() else {
        return Bytes::copy_from_slice(payload);
    };
    obj.insert("model", sonic_rs::Value::from(model));
    match sonic_rs::to_vec(&v) {
        Ok(out) => Bytes::from(out),
        Err(_) => Bytes::copy_from_slice(payload),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sonic_rs::JsonValueTrait;

    #[test]
    fn retry_after_parses_integer_and_fraction() {
        let mut headers = HeaderMap::new();
        headers.insert("retry-after", "2".parse().unwrap());
        assert_eq!(retry_after_ms_from_headers(&headers), Some(2000));

        headers.insert("retry-after", "0.5".parse().unwrap());
        assert_eq!(retry_after_ms_from_headers(&headers), Some(500));

        headers.insert("retry-after", "bogus".parse().unwrap());
        assert_eq!(retry_after_ms_from_headers(&headers), None);
    }

    #[test]
    fn error_from_response_prefers_json_message() {
        let headers = HeaderMap::new();
        let body = br#"{"error":{"message":"quota exceeded"}}"#;
        let err = error_from_response(429, &headers, body);
        assert_eq!(err.status, 429);
        assert_eq!(err.message, "quota exceeded");

        let err = error_from_response(500, &headers, b"plain text failure");
        assert_eq!(err.message, "plain text failure");
    }

    #[test]
    fn error_from_response_carries_retry_after() {
        let mut headers = HeaderMap::new();
        headers.insert("retry-after", "3".parse().unwrap());
        let err = error_from_response(429, &headers, b"{}");
        assert_eq!(err.retry_after_ms, Some(3000));
        assert!(err.retryable());
    }

    #[test]
    fn payload_with_model_rewrites_model_field() {
        let body = br#"{"model":"virtual-x","messages":[]}"#;
        let out = payload_with_model(body, "claude-3-opus");
        let v: sonic_rs::Value = sonic_rs::from_slice(&out).unwrap();
        assert_eq!(v.get("model").and_then(|m| m.as_str()), Some("claude-3-opus"));
    }

    #[test]
    fn status_error_retryable_matrix() {
        assert!(StatusError::new(429, "x").retryable());
        assert!(StatusError::new(408, "x").retryable());
        assert!(StatusError::new(502, "x").retryable());
        assert!(!StatusError::new(401, "x").retryable());
        assert!(!StatusError::new(404, "x").retryable());
    }
}
