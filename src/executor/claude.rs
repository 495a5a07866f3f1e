//! Anthropic 风格执行器：`POST {base}/v1/messages`。
//!
//! 鉴权：tokenData.api_key 存在时用 `x-api-key`，否则用 Bearer accessToken。

use super::{
    ChunkStream, ExecuteError, ExecuteOptions, ExecutionRequest, ProviderExecutor, StatusError,
    build_http_client, error_from_response, payload_with_model,
};
use crate::config::Config;
use crate::credential::types::{CredentialStatus, StoredCredential};
use crate::util::model::strip_thinking_suffix;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use futures::TryStreamExt;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderValue};
use tokio_util::sync::CancellationToken;

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const ANTHROPIC_VERSION: &str = "2023-06-01";

const OAUTH_TOKEN_URL: &str = "https://console.anthropic.com/v1/oauth/token";
const OAUTH_CLIENT_ID: &str = "9d1c250a-e61b-44d9-88ed-5944d1962f5e";

#[derive(Debug, Clone)]
pub struct ClaudeExecutor {
    http: reqwest::Client,
    backend_log: bool,
}

impl ClaudeExecutor {
    pub fn new(cfg: &Config) -> anyhow::Result<Self> {
        Ok(Self {
            http: build_http_client(cfg)?,
            backend_log: cfg.backend_log_enabled(),
        })
    }

    fn base_url(auth: &StoredCredential) -> String {
        auth.base_url().unwrap_or(DEFAULT_BASE_URL).to_string()
    }

    fn build_headers(auth: &StoredCredential, req: &ExecutionRequest) -> HeaderMap {
        let mut h = HeaderMap::new();
        h.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        h.insert(
            "anthropic-version",
            HeaderValue::from_static(ANTHROPIC_VERSION),
        );

        match auth.api_key() {
            Some(key) => {
                h.insert(
                    "x-api-key",
                    HeaderValue::from_str(key).unwrap_or(HeaderValue::from_static("")),
                );
            }
            None => {
                h.insert(
                    AUTHORIZATION,
                    HeaderValue::from_str(&format!("Bearer {}", auth.access_token))
                        .unwrap_or(HeaderValue::from_static("")),
                );
            }
        }

        // 客户端透传的 anthropic-beta 等扩展头。
        for (k, v) in &req.metadata {
            if k.starts_with("anthropic-")
                && let (Ok(name), Ok(value)) = (
                    reqwest::header::HeaderName::from_bytes(k.as_bytes()),
                    HeaderValue::from_str(v),
                )
            {
                h.insert(name, value);
            }
        }

        h
    }

    async fn post(
        &self,
        url: String,
        headers: HeaderMap,
        body: Bytes,
        cancel: &CancellationToken,
    ) -> Result<reqwest::Response, ExecuteError> {
        if self.backend_log {
            crate::logging::backend_request("POST", &url, &headers, &body);
        }
        tokio::select! {
            _ = cancel.cancelled() => Err(ExecuteError::Cancelled),
            resp = self.http.post(url).headers(headers).body(body).send() => {
                resp.map_err(|e| StatusError::transport(&e).into())
            }
        }
    }

    async fn post_and_read(
        &self,
        url: String,
        auth: &StoredCredential,
        req: &ExecutionRequest,
        cancel: &CancellationToken,
    ) -> Result<Bytes, ExecuteError> {
        let model = strip_thinking_suffix(&req.model);
        let body = payload_with_model(&req.payload, &model);
        let headers = Self::build_headers(auth, req);

        let start = std::time::Instant::now();
        let resp = self.post(url, headers, body, cancel).await?;
        let status = resp.status();
        let headers = resp.headers().clone();

        let bytes = tokio::select! {
            _ = cancel.cancelled() => return Err(ExecuteError::Cancelled),
            b = resp.bytes() => b.map_err(|e| ExecuteError::from(StatusError::transport(&e)))?,
        };
        if self.backend_log {
            crate::logging::backend_response(status.as_u16(), start.elapsed(), &bytes);
        }

        if !status.is_success() {
            return Err(error_from_response(status.as_u16(), &headers, &bytes).into());
        }
        Ok(bytes)
    }
}

#[async_trait]
impl ProviderExecutor for ClaudeExecutor {
    fn identifier(&self) -> &'static str {
        "claude"
    }

    async fn execute(
        &self,
        auth: &StoredCredential,
        req: &ExecutionRequest,
        _opts: &ExecuteOptions,
        cancel: &CancellationToken,
    ) -> Result<Bytes, ExecuteError> {
        let url = format!("{}/v1/messages", Self::base_url(auth));
        self.post_and_read(url, auth, req, cancel).await
    }

    async fn execute_stream(
        &self,
        auth: &StoredCredential,
        req: &ExecutionRequest,
        _opts: &ExecuteOptions,
        cancel: &CancellationToken,
    ) -> Result<ChunkStream, ExecuteError> {
        let url = format!("{}/v1/messages", Self::base_url(auth));
        let model = strip_thinking_suffix(&req.model);
        let body = payload_with_model(&req.payload, &model);
        let headers = Self::build_headers(auth, req);

        let resp = self.post(url, headers, body, cancel).await?;
        let status = resp.status();
        if !status.is_success() {
            let headers = resp.headers().clone();
            let bytes = resp
                .bytes()
                .await
                .map_err(|e| ExecuteError::from(StatusError::transport(&e)))?;
            return Err(error_from_response(status.as_u16(), &headers, &bytes).into());
        }

        Ok(Box::pin(
            resp.bytes_stream().map_err(|e| StatusError::transport(&e)),
        ))
    }

    async fn refresh(&self, mut auth: StoredCredential) -> StoredCredential {
        if !auth.can_refresh() {
            // api_key 凭证没有可刷新的内容：保持原样即为成功。
            if auth.api_key().is_none() {
                auth.status = CredentialStatus::Error;
                auth.status_message = "缺少 refresh_token".to_string();
                auth.updated_at = Utc::now();
            }
            return auth;
        }

        #[derive(serde::Serialize)]
        struct RefreshPayload<'a> {
            grant_type: &'a str,
            refresh_token: &'a str,
            client_id: &'a str,
        }

        #[derive(serde::Deserialize)]
        struct TokenResponse {
            access_token: String,
            #[serde(default)]
            refresh_token: String,
            #[serde(default)]
            expires_in: i64,
        }

        let payload = RefreshPayload {
            grant_type: "refresh_token",
            refresh_token: &auth.refresh_token,
            client_id: OAUTH_CLIENT_ID,
        };

        let resp = self.http.post(OAUTH_TOKEN_URL).json(&payload).send().await;

        let resp = match resp {
            Ok(r) => r,
            Err(e) => {
                auth.status = CredentialStatus::Error;
                auth.status_message = format!("刷新 Token 失败: {e}");
                auth.updated_at = Utc::now();
                return auth;
            }
        };

        let status = resp.status();
        let body = match resp.bytes().await {
            Ok(b) => b,
            Err(e) => {
                auth.status = CredentialStatus::Error;
                auth.status_message = format!("读取刷新响应失败: {e}");
                auth.updated_at = Utc::now();
                return auth;
            }
        };

        if !status.is_success() {
            tracing::warn!(
                auth_id = %auth.id,
                status = status.as_u16(),
                "Claude OAuth 刷新 token 失败"
            );
            auth.status = CredentialStatus::Error;
            auth.status_message = format!("刷新 Token 失败（HTTP {}）", status.as_u16());
            auth.updated_at = Utc::now();
            return auth;
        }

        match sonic_rs::from_slice::<TokenResponse>(&body) {
            Ok(token) => {
                auth.access_token = token.access_token;
                if !token.refresh_token.is_empty() {
                    auth.refresh_token = token.refresh_token;
                }
                if token.expires_in > 0 {
                    auth.expires_at = Some(Utc::now() + chrono::Duration::seconds(token.expires_in));
                }
                auth.status = CredentialStatus::Ready;
                auth.status_message = String::new();
            }
            Err(e) => {
                auth.status = CredentialStatus::Error;
                auth.status_message = format!("解析刷新响应失败: {e}");
            }
        }
        auth.updated_at = Utc::now();
        auth
    }

    async fn count_tokens(
        &self,
        auth: &StoredCredential,
        req: &ExecutionRequest,
        _opts: &ExecuteOptions,
        cancel: &CancellationToken,
    ) -> Result<Bytes, ExecuteError> {
        let url = format!("{}/v1/messages/count_tokens", Self::base_url(auth));
        self.post_and_read(url, auth, req, cancel).await
    }

    fn prepare_request(
        &self,
        auth: &StoredCredential,
        builder: reqwest::RequestBuilder,
    ) -> reqwest::RequestBuilder {
        let builder = builder.header("anthropic-version", ANTHROPIC_VERSION);
        match auth.api_key() {
            Some(key) => builder.header("x-api-key", key),
            None => builder.header(AUTHORIZATION, format!("Bearer {}", auth.access_token)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn cred() -> StoredCredential {
        StoredCredential {
            id: "c1".to_string(),
            provider: "claude".to_string(),
            disabled: false,
            access_token: "acc-token".to_string(),
            refresh_token: String::new(),
            expires_at: None,
            token_data: HashMap::new(),
            status: CredentialStatus::Ready,
            status_message: String::new(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn bearer_auth_without_api_key() {
        let auth = cred();
        let req = ExecutionRequest::new("claude-3-opus", Bytes::from_static(b"{}"));
        let h = ClaudeExecutor::build_headers(&auth, &req);
        assert_eq!(h.get(AUTHORIZATION).unwrap(), "Bearer acc-token");
        assert!(h.get("x-api-key").is_none());
        assert_eq!(h.get("anthropic-version").unwrap(), ANTHROPIC_VERSION);
    }

    #[test]
    fn api_key_wins_over_bearer() {
        let mut auth = cred();
        auth.token_data
            .insert("api_key".to_string(), sonic_rs::Value::from("sk-test"));
        let req = ExecutionRequest::new("claude-3-opus", Bytes::from_static(b"{}"));
        let h = ClaudeExecutor::build_headers(&auth, &req);
        assert_eq!(h.get("x-api-key").unwrap(), "sk-test");
        assert!(h.get(AUTHORIZATION).is_none());
    }

    #[test]
    fn base_url_override_from_token_data() {
        let mut auth = cred();
        assert_eq!(ClaudeExecutor::base_url(&auth), DEFAULT_BASE_URL);

        auth.token_data.insert(
            "base_url".to_string(),
            sonic_rs::Value::from("https://claude.example.com/"),
        );
        assert_eq!(ClaudeExecutor::base_url(&auth), "https://claude.example.com");
    }

    #[tokio::test]
    async fn refresh_without_token_marks_error() {
        let cfg = Config {
            host: String::new(),
            port: 0,
            api_user_agent: "test".to_string(),
            timeout_ms: 1000,
            proxy: String::new(),
            api_key: String::new(),
            retry_count: 0,
            max_retry_wait_ms: 0,
            select_strategy: "round-robin".to_string(),
            debug: "off".to_string(),
            data_dir: "./data".to_string(),
        };
        let exec = ClaudeExecutor::new(&cfg).unwrap();

        let out = exec.refresh(cred()).await;
        assert_eq!(out.status, CredentialStatus::Error);
        assert!(!out.status_message.is_empty());

        // api_key 凭证无需刷新：保持 ready。
        let mut with_key = cred();
        with_key
            .token_data
            .insert("api_key".to_string(), sonic_rs::Value::from("sk-x"));
        let out = exec.refresh(with_key).await;
        assert_eq!(out.status, CredentialStatus::Ready);
    }
}
