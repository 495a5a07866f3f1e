//! Google Generative 风格执行器：`POST {base}/v1beta/models/{model}:{action}`。
//!
//! 流式动作为 `streamGenerateContent`，需要附带查询参数 `alt=sse`。

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
use sonic_rs::JsonValueTrait;
use tokio_util::sync::CancellationToken;

const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com";
const OAUTH_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";

#[derive(Debug, Clone)]
pub struct GeminiExecutor {
    http: reqwest::Client,
    backend_log: bool,
}

impl GeminiExecutor {
    pub fn new(cfg: &Config) -> anyhow::Result<Self> {
        Ok(Self {
            http: build_http_client(cfg)?,
            backend_log: cfg.backend_log_enabled(),
        })
    }

    fn base_url(auth: &StoredCredential) -> String {
        auth.base_url().unwrap_or(DEFAULT_BASE_URL).to_string()
    }

    fn action_url(auth: &StoredCredential, model: &str, action: &str, sse: bool) -> String {
        let mut url = format!("{}/v1beta/models/{model}:{action}", Self::base_url(auth));
        if sse {
            url.push_str("?alt=sse");
        }
        url
    }

    fn build_headers(auth: &StoredCredential) -> HeaderMap {
        let mut h = HeaderMap::new();
        h.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        match auth.api_key() {
            Some(key) => {
                h.insert(
                    "x-goog-api-key",
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

    async fn post_action(
        &self,
        auth: &StoredCredential,
        req: &ExecutionRequest,
        action: &str,
        cancel: &CancellationToken,
    ) -> Result<Bytes, ExecuteError> {
        let model = strip_thinking_suffix(&req.model);
        let url = Self::action_url(auth, &model, action, false);
        let body = payload_with_model(&req.payload, &model);

        let start = std::time::Instant::now();
        let resp = self.post(url, Self::build_headers(auth), body, cancel).await?;
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
impl ProviderExecutor for GeminiExecutor {
    fn identifier(&self) -> &'static str {
        "gemini"
    }

    async fn execute(
        &self,
        auth: &StoredCredential,
        req: &ExecutionRequest,
        _opts: &ExecuteOptions,
        cancel: &CancellationToken,
    ) -> Result<Bytes, ExecuteError> {
        self.post_action(auth, req, "generateContent", cancel).await
    }

    async fn execute_stream(
        &self,
        auth: &StoredCredential,
        req: &ExecutionRequest,
        opts: &ExecuteOptions,
        cancel: &CancellationToken,
    ) -> Result<ChunkStream, ExecuteError> {
        let model = strip_thinking_suffix(&req.model);
        // 调用方可通过 opts.alt 覆盖流式变体；缺省即 sse。
        let sse = opts.alt.is_empty() || opts.alt == "sse";
        let url = Self::action_url(auth, &model, "streamGenerateContent", sse);
        let body = payload_with_model(&req.payload, &model);

        let resp = self.post(url, Self::build_headers(auth), body, cancel).await?;
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
            if auth.api_key().is_none() {
                auth.status = CredentialStatus::Error;
                auth.status_message = "缺少 refresh_token".to_string();
                auth.updated_at = Utc::now();
            }
            return auth;
        }

        let client_id = auth
            .token_data
            .get("client_id")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        let client_secret = auth
            .token_data
            .get("client_secret")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        if client_id.is_empty() {
            auth.status = CredentialStatus::Error;
            auth.status_message = "缺少 client_id，无法刷新".to_string();
            auth.updated_at = Utc::now();
            return auth;
        }

        #[derive(serde::Deserialize)]
        struct TokenResponse {
            access_token: String,
            #[serde(default)]
            refresh_token: String,
            #[serde(default)]
            expires_in: i64,
        }

        let resp = self
            .http
            .post(OAUTH_TOKEN_URL)
            .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
            .form(&[
                ("client_id", client_id.as_str()),
                ("client_secret", client_secret.as_str()),
                ("grant_type", "refresh_token"),
                ("refresh_token", auth.refresh_token.as_str()),
            ])
            .send()
            .await;

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
                "Google OAuth 刷新 token 失败"
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
        self.post_action(auth, req, "countTokens", cancel).await
    }

    fn prepare_request(
        &self,
        auth: &StoredCredential,
        builder: reqwest::RequestBuilder,
    ) -> reqwest::RequestBuilder {
        match auth.api_key() {
            Some(key) => builder.header("x-goog-api-key", key),
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
            id: "g1".to_string(),
            provider: "gemini".to_string(),
            disabled: false,
            access_token: "acc".to_string(),
            refresh_token: String::new(),
            expires_at: None,
            token_data: HashMap::new(),
            status: CredentialStatus::Ready,
            status_message: String::new(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn stream_url_carries_alt_sse() {
        let auth = cred();
        assert_eq!(
            GeminiExecutor::action_url(&auth, "gemini-2.0-pro", "streamGenerateContent", true),
            "https://generativelanguage.googleapis.com/v1beta/models/gemini-2.0-pro:streamGenerateContent?alt=sse"
        );
        assert_eq!(
            GeminiExecutor::action_url(&auth, "gemini-2.0-pro", "generateContent", false),
            "https://generativelanguage.googleapis.com/v1beta/models/gemini-2.0-pro:generateContent"
        );
    }

    #[test]
    fn goog_api_key_header_when_present() {
        let mut auth = cred();
        auth.token_data
            .insert("api_key".to_string(), sonic_rs::Value::from("gk-test"));
        let h = GeminiExecutor::build_headers(&auth);
        assert_eq!(h.get("x-goog-api-key").unwrap(), "gk-test");
        assert!(h.get(AUTHORIZATION).is_none());

        let h = GeminiExecutor::build_headers(&cred());
        assert_eq!(h.get(AUTHORIZATION).unwrap(), "Bearer acc");
    }
}
