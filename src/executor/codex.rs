//! OpenAI 兼容执行器：`POST {base}/v1/chat/completions`，Bearer 鉴权。
//!
//! 负载本身就是 OpenAI 格式，直接透传；流式即上游 SSE 原样转发。

use super::{
    ChunkStream, ExecuteError, ExecuteOptions, ExecutionRequest, ProviderExecutor, StatusError,
    build_http_client, error_from_response, payload_with_model,
};
use crate::config::Config;
use crate::credential::types::StoredCredential;
use crate::util::model::strip_thinking_suffix;
use async_trait::async_trait;
use bytes::Bytes;
use futures::TryStreamExt;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderValue};
use tokio_util::sync::CancellationToken;

const DEFAULT_BASE_URL: &str = "https://api.openai.com";

#[derive(Debug, Clone)]
pub struct CodexExecutor {
    http: reqwest::Client,
    backend_log: bool,
}

impl CodexExecutor {
    pub fn new(cfg: &Config) -> anyhow::Result<Self> {
        Ok(Self {
            http: build_http_client(cfg)?,
            backend_log: cfg.backend_log_enabled(),
        })
    }

    fn base_url(auth: &StoredCredential) -> String {
        auth.base_url().unwrap_or(DEFAULT_BASE_URL).to_string()
    }

    fn build_headers(auth: &StoredCredential) -> HeaderMap {
        let mut h = HeaderMap::new();
        h.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let token = auth.api_key().unwrap_or(&auth.access_token);
        h.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {token}"))
                .unwrap_or(HeaderValue::from_static("")),
        );
        h
    }

    async fn post(
        &self,
        auth: &StoredCredential,
        req: &ExecutionRequest,
        cancel: &CancellationToken,
    ) -> Result<reqwest::Response, ExecuteError> {
        let url = format!("{}/v1/chat/completions", Self::base_url(auth));
        let model = strip_thinking_suffix(&req.model);
        let body = payload_with_model(&req.payload, &model);
        let headers = Self::build_headers(auth);

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
}

#[async_trait]
impl ProviderExecutor for CodexExecutor {
    fn identifier(&self) -> &'static str {
        "codex"
    }

    async fn execute(
        &self,
        auth: &StoredCredential,
        req: &ExecutionRequest,
        _opts: &ExecuteOptions,
        cancel: &CancellationToken,
    ) -> Result<Bytes, ExecuteError> {
        let start = std::time::Instant::now();
        let resp = self.post(auth, req, cancel).await?;
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

    async fn execute_stream(
        &self,
        auth: &StoredCredential,
        req: &ExecutionRequest,
        _opts: &ExecuteOptions,
        cancel: &CancellationToken,
    ) -> Result<ChunkStream, ExecuteError> {
        let resp = self.post(auth, req, cancel).await?;
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

    /// api-key 凭证没有可刷新的内容：原样返回即成功。
    async fn refresh(&self, auth: StoredCredential) -> StoredCredential {
        auth
    }

    fn prepare_request(
        &self,
        auth: &StoredCredential,
        builder: reqwest::RequestBuilder,
    ) -> reqwest::RequestBuilder {
        let token = auth.api_key().unwrap_or(&auth.access_token);
        builder.header(AUTHORIZATION, format!("Bearer {token}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credential::types::CredentialStatus;
    use chrono::Utc;
    use std::collections::HashMap;

    #[test]
    fn bearer_prefers_api_key() {
        let mut auth = StoredCredential {
            id: "o1".to_string(),
            provider: "codex".to_string(),
            disabled: false,
            access_token: "acc".to_string(),
            refresh_token: String::new(),
            expires_at: None,
            token_data: HashMap::new(),
            status: CredentialStatus::Ready,
            status_message: String::new(),
            updated_at: Utc::now(),
        };

        let h = CodexExecutor::build_headers(&auth);
        assert_eq!(h.get(AUTHORIZATION).unwrap(), "Bearer acc");

        auth.token_data
            .insert("api_key".to_string(), sonic_rs::Value::from("sk-key"));
        let h = CodexExecutor::build_headers(&auth);
        assert_eq!(h.get(AUTHORIZATION).unwrap(), "Bearer sk-key");
    }
}
