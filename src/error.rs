use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

/// HTTP 入口层错误。
#[derive(Debug, Error)]
pub enum AppError {
    #[error("未授权: {0}")]
    Unauthorized(String),

    #[error("参数错误: {0}")]
    BadRequest(String),

    /// 模型无法解析到任何 provider。
    #[error("没有可用的 provider: {0}")]
    NoProvider(String),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// 调度核心错误（由凭证池与 facade 产生）。
#[derive(Debug, Clone, Error)]
pub enum DispatchError {
    /// 上游返回非 2xx；408/429/5xx 视为可重试。
    #[error("上游返回 {status}: {message}")]
    Status {
        status: u16,
        message: String,
        retry_after_ms: Option<u64>,
    },

    /// 所有候选凭证均处于配额冷却中。
    #[error("模型 {model} 的所有凭证均在冷却中，请稍后再试")]
    ModelCooldown {
        model: String,
        provider: Option<String>,
        reset_at: DateTime<Utc>,
    },

    /// 尝试循环耗尽且无上游错误可供透出。
    #[error("没有可用的凭证")]
    NoAuthAvailable,

    /// 请求在执行或等待期间被取消。
    #[error("请求已取消")]
    Cancelled,
}

impl DispatchError {
    pub fn status(status: u16, message: impl Into<String>) -> Self {
        Self::Status {
            status,
            message: message.into(),
            retry_after_ms: None,
        }
    }

    pub fn http_status(&self) -> u16 {
        match self {
            Self::Status { status, .. } => *status,
            Self::ModelCooldown { .. } => 429,
            Self::NoAuthAvailable => 500,
            Self::Cancelled => 500,
        }
    }

    /// 是否值得换凭证/换链路重试。
    pub fn retryable(&self) -> bool {
        match self {
            Self::Status { status, .. } => matches!(status, 408 | 429 | 500..=599),
            Self::ModelCooldown { .. } => true,
            Self::NoAuthAvailable | Self::Cancelled => false,
        }
    }

    /// 距离冷却恢复的剩余秒数（向上取整，最小 0）。
    pub fn reset_seconds(&self) -> i64 {
        match self {
            Self::ModelCooldown { reset_at, .. } => {
                let ms = (*reset_at - Utc::now()).num_milliseconds();
                if ms <= 0 { 0 } else { (ms + 999) / 1000 }
            }
            _ => 0,
        }
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: ErrorBodyInner,
}

#[derive(Debug, Serialize)]
struct ErrorBodyInner {
    #[serde(skip_serializing_if = "Option::is_none")]
    code: Option<String>,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    r#type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    provider: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    reset_time: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    reset_seconds: Option<i64>,
}

impl ErrorBodyInner {
    fn plain(message: String, ty: &str) -> Self {
        Self {
            code: None,
            message,
            r#type: Some(ty.to_string()),
            model: None,
            provider: None,
            reset_time: None,
            reset_seconds: None,
        }
    }
}

impl IntoResponse for DispatchError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

        let inner = match &self {
            DispatchError::ModelCooldown {
                model,
                provider,
                reset_at,
            } => ErrorBodyInner {
                code: Some("model_cooldown".to_string()),
                message: self.to_string(),
                r#type: Some("rate_limit_error".to_string()),
                model: Some(model.clone()),
                provider: provider.clone(),
                reset_time: Some(reset_at.to_rfc3339()),
                reset_seconds: Some(self.reset_seconds()),
            },
            _ => ErrorBodyInner::plain(self.to_string(), "server_error"),
        };

        (status, Json(ErrorBody { error: inner })).into_response()
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match self {
            AppError::Dispatch(e) => e.into_response(),
            AppError::Unauthorized(_) => (
                StatusCode::UNAUTHORIZED,
                Json(ErrorBody {
                    error: ErrorBodyInner::plain(self.to_string(), "unauthorized"),
                }),
            )
                .into_response(),
            AppError::BadRequest(_) => (
                StatusCode::BAD_REQUEST,
                Json(ErrorBody {
                    error: ErrorBodyInner::plain(self.to_string(), "bad_request"),
                }),
            )
                .into_response(),
            AppError::NoProvider(_) => (
                StatusCode::BAD_REQUEST,
                Json(ErrorBody {
                    error: ErrorBodyInner::plain(self.to_string(), "no_provider"),
                }),
            )
                .into_response(),
            AppError::Anyhow(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorBody {
                    error: ErrorBodyInner::plain(self.to_string(), "internal"),
                }),
            )
                .into_response(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn retryable_statuses() {
        assert!(DispatchError::status(429, "x").retryable());
        assert!(DispatchError::status(408, "x").retryable());
        assert!(DispatchError::status(503, "x").retryable());
        assert!(!DispatchError::status(400, "x").retryable());
        assert!(!DispatchError::status(404, "x").retryable());
        assert!(!DispatchError::NoAuthAvailable.retryable());
    }

    #[test]
    fn reset_seconds_rounds_up() {
        let err = DispatchError::ModelCooldown {
            model: "m".to_string(),
            provider: None,
            reset_at: Utc::now() + Duration::milliseconds(1_500),
        };
        assert_eq!(err.reset_seconds(), 2);

        let past = DispatchError::ModelCooldown {
            model: "m".to_string(),
            provider: None,
            reset_at: Utc::now() - Duration::seconds(5),
        };
        assert_eq!(past.reset_seconds(), 0);
    }

    #[test]
    fn cooldown_http_status_is_429() {
        let err = DispatchError::ModelCooldown {
            model: "m".to_string(),
            provider: Some("claude".to_string()),
            reset_at: Utc::now(),
        };
        assert_eq!(err.http_status(), 429);
    }
}
