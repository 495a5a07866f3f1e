use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sonic_rs::JsonValueTrait;
use std::collections::HashMap;

/// 持久化的凭证状态。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CredentialStatus {
    #[default]
    Ready,
    Error,
    Pending,
    Disabled,
}

/// 一个 provider 下单个账号的持久化身份。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredCredential {
    pub id: String,
    pub provider: String,
    #[serde(default)]
    pub disabled: bool,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub access_token: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub refresh_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,

    /// provider 自定义字段：api_key、base_url、priority 及其它不透明值。
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub token_data: HashMap<String, sonic_rs::Value>,

    #[serde(default)]
    pub status: CredentialStatus,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub status_message: String,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

impl StoredCredential {
    /// 规范化后的 provider 标签（所有比较都基于该形式）。
    pub fn provider_key(&self) -> String {
        crate::util::model::normalize_provider(&self.provider)
    }

    pub fn api_key(&self) -> Option<&str> {
        self.token_data
            .get("api_key")
            .and_then(|v| v.as_str())
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }

    pub fn base_url(&self) -> Option<&str> {
        self.token_data
            .get("base_url")
            .and_then(|v| v.as_str())
            .map(|s| s.trim().trim_end_matches('/'))
            .filter(|s| !s.is_empty())
    }

    /// 选择优先级：数字越大越优先；缺省为 0；容忍字符串形式的数字。
    pub fn priority(&self) -> i64 {
        let Some(v) = self.token_data.get("priority") else {
            return 0;
        };
        if let Some(n) = v.as_i64() {
            return n;
        }
        if let Some(f) = v.as_f64() {
            return f as i64;
        }
        if let Some(s) = v.as_str() {
            return s.trim().parse().unwrap_or(0);
        }
        0
    }

    /// token 是否已过期（提前 5 分钟视为过期，避免请求中途失效）。
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        match self.expires_at {
            Some(exp) => now >= exp - chrono::Duration::minutes(5),
            None => false,
        }
    }

    /// 是否具备可用于刷新的信息。
    pub fn can_refresh(&self) -> bool {
        !self.refresh_token.trim().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cred() -> StoredCredential {
        StoredCredential {
            id: "c1".to_string(),
            provider: "Claude".to_string(),
            disabled: false,
            access_token: "tok".to_string(),
            refresh_token: String::new(),
            expires_at: None,
            token_data: HashMap::new(),
            status: CredentialStatus::Ready,
            status_message: String::new(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn provider_key_is_lowercase_trimmed() {
        let mut c = cred();
        c.provider = "  Claude ".to_string();
        assert_eq!(c.provider_key(), "claude");
    }

    #[test]
    fn priority_parses_number_and_string() {
        let mut c = cred();
        assert_eq!(c.priority(), 0);

        c.token_data
            .insert("priority".to_string(), sonic_rs::Value::from(3));
        assert_eq!(c.priority(), 3);

        c.token_data
            .insert("priority".to_string(), sonic_rs::Value::from(" 7 "));
        assert_eq!(c.priority(), 7);

        c.token_data
            .insert("priority".to_string(), sonic_rs::Value::from("abc"));
        assert_eq!(c.priority(), 0);
    }

    #[test]
    fn expiry_uses_five_minute_margin() {
        let now = Utc::now();
        let mut c = cred();

        c.expires_at = Some(now + chrono::Duration::minutes(10));
        assert!(!c.is_expired(now));

        c.expires_at = Some(now + chrono::Duration::minutes(3));
        assert!(c.is_expired(now));

        c.expires_at = None;
        assert!(!c.is_expired(now));
    }

    #[test]
    fn base_url_trims_trailing_slash() {
        let mut c = cred();
        c.token_data.insert(
            "base_url".to_string(),
            sonic_rs::Value::from("https://example.com/"),
        );
        assert_eq!(c.base_url(), Some("https://example.com"));
    }
}
