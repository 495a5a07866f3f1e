use crate::credential::types::StoredCredential;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;

/// 配额指数退避的基数与上限。
const QUOTA_BACKOFF_BASE_MS: i64 = 1_000;
const QUOTA_BACKOFF_CAP_MS: i64 = 30 * 60 * 1_000;

/// 认证类错误（401/402/403）的冷却时长（分钟）。
const AUTH_FAILURE_COOLDOWN_MINS: i64 = 30;
/// 404（模型不存在）的冷却时长（小时）。
const NOT_FOUND_COOLDOWN_HOURS: i64 = 12;
/// 服务端瞬时错误（408/5xx）的冷却时长（秒）。
const SERVER_ERROR_COOLDOWN_SECS: i64 = 60;

/// 运行时状态。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RuntimeStatus {
    #[default]
    Active,
    Error,
    Disabled,
    Pending,
}

/// 配额（限流）跟踪状态。
///
/// exceeded=true 且 next_recover_at 缺失时，下一轮选择即视为可重试。
#[derive(Debug, Clone, Default)]
pub struct QuotaState {
    pub exceeded: bool,
    pub reason: String,
    pub next_recover_at: Option<DateTime<Utc>>,
    pub backoff_level: u32,
}

/// 一个凭证针对单个模型的状态（首次失败时惰性创建）。
#[derive(Debug, Clone)]
pub struct ModelState {
    pub status: RuntimeStatus,
    pub status_message: String,
    pub unavailable: bool,
    pub next_retry_after: Option<DateTime<Utc>>,
    pub last_error: String,
    pub quota: QuotaState,
    pub updated_at: DateTime<Utc>,
}

impl Default for ModelState {
    fn default() -> Self {
        Self {
            status: RuntimeStatus::Active,
            status_message: String::new(),
            unavailable: false,
            next_retry_after: None,
            last_error: String::new(),
            quota: QuotaState::default(),
            updated_at: Utc::now(),
        }
    }
}

/// 持久化凭证 + 运行时状态的组合；存活于池的整个生命周期。
#[derive(Debug, Clone)]
pub struct RuntimeCredential {
    pub auth: StoredCredential,
    pub runtime_status: RuntimeStatus,
    pub status_message: String,
    pub unavailable: bool,
    pub next_retry_after: Option<DateTime<Utc>>,
    pub last_error: String,
    pub quota: QuotaState,
    pub model_states: HashMap<String, ModelState>,
    pub loaded_at: DateTime<Utc>,
    pub runtime_updated_at: DateTime<Utc>,
    pub last_refreshed_at: Option<DateTime<Utc>>,
}

impl RuntimeCredential {
    pub fn new(auth: StoredCredential) -> Self {
        let now = Utc::now();
        let runtime_status = if auth.disabled {
            RuntimeStatus::Disabled
        } else {
            RuntimeStatus::Active
        };
        Self {
            auth,
            runtime_status,
            status_message: String::new(),
            unavailable: false,
            next_retry_after: None,
            last_error: String::new(),
            quota: QuotaState::default(),
            model_states: HashMap::new(),
            loaded_at: now,
            runtime_updated_at: now,
            last_refreshed_at: None,
        }
    }

    pub fn is_disabled(&self) -> bool {
        self.auth.disabled || self.runtime_status == RuntimeStatus::Disabled
    }

    /// 成功结果：清除模型级与凭证级的不可用状态，退避归零。
    pub fn mark_success(&mut self, model: &str, now: DateTime<Utc>) {
        if !model.is_empty()
            && let Some(ms) = self.model_states.get_mut(model)
        {
            ms.unavailable = false;
            ms.status = RuntimeStatus::Active;
            ms.status_message.clear();
            ms.last_error.clear();
            ms.next_retry_after = None;
            ms.quota = QuotaState::default();
            ms.updated_at = now;
        }

        self.unavailable = false;
        self.runtime_status = RuntimeStatus::Active;
        self.status_message.clear();
        self.last_error.clear();
        self.next_retry_after = None;
        self.quota = QuotaState::default();
        self.runtime_updated_at = now;
    }

    /// 失败结果：惰性创建 ModelState，按状态码施加冷却。
    pub fn mark_failure(
        &mut self,
        model: &str,
        http_status: u16,
        retry_after_ms: Option<u64>,
        message: &str,
        now: DateTime<Utc>,
    ) {
        let next_retry = match http_status {
            429 => {
                self.quota.exceeded = true;
                self.quota.reason = "quota".to_string();
                match retry_after_ms {
                    // 上游给出 retry-after：照办，不做指数退避。
                    Some(ms) => {
                        self.quota.next_recover_at = Some(now + Duration::milliseconds(ms as i64));
                    }
                    None => {
                        let cooldown = quota_backoff(self.quota.backoff_level);
                        // 未到 30 分钟上限才继续升级；到顶后级别固定。
                        if cooldown < Duration::milliseconds(QUOTA_BACKOFF_CAP_MS) {
                            self.quota.backoff_level += 1;
                        }
                        self.quota.next_recover_at = Some(now + cooldown);
                    }
                }
                self.quota.next_recover_at
            }
            401 | 402 | 403 => Some(now + Duration::minutes(AUTH_FAILURE_COOLDOWN_MINS)),
            404 => Some(now + Duration::hours(NOT_FOUND_COOLDOWN_HOURS)),
            408 | 500 | 502 | 503 | 504 => Some(now + Duration::seconds(SERVER_ERROR_COOLDOWN_SECS)),
            _ => None,
        };

        if model.is_empty() {
            // 无模型维度的失败：冷却施加在凭证级。
            self.unavailable = true;
            self.next_retry_after = next_retry;
        } else {
            let ms = self.model_states.entry(model.to_string()).or_default();
            ms.unavailable = true;
            ms.status = RuntimeStatus::Error;
            ms.status_message = message.to_string();
            ms.last_error = message.to_string();
            ms.next_retry_after = next_retry;
            ms.updated_at = now;
            if http_status == 429 {
                ms.quota.exceeded = true;
                ms.quota.reason = "quota".to_string();
                ms.quota.next_recover_at = self.quota.next_recover_at;
                ms.quota.backoff_level = self.quota.backoff_level;
            }
        }

        self.runtime_status = RuntimeStatus::Error;
        self.status_message = message.to_string();
        self.last_error = message.to_string();
        self.runtime_updated_at = now;
    }

    /// 该凭证对指定模型的下一个恢复时间点（用于轮间等待的估算）。
    pub fn next_retry_for(&self, model: &str) -> Option<DateTime<Utc>> {
        if let Some(ms) = self.model_states.get(model) {
            if ms.unavailable {
                return ms.next_retry_after.max(ms.quota.next_recover_at);
            }
            return None;
        }
        if self.unavailable {
            return self.next_retry_after.max(self.quota.next_recover_at);
        }
        None
    }
}

/// 配额冷却：`min(1s · 2^level, 30min)`。
pub fn quota_backoff(level: u32) -> Duration {
    // 2^11 秒已超过 30 分钟上限，无需继续左移。
    let level = level.min(11);
    Duration::milliseconds((QUOTA_BACKOFF_BASE_MS << level).min(QUOTA_BACKOFF_CAP_MS))
}

/// 候选被拦下的原因。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockReason {
    Disabled,
    Cooldown,
    Other,
}

/// 候选可用性判定结果。
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Eligibility {
    Eligible,
    Blocked {
        reason: BlockReason,
        next_retry: Option<DateTime<Utc>>,
    },
}

impl Eligibility {
    pub fn is_eligible(&self) -> bool {
        matches!(self, Self::Eligible)
    }
}

/// 所有选择器共用的可用性过滤。
pub fn check_eligibility(
    cred: &RuntimeCredential,
    model: &str,
    now: DateTime<Utc>,
) -> Eligibility {
    if cred.is_disabled() {
        return Eligibility::Blocked {
            reason: BlockReason::Disabled,
            next_retry: None,
        };
    }

    if let Some(ms) = cred.model_states.get(model) {
        if ms.status == RuntimeStatus::Disabled {
            return Eligibility::Blocked {
                reason: BlockReason::Disabled,
                next_retry: None,
            };
        }
        if ms.unavailable {
            let Some(t) = ms.next_retry_after else {
                // 无恢复时间点：下一轮即可重试。
                return Eligibility::Eligible;
            };
            if t > now {
                let next = [Some(t), ms.quota.next_recover_at, Some(now)]
                    .into_iter()
                    .flatten()
                    .max();
                let reason = if ms.quota.exceeded {
                    BlockReason::Cooldown
                } else {
                    BlockReason::Other
                };
                return Eligibility::Blocked {
                    reason,
                    next_retry: next,
                };
            }
        }
        return Eligibility::Eligible;
    }

    if cred.unavailable
        && let Some(t) = cred.next_retry_after
        && t > now
    {
        let next = [Some(t), cred.quota.next_recover_at, Some(now)]
            .into_iter()
            .flatten()
            .max();
        let reason = if cred.quota.exceeded {
            BlockReason::Cooldown
        } else {
            BlockReason::Other
        };
        return Eligibility::Blocked {
            reason,
            next_retry: next,
        };
    }

    Eligibility::Eligible
}

/// 错误摘要（随 ExecutionResult 发布）。
#[derive(Debug, Clone)]
pub struct ErrorInfo {
    pub message: String,
    pub http_status: u16,
    pub retryable: bool,
}

/// 每次尝试结束后发布的结果记录。
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub auth_id: String,
    pub provider: String,
    pub model: String,
    pub success: bool,
    pub retry_after_ms: Option<u64>,
    pub error: Option<ErrorInfo>,
}
