//! 凭证池：对每个凭证持有运行时状态，按结果施加冷却，
//! 在混合 provider 链上轮转选择，并驱动请求级重试。

use crate::credential::store::CredentialStore;
use crate::credential::types::{CredentialStatus, StoredCredential};
use crate::error::DispatchError;
use crate::executor::{ExecuteError, ExecuteOptions, ExecutionRequest, ExecutorRegistry};
use crate::pool::selector::{Candidate, SelectStrategy, Selector};
use crate::pool::types::{
    BlockReason, Eligibility, ErrorInfo, ExecutionResult, RuntimeCredential, RuntimeStatus,
    check_eligibility,
};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;

/// 游标/偏移的回绕点（防溢出）。
const OFFSET_WRAP: usize = 1 << 31;

/// 故障切换链中的一项：provider 及其对应的上游模型。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainEntry {
    pub provider: String,
    pub model: String,
}

impl ChainEntry {
    pub fn new(provider: impl AsRef<str>, model: impl Into<String>) -> Self {
        Self {
            provider: crate::util::model::normalize_provider(provider.as_ref()),
            model: model.into(),
        }
    }
}

#[derive(Debug)]
struct PoolInner {
    auths: HashMap<String, RuntimeCredential>,
    /// 按入站模型维护的 provider 轮转偏移。
    provider_offsets: HashMap<String, usize>,
    selector: Selector,
}

/// 选择结果（持锁计算，出锁执行）。
enum PickOutcome {
    Picked {
        auth: StoredCredential,
        provider: String,
        model: String,
        /// 本次使用的轮转偏移；同一请求内后续选择沿用它，保持 provider 顺序稳定。
        used_offset: usize,
    },
    /// 无可选凭证；cooldown_only 表示所有被拦候选都处于配额冷却。
    Exhausted {
        cooldown_only: bool,
        earliest: Option<DateTime<Utc>>,
    },
}

pub struct CredentialPool {
    inner: Mutex<PoolInner>,
    store: Arc<CredentialStore>,
    executors: ExecutorRegistry,
    retry_count: u32,
    max_retry_wait_ms: u64,
    /// 按凭证 id 串行化 refresh（仅在刷新期间持有）。
    refresh_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl CredentialPool {
    pub fn new(
        store: Arc<CredentialStore>,
        executors: ExecutorRegistry,
        strategy: SelectStrategy,
        retry_count: u32,
        max_retry_wait_ms: u64,
    ) -> Self {
        Self {
            inner: Mutex::new(PoolInner {
                auths: HashMap::new(),
                provider_offsets: HashMap::new(),
                selector: Selector::new(strategy),
            }),
            store,
            executors,
            retry_count,
            max_retry_wait_ms,
            refresh_locks: Mutex::new(HashMap::new()),
        }
    }

    /// 从持久化存储装载全部凭证。
    pub async fn load_from_store(&self) -> usize {
        let creds = self.store.get_all().await;
        let mut inner = self.inner.lock().await;
        inner.auths.clear();
        for c in creds {
            inner
                .auths
                .insert(c.id.clone(), RuntimeCredential::new(c));
        }
        inner.auths.len()
    }

    /// 注册新凭证：写入存储并创建全新运行时状态。
    pub async fn register(&self, cred: StoredCredential) -> anyhow::Result<()> {
        self.store.upsert(cred.clone()).await?;
        let mut inner = self.inner.lock().await;
        inner
            .auths
            .insert(cred.id.clone(), RuntimeCredential::new(cred));
        Ok(())
    }

    /// 更新凭证：替换存储记录，但保留已有的模型状态、配额与运行时状态。
    pub async fn update(&self, cred: StoredCredential) -> anyhow::Result<()> {
        self.store.upsert(cred.clone()).await?;
        let mut inner = self.inner.lock().await;
        match inner.auths.get_mut(&cred.id) {
            Some(existing) => {
                if cred.disabled {
                    existing.runtime_status = RuntimeStatus::Disabled;
                } else if existing.runtime_status == RuntimeStatus::Disabled {
                    existing.runtime_status = RuntimeStatus::Active;
                }
                existing.auth = cred;
                existing.runtime_updated_at = Utc::now();
            }
            None => {
                inner
                    .auths
                    .insert(cred.id.clone(), RuntimeCredential::new(cred));
            }
        }
        Ok(())
    }

    pub async fn remove(&self, id: &str) -> anyhow::Result<()> {
        self.store.delete(id).await?;
        self.inner.lock().await.auths.remove(id);
        Ok(())
    }

    pub async fn set_disabled(&self, id: &str, disabled: bool) -> anyhow::Result<()> {
        self.store.set_disabled(id, disabled).await?;
        let mut inner = self.inner.lock().await;
        if let Some(rc) = inner.auths.get_mut(id) {
            rc.auth.disabled = disabled;
            rc.runtime_status = if disabled {
                RuntimeStatus::Disabled
            } else {
                RuntimeStatus::Active
            };
            rc.runtime_updated_at = Utc::now();
        }
        Ok(())
    }

    /// 一次非流式请求：选凭证 → 执行 → 记录结果；失败则换凭证直至耗尽，
    /// 之后视最近冷却恢复点决定是否整轮重试。
    pub async fn execute(
        &self,
        chain: &[ChainEntry],
        base_req: &ExecutionRequest,
        opts: &ExecuteOptions,
        cancel: &CancellationToken,
    ) -> Result<Bytes, DispatchError> {
        self.run_rounds(chain, base_req, opts, cancel, false).await
    }

    /// provider 专属 token 计数（同一套选择/冷却语义）。
    pub async fn count_tokens(
        &self,
        chain: &[ChainEntry],
        base_req: &ExecutionRequest,
        opts: &ExecuteOptions,
        cancel: &CancellationToken,
    ) -> Result<Bytes, DispatchError> {
        self.run_rounds(chain, base_req, opts, cancel, true).await
    }

    async fn run_rounds(
        &self,
        chain: &[ChainEntry],
        base_req: &ExecutionRequest,
        opts: &ExecuteOptions,
        cancel: &CancellationToken,
        counting: bool,
    ) -> Result<Bytes, DispatchError> {
        let mut round = 0u32;
        loop {
            match self
                .run_attempt_loop(chain, base_req, opts, cancel, counting)
                .await
            {
                Ok(bytes) => return Ok(bytes),
                Err(DispatchError::Cancelled) => return Err(DispatchError::Cancelled),
                Err(err) => {
                    if round >= self.retry_count {
                        return Err(err);
                    }
                    let Some(wait) = self.retry_wait(chain).await else {
                        return Err(err);
                    };
                    round += 1;
                    tracing::info!(
                        model = %base_req.model,
                        wait_ms = wait.as_millis() as u64,
                        round = round,
                        "等待最近的冷却恢复点后整轮重试"
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(DispatchError::Cancelled),
                        _ = tokio::time::sleep(wait) => {}
                    }
                }
            }
        }
    }

    /// 一轮完整的尝试循环：tried 集单调增长，凭证在一轮内绝不重复执行。
    async fn run_attempt_loop(
        &self,
        chain: &[ChainEntry],
        base_req: &ExecutionRequest,
        opts: &ExecuteOptions,
        cancel: &CancellationToken,
        counting: bool,
    ) -> Result<Bytes, DispatchError> {
        let mut tried: HashSet<String> = HashSet::new();
        let mut last_err: Option<DispatchError> = None;
        let mut pinned_offset: Option<usize> = None;

        loop {
            let picked = {
                let mut inner = self.inner.lock().await;
                pick_locked(
                    &mut inner,
                    chain,
                    &base_req.model,
                    &tried,
                    pinned_offset,
                    Utc::now(),
                )
            };

            let (auth, provider, model) = match picked {
                PickOutcome::Picked {
                    auth,
                    provider,
                    model,
                    used_offset,
                } => {
                    pinned_offset = Some(used_offset);
                    (auth, provider, model)
                }
                PickOutcome::Exhausted {
                    cooldown_only,
                    earliest,
                } => {
                    if cooldown_only && let Some(reset_at) = earliest {
                        return Err(DispatchError::ModelCooldown {
                            model: base_req.model.clone(),
                            provider: single_provider(chain),
                            reset_at,
                        });
                    }
                    return Err(last_err.unwrap_or(DispatchError::NoAuthAvailable));
                }
            };

            tried.insert(auth.id.clone());

            let Some(executor) = self.executors.get(&provider) else {
                tracing::warn!(provider = %provider, "未注册的 provider，跳过该凭证");
                last_err = Some(DispatchError::status(
                    500,
                    format!("未注册的 provider: {provider}"),
                ));
                continue;
            };

            // 临期 token：执行前刷新；刷新失败按认证错误冷却并换下一个凭证。
            let auth = self.ensure_fresh(auth).await;
            if auth.status == CredentialStatus::Error && auth.is_expired(Utc::now()) {
                let message = if auth.status_message.is_empty() {
                    "token 刷新失败".to_string()
                } else {
                    auth.status_message.clone()
                };
                self.mark_result(&ExecutionResult {
                    auth_id: auth.id.clone(),
                    provider: provider.clone(),
                    model: model.clone(),
                    success: false,
                    retry_after_ms: None,
                    error: Some(ErrorInfo {
                        message: message.clone(),
                        http_status: 401,
                        retryable: false,
                    }),
                })
                .await;
                last_err = Some(DispatchError::status(401, message));
                continue;
            }

            let mut req = base_req.clone();
            req.model = model.clone();

            tracing::debug!(
                auth_id = %auth.id,
                provider = %provider,
                model = %model,
                source_format = %opts.source_format,
                "执行上游请求"
            );

            let outcome = if counting {
                executor.count_tokens(&auth, &req, opts, cancel).await
            } else {
                executor.execute(&auth, &req, opts, cancel).await
            };

            match outcome {
                Ok(bytes) => {
                    self.mark_result(&ExecutionResult {
                        auth_id: auth.id.clone(),
                        provider,
                        model,
                        success: true,
                        retry_after_ms: None,
                        error: None,
                    })
                    .await;
                    return Ok(bytes);
                }
                // 取消不记录结果。
                Err(ExecuteError::Cancelled) => return Err(DispatchError::Cancelled),
                Err(ExecuteError::Status(se)) => {
                    self.mark_result(&ExecutionResult {
                        auth_id: auth.id.clone(),
                        provider,
                        model,
                        success: false,
                        retry_after_ms: se.retry_after_ms,
                        error: Some(ErrorInfo {
                            message: se.message.clone(),
                            http_status: se.status,
                            retryable: se.retryable(),
                        }),
                    })
                    .await;
                    last_err = Some(DispatchError::Status {
                        status: se.status,
                        message: se.message,
                        retry_after_ms: se.retry_after_ms,
                    });
                }
            }
        }
    }

    /// 流式请求：结果通过 channel 逐块送出；中途失败会换凭证续流。
    ///
    /// 每次尝试恰好记录一条结果：无错误块走完记成功，否则在首个错误块记失败。
    pub fn execute_stream(
        self: Arc<Self>,
        chain: Vec<ChainEntry>,
        base_req: ExecutionRequest,
        opts: ExecuteOptions,
        cancel: CancellationToken,
    ) -> mpsc::Receiver<Result<Bytes, DispatchError>> {
        let (tx, rx) = mpsc::channel::<Result<Bytes, DispatchError>>(256);
        let pool = self;

        tokio::spawn(async move {
            let mut round = 0u32;
            loop {
                match pool
                    .stream_attempt_loop(&chain, &base_req, &opts, &cancel, &tx)
                    .await
                {
                    Ok(()) => return,
                    Err(DispatchError::Cancelled) => return,
                    Err(err) => {
                        if round >= pool.retry_count {
                            let _ = tx.send(Err(err)).await;
                            return;
                        }
                        let Some(wait) = pool.retry_wait(&chain).await else {
                            let _ = tx.send(Err(err)).await;
                            return;
                        };
                        round += 1;
                        tokio::select! {
                            _ = cancel.cancelled() => return,
                            _ = tokio::time::sleep(wait) => {}
                        }
                    }
                }
            }
        });

        rx
    }

    async fn stream_attempt_loop(
        &self,
        chain: &[ChainEntry],
        base_req: &ExecutionRequest,
        opts: &ExecuteOptions,
        cancel: &CancellationToken,
        tx: &mpsc::Sender<Result<Bytes, DispatchError>>,
    ) -> Result<(), DispatchError> {
        let mut tried: HashSet<String> = HashSet::new();
        let mut last_err: Option<DispatchError> = None;
        let mut pinned_offset: Option<usize> = None;

        loop {
            let picked = {
                let mut inner = self.inner.lock().await;
                pick_locked(
                    &mut inner,
                    chain,
                    &base_req.model,
                    &tried,
                    pinned_offset,
                    Utc::now(),
                )
            };

            let (auth, provider, model) = match picked {
                PickOutcome::Picked {
                    auth,
                    provider,
                    model,
                    used_offset,
                } => {
                    pinned_offset = Some(used_offset);
                    (auth, provider, model)
                }
                PickOutcome::Exhausted {
                    cooldown_only,
                    earliest,
                } => {
                    if cooldown_only && let Some(reset_at) = earliest {
                        return Err(DispatchError::ModelCooldown {
                            model: base_req.model.clone(),
                            provider: single_provider(chain),
                            reset_at,
                        });
                    }
                    return Err(last_err.unwrap_or(DispatchError::NoAuthAvailable));
                }
            };

            tried.insert(auth.id.clone());

            let Some(executor) = self.executors.get(&provider) else {
                last_err = Some(DispatchError::status(
                    500,
                    format!("未注册的 provider: {provider}"),
                ));
                continue;
            };

            let auth = self.ensure_fresh(auth).await;
            if auth.status == CredentialStatus::Error && auth.is_expired(Utc::now()) {
                self.mark_result(&ExecutionResult {
                    auth_id: auth.id.clone(),
                    provider: provider.clone(),
                    model: model.clone(),
                    success: false,
                    retry_after_ms: None,
                    error: Some(ErrorInfo {
                        message: "token 刷新失败".to_string(),
                        http_status: 401,
                        retryable: false,
                    }),
                })
                .await;
                last_err = Some(DispatchError::status(401, "token 刷新失败"));
                continue;
            }

            let mut req = base_req.clone();
            req.model = model.clone();

            let mut stream = match executor.execute_stream(&auth, &req, opts, cancel).await {
                Ok(s) => s,
                Err(ExecuteError::Cancelled) => return Err(DispatchError::Cancelled),
                Err(ExecuteError::Status(se)) => {
                    self.mark_result(&ExecutionResult {
                        auth_id: auth.id.clone(),
                        provider,
                        model,
                        success: false,
                        retry_after_ms: se.retry_after_ms,
                        error: Some(ErrorInfo {
                            message: se.message.clone(),
                            http_status: se.status,
                            retryable: se.retryable(),
                        }),
                    })
                    .await;
                    last_err = Some(DispatchError::Status {
                        status: se.status,
                        message: se.message,
                        retry_after_ms: se.retry_after_ms,
                    });
                    continue;
                }
            };

            // 单个 failed 标志保证每次尝试恰好记录一条结果。
            let mut failed: Option<crate::executor::StatusError> = None;
            loop {
                let item = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        // 取消：释放上游流，不记录结果。
                        return Err(DispatchError::Cancelled);
                    }
                    item = stream.next() => item,
                };

                match item {
                    None => break,
                    Some(Ok(bytes)) => {
                        if tx.send(Ok(bytes)).await.is_err() {
                            // 下游已断开，视同取消。
                            return Err(DispatchError::Cancelled);
                        }
                    }
                    Some(Err(se)) => {
                        failed = Some(se);
                        break;
                    }
                }
            }
            drop(stream);

            match failed {
                None => {
                    self.mark_result(&ExecutionResult {
                        auth_id: auth.id.clone(),
                        provider,
                        model,
                        success: true,
                        retry_after_ms: None,
                        error: None,
                    })
                    .await;
                    return Ok(());
                }
                Some(se) => {
                    self.mark_result(&ExecutionResult {
                        auth_id: auth.id.clone(),
                        provider,
                        model,
                        success: false,
                        retry_after_ms: se.retry_after_ms,
                        error: Some(ErrorInfo {
                            message: se.message.clone(),
                            http_status: se.status,
                            retryable: se.retryable(),
                        }),
                    })
                    .await;
                    last_err = Some(DispatchError::Status {
                        status: se.status,
                        message: se.message,
                        retry_after_ms: se.retry_after_ms,
                    });
                    // 换下一个凭证续流。
                }
            }
        }
    }

    /// 按结果更新运行时状态（冷却计算只在这里发生，每次失败恰好一次）。
    pub async fn mark_result(&self, result: &ExecutionResult) {
        let now = Utc::now();
        let mut inner = self.inner.lock().await;
        let Some(rc) = inner.auths.get_mut(&result.auth_id) else {
            return;
        };

        if result.success {
            rc.mark_success(&result.model, now);
            tracing::debug!(
                auth_id = %result.auth_id,
                provider = %result.provider,
                model = %result.model,
                "请求成功"
            );
        } else if let Some(err) = &result.error {
            rc.mark_failure(
                &result.model,
                err.http_status,
                result.retry_after_ms,
                &err.message,
                now,
            );
            tracing::info!(
                auth_id = %result.auth_id,
                provider = %result.provider,
                model = %result.model,
                status = err.http_status,
                retry_after_ms = result.retry_after_ms,
                "请求失败，已施加冷却"
            );
        }
    }

    /// 请求的 provider 集合中，距离最近的冷却恢复等待时长。
    /// 超过 max_retry_wait_ms 或不存在恢复点时返回 None（不重试）。
    async fn retry_wait(&self, chain: &[ChainEntry]) -> Option<Duration> {
        let now = Utc::now();
        let inner = self.inner.lock().await;

        let mut closest: Option<DateTime<Utc>> = None;
        for entry in chain {
            for rc in inner.auths.values() {
                if rc.auth.provider_key() != entry.provider || rc.is_disabled() {
                    continue;
                }
                if let Some(t) = rc.next_retry_for(&entry.model) {
                    closest = Some(match closest {
                        None => t,
                        Some(c) => c.min(t),
                    });
                }
            }
        }

        let t = closest?;
        let wait_ms = (t - now).num_milliseconds();
        if wait_ms <= 0 || wait_ms as u64 > self.max_retry_wait_ms {
            return None;
        }
        Some(Duration::from_millis(wait_ms as u64))
    }

    /// 临期刷新：按 id 串行化，刷新结果写回存储与运行时状态。
    async fn ensure_fresh(&self, auth: StoredCredential) -> StoredCredential {
        if !auth.is_expired(Utc::now()) {
            return auth;
        }

        let lock = {
            let mut locks = self.refresh_locks.lock().await;
            locks
                .entry(auth.id.clone())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        let _guard = lock.lock().await;

        // 拿到锁后重读：并发请求可能已完成刷新。
        let current = {
            let inner = self.inner.lock().await;
            inner.auths.get(&auth.id).map(|rc| rc.auth.clone())
        };
        let current = current.unwrap_or(auth);
        if !current.is_expired(Utc::now()) {
            return current;
        }

        let Some(executor) = self.executors.get(&current.provider_key()) else {
            return current;
        };

        let refreshed = executor.refresh(current).await;

        {
            let mut inner = self.inner.lock().await;
            if let Some(rc) = inner.auths.get_mut(&refreshed.id) {
                rc.auth = refreshed.clone();
                rc.last_refreshed_at = Some(Utc::now());
            }
        }
        if refreshed.status != CredentialStatus::Error
            && let Err(e) = self.store.save_tokens(&refreshed).await
        {
            tracing::warn!(auth_id = %refreshed.id, error = ?e, "刷新后的 token 写回失败");
        }

        refreshed
    }

    #[cfg(test)]
    pub async fn snapshot(&self, id: &str) -> Option<RuntimeCredential> {
        self.inner.lock().await.auths.get(id).cloned()
    }
}

/// 故障链只有一个 provider 时在冷却错误中带上它。
fn single_provider(chain: &[ChainEntry]) -> Option<String> {
    let mut providers: Vec<&str> = chain.iter().map(|e| e.provider.as_str()).collect();
    providers.dedup();
    if providers.len() == 1 {
        Some(providers[0].to_string())
    } else {
        None
    }
}

/// 持锁的选择过程：provider 轮转 + 可用性过滤 + 策略选择。
///
/// 被禁用的凭证不计入候选；cooldown_only 仅统计剩余候选的拦截原因。
/// `pinned_offset` 为同一请求内上次选择用过的偏移：请求内 provider 顺序保持稳定，
/// 偏移只在请求的首次选中时推进一次。
fn pick_locked(
    inner: &mut PoolInner,
    chain: &[ChainEntry],
    model_key: &str,
    tried: &HashSet<String>,
    pinned_offset: Option<usize>,
    now: DateTime<Utc>,
) -> PickOutcome {
    // 去重（保序）：同一 provider 以链上第一项的模型为准。
    let mut entries: Vec<&ChainEntry> = Vec::new();
    for e in chain {
        if e.provider.is_empty() {
            continue;
        }
        if !entries.iter().any(|x| x.provider == e.provider) {
            entries.push(e);
        }
    }

    if entries.is_empty() {
        return PickOutcome::Exhausted {
            cooldown_only: false,
            earliest: None,
        };
    }

    let raw_offset = pinned_offset
        .unwrap_or_else(|| *inner.provider_offsets.get(model_key).unwrap_or(&0));
    let offset = raw_offset % entries.len();

    let mut cooldown_blocks = 0usize;
    let mut other_blocks = 0usize;
    let mut earliest: Option<DateTime<Utc>> = None;

    for i in 0..entries.len() {
        let entry = entries[(offset + i) % entries.len()];

        let mut candidates: Vec<Candidate> = Vec::new();
        for rc in inner.auths.values() {
            if rc.auth.provider_key() != entry.provider {
                continue;
            }
            if tried.contains(&rc.auth.id) {
                continue;
            }
            if rc.is_disabled() {
                continue;
            }
            match check_eligibility(rc, &entry.model, now) {
                Eligibility::Eligible => candidates.push(Candidate {
                    id: rc.auth.id.clone(),
                    priority: rc.auth.priority(),
                }),
                Eligibility::Blocked { reason, next_retry } => {
                    match reason {
                        BlockReason::Cooldown => {
                            cooldown_blocks += 1;
                            if let Some(t) = next_retry {
                                earliest = Some(match earliest {
                                    None => t,
                                    Some(c) => c.min(t),
                                });
                            }
                        }
                        // Disabled 在上面已被过滤；这里只剩非配额原因。
                        _ => other_blocks += 1,
                    }
                }
            }
        }

        if candidates.is_empty() {
            continue;
        }

        if let Some(id) = inner
            .selector
            .pick(&entry.provider, &entry.model, &candidates)
        {
            // 请求的首次选中推进轮转偏移，让首选 provider 随时间轮换。
            if pinned_offset.is_none() {
                inner
                    .provider_offsets
                    .insert(model_key.to_string(), (raw_offset + 1) % OFFSET_WRAP);
            }

            let Some(auth) = inner.auths.get(&id).map(|rc| rc.auth.clone()) else {
                continue;
            };
            return PickOutcome::Picked {
                auth,
                provider: entry.provider.clone(),
                model: entry.model.clone(),
                used_offset: raw_offset,
            };
        }
    }

    PickOutcome::Exhausted {
        cooldown_only: cooldown_blocks > 0 && other_blocks == 0,
        earliest,
    }
}
