//! 故障切换配置：虚拟模型 → (provider, modelId, priority) 链。
//!
//! 配置文件可被外部 UI 随时编辑；通过文件监听 + 去抖动热加载，
//! 重载时整体替换快照，绝不部分合并。

use crate::pool::ChainEntry;
use anyhow::Context;
use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// 文件变更后的去抖动窗口。
const RELOAD_DEBOUNCE: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct FallbackSettings {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub virtual_models: Vec<VirtualModel>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VirtualModel {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub entries: Vec<FallbackEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FallbackEntry {
    pub provider: String,
    pub model_id: String,
    /// 链上优先级：数字越小越靠前（与选择器的 tokenData.priority 语义相反）。
    #[serde(default)]
    pub priority: i32,
}

/// 当前生效的故障切换配置（无锁读取快照）。
pub struct FallbackConfig {
    path: PathBuf,
    current: ArcSwap<FallbackSettings>,
}

impl FallbackConfig {
    pub fn new(data_dir: &str) -> Self {
        Self {
            path: PathBuf::from(data_dir).join("fallback.json"),
            current: ArcSwap::from_pointee(FallbackSettings::default()),
        }
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    /// 从磁盘重新加载；文件缺失视为"未启用"。成功后整体替换快照。
    pub async fn load(&self) -> anyhow::Result<()> {
        let data = match tokio::fs::read(&self.path).await {
            Ok(v) => v,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                self.current.store(Arc::new(FallbackSettings::default()));
                return Ok(());
            }
            Err(e) => return Err(e).context("读取 fallback.json 失败"),
        };

        let settings: FallbackSettings =
            sonic_rs::from_slice(&data).context("解析 fallback.json 失败")?;
        self.current.store(Arc::new(settings));
        Ok(())
    }

    pub fn snapshot(&self) -> Arc<FallbackSettings> {
        self.current.load_full()
    }

    /// 将虚拟模型名解析为按链优先级升序排列的 (provider, modelId) 链。
    /// 未启用或名称不匹配时返回 None。
    pub fn resolve(&self, model: &str) -> Option<Vec<ChainEntry>> {
        let settings = self.snapshot();
        if !settings.enabled {
            return None;
        }

        let model = model.trim();
        let vm = settings
            .virtual_models
            .iter()
            .find(|vm| vm.name.trim() == model || vm.id.trim() == model)?;

        let mut entries = vm.entries.clone();
        entries.sort_by_key(|e| e.priority);

        let chain: Vec<ChainEntry> = entries
            .iter()
            .filter(|e| !e.provider.trim().is_empty() && !e.model_id.trim().is_empty())
            .map(|e| ChainEntry::new(&e.provider, e.model_id.clone()))
            .collect();

        if chain.is_empty() { None } else { Some(chain) }
    }
}

/// 启动配置文件监听：变更后去抖动 200ms 再整体重载。
///
/// 返回的 watcher 需由调用方持有（drop 即停止监听）。
pub fn spawn_watcher(config: Arc<FallbackConfig>) -> anyhow::Result<notify::RecommendedWatcher> {
    use notify::{RecursiveMode, Watcher};

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<()>();

    let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
        if res.is_ok() {
            let _ = tx.send(());
        }
    })
    .context("创建文件监听失败")?;

    // 监听父目录：外部工具常用 temp-then-rename 覆盖写，直接监听文件会丢事件。
    let watch_dir = config
        .path()
        .parent()
        .map(|p| p.to_path_buf())
        .unwrap_or_else(|| PathBuf::from("."));
    std::fs::create_dir_all(&watch_dir).context("创建数据目录失败")?;
    watcher
        .watch(&watch_dir, RecursiveMode::NonRecursive)
        .context("监听数据目录失败")?;

    tokio::spawn(async move {
        while rx.recv().await.is_some() {
            // 去抖动：吞掉窗口内的后续事件，整窗只重载一次。
            tokio::time::sleep(RELOAD_DEBOUNCE).await;
            while rx.try_recv().is_ok() {}

            match config.load().await {
                Ok(()) => {
                    let s = config.snapshot();
                    tracing::info!(
                        enabled = s.enabled,
                        virtual_models = s.virtual_models.len(),
                        "fallback 配置已重载"
                    );
                }
                Err(e) => tracing::warn!(error = ?e, "fallback 配置重载失败，沿用旧快照"),
            }
        }
    });

    Ok(watcher)
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOC: &str = r#"{
        "enabled": true,
        "virtualModels": [
            {
                "id": "vm-1",
                "name": "team-opus",
                "entries": [
                    { "provider": "gemini", "modelId": "gemini-2.0-pro", "priority": 2 },
                    { "provider": "Claude", "modelId": "claude-3-opus", "priority": 1 }
                ]
            }
        ]
    }"#;

    async fn config_with(doc: &str) -> (FallbackConfig, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let cfg = FallbackConfig::new(dir.path().to_str().unwrap());
        tokio::fs::write(cfg.path(), doc).await.unwrap();
        cfg.load().await.unwrap();
        (cfg, dir)
    }

    #[tokio::test]
    async fn resolves_chain_sorted_by_priority_ascending() {
        let (cfg, _dir) = config_with(DOC).await;

        let chain = cfg.resolve("team-opus").unwrap();
        assert_eq!(chain.len(), 2);
        // 链上 priority 越小越靠前；provider 标签被规范化为小写。
        assert_eq!(chain[0], ChainEntry::new("claude", "claude-3-opus"));
        assert_eq!(chain[1], ChainEntry::new("gemini", "gemini-2.0-pro"));
    }

    #[tokio::test]
    async fn disabled_config_resolves_nothing() {
        let doc = DOC.replace("\"enabled\": true", "\"enabled\": false");
        let (cfg, _dir) = config_with(&doc).await;
        assert!(cfg.resolve("team-opus").is_none());
    }

    #[tokio::test]
    async fn unknown_model_resolves_nothing() {
        let (cfg, _dir) = config_with(DOC).await;
        assert!(cfg.resolve("other-model").is_none());
    }

    #[tokio::test]
    async fn missing_file_means_disabled() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = FallbackConfig::new(dir.path().to_str().unwrap());
        cfg.load().await.unwrap();
        assert!(!cfg.snapshot().enabled);
    }

    #[tokio::test]
    async fn reload_swaps_whole_snapshot() {
        let (cfg, _dir) = config_with(DOC).await;
        assert!(cfg.resolve("team-opus").is_some());

        let replaced = r#"{
            "enabled": true,
            "virtualModels": [
                { "id": "vm-2", "name": "team-flash", "entries": [
                    { "provider": "gemini", "modelId": "gemini-2.0-flash", "priority": 1 }
                ] }
            ]
        }"#;
        tokio::fs::write(cfg.path(), replaced).await.unwrap();
        cfg.load().await.unwrap();

        // 整体替换：旧虚拟模型不残留。
        assert!(cfg.resolve("team-opus").is_none());
        assert!(cfg.resolve("team-flash").is_some());
    }

    #[tokio::test]
    async fn broken_reload_keeps_old_snapshot() {
        let (cfg, _dir) = config_with(DOC).await;
        tokio::fs::write(cfg.path(), b"{ not json").await.unwrap();
        assert!(cfg.load().await.is_err());
        assert!(cfg.resolve("team-opus").is_some());
    }
}
