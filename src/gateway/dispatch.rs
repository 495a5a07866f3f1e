//! 调度 facade：把入站 model 解析为 provider 有序的故障切换链。

use crate::error::AppError;
use crate::fallback::FallbackConfig;
use crate::pool::ChainEntry;
use crate::util::model::{canonical_model_id, infer_provider};

/// 解析入站 model：
/// 1. 命中虚拟模型（fallback 启用时）→ 按链优先级展开为多 provider 链；
/// 2. 否则按模型名前缀推断 provider，构成单项链；
/// 3. 两者都失败 → no_provider。
pub fn resolve_chain(fallback: &FallbackConfig, model: &str) -> Result<Vec<ChainEntry>, AppError> {
    let model = canonical_model_id(model);
    if model.is_empty() {
        return Err(AppError::BadRequest("请求缺少 model 字段".to_string()));
    }

    if let Some(chain) = fallback.resolve(&model) {
        return Ok(chain);
    }

    match infer_provider(&model) {
        Some(provider) => Ok(vec![ChainEntry::new(provider, model)]),
        None => Err(AppError::NoProvider(model)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn fallback_with(doc: &str) -> (FallbackConfig, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let cfg = FallbackConfig::new(dir.path().to_str().unwrap());
        tokio::fs::write(cfg.path(), doc).await.unwrap();
        cfg.load().await.unwrap();
        (cfg, dir)
    }

    #[tokio::test]
    async fn virtual_model_expands_to_chain() {
        let (fb, _dir) = fallback_with(
            r#"{
                "enabled": true,
                "virtualModels": [
                    { "id": "vm-1", "name": "team-opus", "entries": [
                        { "provider": "claude", "modelId": "claude-3-opus", "priority": 1 },
                        { "provider": "gemini", "modelId": "gemini-2.0-pro", "priority": 2 }
                    ] }
                ]
            }"#,
        )
        .await;

        let chain = resolve_chain(&fb, "team-opus").unwrap();
        assert_eq!(chain.len(), 2);
        assert_eq!(chain[0].provider, "claude");
        assert_eq!(chain[1].provider, "gemini");
    }

    #[tokio::test]
    async fn direct_model_gets_single_entry_chain() {
        let dir = tempfile::tempdir().unwrap();
        let fb = FallbackConfig::new(dir.path().to_str().unwrap());
        fb.load().await.unwrap();

        let chain = resolve_chain(&fb, "claude-3-opus").unwrap();
        assert_eq!(chain, vec![ChainEntry::new("claude", "claude-3-opus")]);

        let chain = resolve_chain(&fb, "models/gemini-2.0-pro").unwrap();
        assert_eq!(chain, vec![ChainEntry::new("gemini", "gemini-2.0-pro")]);
    }

    #[tokio::test]
    async fn unknown_model_is_no_provider() {
        let dir = tempfile::tempdir().unwrap();
        let fb = FallbackConfig::new(dir.path().to_str().unwrap());
        fb.load().await.unwrap();

        assert!(matches!(
            resolve_chain(&fb, "mystery-model"),
            Err(AppError::NoProvider(_))
        ));
        assert!(matches!(
            resolve_chain(&fb, "  "),
            Err(AppError::BadRequest(_))
        ));
    }

    #[tokio::test]
    async fn fallback_disabled_falls_back_to_prefix() {
        let (fb, _dir) = fallback_with(
            r#"{
                "enabled": false,
                "virtualModels": [
                    { "id": "vm-1", "name": "claude-3-opus", "entries": [
                        { "provider": "gemini", "modelId": "gemini-2.0-pro", "priority": 1 }
                    ] }
                ]
            }"#,
        )
        .await;

        // 配置未启用：即便名称撞上虚拟模型也按前缀路由。
        let chain = resolve_chain(&fb, "claude-3-opus").unwrap();
        assert_eq!(chain, vec![ChainEntry::new("claude", "claude-3-opus")]);
    }
}
