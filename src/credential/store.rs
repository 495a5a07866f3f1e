use crate::credential::types::StoredCredential;
use anyhow::{Context, anyhow};
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;

/// 凭证存储：`{DATA_DIR}/credentials.json`。
///
/// 启动时读取，变更时整体写回；写入采用 temp-then-rename，避免
/// 外部进程观察到半写状态。
#[derive(Debug)]
pub struct CredentialStore {
    file_path: PathBuf,
    state: RwLock<Vec<StoredCredential>>,
}

impl CredentialStore {
    pub fn new(data_dir: &str) -> Self {
        let file_path = PathBuf::from(data_dir).join("credentials.json");
        Self {
            file_path,
            state: RwLock::new(Vec::new()),
        }
    }

    pub async fn load(&self) -> anyhow::Result<()> {
        ensure_parent_dir(&self.file_path).await?;

        let data = match tokio::fs::read(&self.file_path).await {
            Ok(v) => v,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                self.state.write().await.clear();
                return Ok(());
            }
            Err(e) => return Err(e).context("读取 credentials.json 失败"),
        };

        let creds: Vec<StoredCredential> = match sonic_rs::from_slice(&data) {
            Ok(v) => v,
            Err(e) => {
                self.state.write().await.clear();
                return Err(anyhow!(e)).context("解析 credentials.json 失败");
            }
        };

        for c in &creds {
            if c.id.trim().is_empty() {
                return Err(anyhow!("credentials.json 中存在空 id 的凭证"));
            }
        }

        *self.state.write().await = creds;
        Ok(())
    }

    pub async fn get_all(&self) -> Vec<StoredCredential> {
        self.state.read().await.clone()
    }

    pub async fn get(&self, id: &str) -> Option<StoredCredential> {
        let id = id.trim();
        self.state
            .read()
            .await
            .iter()
            .find(|c| c.id == id)
            .cloned()
    }

    /// 新增或整体替换一条凭证记录，并持久化。
    pub async fn upsert(&self, cred: StoredCredential) -> anyhow::Result<()> {
        let snapshot = {
            let mut state = self.state.write().await;
            match state.iter_mut().find(|c| c.id == cred.id) {
                Some(existing) => *existing = cred,
                None => state.push(cred),
            }
            state.clone()
        };
        self.save_snapshot(&snapshot).await
    }

    pub async fn delete(&self, id: &str) -> anyhow::Result<()> {
        let snapshot = {
            let mut state = self.state.write().await;
            let before = state.len();
            state.retain(|c| c.id != id);
            if state.len() == before {
                return Err(anyhow!("未找到指定的凭证"));
            }
            state.clone()
        };
        self.save_snapshot(&snapshot).await
    }

    pub async fn set_disabled(&self, id: &str, disabled: bool) -> anyhow::Result<()> {
        let snapshot = {
            let mut state = self.state.write().await;
            let Some(c) = state.iter_mut().find(|c| c.id == id) else {
                return Err(anyhow!("未找到指定的凭证"));
            };
            c.disabled = disabled;
            c.updated_at = chrono::Utc::now();
            state.clone()
        };
        self.save_snapshot(&snapshot).await
    }

    /// 刷新成功后写回 token 字段（只更新 token 相关字段，保留其余持久化内容）。
    pub async fn save_tokens(&self, refreshed: &StoredCredential) -> anyhow::Result<()> {
        let snapshot = {
            let mut state = self.state.write().await;
            let Some(c) = state.iter_mut().find(|c| c.id == refreshed.id) else {
                return Err(anyhow!("未找到指定的凭证"));
            };
            c.access_token = refreshed.access_token.clone();
            c.refresh_token = refreshed.refresh_token.clone();
            c.expires_at = refreshed.expires_at;
            c.status = refreshed.status;
            c.status_message = refreshed.status_message.clone();
            c.updated_at = chrono::Utc::now();
            state.clone()
        };
        self.save_snapshot(&snapshot).await
    }

    async fn save_snapshot(&self, creds: &[StoredCredential]) -> anyhow::Result<()> {
        ensure_parent_dir(&self.file_path).await?;
        let data = sonic_rs::to_vec_pretty(creds).context("序列化 credentials.json 失败")?;

        // temp-then-rename：同目录下写临时文件再原子替换。
        let tmp_path = self.file_path.with_extension("json.tmp");
        tokio::fs::write(&tmp_path, data)
            .await
            .context("写入临时凭证文件失败")?;
        tokio::fs::rename(&tmp_path, &self.file_path)
            .await
            .context("替换 credentials.json 失败")
    }
}

async fn ensure_parent_dir(path: &Path) -> anyhow::Result<()> {
    let Some(dir) = path.parent() else {
        return Ok(());
    };
    tokio::fs::create_dir_all(dir)
        .await
        .context("创建数据目录失败")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credential::types::CredentialStatus;
    use chrono::Utc;
    use std::collections::HashMap;

    fn cred(id: &str) -> StoredCredential {
        StoredCredential {
            id: id.to_string(),
            provider: "claude".to_string(),
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

    #[tokio::test]
    async fn missing_file_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = CredentialStore::new(dir.path().to_str().unwrap());
        store.load().await.unwrap();
        assert!(store.get_all().await.is_empty());
    }

    #[tokio::test]
    async fn upsert_then_reload_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = CredentialStore::new(dir.path().to_str().unwrap());
        store.load().await.unwrap();

        store.upsert(cred("a")).await.unwrap();
        store.upsert(cred("b")).await.unwrap();

        let reloaded = CredentialStore::new(dir.path().to_str().unwrap());
        reloaded.load().await.unwrap();
        let all = reloaded.get_all().await;
        assert_eq!(all.len(), 2);
        assert!(all.iter().any(|c| c.id == "a"));

        // 写入后目录里不应残留临时文件。
        let leftover = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .any(|e| e.file_name().to_string_lossy().ends_with(".tmp"));
        assert!(!leftover);
    }

    #[tokio::test]
    async fn upsert_replaces_same_id() {
        let dir = tempfile::tempdir().unwrap();
        let store = CredentialStore::new(dir.path().to_str().unwrap());
        store.load().await.unwrap();

        store.upsert(cred("a")).await.unwrap();
        let mut updated = cred("a");
        updated.access_token = "tok2".to_string();
        store.upsert(updated).await.unwrap();

        let all = store.get_all().await;
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].access_token, "tok2");
    }

    #[tokio::test]
    async fn set_disabled_persists() {
        let dir = tempfile::tempdir().unwrap();
        let store = CredentialStore::new(dir.path().to_str().unwrap());
        store.load().await.unwrap();
        store.upsert(cred("a")).await.unwrap();

        store.set_disabled("a", true).await.unwrap();
        assert!(store.get("a").await.unwrap().disabled);

        assert!(store.set_disabled("missing", true).await.is_err());
    }
}
