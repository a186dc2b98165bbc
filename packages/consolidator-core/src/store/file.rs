use async_trait::async_trait;
use ethers::types::{Address, TxHash};
use fs2::FileExt;
use log::{debug, info};
use std::path::{Path, PathBuf};
use tokio::sync::{Mutex, MutexGuard};

use super::{GroupStore, MemoryStore};
use crate::{
    types::{GroupStatus, SignatureGroup, TransferLogPatch},
    Error, Result,
};

/// 以单个 JSON 文档持久化的存储。
///
/// 文件是唯一的事实来源：每次操作前重新读取，修改在建议性文件锁内
/// 读取、应用并整体重写（临时文件 + rename），多个进程可以共用同一路径。
pub struct JsonFileStore {
    path: PathBuf,
    lock_path: PathBuf,
    cache: MemoryStore,
    local: Mutex<()>,
}

impl JsonFileStore {
    pub async fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| Error::Storage(format!("Failed to create {}: {}", parent.display(), e)))?;
        }

        let groups = read_document(&path).await?;
        info!("Loaded {} signature groups from {}", groups.len(), path.display());
        Ok(Self {
            lock_path: path.with_extension("lock"),
            path,
            cache: MemoryStore::from_groups(groups),
            local: Mutex::new(()),
        })
    }

    /// 读取最新文档到缓存；返回的守卫在读完之前阻止本进程内的并发重载
    async fn refresh(&self) -> Result<MutexGuard<'_, ()>> {
        let guard = self.local.lock().await;
        self.reload().await?;
        Ok(guard)
    }

    /// 取得进程内与跨进程的写锁，并读取最新文档；守卫释放时文件锁一并释放
    async fn begin_write(&self) -> Result<WriteGuard<'_>> {
        let local = self.local.lock().await;
        let file = self.lock_file().await?;
        self.reload().await?;
        Ok(WriteGuard { _local: local, _file: file })
    }

    async fn reload(&self) -> Result<()> {
        let groups = read_document(&self.path).await?;
        self.cache.replace_all(groups).await;
        Ok(())
    }

    async fn lock_file(&self) -> Result<std::fs::File> {
        let path = self.lock_path.clone();
        tokio::task::spawn_blocking(move || -> Result<std::fs::File> {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .truncate(false)
                .write(true)
                .open(&path)
                .map_err(|e| Error::Storage(format!("Failed to open {}: {}", path.display(), e)))?;
            file.lock_exclusive()
                .map_err(|e| Error::Storage(format!("Failed to lock {}: {}", path.display(), e)))?;
            Ok(file)
        })
        .await
        .map_err(|e| Error::Storage(format!("Lock task failed: {}", e)))?
    }

    async fn flush(&self) -> Result<()> {
        let groups = self.cache.snapshot().await;
        let data = serde_json::to_vec_pretty(&groups)
            .map_err(|e| Error::Serialization(e.to_string()))?;

        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, data)
            .await
            .map_err(|e| Error::Storage(format!("Failed to write {}: {}", tmp.display(), e)))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| Error::Storage(format!("Failed to replace {}: {}", self.path.display(), e)))?;
        debug!("Wrote {} signature groups to {}", groups.len(), self.path.display());
        Ok(())
    }
}

async fn read_document(path: &Path) -> Result<Vec<SignatureGroup>> {
    match tokio::fs::read(path).await {
        Ok(data) => serde_json::from_slice(&data)
            .map_err(|e| Error::Serialization(format!("Failed to parse {}: {}", path.display(), e))),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(Error::Storage(format!("Failed to read {}: {}", path.display(), e))),
    }
}

struct WriteGuard<'a> {
    _local: MutexGuard<'a, ()>,
    _file: std::fs::File,
}

#[async_trait]
impl GroupStore for JsonFileStore {
    async fn insert_group(&self, group: SignatureGroup) -> Result<()> {
        let _guard = self.begin_write().await?;
        self.cache.insert_group(group).await?;
        self.flush().await
    }

    async fn get_group(&self, id: &str) -> Result<Option<SignatureGroup>> {
        let _guard = self.refresh().await?;
        self.cache.get_group(id).await
    }

    async fn list_groups(&self, statuses: &[GroupStatus]) -> Result<Vec<SignatureGroup>> {
        let _guard = self.refresh().await?;
        self.cache.list_groups(statuses).await
    }

    async fn groups_for_user(&self, user: Address) -> Result<Vec<SignatureGroup>> {
        let _guard = self.refresh().await?;
        self.cache.groups_for_user(user).await
    }

    async fn update_group_status(
        &self,
        id: &str,
        status: GroupStatus,
        error_message: Option<String>,
    ) -> Result<SignatureGroup> {
        let _guard = self.begin_write().await?;
        let group = self.cache.update_group_status(id, status, error_message).await?;
        self.flush().await?;
        Ok(group)
    }

    async fn transition_group(&self, id: &str, expected: GroupStatus, next: GroupStatus) -> Result<bool> {
        let _guard = self.begin_write().await?;
        let changed = self.cache.transition_group(id, expected, next).await?;
        if changed {
            self.flush().await?;
        }
        Ok(changed)
    }

    async fn append_transaction_hash(&self, id: &str, tx_hash: TxHash) -> Result<SignatureGroup> {
        let _guard = self.begin_write().await?;
        let group = self.cache.append_transaction_hash(id, tx_hash).await?;
        self.flush().await?;
        Ok(group)
    }

    async fn update_transfer_log(&self, id: &str, index: usize, patch: TransferLogPatch) -> Result<SignatureGroup> {
        let _guard = self.begin_write().await?;
        let group = self.cache.update_transfer_log(id, index, patch).await?;
        self.flush().await?;
        Ok(group)
    }

    async fn delete_group(&self, id: &str) -> Result<bool> {
        let _guard = self.begin_write().await?;
        let removed = self.cache.delete_group(id).await?;
        if removed {
            self.flush().await?;
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::tests::request;
    use crate::types::TransferStatus;

    fn temp_path() -> PathBuf {
        std::env::temp_dir().join(format!("consolidator-store-{}.json", uuid::Uuid::new_v4()))
    }

    async fn cleanup(path: &Path) {
        let _ = tokio::fs::remove_file(path).await;
        let _ = tokio::fs::remove_file(path.with_extension("lock")).await;
    }

    fn future_request(chains: &[u64], amounts: &[u64], destination: u64) -> crate::NewSignatureGroup {
        let mut req = request(chains, amounts, destination);
        req.expiration_time = crate::now_unix() + 3600;
        req
    }

    #[tokio::test]
    async fn test_reopen_restores_groups() {
        let path = temp_path();
        let id = {
            let store = JsonFileStore::open(&path).await.unwrap();
            let group = store.create_group(future_request(&[1, 10], &[40, 60], 10)).await.unwrap();
            let patch = TransferLogPatch::status(TransferStatus::Pending).with_tx_hash(TxHash::repeat_byte(7));
            store.update_transfer_log(&group.id, 0, patch).await.unwrap();
            store
                .transition_group(&group.id, GroupStatus::Signed, GroupStatus::Pending)
                .await
                .unwrap();
            group.id
        };

        let reopened = JsonFileStore::open(&path).await.unwrap();
        let group = reopened.get_group(&id).await.unwrap().unwrap();
        assert_eq!(group.status, GroupStatus::Pending);
        assert_eq!(group.transfer_logs[0].status, TransferStatus::Pending);
        assert_eq!(group.transfer_logs[0].tx_hash, Some(TxHash::repeat_byte(7)));
        assert_eq!(group.transfer_logs[1].status, TransferStatus::Ready);

        cleanup(&path).await;
    }

    #[tokio::test]
    async fn test_stores_sharing_a_path_see_each_other() {
        let path = temp_path();
        let daemon = JsonFileStore::open(&path).await.unwrap();
        let running = daemon.create_group(future_request(&[1], &[5], 10)).await.unwrap();

        // 另一个进程（CLI）在守护进程运行期间提交签名组
        let cli = JsonFileStore::open(&path).await.unwrap();
        let submitted = cli.create_group(future_request(&[10], &[7], 1)).await.unwrap();

        let active = daemon.list_groups(&[GroupStatus::Signed]).await.unwrap();
        assert_eq!(active.len(), 2);

        // 守护进程的后续写入不会覆盖掉 CLI 写入的签名组
        daemon
            .append_transaction_hash(&running.id, TxHash::repeat_byte(3))
            .await
            .unwrap();
        cli.update_group_status(&submitted.id, GroupStatus::Failed, Some("rejected".to_string()))
            .await
            .unwrap();

        let reopened = JsonFileStore::open(&path).await.unwrap();
        let running = reopened.get_group(&running.id).await.unwrap().unwrap();
        assert_eq!(running.transaction_hashes, vec![TxHash::repeat_byte(3)]);
        let submitted = reopened.get_group(&submitted.id).await.unwrap().unwrap();
        assert_eq!(submitted.status, GroupStatus::Failed);
        assert_eq!(
            daemon.get_group(&submitted.id).await.unwrap().unwrap().error_message.as_deref(),
            Some("rejected")
        );

        cleanup(&path).await;
    }

    #[tokio::test]
    async fn test_rejected_update_does_not_rewrite_file() {
        let path = temp_path();
        let store = JsonFileStore::open(&path).await.unwrap();
        let group = store.create_group(future_request(&[1], &[5], 10)).await.unwrap();
        let before = tokio::fs::read(&path).await.unwrap();

        let result = store.update_group_status(&group.id, GroupStatus::Done, None).await;
        assert!(matches!(result, Err(Error::InvalidTransition(_))));
        assert!(!store
            .transition_group(&group.id, GroupStatus::Pending, GroupStatus::ReadyToTransfer)
            .await
            .unwrap());
        assert_eq!(tokio::fs::read(&path).await.unwrap(), before);

        cleanup(&path).await;
    }

    #[tokio::test]
    async fn test_missing_file_opens_empty() {
        let path = temp_path();
        let store = JsonFileStore::open(&path).await.unwrap();
        assert!(store.list_groups(&[]).await.unwrap().is_empty());
        cleanup(&path).await;
    }

    #[tokio::test]
    async fn test_corrupt_file_is_rejected() {
        let path = temp_path();
        tokio::fs::write(&path, b"{not json").await.unwrap();

        let result = JsonFileStore::open(&path).await;
        assert!(matches!(result, Err(Error::Serialization(_))));

        cleanup(&path).await;
    }
}
