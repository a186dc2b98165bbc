use async_trait::async_trait;
use ethers::types::{Address, TxHash};
use log::debug;
use std::collections::HashMap;
use tokio::sync::RwLock;

use super::GroupStore;
use crate::{
    now_unix,
    types::{GroupStatus, SignatureGroup, TransferLogPatch},
    Error, Result,
};

#[derive(Default)]
pub struct MemoryStore {
    groups: RwLock<HashMap<String, SignatureGroup>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_groups(groups: impl IntoIterator<Item = SignatureGroup>) -> Self {
        Self {
            groups: RwLock::new(groups.into_iter().map(|g| (g.id.clone(), g)).collect()),
        }
    }

    /// 用外部文档整体替换当前内容
    pub async fn replace_all(&self, groups: Vec<SignatureGroup>) {
        *self.groups.write().await = groups.into_iter().map(|g| (g.id.clone(), g)).collect();
    }

    /// 按创建时间排序的全量快照
    pub async fn snapshot(&self) -> Vec<SignatureGroup> {
        let mut groups: Vec<_> = self.groups.read().await.values().cloned().collect();
        groups.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        groups
    }

    /// 在写锁内修改单个文档；闭包失败时不落盘任何改动
    async fn mutate<F>(&self, id: &str, f: F) -> Result<SignatureGroup>
    where
        F: FnOnce(&mut SignatureGroup) -> Result<()> + Send,
    {
        let mut groups = self.groups.write().await;
        let current = groups
            .get_mut(id)
            .ok_or_else(|| Error::GroupNotFound(id.to_string()))?;

        let mut updated = current.clone();
        f(&mut updated)?;
        updated.updated_at = now_unix();
        *current = updated.clone();
        Ok(updated)
    }
}

fn check_group_transition(group: &SignatureGroup, next: GroupStatus) -> Result<()> {
    if group.status.can_transition_to(next) {
        Ok(())
    } else {
        Err(Error::InvalidTransition(format!(
            "signature group {}: {:?} -> {:?}",
            group.id, group.status, next
        )))
    }
}

#[async_trait]
impl GroupStore for MemoryStore {
    async fn insert_group(&self, group: SignatureGroup) -> Result<()> {
        let mut groups = self.groups.write().await;
        if groups.contains_key(&group.id) {
            return Err(Error::Storage(format!("Signature group {} already exists", group.id)));
        }
        groups.insert(group.id.clone(), group);
        Ok(())
    }

    async fn get_group(&self, id: &str) -> Result<Option<SignatureGroup>> {
        Ok(self.groups.read().await.get(id).cloned())
    }

    async fn list_groups(&self, statuses: &[GroupStatus]) -> Result<Vec<SignatureGroup>> {
        Ok(self
            .snapshot()
            .await
            .into_iter()
            .filter(|g| statuses.is_empty() || statuses.contains(&g.status))
            .collect())
    }

    async fn groups_for_user(&self, user: Address) -> Result<Vec<SignatureGroup>> {
        Ok(self
            .snapshot()
            .await
            .into_iter()
            .filter(|g| g.user_address == user)
            .collect())
    }

    async fn update_group_status(
        &self,
        id: &str,
        status: GroupStatus,
        error_message: Option<String>,
    ) -> Result<SignatureGroup> {
        self.mutate(id, |group| {
            check_group_transition(group, status)?;
            debug!("Signature group {}: {:?} -> {:?}", group.id, group.status, status);
            group.status = status;
            if error_message.is_some() {
                group.error_message = error_message;
            }
            Ok(())
        })
        .await
    }

    async fn transition_group(&self, id: &str, expected: GroupStatus, next: GroupStatus) -> Result<bool> {
        let mut groups = self.groups.write().await;
        let group = groups
            .get_mut(id)
            .ok_or_else(|| Error::GroupNotFound(id.to_string()))?;

        if group.status != expected {
            return Ok(false);
        }
        check_group_transition(group, next)?;
        group.status = next;
        group.updated_at = now_unix();
        Ok(true)
    }

    async fn append_transaction_hash(&self, id: &str, tx_hash: TxHash) -> Result<SignatureGroup> {
        self.mutate(id, |group| {
            if !group.transaction_hashes.contains(&tx_hash) {
                group.transaction_hashes.push(tx_hash);
            }
            Ok(())
        })
        .await
    }

    async fn update_transfer_log(&self, id: &str, index: usize, patch: TransferLogPatch) -> Result<SignatureGroup> {
        let now = now_unix();
        self.mutate(id, |group| {
            let group_id = group.id.clone();
            let log = group.transfer_logs.get_mut(index).ok_or_else(|| {
                Error::Storage(format!("Signature group {} has no transfer log #{}", group_id, index))
            })?;
            log.apply(patch, now)
        })
        .await
    }

    async fn delete_group(&self, id: &str) -> Result<bool> {
        Ok(self.groups.write().await.remove(id).is_some())
    }
}
