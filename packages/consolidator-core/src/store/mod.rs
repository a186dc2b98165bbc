use async_trait::async_trait;
use ethers::types::{Address, TxHash};
use log::info;

use crate::{
    now_unix,
    types::{GroupStatus, NewSignatureGroup, SignatureGroup, TransferLogPatch},
    Result,
};

/// 签名组与转账记录的持久化接口。
///
/// 所有修改都按 group id（或 group id + index）定点进行，
/// 不同 index 的并发更新互不覆盖。
#[async_trait]
pub trait GroupStore: Send + Sync {
    async fn insert_group(&self, group: SignatureGroup) -> Result<()>;

    async fn get_group(&self, id: &str) -> Result<Option<SignatureGroup>>;

    /// statuses 为空时返回全部
    async fn list_groups(&self, statuses: &[GroupStatus]) -> Result<Vec<SignatureGroup>>;

    async fn groups_for_user(&self, user: Address) -> Result<Vec<SignatureGroup>>;

    /// error_message 为 None 时保留原有错误信息
    async fn update_group_status(
        &self,
        id: &str,
        status: GroupStatus,
        error_message: Option<String>,
    ) -> Result<SignatureGroup>;

    /// 仅当当前状态等于 expected 时迁移到 next，返回是否迁移成功
    async fn transition_group(&self, id: &str, expected: GroupStatus, next: GroupStatus) -> Result<bool>;

    async fn append_transaction_hash(&self, id: &str, tx_hash: TxHash) -> Result<SignatureGroup>;

    async fn update_transfer_log(&self, id: &str, index: usize, patch: TransferLogPatch) -> Result<SignatureGroup>;

    /// 转账记录随签名组一起删除
    async fn delete_group(&self, id: &str) -> Result<bool>;

    async fn create_group(&self, request: NewSignatureGroup) -> Result<SignatureGroup> {
        let group = SignatureGroup::create(request, now_unix())?;
        self.insert_group(group.clone()).await?;
        info!(
            "Created signature group {} with {} transfer logs, total {}",
            group.id,
            group.transfer_logs.len(),
            group.total_amount
        );
        Ok(group)
    }
}

pub mod memory;
pub mod file;

pub use memory::MemoryStore;
pub use file::JsonFileStore;
