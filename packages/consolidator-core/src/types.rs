use ethers::types::{Address, Bytes, TxHash, U256};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::{Error, Result};

/// 签名组状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum GroupStatus {
    Created,
    Signed,
    Pending,
    ReadyToTransfer,
    Done,
    Failed,
    Expired,
}

impl GroupStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, GroupStatus::Done | GroupStatus::Failed | GroupStatus::Expired)
    }

    /// 终态之后不允许再迁移；同状态写入视为幂等
    pub fn can_transition_to(self, next: GroupStatus) -> bool {
        use GroupStatus::*;
        if self == next {
            return true;
        }
        match (self, next) {
            (Created, Signed) => true,
            (Signed, Pending) | (Pending, ReadyToTransfer) | (ReadyToTransfer, Done) => true,
            (Created | Signed | Pending | ReadyToTransfer, Failed | Expired) => true,
            _ => false,
        }
    }
}

/// 单链转账记录状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TransferStatus {
    Draft,
    Ready,
    Pending,
    Done,
    Failed,
}

impl TransferStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TransferStatus::Done | TransferStatus::Failed)
    }

    pub fn can_transition_to(self, next: TransferStatus) -> bool {
        use TransferStatus::*;
        if self == next {
            return true;
        }
        matches!(
            (self, next),
            (Draft, Pending) | (Draft, Failed) | (Ready, Done) | (Ready, Failed) | (Pending, Done) | (Pending, Failed)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TransactionType {
    SameChainTransfer,
    BridgeBurn,
}

/// 用户签名提交的整合请求
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewSignatureGroup {
    pub user_address: Address,
    pub signature: Bytes,
    pub source_chain_ids: Vec<u64>,
    pub amounts_each: Vec<u64>,
    pub nonces: Vec<U256>,
    /// unix 秒
    pub expiration_time: u64,
    pub destination_chain_id: u64,
    pub target_address: Address,
}

impl NewSignatureGroup {
    pub fn validate(&self, now: u64) -> Result<()> {
        let n = self.source_chain_ids.len();
        if n == 0 {
            return Err(Error::Validation("At least one source chain is required".to_string()));
        }
        if self.amounts_each.len() != n || self.nonces.len() != n {
            return Err(Error::Validation(format!(
                "Parallel lists differ in length: {} chains, {} amounts, {} nonces",
                n,
                self.amounts_each.len(),
                self.nonces.len()
            )));
        }

        let mut seen = HashSet::with_capacity(n);
        for chain_id in &self.source_chain_ids {
            if !seen.insert(*chain_id) {
                return Err(Error::Validation(format!("Duplicate source chain: {}", chain_id)));
            }
        }

        if let Some(i) = self.amounts_each.iter().position(|a| *a == 0) {
            return Err(Error::Validation(format!(
                "Amount for chain {} must be greater than 0",
                self.source_chain_ids[i]
            )));
        }
        if self.signature.is_empty() {
            return Err(Error::Validation("Signature is empty".to_string()));
        }
        if self.expiration_time <= now {
            return Err(Error::Validation(format!(
                "Expiration time {} is not in the future (now {})",
                self.expiration_time, now
            )));
        }
        Ok(())
    }

    pub fn total_amount(&self) -> u128 {
        self.amounts_each.iter().map(|a| *a as u128).sum()
    }
}

/// 一次用户授权的多链整合
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignatureGroup {
    pub id: String,
    pub user_address: Address,
    pub signature: Bytes,
    pub source_chain_ids: Vec<u64>,
    pub amounts_each: Vec<u64>,
    pub nonces: Vec<U256>,
    pub expiration_time: u64,
    pub destination_chain_id: u64,
    pub target_address: Address,
    /// 十进制字符串
    pub total_amount: String,
    pub status: GroupStatus,
    pub transaction_hashes: Vec<TxHash>,
    pub transfer_logs: Vec<TransferLog>,
    pub error_message: Option<String>,
    pub created_at: u64,
    pub updated_at: u64,
}

impl SignatureGroup {
    /// 校验请求并按源链展开为转账记录
    pub fn create(request: NewSignatureGroup, now: u64) -> Result<Self> {
        request.validate(now)?;

        let id = uuid::Uuid::new_v4().to_string();
        let transfer_logs = request
            .source_chain_ids
            .iter()
            .zip(&request.amounts_each)
            .enumerate()
            .map(|(index, (chain_id, amount))| {
                TransferLog::new(
                    &id,
                    index,
                    *chain_id,
                    *amount,
                    request.target_address,
                    *chain_id == request.destination_chain_id,
                    now,
                )
            })
            .collect();

        Ok(Self {
            id,
            total_amount: request.total_amount().to_string(),
            user_address: request.user_address,
            signature: request.signature,
            source_chain_ids: request.source_chain_ids,
            amounts_each: request.amounts_each,
            nonces: request.nonces,
            expiration_time: request.expiration_time,
            destination_chain_id: request.destination_chain_id,
            target_address: request.target_address,
            status: GroupStatus::Signed,
            transaction_hashes: Vec::new(),
            transfer_logs,
            error_message: None,
            created_at: now,
            updated_at: now,
        })
    }

    pub fn is_expired(&self, now: u64) -> bool {
        now >= self.expiration_time
    }

    pub fn logs_with_status(&self, status: TransferStatus) -> impl Iterator<Item = &TransferLog> {
        self.transfer_logs.iter().filter(move |log| log.status == status)
    }

    pub fn has_status(&self, status: TransferStatus) -> bool {
        self.logs_with_status(status).next().is_some()
    }
}

/// 签名组下的单链操作，以 (group_id, index) 寻址
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferLog {
    pub group_id: String,
    pub index: usize,
    pub source_chain_id: u64,
    pub amount: u64,
    pub recipient_address: Address,
    pub transaction_type: TransactionType,
    pub status: TransferStatus,
    /// 源链 burn（或同链转账）交易
    pub tx_hash: Option<TxHash>,
    /// 目标链 receiveMessage 交易
    pub mint_tx_hash: Option<TxHash>,
    pub message: Option<Bytes>,
    pub attestation: Option<Bytes>,
    pub error_message: Option<String>,
    pub updated_at: u64,
}

impl TransferLog {
    fn new(
        group_id: &str,
        index: usize,
        source_chain_id: u64,
        amount: u64,
        recipient_address: Address,
        same_chain: bool,
        now: u64,
    ) -> Self {
        let (transaction_type, status) = if same_chain {
            (TransactionType::SameChainTransfer, TransferStatus::Ready)
        } else {
            (TransactionType::BridgeBurn, TransferStatus::Draft)
        };
        Self {
            group_id: group_id.to_string(),
            index,
            source_chain_id,
            amount,
            recipient_address,
            transaction_type,
            status,
            tx_hash: None,
            mint_tx_hash: None,
            message: None,
            attestation: None,
            error_message: None,
            updated_at: now,
        }
    }

    pub fn has_attestation(&self) -> bool {
        self.message.is_some() && self.attestation.is_some()
    }

    pub fn apply(&mut self, patch: TransferLogPatch, now: u64) -> Result<()> {
        if let Some(status) = patch.status {
            if !self.status.can_transition_to(status) {
                return Err(Error::InvalidTransition(format!(
                    "transfer log {}#{}: {:?} -> {:?}",
                    self.group_id, self.index, self.status, status
                )));
            }
            self.status = status;
        }
        if let Some(tx_hash) = patch.tx_hash {
            self.tx_hash = Some(tx_hash);
        }
        if let Some(mint_tx_hash) = patch.mint_tx_hash {
            self.mint_tx_hash = Some(mint_tx_hash);
        }
        if let Some(message) = patch.message {
            self.message = Some(message);
        }
        if let Some(attestation) = patch.attestation {
            self.attestation = Some(attestation);
        }
        if let Some(error_message) = patch.error_message {
            self.error_message = error_message;
        }
        self.updated_at = now;
        Ok(())
    }
}

/// 针对单条转账记录的定点更新，None 表示不修改该字段
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransferLogPatch {
    pub status: Option<TransferStatus>,
    pub tx_hash: Option<TxHash>,
    pub mint_tx_hash: Option<TxHash>,
    pub message: Option<Bytes>,
    pub attestation: Option<Bytes>,
    pub error_message: Option<Option<String>>,
}

impl TransferLogPatch {
    pub fn status(status: TransferStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn with_tx_hash(mut self, tx_hash: TxHash) -> Self {
        self.tx_hash = Some(tx_hash);
        self
    }

    pub fn with_mint_tx_hash(mut self, tx_hash: TxHash) -> Self {
        self.mint_tx_hash = Some(tx_hash);
        self
    }

    pub fn with_attestation(mut self, message: Bytes, attestation: Bytes) -> Self {
        self.message = Some(message);
        self.attestation = Some(attestation);
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error_message = Some(Some(error.into()));
        self
    }

    pub fn clear_error(mut self) -> Self {
        self.error_message = Some(None);
        self
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) const NOW: u64 = 1_700_000_000;

    pub(crate) fn request(chains: &[u64], amounts: &[u64], destination: u64) -> NewSignatureGroup {
        NewSignatureGroup {
            user_address: Address::repeat_byte(0x11),
            signature: Bytes::from(vec![0xab; 65]),
            source_chain_ids: chains.to_vec(),
            amounts_each: amounts.to_vec(),
            nonces: (0..chains.len()).map(|i| U256::from(i as u64 + 1)).collect(),
            expiration_time: NOW + 3600,
            destination_chain_id: destination,
            target_address: Address::repeat_byte(0x22),
        }
    }

    #[test]
    fn test_create_expands_one_log_per_chain() {
        let group = SignatureGroup::create(request(&[1, 10, 8453], &[40, 60, 25], 8453), NOW).unwrap();

        assert_eq!(group.status, GroupStatus::Signed);
        assert_eq!(group.transfer_logs.len(), 3);
        assert_eq!(group.total_amount, "125");
        for (i, log) in group.transfer_logs.iter().enumerate() {
            assert_eq!(log.index, i);
            assert_eq!(log.group_id, group.id);
            assert_eq!(log.amount, group.amounts_each[i]);
            assert_eq!(log.recipient_address, group.target_address);
        }
    }

    #[test]
    fn test_same_chain_log_is_ready_and_bridge_log_is_draft() {
        let group = SignatureGroup::create(request(&[8453, 10], &[40, 60], 8453), NOW).unwrap();

        assert_eq!(group.transfer_logs[0].transaction_type, TransactionType::SameChainTransfer);
        assert_eq!(group.transfer_logs[0].status, TransferStatus::Ready);
        assert_eq!(group.transfer_logs[1].transaction_type, TransactionType::BridgeBurn);
        assert_eq!(group.transfer_logs[1].status, TransferStatus::Draft);
    }

    #[test]
    fn test_total_amount_does_not_overflow() {
        let group = SignatureGroup::create(request(&[1, 10], &[u64::MAX, u64::MAX], 8453), NOW).unwrap();
        assert_eq!(group.total_amount, (u64::MAX as u128 * 2).to_string());
    }

    #[test]
    fn test_rejects_expired_request() {
        let mut req = request(&[1], &[10], 8453);
        req.expiration_time = NOW;
        assert!(matches!(SignatureGroup::create(req, NOW), Err(Error::Validation(_))));
    }

    #[test]
    fn test_rejects_malformed_requests() {
        let mut mismatched = request(&[1, 10], &[10, 20], 8453);
        mismatched.nonces.pop();
        assert!(matches!(mismatched.validate(NOW), Err(Error::Validation(_))));

        let empty = request(&[], &[], 8453);
        assert!(matches!(empty.validate(NOW), Err(Error::Validation(_))));

        let duplicate = request(&[1, 1], &[10, 20], 8453);
        assert!(matches!(duplicate.validate(NOW), Err(Error::Validation(_))));

        let zero = request(&[1, 10], &[10, 0], 8453);
        assert!(matches!(zero.validate(NOW), Err(Error::Validation(_))));

        let mut unsigned = request(&[1], &[10], 8453);
        unsigned.signature = Bytes::default();
        assert!(matches!(unsigned.validate(NOW), Err(Error::Validation(_))));
    }

    #[test]
    fn test_transfer_status_never_leaves_terminal_state() {
        use TransferStatus::*;
        for next in [Draft, Ready, Pending, Failed] {
            assert!(!Done.can_transition_to(next));
        }
        for next in [Draft, Ready, Pending, Done] {
            assert!(!Failed.can_transition_to(next));
        }
        assert!(Draft.can_transition_to(Pending));
        assert!(!Ready.can_transition_to(Pending));
    }

    #[test]
    fn test_group_status_transitions() {
        use GroupStatus::*;
        assert!(Signed.can_transition_to(Pending));
        assert!(Pending.can_transition_to(ReadyToTransfer));
        assert!(ReadyToTransfer.can_transition_to(Done));
        assert!(Pending.can_transition_to(Expired));
        assert!(!Pending.can_transition_to(Signed));
        assert!(!Expired.can_transition_to(Pending));
        assert!(!Done.can_transition_to(Failed));
    }

    #[test]
    fn test_apply_patch_rejects_regression() {
        let mut group = SignatureGroup::create(request(&[1], &[10], 8453), NOW).unwrap();
        let log = &mut group.transfer_logs[0];

        let hash = TxHash::repeat_byte(0x33);
        log.apply(TransferLogPatch::status(TransferStatus::Pending).with_tx_hash(hash), NOW + 1)
            .unwrap();
        log.apply(TransferLogPatch::status(TransferStatus::Done), NOW + 2).unwrap();

        let err = log.apply(TransferLogPatch::status(TransferStatus::Pending), NOW + 3);
        assert!(matches!(err, Err(Error::InvalidTransition(_))));
        assert_eq!(log.status, TransferStatus::Done);
        assert_eq!(log.tx_hash, Some(hash));
        assert_eq!(log.updated_at, NOW + 2);
    }

    #[test]
    fn test_patch_sets_and_clears_error() {
        let mut group = SignatureGroup::create(request(&[1], &[10], 8453), NOW).unwrap();
        let log = &mut group.transfer_logs[0];

        log.apply(TransferLogPatch::default().with_error("mint reverted"), NOW).unwrap();
        assert_eq!(log.error_message.as_deref(), Some("mint reverted"));

        log.apply(TransferLogPatch::default(), NOW).unwrap();
        assert_eq!(log.error_message.as_deref(), Some("mint reverted"));

        log.apply(TransferLogPatch::default().clear_error(), NOW).unwrap();
        assert_eq!(log.error_message, None);
    }
}
