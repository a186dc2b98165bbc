use ethers::types::{Address, Bytes, TxHash, U256};
use futures::future::join_all;
use log::{debug, error, info, warn};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::sleep;

use crate::{
    attestation::{AttestationSource, AttestationStatus},
    chain_operator::{ChainOperator, Confirmation, DepositForBurn, ReadCall, WriteCall},
    config::{BurnConfig, OrchestratorConfig},
    now_unix,
    registry::ChainRegistry,
    store::GroupStore,
    types::{
        GroupStatus, NewSignatureGroup, SignatureGroup, TransactionType, TransferLog,
        TransferLogPatch, TransferStatus,
    },
    Error, Result,
};

/// 调度器会继续推进的签名组状态
const ACTIVE_STATUSES: [GroupStatus; 3] = [
    GroupStatus::Signed,
    GroupStatus::Pending,
    GroupStatus::ReadyToTransfer,
];

/// 单条转账记录在一次轮询中的进展
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttestationProgress {
    Waiting,
    Minted,
    Failed,
}

enum BurnOutcome {
    Submitted(TxHash),
    Skipped,
    Failed(String),
}

enum Fetched {
    Ready(Bytes, Bytes),
    Waiting,
    Failed,
}

/// 将一次用户签名展开为多条链上操作并收敛为签名组终态
pub struct Orchestrator {
    registry: Arc<ChainRegistry>,
    store: Arc<dyn GroupStore>,
    operator: Arc<dyn ChainOperator>,
    attestation: Arc<dyn AttestationSource>,
    settings: OrchestratorConfig,
    burn: BurnConfig,
    in_flight: Mutex<HashSet<String>>,
}

impl Orchestrator {
    pub fn new(
        registry: Arc<ChainRegistry>,
        store: Arc<dyn GroupStore>,
        operator: Arc<dyn ChainOperator>,
        attestation: Arc<dyn AttestationSource>,
        settings: OrchestratorConfig,
        burn: BurnConfig,
    ) -> Self {
        Self {
            registry,
            store,
            operator,
            attestation,
            settings,
            burn,
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    pub fn store(&self) -> &Arc<dyn GroupStore> {
        &self.store
    }

    /// 校验链是否受支持后创建签名组
    pub async fn submit(&self, request: NewSignatureGroup) -> Result<SignatureGroup> {
        let chains = request
            .source_chain_ids
            .iter()
            .chain(std::iter::once(&request.destination_chain_id));
        for chain_id in chains {
            if !self.registry.contains(*chain_id) {
                return Err(Error::Validation(format!("Unsupported chain: {}", chain_id)));
            }
        }
        self.store.create_group(request).await
    }

    async fn load(&self, group_id: &str) -> Result<SignatureGroup> {
        self.store
            .get_group(group_id)
            .await?
            .ok_or_else(|| Error::GroupNotFound(group_id.to_string()))
    }

    async fn expire(&self, group: &SignatureGroup) -> Result<GroupStatus> {
        warn!(
            "Signature group {} expired at {} while {:?}",
            group.id, group.expiration_time, group.status
        );
        let message = Error::Expired(format!("expiration time {} has passed", group.expiration_time));
        let group = self
            .store
            .update_group_status(&group.id, GroupStatus::Expired, Some(message.to_string()))
            .await?;
        Ok(group.status)
    }

    /// 提交全部跨链 burn 并轮询至没有 pending 记录。
    ///
    /// 仅对 signed 状态生效，其余状态直接返回当前状态。
    pub async fn execute_signature_group(&self, group_id: &str) -> Result<GroupStatus> {
        let group = self.load(group_id).await?;
        if group.status != GroupStatus::Signed {
            debug!("Signature group {} is {:?}, skipping execution", group_id, group.status);
            return Ok(group.status);
        }
        if group.is_expired(now_unix()) {
            return self.expire(&group).await;
        }
        if !self
            .store
            .transition_group(group_id, GroupStatus::Signed, GroupStatus::Pending)
            .await?
        {
            // 另一个执行者已经接手
            return Ok(self.load(group_id).await?.status);
        }

        info!(
            "Executing signature group {}: {} source chains -> chain {}",
            group_id,
            group.source_chain_ids.len(),
            group.destination_chain_id
        );

        if let Some(status) = self.submit_burns(&group).await? {
            return Ok(status);
        }
        self.poll_pending(group_id).await
    }

    /// 并发提交所有 draft 状态的 burn；任一失败则整个签名组失败，返回 Some(终态)。
    ///
    /// 存储错误在签名组失败状态写入之后才向上返回。
    async fn submit_burns(&self, group: &SignatureGroup) -> Result<Option<GroupStatus>> {
        let aborted = AtomicBool::new(false);
        let drafts: Vec<&TransferLog> = group
            .logs_with_status(TransferStatus::Draft)
            .filter(|log| log.transaction_type == TransactionType::BridgeBurn)
            .collect();
        if drafts.is_empty() {
            return Ok(None);
        }

        let outcomes = join_all(drafts.iter().map(|log| self.burn_one(group, log, &aborted))).await;

        let mut failure = None;
        let mut store_error = None;
        let mut submitted = Vec::new();
        for outcome in outcomes {
            match outcome {
                Ok(BurnOutcome::Submitted(tx_hash)) => submitted.push(tx_hash),
                Ok(BurnOutcome::Failed(message)) => {
                    if failure.is_none() {
                        failure = Some(message);
                    }
                }
                Ok(BurnOutcome::Skipped) => {}
                Err(e) => {
                    error!("Failed to record burn for signature group {}: {}", group.id, e);
                    if store_error.is_none() {
                        store_error = Some(e);
                    }
                }
            }
        }
        debug!("Signature group {}: {} burns submitted {:?}", group.id, submitted.len(), submitted);

        if let Some(message) = failure {
            error!("Signature group {} failed during burn submission: {}", group.id, message);
            let group = self
                .store
                .update_group_status(&group.id, GroupStatus::Failed, Some(message))
                .await?;
            return match store_error {
                Some(e) => Err(e),
                None => Ok(Some(group.status)),
            };
        }

        match store_error {
            Some(e) => Err(e),
            None => Ok(None),
        }
    }

    async fn burn_one(&self, group: &SignatureGroup, log: &TransferLog, aborted: &AtomicBool) -> Result<BurnOutcome> {
        if aborted.load(Ordering::SeqCst) {
            warn!(
                "Skipping burn on chain {} for group {} after an earlier failure",
                log.source_chain_id, group.id
            );
            return Ok(BurnOutcome::Skipped);
        }

        match self.send_burn(group, log).await {
            Ok(tx_hash) => {
                info!(
                    "Burn submitted on chain {} for group {}#{}: {:?}",
                    log.source_chain_id, group.id, log.index, tx_hash
                );
                let patch = TransferLogPatch::status(TransferStatus::Pending).with_tx_hash(tx_hash);
                self.store.update_transfer_log(&group.id, log.index, patch).await?;
                self.store.append_transaction_hash(&group.id, tx_hash).await?;
                Ok(BurnOutcome::Submitted(tx_hash))
            }
            Err(e) => {
                aborted.store(true, Ordering::SeqCst);
                let message = format!("Burn on chain {} failed: {}", log.source_chain_id, e);
                error!("{} (group {})", message, group.id);
                let patch = TransferLogPatch::status(TransferStatus::Failed).with_error(e.to_string());
                if let Err(store_err) = self.store.update_transfer_log(&group.id, log.index, patch).await {
                    // 签名组仍会被标记为失败
                    error!(
                        "Failed to mark transfer log {}#{} as failed: {}",
                        group.id, log.index, store_err
                    );
                }
                Ok(BurnOutcome::Failed(message))
            }
        }
    }

    async fn send_burn(&self, group: &SignatureGroup, log: &TransferLog) -> Result<TxHash> {
        let chain = self.registry.require(log.source_chain_id)?;
        let call = WriteCall::DepositForBurn(DepositForBurn {
            contract: chain.proxy_address,
            burn_token: chain.token_address,
            max_fee: U256::from(self.burn.max_fee),
            min_finality_threshold: self.burn.min_finality_threshold,
            source_chain_ids: group.source_chain_ids.iter().map(|id| U256::from(*id)).collect(),
            amounts_each: group.amounts_each.iter().map(|a| U256::from(*a)).collect(),
            nonces: group.nonces.clone(),
            expiry: U256::from(group.expiration_time),
            destination_chain_id: U256::from(group.destination_chain_id),
            target_address: group.target_address,
            signature: group.signature.clone(),
        });
        self.operator.write(chain.chain_id, call, Confirmation::Submit).await
    }

    /// 可重入的轮询循环：没有 pending 记录时收敛签名组状态。
    ///
    /// 每轮先检查过期时间；单条记录的错误不会中断循环。
    pub async fn poll_pending(&self, group_id: &str) -> Result<GroupStatus> {
        let group = self.load(group_id).await?;
        if group.status == GroupStatus::Pending && group.has_status(TransferStatus::Draft) {
            // 进程在 burn 提交途中退出，补交剩余的 burn
            info!("Resuming burn submission for signature group {}", group_id);
            if let Some(status) = self.submit_burns(&group).await? {
                return Ok(status);
            }
        }

        loop {
            let group = self.load(group_id).await?;
            if group.status != GroupStatus::Pending {
                return Ok(group.status);
            }
            if group.is_expired(now_unix()) {
                return self.expire(&group).await;
            }

            let pending: Vec<&TransferLog> = group.logs_with_status(TransferStatus::Pending).collect();
            if pending.is_empty() {
                return self.settle(&group).await;
            }

            debug!(
                "Signature group {}: checking {} pending transfer logs",
                group_id,
                pending.len()
            );
            let progress = join_all(pending.iter().map(|log| self.advance_transfer_log(&group, log))).await;

            if progress.contains(&AttestationProgress::Waiting) {
                sleep(self.settings.poll_interval()).await;
            }
        }
    }

    async fn settle(&self, group: &SignatureGroup) -> Result<GroupStatus> {
        let failed: Vec<String> = group
            .logs_with_status(TransferStatus::Failed)
            .map(|log| {
                format!(
                    "chain {}: {}",
                    log.source_chain_id,
                    log.error_message.as_deref().unwrap_or("unknown error")
                )
            })
            .collect();

        let (status, message) = if failed.is_empty() {
            (GroupStatus::ReadyToTransfer, None)
        } else {
            (GroupStatus::Failed, Some(format!("Transfers failed: {}", failed.join("; "))))
        };

        let group = self.store.update_group_status(&group.id, status, message).await?;
        info!("Signature group {} settled as {:?}", group.id, group.status);
        Ok(group.status)
    }

    async fn advance_transfer_log(&self, group: &SignatureGroup, log: &TransferLog) -> AttestationProgress {
        match self.await_attestation(group, log).await {
            Ok(progress) => progress,
            Err(e) => {
                warn!(
                    "Transfer log {}#{} on chain {} not advanced: {}",
                    group.id, log.index, log.source_chain_id, e
                );
                AttestationProgress::Waiting
            }
        }
    }

    /// 等待证明并在目标链提交 receiveMessage。
    ///
    /// 已保存证明的记录（上次 mint 失败）直接重试 mint，不再查询证明服务。
    pub async fn await_attestation(&self, group: &SignatureGroup, log: &TransferLog) -> Result<AttestationProgress> {
        match log.status {
            TransferStatus::Pending => {}
            TransferStatus::Done => return Ok(AttestationProgress::Minted),
            TransferStatus::Failed => return Ok(AttestationProgress::Failed),
            TransferStatus::Draft | TransferStatus::Ready => return Ok(AttestationProgress::Waiting),
        }

        let (message, attestation) = match (&log.message, &log.attestation) {
            (Some(message), Some(attestation)) => (message.clone(), attestation.clone()),
            _ => match self.fetch_attestation(group, log).await? {
                Fetched::Ready(message, attestation) => (message, attestation),
                Fetched::Waiting => return Ok(AttestationProgress::Waiting),
                Fetched::Failed => return Ok(AttestationProgress::Failed),
            },
        };

        self.mint(group, log, message, attestation).await
    }

    async fn fetch_attestation(&self, group: &SignatureGroup, log: &TransferLog) -> Result<Fetched> {
        let tx_hash = log.tx_hash.ok_or_else(|| {
            Error::InvalidTransition(format!(
                "transfer log {}#{} is pending without a burn transaction",
                group.id, log.index
            ))
        })?;
        let source = self.registry.require(log.source_chain_id)?;

        let result = match self.attestation.get_status(source.domain, tx_hash).await {
            Ok(result) => result,
            Err(e) if e.is_transient() => {
                debug!("Attestation for {:?} not available yet: {}", tx_hash, e);
                return Ok(Fetched::Waiting);
            }
            Err(e) => return Err(e),
        };

        if result.status == AttestationStatus::Failed {
            warn!(
                "Attestation service reported burn {:?} on chain {} as failed",
                tx_hash, log.source_chain_id
            );
            let patch = TransferLogPatch::status(TransferStatus::Failed)
                .with_error("Attestation service reported the burn as failed");
            self.store.update_transfer_log(&group.id, log.index, patch).await?;
            return Ok(Fetched::Failed);
        }

        match result.ready() {
            Some((message, attestation)) => {
                let patch = TransferLogPatch::default().with_attestation(message.clone(), attestation.clone());
                self.store.update_transfer_log(&group.id, log.index, patch).await?;
                debug!("Attestation received for {:?}", tx_hash);
                Ok(Fetched::Ready(message, attestation))
            }
            None => Ok(Fetched::Waiting),
        }
    }

    /// 提交 receiveMessage，先保存交易哈希再等待回执。
    ///
    /// 已有 mint 交易时先查询其回执：成功即完成，未上链继续等待，回滚才重新提交。
    async fn mint(
        &self,
        group: &SignatureGroup,
        log: &TransferLog,
        message: Bytes,
        attestation: Bytes,
    ) -> Result<AttestationProgress> {
        let destination = self.registry.require(group.destination_chain_id)?;

        if let Some(tx_hash) = log.mint_tx_hash {
            match self.operator.receipt_status(destination.chain_id, tx_hash).await {
                Ok(Some(true)) => return self.complete_mint(group, log, tx_hash).await,
                Ok(None) => {
                    debug!("Mint {:?} for {}#{} not mined yet", tx_hash, group.id, log.index);
                    return Ok(AttestationProgress::Waiting);
                }
                Ok(Some(false)) => {
                    warn!(
                        "Mint {:?} for {}#{} reverted, resubmitting receiveMessage",
                        tx_hash, group.id, log.index
                    );
                }
                Err(e) => return self.mint_not_confirmed(group, log, e).await,
            }
        }

        let call = WriteCall::ReceiveMessage {
            contract: destination.message_transmitter_address,
            message,
            attestation,
        };
        let tx_hash = match self.operator.write(destination.chain_id, call, Confirmation::Submit).await {
            Ok(tx_hash) => tx_hash,
            Err(e) => return self.mint_not_confirmed(group, log, e).await,
        };

        let patch = TransferLogPatch::default().with_mint_tx_hash(tx_hash);
        self.store.update_transfer_log(&group.id, log.index, patch).await?;
        self.store.append_transaction_hash(&group.id, tx_hash).await?;

        match self.operator.wait_for_receipt(destination.chain_id, tx_hash).await {
            Ok(()) => self.complete_mint(group, log, tx_hash).await,
            Err(e) => self.mint_not_confirmed(group, log, e).await,
        }
    }

    async fn complete_mint(&self, group: &SignatureGroup, log: &TransferLog, tx_hash: TxHash) -> Result<AttestationProgress> {
        let patch = TransferLogPatch::status(TransferStatus::Done)
            .with_mint_tx_hash(tx_hash)
            .clear_error();
        self.store.update_transfer_log(&group.id, log.index, patch).await?;
        info!(
            "Minted transfer {}#{} from chain {} on chain {}: {:?}",
            group.id, log.index, log.source_chain_id, group.destination_chain_id, tx_hash
        );
        Ok(AttestationProgress::Minted)
    }

    /// 记录错误并保持 pending，下一轮重试
    async fn mint_not_confirmed(&self, group: &SignatureGroup, log: &TransferLog, err: Error) -> Result<AttestationProgress> {
        warn!(
            "receiveMessage for {}#{} not confirmed, retrying on next poll: {}",
            group.id, log.index, err
        );
        let patch = TransferLogPatch::default().with_error(err.to_string());
        self.store.update_transfer_log(&group.id, log.index, patch).await?;
        Ok(AttestationProgress::Waiting)
    }

    /// 将同链部分转给目标地址并完成签名组；跨链部分已直接 mint 到目标地址。
    ///
    /// 连接错误保留 readyToTransfer 状态等待下次调度，其余错误使签名组失败。
    pub async fn finalize(&self, group_id: &str) -> Result<GroupStatus> {
        let group = self.load(group_id).await?;
        if group.status != GroupStatus::ReadyToTransfer {
            return Ok(group.status);
        }
        if group.is_expired(now_unix()) {
            return self.expire(&group).await;
        }

        match self.consolidate(&group).await {
            Ok(()) => {
                let group = self
                    .store
                    .update_group_status(group_id, GroupStatus::Done, None)
                    .await?;
                info!(
                    "Signature group {} done, {} consolidated to {:?}",
                    group_id, group.total_amount, group.target_address
                );
                Ok(group.status)
            }
            Err(Error::Connection(message)) => {
                warn!(
                    "Final transfer for signature group {} not confirmed, retrying later: {}",
                    group_id, message
                );
                Ok(GroupStatus::ReadyToTransfer)
            }
            Err(e) => {
                error!("Final transfer for signature group {} failed: {}", group_id, e);
                for log in group.logs_with_status(TransferStatus::Ready) {
                    let patch = TransferLogPatch::status(TransferStatus::Failed).with_error(e.to_string());
                    self.store.update_transfer_log(group_id, log.index, patch).await?;
                }
                let group = self
                    .store
                    .update_group_status(group_id, GroupStatus::Failed, Some(format!("Final transfer failed: {}", e)))
                    .await?;
                Ok(group.status)
            }
        }
    }

    async fn consolidate(&self, group: &SignatureGroup) -> Result<()> {
        let ready: Vec<&TransferLog> = group.logs_with_status(TransferStatus::Ready).collect();
        if ready.is_empty() {
            return Ok(());
        }

        // 用户即收款人时资金已在原处
        let tx_hash = if group.user_address == group.target_address {
            None
        } else {
            let destination = self.registry.require(group.destination_chain_id)?;
            let tx_hash = match ready.iter().find_map(|log| log.tx_hash) {
                Some(tx_hash) => {
                    info!("Resuming final transfer {:?} for signature group {}", tx_hash, group.id);
                    tx_hash
                }
                None => self.send_transfer(group, &ready).await?,
            };
            self.operator.wait_for_receipt(destination.chain_id, tx_hash).await?;
            Some(tx_hash)
        };

        for log in ready {
            let mut patch = TransferLogPatch::status(TransferStatus::Done);
            if let Some(tx_hash) = tx_hash {
                patch = patch.with_tx_hash(tx_hash);
            }
            self.store.update_transfer_log(&group.id, log.index, patch).await?;
        }
        Ok(())
    }

    /// 检查授权额度后提交 transferFrom，并在等待回执之前保存交易哈希
    async fn send_transfer(&self, group: &SignatureGroup, ready: &[&TransferLog]) -> Result<TxHash> {
        let amount = U256::from(ready.iter().map(|log| log.amount as u128).sum::<u128>());
        let destination = self.registry.require(group.destination_chain_id)?;
        let spender = self
            .operator
            .operator_address()
            .ok_or_else(|| Error::Credential("No operator key configured".to_string()))?;

        let allowance = self
            .operator
            .read(
                destination.chain_id,
                ReadCall::Allowance {
                    contract: destination.token_address,
                    owner: group.user_address,
                    spender,
                },
            )
            .await?;
        if allowance < amount {
            return Err(Error::ContractCall(format!(
                "Allowance {} is below transfer amount {}",
                allowance, amount
            )));
        }

        let call = WriteCall::TransferFrom {
            contract: destination.token_address,
            from: group.user_address,
            to: group.target_address,
            amount,
        };
        let tx_hash = self
            .operator
            .write(destination.chain_id, call, Confirmation::Submit)
            .await?;

        for log in ready {
            let patch = TransferLogPatch::default().with_tx_hash(tx_hash);
            self.store.update_transfer_log(&group.id, log.index, patch).await?;
        }
        self.store.append_transaction_hash(&group.id, tx_hash).await?;
        Ok(tx_hash)
    }

    /// 按当前状态推进签名组，直到终态或无法继续
    pub async fn drive(&self, group_id: &str) -> Result<GroupStatus> {
        let mut status = self.load(group_id).await?.status;
        loop {
            let next = match status {
                GroupStatus::Signed => self.execute_signature_group(group_id).await?,
                GroupStatus::Pending => self.poll_pending(group_id).await?,
                GroupStatus::ReadyToTransfer => self.finalize(group_id).await?,
                _ => return Ok(status),
            };
            if next == status {
                return Ok(next);
            }
            status = next;
        }
    }

    /// 同一签名组同时只有一个推进任务
    pub async fn spawn_drive(self: Arc<Self>, group_id: String) -> Option<JoinHandle<()>> {
        if !self.in_flight.lock().await.insert(group_id.clone()) {
            return None;
        }

        Some(tokio::spawn(async move {
            match self.drive(&group_id).await {
                Ok(status) => info!("Signature group {} reached {:?}", group_id, status),
                Err(e) => error!("Failed to drive signature group {}: {}", group_id, e),
            }
            self.in_flight.lock().await.remove(&group_id);
        }))
    }

    pub async fn schedule_active(self: Arc<Self>) -> Vec<JoinHandle<()>> {
        let groups = match self.store.list_groups(&ACTIVE_STATUSES).await {
            Ok(groups) => groups,
            Err(e) => {
                error!("Failed to list active signature groups: {}", e);
                return Vec::new();
            }
        };

        let mut handles = Vec::new();
        for group in groups {
            if let Some(handle) = self.clone().spawn_drive(group.id).await {
                handles.push(handle);
            }
        }
        handles
    }

    /// 周期性扫描未完成的签名组，进度不依赖外部调用者
    pub async fn start(self: Arc<Self>) -> Result<()> {
        info!(
            "Starting orchestrator, scanning every {:?}",
            self.settings.scan_interval()
        );

        loop {
            let spawned = self.clone().schedule_active().await;
            if !spawned.is_empty() {
                debug!("Scheduled {} signature groups", spawned.len());
            }
            sleep(self.settings.scan_interval()).await;
        }
    }

    /// 各链上的代币余额
    pub async fn balances(&self, owner: Address) -> Vec<(u64, Result<U256>)> {
        let reads = self.registry.iter().map(|chain| async move {
            let call = ReadCall::BalanceOf {
                contract: chain.token_address,
                owner,
            };
            (chain.chain_id, self.operator.read(chain.chain_id, call).await)
        });
        join_all(reads).await
    }
}
