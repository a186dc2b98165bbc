use async_trait::async_trait;
use ethers::types::{Address, Bytes, TxHash, U256};

use crate::Result;

/// 只读合约调用
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadCall {
    BalanceOf {
        contract: Address,
        owner: Address,
    },
    Allowance {
        contract: Address,
        owner: Address,
        spender: Address,
    },
}

/// proxyDepositForBurn 的参数，签名覆盖全部源链
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DepositForBurn {
    pub contract: Address,
    pub burn_token: Address,
    pub max_fee: U256,
    pub min_finality_threshold: u32,
    pub source_chain_ids: Vec<U256>,
    pub amounts_each: Vec<U256>,
    pub nonces: Vec<U256>,
    pub expiry: U256,
    pub destination_chain_id: U256,
    pub target_address: Address,
    pub signature: Bytes,
}

/// 需要运营者签名的写调用
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteCall {
    DepositForBurn(DepositForBurn),
    ReceiveMessage {
        contract: Address,
        message: Bytes,
        attestation: Bytes,
    },
    TransferFrom {
        contract: Address,
        from: Address,
        to: Address,
        amount: U256,
    },
}

impl WriteCall {
    pub fn function_name(&self) -> &'static str {
        match self {
            WriteCall::DepositForBurn(_) => "proxyDepositForBurn",
            WriteCall::ReceiveMessage { .. } => "receiveMessage",
            WriteCall::TransferFrom { .. } => "transferFrom",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Confirmation {
    /// 广播后立即返回交易哈希
    Submit,
    /// 等待回执，回执失败视为合约调用错误
    WaitForReceipt,
}

/// 以运营者身份与具体链交互
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ChainOperator: Send + Sync {
    /// 运营者地址，未配置私钥时为 None
    fn operator_address(&self) -> Option<Address>;

    async fn read(&self, chain_id: u64, call: ReadCall) -> Result<U256>;

    async fn write(&self, chain_id: u64, call: WriteCall, confirmation: Confirmation) -> Result<TxHash>;

    /// 阻塞直到交易上链；回滚为 ContractCall，丢弃或查询失败为 Connection
    async fn wait_for_receipt(&self, chain_id: u64, tx_hash: TxHash) -> Result<()>;

    /// 已上链时返回是否成功，尚未上链为 None
    async fn receipt_status(&self, chain_id: u64, tx_hash: TxHash) -> Result<Option<bool>>;
}

pub mod evm;

pub use evm::EvmOperator;
