use async_trait::async_trait;
use ethers::{
    abi::Detokenize,
    contract::{abigen, ContractCall, ContractError},
    middleware::{NonceManagerMiddleware, SignerMiddleware},
    providers::{Http, Middleware, PendingTransaction, Provider},
    signers::{LocalWallet, Signer},
    types::{Address, TxHash, U256, U64},
};
use log::{debug, info, warn};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use super::{ChainOperator, Confirmation, ReadCall, WriteCall};
use crate::{registry::ChainRegistry, Error, Result};

abigen!(
    ConsolidationProxy,
    r#"[
        function proxyDepositForBurn(address burnToken, uint256 maxFee, uint32 minFinalityThreshold, uint256[] sourceChainIds, uint256[] amountEach, uint256[] nonces, uint256 expiry, uint256 destinationChainId, address targetAddress, bytes signature) external
    ]"#;

    MessageTransmitter,
    r#"[
        function receiveMessage(bytes message, bytes attestation) external returns (bool)
    ]"#;

    Erc20,
    r#"[
        function balanceOf(address account) external view returns (uint256)
        function allowance(address owner, address spender) external view returns (uint256)
        function transferFrom(address from, address to, uint256 amount) external returns (bool)
    ]"#;
);

/// 每条链一个签名客户端，nonce 由 NonceManagerMiddleware 串行分配
type SignerClient = NonceManagerMiddleware<SignerMiddleware<Provider<Http>, LocalWallet>>;

pub struct EvmOperator {
    registry: Arc<ChainRegistry>,
    wallet: Option<LocalWallet>,
    signers: RwLock<HashMap<u64, Arc<SignerClient>>>,
}

impl EvmOperator {
    pub fn new(registry: Arc<ChainRegistry>, operator_key: Option<&str>) -> Result<Self> {
        let wallet = operator_key
            .map(|key| key.trim().trim_start_matches("0x").parse::<LocalWallet>())
            .transpose()
            .map_err(|e| Error::Credential(format!("Invalid operator key: {}", e)))?;

        match &wallet {
            Some(wallet) => info!("Chain operator ready, operator address {:?}", wallet.address()),
            None => warn!("No operator key configured, chain operator is read-only"),
        }

        Ok(Self {
            registry,
            wallet,
            signers: RwLock::new(HashMap::new()),
        })
    }

    fn provider(&self, chain_id: u64) -> Result<Provider<Http>> {
        let chain = self.registry.require(chain_id)?;
        Provider::<Http>::try_from(chain.rpc_url.as_str()).map_err(|e| {
            Error::Connection(format!("Invalid RPC endpoint for chain {}: {}", chain_id, e))
        })
    }

    async fn signer(&self, chain_id: u64) -> Result<Arc<SignerClient>> {
        if let Some(client) = self.signers.read().await.get(&chain_id) {
            return Ok(client.clone());
        }

        let wallet = self
            .wallet
            .clone()
            .ok_or_else(|| Error::Credential("No operator key configured".to_string()))?
            .with_chain_id(chain_id);
        let provider = self.provider(chain_id)?;
        let address = wallet.address();
        let client = Arc::new(NonceManagerMiddleware::new(
            SignerMiddleware::new(provider, wallet),
            address,
        ));

        debug!("Created signing client for chain {}", chain_id);
        let mut signers = self.signers.write().await;
        Ok(signers.entry(chain_id).or_insert(client).clone())
    }
}

async fn dispatch<D: Detokenize>(call: ContractCall<SignerClient, D>) -> Result<TxHash> {
    let pending = call.send().await.map_err(contract_error)?;
    Ok(pending.tx_hash())
}

fn succeeded(status: Option<U64>) -> bool {
    status == Some(U64::from(1u64))
}

/// 回滚与解码失败归为合约错误，其余归为连接错误
fn contract_error<M: Middleware>(err: ContractError<M>) -> Error {
    match err {
        ContractError::Revert(data) => Error::ContractCall(format!("Execution reverted: {}", data)),
        ContractError::DecodingError(e) => Error::ContractCall(e.to_string()),
        ContractError::AbiError(e) => Error::ContractCall(e.to_string()),
        ContractError::DetokenizationError(e) => Error::ContractCall(e.to_string()),
        other => {
            let message = other.to_string();
            if message.contains("revert") {
                Error::ContractCall(message)
            } else {
                Error::Connection(message)
            }
        }
    }
}

#[async_trait]
impl ChainOperator for EvmOperator {
    fn operator_address(&self) -> Option<Address> {
        self.wallet.as_ref().map(|w| w.address())
    }

    async fn read(&self, chain_id: u64, call: ReadCall) -> Result<U256> {
        let client = Arc::new(self.provider(chain_id)?);
        let result = match call {
            ReadCall::BalanceOf { contract, owner } => {
                Erc20::new(contract, client).balance_of(owner).call().await
            }
            ReadCall::Allowance { contract, owner, spender } => {
                Erc20::new(contract, client).allowance(owner, spender).call().await
            }
        };
        result.map_err(contract_error)
    }

    async fn write(&self, chain_id: u64, call: WriteCall, confirmation: Confirmation) -> Result<TxHash> {
        let client = self.signer(chain_id).await?;
        let function = call.function_name();

        let tx_hash = match call {
            WriteCall::DepositForBurn(params) => {
                let proxy = ConsolidationProxy::new(params.contract, client);
                dispatch(
                    proxy.proxy_deposit_for_burn(
                        params.burn_token,
                        params.max_fee,
                        params.min_finality_threshold,
                        params.source_chain_ids,
                        params.amounts_each,
                        params.nonces,
                        params.expiry,
                        params.destination_chain_id,
                        params.target_address,
                        params.signature,
                    ),
                )
                .await?
            }
            WriteCall::ReceiveMessage { contract, message, attestation } => {
                let transmitter = MessageTransmitter::new(contract, client);
                dispatch(transmitter.receive_message(message, attestation)).await?
            }
            WriteCall::TransferFrom { contract, from, to, amount } => {
                let token = Erc20::new(contract, client);
                dispatch(token.transfer_from(from, to, amount)).await?
            }
        };

        info!("Submitted {} on chain {}: {:?}", function, chain_id, tx_hash);
        if confirmation == Confirmation::WaitForReceipt {
            self.wait_for_receipt(chain_id, tx_hash).await?;
        }
        Ok(tx_hash)
    }

    async fn wait_for_receipt(&self, chain_id: u64, tx_hash: TxHash) -> Result<()> {
        let provider = self.provider(chain_id)?;
        let receipt = PendingTransaction::new(tx_hash, &provider)
            .await
            .map_err(|e| Error::Connection(format!("Failed to fetch receipt for {:?}: {}", tx_hash, e)))?
            .ok_or_else(|| Error::Connection(format!("Transaction {:?} was dropped", tx_hash)))?;

        if !succeeded(receipt.status) {
            return Err(Error::ContractCall(format!("Transaction {:?} reverted", tx_hash)));
        }
        debug!("Transaction {:?} confirmed on chain {}", tx_hash, chain_id);
        Ok(())
    }

    async fn receipt_status(&self, chain_id: u64, tx_hash: TxHash) -> Result<Option<bool>> {
        let provider = self.provider(chain_id)?;
        let receipt = provider
            .get_transaction_receipt(tx_hash)
            .await
            .map_err(|e| Error::Connection(format!("Failed to fetch receipt for {:?}: {}", tx_hash, e)))?;
        Ok(receipt.map(|r| succeeded(r.status)))
    }
}
