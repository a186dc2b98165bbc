use ethers::types::Address;
use std::collections::BTreeMap;

use crate::{config::ChainConfig, Error, Result};

/// 链元数据，运行期只读
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainMetadata {
    pub chain_id: u64,
    pub name: String,
    pub rpc_url: String,
    pub domain: u32,
    pub token_address: Address,
    pub proxy_address: Address,
    pub message_transmitter_address: Address,
}

impl From<&ChainConfig> for ChainMetadata {
    fn from(config: &ChainConfig) -> Self {
        Self {
            chain_id: config.chain_id,
            name: config.name.clone(),
            rpc_url: config.rpc_url.clone(),
            domain: config.domain,
            token_address: config.token_address,
            proxy_address: config.proxy_address,
            message_transmitter_address: config.message_transmitter_address,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ChainRegistry {
    chains: BTreeMap<u64, ChainMetadata>,
}

impl ChainRegistry {
    pub fn from_config(chains: &[ChainConfig]) -> Self {
        Self::new(chains.iter().map(ChainMetadata::from))
    }

    pub fn new(chains: impl IntoIterator<Item = ChainMetadata>) -> Self {
        Self {
            chains: chains.into_iter().map(|c| (c.chain_id, c)).collect(),
        }
    }

    pub fn get(&self, chain_id: u64) -> Option<&ChainMetadata> {
        self.chains.get(&chain_id)
    }

    /// 未注册的链视为连接错误
    pub fn require(&self, chain_id: u64) -> Result<&ChainMetadata> {
        self.get(chain_id)
            .ok_or_else(|| Error::Connection(format!("Chain {} is not registered", chain_id)))
    }

    pub fn by_domain(&self, domain: u32) -> Option<&ChainMetadata> {
        self.chains.values().find(|c| c.domain == domain)
    }

    pub fn contains(&self, chain_id: u64) -> bool {
        self.chains.contains_key(&chain_id)
    }

    pub fn chain_ids(&self) -> impl Iterator<Item = u64> + '_ {
        self.chains.keys().copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ChainMetadata> {
        self.chains.values()
    }
}
