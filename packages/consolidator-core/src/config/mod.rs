use ethers::types::Address;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use crate::Error;

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ChainConfig {
    pub chain_id: u64,
    pub name: String,
    pub rpc_url: String,
    /// 证明服务中的 domain 编号
    pub domain: u32,
    pub token_address: Address,
    /// 提供 proxyDepositForBurn 的代理合约
    pub proxy_address: Address,
    /// 提供 receiveMessage 的消息合约
    pub message_transmitter_address: Address,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct AttestationConfig {
    pub base_url: String,
    #[serde(default = "default_max_requests_per_second")]
    pub max_requests_per_second: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct OrchestratorConfig {
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_scan_interval_secs")]
    pub scan_interval_secs: u64,
    #[serde(default = "default_operator_key_env")]
    pub operator_key_env: String,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            scan_interval_secs: default_scan_interval_secs(),
            operator_key_env: default_operator_key_env(),
        }
    }
}

impl OrchestratorConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn scan_interval(&self) -> Duration {
        Duration::from_secs(self.scan_interval_secs)
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct BurnConfig {
    #[serde(default)]
    pub max_fee: u64,
    #[serde(default = "default_min_finality_threshold")]
    pub min_finality_threshold: u32,
}

impl Default for BurnConfig {
    fn default() -> Self {
        Self {
            max_fee: 0,
            min_finality_threshold: default_min_finality_threshold(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct StorageConfig {
    /// 为空时使用内存存储
    pub path: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Config {
    pub chains: Vec<ChainConfig>,
    pub attestation: AttestationConfig,
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    #[serde(default)]
    pub burn: BurnConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

fn default_max_requests_per_second() -> u32 {
    10
}

fn default_retry_delay_ms() -> u64 {
    100
}

fn default_request_timeout_secs() -> u64 {
    10
}

fn default_poll_interval_ms() -> u64 {
    3000
}

fn default_scan_interval_secs() -> u64 {
    15
}

fn default_operator_key_env() -> String {
    "OPERATOR_PRIVATE_KEY".to_string()
}

fn default_min_finality_threshold() -> u32 {
    2000
}

impl Config {
    pub fn load<P: AsRef<Path>>(config_path: P) -> Result<Self, Error> {
        let path = config_path.as_ref();
        let config_str = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Failed to read config file: {}", e)))?;

        let is_toml = path.extension().map_or(false, |ext| ext == "toml");
        let config = if is_toml {
            Self::from_toml(&config_str)?
        } else {
            Self::from_json(&config_str)?
        };

        config.validate()?;

        Ok(config)
    }

    pub fn from_json(s: &str) -> Result<Self, Error> {
        serde_json::from_str(s)
            .map_err(|e| Error::Config(format!("Failed to parse config file: {}", e)))
    }

    pub fn from_toml(s: &str) -> Result<Self, Error> {
        toml::from_str(s)
            .map_err(|e| Error::Config(format!("Failed to parse config file: {}", e)))
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.chains.is_empty() {
            return Err(Error::Config("At least one chain must be configured".to_string()));
        }

        // 链 ID 与 domain 均不可重复
        let mut chain_ids = HashSet::new();
        let mut domains = HashSet::new();
        for chain in &self.chains {
            if !chain_ids.insert(chain.chain_id) {
                return Err(Error::Config(format!("Duplicate chain ID: {}", chain.chain_id)));
            }
            if !domains.insert(chain.domain) {
                return Err(Error::Config(format!(
                    "Duplicate attestation domain {} on chain {}",
                    chain.domain, chain.chain_id
                )));
            }
            if reqwest::Url::parse(&chain.rpc_url).is_err() {
                return Err(Error::Config(format!(
                    "Invalid RPC URL for chain {}: {}",
                    chain.chain_id, chain.rpc_url
                )));
            }
        }

        if reqwest::Url::parse(&self.attestation.base_url).is_err() {
            return Err(Error::Config(format!(
                "Invalid attestation base URL: {}",
                self.attestation.base_url
            )));
        }
        if self.attestation.max_requests_per_second == 0 {
            return Err(Error::Config("Attestation rate limit must be greater than 0".to_string()));
        }
        if self.orchestrator.poll_interval_ms == 0 {
            return Err(Error::Config("Orchestrator poll interval must be greater than 0".to_string()));
        }
        if self.orchestrator.scan_interval_secs == 0 {
            return Err(Error::Config("Orchestrator scan interval must be greater than 0".to_string()));
        }

        Ok(())
    }

    pub fn get_chain_config(&self, chain_id: u64) -> Option<&ChainConfig> {
        self.chains.iter().find(|c| c.chain_id == chain_id)
    }

    /// 运营者私钥只从环境变量读取
    pub fn operator_key(&self) -> Option<String> {
        std::env::var(&self.orchestrator.operator_key_env)
            .ok()
            .filter(|key| !key.trim().is_empty())
    }
}
