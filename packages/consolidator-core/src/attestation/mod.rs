use async_trait::async_trait;
use ethers::types::{Bytes, TxHash};
use log::{debug, warn};
use reqwest::StatusCode;
use serde::Deserialize;
use std::time::Duration;

use crate::{config::AttestationConfig, Error, Result};

pub mod rate_limiter;

pub use rate_limiter::RateLimiter;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttestationStatus {
    Pending,
    Complete,
    Failed,
}

impl AttestationStatus {
    /// 上游状态词表归并：processing 等中间态一律视为 pending
    fn from_upstream(status: &str) -> Self {
        match status.to_ascii_lowercase().as_str() {
            "pending" | "processing" | "pending_confirmations" => AttestationStatus::Pending,
            "complete" | "confirmed" => AttestationStatus::Complete,
            "failed" => AttestationStatus::Failed,
            other => {
                warn!("Unknown attestation status '{}', treating as pending", other);
                AttestationStatus::Pending
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttestationResult {
    pub status: AttestationStatus,
    pub message: Option<Bytes>,
    pub attestation: Option<Bytes>,
}

impl AttestationResult {
    pub fn pending() -> Self {
        Self {
            status: AttestationStatus::Pending,
            message: None,
            attestation: None,
        }
    }

    pub fn complete(message: Bytes, attestation: Bytes) -> Self {
        Self {
            status: AttestationStatus::Complete,
            message: Some(message),
            attestation: Some(attestation),
        }
    }

    pub fn failed() -> Self {
        Self {
            status: AttestationStatus::Failed,
            message: None,
            attestation: None,
        }
    }

    /// 完成且 message 与 attestation 都已返回，才可以提交 receiveMessage
    pub fn ready(self) -> Option<(Bytes, Bytes)> {
        match (self.status, self.message, self.attestation) {
            (AttestationStatus::Complete, Some(message), Some(attestation)) => Some((message, attestation)),
            _ => None,
        }
    }
}

/// 查询 burn 交易的证明状态
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AttestationSource: Send + Sync {
    /// 限流或网络失败返回可重试的错误（见 `Error::is_transient`）
    async fn get_status(&self, domain: u32, tx_hash: TxHash) -> Result<AttestationResult>;
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    messages: Vec<UpstreamMessage>,
}

#[derive(Debug, Deserialize)]
struct UpstreamMessage {
    status: String,
    #[serde(default)]
    attestation: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

pub struct AttestationClient {
    http: reqwest::Client,
    base_url: String,
    limiter: RateLimiter,
}

impl AttestationClient {
    pub fn new(config: &AttestationConfig) -> Result<Self> {
        let limiter = RateLimiter::new(
            config.max_requests_per_second,
            Duration::from_secs(1),
            Duration::from_millis(config.retry_delay_ms),
        );
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| Error::Config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            limiter,
        })
    }

    fn parse(body: MessagesResponse) -> Result<AttestationResult> {
        let Some(upstream) = body.messages.into_iter().next() else {
            return Ok(AttestationResult::pending());
        };

        Ok(AttestationResult {
            status: AttestationStatus::from_upstream(&upstream.status),
            message: decode_field(upstream.message.as_deref())?,
            attestation: decode_field(upstream.attestation.as_deref())?,
        })
    }
}

/// 空值、"0x" 以及占位的 "PENDING" 都视为尚未返回
fn decode_field(value: Option<&str>) -> Result<Option<Bytes>> {
    let Some(value) = value.map(str::trim) else {
        return Ok(None);
    };
    if value.is_empty() || value == "0x" || value.eq_ignore_ascii_case("pending") {
        return Ok(None);
    }
    hex::decode(value.trim_start_matches("0x"))
        .map(|bytes| Some(Bytes::from(bytes)))
        .map_err(|e| Error::AttestationTransient(format!("Malformed hex field: {}", e)))
}

#[async_trait]
impl AttestationSource for AttestationClient {
    async fn get_status(&self, domain: u32, tx_hash: TxHash) -> Result<AttestationResult> {
        if !self.limiter.acquire().await {
            return Err(Error::RateLimited(format!(
                "Attestation lookup for {:?} exceeds {} requests per second",
                tx_hash,
                self.limiter.capacity()
            )));
        }

        let url = format!("{}/{}", self.base_url, domain);
        debug!("Querying attestation for {:?} on domain {}", tx_hash, domain);
        let response = self
            .http
            .get(&url)
            .query(&[("transactionHash", format!("{:?}", tx_hash))])
            .send()
            .await
            .map_err(|e| Error::AttestationTransient(e.to_string()))?;

        // 交易尚未被证明服务索引
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(AttestationResult::pending());
        }
        if !response.status().is_success() {
            return Err(Error::AttestationTransient(format!(
                "Attestation service returned HTTP {}",
                response.status()
            )));
        }

        let body: MessagesResponse = response
            .json()
            .await
            .map_err(|e| Error::AttestationTransient(format!("Failed to parse response: {}", e)))?;

        Self::parse(body)
    }
}
