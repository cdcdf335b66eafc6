//! Fire-and-forget wallet risk analysis.
//!
//! Every recorded transfer triggers a lookup of the owning contract and, when
//! one is known, a call into the configured [`RiskAnalyzer`]. The analysis runs
//! on its own task; neither its latency nor its failures reach the caller.

use crate::error::{WatchError, WatchResult};
use crate::repository::ContractStore;
use alloy_primitives::Address;
use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DetectionRequest {
    #[serde(serialize_with = "serialize_address")]
    pub token_address: Address,
    #[serde(serialize_with = "serialize_address")]
    pub owner_wallet: Address,
    pub contract_creation_timestamp: i64,
}

fn serialize_address<S: serde::Serializer>(address: &Address, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(&crate::address::canonical(address))
}

/// The external risk-scoring capability. Its result is opaque to the watcher.
#[async_trait]
pub trait RiskAnalyzer: Send + Sync {
    async fn analyze(&self, request: &DetectionRequest) -> WatchResult<Value>;
}

/// Posts each request as JSON to a scoring endpoint.
pub struct HttpRiskAnalyzer {
    client: reqwest::Client,
    url: String,
}

impl HttpRiskAnalyzer {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
        }
    }
}

#[async_trait]
impl RiskAnalyzer for HttpRiskAnalyzer {
    async fn analyze(&self, request: &DetectionRequest) -> WatchResult<Value> {
        let response = self
            .client
            .post(&self.url)
            .json(request)
            .send()
            .await
            .map_err(WatchError::detection)?
            .error_for_status()
            .map_err(WatchError::detection)?;

        response.json::<Value>().await.map_err(WatchError::detection)
    }
}

/// Used when no scoring endpoint is configured.
pub struct LogOnlyAnalyzer;

#[async_trait]
impl RiskAnalyzer for LogOnlyAnalyzer {
    async fn analyze(&self, request: &DetectionRequest) -> WatchResult<Value> {
        info!(
            token = ?request.token_address,
            owner = ?request.owner_wallet,
            created_at = request.contract_creation_timestamp,
            "risk analysis requested (no analyzer configured)"
        );
        Ok(Value::Null)
    }
}

#[derive(Clone)]
pub struct DetectionDispatcher {
    contracts: Arc<dyn ContractStore>,
    analyzer: Arc<dyn RiskAnalyzer>,
    timeout: Duration,
}

impl DetectionDispatcher {
    pub fn new(
        contracts: Arc<dyn ContractStore>,
        analyzer: Arc<dyn RiskAnalyzer>,
        timeout: Duration,
    ) -> Self {
        Self {
            contracts,
            analyzer,
            timeout,
        }
    }

    /// Spawns the analysis for `token_address` and returns immediately. The
    /// handle is only useful to callers that want to wait, such as tests.
    pub fn dispatch(&self, token_address: Address) -> JoinHandle<()> {
        let dispatcher = self.clone();
        tokio::spawn(async move {
            if let Err(e) = dispatcher.run(token_address).await {
                warn!(token = ?token_address, "Detection failed: {}", e);
            }
        })
    }

    /// Builds the request from the stored contract matching either address.
    pub async fn resolve(&self, token_address: Address) -> WatchResult<Option<DetectionRequest>> {
        let contract = self.contracts.find_contract(token_address).await?;
        Ok(contract.map(|c| DetectionRequest {
            token_address,
            owner_wallet: c.owner_wallet,
            contract_creation_timestamp: c.creation_timestamp,
        }))
    }

    async fn run(&self, token_address: Address) -> WatchResult<()> {
        let Some(request) = self.resolve(token_address).await? else {
            // Contracts created moments ago may not be stored yet
            debug!(token = ?token_address, "no contract metadata, skipping detection");
            return Ok(());
        };

        let result = timeout(self.timeout, self.analyzer.analyze(&request))
            .await
            .map_err(|_| {
                WatchError::Detection(format!(
                    "analysis timed out after {}s",
                    self.timeout.as_secs()
                ))
            })??;

        debug!(token = ?token_address, result = %result, "risk analysis completed");
        Ok(())
    }
}
