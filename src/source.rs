use crate::error::{WatchError, WatchResult};
use crate::events::{Transfer, TransferNotification};
use alloy::providers::{DynProvider, Provider, ProviderBuilder, WsConnect};
use alloy::rpc::types::Filter;
use alloy::sol_types::SolEvent;
use alloy_primitives::{Address, B256};
use async_trait::async_trait;
use futures::StreamExt;
use futures::future::BoxFuture;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::AbortHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Callback invoked once per observed transfer. A subscription awaits it
/// before handling the next log of the same contract.
pub type TransferHandler =
    Arc<dyn Fn(TransferNotification) -> BoxFuture<'static, ()> + Send + Sync>;

/// A live subscription. Only the event source that issued it can release it.
#[derive(Debug)]
pub struct SubscriptionHandle {
    address: Address,
    id: B256,
    task: Option<AbortHandle>,
}

impl SubscriptionHandle {
    pub fn new(address: Address, id: B256, task: Option<AbortHandle>) -> Self {
        Self { address, id, task }
    }

    pub fn address(&self) -> Address {
        self.address
    }

    pub fn id(&self) -> B256 {
        self.id
    }

    /// True once the delivery task has ended on its own, e.g. after the node
    /// dropped the subscription. Handles without a task never close.
    pub fn is_closed(&self) -> bool {
        self.task.as_ref().is_some_and(AbortHandle::is_finished)
    }

    /// Stops local delivery. Safe to call more than once.
    pub fn stop(&self) {
        if let Some(task) = &self.task {
            task.abort();
        }
    }
}

/// Chain connectivity: per-contract transfer subscriptions.
#[async_trait]
pub trait EventSource: Send + Sync {
    async fn subscribe(
        &self,
        contract: Address,
        handler: TransferHandler,
    ) -> WatchResult<SubscriptionHandle>;

    async fn unsubscribe(&self, handle: SubscriptionHandle) -> WatchResult<()>;
}

/// Event source backed by an alloy WebSocket provider.
pub struct AlloyEventSource {
    provider: DynProvider,
    url: String,
    subscribe_timeout: Duration,
}

impl AlloyEventSource {
    pub async fn connect(url: &str, subscribe_timeout: Duration) -> WatchResult<Self> {
        let ws = WsConnect::new(url);
        let provider = timeout(subscribe_timeout, ProviderBuilder::new().connect_ws(ws))
            .await
            .map_err(|_| {
                WatchError::Connection(format!(
                    "timed out after {}s connecting to {url}",
                    subscribe_timeout.as_secs()
                ))
            })?
            .map_err(WatchError::connection)?;

        info!("Connected to websocket provider {}", url);

        Ok(Self {
            provider: provider.erased(),
            url: url.to_string(),
            subscribe_timeout,
        })
    }
}

#[async_trait]
impl EventSource for AlloyEventSource {
    async fn subscribe(
        &self,
        contract: Address,
        handler: TransferHandler,
    ) -> WatchResult<SubscriptionHandle> {
        let filter = Filter::new()
            .address(contract)
            .event_signature(Transfer::SIGNATURE_HASH);

        let pending = self.provider.subscribe_logs(&filter);
        let subscription = match timeout(self.subscribe_timeout, pending).await {
            Ok(Ok(subscription)) => subscription,
            Ok(Err(e)) => {
                warn!("Subscribe failed for {:?} on {}: {}", contract, self.url, e);
                return Err(WatchError::connection(e));
            }
            Err(_) => {
                return Err(WatchError::Connection(format!(
                    "subscribe timed out after {}s on {}",
                    self.subscribe_timeout.as_secs(),
                    self.url
                )));
            }
        };

        let id = *subscription.local_id();
        let stream = subscription.into_stream();

        let task = tokio::spawn(async move {
            let mut stream = std::pin::pin!(stream);
            while let Some(log) = stream.next().await {
                match TransferNotification::from_log(&log) {
                    Ok(Some(notification)) => handler(notification).await,
                    Ok(None) => debug!(contract = ?contract, "skipping pending log"),
                    Err(e) => warn!(contract = ?contract, "Failed to decode transfer event: {}", e),
                }
            }
            warn!(contract = ?contract, "log stream closed, resubscribing on next discovery pass");
        });

        Ok(SubscriptionHandle::new(contract, id, Some(task.abort_handle())))
    }

    async fn unsubscribe(&self, handle: SubscriptionHandle) -> WatchResult<()> {
        handle.stop();
        self.provider
            .unsubscribe(handle.id())
            .await
            .map_err(WatchError::connection)
    }
}
