use crate::error::WatchResult;
use crate::events::TransferNotification;
use crate::repository::{TransferEvent, TransferStore};
use alloy_primitives::Address;
use chrono::Utc;
use std::sync::Arc;
use tracing::debug;

impl TransferEvent {
    /// Falls back to the detection time when the source has no block timestamp.
    pub fn from_notification(token_address: Address, notification: &TransferNotification) -> Self {
        let observed_at = notification
            .block_timestamp
            .and_then(|ts| i64::try_from(ts).ok())
            .unwrap_or_else(|| Utc::now().timestamp());

        TransferEvent {
            token_address,
            from_address: notification.from,
            to_address: notification.to,
            amount: notification.amount.to_string(),
            transaction_hash: notification.tx_hash,
            block_number: notification.block_number,
            observed_at,
        }
    }
}

/// Persists transfers. Redelivery of a stored event is a no-op.
#[derive(Clone)]
pub struct TransferRecorder {
    store: Arc<dyn TransferStore>,
}

impl TransferRecorder {
    pub fn new(store: Arc<dyn TransferStore>) -> Self {
        Self { store }
    }

    /// Returns false when the event was already recorded.
    pub async fn record(&self, event: TransferEvent) -> WatchResult<bool> {
        let token = event.token_address;
        let tx_hash = event.transaction_hash;
        let inserted = self.store.upsert_transfer(event).await?;
        if !inserted {
            debug!(token = ?token, tx = ?tx_hash, "duplicate transfer ignored");
        }
        Ok(inserted)
    }
}
