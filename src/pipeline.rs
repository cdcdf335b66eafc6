use crate::detection::DetectionDispatcher;
use crate::events::TransferNotification;
use crate::recorder::TransferRecorder;
use crate::repository::TransferEvent;
use crate::source::TransferHandler;
use alloy_primitives::Address;
use futures::FutureExt;
use futures::future::BoxFuture;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Per-event processing: record, then hand off to detection.
#[derive(Clone)]
pub struct TransferPipeline {
    recorder: TransferRecorder,
    dispatcher: DetectionDispatcher,
}

impl TransferPipeline {
    pub fn new(recorder: TransferRecorder, dispatcher: DetectionDispatcher) -> Self {
        Self {
            recorder,
            dispatcher,
        }
    }

    /// Waits for the write, not for the analysis. A failed write is logged and
    /// detection still runs.
    pub async fn process(
        &self,
        token_address: Address,
        notification: TransferNotification,
    ) -> JoinHandle<()> {
        let event = TransferEvent::from_notification(token_address, &notification);

        match self.recorder.record(event).await {
            Ok(true) => info!(
                token = ?token_address,
                tx = ?notification.tx_hash,
                block = notification.block_number,
                amount = %notification.amount,
                "Recorded transfer"
            ),
            Ok(false) => {}
            Err(e) => warn!(
                token = ?token_address,
                tx = ?notification.tx_hash,
                "Failed to record transfer: {}",
                e
            ),
        }

        self.dispatcher.dispatch(token_address)
    }

    /// Callback bound to one contract, handed to the event source.
    pub fn handler_for(&self, token_address: Address) -> TransferHandler {
        let pipeline = self.clone();
        Arc::new(move |notification: TransferNotification| -> BoxFuture<'static, ()> {
            let pipeline = pipeline.clone();
            async move {
                // detection keeps running on its own task
                let _ = pipeline.process(token_address, notification).await;
            }
            .boxed()
        })
    }
}
