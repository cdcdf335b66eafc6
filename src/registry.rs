//! One live subscription per monitored contract.
//!
//! The registry is the only writer of the address → slot map. An enrollment
//! first reserves its address under the lock, then subscribes without holding
//! it, so a slow node never stalls lookups, removal or teardown. A reservation
//! that disappears while the subscribe is in flight means the contract was
//! removed or torn down meanwhile, and the late handle is released at once.

use crate::error::{WatchError, WatchResult};
use crate::pipeline::TransferPipeline;
use crate::repository::MonitoredContract;
use crate::source::{EventSource, SubscriptionHandle};
use alloy_primitives::Address;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_retry::strategy::{ExponentialBackoff, jitter};
use tracing::{debug, info, warn};

/// Bounded backoff applied to each subscribe attempt.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: usize,
    pub base_delay_ms: u64,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    fn strategy(&self) -> impl Iterator<Item = Duration> {
        ExponentialBackoff::from_millis(self.base_delay_ms)
            .factor(2)
            .max_delay(self.max_delay)
            .map(jitter)
            .take(self.max_retries)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 250,
            max_delay: Duration::from_secs(5),
        }
    }
}

enum Slot {
    /// Reserved by the enrollment holding this ticket.
    Pending(u64),
    Live(SubscriptionHandle),
}

impl Slot {
    fn live(&self) -> Option<&SubscriptionHandle> {
        match self {
            Slot::Live(handle) if !handle.is_closed() => Some(handle),
            _ => None,
        }
    }
}

pub struct ListenerRegistry {
    source: Arc<dyn EventSource>,
    pipeline: TransferPipeline,
    retry: RetryPolicy,
    subscriptions: Mutex<HashMap<Address, Slot>>,
    next_ticket: AtomicU64,
}

impl ListenerRegistry {
    pub fn new(
        source: Arc<dyn EventSource>,
        pipeline: TransferPipeline,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            source,
            pipeline,
            retry,
            subscriptions: Mutex::new(HashMap::new()),
            next_ticket: AtomicU64::new(0),
        }
    }

    /// Subscribes to every deployed contract not already active and returns
    /// how many new subscriptions were opened. Failures are logged per contract.
    pub async fn enroll_all(&self, contracts: &[MonitoredContract]) -> usize {
        let mut activated = 0;

        for contract in contracts {
            match self.enroll(contract).await {
                Ok(true) => activated += 1,
                Ok(false) => {}
                Err(WatchError::AlreadyActive(address)) => {
                    debug!(contract = ?address, "already subscribed, skipping");
                }
                Err(e) => warn!(
                    contract = ?contract.address,
                    name = %contract.display_name,
                    "Failed to subscribe: {}",
                    e
                ),
            }
        }

        info!(
            "Enrolled {} of {} contracts ({} active)",
            activated,
            contracts.len(),
            self.active_count().await
        );
        activated
    }

    /// Returns `Ok(false)` for an undeployed contract (zero address), which is
    /// never subscribed, and when the contract was removed while the
    /// subscribe was in flight. A subscription whose stream has closed is
    /// replaced.
    pub async fn enroll(&self, contract: &MonitoredContract) -> WatchResult<bool> {
        if !contract.is_deployed() {
            debug!(name = %contract.display_name, "contract not deployed yet, skipping");
            return Ok(false);
        }

        let address = contract.address;
        let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);
        let stale = {
            let mut subscriptions = self.subscriptions.lock().await;
            let closed = match subscriptions.get(&address) {
                None => false,
                Some(Slot::Live(handle)) if handle.is_closed() => true,
                Some(_) => return Err(WatchError::AlreadyActive(address)),
            };
            let previous = subscriptions.insert(address, Slot::Pending(ticket));
            match previous {
                Some(Slot::Live(handle)) if closed => Some(handle),
                _ => None,
            }
        };

        if let Some(handle) = stale {
            debug!(contract = ?address, "replacing closed subscription");
            self.release(handle).await;
        }

        let result = self.subscribe_with_retry(address).await;

        let mut subscriptions = self.subscriptions.lock().await;
        let reserved =
            matches!(subscriptions.get(&address), Some(Slot::Pending(t)) if *t == ticket);
        match result {
            Ok(handle) if reserved => {
                subscriptions.insert(address, Slot::Live(handle));
                drop(subscriptions);
                info!(
                    contract = ?address,
                    name = %contract.display_name,
                    "Subscribed to transfers"
                );
                Ok(true)
            }
            Ok(handle) => {
                drop(subscriptions);
                debug!(contract = ?address, "removed while subscribing, releasing");
                self.release(handle).await;
                Ok(false)
            }
            Err(e) => {
                if reserved {
                    subscriptions.remove(&address);
                }
                Err(e)
            }
        }
    }

    /// Explicit unwatch. The entry is dropped even when the source fails to
    /// release it; that failure is still returned.
    pub async fn remove(&self, address: Address) -> WatchResult<bool> {
        let slot = self.subscriptions.lock().await.remove(&address);
        let handle = match slot {
            None => return Ok(false),
            // the in-flight enrollment releases its own handle
            Some(Slot::Pending(_)) => return Ok(true),
            Some(Slot::Live(handle)) => handle,
        };

        self.source.unsubscribe(handle).await?;
        info!(contract = ?address, "Unsubscribed from transfers");
        Ok(true)
    }

    /// Releases every subscription and returns how many were released
    /// cleanly. The map is always empty afterwards.
    pub async fn teardown_all(&self) -> usize {
        let handles: Vec<SubscriptionHandle> = self
            .subscriptions
            .lock()
            .await
            .drain()
            .filter_map(|(_, slot)| match slot {
                Slot::Live(handle) => Some(handle),
                Slot::Pending(_) => None,
            })
            .collect();
        let total = handles.len();
        let mut released = 0;

        for handle in handles {
            let address = handle.address();
            match self.source.unsubscribe(handle).await {
                Ok(()) => released += 1,
                Err(e) => warn!(contract = ?address, "Failed to unsubscribe: {}", e),
            }
        }

        info!("Released {} of {} subscriptions", released, total);
        released
    }

    /// Drops subscriptions whose log stream has ended so the next enrollment
    /// opens a fresh one. Returns how many were dropped.
    pub async fn reap_closed(&self) -> usize {
        let closed: Vec<SubscriptionHandle> = {
            let mut subscriptions = self.subscriptions.lock().await;
            let addresses: Vec<Address> = subscriptions
                .iter()
                .filter(|(_, slot)| matches!(slot, Slot::Live(h) if h.is_closed()))
                .map(|(address, _)| *address)
                .collect();
            addresses
                .iter()
                .filter_map(|address| match subscriptions.remove(address) {
                    Some(Slot::Live(handle)) => Some(handle),
                    _ => None,
                })
                .collect()
        };

        let count = closed.len();
        for handle in closed {
            warn!(contract = ?handle.address(), "Dropping closed subscription");
            self.release(handle).await;
        }
        count
    }

    pub async fn active_count(&self) -> usize {
        self.subscriptions
            .lock()
            .await
            .values()
            .filter(|slot| slot.live().is_some())
            .count()
    }

    pub async fn is_active(&self, address: Address) -> bool {
        self.subscriptions
            .lock()
            .await
            .get(&address)
            .is_some_and(|slot| slot.live().is_some())
    }

    /// Sorted for stable output.
    pub async fn active_addresses(&self) -> Vec<Address> {
        let mut addresses: Vec<Address> = self
            .subscriptions
            .lock()
            .await
            .values()
            .filter_map(Slot::live)
            .map(SubscriptionHandle::address)
            .collect();
        addresses.sort();
        addresses
    }

    /// Best-effort unsubscribe for handles that are no longer tracked.
    async fn release(&self, handle: SubscriptionHandle) {
        let address = handle.address();
        if let Err(e) = self.source.unsubscribe(handle).await {
            debug!(contract = ?address, "Unsubscribe of untracked handle failed: {}", e);
        }
    }

    async fn subscribe_with_retry(&self, address: Address) -> WatchResult<SubscriptionHandle> {
        let handler = self.pipeline.handler_for(address);
        let mut delays = self.retry.strategy();
        let mut attempt = 1usize;

        loop {
            match self.source.subscribe(address, handler.clone()).await {
                Ok(handle) => return Ok(handle),
                Err(e) => {
                    let Some(delay) = delays.next() else {
                        return Err(e);
                    };
                    debug!(
                        contract = ?address,
                        attempt,
                        "subscribe failed, retrying in {:?}: {}",
                        delay,
                        e
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::{DetectionDispatcher, LogOnlyAnalyzer};
    use crate::events::TransferNotification;
    use crate::recorder::TransferRecorder;
    use crate::repository::Database;
    use crate::source::TransferHandler;
    use alloy_primitives::{B256, U256, address, b256};
    use async_trait::async_trait;
    use std::collections::HashSet;
    use std::sync::Mutex as StdMutex;
    use std::sync::atomic::{AtomicBool, AtomicUsize};

    #[derive(Default)]
    struct MockSource {
        next_id: AtomicU64,
        subscribe_calls: AtomicUsize,
        handlers: StdMutex<HashMap<Address, TransferHandler>>,
        unreachable: StdMutex<HashSet<Address>>,
        // number of subscribe calls that fail before one succeeds
        flaky: AtomicUsize,
        fail_unsubscribe: StdMutex<HashSet<Address>>,
        // how long each subscribe takes to be acknowledged
        delay_ms: AtomicU64,
        // streams end right after the subscribe is acknowledged
        short_lived: AtomicBool,
    }

    impl MockSource {
        fn live(&self) -> HashSet<Address> {
            self.handlers.lock().unwrap().keys().copied().collect()
        }

        async fn deliver(&self, address: Address, notification: TransferNotification) {
            let handler = self.handlers.lock().unwrap().get(&address).cloned();
            if let Some(handler) = handler {
                handler(notification).await;
            }
        }
    }

    #[async_trait]
    impl EventSource for MockSource {
        async fn subscribe(
            &self,
            contract: Address,
            handler: TransferHandler,
        ) -> WatchResult<SubscriptionHandle> {
            self.subscribe_calls.fetch_add(1, Ordering::SeqCst);
            let delay = self.delay_ms.load(Ordering::SeqCst);
            if delay > 0 {
                tokio::time::sleep(Duration::from_millis(delay)).await;
            }
            if self.unreachable.lock().unwrap().contains(&contract) {
                return Err(WatchError::connection("provider unreachable"));
            }
            if self
                .flaky
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(WatchError::connection("transient failure"));
            }
            self.handlers.lock().unwrap().insert(contract, handler);
            let id = B256::with_last_byte(self.next_id.fetch_add(1, Ordering::SeqCst) as u8);
            let task = self
                .short_lived
                .load(Ordering::SeqCst)
                .then(|| tokio::spawn(async {}).abort_handle());
            Ok(SubscriptionHandle::new(contract, id, task))
        }

        async fn unsubscribe(&self, handle: SubscriptionHandle) -> WatchResult<()> {
            self.handlers.lock().unwrap().remove(&handle.address());
            if self.fail_unsubscribe.lock().unwrap().contains(&handle.address()) {
                return Err(WatchError::connection("socket already closed"));
            }
            Ok(())
        }
    }

    const A: Address = address!("a000000000000000000000000000000000000001");
    const B: Address = address!("b000000000000000000000000000000000000002");
    const C: Address = address!("c000000000000000000000000000000000000003");

    fn contract(address: Address) -> MonitoredContract {
        MonitoredContract {
            address,
            display_name: format!("{address:?}"),
            creation_timestamp: 1_700_000_000,
            owner_wallet: address!("00000000000000000000000000000000000000aa"),
            bonding_address: None,
        }
    }

    fn registry(source: Arc<MockSource>, db: &Database, retry: RetryPolicy) -> ListenerRegistry {
        let pipeline = TransferPipeline::new(
            TransferRecorder::new(Arc::new(db.clone())),
            DetectionDispatcher::new(
                Arc::new(db.clone()),
                Arc::new(LogOnlyAnalyzer),
                Duration::from_secs(5),
            ),
        );
        ListenerRegistry::new(source, pipeline, retry)
    }

    async fn wait_for_close(registry: &ListenerRegistry, address: Address) {
        for _ in 0..100 {
            if !registry.is_active(address).await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("stream for {address:?} never closed");
    }

    #[tokio::test]
    async fn enroll_all_skips_zero_address_in_any_order() {
        let db = Database::in_memory().unwrap();
        let source = Arc::new(MockSource::default());
        let registry = registry(source.clone(), &db, RetryPolicy::none());

        let contracts = vec![contract(B), contract(Address::ZERO), contract(A)];
        assert_eq!(registry.enroll_all(&contracts).await, 2);
        assert_eq!(registry.active_addresses().await, vec![A, B]);
        assert_eq!(source.live(), HashSet::from([A, B]));
        assert_eq!(source.subscribe_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn enroll_twice_reports_already_active() {
        let db = Database::in_memory().unwrap();
        let source = Arc::new(MockSource::default());
        let registry = registry(source.clone(), &db, RetryPolicy::none());

        assert!(registry.enroll(&contract(A)).await.unwrap());
        let second = registry.enroll(&contract(A)).await;

        assert!(matches!(second, Err(WatchError::AlreadyActive(addr)) if addr == A));
        assert_eq!(registry.active_count().await, 1);
        assert_eq!(source.subscribe_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn enroll_zero_address_is_a_no_op() {
        let db = Database::in_memory().unwrap();
        let source = Arc::new(MockSource::default());
        let registry = registry(source.clone(), &db, RetryPolicy::none());

        assert!(!registry.enroll(&contract(Address::ZERO)).await.unwrap());
        assert_eq!(registry.active_count().await, 0);
        assert_eq!(source.subscribe_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn one_unreachable_contract_does_not_abort_the_rest() {
        let db = Database::in_memory().unwrap();
        let source = Arc::new(MockSource::default());
        source.unreachable.lock().unwrap().insert(B);
        let registry = registry(source.clone(), &db, RetryPolicy::none());

        let activated = registry
            .enroll_all(&[contract(A), contract(B), contract(C)])
            .await;

        assert_eq!(activated, 2);
        assert!(registry.is_active(A).await);
        assert!(!registry.is_active(B).await);
        assert!(registry.is_active(C).await);
    }

    #[tokio::test]
    async fn single_enroll_propagates_connection_error() {
        let db = Database::in_memory().unwrap();
        let source = Arc::new(MockSource::default());
        source.unreachable.lock().unwrap().insert(A);
        let registry = registry(source.clone(), &db, RetryPolicy::none());

        assert!(matches!(
            registry.enroll(&contract(A)).await,
            Err(WatchError::Connection(_))
        ));
        assert_eq!(registry.active_count().await, 0);
    }

    #[tokio::test]
    async fn transient_subscribe_failures_are_retried_within_bounds() {
        let db = Database::in_memory().unwrap();
        let source = Arc::new(MockSource::default());
        source.flaky.store(2, Ordering::SeqCst);
        let retry = RetryPolicy {
            max_retries: 2,
            base_delay_ms: 1,
            max_delay: Duration::from_millis(5),
        };
        let registry = registry(source.clone(), &db, retry);

        assert!(registry.enroll(&contract(A)).await.unwrap());
        assert_eq!(source.subscribe_calls.load(Ordering::SeqCst), 3);

        // persistent failure gives up after max_retries + 1 attempts
        source.unreachable.lock().unwrap().insert(B);
        assert!(registry.enroll(&contract(B)).await.is_err());
        assert_eq!(source.subscribe_calls.load(Ordering::SeqCst), 6);
    }

    #[tokio::test]
    async fn teardown_then_enroll_restores_the_same_set() {
        let db = Database::in_memory().unwrap();
        let source = Arc::new(MockSource::default());
        let registry = registry(source.clone(), &db, RetryPolicy::none());
        let contracts = vec![contract(A), contract(B), contract(Address::ZERO)];

        registry.enroll_all(&contracts).await;
        let before = registry.active_addresses().await;

        assert_eq!(registry.teardown_all().await, 2);
        assert_eq!(registry.active_count().await, 0);
        assert!(source.live().is_empty());

        assert_eq!(registry.enroll_all(&contracts).await, 2);
        assert_eq!(registry.active_addresses().await, before);
        assert_eq!(source.live(), HashSet::from([A, B]));
    }

    #[tokio::test]
    async fn teardown_empties_map_despite_unsubscribe_failures() {
        let db = Database::in_memory().unwrap();
        let source = Arc::new(MockSource::default());
        source.fail_unsubscribe.lock().unwrap().insert(A);
        let registry = registry(source.clone(), &db, RetryPolicy::none());

        registry.enroll_all(&[contract(A), contract(B)]).await;

        assert_eq!(registry.teardown_all().await, 1);
        assert_eq!(registry.active_count().await, 0);
    }

    #[tokio::test]
    async fn remove_unwatches_a_single_contract() {
        let db = Database::in_memory().unwrap();
        let source = Arc::new(MockSource::default());
        let registry = registry(source.clone(), &db, RetryPolicy::none());

        registry.enroll_all(&[contract(A), contract(B)]).await;

        assert!(registry.remove(A).await.unwrap());
        assert!(!registry.remove(A).await.unwrap());
        assert_eq!(registry.active_addresses().await, vec![B]);
        assert_eq!(source.live(), HashSet::from([B]));

        // can be watched again afterwards
        assert!(registry.enroll(&contract(A)).await.unwrap());
    }

    #[tokio::test]
    async fn delivered_transfer_is_recorded_only_for_its_contract() {
        let db = Database::in_memory().unwrap();
        let source = Arc::new(MockSource::default());
        let registry = registry(source.clone(), &db, RetryPolicy::none());
        registry.enroll_all(&[contract(A), contract(B)]).await;

        let notification = TransferNotification {
            from: address!("00000000000000000000000000000000000000f1"),
            to: address!("00000000000000000000000000000000000000f2"),
            amount: U256::from(1_000_000_000_000_000_000u64),
            tx_hash: b256!("0abc000000000000000000000000000000000000000000000000000000000000"),
            block_number: 100,
            block_timestamp: None,
        };
        source.deliver(A, notification.clone()).await;
        source.deliver(A, notification).await;

        let stored = db.recent_transfers(A, 10).await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].amount, "1000000000000000000");
        assert_eq!(db.transfer_count(B).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn concurrent_enrollment_of_one_address_subscribes_once() {
        let db = Database::in_memory().unwrap();
        let source = Arc::new(MockSource::default());
        let registry = Arc::new(registry(source.clone(), &db, RetryPolicy::none()));

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let registry = registry.clone();
                tokio::spawn(async move { registry.enroll(&contract(A)).await })
            })
            .collect();

        let mut activated = 0;
        for task in tasks {
            if let Ok(true) = task.await.unwrap() {
                activated += 1;
            }
        }

        assert_eq!(activated, 1);
        assert_eq!(registry.active_count().await, 1);
        assert_eq!(source.subscribe_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn closed_stream_is_replaced_on_next_enroll() {
        let db = Database::in_memory().unwrap();
        let source = Arc::new(MockSource::default());
        source.short_lived.store(true, Ordering::SeqCst);
        let registry = registry(source.clone(), &db, RetryPolicy::none());

        assert!(registry.enroll(&contract(A)).await.unwrap());
        wait_for_close(&registry, A).await;
        assert_eq!(registry.active_count().await, 0);
        assert!(registry.active_addresses().await.is_empty());

        source.short_lived.store(false, Ordering::SeqCst);
        assert!(registry.enroll(&contract(A)).await.unwrap());
        assert!(registry.is_active(A).await);
        assert_eq!(source.subscribe_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn reap_closed_drops_only_ended_streams() {
        let db = Database::in_memory().unwrap();
        let source = Arc::new(MockSource::default());
        let registry = registry(source.clone(), &db, RetryPolicy::none());

        registry.enroll(&contract(A)).await.unwrap();
        source.short_lived.store(true, Ordering::SeqCst);
        registry.enroll(&contract(B)).await.unwrap();
        wait_for_close(&registry, B).await;

        assert_eq!(registry.reap_closed().await, 1);
        assert_eq!(registry.reap_closed().await, 0);
        assert_eq!(registry.active_addresses().await, vec![A]);
        assert_eq!(source.live(), HashSet::from([A]));
    }

    #[tokio::test]
    async fn lookups_do_not_wait_for_a_slow_subscribe() {
        let db = Database::in_memory().unwrap();
        let source = Arc::new(MockSource::default());
        source.delay_ms.store(300, Ordering::SeqCst);
        let registry = Arc::new(registry(source.clone(), &db, RetryPolicy::none()));

        let pending = {
            let registry = registry.clone();
            tokio::spawn(async move { registry.enroll(&contract(A)).await })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;

        let quick = Duration::from_millis(100);
        assert_eq!(tokio::time::timeout(quick, registry.active_count()).await.unwrap(), 0);
        assert!(!tokio::time::timeout(quick, registry.is_active(A)).await.unwrap());
        // the reservation still rejects a second enrollment
        assert!(matches!(
            tokio::time::timeout(quick, registry.enroll(&contract(A))).await.unwrap(),
            Err(WatchError::AlreadyActive(addr)) if addr == A
        ));

        assert!(pending.await.unwrap().unwrap());
        assert!(registry.is_active(A).await);
        assert_eq!(source.subscribe_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn teardown_during_subscribe_releases_the_late_handle() {
        let db = Database::in_memory().unwrap();
        let source = Arc::new(MockSource::default());
        source.delay_ms.store(200, Ordering::SeqCst);
        let registry = Arc::new(registry(source.clone(), &db, RetryPolicy::none()));

        let pending = {
            let registry = registry.clone();
            tokio::spawn(async move { registry.enroll(&contract(A)).await })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;

        let released =
            tokio::time::timeout(Duration::from_millis(100), registry.teardown_all()).await;
        assert_eq!(released.unwrap(), 0);

        assert!(!pending.await.unwrap().unwrap());
        assert_eq!(registry.active_count().await, 0);
        assert!(source.live().is_empty());
    }
}
