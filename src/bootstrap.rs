use crate::error::WatchResult;
use crate::registry::ListenerRegistry;
use crate::repository::ContractStore;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{info, warn};

/// Loads every stored contract and subscribes to the deployed ones.
pub async fn seed_registry(
    store: &dyn ContractStore,
    registry: &ListenerRegistry,
) -> WatchResult<usize> {
    let contracts = store.query_contracts().await?;
    let deployed = contracts.iter().filter(|c| c.is_deployed()).count();
    info!(
        "Found {} known contracts ({} deployed)",
        contracts.len(),
        deployed
    );

    Ok(registry.enroll_all(&contracts).await)
}

/// One discovery pass: enroll contracts that appeared or got deployed since the
/// last pass, resubscribe those whose log stream ended and unwatch the ones no
/// longer in storage. Returns `(enrolled, removed)`.
pub async fn sync_once(
    store: &dyn ContractStore,
    registry: &ListenerRegistry,
) -> WatchResult<(usize, usize)> {
    let contracts = store.query_contracts().await?;

    let closed = registry.reap_closed().await;
    if closed > 0 {
        info!("Resubscribing {} contracts with closed streams", closed);
    }

    let mut fresh = Vec::new();
    for contract in contracts.iter().filter(|c| c.is_deployed()) {
        if !registry.is_active(contract.address).await {
            fresh.push(contract.clone());
        }
    }
    let enrolled = if fresh.is_empty() {
        0
    } else {
        registry.enroll_all(&fresh).await
    };

    let known: HashSet<_> = contracts.iter().map(|c| c.address).collect();
    let mut removed = 0;
    for address in registry.active_addresses().await {
        if known.contains(&address) {
            continue;
        }
        match registry.remove(address).await {
            Ok(true) => removed += 1,
            Ok(false) => {}
            Err(e) => {
                // the entry is gone from the registry either way
                removed += 1;
                warn!(contract = ?address, "Unsubscribe after removal failed: {}", e);
            }
        }
    }

    Ok((enrolled, removed))
}

/// Re-syncs the registry with storage every `every` until `shutdown` flips to
/// true or its sender is dropped. A zero period is raised to one millisecond.
pub async fn run_discovery(
    store: Arc<dyn ContractStore>,
    registry: Arc<ListenerRegistry>,
    every: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = interval(every.max(Duration::from_millis(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // the first tick fires immediately and bootstrap already covered it
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match sync_once(store.as_ref(), &registry).await {
                    Ok((0, 0)) => {}
                    Ok((enrolled, removed)) => info!(
                        "Discovery enrolled {} and removed {} contracts",
                        enrolled, removed
                    ),
                    Err(e) => warn!("Discovery query failed, retrying next tick: {}", e),
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    info!("Discovery stopped");
                    return;
                }
            }
        }
    }
}
