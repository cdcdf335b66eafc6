use super::{ContractRepository, Database, MonitoredContract, TransferEvent, TransferRepository};
use crate::error::WatchResult;
use alloy_primitives::Address;
use async_trait::async_trait;

/// Durable sink for observed transfers.
#[async_trait]
pub trait TransferStore: Send + Sync {
    /// Insert-or-ignore on `(transaction_hash, token_address)`. Returns true
    /// when a new record was written.
    async fn upsert_transfer(&self, event: TransferEvent) -> WatchResult<bool>;
}

/// Source of the contracts to watch and of their owner metadata.
#[async_trait]
pub trait ContractStore: Send + Sync {
    async fn query_contracts(&self) -> WatchResult<Vec<MonitoredContract>>;
    /// Matches either the primary or the bonding address.
    async fn find_contract(&self, address: Address) -> WatchResult<Option<MonitoredContract>>;
}

impl Database {
    // rusqlite is blocking, so every call hops onto the blocking pool
    async fn run_blocking<T, F>(&self, f: F) -> WatchResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&rusqlite::Connection) -> rusqlite::Result<T> + Send + 'static,
    {
        let db = self.clone();
        tokio::task::spawn_blocking(move || {
            let conn = db.lock()?;
            Ok(f(&conn)?)
        })
        .await?
    }

    pub async fn insert_contract(&self, contract: MonitoredContract) -> WatchResult<bool> {
        self.run_blocking(move |conn| ContractRepository::new(conn).insert(&contract))
            .await
    }

    pub async fn remove_contract(&self, address: Address) -> WatchResult<bool> {
        self.run_blocking(move |conn| ContractRepository::new(conn).remove(&address))
            .await
    }

    pub async fn transfer_count(&self, token: Address) -> WatchResult<usize> {
        self.run_blocking(move |conn| TransferRepository::new(conn).count_for_token(&token))
            .await
    }

    pub async fn recent_transfers(
        &self,
        token: Address,
        limit: usize,
    ) -> WatchResult<Vec<TransferEvent>> {
        self.run_blocking(move |conn| TransferRepository::new(conn).list_for_token(&token, limit))
            .await
    }
}

#[async_trait]
impl TransferStore for Database {
    async fn upsert_transfer(&self, event: TransferEvent) -> WatchResult<bool> {
        self.run_blocking(move |conn| TransferRepository::new(conn).insert(&event))
            .await
    }
}

#[async_trait]
impl ContractStore for Database {
    async fn query_contracts(&self) -> WatchResult<Vec<MonitoredContract>> {
        self.run_blocking(|conn| ContractRepository::new(conn).all())
            .await
    }

    async fn find_contract(&self, address: Address) -> WatchResult<Option<MonitoredContract>> {
        self.run_blocking(move |conn| {
            ContractRepository::new(conn).find_by_either_address(&address)
        })
        .await
    }
}
