use crate::error::{WatchError, WatchResult};
use rusqlite::Connection;
use std::sync::{Arc, Mutex, MutexGuard};

/// Shared SQLite handle. Clones point at the same connection.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    pub fn new(db_path: &str) -> WatchResult<Self> {
        let db_path = db_path.strip_prefix("sqlite:").unwrap_or(db_path);
        let conn = Connection::open(db_path)?;

        let db = Database {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.create_tables()?;
        Ok(db)
    }

    pub fn in_memory() -> WatchResult<Self> {
        Self::new(":memory:")
    }

    pub fn lock(&self) -> WatchResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| WatchError::storage("database mutex poisoned"))
    }

    fn create_tables(&self) -> WatchResult<()> {
        let conn = self.lock()?;

        // A NULL address marks a contract that is not deployed yet. Rows may be
        // written by other services in checksummed case, so address columns
        // compare case-insensitively.
        conn.execute(
            "CREATE TABLE IF NOT EXISTS contracts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                address TEXT COLLATE NOCASE UNIQUE,
                bonding_address TEXT COLLATE NOCASE,
                display_name TEXT NOT NULL,
                owner_wallet TEXT NOT NULL,
                creation_timestamp INTEGER NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS transfers (
                transaction_hash TEXT NOT NULL,
                token_address TEXT NOT NULL COLLATE NOCASE,
                from_address TEXT NOT NULL,
                to_address TEXT NOT NULL,
                amount TEXT NOT NULL,
                block_number INTEGER NOT NULL,
                observed_at INTEGER NOT NULL,
                PRIMARY KEY (transaction_hash, token_address)
            )",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_contracts_bonding
             ON contracts(bonding_address)",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_transfers_token
             ON transfers(token_address)",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_transfers_block_number
             ON transfers(block_number)",
            [],
        )?;

        Ok(())
    }
}
