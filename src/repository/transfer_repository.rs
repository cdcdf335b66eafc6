use super::models::TransferEvent;
use crate::address;
use alloy_primitives::{Address, B256};
use rusqlite::{Row, params};

pub struct TransferRepository<'a> {
    conn: &'a rusqlite::Connection,
}

impl<'a> TransferRepository<'a> {
    // Redelivered events hit the (transaction_hash, token_address) key and are ignored
    const INSERT_TRANSFER: &'static str = "INSERT OR IGNORE INTO transfers (
            transaction_hash, token_address, from_address, to_address,
            amount, block_number, observed_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)";

    const SELECT_TRANSFER: &'static str = "SELECT transaction_hash, token_address, from_address, to_address, amount, block_number, observed_at FROM transfers";

    const COUNT_FOR_TOKEN: &'static str =
        "SELECT COUNT(*) FROM transfers WHERE token_address = ?1";

    pub fn new(conn: &'a rusqlite::Connection) -> Self {
        Self { conn }
    }

    /// Returns true when a new row was written.
    pub fn insert(&self, transfer: &TransferEvent) -> rusqlite::Result<bool> {
        let inserted = self.conn.execute(
            Self::INSERT_TRANSFER,
            params![
                format!("{:?}", transfer.transaction_hash),
                address::canonical(&transfer.token_address),
                address::canonical(&transfer.from_address),
                address::canonical(&transfer.to_address),
                transfer.amount,
                transfer.block_number as i64,
                transfer.observed_at,
            ],
        )?;
        Ok(inserted > 0)
    }

    pub fn count_for_token(&self, token: &Address) -> rusqlite::Result<usize> {
        let count: i64 = self.conn.query_row(
            Self::COUNT_FOR_TOKEN,
            params![address::canonical(token)],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    /// Most recent first.
    pub fn list_for_token(
        &self,
        token: &Address,
        limit: usize,
    ) -> rusqlite::Result<Vec<TransferEvent>> {
        let query = format!(
            "{} WHERE token_address = ?1 ORDER BY block_number DESC LIMIT ?2",
            Self::SELECT_TRANSFER
        );
        let mut stmt = self.conn.prepare(&query)?;
        let transfers = stmt
            .query_map(
                params![address::canonical(token), limit as i64],
                Self::row_to_transfer,
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(transfers)
    }

    fn row_to_transfer(row: &Row) -> rusqlite::Result<TransferEvent> {
        let transaction_hash = row.get::<_, String>(0)?.parse::<B256>().map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
        })?;

        let token_address = Self::address_column(row, 1)?;
        let from_address = Self::address_column(row, 2)?;
        let to_address = Self::address_column(row, 3)?;
        let block_number: i64 = row.get(5)?;

        Ok(TransferEvent {
            token_address,
            from_address,
            to_address,
            amount: row.get(4)?,
            transaction_hash,
            block_number: block_number as u64,
            observed_at: row.get(6)?,
        })
    }

    fn address_column(row: &Row, idx: usize) -> rusqlite::Result<Address> {
        let raw: String = row.get(idx)?;
        address::parse(&raw).ok_or_else(|| {
            rusqlite::Error::FromSqlConversionFailure(
                idx,
                rusqlite::types::Type::Text,
                format!("invalid address {raw}").into(),
            )
        })
    }
}
