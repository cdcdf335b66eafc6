use super::models::MonitoredContract;
use crate::address;
use alloy_primitives::Address;
use rusqlite::{OptionalExtension, Row, params};
use tracing::warn;

pub struct ContractRepository<'a> {
    conn: &'a rusqlite::Connection,
}

impl<'a> ContractRepository<'a> {
    const INSERT_CONTRACT: &'static str = "INSERT OR IGNORE INTO contracts (
            address, bonding_address, display_name, owner_wallet, creation_timestamp
        ) VALUES (?1, ?2, ?3, ?4, ?5)";

    const SELECT_CONTRACT: &'static str = "SELECT address, bonding_address, display_name, owner_wallet, creation_timestamp FROM contracts";

    const DELETE_CONTRACT: &'static str = "DELETE FROM contracts WHERE address = ?1";

    pub fn new(conn: &'a rusqlite::Connection) -> Self {
        Self { conn }
    }

    /// Returns false when a contract with the same address already exists.
    pub fn insert(&self, contract: &MonitoredContract) -> rusqlite::Result<bool> {
        let address = contract
            .is_deployed()
            .then(|| address::canonical(&contract.address));
        let inserted = self.conn.execute(
            Self::INSERT_CONTRACT,
            params![
                address,
                contract
                    .bonding_address
                    .filter(|a| !a.is_zero())
                    .as_ref()
                    .map(address::canonical),
                contract.display_name,
                address::canonical(&contract.owner_wallet),
                contract.creation_timestamp,
            ],
        )?;
        Ok(inserted > 0)
    }

    /// All rows, undeployed ones included. Rows with unparseable addresses are
    /// skipped.
    pub fn all(&self) -> rusqlite::Result<Vec<MonitoredContract>> {
        let query = format!("{} ORDER BY id", Self::SELECT_CONTRACT);
        let mut stmt = self.conn.prepare(&query)?;
        let rows = stmt
            .query_map([], Self::row_to_contract)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows.into_iter().flatten().collect())
    }

    /// Finds the contract whose primary or bonding address matches.
    pub fn find_by_either_address(
        &self,
        address: &Address,
    ) -> rusqlite::Result<Option<MonitoredContract>> {
        let query = format!(
            "{} WHERE address = ?1 OR bonding_address = ?1 ORDER BY id LIMIT 1",
            Self::SELECT_CONTRACT
        );
        let found = self
            .conn
            .query_row(&query, params![address::canonical(address)], Self::row_to_contract)
            .optional()?;
        Ok(found.flatten())
    }

    pub fn remove(&self, address: &Address) -> rusqlite::Result<bool> {
        let removed = self
            .conn
            .execute(Self::DELETE_CONTRACT, params![address::canonical(address)])?;
        Ok(removed > 0)
    }

    fn row_to_contract(row: &Row) -> rusqlite::Result<Option<MonitoredContract>> {
        let raw_address: Option<String> = row.get(0)?;
        let raw_bonding: Option<String> = row.get(1)?;
        let display_name: String = row.get(2)?;
        let raw_owner: String = row.get(3)?;
        let creation_timestamp: i64 = row.get(4)?;

        let (Some(contract_address), Some(owner_wallet)) = (
            address::parse_or_zero(raw_address.as_deref()),
            address::parse(&raw_owner),
        ) else {
            warn!(
                name = %display_name,
                address = ?raw_address,
                owner = %raw_owner,
                "skipping contract row with malformed address"
            );
            return Ok(None);
        };

        let bonding_address = raw_bonding
            .as_deref()
            .and_then(address::parse)
            .filter(|a| !a.is_zero());

        Ok(Some(MonitoredContract {
            address: contract_address,
            display_name,
            creation_timestamp,
            owner_wallet,
            bonding_address,
        }))
    }
}
