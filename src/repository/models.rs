use alloy_primitives::{Address, B256};

/// A token contract under observation.
///
/// `address` is the zero address while the contract is not yet deployed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitoredContract {
    pub address: Address,
    pub display_name: String,
    pub creation_timestamp: i64,
    pub owner_wallet: Address,
    pub bonding_address: Option<Address>,
}

impl MonitoredContract {
    pub fn is_deployed(&self) -> bool {
        !self.address.is_zero()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferEvent {
    pub token_address: Address,
    pub from_address: Address,
    pub to_address: Address,
    /// Raw token units as a decimal string.
    pub amount: String,
    pub transaction_hash: B256,
    pub block_number: u64,
    pub observed_at: i64,
}
