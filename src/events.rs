use alloy::rpc::types::Log;
use alloy::sol;
use alloy::sol_types::SolEvent;
use alloy_primitives::{Address, B256, U256};

sol! {
    event Transfer(address indexed from, address indexed to, uint256 value);
}

pub fn decode_transfer_event(log: &Log) -> anyhow::Result<Transfer> {
    let log_data = log.data();
    let decoded = Transfer::decode_raw_log(log.topics(), &log_data.data)?;
    Ok(decoded)
}

/// One observed token transfer as delivered by an event source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferNotification {
    pub from: Address,
    pub to: Address,
    pub amount: U256,
    pub tx_hash: B256,
    pub block_number: u64,
    /// Seconds since the epoch, when the provider includes it.
    pub block_timestamp: Option<u64>,
}

impl TransferNotification {
    /// Returns `None` for pending logs that carry no transaction hash or block.
    pub fn from_log(log: &Log) -> anyhow::Result<Option<Self>> {
        let event = decode_transfer_event(log)?;
        let (Some(tx_hash), Some(block_number)) = (log.transaction_hash, log.block_number) else {
            return Ok(None);
        };

        Ok(Some(TransferNotification {
            from: event.from,
            to: event.to,
            amount: event.value,
            tx_hash,
            block_number,
            block_timestamp: log.block_timestamp,
        }))
    }
}
