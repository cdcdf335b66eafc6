//! Watches token-transfer events for a changing set of contracts, records
//! every transfer and hands each one to a wallet-risk analyzer.

pub mod address;
pub mod bootstrap;
pub mod config;
pub mod detection;
pub mod error;
pub mod events;
pub mod pipeline;
pub mod recorder;
pub mod registry;
pub mod repository;
pub mod source;

pub use error::{WatchError, WatchResult};
