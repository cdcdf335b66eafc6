pub mod contract_repository;
pub mod database;
pub mod models;
pub mod store;
pub mod transfer_repository;

pub use contract_repository::ContractRepository;
pub use database::Database;
pub use models::{MonitoredContract, TransferEvent};
pub use store::{ContractStore, TransferStore};
pub use transfer_repository::TransferRepository;
