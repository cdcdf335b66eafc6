use alloy_primitives::Address;
use thiserror::Error;

pub type WatchResult<T> = Result<T, WatchError>;

#[derive(Debug, Error)]
pub enum WatchError {
    /// The event source could not open or keep a subscription.
    #[error("connection error: {0}")]
    Connection(String),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("subscription already active for {0:?}")]
    AlreadyActive(Address),
    #[error("detection error: {0}")]
    Detection(String),
}

impl WatchError {
    pub fn connection(err: impl std::fmt::Display) -> Self {
        Self::Connection(err.to_string())
    }

    pub fn storage(err: impl std::fmt::Display) -> Self {
        Self::Storage(err.to_string())
    }

    pub fn detection(err: impl std::fmt::Display) -> Self {
        Self::Detection(err.to_string())
    }
}

impl From<rusqlite::Error> for WatchError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Storage(value.to_string())
    }
}

impl From<tokio::task::JoinError> for WatchError {
    fn from(value: tokio::task::JoinError) -> Self {
        Self::Storage(format!("blocking task failed: {value}"))
    }
}
