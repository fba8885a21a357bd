//! Error types for nodestore
//!
//! Provides a unified error type for every store implementation. A missing
//! key is never an error: reads return `Option` or an empty collection.

use thiserror::Error;

/// Result type alias using StoreError
pub type Result<T> = std::result::Result<T, StoreError>;

/// Unified error type for store operations
#[derive(Debug, Error)]
pub enum StoreError {
    // -------------------------------------------------------------------------
    // I/O Errors
    // -------------------------------------------------------------------------
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // -------------------------------------------------------------------------
    // Storage Errors
    // -------------------------------------------------------------------------
    #[error("Corruption detected: {0}")]
    Corruption(String),

    #[error("Map full: {needed} bytes needed, limit is {limit} bytes")]
    MapFull { needed: u64, limit: u64 },

    // -------------------------------------------------------------------------
    // Serialization Errors
    // -------------------------------------------------------------------------
    #[error("Serialization error: {0}")]
    Serialization(String),

    // -------------------------------------------------------------------------
    // Usage Errors
    // -------------------------------------------------------------------------
    #[error("Invalid index: {0}")]
    InvalidIndex(String),

    #[error("A transaction is already open on this store")]
    TransactionAlreadyOpen,

    #[error("No transaction is open on this store")]
    NoTransaction,

    #[error("Store is closed")]
    Closed,

    // -------------------------------------------------------------------------
    // Configuration Errors
    // -------------------------------------------------------------------------
    #[error("Configuration error: {0}")]
    Config(String),
}

impl StoreError {
    /// True for begin/commit/abort protocol violations
    pub fn is_transaction_misuse(&self) -> bool {
        matches!(self, Self::TransactionAlreadyOpen | Self::NoTransaction)
    }
}

impl From<bincode::Error> for StoreError {
    fn from(e: bincode::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}
