use thiserror::Error;
use crate::common::types::{RowKey, TxnId};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("Transaction {txn_id} cannot stage {key}: transaction {owner} already has a pending write")]
    Conflict {
        txn_id: TxnId,
        key: RowKey,
        owner: TxnId,
    },
}

/// Result type for versioned store operations
pub type Result<T> = std::result::Result<T, StoreError>;
