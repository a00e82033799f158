//! Error types for the transaction database.

use bitcoin::Txid;

use crate::state::TransactionState;

/// Errors that can occur during transaction database operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Memory-mapped file failure.
    #[error(transparent)]
    Memory(#[from] bitstore_memory::Error),

    /// I/O error outside the mapping (table creation).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Transaction hash absent from the index.
    #[error("transaction {0} not found")]
    NotFound(Txid),

    /// No record at the given file offset.
    #[error("no record at offset {0}")]
    LinkNotFound(u64),

    /// The referenced output is not spendable at the requested height.
    #[error(
        "transaction {txid} is not spendable at height {spender_height} \
         (state {state:?}, height {height})"
    )]
    NotConfirmed {
        txid: Txid,
        state: TransactionState,
        height: u32,
        spender_height: u32,
    },

    /// The referenced output index is not in the transaction.
    #[error("output index {index} exceeds output count {count} of transaction {txid}")]
    OutputOutOfRange { txid: Txid, index: u32, count: u64 },

    /// An input's previous-output index does not fit the record encoding.
    #[error("input index {0} exceeds the storable range")]
    IndexOutOfRange(u32),

    /// Record bytes failed to decode.
    #[error("record bytes at offset {0} are corrupted")]
    Corrupt(u64),
}

pub type Result<T> = std::result::Result<T, Error>;
