//! Transaction database over a memory-mapped flat file.
//!
//! Transactions are stored as variable-length records in a single
//! auto-growing file, indexed by a bucketed hash table kept at the start of
//! the file. A record's small header fields are mutated in place after
//! allocation; the bulk payload is immutable.
//!
//! Record format:
//!
//! ```text
//! [ height/forks:4     - atomic-header ]
//! [ position:2         - atomic-header ] (0xFFFF while unconfirmed)
//! [ state:1            - atomic-header ] (invalid, stored, pooled, indexed, confirmed)
//! [ median_time_past:4 - atomic-header ] (zero while unconfirmed)
//! [ output_count:varint - const ]
//! [
//!   [ index_spend:1    - atomic-output ]
//!   [ spender_height:4 - atomic-output ] (0xFFFFFFFF while unspent)
//!   [ value:8          - const ]
//!   [ script:varint    - const ]
//! ]...
//! [ input_count:varint - const ]
//! [
//!   [ hash:32          - const ]
//!   [ index:2          - const ]
//!   [ script:varint    - const ]
//!   [ sequence:4       - const ]
//! ]...
//! [ locktime:varint    - const ]
//! [ version:varint     - const ]
//! ```
//!
//! Atomic-header and atomic-output bytes are read and written under a
//! process-wide metadata lock held for a handful of bytes at a time; payload
//! bytes are read lock-free. The mapping itself is pinned against relocation
//! by short-lived accessors, see `bitstore-memory`.

mod cache;
mod database;
mod error;
mod record;
mod serialize;
mod state;
mod table;

pub use database::{Prevout, TransactionDatabase};
pub use error::{Error, Result};
pub use record::{
    OutputRecord, RecordMetadata, TransactionRecord, MAX_FORK_HEIGHT, NOT_SPENT,
    UNCONFIRMED_POSITION, UNVERIFIED_FORKS,
};
pub use state::TransactionState;
