//! The transaction database: the upward API over the record table.

use std::path::Path;
use std::sync::Arc;

use bitcoin::{OutPoint, Transaction, TxOut, Txid};
use parking_lot::{Mutex, RwLock};

use crate::cache::OutputCache;
use crate::error::{Error, Result};
use crate::record::{
    self, TransactionRecord, MAX_FORK_HEIGHT, NOT_SPENT, UNCONFIRMED_POSITION, UNVERIFIED_FORKS,
};
use crate::state::TransactionState;
use crate::table::RecordTable;

const NO_TIME: u32 = 0;

/// Metadata for a resolved previous output.
#[derive(Debug, Clone)]
pub struct Prevout {
    pub output: TxOut,
    /// Height of the transaction holding the output.
    pub height: u32,
    pub median_time_past: u32,
    /// Whether the output belongs to a coinbase transaction.
    pub coinbase: bool,
    /// Whether the holding transaction is confirmed as of the queried fork
    /// height. Always false for pool-mode hits on unconfirmed transactions.
    pub confirmed: bool,
    /// Whether the output is spent as of the queried fork height.
    pub spent: bool,
}

/// Hash-indexed store of transaction records with in-place header mutation.
///
/// Lookups are O(1) through the bucket index by hash, or directly by link
/// (the record's stable byte offset). Header fields are mutated under a
/// process-wide metadata lock shared by every record view of this database.
pub struct TransactionDatabase {
    table: RecordTable,
    cache: OutputCache,
    metadata_mutex: RwLock<()>,
}

impl TransactionDatabase {
    /// Create a fresh database file with `buckets` hash buckets.
    pub fn create(path: impl AsRef<Path>, buckets: u32, cache_capacity: usize) -> Result<Self> {
        Ok(Self {
            table: RecordTable::create(path.as_ref(), buckets)?,
            cache: OutputCache::new(cache_capacity),
            metadata_mutex: RwLock::new(()),
        })
    }

    /// Open an existing database file.
    pub fn open(path: impl AsRef<Path>, cache_capacity: usize) -> Result<Self> {
        Self::open_with(path, cache_capacity, None)
    }

    /// Same as [`TransactionDatabase::open`], additionally coordinating file
    /// growth with an external mutex shared by sibling stores.
    pub fn open_with(
        path: impl AsRef<Path>,
        cache_capacity: usize,
        external: Option<Arc<Mutex<()>>>,
    ) -> Result<Self> {
        Ok(Self {
            table: RecordTable::open(path.as_ref(), external)?,
            cache: OutputCache::new(cache_capacity),
            metadata_mutex: RwLock::new(()),
        })
    }

    /// Persist the current heap watermark into the header. Records stored
    /// before a commit survive a crash; later ones are discarded on reopen.
    pub fn commit(&self) {
        self.table.commit();
    }

    /// msync the data region to disk.
    pub fn flush(&self) -> Result<()> {
        self.table.flush()
    }

    /// Commit and stop the backing map, truncating the file to its logical
    /// size. Idempotent; also invoked on drop.
    pub fn close(&self) -> bool {
        self.table.close()
    }

    /// Current mapped size of the backing file.
    pub fn size(&self) -> usize {
        self.table.size()
    }

    /// Authoritative data length of the backing file.
    pub fn logical_size(&self) -> usize {
        self.table.logical_size()
    }

    /// The first stored transaction with the given hash, if any.
    pub fn get(&self, hash: &Txid) -> Option<TransactionRecord<'_>> {
        let element = self.table.find(hash)?;
        Some(TransactionRecord::new(element.access, element.link, &self.metadata_mutex))
    }

    /// The record at the given link. O(1); the link is trusted to address a
    /// record start.
    pub fn get_at(&self, link: u64) -> Option<TransactionRecord<'_>> {
        let element = self.table.find_link(link)?;
        Some(TransactionRecord::new(element.access, element.link, &self.metadata_mutex))
    }

    /// Resolve a previous output as of `fork_height`.
    ///
    /// Passing [`MAX_FORK_HEIGHT`] switches to memory-pool mode, which
    /// admits unconfirmed previous outputs. Returns `None` for null
    /// (coinbase) points, unknown transactions, outputs of the genesis
    /// coinbase, and transactions whose state is not relevant at the fork
    /// point.
    pub fn get_output(&self, point: &OutPoint, fork_height: u32) -> Option<Prevout> {
        // A coinbase input has no previous output to populate.
        if point.is_null() {
            return None;
        }

        // The cache holds only confirmed unspent outputs.
        if let Some(cached) = self.cache.get(point, fork_height) {
            return Some(Prevout {
                output: TxOut {
                    value: bitcoin::Amount::from_sat(cached.value),
                    script_pubkey: cached.script,
                },
                height: cached.height,
                median_time_past: cached.median_time_past,
                coinbase: cached.coinbase,
                confirmed: true,
                spent: false,
            });
        }

        let result = self.get(&point.txid)?;
        let metadata = result.metadata();

        // CONSENSUS: the genesis block coinbase output may not be spent; it
        // was never entered into the utxo set.
        if metadata.height == 0 {
            return None;
        }

        let relevant = metadata.height <= fork_height;
        let for_pool = fork_height == MAX_FORK_HEIGHT;
        let confirmed = (metadata.state == TransactionState::Indexed && !for_pool)
            || (metadata.state == TransactionState::Confirmed && relevant);

        if !for_pool && !confirmed {
            return None;
        }

        let output = result.output(point.vout)?;
        Some(Prevout {
            coinbase: metadata.position == 0,
            height: metadata.height,
            median_time_past: metadata.median_time_past,
            confirmed,
            spent: confirmed && output.is_spent(fork_height),
            output: output.to_tx_out(),
        })
    }

    /// Serialize and index a new transaction record, returning its link.
    ///
    /// The record is written into reserved space first and published into
    /// the hash index only once complete, so a lookup never observes a
    /// partial record.
    pub fn store(
        &self,
        tx: &Transaction,
        height: u32,
        median_time_past: u32,
        position: u16,
        state: TransactionState,
    ) -> Result<u64> {
        record::check_input_indexes(tx)?;

        let hash = tx.compute_txid();
        let size = record::serialized_size(tx);

        let unlinked = self.table.create_record(&hash, size, |writer| {
            record::write_transaction(writer, tx, height, median_time_past, position, state);
        })?;
        let link = self.table.link(unlinked);

        // Shadow confirmed outputs for the hot path. Genesis outputs are
        // unspendable and stay out of the cache.
        if state == TransactionState::Confirmed && height != 0 {
            self.cache.add(tx, height, median_time_past, position == 0);
        }

        Ok(link)
    }

    /// Store an unconfirmed transaction validated under `forks`.
    pub fn pool(&self, tx: &Transaction, forks: u32) -> Result<u64> {
        self.store(tx, forks, NO_TIME, UNCONFIRMED_POSITION, TransactionState::Pooled)
    }

    /// Confirm the transaction at `link`: spend each of its inputs'
    /// previous outputs at `height`, then update its header.
    pub fn confirm(
        &self,
        link: u64,
        height: u32,
        median_time_past: u32,
        position: u16,
    ) -> Result<()> {
        assert!(position != UNCONFIRMED_POSITION, "confirm requires a real block position");

        let points = {
            let record = self.get_at(link).ok_or(Error::LinkNotFound(link))?;
            record.input_points().ok_or(Error::Corrupt(link))?
        };
        for point in &points {
            self.spend(point, height)?;
        }

        self.update(link, height, median_time_past, position, TransactionState::Confirmed)
    }

    /// Undo a confirmation: unspend each input's previous output and return
    /// the transaction to the pool. The header height becomes
    /// [`UNVERIFIED_FORKS`], as the chain state it was verified under is no
    /// longer known.
    pub fn unconfirm(&self, link: u64) -> Result<()> {
        let (points, txid, outputs) = {
            let record = self.get_at(link).ok_or(Error::LinkNotFound(link))?;
            (
                record.input_points().ok_or(Error::Corrupt(link))?,
                record.hash(),
                record.output_count().ok_or(Error::Corrupt(link))?,
            )
        };
        for point in &points {
            self.unspend(point)?;
        }

        // The transaction's own outputs are no longer confirmed.
        for vout in 0..outputs {
            self.cache.remove(&OutPoint { txid, vout: vout as u32 });
        }

        self.update(link, UNVERIFIED_FORKS, NO_TIME, UNCONFIRMED_POSITION, TransactionState::Pooled)
    }

    fn spend(&self, point: &OutPoint, spender_height: u32) -> Result<()> {
        // Allows callers to pass coinbase inputs along with the rest.
        if point.is_null() {
            return Ok(());
        }

        // Restoring an unspent output to the cache is not worth the reload.
        if spender_height != NOT_SPENT {
            self.cache.remove(point);
        }

        let record = self.get(&point.txid).ok_or(Error::NotFound(point.txid))?;

        // Limit to confirmed transactions at or below the spender height.
        // One header snapshot, so the check never sees a torn state/height
        // pair across a concurrent confirm or unconfirm.
        let metadata = record.metadata();
        if metadata.state != TransactionState::Confirmed || metadata.height > spender_height {
            return Err(Error::NotConfirmed {
                txid: point.txid,
                state: metadata.state,
                height: metadata.height,
                spender_height,
            });
        }

        let count = record.output_count().ok_or(Error::Corrupt(record.link()))?;
        if u64::from(point.vout) >= count {
            return Err(Error::OutputOutOfRange {
                txid: point.txid,
                index: point.vout,
                count,
            });
        }

        record
            .write_spender_height(point.vout, spender_height)
            .ok_or(Error::Corrupt(record.link()))?;
        Ok(())
    }

    fn unspend(&self, point: &OutPoint) -> Result<()> {
        self.spend(point, NOT_SPENT)
    }

    fn update(
        &self,
        link: u64,
        height: u32,
        median_time_past: u32,
        position: u16,
        state: TransactionState,
    ) -> Result<()> {
        let record = self.get_at(link).ok_or(Error::LinkNotFound(link))?;
        record.write_metadata(height, median_time_past, position, state);
        Ok(())
    }
}

impl Drop for TransactionDatabase {
    fn drop(&mut self) {
        self.close();
    }
}
