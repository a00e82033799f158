//! Bounded shadow of recently-seen confirmed unspent outputs.

use std::num::NonZeroUsize;

use bitcoin::{OutPoint, ScriptBuf, Transaction};
use lru::LruCache;
use parking_lot::Mutex;

/// A cached previous output with the metadata the hot path needs.
#[derive(Debug, Clone)]
pub(crate) struct CachedOutput {
    pub value: u64,
    pub script: ScriptBuf,
    pub height: u32,
    pub median_time_past: u32,
    pub coinbase: bool,
}

/// LRU cache over confirmed unspent outputs, consulted before the record
/// store on the prevout-lookup hot path.
///
/// The cache never holds spent outputs or outputs of non-confirmed
/// transactions: any state change that could invalidate an entry (spend,
/// unconfirm) must call [`OutputCache::remove`]. Zero capacity disables the
/// cache entirely.
pub(crate) struct OutputCache {
    entries: Option<Mutex<LruCache<OutPoint, CachedOutput>>>,
}

impl OutputCache {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            entries: NonZeroUsize::new(capacity).map(|capacity| Mutex::new(LruCache::new(capacity))),
        }
    }

    /// Cache every output of a confirmed transaction.
    pub(crate) fn add(&self, tx: &Transaction, height: u32, median_time_past: u32, coinbase: bool) {
        let Some(entries) = &self.entries else {
            return;
        };
        let txid = tx.compute_txid();
        let mut entries = entries.lock();
        for (index, output) in tx.output.iter().enumerate() {
            entries.put(
                OutPoint { txid, vout: index as u32 },
                CachedOutput {
                    value: output.value.to_sat(),
                    script: output.script_pubkey.clone(),
                    height,
                    median_time_past,
                    coinbase,
                },
            );
        }
    }

    /// Evict one output, called on spend and unconfirm.
    pub(crate) fn remove(&self, point: &OutPoint) {
        if let Some(entries) = &self.entries {
            entries.lock().pop(point);
        }
    }

    /// A fresh usable entry for `point`, honoring the fork point. Entries
    /// are always confirmed and unspent.
    pub(crate) fn get(&self, point: &OutPoint, fork_height: u32) -> Option<CachedOutput> {
        let entries = self.entries.as_ref()?;
        let mut entries = entries.lock();
        let entry = entries.get(point)?;
        if entry.height > fork_height {
            return None;
        }
        Some(entry.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::absolute::LockTime;
    use bitcoin::hashes::Hash;
    use bitcoin::transaction::Version;
    use bitcoin::{Amount, TxOut, Txid};

    fn two_output_tx() -> Transaction {
        Transaction {
            version: Version::TWO,
            lock_time: LockTime::ZERO,
            input: vec![],
            output: vec![
                TxOut {
                    value: Amount::from_sat(100),
                    script_pubkey: ScriptBuf::from_bytes(vec![0x51]),
                },
                TxOut {
                    value: Amount::from_sat(200),
                    script_pubkey: ScriptBuf::from_bytes(vec![0x52]),
                },
            ],
        }
    }

    #[test]
    fn add_then_get_honors_fork_height() {
        let cache = OutputCache::new(8);
        let tx = two_output_tx();
        let txid = tx.compute_txid();
        cache.add(&tx, 100, 5000, false);

        let point = OutPoint { txid, vout: 1 };
        let hit = cache.get(&point, 100).unwrap();
        assert_eq!(hit.value, 200);
        assert_eq!(hit.median_time_past, 5000);
        assert!(!hit.coinbase);

        // Not yet confirmed as of an earlier fork point.
        assert!(cache.get(&point, 99).is_none());
    }

    #[test]
    fn remove_evicts_single_output() {
        let cache = OutputCache::new(8);
        let tx = two_output_tx();
        let txid = tx.compute_txid();
        cache.add(&tx, 1, 0, true);

        cache.remove(&OutPoint { txid, vout: 0 });
        assert!(cache.get(&OutPoint { txid, vout: 0 }, 10).is_none());
        assert!(cache.get(&OutPoint { txid, vout: 1 }, 10).is_some());
    }

    #[test]
    fn capacity_bounds_the_cache() {
        let cache = OutputCache::new(1);
        let tx = two_output_tx();
        let txid = tx.compute_txid();
        cache.add(&tx, 1, 0, false);

        // Only the most recently inserted output survives.
        assert!(cache.get(&OutPoint { txid, vout: 0 }, 10).is_none());
        assert!(cache.get(&OutPoint { txid, vout: 1 }, 10).is_some());
    }

    #[test]
    fn zero_capacity_disables_the_cache() {
        let cache = OutputCache::new(0);
        let tx = two_output_tx();
        cache.add(&tx, 1, 0, false);
        let point = OutPoint {
            txid: Txid::all_zeros(),
            vout: 0,
        };
        assert!(cache.get(&point, 10).is_none());
    }
}
