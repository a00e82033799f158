//! End-to-end tests for the transaction database: store/find round-trips,
//! spend bookkeeping, confirmation lifecycle, prevout resolution, and
//! behavior under concurrent growth.

use bitcoin::absolute::LockTime;
use bitcoin::hashes::Hash;
use bitcoin::transaction::Version;
use bitcoin::{Amount, OutPoint, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Txid, Witness};
use bitstore_txdb::{
    Error, TransactionDatabase, TransactionState, MAX_FORK_HEIGHT, NOT_SPENT,
    UNCONFIRMED_POSITION, UNVERIFIED_FORKS,
};

const COIN: u64 = 100_000_000;

fn coinbase(script_sig: Vec<u8>, value: u64) -> Transaction {
    Transaction {
        version: Version::ONE,
        lock_time: LockTime::ZERO,
        input: vec![TxIn {
            previous_output: OutPoint::null(),
            script_sig: ScriptBuf::from_bytes(script_sig),
            sequence: Sequence::MAX,
            witness: Witness::new(),
        }],
        output: vec![TxOut {
            value: Amount::from_sat(value),
            script_pubkey: ScriptBuf::from_bytes(vec![0x41, 0x04, 0xAC]),
        }],
    }
}

fn spending(prev: OutPoint, value: u64) -> Transaction {
    Transaction {
        version: Version::TWO,
        lock_time: LockTime::ZERO,
        input: vec![TxIn {
            previous_output: prev,
            script_sig: ScriptBuf::from_bytes(vec![0x51]),
            sequence: Sequence::MAX,
            witness: Witness::new(),
        }],
        output: vec![TxOut {
            value: Amount::from_sat(value),
            script_pubkey: ScriptBuf::from_bytes(vec![0x76, 0xA9, 0x88, 0xAC]),
        }],
    }
}

fn new_database(dir: &tempfile::TempDir) -> TransactionDatabase {
    TransactionDatabase::create(dir.path().join("tx.bin"), 128, 100).unwrap()
}

#[test]
fn store_find_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let db = new_database(&dir);

    let tx0 = coinbase(vec![0x04, 0xFF, 0xFF, 0x00, 0x1D], 50 * COIN);
    let hash = tx0.compute_txid();
    db.store(&tx0, 0, 0, 0, TransactionState::Confirmed).unwrap();

    let record = db.get(&hash).unwrap();
    assert_eq!(record.hash(), hash);
    assert_eq!(record.height(), 0);
    assert_eq!(record.position(), 0);
    assert_eq!(record.state(), TransactionState::Confirmed);
    assert_eq!(record.median_time_past(), 0);
    assert_eq!(record.output_count(), Some(1));

    let output = record.output(0).unwrap();
    assert_eq!(output.value, 50 * COIN);
    assert_eq!(output.spender_height, NOT_SPENT);
    assert_eq!(output.script.as_bytes(), &[0x41, 0x04, 0xAC]);
    assert!(record.output(1).is_none());

    // The payload round-trips bit-exactly.
    let decoded = record.transaction().unwrap();
    assert_eq!(decoded, tx0);
    assert_eq!(decoded.compute_txid(), hash);
}

#[test]
fn get_by_link_matches_get_by_hash() {
    let dir = tempfile::tempdir().unwrap();
    let db = new_database(&dir);

    let tx = coinbase(vec![0x01], 50 * COIN);
    let link = db.store(&tx, 5, 0, 0, TransactionState::Confirmed).unwrap();

    let by_link = db.get_at(link).unwrap();
    assert_eq!(by_link.hash(), tx.compute_txid());
    assert_eq!(by_link.link(), link);
    assert!(db.get_at(u64::MAX / 2).is_none());
}

#[test]
fn confirm_spends_previous_outputs() {
    let dir = tempfile::tempdir().unwrap();
    let db = new_database(&dir);

    let tx0 = coinbase(vec![0x01, 0x02], 50 * COIN);
    let hash0 = tx0.compute_txid();
    db.store(&tx0, 1, 500, 0, TransactionState::Confirmed).unwrap();

    let point = OutPoint { txid: hash0, vout: 0 };
    let tx1 = spending(point, 49 * COIN);
    let link1 = db.pool(&tx1, 0).unwrap();
    db.confirm(link1, 2, 777, 1).unwrap();

    let metadata = db.get(&tx1.compute_txid()).unwrap().metadata();
    assert_eq!(metadata.height, 2);
    assert_eq!(metadata.position, 1);
    assert_eq!(metadata.state, TransactionState::Confirmed);
    assert_eq!(metadata.median_time_past, 777);

    let prevout = db.get_output(&point, 2).unwrap();
    assert!(prevout.confirmed);
    assert!(prevout.spent);
    assert!(prevout.coinbase);
    assert_eq!(prevout.height, 1);
    assert_eq!(prevout.median_time_past, 500);
    assert_eq!(prevout.output.value, Amount::from_sat(50 * COIN));

    // Before the spending block the output is still unspent.
    let prevout = db.get_output(&point, 1).unwrap();
    assert!(prevout.confirmed);
    assert!(!prevout.spent);

    // Pool mode sees the spend as well.
    let prevout = db.get_output(&point, MAX_FORK_HEIGHT).unwrap();
    assert!(prevout.confirmed);
    assert!(prevout.spent);
}

#[test]
fn unconfirm_restores_previous_outputs() {
    let dir = tempfile::tempdir().unwrap();
    let db = new_database(&dir);

    let tx0 = coinbase(vec![0x03], 50 * COIN);
    let hash0 = tx0.compute_txid();
    db.store(&tx0, 1, 500, 0, TransactionState::Confirmed).unwrap();

    let point = OutPoint { txid: hash0, vout: 0 };
    let tx1 = spending(point, 49 * COIN);
    let link1 = db.pool(&tx1, 0).unwrap();
    db.confirm(link1, 2, 777, 1).unwrap();
    db.unconfirm(link1).unwrap();

    // The spend is undone.
    let output = db.get(&hash0).unwrap().output(0).unwrap();
    assert_eq!(output.spender_height, NOT_SPENT);
    let prevout = db.get_output(&point, 2).unwrap();
    assert!(prevout.confirmed);
    assert!(!prevout.spent);

    // The transaction returns to the pool under unknown chain state.
    let record1 = db.get_at(link1).unwrap();
    assert_eq!(record1.state(), TransactionState::Pooled);
    assert_eq!(record1.position(), UNCONFIRMED_POSITION);
    assert_eq!(record1.median_time_past(), 0);
    assert_eq!(record1.height(), UNVERIFIED_FORKS);
}

#[test]
fn genesis_coinbase_output_is_unspendable() {
    let dir = tempfile::tempdir().unwrap();
    let db = new_database(&dir);

    let genesis = coinbase(vec![0x04, 0xFF], 50 * COIN);
    let hash = genesis.compute_txid();
    db.store(&genesis, 0, 0, 0, TransactionState::Confirmed).unwrap();

    // The record exists, but its output resolves for no fork height.
    assert!(db.get(&hash).is_some());
    let point = OutPoint { txid: hash, vout: 0 };
    assert!(db.get_output(&point, 0).is_none());
    assert!(db.get_output(&point, 100).is_none());
    assert!(db.get_output(&point, MAX_FORK_HEIGHT).is_none());
}

#[test]
fn null_point_resolves_to_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let db = new_database(&dir);
    assert!(db.get_output(&OutPoint::null(), MAX_FORK_HEIGHT).is_none());
}

#[test]
fn mempool_query_admits_unconfirmed_prevouts() {
    let dir = tempfile::tempdir().unwrap();
    let db = new_database(&dir);

    let tx2 = coinbase(vec![0x05], 25 * COIN);
    let hash = tx2.compute_txid();
    db.pool(&tx2, 0x1F).unwrap();

    let record = db.get(&hash).unwrap();
    assert_eq!(record.state(), TransactionState::Pooled);
    assert_eq!(record.position(), UNCONFIRMED_POSITION);
    assert_eq!(record.height(), 0x1F);
    assert_eq!(record.median_time_past(), 0);

    // Pool mode resolves the unconfirmed output; chain queries do not.
    let point = OutPoint { txid: hash, vout: 0 };
    let prevout = db.get_output(&point, MAX_FORK_HEIGHT).unwrap();
    assert!(!prevout.confirmed);
    assert!(!prevout.spent);
    assert_eq!(prevout.output.value, Amount::from_sat(25 * COIN));
    assert!(db.get_output(&point, 100).is_none());
}

#[test]
fn spend_preconditions_are_enforced() {
    let dir = tempfile::tempdir().unwrap();
    let db = new_database(&dir);

    // Unknown previous transaction.
    let missing = OutPoint {
        txid: Txid::from_byte_array([0xEE; 32]),
        vout: 0,
    };
    let tx = spending(missing, COIN);
    let link = db.pool(&tx, 0).unwrap();
    assert!(matches!(db.confirm(link, 2, 0, 1), Err(Error::NotFound(_))));

    // Unconfirmed previous transaction.
    let pooled = coinbase(vec![0x06], 50 * COIN);
    db.pool(&pooled, 0).unwrap();
    let tx = spending(OutPoint { txid: pooled.compute_txid(), vout: 0 }, COIN);
    let link = db.pool(&tx, 0).unwrap();
    assert!(matches!(db.confirm(link, 2, 0, 1), Err(Error::NotConfirmed { .. })));

    // Previous transaction confirmed above the spender height.
    let late = coinbase(vec![0x07], 50 * COIN);
    db.store(&late, 10, 0, 0, TransactionState::Confirmed).unwrap();
    let tx = spending(OutPoint { txid: late.compute_txid(), vout: 0 }, COIN);
    let link = db.pool(&tx, 0).unwrap();
    assert!(matches!(db.confirm(link, 5, 0, 1), Err(Error::NotConfirmed { .. })));
    db.confirm(link, 10, 0, 1).unwrap();

    // Output index out of range.
    let narrow = coinbase(vec![0x08], 50 * COIN);
    db.store(&narrow, 1, 0, 0, TransactionState::Confirmed).unwrap();
    let tx = spending(OutPoint { txid: narrow.compute_txid(), vout: 7 }, COIN);
    let link = db.pool(&tx, 0).unwrap();
    assert!(matches!(
        db.confirm(link, 2, 0, 1),
        Err(Error::OutputOutOfRange { index: 7, .. })
    ));
}

#[test]
fn oversized_input_index_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let db = new_database(&dir);

    // A wire-valid input index that does not fit the 2-byte point encoding
    // is refused; nothing is stored and the process keeps running.
    let prev = OutPoint {
        txid: Txid::from_byte_array([0x11; 32]),
        vout: 0x10000,
    };
    let tx = spending(prev, COIN);
    assert!(matches!(db.pool(&tx, 0), Err(Error::IndexOutOfRange(0x10000))));
    assert!(db.get(&tx.compute_txid()).is_none());

    // The coinbase sentinel index still stores fine.
    let tx = coinbase(vec![0x09], 50 * COIN);
    db.pool(&tx, 0).unwrap();
    assert!(db.get(&tx.compute_txid()).is_some());
}

#[test]
fn close_truncates_and_reopen_restores() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("tx.bin");

    let mut hashes = Vec::new();
    let logical_size;
    {
        let db = TransactionDatabase::create(&path, 128, 0).unwrap();
        for byte in 0..64u8 {
            let tx = coinbase(vec![byte; 64], 50 * COIN);
            hashes.push(tx.compute_txid());
            db.store(&tx, 1, 0, 0, TransactionState::Confirmed).unwrap();
        }
        logical_size = db.logical_size();

        // Growth slack keeps the mapped file larger than the data.
        assert!(db.size() > logical_size);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), db.size() as u64);
        assert!(db.close());
    }

    // The file shrank to the logical size on close.
    assert_eq!(std::fs::metadata(&path).unwrap().len(), logical_size as u64);

    let db = TransactionDatabase::open(&path, 0).unwrap();
    assert_eq!(db.logical_size(), logical_size);
    for hash in &hashes {
        assert!(db.get(hash).is_some(), "record lost across reopen");
    }
}

#[test]
fn grow_under_concurrent_readers() {
    let dir = tempfile::tempdir().unwrap();
    let db = new_database(&dir);

    let known = coinbase(vec![0xAA], 50 * COIN);
    let known_hash = known.compute_txid();
    db.store(&known, 1, 0, 0, TransactionState::Confirmed).unwrap();
    let known_point = OutPoint { txid: known_hash, vout: 0 };

    let mut hashes = Vec::new();
    std::thread::scope(|scope| {
        // Readers hammer lookups while the writer grows the file.
        for _ in 0..3 {
            scope.spawn(|| {
                for index in 0..5_000u32 {
                    let record = db.get(&known_hash).unwrap();
                    assert_eq!(record.output(0).unwrap().value, 50 * COIN);
                    drop(record);

                    if index % 8 == 0 {
                        let prevout = db.get_output(&known_point, 10).unwrap();
                        assert_eq!(prevout.height, 1);
                    }
                }
            });
        }

        // ~200-byte records force repeated growth of the 4 KiB initial map.
        for index in 0..1_000u32 {
            let tx = coinbase(index.to_le_bytes().repeat(32), 50 * COIN);
            hashes.push(tx.compute_txid());
            db.store(&tx, 2, 0, 0, TransactionState::Confirmed).unwrap();
        }
    });

    assert!(db.logical_size() >= 1_000 * 170);
    assert!(db.size() >= db.logical_size());
    for hash in &hashes {
        assert!(db.get(hash).is_some());
    }
}
