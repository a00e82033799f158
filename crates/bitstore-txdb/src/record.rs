//! Transaction record layout, serialization and in-place field mutation.

use bitcoin::absolute::LockTime;
use bitcoin::hashes::Hash;
use bitcoin::transaction::Version;
use bitcoin::{Amount, OutPoint, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Txid, Witness};
use bitstore_memory::Accessor;
use parking_lot::RwLock;

use crate::error::{Error, Result};
use crate::serialize::{compact_size_len, SpanReader, SpanWriter};
use crate::state::TransactionState;
use crate::table::RECORD_PREFIX_SIZE;

/// Position value marking a transaction as unconfirmed.
pub const UNCONFIRMED_POSITION: u16 = 0xFFFF;

/// Spender-height value marking an output as unspent.
pub const NOT_SPENT: u32 = u32::MAX;

/// Forks value written by unconfirm: the transaction was verified under a
/// now-unknown chain state. The high bit is outside every rule-fork flag,
/// so the value cannot collide with a valid bitmask, and it is non-zero.
pub const UNVERIFIED_FORKS: u32 = 0x8000_0000;

/// Fork height signaling a memory-pool query, which admits unconfirmed
/// previous outputs.
pub const MAX_FORK_HEIGHT: u32 = u32::MAX;

const HEIGHT_SIZE: usize = 4;
const POSITION_SIZE: usize = 2;
const STATE_SIZE: usize = 1;
const MEDIAN_TIME_PAST_SIZE: usize = 4;

const INDEX_SPEND_SIZE: usize = 1;
const SPENDER_HEIGHT_SIZE: usize = 4;
const VALUE_SIZE: usize = 8;

const INPUT_HASH_SIZE: usize = 32;
const INPUT_INDEX_SIZE: usize = 2;
const SEQUENCE_SIZE: usize = 4;

/// Mutable per-output prefix: index-spend byte, spender height, value.
const SPEND_SIZE: usize = INDEX_SPEND_SIZE + SPENDER_HEIGHT_SIZE + VALUE_SIZE;

/// Mutable record header: height, position, state, median time past.
pub(crate) const METADATA_SIZE: usize =
    HEIGHT_SIZE + POSITION_SIZE + STATE_SIZE + MEDIAN_TIME_PAST_SIZE;

/// On-disk input index marking a null (coinbase) previous output.
const NULL_POINT_INDEX: u16 = u16::MAX;

fn encode_point_index(vout: u32) -> u16 {
    if vout == u32::MAX {
        return NULL_POINT_INDEX;
    }
    debug_assert!(
        vout < u32::from(NULL_POINT_INDEX),
        "input indexes are checked before encoding"
    );
    vout as u16
}

/// Reject transactions whose input indexes do not fit the record's 2-byte
/// point encoding. Such indexes are wire-valid, so this is a store error,
/// not a caller-contract violation. The null (coinbase) index has its own
/// sentinel and always fits.
pub(crate) fn check_input_indexes(tx: &Transaction) -> Result<()> {
    for input in &tx.input {
        let vout = input.previous_output.vout;
        if vout != u32::MAX && vout >= u32::from(NULL_POINT_INDEX) {
            return Err(Error::IndexOutOfRange(vout));
        }
    }
    Ok(())
}

fn decode_point_index(index: u16) -> u32 {
    if index == NULL_POINT_INDEX {
        u32::MAX
    } else {
        u32::from(index)
    }
}

/// Record payload size for `tx`, computed before allocation so the record
/// can be reserved in one shot.
pub(crate) fn serialized_size(tx: &Transaction) -> usize {
    let mut size = METADATA_SIZE + compact_size_len(tx.output.len() as u64);
    for output in &tx.output {
        let script_len = output.script_pubkey.len();
        size += SPEND_SIZE + compact_size_len(script_len as u64) + script_len;
    }
    size += compact_size_len(tx.input.len() as u64);
    for input in &tx.input {
        let script_len = input.script_sig.len();
        size += INPUT_HASH_SIZE
            + INPUT_INDEX_SIZE
            + compact_size_len(script_len as u64)
            + script_len
            + SEQUENCE_SIZE;
    }
    size += compact_size_len(u64::from(tx.lock_time.to_consensus_u32()));
    size += compact_size_len(u64::from(tx.version.0 as u32));
    size
}

/// Serialize `tx` and its header fields into a freshly reserved span.
/// Spender heights start at [`NOT_SPENT`], index-spend bytes at zero.
pub(crate) fn write_transaction(
    writer: &mut SpanWriter,
    tx: &Transaction,
    height: u32,
    median_time_past: u32,
    position: u16,
    state: TransactionState,
) {
    writer.write_u32_le(height);
    writer.write_u16_le(position);
    writer.write_u8(state as u8);
    writer.write_u32_le(median_time_past);

    writer.write_compact_size(tx.output.len() as u64);
    for output in &tx.output {
        writer.write_u8(0);
        writer.write_u32_le(NOT_SPENT);
        writer.write_u64_le(output.value.to_sat());
        let script = output.script_pubkey.as_bytes();
        writer.write_compact_size(script.len() as u64);
        writer.write_slice(script);
    }

    writer.write_compact_size(tx.input.len() as u64);
    for input in &tx.input {
        let point = &input.previous_output;
        writer.write_slice(&point.txid.to_byte_array());
        writer.write_u16_le(encode_point_index(point.vout));
        let script = input.script_sig.as_bytes();
        writer.write_compact_size(script.len() as u64);
        writer.write_slice(script);
        writer.write_u32_le(input.sequence.to_consensus_u32());
    }

    writer.write_compact_size(u64::from(tx.lock_time.to_consensus_u32()));
    writer.write_compact_size(u64::from(tx.version.0 as u32));
}

/// A decoded output together with its spend marker.
#[derive(Debug, Clone)]
pub struct OutputRecord {
    pub value: u64,
    pub script: ScriptBuf,
    /// Height of the confirmed spending transaction, or [`NOT_SPENT`].
    pub spender_height: u32,
}

impl OutputRecord {
    /// Whether the output is spent as of `fork_height`.
    pub fn is_spent(&self, fork_height: u32) -> bool {
        self.spender_height != NOT_SPENT && self.spender_height <= fork_height
    }

    pub fn to_tx_out(&self) -> TxOut {
        TxOut {
            value: Amount::from_sat(self.value),
            script_pubkey: self.script.clone(),
        }
    }
}

/// The mutable record header, decoded in one critical section.
#[derive(Debug, Clone, Copy)]
pub struct RecordMetadata {
    pub height: u32,
    pub position: u16,
    pub state: TransactionState,
    pub median_time_past: u32,
}

/// A view over one stored transaction record.
///
/// Borrows an accessor (pinning the mapping) and the process-wide metadata
/// lock. Header and per-output spend fields are read under the shared lock
/// and written under the exclusive lock; payload bytes are read lock-free.
pub struct TransactionRecord<'a> {
    access: Accessor<'a>,
    link: u64,
    metadata_mutex: &'a RwLock<()>,
}

impl<'a> TransactionRecord<'a> {
    pub(crate) fn new(access: Accessor<'a>, link: u64, metadata_mutex: &'a RwLock<()>) -> Self {
        Self { access, link, metadata_mutex }
    }

    /// File offset of the record; stable for the record's lifetime.
    pub fn link(&self) -> u64 {
        self.link
    }

    /// The transaction hash the record is indexed under.
    pub fn hash(&self) -> Txid {
        let mut reader = self.prefix_reader();
        let bytes = reader
            .read_array::<32>()
            .expect("record prefix lies within the mapped file; verified on lookup");
        Txid::from_byte_array(bytes)
    }

    fn payload_offset(&self) -> usize {
        self.link as usize + RECORD_PREFIX_SIZE
    }

    fn prefix_reader(&self) -> SpanReader {
        let offset = self.link as usize;
        // SAFETY: the accessor pins the mapping; offsets were bounds-checked
        // against the mapped length on lookup.
        unsafe { SpanReader::new(self.access.as_ptr().add(offset), self.access.len() - offset) }
    }

    fn payload_reader(&self) -> SpanReader {
        let offset = self.payload_offset();
        // SAFETY: as for `prefix_reader`.
        unsafe { SpanReader::new(self.access.as_ptr().add(offset), self.access.len() - offset) }
    }

    /// All four header fields, decoded under a single shared-lock
    /// acquisition. Callers needing more than one field must use this
    /// snapshot; chaining the single-field getters can observe a torn
    /// combination across a concurrent header update.
    pub fn metadata(&self) -> RecordMetadata {
        let _metadata = self.metadata_mutex.read();
        let mut reader = self.payload_reader();
        (|| {
            let height = reader.read_u32_le()?;
            let position = reader.read_u16_le()?;
            let state = reader.read_u8()?;
            let median_time_past = reader.read_u32_le()?;
            Some(RecordMetadata {
                height,
                position,
                state: TransactionState::from_u8(state).unwrap_or(TransactionState::Invalid),
                median_time_past,
            })
        })()
        .expect("record header lies within the mapped file; verified on lookup")
    }

    pub fn height(&self) -> u32 {
        self.metadata().height
    }

    pub fn position(&self) -> u16 {
        self.metadata().position
    }

    pub fn state(&self) -> TransactionState {
        self.metadata().state
    }

    pub fn median_time_past(&self) -> u32 {
        self.metadata().median_time_past
    }

    pub fn is_confirmed(&self) -> bool {
        self.state() == TransactionState::Confirmed
    }

    /// Number of outputs, or `None` if the payload fails to decode.
    pub fn output_count(&self) -> Option<u64> {
        let mut reader = self.payload_reader();
        reader.skip(METADATA_SIZE)?;
        reader.read_compact_size()
    }

    /// Decode the output at `index`, including its spend marker.
    pub fn output(&self, index: u32) -> Option<OutputRecord> {
        let mut reader = self.payload_reader();
        reader.skip(METADATA_SIZE)?;
        let count = reader.read_compact_size()?;
        if u64::from(index) >= count {
            return None;
        }
        for _ in 0..index {
            reader.skip(SPEND_SIZE)?;
            let script_len = reader.read_compact_size()?;
            reader.skip(script_len as usize)?;
        }
        reader.skip(INDEX_SPEND_SIZE)?;
        let spender_height = {
            let _metadata = self.metadata_mutex.read();
            reader.read_u32_le()?
        };
        let value = reader.read_u64_le()?;
        let script_len = reader.read_compact_size()?;
        let script = reader.read_bytes(script_len as usize)?;
        Some(OutputRecord {
            value,
            script: ScriptBuf::from_bytes(script),
            spender_height,
        })
    }

    /// The previous outputs referenced by this transaction's inputs.
    pub fn input_points(&self) -> Option<Vec<OutPoint>> {
        let mut reader = self.payload_reader();
        reader.skip(METADATA_SIZE)?;
        let output_count = reader.read_compact_size()?;
        for _ in 0..output_count {
            reader.skip(SPEND_SIZE)?;
            let script_len = reader.read_compact_size()?;
            reader.skip(script_len as usize)?;
        }

        let input_count = reader.read_compact_size()?;
        let mut points = Vec::with_capacity(input_count.min(1024) as usize);
        for _ in 0..input_count {
            let hash = reader.read_array::<32>()?;
            let index = reader.read_u16_le()?;
            let script_len = reader.read_compact_size()?;
            reader.skip(script_len as usize + SEQUENCE_SIZE)?;
            points.push(OutPoint {
                txid: Txid::from_byte_array(hash),
                vout: decode_point_index(index),
            });
        }
        Some(points)
    }

    /// Decode the full transaction.
    pub fn transaction(&self) -> Option<Transaction> {
        let mut reader = self.payload_reader();
        reader.skip(METADATA_SIZE)?;

        let output_count = reader.read_compact_size()?;
        let mut output = Vec::with_capacity(output_count.min(1024) as usize);
        for _ in 0..output_count {
            reader.skip(INDEX_SPEND_SIZE + SPENDER_HEIGHT_SIZE)?;
            let value = reader.read_u64_le()?;
            let script_len = reader.read_compact_size()?;
            let script = reader.read_bytes(script_len as usize)?;
            output.push(TxOut {
                value: Amount::from_sat(value),
                script_pubkey: ScriptBuf::from_bytes(script),
            });
        }

        let input_count = reader.read_compact_size()?;
        let mut input = Vec::with_capacity(input_count.min(1024) as usize);
        for _ in 0..input_count {
            let hash = reader.read_array::<32>()?;
            let index = reader.read_u16_le()?;
            let script_len = reader.read_compact_size()?;
            let script = reader.read_bytes(script_len as usize)?;
            let sequence = reader.read_u32_le()?;
            input.push(TxIn {
                previous_output: OutPoint {
                    txid: Txid::from_byte_array(hash),
                    vout: decode_point_index(index),
                },
                script_sig: ScriptBuf::from_bytes(script),
                sequence: Sequence::from_consensus(sequence),
                witness: Witness::new(),
            });
        }

        let lock_time = reader.read_compact_size()?;
        let version = reader.read_compact_size()?;

        Some(Transaction {
            version: Version(version as u32 as i32),
            lock_time: LockTime::from_consensus(lock_time as u32),
            input,
            output,
        })
    }

    /// Overwrite the record header in place.
    pub(crate) fn write_metadata(
        &self,
        height: u32,
        median_time_past: u32,
        position: u16,
        state: TransactionState,
    ) {
        let _metadata = self.metadata_mutex.write();
        // SAFETY: the accessor pins the mapping; the header span was
        // bounds-checked on lookup, and the exclusive metadata lock
        // serializes all header access.
        let mut writer = unsafe {
            SpanWriter::new(self.access.as_ptr().add(self.payload_offset()), METADATA_SIZE)
        };
        writer.write_u32_le(height);
        writer.write_u16_le(position);
        writer.write_u8(state as u8);
        writer.write_u32_le(median_time_past);
    }

    /// Overwrite the spender height of the output at `index`.
    ///
    /// Walks the immutable payload lock-free to locate the output, then
    /// writes the 4-byte field under the exclusive metadata lock. `None` if
    /// the payload fails to decode or the index is out of range.
    pub(crate) fn write_spender_height(&self, index: u32, spender_height: u32) -> Option<()> {
        let offset = {
            let mut reader = self.payload_reader();
            reader.skip(METADATA_SIZE)?;
            let count = reader.read_compact_size()?;
            if u64::from(index) >= count {
                return None;
            }
            for _ in 0..index {
                reader.skip(SPEND_SIZE)?;
                let script_len = reader.read_compact_size()?;
                reader.skip(script_len as usize)?;
            }
            reader.skip(INDEX_SPEND_SIZE)?;
            reader.position()
        };

        let _metadata = self.metadata_mutex.write();
        // SAFETY: as for `write_metadata`; the computed offset is within the
        // record payload, which is within the mapped length.
        let mut writer = unsafe {
            SpanWriter::new(
                self.access.as_ptr().add(self.payload_offset() + offset),
                SPENDER_HEIGHT_SIZE,
            )
        };
        writer.write_u32_le(spender_height);
        Some(())
    }
}
