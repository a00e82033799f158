//! Hash-table record store over the memory-mapped file.
//!
//! The file starts with a fixed header (bucket count, committed watermark,
//! bucket heads) followed by the record heap. Each record is
//! `[hash:32][next:8][payload]` and is identified by its byte offset (its
//! link), which never changes. Records sharing a bucket form a singly-linked
//! chain with the newest record at the head.
//!
//! Allocation is two-phase: `create_record` writes the hash and payload into
//! freshly reserved, unindexed space; `link` publishes the offset into the
//! bucket head with a release compare-exchange (lookups load with acquire).
//! A crash between the two leaks bytes but never exposes a partial record.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bitcoin::hashes::Hash;
use bitcoin::Txid;
use bitstore_memory::{Accessor, FileMap};
use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::serialize::{SpanReader, SpanWriter};

const LOG_TARGET: &str = "bitstore::txdb";

const BUCKET_COUNT_SIZE: usize = 4;
const RESERVED_SIZE: usize = 4;
const WATERMARK_SIZE: usize = 8;
const BUCKET_SIZE: usize = 8;

/// Bucket count, reserved padding, watermark. The padding keeps bucket
/// cells 8-byte aligned for atomic access.
const HEADER_PREFIX_SIZE: usize = BUCKET_COUNT_SIZE + RESERVED_SIZE + WATERMARK_SIZE;
const WATERMARK_OFFSET: usize = BUCKET_COUNT_SIZE + RESERVED_SIZE;

const HASH_SIZE: usize = 32;
const NEXT_SIZE: usize = 8;

/// Per-record prefix ahead of the payload: key hash and chain link.
pub(crate) const RECORD_PREFIX_SIZE: usize = HASH_SIZE + NEXT_SIZE;

/// Bucket head and chain terminator for an empty slot.
const EMPTY_BUCKET: u64 = u64::MAX;

fn header_size(buckets: u32) -> usize {
    HEADER_PREFIX_SIZE + buckets as usize * BUCKET_SIZE
}

/// A located record: the pinned mapping plus the record's offset.
pub(crate) struct RecordElement<'a> {
    pub(crate) access: Accessor<'a>,
    pub(crate) link: u64,
}

/// A record written into reserved space but not yet reachable by hash.
pub(crate) struct UnlinkedRecord {
    link: u64,
    bucket: u32,
}

pub(crate) struct RecordTable {
    file: FileMap,
    buckets: u32,
    /// Serializes offset assignment between concurrent record allocations.
    allocate_mutex: Mutex<()>,
}

impl RecordTable {
    /// Create a fresh table file with an empty bucket array, then open it.
    pub(crate) fn create(path: &Path, buckets: u32) -> Result<Self> {
        assert!(buckets > 0, "bucket count cannot be zero");

        let header_size = header_size(buckets);
        let mut header = Vec::with_capacity(header_size);
        header.extend_from_slice(&buckets.to_le_bytes());
        header.extend_from_slice(&[0u8; RESERVED_SIZE]);
        header.extend_from_slice(&(header_size as u64).to_le_bytes());
        header.resize(header_size, 0xFF);

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)?;
        file.write_all(&header)?;
        file.sync_all()?;
        drop(file);

        tracing::debug!(
            target: LOG_TARGET,
            "Created transaction table {} ({buckets} buckets)",
            path.display()
        );
        Self::open(path, None)
    }

    /// Map an existing table file and load its header.
    ///
    /// The heap resumes at the committed watermark; any bytes past it were
    /// never published and are discarded.
    pub(crate) fn open(path: &Path, external: Option<Arc<Mutex<()>>>) -> Result<Self> {
        let file = FileMap::open_with(path, external)?;

        let (buckets, watermark) = {
            let access = file.access();
            if file.logical_size() < HEADER_PREFIX_SIZE {
                return Err(Error::Corrupt(0));
            }
            // SAFETY: the accessor pins the mapping and the prefix is within
            // the logical size checked above.
            let mut reader =
                unsafe { SpanReader::new(access.as_ptr(), HEADER_PREFIX_SIZE) };
            let buckets = reader.read_u32_le().ok_or(Error::Corrupt(0))?;
            reader.skip(RESERVED_SIZE).ok_or(Error::Corrupt(0))?;
            let watermark = reader.read_u64_le().ok_or(Error::Corrupt(0))?;
            (buckets, watermark)
        };

        let logical_size = file.logical_size() as u64;
        if buckets == 0
            || (header_size(buckets) as u64) > logical_size
            || watermark < header_size(buckets) as u64
            || watermark > logical_size
        {
            return Err(Error::Corrupt(0));
        }

        if watermark < logical_size {
            tracing::warn!(
                target: LOG_TARGET,
                "Discarding {} uncommitted bytes of {}",
                logical_size - watermark,
                path.display()
            );
            drop(file.resize(watermark as usize)?);
        }

        tracing::info!(
            target: LOG_TARGET,
            "Opened transaction table {} ({buckets} buckets, {watermark} bytes)",
            path.display()
        );

        Ok(Self {
            file,
            buckets,
            allocate_mutex: Mutex::new(()),
        })
    }

    /// Store the current logical size as the committed watermark. Durability
    /// still requires a flush; reopening resumes the heap here.
    pub(crate) fn commit(&self) {
        if self.file.stopped() {
            return;
        }
        let access = self.file.access();
        let logical_size = self.file.logical_size() as u64;
        // SAFETY: the watermark field lies within the always-mapped header.
        let mut writer =
            unsafe { SpanWriter::new(access.as_ptr().add(WATERMARK_OFFSET), WATERMARK_SIZE) };
        writer.write_u64_le(logical_size);
    }

    pub(crate) fn flush(&self) -> Result<()> {
        self.file.flush()?;
        Ok(())
    }

    /// Commit and stop the underlying map. Records stored since the last
    /// explicit commit are still committed by this path; only a crash
    /// discards back to the watermark.
    pub(crate) fn close(&self) -> bool {
        self.commit();
        self.file.stop()
    }

    pub(crate) fn size(&self) -> usize {
        self.file.size()
    }

    pub(crate) fn logical_size(&self) -> usize {
        self.file.logical_size()
    }

    fn bucket_index(&self, key: &[u8; 32]) -> u32 {
        // Remainder of the hash's low 64 bits; transaction hashes are
        // uniform, nothing fancier is needed.
        let low = u64::from_le_bytes(key[..8].try_into().expect("slice is 8 bytes; qed"));
        (low % u64::from(self.buckets)) as u32
    }

    fn bucket_cell(&self, access: &Accessor<'_>, index: u32) -> *mut u64 {
        let offset = HEADER_PREFIX_SIZE + index as usize * BUCKET_SIZE;
        // Cells are 8-byte aligned: the mapping is page-aligned and the
        // header prefix is 16 bytes.
        unsafe { access.as_ptr().add(offset) as *mut u64 }
    }

    fn bucket_head(&self, access: &Accessor<'_>, index: u32) -> u64 {
        // SAFETY: the cell is aligned, within the mapped header, and only
        // ever accessed atomically once the table is live.
        let cell: &AtomicU64 = unsafe { AtomicU64::from_ptr(self.bucket_cell(access, index)) };
        cell.load(Ordering::Acquire)
    }

    /// First record in the collision chain for `hash`.
    pub(crate) fn find(&self, hash: &Txid) -> Option<RecordElement<'_>> {
        let key = hash.to_byte_array();
        let head = {
            let access = self.file.access();
            self.bucket_head(&access, self.bucket_index(&key))
        };
        self.find_in_chain(head, &key)
    }

    /// Next record sharing `hash` after `previous` in the collision chain.
    pub(crate) fn find_next(
        &self,
        previous: &RecordElement<'_>,
        hash: &Txid,
    ) -> Option<RecordElement<'_>> {
        let key = hash.to_byte_array();
        let next = {
            let offset = previous.link as usize + HASH_SIZE;
            // SAFETY: the previous element was bounds-checked on lookup.
            let mut reader =
                unsafe { SpanReader::new(previous.access.as_ptr().add(offset), NEXT_SIZE) };
            reader.read_u64_le()?
        };
        self.find_in_chain(next, &key)
    }

    fn find_in_chain(&self, mut link: u64, key: &[u8; 32]) -> Option<RecordElement<'_>> {
        let access = self.file.access();
        let logical_size = self.file.logical_size() as u64;
        while link != EMPTY_BUCKET {
            let end = link.checked_add(RECORD_PREFIX_SIZE as u64);
            if link < header_size(self.buckets) as u64 || end.is_none_or(|end| end > logical_size)
            {
                // Dangling chain head, e.g. linked after the last commit.
                return None;
            }
            // SAFETY: the record prefix is within the logical size checked
            // above, and the accessor pins the mapping.
            let mut reader = unsafe {
                SpanReader::new(access.as_ptr().add(link as usize), RECORD_PREFIX_SIZE)
            };
            let hash = reader.read_array::<32>()?;
            if &hash == key {
                return Some(RecordElement { access, link });
            }
            link = reader.read_u64_le()?;
        }
        None
    }

    /// O(1) lookup by record offset. Only the bounds are validated; the
    /// offset itself is trusted to address a record start.
    pub(crate) fn find_link(&self, link: u64) -> Option<RecordElement<'_>> {
        let access = self.file.access();
        let end = link.checked_add(RECORD_PREFIX_SIZE as u64);
        if link < header_size(self.buckets) as u64
            || end.is_none_or(|end| end > self.file.logical_size() as u64)
        {
            return None;
        }
        Some(RecordElement { access, link })
    }

    /// Phase one: reserve space at the end of the heap and write the record
    /// bytes. The record stays invisible to lookups until `link`.
    pub(crate) fn create_record(
        &self,
        hash: &Txid,
        payload_size: usize,
        write: impl FnOnce(&mut SpanWriter),
    ) -> Result<UnlinkedRecord> {
        let key = hash.to_byte_array();
        let total = RECORD_PREFIX_SIZE + payload_size;

        let _allocate = self.allocate_mutex.lock();
        let start = self.file.logical_size();
        let allocator = self.file.reserve(start + total)?;

        // SAFETY: the span is freshly reserved and unpublished; the
        // allocator blocks growth while it is written.
        let mut writer = unsafe { SpanWriter::new(allocator.as_ptr().add(start), total) };
        writer.write_slice(&key);
        writer.write_u64_le(EMPTY_BUCKET);
        write(&mut writer);
        debug_assert_eq!(writer.position(), total, "record writer must fill the span");

        Ok(UnlinkedRecord {
            link: start as u64,
            bucket: self.bucket_index(&key),
        })
    }

    /// Phase two: publish the record into its bucket chain.
    pub(crate) fn link(&self, record: UnlinkedRecord) -> u64 {
        let access = self.file.access();
        // SAFETY: as for `bucket_head`.
        let cell: &AtomicU64 =
            unsafe { AtomicU64::from_ptr(self.bucket_cell(&access, record.bucket)) };
        let next_offset = record.link as usize + HASH_SIZE;

        let mut head = cell.load(Ordering::Acquire);
        loop {
            // SAFETY: the next field of a still-unpublished record; only
            // this thread touches it.
            let mut writer =
                unsafe { SpanWriter::new(access.as_ptr().add(next_offset), NEXT_SIZE) };
            writer.write_u64_le(head);

            // The release store publishes the record bytes to any reader
            // that observes the new head with acquire.
            match cell.compare_exchange(head, record.link, Ordering::Release, Ordering::Acquire) {
                Ok(_) => return record.link,
                Err(current) => head = current,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn txid(byte: u8) -> Txid {
        Txid::from_byte_array([byte; 32])
    }

    fn store(table: &RecordTable, hash: &Txid, payload: &[u8]) -> u64 {
        let record = table
            .create_record(hash, payload.len(), |writer| writer.write_slice(payload))
            .unwrap();
        table.link(record)
    }

    fn payload_bytes(element: &RecordElement<'_>, len: usize) -> Vec<u8> {
        let offset = element.link as usize + RECORD_PREFIX_SIZE;
        // SAFETY: the payload was written within the logical size.
        let mut reader =
            unsafe { SpanReader::new(element.access.as_ptr().add(offset), len) };
        reader.read_bytes(len).unwrap()
    }

    #[test]
    fn create_find_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("table.bin");
        let table = RecordTable::create(&path, 16).unwrap();

        assert!(table.find(&txid(1)).is_none());
        let link = store(&table, &txid(1), b"alpha");
        assert_eq!(link, header_size(16) as u64);

        let found = table.find(&txid(1)).unwrap();
        assert_eq!(found.link, link);
        assert_eq!(payload_bytes(&found, 5), b"alpha");

        let by_link = table.find_link(link).unwrap();
        assert_eq!(payload_bytes(&by_link, 5), b"alpha");
    }

    #[test]
    fn duplicate_hashes_chain_newest_first() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("table.bin");
        let table = RecordTable::create(&path, 16).unwrap();

        let first = store(&table, &txid(9), b"one");
        let second = store(&table, &txid(9), b"two");

        let head = table.find(&txid(9)).unwrap();
        assert_eq!(head.link, second);
        let tail = table.find_next(&head, &txid(9)).unwrap();
        assert_eq!(tail.link, first);
        assert!(table.find_next(&tail, &txid(9)).is_none());
    }

    #[test]
    fn unlinked_records_stay_invisible() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("table.bin");
        let table = RecordTable::create(&path, 16).unwrap();

        let record = table
            .create_record(&txid(3), 4, |writer| writer.write_slice(b"gone"))
            .unwrap();
        assert!(table.find(&txid(3)).is_none());
        table.link(record);
        assert!(table.find(&txid(3)).is_some());
    }

    #[test]
    fn colliding_buckets_resolve_by_hash() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("table.bin");
        // A single bucket forces every record into one chain.
        let table = RecordTable::create(&path, 1).unwrap();

        store(&table, &txid(1), b"aa");
        store(&table, &txid(2), b"bb");
        store(&table, &txid(3), b"cc");

        for (byte, payload) in [(1u8, b"aa"), (2, b"bb"), (3, b"cc")] {
            let found = table.find(&txid(byte)).unwrap();
            assert_eq!(payload_bytes(&found, 2), payload);
        }
        assert!(table.find(&txid(4)).is_none());
    }

    #[test]
    fn close_commits_and_reopen_restores() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("table.bin");

        let table = RecordTable::create(&path, 16).unwrap();
        let link = store(&table, &txid(7), b"keep");
        assert!(table.close());
        drop(table);

        let table = RecordTable::open(&path, None).unwrap();
        assert_eq!(table.find(&txid(7)).unwrap().link, link);
        assert_eq!(
            table.logical_size(),
            header_size(16) + RECORD_PREFIX_SIZE + 4
        );
    }

    #[test]
    fn stale_watermark_discards_uncommitted_tail() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("table.bin");

        {
            let table = RecordTable::create(&path, 16).unwrap();
            store(&table, &txid(7), b"lost");
            // Simulate a crash: bytes reach the file without a commit.
            table.flush().unwrap();
            std::mem::forget(table);
        }

        let table = RecordTable::open(&path, None).unwrap();
        assert!(table.find(&txid(7)).is_none());
        assert_eq!(table.logical_size(), header_size(16));
    }
}
