use std::fmt;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

use byteorder::{ByteOrder, LittleEndian};
use memmap2::{Mmap, MmapMut, MmapOptions};
use tracing::{debug, trace};

use crate::error::{StoreError, StoreResult};

/// On-disk width of one index entry: three consecutive little-endian i64
/// fields in the order `offset, position, length`.
pub const INDEX_ENTRY_WIDTH: usize = 24;

/// Locates one payload inside a segment's data file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexEntry {
    pub offset: i64,
    pub position: i64,
    pub length: i64,
}

impl IndexEntry {
    /// Packs the entry into `buf` in the on-disk field order. `buf` must be
    /// at least [`INDEX_ENTRY_WIDTH`] bytes.
    pub fn encode_into(&self, buf: &mut [u8]) {
        LittleEndian::write_i64(&mut buf[0..8], self.offset);
        LittleEndian::write_i64(&mut buf[8..16], self.position);
        LittleEndian::write_i64(&mut buf[16..24], self.length);
    }

    /// Reads an entry from the first [`INDEX_ENTRY_WIDTH`] bytes of `buf`.
    pub fn decode_from(buf: &[u8]) -> Self {
        IndexEntry {
            offset: LittleEndian::read_i64(&buf[0..8]),
            position: LittleEndian::read_i64(&buf[8..16]),
            length: LittleEndian::read_i64(&buf[16..24]),
        }
    }
}

enum IndexMapping {
    Writable(MmapMut),
    ReadOnly(Mmap),
}

impl IndexMapping {
    fn as_slice(&self) -> &[u8] {
        match self {
            IndexMapping::Writable(mmap) => &mmap[..],
            IndexMapping::ReadOnly(mmap) => &mmap[..],
        }
    }

    fn len(&self) -> usize {
        self.as_slice().len()
    }
}

/// A fixed-width entry array backed by a file mapping.
///
/// Slot `k` of a segment starting at offset `start` holds the entry for
/// offset `start + k`, so lookup is arithmetic on the first slot rather than
/// a search. The mapping is always a whole number of slots; unwritten tail
/// slots are zero bytes. The single owner of the mapping replaces it wholesale
/// on growth, so no view of the old region survives a resize.
pub struct SegmentIndex {
    path: PathBuf,
    mapping: IndexMapping,
    /// Byte offset of the next free slot. Recovered, then frozen, for
    /// read-only mappings.
    cursor: usize,
    growth_factor: u64,
}

impl SegmentIndex {
    /// Creates a new index file truncated to `initial_size` (aligned up to a
    /// whole number of slots) and maps it read-write.
    pub fn create<P: AsRef<Path>>(
        path: P,
        initial_size: u64,
        growth_factor: u64,
    ) -> StoreResult<Self> {
        let path = path.as_ref().to_path_buf();
        let size = align_to_slots(initial_size.max(INDEX_ENTRY_WIDTH as u64));

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .map_err(|e| StoreError::io(&path, e))?;
        file.set_len(size).map_err(|e| StoreError::io(&path, e))?;

        let mmap = unsafe { MmapOptions::new().len(size as usize).map_mut(&file) }
            .map_err(|e| StoreError::io(&path, e))?;

        let index = SegmentIndex {
            path,
            mapping: IndexMapping::Writable(mmap),
            cursor: 0,
            growth_factor,
        };
        debug!("{:?}: created", index);
        Ok(index)
    }

    /// Maps an existing index file read-only at its current on-disk size and
    /// recovers the populated slot count from the entries themselves.
    pub fn open_read_only<P: AsRef<Path>>(path: P) -> StoreResult<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .open(&path)
            .map_err(|e| StoreError::io(&path, e))?;
        let mmap =
            unsafe { MmapOptions::new().map(&file) }.map_err(|e| StoreError::io(&path, e))?;

        let cursor = recovered_cursor(&mmap[..]);
        let index = SegmentIndex {
            path,
            mapping: IndexMapping::ReadOnly(mmap),
            cursor,
            growth_factor: 0,
        };
        debug!("{:?}: opened read-only", index);
        Ok(index)
    }

    /// Appends one entry at the cursor, growing the mapping first when full.
    pub fn append(&mut self, entry: IndexEntry) -> StoreResult<()> {
        if matches!(self.mapping, IndexMapping::ReadOnly(_)) {
            return Err(StoreError::IndexReadOnly);
        }
        if self.cursor + INDEX_ENTRY_WIDTH > self.mapping.len() {
            self.grow()?;
        }

        let mmap = match &mut self.mapping {
            IndexMapping::Writable(mmap) => mmap,
            IndexMapping::ReadOnly(_) => unreachable!("checked above"),
        };
        entry.encode_into(&mut mmap[self.cursor..self.cursor + INDEX_ENTRY_WIDTH]);
        self.cursor += INDEX_ENTRY_WIDTH;
        trace!("{:?}: appended entry for offset {}", self, entry.offset);
        Ok(())
    }

    /// Returns the entry whose `offset` field equals `offset`.
    ///
    /// The slot is computed relative to the first entry; offsets outside the
    /// populated range, and slots whose stored offset disagrees with the
    /// dense layout, yield [`StoreError::OffsetOutOfRange`].
    pub fn lookup(&self, offset: u64) -> StoreResult<IndexEntry> {
        let populated = self.len();
        if populated == 0 {
            return Err(StoreError::OffsetOutOfRange { offset });
        }

        let data = self.mapping.as_slice();
        let first = IndexEntry::decode_from(&data[..INDEX_ENTRY_WIDTH]);
        let distance = offset as i64 - first.offset;
        if distance < 0 || distance as usize >= populated {
            return Err(StoreError::OffsetOutOfRange { offset });
        }
        if distance == 0 {
            return Ok(first);
        }

        let start = distance as usize * INDEX_ENTRY_WIDTH;
        let entry = IndexEntry::decode_from(&data[start..start + INDEX_ENTRY_WIDTH]);
        if entry.offset != offset as i64 {
            return Err(StoreError::OffsetOutOfRange { offset });
        }
        Ok(entry)
    }

    /// Synchronously flushes the mapping to disk. A no-op for read-only
    /// mappings, and safe to call repeatedly. The mapping itself is released
    /// on drop.
    pub fn flush(&self) -> StoreResult<()> {
        match &self.mapping {
            IndexMapping::Writable(mmap) => {
                mmap.flush().map_err(|e| StoreError::io(&self.path, e))
            }
            IndexMapping::ReadOnly(_) => Ok(()),
        }
    }

    /// Number of populated slots.
    pub fn len(&self) -> usize {
        self.cursor / INDEX_ENTRY_WIDTH
    }

    pub fn is_empty(&self) -> bool {
        self.cursor == 0
    }

    /// Size of the mapped region in bytes. Always a multiple of the entry
    /// width.
    pub fn capacity_bytes(&self) -> usize {
        self.mapping.len()
    }

    pub fn is_read_only(&self) -> bool {
        matches!(self.mapping, IndexMapping::ReadOnly(_))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn grow(&mut self) -> StoreResult<()> {
        let old_size = self.mapping.len() as u64;
        let needed = (self.cursor + INDEX_ENTRY_WIDTH) as u64;
        let new_size = align_to_slots((old_size * self.growth_factor).max(needed));
        debug!(
            "{:?}: resizing mapping from {} to {} bytes",
            self, old_size, new_size
        );

        // The outgoing mapping must reach disk before the view is replaced.
        self.flush()?;

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&self.path)
            .map_err(|e| StoreError::io(&self.path, e))?;
        file.set_len(new_size)
            .map_err(|e| StoreError::io(&self.path, e))?;
        let mmap = unsafe { MmapOptions::new().len(new_size as usize).map_mut(&file) }
            .map_err(|e| StoreError::io(&self.path, e))?;

        // Assignment drops the old mapping; no aliased view outlives the resize.
        self.mapping = IndexMapping::Writable(mmap);
        Ok(())
    }
}

impl fmt::Debug for SegmentIndex {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "SegmentIndex {{ path: {:?}, slots: {}/{}, read_only: {} }}",
            &self.path,
            self.len(),
            self.capacity_bytes() / INDEX_ENTRY_WIDTH,
            self.is_read_only()
        )
    }
}

fn align_to_slots(bytes: u64) -> u64 {
    let width = INDEX_ENTRY_WIDTH as u64;
    ((bytes + width - 1) / width) * width
}

/// Counts the populated prefix of a mapped region. Entries are dense with
/// stride 1 starting at the first slot's offset, and live offsets are never
/// zero, so the first slot that breaks the progression marks the tail.
fn recovered_cursor(data: &[u8]) -> usize {
    if data.len() < INDEX_ENTRY_WIDTH {
        return 0;
    }
    let first = IndexEntry::decode_from(&data[..INDEX_ENTRY_WIDTH]);
    if first.offset == 0 {
        return 0;
    }

    let mut slots = 1;
    while (slots + 1) * INDEX_ENTRY_WIDTH <= data.len() {
        let start = slots * INDEX_ENTRY_WIDTH;
        let entry = IndexEntry::decode_from(&data[start..start + INDEX_ENTRY_WIDTH]);
        if entry.offset != first.offset + slots as i64 {
            break;
        }
        slots += 1;
    }
    slots * INDEX_ENTRY_WIDTH
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_entry_encodes_little_endian_field_order() {
        let entry = IndexEntry {
            offset: 1,
            position: 0,
            length: 150,
        };
        let mut buf = [0u8; INDEX_ENTRY_WIDTH];
        entry.encode_into(&mut buf);
        let expected = [
            1, 0, 0, 0, 0, 0, 0, 0, //
            0, 0, 0, 0, 0, 0, 0, 0, //
            150, 0, 0, 0, 0, 0, 0, 0,
        ];
        assert_eq!(buf, expected);
    }

    #[test]
    fn test_entry_decode_roundtrip() {
        let entry = IndexEntry {
            offset: 300,
            position: 100,
            length: 150,
        };
        let mut buf = [0u8; INDEX_ENTRY_WIDTH];
        entry.encode_into(&mut buf);
        assert_eq!(IndexEntry::decode_from(&buf), entry);
    }

    #[test]
    fn test_create_aligns_file_to_slot_multiple() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("aligned.index");
        let index = SegmentIndex::create(&path, 50, 2).expect("create");

        assert_eq!(index.capacity_bytes(), 72); // 50 aligned up to 3 slots
        assert_eq!(index.capacity_bytes() % INDEX_ENTRY_WIDTH, 0);
        let on_disk = std::fs::metadata(&path).expect("stat").len();
        assert_eq!(on_disk, 72);
    }

    #[test]
    fn test_append_writes_slot_zero() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("append.index");
        let mut index = SegmentIndex::create(&path, 1024, 2).expect("create");

        let entry = IndexEntry {
            offset: 300,
            position: 100,
            length: 150,
        };
        index.append(entry).expect("append");
        assert_eq!(index.len(), 1);
        assert_eq!(index.lookup(300).expect("lookup"), entry);
    }

    #[test]
    fn test_append_grows_full_mapping() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("grow.index");
        // room for exactly one entry
        let mut index = SegmentIndex::create(&path, 24, 2).expect("create");

        for k in 0..5i64 {
            index
                .append(IndexEntry {
                    offset: 10 + k,
                    position: k * 100,
                    length: 100,
                })
                .expect("append");
        }

        assert_eq!(index.len(), 5);
        assert!(index.capacity_bytes() >= 5 * INDEX_ENTRY_WIDTH);
        assert_eq!(index.capacity_bytes() % INDEX_ENTRY_WIDTH, 0);
        let on_disk = std::fs::metadata(&path).expect("stat").len();
        assert_eq!(on_disk as usize, index.capacity_bytes());
        for k in 0..5i64 {
            assert_eq!(index.lookup((10 + k) as u64).expect("lookup").position, k * 100);
        }
    }

    #[test]
    fn test_lookup_is_slot_arithmetic() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("lookup.index");
        let mut index = SegmentIndex::create(&path, 1024, 2).expect("create");

        for k in 0..5i64 {
            index
                .append(IndexEntry {
                    offset: 1 + k,
                    position: k * 150,
                    length: 150,
                })
                .expect("append");
        }

        assert_eq!(index.lookup(1).expect("first").position, 0);
        assert_eq!(index.lookup(3).expect("middle").position, 300);
        assert_eq!(index.lookup(5).expect("last").position, 600);
    }

    #[test]
    fn test_lookup_rejects_out_of_range() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("bounds.index");
        let mut index = SegmentIndex::create(&path, 1024, 2).expect("create");
        index
            .append(IndexEntry {
                offset: 5,
                position: 0,
                length: 10,
            })
            .expect("append");

        assert!(matches!(
            index.lookup(4),
            Err(StoreError::OffsetOutOfRange { offset: 4 })
        ));
        assert!(matches!(
            index.lookup(6),
            Err(StoreError::OffsetOutOfRange { offset: 6 })
        ));
    }

    #[test]
    fn test_read_only_reopen_recovers_entries() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("reopen.index");
        {
            let mut index = SegmentIndex::create(&path, 4096, 2).expect("create");
            for k in 0..3i64 {
                index
                    .append(IndexEntry {
                        offset: 7 + k,
                        position: k * 20,
                        length: 20,
                    })
                    .expect("append");
            }
            index.flush().expect("flush");
        }

        let reopened = SegmentIndex::open_read_only(&path).expect("reopen");
        assert!(reopened.is_read_only());
        assert_eq!(reopened.len(), 3);
        assert_eq!(reopened.lookup(8).expect("lookup").position, 20);
        assert!(matches!(
            reopened.lookup(10),
            Err(StoreError::OffsetOutOfRange { .. })
        ));
    }

    #[test]
    fn test_read_only_append_rejected() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("frozen.index");
        {
            let mut index = SegmentIndex::create(&path, 4096, 2).expect("create");
            index
                .append(IndexEntry {
                    offset: 1,
                    position: 0,
                    length: 9,
                })
                .expect("append");
            index.flush().expect("flush");
        }

        let mut reopened = SegmentIndex::open_read_only(&path).expect("reopen");
        let err = reopened
            .append(IndexEntry {
                offset: 2,
                position: 9,
                length: 9,
            })
            .expect_err("read-only append must fail");
        assert!(matches!(err, StoreError::IndexReadOnly));
        assert_eq!(reopened.len(), 1);
    }
}
