//! A single immutable sorted run persisted through a memory-mapped file.
//!
//! ## On-disk layout
//!
//! A run file is `capacity` consecutive pairs, each 16 bytes: key then
//! value, both signed 64-bit little-endian. No header, no footer. Files are
//! scratch — they are truncated on open and never recovered across process
//! restarts.
//!
//! ```text
//! +----------------+----------------+
//! | key 0 (i64 LE) | val 0 (i64 LE) |
//! +----------------+----------------+
//! | key 1          | val 1          |
//! +----------------+----------------+
//! | ...                             |
//! +---------------------------------+
//! ```
//!
//! Lookups run in two steps: the fence pointers (the key at every
//! `page_size`-th position) narrow the search to one page, then a binary
//! search over that page finds the pair. A bloom filter over the run's keys
//! lets callers skip the run entirely for most absent keys.

use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

use byteorder::{ByteOrder, LittleEndian};
use memmap2::MmapMut;

use crate::bloom::BloomFilter;
use crate::error::{Error, Result};
use crate::types::{KVPair, Key, Value, PAIR_SIZE};

pub struct DiskRun {
    map: MmapMut,
    // Held for the lifetime of the mapping.
    _file: File,
    path: PathBuf,
    level: usize,
    run_id: usize,

    /// Logical pair count; at most the allocated file capacity. Shrunk by
    /// `set_capacity` when a merge deduplicated its inputs.
    capacity: usize,
    /// Fence-pointer stride in pairs.
    page_size: usize,
    fence_pointers: Vec<Key>,
    /// Index of the last valid fence pointer.
    max_fp: usize,
    min_key: Key,
    max_key: Key,
    bf_fp: f64,
    bloom: BloomFilter,
}

impl DiskRun {
    /// Create the backing file `C_<level>_<run_id>.dat` in `dir`, truncate
    /// it, extend it to hold `capacity` pairs, and map it read-write.
    pub fn new(
        dir: &Path,
        level: usize,
        run_id: usize,
        capacity: usize,
        page_size: usize,
        bf_fp: f64,
    ) -> Result<Self> {
        let path = dir.join(format!("C_{}_{}.dat", level, run_id));
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        file.set_len((capacity * PAIR_SIZE) as u64)?;
        let map = unsafe { MmapMut::map_mut(&file)? };

        Ok(Self {
            map,
            _file: file,
            path,
            level,
            run_id,
            capacity,
            page_size,
            fence_pointers: Vec::new(),
            max_fp: 0,
            min_key: Key::MAX,
            max_key: Key::MIN,
            bf_fp,
            bloom: BloomFilter::new(capacity as u64, bf_fp),
        })
    }

    /// Logical number of pairs in the run.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Pairs the backing file can hold.
    fn allocated(&self) -> usize {
        self.map.len() / PAIR_SIZE
    }

    pub fn min_key(&self) -> Key {
        self.min_key
    }

    pub fn max_key(&self) -> Key {
        self.max_key
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Slot index within the owning level.
    pub fn run_id(&self) -> usize {
        self.run_id
    }

    /// Read the pair at position `i` of the mapping.
    pub fn pair_at(&self, i: usize) -> KVPair {
        let off = i * PAIR_SIZE;
        KVPair {
            key: LittleEndian::read_i64(&self.map[off..off + 8]),
            value: LittleEndian::read_i64(&self.map[off + 8..off + 16]),
        }
    }

    /// Write the pair at position `i` of the mapping.
    pub(crate) fn write_pair(&mut self, i: usize, kv: KVPair) {
        let off = i * PAIR_SIZE;
        LittleEndian::write_i64(&mut self.map[off..off + 8], kv.key);
        LittleEndian::write_i64(&mut self.map[off + 8..off + 16], kv.value);
    }

    /// Copy `pairs` into the mapping starting at `offset` and set the
    /// logical capacity to the written length.
    pub fn write_data(&mut self, pairs: &[KVPair], offset: usize) -> Result<()> {
        if offset + pairs.len() > self.allocated() {
            return Err(Error::InvalidOperation(format!(
                "write of {} pairs at offset {} exceeds run capacity {}",
                pairs.len(),
                offset,
                self.allocated()
            )));
        }
        for (i, kv) in pairs.iter().enumerate() {
            self.write_pair(offset + i, *kv);
        }
        self.capacity = pairs.len();
        Ok(())
    }

    /// Shrink the logical length after a merge produced fewer pairs than
    /// the slot was sized for. Must be followed by [`construct_index`].
    ///
    /// [`construct_index`]: DiskRun::construct_index
    pub fn set_capacity(&mut self, capacity: usize) {
        self.capacity = capacity;
    }

    /// Scan the run once, rebuilding the bloom filter, the fence pointers
    /// and the key bounds. The run is queryable afterwards.
    pub fn construct_index(&mut self) {
        self.bloom = BloomFilter::new(self.capacity as u64, self.bf_fp);
        self.fence_pointers = Vec::with_capacity(self.capacity / self.page_size + 1);
        self.max_fp = 0;
        for j in 0..self.capacity {
            let kv = self.pair_at(j);
            self.bloom.add(kv.key);
            if j % self.page_size == 0 {
                self.fence_pointers.push(kv.key);
                if j != 0 {
                    self.max_fp += 1;
                }
            }
        }
        if self.capacity > 0 {
            self.min_key = self.pair_at(0).key;
            self.max_key = self.pair_at(self.capacity - 1).key;
        } else {
            self.min_key = Key::MAX;
            self.max_key = Key::MIN;
        }
    }

    /// Whether the bloom filter admits the key.
    pub fn may_contain(&self, key: Key) -> bool {
        self.bloom.may_contain(key)
    }

    pub fn lookup(&self, key: Key) -> Option<Value> {
        let (idx, found) = self.get_index(key);
        found.then(|| self.pair_at(idx).value)
    }

    /// Locate `key`: `(position, true)` on a hit, `(insertion_point, false)`
    /// on a miss, where the insertion point is the first position whose key
    /// is not less than `key`.
    pub fn get_index(&self, key: Key) -> (usize, bool) {
        let (start, end) = self.fence_segment(key);
        self.search_pairs(start, end, key)
    }

    /// Narrow the search to the one page that can contain `key`.
    fn fence_segment(&self, key: Key) -> (usize, usize) {
        if self.max_fp == 0 {
            (0, self.capacity)
        } else if key < self.fence_pointers[1] {
            (0, self.page_size)
        } else if key >= self.fence_pointers[self.max_fp] {
            (self.max_fp * self.page_size, self.capacity)
        } else {
            // Last fence pointer at or below the key; the page it opens
            // runs up to the next fence.
            let m = self.fence_pointers[..=self.max_fp].partition_point(|&f| f <= key) - 1;
            (m * self.page_size, (m + 1) * self.page_size)
        }
    }

    /// Lower-bound binary search over `[start, end)`.
    fn search_pairs(&self, start: usize, end: usize, key: Key) -> (usize, bool) {
        let (mut lo, mut hi) = (start, end);
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            if self.pair_at(mid).key < key {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        let found = lo < end && self.pair_at(lo).key == key;
        (lo, found)
    }

    /// Bounds `(i1, i2)` of the half-open key range `[k1, k2)`, or `(0, 0)`
    /// when the range is disjoint from the run. The caller iterates
    /// positions `i1..i2`.
    pub fn range(&self, k1: Key, k2: Key) -> (usize, usize) {
        if k1 > self.max_key || k2 < self.min_key {
            return (0, 0);
        }
        let i1 = if k1 < self.min_key {
            0
        } else {
            self.get_index(k1).0
        };
        let i2 = if k2 > self.max_key {
            self.capacity
        } else {
            self.get_index(k2).0
        };
        (i1, i2)
    }

    /// Rename the backing file when the run moves to a new slot during
    /// compaction, keeping filenames unique per `(level, slot)`.
    pub fn change_run_id(&mut self, run_id: usize) -> Result<()> {
        let new_path = self
            .path
            .parent()
            .map(|p| p.to_path_buf())
            .unwrap_or_default()
            .join(format!("C_{}_{}.dat", self.level, run_id));
        fs::rename(&self.path, &new_path)?;
        self.run_id = run_id;
        self.path = new_path;
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn fence_pointers(&self) -> &[Key] {
        &self.fence_pointers
    }
}
