//! One tier of the disk hierarchy: a bounded collection of sorted runs.
//!
//! Slots are populated oldest-to-newest; `runs[active_run - 1]` is the
//! freshest. A level ingests either a fully sorted array (level 1, fed by
//! the memory buffer) or the k-way merge of the level above's oldest runs
//! (deeper levels). When several sources carry the same key, the record
//! from the freshest source wins, which preserves total write order per
//! key across compactions.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::types::{KVPair, Key, Value};

use super::run::DiskRun;

/// A merge-heap record: one pair plus the index of the source run it came
/// from. Ordered min-key-first; ties pop lowest source (oldest) first.
#[derive(Debug)]
struct HeapEntry {
    pair: KVPair,
    source: usize,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.pair.key == other.pair.key && self.source == other.source
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        match self.pair.key.cmp(&other.pair.key) {
            Ordering::Equal => other.source.cmp(&self.source),
            ord => ord.reverse(), // Reverse for min-heap behavior
        }
    }
}

pub struct DiskLevel {
    dir: PathBuf,
    /// 1-based level number; level 1 holds the smallest runs.
    level: usize,
    /// Pairs per run slot.
    run_size: usize,
    /// Run slots in this level.
    num_runs: usize,
    /// Runs taken together when this level compacts downward.
    merge_size: usize,
    page_size: usize,
    bf_fp: f64,

    runs: Vec<DiskRun>,
    /// Number of populated slots; `runs[..active_run]` hold data.
    active_run: usize,
}

impl DiskLevel {
    /// Create a level with `num_runs` empty pre-sized run slots.
    pub fn new(
        dir: &Path,
        level: usize,
        run_size: usize,
        num_runs: usize,
        merge_size: usize,
        page_size: usize,
        bf_fp: f64,
    ) -> Result<Self> {
        let mut runs = Vec::with_capacity(num_runs);
        for run_id in 0..num_runs {
            runs.push(DiskRun::new(dir, level, run_id, run_size, page_size, bf_fp)?);
        }
        Ok(Self {
            dir: dir.to_path_buf(),
            level,
            run_size,
            num_runs,
            merge_size,
            page_size,
            bf_fp,
            runs,
            active_run: 0,
        })
    }

    pub fn level(&self) -> usize {
        self.level
    }

    pub fn run_size(&self) -> usize {
        self.run_size
    }

    pub fn merge_size(&self) -> usize {
        self.merge_size
    }

    pub fn is_full(&self) -> bool {
        self.active_run == self.num_runs
    }

    pub fn is_empty(&self) -> bool {
        self.active_run == 0
    }

    /// The populated runs, oldest first.
    pub fn populated_runs(&self) -> &[DiskRun] {
        &self.runs[..self.active_run]
    }

    /// Total pairs held, including tombstones.
    pub fn elements(&self) -> u64 {
        self.populated_runs().iter().map(|r| r.capacity() as u64).sum()
    }

    /// Ingest a sorted, deduplicated array into the next free slot. Used by
    /// level 1 to absorb a flushed memory buffer.
    pub fn add_run_by_array(&mut self, pairs: &[KVPair]) -> Result<()> {
        if self.active_run == self.num_runs {
            return Err(Error::InvalidOperation(format!(
                "level {} is full",
                self.level
            )));
        }
        if pairs.is_empty() || pairs.len() > self.run_size {
            return Err(Error::InvalidOperation(format!(
                "batch of {} pairs does not fit run size {}",
                pairs.len(),
                self.run_size
            )));
        }
        let run = &mut self.runs[self.active_run];
        run.write_data(pairs, 0)?;
        run.construct_index();
        self.active_run += 1;
        Ok(())
    }

    /// K-way merge `sources` (oldest first) into the next free slot. For a
    /// key appearing in several sources the freshest source wins. When
    /// `last_level` is true the merge feeds an empty terminal level and
    /// tombstones are dropped: nothing below could still hold a shadowed
    /// value. The slot is only counted populated if the merge emitted
    /// anything.
    pub fn add_runs(&mut self, sources: &[DiskRun], last_level: bool) -> Result<()> {
        if self.active_run == self.num_runs {
            return Err(Error::InvalidOperation(format!(
                "level {} is full",
                self.level
            )));
        }

        let mut heap = BinaryHeap::with_capacity(sources.len());
        let mut heads = vec![0usize; sources.len()];
        for (source, run) in sources.iter().enumerate() {
            if run.capacity() > 0 {
                heap.push(HeapEntry {
                    pair: run.pair_at(0),
                    source,
                });
                heads[source] = 1;
            }
        }

        let mut emitted = 0usize;
        let mut current: Option<HeapEntry> = None;
        while let Some(entry) = heap.pop() {
            // Keep the popped source primed.
            if heads[entry.source] < sources[entry.source].capacity() {
                let next = sources[entry.source].pair_at(heads[entry.source]);
                heads[entry.source] += 1;
                heap.push(HeapEntry {
                    pair: next,
                    source: entry.source,
                });
            }

            let same_key = current
                .as_ref()
                .map_or(false, |cur| cur.pair.key == entry.pair.key);
            if same_key {
                if let Some(cur) = current.as_mut() {
                    if entry.source > cur.source {
                        *cur = entry;
                    }
                }
            } else {
                if let Some(cur) = current.take() {
                    if !(last_level && cur.pair.is_tombstone()) {
                        self.runs[self.active_run].write_pair(emitted, cur.pair);
                        emitted += 1;
                    }
                }
                current = Some(entry);
            }
        }
        if let Some(cur) = current {
            if !(last_level && cur.pair.is_tombstone()) {
                self.runs[self.active_run].write_pair(emitted, cur.pair);
                emitted += 1;
            }
        }

        let run = &mut self.runs[self.active_run];
        run.set_capacity(emitted);
        run.construct_index();
        if emitted > 0 {
            self.active_run += 1;
        }

        tracing::debug!(
            level = self.level,
            sources = sources.len(),
            pairs = emitted,
            "merged runs into level"
        );
        Ok(())
    }

    /// The oldest `merge_size` runs, next in line for compaction.
    pub fn runs_to_merge(&self) -> &[DiskRun] {
        &self.runs[..self.merge_size]
    }

    /// Reclaim the slots of the just-merged oldest runs: close them, shift
    /// the survivors forward (renaming their files to the new slot
    /// indices), and refill the tail with fresh empty runs.
    pub fn free_merged_runs(&mut self) -> Result<()> {
        if self.active_run < self.merge_size {
            return Err(Error::InvalidOperation(format!(
                "level {} has {} populated runs, cannot free {}",
                self.level, self.active_run, self.merge_size
            )));
        }
        // Unmap and close before anything is renamed onto their files.
        let merged: Vec<DiskRun> = self.runs.drain(..self.merge_size).collect();
        drop(merged);

        self.active_run -= self.merge_size;
        for run_id in 0..self.runs.len() {
            self.runs[run_id].change_run_id(run_id)?;
        }
        for run_id in self.runs.len()..self.num_runs {
            self.runs.push(DiskRun::new(
                &self.dir,
                self.level,
                run_id,
                self.run_size,
                self.page_size,
                self.bf_fp,
            )?);
        }
        Ok(())
    }

    /// Search the populated runs newest-first, skipping runs whose key
    /// bounds or bloom filter rule the key out.
    pub fn lookup(&self, key: Key) -> Option<Value> {
        for run in self.populated_runs().iter().rev() {
            if key < run.min_key() || key > run.max_key() || !run.may_contain(key) {
                continue;
            }
            if let Some(value) = run.lookup(key) {
                return Some(value);
            }
        }
        None
    }
}
