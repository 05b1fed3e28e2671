//! The LSM engine: the memory buffer, the disk levels, and the single
//! background merge worker that ties them together.
//!
//! # Write path
//!
//! 1. `put` upserts into the active memory run and its bloom filter
//! 2. A full active run seals itself by advancing the active index
//! 3. When every memory run is sealed, the oldest batch is flushed: sorted,
//!    deduplicated (freshest write per key wins) and written as one level-1
//!    disk run
//! 4. A full level compacts recursively into the level below before
//!    accepting the incoming batch, growing the level stack on demand
//!
//! # Read path
//!
//! 1. Memory runs, newest first, guarded by key bounds and bloom filters
//! 2. A wait barrier on the in-flight merge, so disk state is stable
//! 3. Disk levels in order, and within a level its runs newest first
//!
//! At most one merge runs at a time; `put` only suspends when it must seal
//! a batch while the previous merge is still running. The freshest
//! occurrence of a key always shadows older ones, and a tombstone shadows
//! them into nonexistence.

use std::collections::HashSet;
use std::fs;
use std::sync::{Arc, Mutex};

use tokio::task::{self, JoinHandle};

use crate::bloom::BloomFilter;
use crate::config::LsmConfig;
use crate::disk::DiskLevel;
use crate::error::Result;
use crate::memrun::MemRun;
use crate::types::{KVPair, Key, Value, TOMBSTONE};

/// Per-component element counts, including tombstones.
#[derive(Debug, Clone)]
pub struct LsmStats {
    /// Distinct keys across the memory runs.
    pub buffer_elements: u64,
    /// Pairs per disk level, shallowest first.
    pub level_elements: Vec<u64>,
}

/// A log-structured merge-tree over 64-bit integer keys and values.
///
/// Single-writer: callers serialize access; the only concurrency inside is
/// the one background merge task, synchronized through a join barrier.
pub struct Lsm {
    config: LsmConfig,
    num_to_merge: usize,

    /// Memory runs, oldest first. `c0[active_run]` accepts writes; runs
    /// below it are sealed, awaiting flush.
    c0: Vec<MemRun>,
    /// One filter per memory run, tracking every key ever inserted into it.
    filters: Vec<BloomFilter>,
    active_run: usize,

    /// Disk levels, shallowest first. Shared with the merge worker, which
    /// is the only mutator while it runs.
    levels: Arc<Mutex<Vec<DiskLevel>>>,
    /// The in-flight merge, if any. Awaiting it is the read barrier and
    /// resurfaces any error the merge hit.
    merge: Option<JoinHandle<Result<()>>>,
}

impl Lsm {
    /// Open an engine in `config.dir`, creating the directory and the
    /// first disk level.
    pub fn new(config: LsmConfig) -> Result<Self> {
        config.validate()?;
        fs::create_dir_all(&config.dir)?;

        let num_to_merge = config.num_to_merge();
        let level1 = DiskLevel::new(
            &config.dir,
            1,
            num_to_merge * config.elts_per_run,
            config.disk_runs_per_level,
            config.disk_merge_size(),
            config.page_size,
            config.bf_fp,
        )?;

        let mut c0 = Vec::with_capacity(config.num_runs);
        let mut filters = Vec::with_capacity(config.num_runs);
        for _ in 0..config.num_runs {
            c0.push(MemRun::new());
            filters.push(BloomFilter::new(config.elts_per_run as u64, config.bf_fp));
        }

        Ok(Self {
            config,
            num_to_merge,
            c0,
            filters,
            active_run: 0,
            levels: Arc::new(Mutex::new(vec![level1])),
            merge: None,
        })
    }

    /// Insert or overwrite a pair. Suspends only when the buffer must
    /// flush while the previous merge is still in flight.
    pub async fn put(&mut self, key: Key, value: Value) -> Result<()> {
        if self.c0[self.active_run].len() >= self.config.elts_per_run {
            self.active_run += 1;
        }
        if self.active_run == self.config.num_runs {
            self.flush().await?;
        }
        self.c0[self.active_run].insert(KVPair::new(key, value));
        self.filters[self.active_run].add(key);
        Ok(())
    }

    /// Delete a key by writing a tombstone over it.
    pub async fn delete(&mut self, key: Key) -> Result<()> {
        self.put(key, TOMBSTONE).await
    }

    /// Look up the live value for a key. A tombstone is a definitive miss:
    /// it shadows anything older.
    pub async fn get(&mut self, key: Key) -> Result<Option<Value>> {
        for i in (0..=self.active_run).rev() {
            let run = &self.c0[i];
            if key < run.min() || key > run.max() || !self.filters[i].may_contain(key) {
                continue;
            }
            if let Some(value) = run.lookup(key) {
                return Ok((value != TOMBSTONE).then_some(value));
            }
        }

        // Disk state is only stable once the merge worker is drained.
        self.wait_for_merge().await?;
        let levels = self.levels.lock()?;
        for level in levels.iter() {
            if let Some(value) = level.lookup(key) {
                return Ok((value != TOMBSTONE).then_some(value));
            }
        }
        Ok(None)
    }

    /// All live pairs with `k1 <= key < k2`, each key exactly once, in
    /// traversal order (freshest occurrence first, not sorted by key).
    pub async fn range_scan(&mut self, k1: Key, k2: Key) -> Result<Vec<KVPair>> {
        if k2 <= k1 {
            return Ok(Vec::new());
        }

        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for i in (0..=self.active_run).rev() {
            for kv in self.c0[i].all_in_range(k1, k2) {
                // Record the key even for tombstones, so older occurrences
                // stay suppressed.
                if seen.insert(kv.key) && !kv.is_tombstone() {
                    out.push(kv);
                }
            }
        }

        self.wait_for_merge().await?;
        let levels = self.levels.lock()?;
        for level in levels.iter() {
            for run in level.populated_runs().iter().rev() {
                let (i1, i2) = run.range(k1, k2);
                for m in i1..i2 {
                    let kv = run.pair_at(m);
                    if seen.insert(kv.key) && !kv.is_tombstone() {
                        out.push(kv);
                    }
                }
            }
        }
        Ok(out)
    }

    /// Element counts for the buffer and every disk level.
    pub async fn stats(&mut self) -> Result<LsmStats> {
        self.wait_for_merge().await?;
        let buffer_elements = self.c0[..=self.active_run]
            .iter()
            .map(|run| run.len() as u64)
            .sum();
        let levels = self.levels.lock()?;
        Ok(LsmStats {
            buffer_elements,
            level_elements: levels.iter().map(|level| level.elements()).collect(),
        })
    }

    /// Drain the background worker. Idempotent.
    pub async fn close(&mut self) -> Result<()> {
        self.wait_for_merge().await
    }

    /// Seal the oldest `num_to_merge` memory runs and hand them to the
    /// background worker; the buffer is immediately ready for new writes.
    async fn flush(&mut self) -> Result<()> {
        let sealed: Vec<MemRun> = self.c0.drain(..self.num_to_merge).collect();
        self.filters.drain(..self.num_to_merge);
        self.active_run -= self.num_to_merge;
        for _ in 0..self.num_to_merge {
            self.c0.push(MemRun::new());
            self.filters
                .push(BloomFilter::new(self.config.elts_per_run as u64, self.config.bf_fp));
        }

        // At most one merge in flight.
        self.wait_for_merge().await?;

        let levels = Arc::clone(&self.levels);
        let config = self.config.clone();
        self.merge = Some(task::spawn_blocking(move || {
            flush_buffer(sealed, levels, config)
        }));
        Ok(())
    }

    /// Join barrier on the in-flight merge. Propagates both join failures
    /// and the merge's own error, so a failed compaction surfaces on the
    /// next call instead of deadlocking readers.
    async fn wait_for_merge(&mut self) -> Result<()> {
        match self.merge.take() {
            Some(handle) => handle.await?,
            None => Ok(()),
        }
    }
}

/// Background half of a flush: collapse the sealed runs into one sorted,
/// deduplicated array and push it into level 1, compacting downward first
/// if level 1 is full.
fn flush_buffer(
    sealed: Vec<MemRun>,
    levels: Arc<Mutex<Vec<DiskLevel>>>,
    config: LsmConfig,
) -> Result<()> {
    let mut pairs: Vec<KVPair> = Vec::with_capacity(sealed.iter().map(|r| r.len()).sum());
    for run in &sealed {
        pairs.extend(run.all());
    }
    // Stable sort over oldest-to-newest input: for a duplicated key the
    // freshest write sorts last, so keep-last resolves every key to its
    // most recent value.
    pairs.sort_by_key(|kv| kv.key);
    let mut merged: Vec<KVPair> = Vec::with_capacity(pairs.len());
    for kv in pairs {
        match merged.last_mut() {
            Some(last) if last.key == kv.key => *last = kv,
            _ => merged.push(kv),
        }
    }
    if merged.is_empty() {
        return Ok(());
    }

    tracing::debug!(pairs = merged.len(), "flushing memory buffer to level 1");
    let mut levels = levels.lock()?;
    if levels[0].is_full() {
        merge_into_level(&mut levels, 1, &config)?;
    }
    levels[0].add_run_by_array(&merged)
}

/// Cascading compaction: merge the oldest runs of `levels[level - 1]` into
/// `levels[level]`, first making room below (recursively) and growing the
/// stack when the target level does not exist yet. Run sizes multiply by
/// the merge fan-in at each deeper level.
fn merge_into_level(levels: &mut Vec<DiskLevel>, level: usize, config: &LsmConfig) -> Result<()> {
    if level == levels.len() {
        let last = &levels[level - 1];
        let run_size = last.run_size() * last.merge_size();
        tracing::info!(level = level + 1, run_size, "creating disk level");
        levels.push(DiskLevel::new(
            &config.dir,
            level + 1,
            run_size,
            config.disk_runs_per_level,
            config.disk_merge_size(),
            config.page_size,
            config.bf_fp,
        )?);
    }
    if levels[level].is_full() {
        merge_into_level(levels, level + 1, config)?;
    }

    // Tombstones can only be dropped when nothing below could still hold a
    // value they shadow.
    let last_level = level + 1 == levels.len() && levels[level].is_empty();
    let (upper, lower) = levels.split_at_mut(level);
    lower[0].add_runs(upper[level - 1].runs_to_merge(), last_level)?;
    upper[level - 1].free_merged_runs()?;

    tracing::info!(from = level, to = level + 1, "compacted runs into deeper level");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tmpfs::TempDir;
    use std::collections::HashSet;

    fn small_config(dir: &TempDir) -> LsmConfig {
        LsmConfig::new(dir.path())
            .elts_per_run(4)
            .num_runs(2)
            .merged_frac(1.0)
            .bf_fp(0.001)
            .page_size(2)
            .disk_runs_per_level(2)
    }

    /// Eight puts fill the buffer; the ninth triggers exactly one flush.
    async fn fill_and_flush(lsm: &mut Lsm) -> Result<()> {
        for (k, v) in [(1, 10), (3, 30), (5, 50), (7, 70), (2, 20), (4, 40), (6, 60), (8, 80)] {
            lsm.put(k, v).await?;
        }
        lsm.put(9, 90).await
    }

    #[tokio::test]
    async fn test_flush_to_level_one() -> Result<()> {
        let dir = TempDir::new().unwrap();
        let mut lsm = Lsm::new(small_config(&dir))?;
        fill_and_flush(&mut lsm).await?;

        assert_eq!(lsm.get(5).await?, Some(50));
        assert_eq!(lsm.get(9).await?, Some(90));

        {
            let levels = lsm.levels.lock().unwrap();
            assert_eq!(levels[0].populated_runs().len(), 1);
            let run = &levels[0].populated_runs()[0];
            assert_eq!(run.capacity(), 8);
            let contents: Vec<(i64, i64)> = (0..8)
                .map(|i| {
                    let kv = run.pair_at(i);
                    (kv.key, kv.value)
                })
                .collect();
            assert_eq!(
                contents,
                vec![(1, 10), (2, 20), (3, 30), (4, 40), (5, 50), (6, 60), (7, 70), (8, 80)]
            );
        }
        lsm.close().await
    }

    #[tokio::test]
    async fn test_tombstone_shadows_disk_value() -> Result<()> {
        let dir = TempDir::new().unwrap();
        let mut lsm = Lsm::new(small_config(&dir))?;
        fill_and_flush(&mut lsm).await?;

        lsm.delete(5).await?;
        assert_eq!(lsm.get(5).await?, None);

        let scan = lsm.range_scan(1, 10).await?;
        let keys: HashSet<i64> = scan.iter().map(|kv| kv.key).collect();
        assert!(!keys.contains(&5));
        assert_eq!(keys, HashSet::from([1, 2, 3, 4, 6, 7, 8, 9]));
        lsm.close().await
    }

    #[tokio::test]
    async fn test_overwrite_survives_compaction() -> Result<()> {
        let dir = TempDir::new().unwrap();
        let mut lsm = Lsm::new(small_config(&dir))?;
        fill_and_flush(&mut lsm).await?;

        lsm.put(5, 500).await?;
        assert_eq!(lsm.get(5).await?, Some(500));

        // Fill the buffer again so (5, 500) lands in the fresher level-1
        // slot, above the stale (5, 50).
        for k in [10, 11, 12, 13, 14, 15] {
            lsm.put(k, k).await?;
        }
        lsm.put(16, 16).await?;
        assert_eq!(lsm.get(5).await?, Some(500));

        // Level 1 is now full; the next flush cascades it into a lazily
        // created level 2.
        for k in [17, 18, 19, 20, 21, 22, 23] {
            lsm.put(k, k).await?;
        }
        lsm.put(24, 24).await?;
        assert_eq!(lsm.get(5).await?, Some(500));

        {
            let levels = lsm.levels.lock().unwrap();
            assert_eq!(levels.len(), 2);
            // Sixteen pairs merged down, minus the duplicate of key 5.
            assert_eq!(levels[1].elements(), 15);
            assert_eq!(levels[0].elements(), 8);
        }
        lsm.close().await
    }

    #[tokio::test]
    async fn test_range_spans_memory_and_disk() -> Result<()> {
        let dir = TempDir::new().unwrap();
        let mut lsm = Lsm::new(small_config(&dir))?;
        fill_and_flush(&mut lsm).await?;

        lsm.put(3, 333).await?;
        let scan = lsm.range_scan(1, 6).await?;

        assert!(scan.contains(&KVPair::new(3, 333)));
        assert!(!scan.contains(&KVPair::new(3, 30)));
        for kv in [(1, 10), (2, 20), (4, 40), (5, 50)] {
            assert!(scan.contains(&KVPair::new(kv.0, kv.1)));
        }
        assert_eq!(scan.len(), 5);
        lsm.close().await
    }

    #[tokio::test]
    async fn test_bloom_no_false_negatives_after_flush() -> Result<()> {
        let dir = TempDir::new().unwrap();
        let config = LsmConfig::new(dir.path())
            .elts_per_run(100)
            .num_runs(10)
            .merged_frac(1.0)
            .page_size(16)
            .disk_runs_per_level(10);
        let mut lsm = Lsm::new(config)?;

        // A full multiplicative cycle scatters 1000 distinct keys.
        for i in 0..1000u64 {
            let key = (i.wrapping_mul(2654435761) % 1_000_003) as i64;
            lsm.put(key, i as i64).await?;
        }
        lsm.put(-1, -1).await?; // buffer is full, this triggers the flush
        lsm.stats().await?; // barrier: the flush has landed

        let levels = lsm.levels.lock().unwrap();
        let mut checked = 0;
        for level in levels.iter() {
            for run in level.populated_runs() {
                for i in 0..run.capacity() {
                    assert!(run.may_contain(run.pair_at(i).key));
                    checked += 1;
                }
            }
        }
        assert_eq!(checked, 1000);
        Ok(())
    }

    #[tokio::test]
    async fn test_disjoint_range_is_empty() -> Result<()> {
        let dir = TempDir::new().unwrap();
        let mut lsm = Lsm::new(small_config(&dir))?;
        for k in 1000..=1020 {
            lsm.put(k, k).await?;
        }
        assert!(lsm.range_scan(1, 100).await?.is_empty());
        lsm.close().await
    }

    #[tokio::test]
    async fn test_empty_range_bounds() -> Result<()> {
        let dir = TempDir::new().unwrap();
        let mut lsm = Lsm::new(small_config(&dir))?;
        lsm.put(5, 50).await?;
        assert!(lsm.range_scan(5, 5).await?.is_empty());
        assert!(lsm.range_scan(7, 3).await?.is_empty());
        lsm.close().await
    }

    #[tokio::test]
    async fn test_overwrite_is_idempotent() -> Result<()> {
        let dir = TempDir::new().unwrap();
        let mut lsm = Lsm::new(small_config(&dir))?;
        lsm.put(1, 10).await?;
        lsm.put(1, 10).await?;
        assert_eq!(lsm.get(1).await?, Some(10));
        lsm.close().await
    }

    #[tokio::test]
    async fn test_delete_then_reinsert() -> Result<()> {
        let dir = TempDir::new().unwrap();
        let mut lsm = Lsm::new(small_config(&dir))?;

        lsm.put(1, 10).await?;
        lsm.delete(1).await?;
        assert_eq!(lsm.get(1).await?, None);

        lsm.delete(2).await?;
        lsm.put(2, 20).await?;
        assert_eq!(lsm.get(2).await?, Some(20));
        lsm.close().await
    }

    #[tokio::test]
    async fn test_get_never_written() -> Result<()> {
        let dir = TempDir::new().unwrap();
        let mut lsm = Lsm::new(small_config(&dir))?;
        lsm.put(1, 10).await?;
        assert_eq!(lsm.get(42).await?, None);
        lsm.close().await
    }

    #[tokio::test]
    async fn test_repeated_close() -> Result<()> {
        let dir = TempDir::new().unwrap();
        let mut lsm = Lsm::new(small_config(&dir))?;
        fill_and_flush(&mut lsm).await?;
        lsm.close().await?;
        lsm.close().await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_duplicate_key_flush_keeps_newest() -> Result<()> {
        let dir = TempDir::new().unwrap();
        let config = LsmConfig::new(dir.path())
            .elts_per_run(2)
            .num_runs(2)
            .merged_frac(1.0)
            .page_size(2)
            .disk_runs_per_level(2);
        let mut lsm = Lsm::new(config)?;

        lsm.put(1, 10).await?;
        lsm.put(2, 20).await?;
        lsm.put(1, 99).await?; // seals the first run, rewrites key 1 in the second
        lsm.put(3, 30).await?;
        lsm.put(4, 40).await?; // buffer full: flush with a duplicated key

        assert_eq!(lsm.get(1).await?, Some(99));
        {
            let levels = lsm.levels.lock().unwrap();
            // Deduplication shrank the batch below the slot's full size.
            assert_eq!(levels[0].populated_runs()[0].capacity(), 3);
        }
        lsm.close().await
    }

    #[tokio::test]
    async fn test_stats_counts() -> Result<()> {
        let dir = TempDir::new().unwrap();
        let mut lsm = Lsm::new(small_config(&dir))?;

        lsm.put(100, 1).await?;
        lsm.put(200, 2).await?;
        let stats = lsm.stats().await?;
        assert_eq!(stats.buffer_elements, 2);
        assert_eq!(stats.level_elements, vec![0]);
        lsm.close().await?;

        let dir = TempDir::new().unwrap();
        let mut lsm = Lsm::new(small_config(&dir))?;
        fill_and_flush(&mut lsm).await?;
        let stats = lsm.stats().await?;
        assert_eq!(stats.buffer_elements, 1); // only key 9 remains buffered
        assert_eq!(stats.level_elements, vec![8]);
        lsm.close().await
    }
}
