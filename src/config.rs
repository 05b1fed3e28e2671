use std::path::PathBuf;

use crate::errinput;
use crate::error::Result;

/// Configuration for the LSM engine.
#[derive(Debug, Clone)]
pub struct LsmConfig {
    /// Directory holding the on-disk runs.
    pub dir: PathBuf,

    /// Number of pairs held by each memory run before it is sealed
    /// (default: 800).
    pub elts_per_run: usize,

    /// Number of memory runs in the buffer (default: 20).
    pub num_runs: usize,

    /// Fraction of a tier taken together on each merge; 1.0 merges the
    /// whole tier at once (default: 1.0).
    pub merged_frac: f64,

    /// Target bloom filter false-positive rate (default: 0.001).
    pub bf_fp: f64,

    /// Fence-pointer stride of a disk run, in pairs (default: 1024).
    pub page_size: usize,

    /// Number of run slots per disk level (default: 20).
    pub disk_runs_per_level: usize,
}

impl Default for LsmConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("./tierkv"),
            elts_per_run: 800,
            num_runs: 20,
            merged_frac: 1.0,
            bf_fp: 0.001,
            page_size: 1024,
            disk_runs_per_level: 20,
        }
    }
}

impl LsmConfig {
    /// Create a new config with the given directory.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            ..Default::default()
        }
    }

    /// Set the number of pairs per memory run.
    pub fn elts_per_run(mut self, elts: usize) -> Self {
        self.elts_per_run = elts;
        self
    }

    /// Set the number of memory runs in the buffer.
    pub fn num_runs(mut self, runs: usize) -> Self {
        self.num_runs = runs;
        self
    }

    /// Set the merge fraction.
    pub fn merged_frac(mut self, frac: f64) -> Self {
        self.merged_frac = frac;
        self
    }

    /// Set the bloom filter false-positive rate.
    pub fn bf_fp(mut self, fp: f64) -> Self {
        self.bf_fp = fp;
        self
    }

    /// Set the fence-pointer stride in pairs.
    pub fn page_size(mut self, pages: usize) -> Self {
        self.page_size = pages;
        self
    }

    /// Set the number of run slots per disk level.
    pub fn disk_runs_per_level(mut self, runs: usize) -> Self {
        self.disk_runs_per_level = runs;
        self
    }

    /// Number of memory runs sealed and flushed together.
    pub fn num_to_merge(&self) -> usize {
        (self.num_runs as f64 * self.merged_frac).ceil() as usize
    }

    /// Number of disk runs taken together when a level compacts.
    pub fn disk_merge_size(&self) -> usize {
        (self.disk_runs_per_level as f64 * self.merged_frac).ceil() as usize
    }

    /// Reject configurations the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.elts_per_run == 0 {
            return errinput!("elts_per_run must be at least 1");
        }
        if self.num_runs == 0 {
            return errinput!("num_runs must be at least 1");
        }
        if self.page_size == 0 {
            return errinput!("page_size must be at least 1");
        }
        if self.disk_runs_per_level == 0 {
            return errinput!("disk_runs_per_level must be at least 1");
        }
        if !(self.merged_frac > 0.0 && self.merged_frac <= 1.0) {
            return errinput!("merged_frac must be in (0, 1], got {}", self.merged_frac);
        }
        if !(self.bf_fp > 0.0 && self.bf_fp < 1.0) {
            return errinput!("bf_fp must be in (0, 1), got {}", self.bf_fp);
        }
        if self.num_to_merge() == 0 {
            return errinput!("merged_frac {} yields an empty merge batch", self.merged_frac);
        }
        Ok(())
    }
}
