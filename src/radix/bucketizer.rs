//! Radix bucketizing
//!
//! Bucketizing runs in three steps:
//!
//! 1. every input chunk scatters its rows by the first digit of their key
//!    ([`Bucketizer::scatter_chunk`], one task per chunk)
//! 2. the coordinator concatenates the scatters in chunk order, which keeps the rows of each
//!    bucket in ascending global row order ([`Bucketizer::gather`])
//! 3. buckets holding more than the row threshold are split on the next digit until they fit
//!    ([`Bucketizer::refine`], one task per oversized bucket)
//!
//! A bucket that still exceeds the threshold once every digit is consumed holds a single key
//! value and is reported as a [`Error::SkewedJoin`].

use super::{ExtractedKeys, RowRef};
use crate::config::MergeConfig;
use crate::coordinator::{Progress, TaskContext};
use crate::error::Side;
use crate::frame::ChunkLayout;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};
use std::ops::Range;

/// How rows are assigned to buckets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Partitioning {
    /// Most significant radix digits; buckets cover ordered key ranges
    Radix,
    /// Salted hash of the whole key
    Hash,
}

/// Rows of both tables whose keys share a partition prefix
#[derive(Debug, Clone, PartialEq)]
pub struct RadixBucket {
    pub id: usize,
    /// Digits consumed so far, most significant first
    pub prefix: u64,
    /// Number of digits consumed
    pub depth: usize,
    pub left_rows: Vec<RowRef>,
    pub right_rows: Vec<RowRef>,
}

impl RadixBucket {
    pub fn total_rows(&self) -> usize {
        self.left_rows.len() + self.right_rows.len()
    }

    /// Buckets with rows from only one table cannot produce matches.
    pub fn is_one_sided(&self) -> bool {
        self.left_rows.is_empty() || self.right_rows.is_empty()
    }
}

/// Rows of one input chunk grouped by their first digit
#[derive(Debug, Clone)]
pub struct ChunkScatter {
    pub side: Side,
    pub chunk: usize,
    pub parts: BTreeMap<usize, Vec<RowRef>>,
    pub missing: Vec<RowRef>,
}

impl ChunkScatter {
    pub fn row_count(&self) -> usize {
        self.parts.values().map(Vec::len).sum::<usize>() + self.missing.len()
    }
}

/// Top-level buckets before refinement
#[derive(Debug, Clone, Default)]
pub struct GatheredBuckets {
    pub buckets: Vec<RadixBucket>,
    pub left_missing: Vec<RowRef>,
    pub right_missing: Vec<RowRef>,
}

/// Final bucket assignment
#[derive(Debug, Clone, Default)]
pub struct BucketPlan {
    pub buckets: Vec<RadixBucket>,
    /// Left rows with a missing key component, in row order
    pub left_missing: Vec<RowRef>,
    /// Right rows with a missing key component, in row order
    pub right_missing: Vec<RowRef>,
}

impl BucketPlan {
    pub fn max_bucket_rows(&self) -> usize {
        self.buckets
            .iter()
            .map(RadixBucket::total_rows)
            .max()
            .unwrap_or(0)
    }

    pub fn max_depth(&self) -> usize {
        self.buckets.iter().map(|b| b.depth).max().unwrap_or(0)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Bucketizer {
    partitioning: Partitioning,
    radix_bits: u32,
    threshold: usize,
    max_depth: usize,
    hash_buckets: usize,
    heartbeat_rows: usize,
}

impl Bucketizer {
    pub fn new(partitioning: Partitioning, config: &MergeConfig, key_width: usize) -> Self {
        let radix_bits = config.radix_bits as u32;
        let max_depth = match partitioning {
            Partitioning::Radix => {
                let key_digits = (key_width * 64).div_ceil(radix_bits as usize);
                config.max_radix_depth.min(key_digits)
            }
            Partitioning::Hash => config.max_radix_depth,
        };

        Self {
            partitioning,
            radix_bits,
            threshold: config.bucket_row_threshold,
            max_depth,
            hash_buckets: (config.worker_count * config.hash_fanout).max(2),
            heartbeat_rows: config.heartbeat_rows,
        }
    }

    pub fn partitioning(&self) -> Partitioning {
        self.partitioning
    }

    /// Number of child partitions per digit
    pub fn fanout(&self) -> usize {
        match self.partitioning {
            Partitioning::Radix => 1 << self.radix_bits,
            Partitioning::Hash => self.hash_buckets,
        }
    }

    pub fn max_depth(&self) -> usize {
        self.max_depth
    }

    fn prefix_bits(&self) -> u32 {
        match self.partitioning {
            Partitioning::Radix => self.radix_bits,
            Partitioning::Hash => usize::BITS - (self.hash_buckets - 1).leading_zeros(),
        }
    }

    /// Partition of `row` at `depth` (0 = first digit)
    pub fn partition_of(&self, keys: &ExtractedKeys, row: RowRef, depth: usize) -> usize {
        match self.partitioning {
            Partitioning::Radix => keys.digit(row, depth, self.radix_bits),
            Partitioning::Hash => {
                let mut hasher = DefaultHasher::new();
                depth.hash(&mut hasher);
                keys.key(row).hash(&mut hasher);
                (hasher.finish() % self.hash_buckets as u64) as usize
            }
        }
    }

    /// Scatter the rows of one chunk by their first digit.
    pub fn scatter_chunk(
        &self,
        side: Side,
        chunk: usize,
        keys: &ExtractedKeys,
        rows: Range<usize>,
        ctx: &TaskContext,
    ) -> Result<ChunkScatter> {
        let mut parts: BTreeMap<usize, Vec<RowRef>> = BTreeMap::new();
        let mut missing = Vec::new();

        for (done, row) in rows.enumerate() {
            if done % self.heartbeat_rows == 0 {
                ctx.checkpoint(done)?;
            }
            let row = row as RowRef;
            if keys.is_missing(row) {
                missing.push(row);
            } else {
                parts
                    .entry(self.partition_of(keys, row, 0))
                    .or_default()
                    .push(row);
            }
        }

        Ok(ChunkScatter {
            side,
            chunk,
            parts,
            missing,
        })
    }

    /// Concatenate chunk scatters in chunk order into top-level buckets.
    pub fn gather(
        &self,
        mut left: Vec<ChunkScatter>,
        mut right: Vec<ChunkScatter>,
        drop_one_sided: bool,
    ) -> GatheredBuckets {
        left.sort_by_key(|s| s.chunk);
        right.sort_by_key(|s| s.chunk);

        let mut digits: BTreeMap<usize, (Vec<RowRef>, Vec<RowRef>)> = BTreeMap::new();
        let mut left_missing = Vec::new();
        let mut right_missing = Vec::new();

        for scatter in left {
            for (digit, rows) in scatter.parts {
                digits.entry(digit).or_default().0.extend(rows);
            }
            left_missing.extend(scatter.missing);
        }
        for scatter in right {
            for (digit, rows) in scatter.parts {
                digits.entry(digit).or_default().1.extend(rows);
            }
            right_missing.extend(scatter.missing);
        }

        let buckets = digits
            .into_iter()
            .map(|(digit, (left_rows, right_rows))| RadixBucket {
                id: 0,
                prefix: digit as u64,
                depth: 1,
                left_rows,
                right_rows,
            })
            .filter(|b| !(drop_one_sided && b.is_one_sided()))
            .collect();

        GatheredBuckets {
            buckets,
            left_missing,
            right_missing,
        }
    }

    /// One-sided buckets never need co-location, so they are never split.
    pub fn needs_refinement(&self, bucket: &RadixBucket) -> bool {
        bucket.total_rows() > self.threshold && !bucket.is_one_sided()
    }

    /// Split an oversized bucket until every piece fits under the threshold.
    pub fn refine(
        &self,
        bucket: RadixBucket,
        left: &ExtractedKeys,
        right: &ExtractedKeys,
        ctx: &TaskContext,
    ) -> Result<Vec<RadixBucket>> {
        let mut finished = Vec::new();
        let mut progress = Progress::new(ctx, self.heartbeat_rows);
        self.split(bucket, left, right, &mut progress, &mut finished)?;
        Ok(finished)
    }

    fn split(
        &self,
        bucket: RadixBucket,
        left: &ExtractedKeys,
        right: &ExtractedKeys,
        progress: &mut Progress<'_>,
        finished: &mut Vec<RadixBucket>,
    ) -> Result<()> {
        if !self.needs_refinement(&bucket) {
            finished.push(bucket);
            return Ok(());
        }
        if bucket.depth >= self.max_depth {
            return Err(Error::SkewedJoin {
                bucket: bucket.prefix,
                rows: bucket.total_rows(),
                depth: bucket.depth,
                threshold: self.threshold,
            });
        }

        let depth = bucket.depth;
        let mut children: BTreeMap<usize, (Vec<RowRef>, Vec<RowRef>)> = BTreeMap::new();
        for row in bucket.left_rows {
            children
                .entry(self.partition_of(left, row, depth))
                .or_default()
                .0
                .push(row);
            progress.tick(1)?;
        }
        for row in bucket.right_rows {
            children
                .entry(self.partition_of(right, row, depth))
                .or_default()
                .1
                .push(row);
            progress.tick(1)?;
        }

        let prefix_bits = self.prefix_bits();
        for (digit, (left_rows, right_rows)) in children {
            let child = RadixBucket {
                id: 0,
                prefix: bucket.prefix.wrapping_shl(prefix_bits) | digit as u64,
                depth: depth + 1,
                left_rows,
                right_rows,
            };
            self.split(child, left, right, progress, finished)?;
        }
        Ok(())
    }

    /// Flatten refined groups in order and number the buckets.
    pub fn finalize(
        &self,
        groups: Vec<Vec<RadixBucket>>,
        left_missing: Vec<RowRef>,
        right_missing: Vec<RowRef>,
        drop_one_sided: bool,
    ) -> BucketPlan {
        let buckets = groups
            .into_iter()
            .flatten()
            .filter(|b| !(drop_one_sided && b.is_one_sided()))
            .enumerate()
            .map(|(id, bucket)| RadixBucket { id, ..bucket })
            .collect();

        BucketPlan {
            buckets,
            left_missing,
            right_missing,
        }
    }

    /// Run all bucketizing steps on the calling thread.
    pub fn plan(
        &self,
        left: &ExtractedKeys,
        left_layout: &ChunkLayout,
        right: &ExtractedKeys,
        right_layout: &ChunkLayout,
        drop_one_sided: bool,
    ) -> Result<BucketPlan> {
        let ctx = TaskContext::detached();
        let scatter = |side: Side,
                       keys: &ExtractedKeys,
                       layout: &ChunkLayout|
         -> Result<Vec<ChunkScatter>> {
            layout
                .ranges()
                .enumerate()
                .map(|(chunk, range)| self.scatter_chunk(side, chunk, keys, range, &ctx))
                .collect()
        };
        let left_scatters = scatter(Side::Left, left, left_layout)?;
        let right_scatters = scatter(Side::Right, right, right_layout)?;

        let gathered = self.gather(left_scatters, right_scatters, drop_one_sided);
        let groups = gathered
            .buckets
            .into_iter()
            .map(|bucket| self.refine(bucket, left, right, &ctx))
            .collect::<Result<Vec<_>>>()?;

        Ok(self.finalize(
            groups,
            gathered.left_missing,
            gathered.right_missing,
            drop_one_sided,
        ))
    }
}
