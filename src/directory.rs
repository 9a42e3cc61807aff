//! Partition directory
//!
//! Records which worker owns each input chunk and, once bucketizing has run, each radix
//! bucket. The coordinator is the only writer and mutates the directory between phases;
//! everything else reads it through a shared reference.

use crate::error::Side;
use crate::frame::ChunkLayout;
use crate::radix::RadixBucket;
use serde::Serialize;

pub type WorkerId = usize;

/// Location of one input chunk
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChunkPlacement {
    pub side: Side,
    pub chunk: usize,
    pub start_row: usize,
    pub row_count: usize,
    pub worker: WorkerId,
}

/// Location of one radix bucket
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BucketPlacement {
    pub bucket: usize,
    pub left_rows: usize,
    pub right_rows: usize,
    pub depth: usize,
    pub worker: WorkerId,
}

impl BucketPlacement {
    pub fn total_rows(&self) -> usize {
        self.left_rows + self.right_rows
    }
}

#[derive(Debug, Clone)]
pub struct PartitionDirectory {
    worker_count: usize,
    left_chunks: Vec<ChunkPlacement>,
    right_chunks: Vec<ChunkPlacement>,
    buckets: Vec<BucketPlacement>,
}

impl PartitionDirectory {
    pub fn new(worker_count: usize) -> Self {
        Self {
            worker_count: worker_count.max(1),
            left_chunks: Vec::new(),
            right_chunks: Vec::new(),
            buckets: Vec::new(),
        }
    }

    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    /// Place the chunks of one input table round-robin across workers.
    ///
    /// The right table continues the rotation where the left one stopped so small inputs
    /// still spread over the pool.
    pub fn register_table(&mut self, side: Side, layout: &ChunkLayout) {
        let offset = match side {
            Side::Left => 0,
            Side::Right => self.left_chunks.len(),
        };
        let placements = layout
            .ranges()
            .enumerate()
            .map(|(chunk, range)| ChunkPlacement {
                side,
                chunk,
                start_row: range.start,
                row_count: range.len(),
                worker: (offset + chunk) % self.worker_count,
            })
            .collect();

        match side {
            Side::Left => self.left_chunks = placements,
            Side::Right => self.right_chunks = placements,
        }
    }

    pub fn chunks(&self, side: Side) -> &[ChunkPlacement] {
        match side {
            Side::Left => &self.left_chunks,
            Side::Right => &self.right_chunks,
        }
    }

    /// Assign every bucket to a worker, largest buckets first onto the least-loaded worker.
    ///
    /// Ties go to the lowest bucket id and the lowest worker id, so the same plan always
    /// produces the same placement.
    pub fn assign_buckets(&mut self, buckets: &[RadixBucket]) {
        let mut order: Vec<usize> = (0..buckets.len()).collect();
        order.sort_by(|a, b| {
            buckets[*b]
                .total_rows()
                .cmp(&buckets[*a].total_rows())
                .then(a.cmp(b))
        });

        let mut load = vec![0usize; self.worker_count];
        let mut placements: Vec<Option<BucketPlacement>> = vec![None; buckets.len()];
        for index in order {
            let bucket = &buckets[index];
            let worker = load
                .iter()
                .enumerate()
                .min_by_key(|(worker, rows)| (**rows, *worker))
                .map(|(worker, _)| worker)
                .unwrap_or(0);
            load[worker] += bucket.total_rows();
            placements[index] = Some(BucketPlacement {
                bucket: bucket.id,
                left_rows: bucket.left_rows.len(),
                right_rows: bucket.right_rows.len(),
                depth: bucket.depth,
                worker,
            });
        }

        self.buckets = placements.into_iter().flatten().collect();
    }

    pub fn buckets(&self) -> &[BucketPlacement] {
        &self.buckets
    }

    pub fn bucket_owner(&self, bucket: usize) -> Option<WorkerId> {
        self.buckets.get(bucket).map(|p| p.worker)
    }

    /// Rows of bucket work placed on `worker`
    pub fn worker_load(&self, worker: WorkerId) -> usize {
        self.buckets
            .iter()
            .filter(|p| p.worker == worker)
            .map(BucketPlacement::total_rows)
            .sum()
    }

    pub fn max_bucket_rows(&self) -> usize {
        self.buckets
            .iter()
            .map(BucketPlacement::total_rows)
            .max()
            .unwrap_or(0)
    }

    /// Forget bucket placements once their rows have been released.
    pub fn release_buckets(&mut self) {
        self.buckets.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bucket(id: usize, left: usize, right: usize) -> RadixBucket {
        RadixBucket {
            id,
            prefix: id as u64,
            depth: 1,
            left_rows: (0..left as u32).collect(),
            right_rows: (0..right as u32).collect(),
        }
    }

    #[test]
    fn test_register_round_robin() {
        let mut directory = PartitionDirectory::new(3);
        directory.register_table(Side::Left, &ChunkLayout::uniform(10, 4));
        directory.register_table(Side::Right, &ChunkLayout::uniform(4, 2));

        let left: Vec<_> = directory.chunks(Side::Left).iter().map(|c| c.worker).collect();
        let right: Vec<_> = directory.chunks(Side::Right).iter().map(|c| c.worker).collect();
        assert_eq!(left, vec![0, 1, 2]);
        assert_eq!(right, vec![0, 1]);
        assert_eq!(directory.chunks(Side::Left)[2].row_count, 2);
    }

    #[test]
    fn test_assign_buckets_balances_load() {
        let mut directory = PartitionDirectory::new(2);
        let buckets = vec![bucket(0, 5, 5), bucket(1, 3, 0), bucket(2, 4, 4), bucket(3, 1, 1)];
        directory.assign_buckets(&buckets);

        assert_eq!(directory.bucket_owner(0), Some(0));
        assert_eq!(directory.bucket_owner(2), Some(1));
        assert_eq!(directory.worker_load(0) + directory.worker_load(1), 23);
        assert!(directory.worker_load(0).abs_diff(directory.worker_load(1)) <= 3);
        assert_eq!(directory.max_bucket_rows(), 10);
    }

    #[test]
    fn test_assignment_is_deterministic() {
        let buckets: Vec<_> = (0..16).map(|i| bucket(i, i % 5, i % 3)).collect();
        let mut a = PartitionDirectory::new(4);
        let mut b = PartitionDirectory::new(4);
        a.assign_buckets(&buckets);
        b.assign_buckets(&buckets);
        assert_eq!(a.buckets(), b.buckets());
    }

    #[test]
    fn test_release_buckets() {
        let mut directory = PartitionDirectory::new(2);
        directory.assign_buckets(&[bucket(0, 1, 1)]);
        directory.release_buckets();
        assert!(directory.buckets().is_empty());
        assert_eq!(directory.bucket_owner(0), None);
    }
}
