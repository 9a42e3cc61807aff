//! Local join of one co-located bucket
//!
//! Equal keys never span buckets, so every check here (matching and key uniqueness) only
//! needs the rows of the bucket at hand.

use super::{JoinMode, KeyUniqueness};
use crate::coordinator::{Progress, TaskContext};
use crate::error::Side;
use crate::radix::{ExtractedKeys, RadixBucket, RowRef};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::cmp::Ordering;
use std::collections::HashMap;

/// How the rows of a bucket are matched
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LocalStrategy {
    /// Hash index over the smaller side, probed by the larger one
    HashProbe,
    /// Sort of both sides by key and row, then a merge of equal-key runs
    SortMerge,
}

/// One output row: a left row, a right row, or a matched pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RowPair {
    pub left: Option<RowRef>,
    pub right: Option<RowRef>,
}

impl RowPair {
    pub fn matched(left: RowRef, right: RowRef) -> Self {
        Self {
            left: Some(left),
            right: Some(right),
        }
    }

    pub fn left_only(left: RowRef) -> Self {
        Self {
            left: Some(left),
            right: None,
        }
    }

    pub fn right_only(right: RowRef) -> Self {
        Self {
            left: None,
            right: Some(right),
        }
    }

    pub fn is_matched(&self) -> bool {
        self.left.is_some() && self.right.is_some()
    }
}

/// Output rows of one bucket
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BucketMatches {
    pub bucket: usize,
    pub pairs: Vec<RowPair>,
    pub matched: usize,
}

#[derive(Debug, Clone, Copy)]
pub struct LocalJoinExecutor {
    mode: JoinMode,
    strategy: LocalStrategy,
    unique: KeyUniqueness,
    heartbeat_rows: usize,
}

impl LocalJoinExecutor {
    pub fn new(
        mode: JoinMode,
        strategy: LocalStrategy,
        unique: KeyUniqueness,
        heartbeat_rows: usize,
    ) -> Self {
        Self {
            mode,
            strategy,
            unique,
            heartbeat_rows: heartbeat_rows.max(1),
        }
    }

    pub fn strategy(&self) -> LocalStrategy {
        self.strategy
    }

    /// Match the rows of `bucket`.
    ///
    /// Pairs come back ordered by left row then right row, or by right row then left row for
    /// right outer joins. Every scanned row, emitted pair and sorted element counts towards
    /// the task's heartbeat, so a bucket with a large cross product keeps reporting progress.
    pub fn execute(
        &self,
        bucket: &RadixBucket,
        left: &ExtractedKeys,
        right: &ExtractedKeys,
        ctx: &TaskContext,
    ) -> Result<BucketMatches> {
        let mut progress = Progress::new(ctx, self.heartbeat_rows);
        if self.unique.left() {
            check_unique(Side::Left, &bucket.left_rows, left, &mut progress)?;
        }
        if self.unique.right() {
            check_unique(Side::Right, &bucket.right_rows, right, &mut progress)?;
        }
        ctx.checkpoint(progress.done())?;

        let pairs = match self.strategy {
            LocalStrategy::HashProbe => self.hash_probe(bucket, left, right, &mut progress)?,
            LocalStrategy::SortMerge => self.sort_merge(bucket, left, right, &mut progress)?,
        };

        let pairs = match self.mode {
            JoinMode::RightOuter => sort_with_progress(
                pairs,
                |a, b| (a.right, a.left).cmp(&(b.right, b.left)),
                &mut progress,
                self.heartbeat_rows,
            )?,
            _ => sort_with_progress(pairs, |a, b| a.cmp(b), &mut progress, self.heartbeat_rows)?,
        };
        ctx.heartbeat(progress.done());

        Ok(BucketMatches {
            bucket: bucket.id,
            matched: pairs.iter().filter(|p| p.is_matched()).count(),
            pairs,
        })
    }

    fn hash_probe(
        &self,
        bucket: &RadixBucket,
        left: &ExtractedKeys,
        right: &ExtractedKeys,
        progress: &mut Progress<'_>,
    ) -> Result<Vec<RowPair>> {
        let build_left = bucket.left_rows.len() <= bucket.right_rows.len();
        let (build_rows, build_keys, probe_rows, probe_keys) = if build_left {
            (&bucket.left_rows, left, &bucket.right_rows, right)
        } else {
            (&bucket.right_rows, right, &bucket.left_rows, left)
        };
        let pair = |build: RowRef, probe: RowRef| {
            if build_left {
                RowPair::matched(build, probe)
            } else {
                RowPair::matched(probe, build)
            }
        };
        let keep_build = if build_left {
            self.mode.keeps_left()
        } else {
            self.mode.keeps_right()
        };
        let keep_probe = if build_left {
            self.mode.keeps_right()
        } else {
            self.mode.keeps_left()
        };
        let unmatched = |row: RowRef, on_build: bool| {
            if on_build == build_left {
                RowPair::left_only(row)
            } else {
                RowPair::right_only(row)
            }
        };

        let mut index: HashMap<&[u64], (SmallVec<[RowRef; 4]>, bool)> =
            HashMap::with_capacity(build_rows.len());
        for row in build_rows {
            index
                .entry(build_keys.key(*row))
                .or_insert_with(|| (SmallVec::new(), false))
                .0
                .push(*row);
            progress.tick(1)?;
        }

        let mut pairs = Vec::with_capacity(probe_rows.len());
        for row in probe_rows {
            match index.get_mut(probe_keys.key(*row)) {
                Some((rows, matched)) => {
                    *matched = true;
                    for build in rows.iter() {
                        pairs.push(pair(*build, *row));
                        progress.tick(1)?;
                    }
                }
                None if keep_probe => pairs.push(unmatched(*row, false)),
                None => {}
            }
            progress.tick(1)?;
        }

        if keep_build {
            for (rows, matched) in index.values() {
                if *matched {
                    continue;
                }
                for row in rows {
                    pairs.push(unmatched(*row, true));
                    progress.tick(1)?;
                }
            }
        }

        Ok(pairs)
    }

    fn sort_merge(
        &self,
        bucket: &RadixBucket,
        left: &ExtractedKeys,
        right: &ExtractedKeys,
        progress: &mut Progress<'_>,
    ) -> Result<Vec<RowPair>> {
        // Row index breaks key ties, which keeps equal-key runs in original row order
        let by_key = |a: &(&[u64], RowRef), b: &(&[u64], RowRef)| a.0.cmp(b.0).then(a.1.cmp(&b.1));
        let l: Vec<(&[u64], RowRef)> =
            bucket.left_rows.iter().map(|r| (left.key(*r), *r)).collect();
        let l = sort_with_progress(l, by_key, progress, self.heartbeat_rows)?;
        let r: Vec<(&[u64], RowRef)> =
            bucket.right_rows.iter().map(|r| (right.key(*r), *r)).collect();
        let r = sort_with_progress(r, by_key, progress, self.heartbeat_rows)?;

        let keep_left = self.mode.keeps_left();
        let keep_right = self.mode.keeps_right();
        let mut pairs = Vec::with_capacity(l.len().max(r.len()));
        let (mut i, mut j) = (0, 0);

        while i < l.len() && j < r.len() {
            match l[i].0.cmp(r[j].0) {
                Ordering::Less => {
                    if keep_left {
                        pairs.push(RowPair::left_only(l[i].1));
                    }
                    i += 1;
                    progress.tick(1)?;
                }
                Ordering::Greater => {
                    if keep_right {
                        pairs.push(RowPair::right_only(r[j].1));
                    }
                    j += 1;
                    progress.tick(1)?;
                }
                Ordering::Equal => {
                    let key = l[i].0;
                    let left_end = i + l[i..].iter().take_while(|(k, _)| *k == key).count();
                    let right_end = j + r[j..].iter().take_while(|(k, _)| *k == key).count();
                    for (_, left_row) in &l[i..left_end] {
                        for (_, right_row) in &r[j..right_end] {
                            pairs.push(RowPair::matched(*left_row, *right_row));
                            progress.tick(1)?;
                        }
                    }
                    i = left_end;
                    j = right_end;
                }
            }
        }

        if keep_left {
            pairs.extend(l[i..].iter().map(|(_, row)| RowPair::left_only(*row)));
        }
        if keep_right {
            pairs.extend(r[j..].iter().map(|(_, row)| RowPair::right_only(*row)));
        }
        progress.tick(l.len() - i + r.len() - j)?;
        Ok(pairs)
    }
}

/// Bottom-up merge sort that ticks `progress` for every element it moves.
///
/// Runs of `run` elements are sorted in place first, then merged pairwise. Ties keep the
/// earlier run's element first.
fn sort_with_progress<T: Copy>(
    mut items: Vec<T>,
    cmp: impl Fn(&T, &T) -> Ordering,
    progress: &mut Progress<'_>,
    run: usize,
) -> Result<Vec<T>> {
    let run = run.max(1);
    for chunk in items.chunks_mut(run) {
        chunk.sort_unstable_by(|a, b| cmp(a, b));
        progress.tick(chunk.len())?;
    }

    let len = items.len();
    let mut merged: Vec<T> = Vec::with_capacity(len);
    let mut width = run;
    while width < len {
        merged.clear();
        for start in (0..len).step_by(2 * width) {
            let mid = (start + width).min(len);
            let end = (start + 2 * width).min(len);
            let (mut i, mut j) = (start, mid);
            while i < mid && j < end {
                if cmp(&items[j], &items[i]) == Ordering::Less {
                    merged.push(items[j]);
                    j += 1;
                } else {
                    merged.push(items[i]);
                    i += 1;
                }
                progress.tick(1)?;
            }
            merged.extend_from_slice(&items[i..mid]);
            merged.extend_from_slice(&items[j..end]);
            progress.tick(mid - i + end - j)?;
        }
        std::mem::swap(&mut items, &mut merged);
        width *= 2;
    }
    Ok(items)
}

fn check_unique(
    side: Side,
    rows: &[RowRef],
    keys: &ExtractedKeys,
    progress: &mut Progress<'_>,
) -> Result<()> {
    let mut seen: HashMap<&[u64], RowRef> = HashMap::with_capacity(rows.len());
    for row in rows {
        if let Some(first) = seen.insert(keys.key(*row), *row) {
            return Err(Error::DuplicateKeyViolation {
                side,
                first_row: first.min(*row) as usize,
                second_row: first.max(*row) as usize,
            });
        }
        progress.tick(1)?;
    }
    Ok(())
}
