//! Merge coordinator
//!
//! Drives one merge through `Init → KeyExtraction → Bucketizing → LocalJoin → Reassembly →
//! Done`. Key extraction and reassembly are data-parallel on the calling thread; bucketizing
//! and the local joins run as supervised tasks on the worker pool. Any error moves the job
//! to `Failed`, releases its buckets and is returned as is; no partial table is produced.

pub mod cancellation;
pub mod retry;
pub mod supervisor;

pub use cancellation::CancellationToken;
pub use retry::RetryPolicy;
pub use supervisor::{
    HeartbeatRegistry, Progress, SupervisorStats, TaskContext, TaskInterceptor, TaskSpec,
    TaskSupervisor, WorkerPool,
};

use crate::config::MergeConfig;
use crate::directory::PartitionDirectory;
use crate::error::Side;
use crate::frame::Table;
use crate::join::{
    BucketMatches, JoinMode, KeyUniqueness, LocalJoinExecutor, LocalStrategy, MergeMethod,
    MergeRequest, Reassembler,
};
use crate::metrics::{self, PhaseTimer};
use crate::radix::{
    BucketPlan, Bucketizer, ChunkScatter, ExtractedKeys, KeyExtractor, Partitioning,
    RadixBucket,
};
use crate::{log_phase, Error, Result};
use parking_lot::Mutex;
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, info_span, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum MergePhase {
    Init,
    KeyExtraction,
    Bucketizing,
    LocalJoin,
    Reassembly,
    Done,
    Failed,
}

impl MergePhase {
    pub fn as_str(self) -> &'static str {
        match self {
            MergePhase::Init => "init",
            MergePhase::KeyExtraction => "key_extraction",
            MergePhase::Bucketizing => "bucketizing",
            MergePhase::LocalJoin => "local_join",
            MergePhase::Reassembly => "reassembly",
            MergePhase::Done => "done",
            MergePhase::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, MergePhase::Done | MergePhase::Failed)
    }

    pub fn can_transition_to(self, next: MergePhase) -> bool {
        use MergePhase::*;
        match (self, next) {
            (Init, KeyExtraction)
            | (KeyExtraction, Bucketizing)
            | (Bucketizing, LocalJoin)
            | (LocalJoin, Reassembly)
            | (Reassembly, Done) => true,
            (from, Failed) => !from.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for MergePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Time spent in one phase
#[derive(Debug, Clone, Serialize)]
pub struct PhaseTiming {
    pub phase: MergePhase,
    pub duration_ms: f64,
}

/// Summary of a finished merge
#[derive(Debug, Clone, Serialize)]
pub struct MergeReport {
    pub job: u64,
    pub method: MergeMethod,
    pub mode: JoinMode,
    pub partitioning: Partitioning,
    pub local_strategy: LocalStrategy,
    pub left_rows: usize,
    pub right_rows: usize,
    pub output_rows: usize,
    pub matched_pairs: usize,
    pub left_missing_keys: usize,
    pub right_missing_keys: usize,
    pub bucket_count: usize,
    pub max_bucket_rows: usize,
    pub max_bucket_depth: usize,
    pub retries: u32,
    pub stalls: u32,
    pub phases: Vec<PhaseTiming>,
    pub total_ms: f64,
}

#[derive(Debug)]
pub struct MergeOutput {
    pub table: Table,
    pub report: MergeReport,
}

struct PhaseTracker {
    current: MergePhase,
    history: Vec<MergePhase>,
}

pub struct MergeCoordinator {
    config: MergeConfig,
    interceptor: Option<Arc<dyn TaskInterceptor>>,
    token: CancellationToken,
    state: Mutex<PhaseTracker>,
    next_job: AtomicU64,
}

impl MergeCoordinator {
    pub fn new(config: MergeConfig) -> Self {
        Self {
            config,
            interceptor: None,
            token: CancellationToken::new(),
            state: Mutex::new(PhaseTracker {
                current: MergePhase::Init,
                history: vec![MergePhase::Init],
            }),
            next_job: AtomicU64::new(1),
        }
    }

    /// Install a hook that runs before every supervised task attempt.
    pub fn with_interceptor(mut self, interceptor: Arc<dyn TaskInterceptor>) -> Self {
        self.interceptor = Some(interceptor);
        self
    }

    pub fn config(&self) -> &MergeConfig {
        &self.config
    }

    /// Token cancelling the running and every later merge of this coordinator
    pub fn cancellation_token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn phase(&self) -> MergePhase {
        self.state.lock().current
    }

    /// Phases visited by the latest merge, in order
    pub fn phase_history(&self) -> Vec<MergePhase> {
        self.state.lock().history.clone()
    }

    fn transition(&self, job: u64, next: MergePhase) -> Result<()> {
        let mut state = self.state.lock();
        if !state.current.can_transition_to(next) {
            return Err(Error::PhaseTransition {
                from: state.current.to_string(),
                to: next.to_string(),
            });
        }
        log_phase!(job, state.current, next);
        state.current = next;
        state.history.push(next);
        Ok(())
    }

    fn check_cancelled(&self) -> Result<()> {
        if self.token.is_cancelled() {
            return Err(Error::Cancelled);
        }
        Ok(())
    }

    /// Merge `left` and `right`.
    pub fn execute(&self, left: &Table, right: &Table, request: &MergeRequest) -> Result<MergeOutput> {
        let job = self.next_job.fetch_add(1, Ordering::Relaxed);
        {
            let mut state = self.state.lock();
            state.current = MergePhase::Init;
            state.history = vec![MergePhase::Init];
        }

        let span = info_span!("merge", job, method = %request.method);
        let _enter = span.enter();
        let mut directory = PartitionDirectory::new(self.config.worker_count);

        match self.run(job, left, right, request, &mut directory) {
            Ok(output) => {
                metrics::record_merge(request.method.as_str(), "success");
                metrics::record_rows(left.row_count() + right.row_count(), output.table.row_count());
                info!(
                    rows = output.report.output_rows,
                    buckets = output.report.bucket_count,
                    total_ms = output.report.total_ms,
                    "Merge completed"
                );
                Ok(output)
            }
            Err(err) => {
                directory.release_buckets();
                let _ = self.transition(job, MergePhase::Failed);
                metrics::record_merge(request.method.as_str(), err.kind());
                warn!(error = %err, code = err.error_code(), "Merge failed");
                Err(err)
            }
        }
    }

    fn run(
        &self,
        job: u64,
        left: &Table,
        right: &Table,
        request: &MergeRequest,
        directory: &mut PartitionDirectory,
    ) -> Result<MergeOutput> {
        let started = Instant::now();
        self.config.validate()?;
        let mode = request.validate()?;
        let (partitioning, local_strategy) = request.method.strategy();
        let mut phases = Vec::with_capacity(4);
        self.check_cancelled()?;

        self.transition(job, MergePhase::KeyExtraction)?;
        let timer = PhaseTimer::start(MergePhase::KeyExtraction.as_str());
        let plan = KeyExtractor::plan(left, right, &request.by_x, &request.by_y)?;
        let (left_keys, right_keys) = KeyExtractor::extract(&plan, left, right)?;
        phases.push(timing(MergePhase::KeyExtraction, timer.elapsed()));
        drop(timer);
        self.check_cancelled()?;

        self.transition(job, MergePhase::Bucketizing)?;
        let timer = PhaseTimer::start(MergePhase::Bucketizing.as_str());
        let supervisor =
            TaskSupervisor::new(&self.config, self.token.clone(), self.interceptor.clone())?;
        let bucketizer = Bucketizer::new(partitioning, &self.config, plan.width());
        // Uniqueness checks need every bucket, matched or not
        let drop_one_sided = mode == JoinMode::Inner && request.unique == KeyUniqueness::None;
        let bucket_plan = self.bucketize(
            &supervisor,
            directory,
            &bucketizer,
            (left, &left_keys),
            (right, &right_keys),
            drop_one_sided,
        )?;
        directory.assign_buckets(&bucket_plan.buckets);
        phases.push(timing(MergePhase::Bucketizing, timer.elapsed()));
        drop(timer);
        self.check_cancelled()?;

        self.transition(job, MergePhase::LocalJoin)?;
        let timer = PhaseTimer::start(MergePhase::LocalJoin.as_str());
        let bucket_count = bucket_plan.buckets.len();
        let max_bucket_rows = bucket_plan.max_bucket_rows();
        let max_bucket_depth = bucket_plan.max_depth();
        let BucketPlan {
            buckets,
            left_missing,
            right_missing,
        } = bucket_plan;
        let executor =
            LocalJoinExecutor::new(mode, local_strategy, request.unique, self.config.heartbeat_rows);
        let tasks = buckets
            .into_iter()
            .map(|bucket| {
                let worker = directory.bucket_owner(bucket.id).unwrap_or(0);
                let rows = bucket.total_rows();
                let bucket = Arc::new(bucket);
                let left_keys = Arc::clone(&left_keys);
                let right_keys = Arc::clone(&right_keys);
                TaskSpec::new(bucket.id, worker, rows, move |ctx: &TaskContext| {
                    executor.execute(&bucket, &left_keys, &right_keys, ctx)
                })
            })
            .collect();
        let matches: Vec<BucketMatches> =
            supervisor.run_phase(MergePhase::LocalJoin.as_str(), tasks)?;
        directory.release_buckets();
        phases.push(timing(MergePhase::LocalJoin, timer.elapsed()));
        drop(timer);
        self.check_cancelled()?;

        self.transition(job, MergePhase::Reassembly)?;
        let timer = PhaseTimer::start(MergePhase::Reassembly.as_str());
        let matched_pairs = matches.iter().map(|m| m.matched).sum();
        let reassembler = Reassembler::new(left, right, &plan, mode, &request.suffix);
        let pairs = reassembler.order(matches, &left_missing, &right_missing);
        let table = reassembler.materialize(&pairs)?;
        phases.push(timing(MergePhase::Reassembly, timer.elapsed()));
        drop(timer);

        self.transition(job, MergePhase::Done)?;
        let stats = supervisor.stats();
        drop(supervisor);

        Ok(MergeOutput {
            report: MergeReport {
                job,
                method: request.method,
                mode,
                partitioning,
                local_strategy,
                left_rows: left.row_count(),
                right_rows: right.row_count(),
                output_rows: table.row_count(),
                matched_pairs,
                left_missing_keys: left_missing.len(),
                right_missing_keys: right_missing.len(),
                bucket_count,
                max_bucket_rows,
                max_bucket_depth,
                retries: stats.retries,
                stalls: stats.stalls,
                phases,
                total_ms: started.elapsed().as_secs_f64() * 1000.0,
            },
            table,
        })
    }

    fn bucketize(
        &self,
        supervisor: &TaskSupervisor,
        directory: &mut PartitionDirectory,
        bucketizer: &Bucketizer,
        (left, left_keys): (&Table, &Arc<ExtractedKeys>),
        (right, right_keys): (&Table, &Arc<ExtractedKeys>),
        drop_one_sided: bool,
    ) -> Result<BucketPlan> {
        directory.register_table(Side::Left, left.chunk_layout());
        directory.register_table(Side::Right, right.chunk_layout());

        let mut tasks = Vec::new();
        for (side, keys) in [(Side::Left, left_keys), (Side::Right, right_keys)] {
            for chunk in directory.chunks(side) {
                let keys = Arc::clone(keys);
                let bucketizer = *bucketizer;
                let (index, rows) = (chunk.chunk, chunk.start_row..chunk.start_row + chunk.row_count);
                tasks.push(TaskSpec::new(
                    tasks.len(),
                    chunk.worker,
                    chunk.row_count,
                    move |ctx: &TaskContext| {
                        bucketizer.scatter_chunk(side, index, &keys, rows.clone(), ctx)
                    },
                ));
            }
        }
        let scatters: Vec<ChunkScatter> =
            supervisor.run_phase(MergePhase::Bucketizing.as_str(), tasks)?;
        let (left_scatters, right_scatters): (Vec<_>, Vec<_>) =
            scatters.into_iter().partition(|s| s.side == Side::Left);
        let gathered = bucketizer.gather(left_scatters, right_scatters, drop_one_sided);
        self.check_cancelled()?;

        // Buckets that fit stay in place; oversized ones are split by tasks and slotted back
        let workers = supervisor.worker_count();
        let mut groups: Vec<Vec<RadixBucket>> = Vec::with_capacity(gathered.buckets.len());
        let mut slots = Vec::new();
        let mut refine = Vec::new();
        for bucket in gathered.buckets {
            if bucketizer.needs_refinement(&bucket) {
                let bucket = Arc::new(bucket);
                let left_keys = Arc::clone(left_keys);
                let right_keys = Arc::clone(right_keys);
                let bucketizer = *bucketizer;
                slots.push(groups.len());
                refine.push(TaskSpec::new(
                    refine.len(),
                    refine.len() % workers.max(1),
                    bucket.total_rows(),
                    move |ctx: &TaskContext| {
                        bucketizer.refine((*bucket).clone(), &left_keys, &right_keys, ctx)
                    },
                ));
                groups.push(Vec::new());
            } else {
                groups.push(vec![bucket]);
            }
        }

        if !refine.is_empty() {
            let refined: Vec<Vec<RadixBucket>> =
                supervisor.run_phase(MergePhase::Bucketizing.as_str(), refine)?;
            for (slot, pieces) in slots.into_iter().zip(refined) {
                groups[slot] = pieces;
            }
        }

        Ok(bucketizer.finalize(
            groups,
            gathered.left_missing,
            gathered.right_missing,
            drop_one_sided,
        ))
    }
}

fn timing(phase: MergePhase, duration: Duration) -> PhaseTiming {
    PhaseTiming {
        phase,
        duration_ms: duration.as_secs_f64() * 1000.0,
    }
}
