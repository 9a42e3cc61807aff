//! Supervised task execution
//!
//! Every distributed step of a merge runs as a set of tasks pinned to workers of a
//! [`WorkerPool`]. The [`TaskSupervisor`] submits them, collects results over a channel and
//! acts as the watchdog: a task attempt that stops heartbeating for longer than the stall
//! timeout is cancelled, its worker thread is abandoned and replaced, and the task runs once
//! more. Crashes (panics and [`Error::WorkerFailure`]) get the same single retry.

use super::{CancellationToken, RetryPolicy};
use crate::config::MergeConfig;
use crate::directory::WorkerId;
use crate::metrics::{self, TaskEvent};
use crate::{log_task, Error, Result};
use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

type Job = Box<dyn FnOnce() + Send + 'static>;

struct Worker {
    sender: Sender<Job>,
    // Kept so queued jobs can be moved to a replacement thread
    receiver: Receiver<Job>,
    handle: Option<JoinHandle<()>>,
    generation: usize,
}

/// Fixed set of named worker threads, each with its own job queue
pub struct WorkerPool {
    name: String,
    workers: Mutex<Vec<Worker>>,
    retired: Mutex<Vec<(String, JoinHandle<()>)>>,
    shutdown_grace: Duration,
}

impl WorkerPool {
    pub fn new(name: impl Into<String>, worker_count: usize, shutdown_grace: Duration) -> Result<Self> {
        let name = name.into();
        let mut workers = Vec::with_capacity(worker_count.max(1));
        for index in 0..worker_count.max(1) {
            workers.push(Self::start_worker(&name, index, 0)?);
        }

        Ok(Self {
            name,
            workers: Mutex::new(workers),
            retired: Mutex::new(Vec::new()),
            shutdown_grace,
        })
    }

    fn start_worker(pool: &str, index: usize, generation: usize) -> Result<Worker> {
        let (sender, receiver) = channel::unbounded::<Job>();
        let thread_receiver = receiver.clone();
        let handle = std::thread::Builder::new()
            .name(format!("{}-{}.{}", pool, index, generation))
            .spawn(move || {
                while let Ok(job) = thread_receiver.recv() {
                    job();
                }
            })?;

        Ok(Worker {
            sender,
            receiver,
            handle: Some(handle),
            generation,
        })
    }

    pub fn size(&self) -> usize {
        self.workers.lock().len()
    }

    fn submit(&self, worker: WorkerId, job: Job) -> Result<()> {
        let workers = self.workers.lock();
        if workers.is_empty() {
            return Err(Error::WorkerFailure {
                task: worker,
                message: "worker pool is shut down".into(),
            });
        }
        let slot = &workers[worker % workers.len()];
        slot.sender.send(job).map_err(|_| Error::WorkerFailure {
            task: worker,
            message: "worker queue closed".into(),
        })
    }

    /// Abandon the thread of `worker` and start a fresh one.
    ///
    /// Jobs still queued for the old thread move to the new one. The old thread exits once
    /// its current job returns.
    pub fn replace(&self, worker: WorkerId) -> Result<()> {
        let mut workers = self.workers.lock();
        if workers.is_empty() {
            return Ok(());
        }
        let index = worker % workers.len();
        let generation = workers[index].generation + 1;
        let fresh = Self::start_worker(&self.name, index, generation)?;

        let old = std::mem::replace(&mut workers[index], fresh);
        while let Ok(job) = old.receiver.try_recv() {
            let _ = workers[index].sender.send(job);
        }
        if let Some(handle) = old.handle {
            let name = format!("{}-{}.{}", self.name, index, old.generation);
            warn!(worker = index, generation, "Replaced unresponsive worker thread");
            self.retired.lock().push((name, handle));
        }
        Ok(())
    }

    /// Close all queues and join the threads, detaching any that outlive the grace period.
    pub fn shutdown(&self) {
        let workers: Vec<Worker> = std::mem::take(&mut *self.workers.lock());
        let mut handles: Vec<(String, JoinHandle<()>)> =
            std::mem::take(&mut *self.retired.lock());
        for (index, worker) in workers.into_iter().enumerate() {
            if let Some(handle) = worker.handle {
                handles.push((format!("{}-{}.{}", self.name, index, worker.generation), handle));
            }
        }

        let deadline = Instant::now() + self.shutdown_grace;
        for (name, handle) in handles {
            while !handle.is_finished() && Instant::now() < deadline {
                std::thread::sleep(Duration::from_millis(1));
            }
            if handle.is_finished() {
                let _ = handle.join();
                debug!("Worker '{}' shutdown gracefully", name);
            } else {
                warn!("Worker '{}' did not shutdown within timeout, detaching", name);
            }
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[derive(Debug, Clone, Copy)]
struct Heartbeat {
    attempt: u32,
    last: Instant,
    rows: usize,
}

/// Last sign of life of every running task attempt
#[derive(Debug, Default)]
pub struct HeartbeatRegistry {
    beats: DashMap<usize, Heartbeat>,
}

impl HeartbeatRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn start(&self, task: usize, attempt: u32) {
        self.beats.insert(
            task,
            Heartbeat {
                attempt,
                last: Instant::now(),
                rows: 0,
            },
        );
    }

    fn beat(&self, task: usize, attempt: u32, rows: usize) {
        if let Some(mut beat) = self.beats.get_mut(&task) {
            if beat.attempt == attempt {
                beat.last = Instant::now();
                beat.rows = rows;
            }
        }
    }

    fn finish(&self, task: usize, attempt: u32) {
        self.beats.remove_if(&task, |_, beat| beat.attempt == attempt);
    }

    /// Time since the running attempt of `task` last reported, if that attempt has started
    pub fn silence(&self, task: usize, attempt: u32) -> Option<Duration> {
        self.beats
            .get(&task)
            .filter(|beat| beat.attempt == attempt)
            .map(|beat| beat.last.elapsed())
    }

    /// Rows the running attempt of `task` last reported
    pub fn rows(&self, task: usize) -> Option<usize> {
        self.beats.get(&task).map(|beat| beat.rows)
    }
}

/// Handle given to a running task attempt
#[derive(Clone)]
pub struct TaskContext {
    task: usize,
    attempt: u32,
    token: CancellationToken,
    heartbeats: Option<Arc<HeartbeatRegistry>>,
}

impl TaskContext {
    /// A context outside any supervisor; heartbeats go nowhere and it is never cancelled.
    pub fn detached() -> Self {
        Self {
            task: 0,
            attempt: 1,
            token: CancellationToken::new(),
            heartbeats: None,
        }
    }

    pub fn task_id(&self) -> usize {
        self.task
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Report progress: `rows` processed so far by this attempt.
    pub fn heartbeat(&self, rows: usize) {
        if let Some(heartbeats) = &self.heartbeats {
            heartbeats.beat(self.task, self.attempt, rows);
        }
    }

    /// Report progress and stop if the attempt or the job was cancelled.
    pub fn checkpoint(&self, rows: usize) -> Result<()> {
        self.heartbeat(rows);
        if self.token.is_cancelled() {
            return Err(Error::Cancelled);
        }
        Ok(())
    }
}

impl std::fmt::Debug for TaskContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskContext")
            .field("task", &self.task)
            .field("attempt", &self.attempt)
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// Work counter that checkpoints its task every `every` units
///
/// A unit is whatever costs roughly one row of work: a scanned row, an emitted pair, or an
/// element moved by a sort pass.
pub struct Progress<'a> {
    ctx: &'a TaskContext,
    every: usize,
    done: usize,
    since_beat: usize,
}

impl<'a> Progress<'a> {
    pub fn new(ctx: &'a TaskContext, every: usize) -> Self {
        Self {
            ctx,
            every: every.max(1),
            done: 0,
            since_beat: 0,
        }
    }

    /// Record `units` of work, checkpointing once enough has built up.
    pub fn tick(&mut self, units: usize) -> Result<()> {
        self.done += units;
        self.since_beat += units;
        if self.since_beat >= self.every {
            self.since_beat = 0;
            self.ctx.checkpoint(self.done)?;
        }
        Ok(())
    }

    pub fn done(&self) -> usize {
        self.done
    }
}

/// Hook run on the worker before each task attempt
///
/// Returning an error fails the attempt as if the task itself had failed. Blocking without
/// heartbeating looks like a stall to the supervisor.
pub trait TaskInterceptor: Send + Sync {
    fn before_attempt(&self, phase: &str, task: usize, ctx: &TaskContext) -> Result<()>;
}

type TaskFn<T> = dyn Fn(&TaskContext) -> Result<T> + Send + Sync;

/// A unit of work pinned to a worker
pub struct TaskSpec<T> {
    pub id: usize,
    pub worker: WorkerId,
    pub rows: usize,
    work: Arc<TaskFn<T>>,
}

impl<T> TaskSpec<T> {
    pub fn new<F>(id: usize, worker: WorkerId, rows: usize, work: F) -> Self
    where
        F: Fn(&TaskContext) -> Result<T> + Send + Sync + 'static,
    {
        Self {
            id,
            worker,
            rows,
            work: Arc::new(work),
        }
    }
}

struct AttemptOutcome<T> {
    index: usize,
    attempt: u32,
    elapsed: Duration,
    result: Result<T>,
}

struct TaskState<T> {
    spec: TaskSpec<T>,
    attempt: u32,
    token: CancellationToken,
    result: Option<T>,
}

/// Counters accumulated across all phases of one job
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SupervisorStats {
    pub retries: u32,
    pub stalls: u32,
}

pub struct TaskSupervisor {
    pool: WorkerPool,
    job_token: CancellationToken,
    interceptor: Option<Arc<dyn TaskInterceptor>>,
    retry: RetryPolicy,
    stall_timeout: Duration,
    poll_interval: Duration,
    retries: AtomicU32,
    stalls: AtomicU32,
}

impl TaskSupervisor {
    pub fn new(
        config: &MergeConfig,
        job_token: CancellationToken,
        interceptor: Option<Arc<dyn TaskInterceptor>>,
    ) -> Result<Self> {
        Ok(Self {
            pool: WorkerPool::new("merge-worker", config.worker_count, config.shutdown_grace)?,
            job_token,
            interceptor,
            retry: RetryPolicy::from_config(config),
            stall_timeout: config.stall_timeout,
            poll_interval: config.poll_interval,
            retries: AtomicU32::new(0),
            stalls: AtomicU32::new(0),
        })
    }

    pub fn worker_count(&self) -> usize {
        self.pool.size()
    }

    pub fn stats(&self) -> SupervisorStats {
        SupervisorStats {
            retries: self.retries.load(Ordering::Relaxed),
            stalls: self.stalls.load(Ordering::Relaxed),
        }
    }

    /// Run every task to completion and return their results ordered by task id.
    ///
    /// Fails on the first task that exhausts its retry budget, on a non-recoverable task
    /// error, or when the job is cancelled. Attempts still running at that point are
    /// cancelled and their results discarded.
    pub fn run_phase<T: Send + 'static>(
        &self,
        phase: &'static str,
        tasks: Vec<TaskSpec<T>>,
    ) -> Result<Vec<T>> {
        if self.job_token.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let (sender, receiver) = channel::unbounded::<AttemptOutcome<T>>();
        let heartbeats = Arc::new(HeartbeatRegistry::new());
        let mut states: Vec<TaskState<T>> = tasks
            .into_iter()
            .map(|spec| TaskState {
                spec,
                attempt: 0,
                token: self.job_token.child(),
                result: None,
            })
            .collect();

        for index in 0..states.len() {
            self.submit_attempt(phase, index, &mut states[index], &sender, &heartbeats)?;
        }

        let mut remaining = states.len();
        let outcome = loop {
            if remaining == 0 {
                break Ok(());
            }
            if self.job_token.is_cancelled() {
                break Err(Error::Cancelled);
            }

            match receiver.recv_timeout(self.poll_interval) {
                Ok(outcome) => {
                    if let Err(err) =
                        self.handle_outcome(phase, outcome, &mut states, &mut remaining, &sender, &heartbeats)
                    {
                        break Err(err);
                    }
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    break Err(Error::WorkerFailure {
                        task: 0,
                        message: "result channel closed".into(),
                    })
                }
            }

            if let Err(err) = self.check_stalls(phase, &mut states, &sender, &heartbeats) {
                break Err(err);
            }
        };

        if let Err(err) = outcome {
            for state in &states {
                state.token.cancel();
            }
            return Err(err);
        }

        let mut results: Vec<(usize, T)> = states
            .into_iter()
            .filter_map(|state| state.result.map(|result| (state.spec.id, result)))
            .collect();
        results.sort_by_key(|(id, _)| *id);
        Ok(results.into_iter().map(|(_, result)| result).collect())
    }

    fn handle_outcome<T: Send + 'static>(
        &self,
        phase: &'static str,
        outcome: AttemptOutcome<T>,
        states: &mut [TaskState<T>],
        remaining: &mut usize,
        sender: &Sender<AttemptOutcome<T>>,
        heartbeats: &Arc<HeartbeatRegistry>,
    ) -> Result<()> {
        let state = &mut states[outcome.index];
        if outcome.attempt != state.attempt || state.result.is_some() {
            // Late result of an attempt that was already given up on
            return Ok(());
        }

        match outcome.result {
            Ok(result) => {
                log_task!(phase, state.spec.id, outcome.attempt, state.spec.rows, outcome.elapsed);
                metrics::record_task_event(phase, TaskEvent::Completed);
                state.result = Some(result);
                *remaining -= 1;
                Ok(())
            }
            Err(err) => {
                if matches!(err, Error::WorkerFailure { .. }) {
                    metrics::record_task_event(phase, TaskEvent::Crashed);
                }
                if !self.retry.should_retry(&err, state.attempt) {
                    return Err(err);
                }

                warn!(
                    phase,
                    task = state.spec.id,
                    attempt = state.attempt,
                    error = %err,
                    "Task failed, retrying"
                );
                self.retries.fetch_add(1, Ordering::Relaxed);
                metrics::record_task_event(phase, TaskEvent::Retried);
                self.submit_attempt(phase, outcome.index, state, sender, heartbeats)
            }
        }
    }

    fn check_stalls<T: Send + 'static>(
        &self,
        phase: &'static str,
        states: &mut [TaskState<T>],
        sender: &Sender<AttemptOutcome<T>>,
        heartbeats: &Arc<HeartbeatRegistry>,
    ) -> Result<()> {
        for index in 0..states.len() {
            let state = &mut states[index];
            if state.result.is_some() {
                continue;
            }
            let silence = match heartbeats.silence(state.spec.id, state.attempt) {
                Some(silence) if silence > self.stall_timeout => silence,
                _ => continue,
            };

            warn!(
                phase,
                task = state.spec.id,
                worker = state.spec.worker,
                attempt = state.attempt,
                rows = heartbeats.rows(state.spec.id).unwrap_or(0),
                silence_ms = silence.as_millis() as u64,
                "Task stalled"
            );
            self.stalls.fetch_add(1, Ordering::Relaxed);
            metrics::record_task_event(phase, TaskEvent::Stalled);
            state.token.cancel();
            heartbeats.finish(state.spec.id, state.attempt);
            self.pool.replace(state.spec.worker)?;

            if !self.retry.can_retry(state.attempt) {
                return Err(Error::StallTimeout {
                    phase: phase.to_string(),
                    task: state.spec.id,
                    attempts: state.attempt,
                    waited: silence,
                });
            }

            self.retries.fetch_add(1, Ordering::Relaxed);
            metrics::record_task_event(phase, TaskEvent::Retried);
            self.submit_attempt(phase, index, state, sender, heartbeats)?;
        }
        Ok(())
    }

    fn submit_attempt<T: Send + 'static>(
        &self,
        phase: &'static str,
        index: usize,
        state: &mut TaskState<T>,
        sender: &Sender<AttemptOutcome<T>>,
        heartbeats: &Arc<HeartbeatRegistry>,
    ) -> Result<()> {
        state.attempt += 1;
        state.token = self.job_token.child();

        let attempt = state.attempt;
        let task = state.spec.id;
        let delay = self.retry.delay_for(attempt);
        let ctx = TaskContext {
            task,
            attempt,
            token: state.token.clone(),
            heartbeats: Some(Arc::clone(heartbeats)),
        };
        let work = Arc::clone(&state.spec.work);
        let interceptor = self.interceptor.clone();
        let heartbeats = Arc::clone(heartbeats);
        let sender = sender.clone();

        let job: Job = Box::new(move || {
            if !delay.is_zero() {
                std::thread::sleep(delay);
            }
            let started = Instant::now();
            let result = if ctx.is_cancelled() {
                Err(Error::Cancelled)
            } else {
                heartbeats.start(task, attempt);
                let result = panic::catch_unwind(AssertUnwindSafe(|| {
                    if let Some(interceptor) = &interceptor {
                        interceptor.before_attempt(phase, task, &ctx)?;
                    }
                    work(&ctx)
                }))
                .unwrap_or_else(|payload| {
                    Err(Error::WorkerFailure {
                        task,
                        message: panic_message(payload.as_ref()),
                    })
                });
                heartbeats.finish(task, attempt);
                result
            };

            let _ = sender.send(AttemptOutcome {
                index,
                attempt,
                elapsed: started.elapsed(),
                result,
            });
        });

        self.pool.submit(state.spec.worker, job)
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        format!("task panicked: {}", message)
    } else if let Some(message) = payload.downcast_ref::<String>() {
        format!("task panicked: {}", message)
    } else {
        "task panicked".to_string()
    }
}
