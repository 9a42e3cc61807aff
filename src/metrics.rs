use crate::error::{Error, Result};
use prometheus::{
    register_counter_vec, register_histogram_vec, CounterVec, Encoder, HistogramOpts,
    HistogramVec, TextEncoder,
};
use std::time::Instant;

lazy_static::lazy_static! {
    // Merge outcomes
    static ref MERGE_COUNTER: CounterVec = register_counter_vec!(
        "lightning_merge_jobs_total",
        "Total number of merge jobs by strategy and outcome",
        &["strategy", "outcome"]
    ).expect("merge job counter registers once");

    // Phase latency histograms
    static ref PHASE_LATENCY: HistogramVec = register_histogram_vec!(
        HistogramOpts::new(
            "lightning_merge_phase_duration_seconds",
            "Merge phase latency in seconds"
        ).buckets(vec![0.0001, 0.001, 0.01, 0.1, 1.0, 10.0, 100.0]),
        &["phase"]
    ).expect("phase latency histogram registers once");

    // Task supervision
    static ref TASK_COUNTER: CounterVec = register_counter_vec!(
        "lightning_merge_tasks_total",
        "Supervised task events",
        &["phase", "event"]
    ).expect("task counter registers once");

    // Output volume
    static ref ROW_COUNTER: CounterVec = register_counter_vec!(
        "lightning_merge_rows_total",
        "Rows consumed and produced by merge jobs",
        &["kind"]
    ).expect("row counter registers once");
}

/// Task supervision events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskEvent {
    Completed,
    Retried,
    Stalled,
    Crashed,
}

impl TaskEvent {
    fn label(self) -> &'static str {
        match self {
            TaskEvent::Completed => "completed",
            TaskEvent::Retried => "retried",
            TaskEvent::Stalled => "stalled",
            TaskEvent::Crashed => "crashed",
        }
    }
}

pub fn record_task_event(phase: &str, event: TaskEvent) {
    TASK_COUNTER
        .with_label_values(&[phase, event.label()])
        .inc();
}

pub fn record_merge(strategy: &str, outcome: &str) {
    MERGE_COUNTER.with_label_values(&[strategy, outcome]).inc();
}

pub fn record_rows(input_rows: usize, output_rows: usize) {
    ROW_COUNTER
        .with_label_values(&["input"])
        .inc_by(input_rows as f64);
    ROW_COUNTER
        .with_label_values(&["output"])
        .inc_by(output_rows as f64);
}

/// Observes the phase duration when dropped
pub struct PhaseTimer {
    phase: &'static str,
    start: Instant,
}

impl PhaseTimer {
    pub fn start(phase: &'static str) -> Self {
        Self {
            phase,
            start: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> std::time::Duration {
        self.start.elapsed()
    }
}

impl Drop for PhaseTimer {
    fn drop(&mut self) {
        PHASE_LATENCY
            .with_label_values(&[self.phase])
            .observe(self.start.elapsed().as_secs_f64());
    }
}

/// Export metrics in Prometheus text format
pub fn gather_metrics() -> Result<String> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();

    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| Error::Io(format!("Failed to encode metrics: {}", e)))?;

    String::from_utf8(buffer)
        .map_err(|e| Error::Io(format!("Failed to convert metrics to string: {}", e)))
}
