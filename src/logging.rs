use tracing::Level;
use tracing_subscriber::fmt::time::SystemTime;
use tracing_subscriber::{fmt, prelude::*, EnvFilter, Registry};

/// Initialize logging with configurable settings.
///
/// `RUST_LOG` takes precedence over `level` when set. Calling this twice is harmless; the
/// second subscriber is ignored.
pub fn init_logging(level: Level, json_output: bool) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("lightning_merge={},warn", level)));

    if json_output {
        let fmt_layer = fmt::layer()
            .json()
            .with_timer(SystemTime)
            .with_target(true)
            .with_thread_names(true)
            .with_current_span(true);

        let _ = Registry::default()
            .with(env_filter)
            .with(fmt_layer)
            .try_init();
    } else {
        let fmt_layer = fmt::layer()
            .with_timer(SystemTime)
            .with_target(true)
            .with_thread_ids(false)
            .with_thread_names(true);

        let _ = Registry::default()
            .with(env_filter)
            .with(fmt_layer)
            .try_init();
    }
}

/// Log a coordinator phase transition
#[macro_export]
macro_rules! log_phase {
    ($job:expr, $from:expr, $to:expr) => {
        tracing::info!(
            job = $job,
            from = %$from,
            to = %$to,
            "Merge phase transition"
        )
    };
}

/// Log completion of a supervised task
#[macro_export]
macro_rules! log_task {
    ($phase:expr, $task:expr, $attempt:expr, $rows:expr, $duration:expr) => {
        tracing::debug!(
            phase = $phase,
            task = $task,
            attempt = $attempt,
            rows = $rows,
            duration_us = $duration.as_micros() as u64,
            "Task completed"
        )
    };
}
