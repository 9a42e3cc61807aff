//! Distributed merge (relational join) of partitioned in-memory tables.
//!
//! ```no_run
//! use lightning_merge::{merge, Column, MergeRequest, Table};
//!
//! let left = Table::from_columns(vec![Column::int64("A", vec![Some(1), Some(2)])])?;
//! let right = Table::from_columns(vec![Column::int64("A", vec![Some(2), Some(3)])])?;
//! let joined = merge(&left, &right, &MergeRequest::on(["A"]).all_x(true))?;
//! assert_eq!(joined.row_count(), 2);
//! # Ok::<(), lightning_merge::Error>(())
//! ```

pub mod compare;
pub mod config;
pub mod coordinator;
pub mod directory;
pub mod error;
pub mod frame;
pub mod join;
pub mod logging;
pub mod metrics;
pub mod radix;

pub use compare::compare_numeric_tables;
pub use config::{ConfigPreset, MergeConfig};
pub use coordinator::{
    CancellationToken, MergeCoordinator, MergeOutput, MergePhase, MergeReport, TaskContext,
    TaskInterceptor,
};
pub use error::{Error, Result, Side};
pub use frame::{Column, ColumnBuilder, DataType, Table, TableBuilder, Value};
pub use join::{JoinMode, KeyUniqueness, MergeMethod, MergeRequest};

/// Merge two tables with the default configuration and `LIGHTNING_MERGE_*` overrides.
pub fn merge(left: &Table, right: &Table, request: &MergeRequest) -> Result<Table> {
    let config = MergeConfig::default().with_env_overrides()?;
    merge_with_config(left, right, request, config).map(|output| output.table)
}

/// Merge two tables and return the result together with its report.
pub fn merge_with_config(
    left: &Table,
    right: &Table,
    request: &MergeRequest,
    config: MergeConfig,
) -> Result<MergeOutput> {
    MergeCoordinator::new(config).execute(left, right, request)
}

/// Run a merge on the blocking thread pool of the current tokio runtime.
pub async fn merge_async(
    left: Table,
    right: Table,
    request: MergeRequest,
    config: MergeConfig,
) -> Result<MergeOutput> {
    tokio::task::spawn_blocking(move || merge_with_config(&left, &right, &request, config))
        .await
        .map_err(|e| Error::WorkerFailure {
            task: 0,
            message: format!("merge task failed: {}", e),
        })?
}
