#![allow(dead_code)]

use lightning_merge::frame::DataType;
use lightning_merge::{Column, JoinMode, MergeConfig, Table, TableBuilder, Value};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashMap;
use std::time::Duration;

pub const REL_EPS: f64 = 1e-4;
pub const ABS_TOL: f64 = 1e-10;

/// Small, fast configuration for integration tests
pub fn test_config() -> MergeConfig {
    MergeConfig {
        worker_count: 4,
        radix_bits: 4,
        bucket_row_threshold: 1 << 16,
        max_radix_depth: 16,
        hash_fanout: 2,
        stall_timeout: Duration::from_millis(300),
        poll_interval: Duration::from_millis(5),
        max_task_retries: 1,
        retry_backoff: Duration::from_millis(1),
        heartbeat_rows: 64,
        shutdown_grace: Duration::from_millis(200),
    }
}

/// Configuration that forces recursive bucket refinement on modest inputs
pub fn refining_config(threshold: usize) -> MergeConfig {
    MergeConfig {
        bucket_row_threshold: threshold,
        ..test_config()
    }
}

/// Training-style frame: integer key `A`, float `B`, categorical `C`
pub fn frame_a2() -> Table {
    Table::with_chunk_rows(
        vec![
            Column::int64("A", vec![Some(3), Some(1), Some(7), Some(3), None, Some(5)]),
            Column::float64(
                "B",
                vec![Some(1.5), Some(2.25), Some(-0.5), Some(10.0), Some(4.0), Some(0.125)],
            ),
            Column::categorical(
                "C",
                vec![Some("x"), Some("y"), Some("x"), Some("z"), Some("y"), None],
            ),
        ],
        2,
    )
    .unwrap()
}

/// Test-style frame: integer key `A`, float `D`, and a `B` that collides with the left side
pub fn frame_b2() -> Table {
    Table::with_chunk_rows(
        vec![
            Column::int64("A", vec![Some(3), Some(5), Some(9), Some(3), None]),
            Column::float64("D", vec![Some(100.0), Some(200.5), Some(300.25), Some(400.0), Some(500.0)]),
            Column::float64("B", vec![Some(0.1), None, Some(0.3), Some(0.4), Some(0.5)]),
        ],
        3,
    )
    .unwrap()
}

type Row = (Option<i64>, Option<f64>, Option<&'static str>, Option<f64>, Option<f64>);

fn expected_table(rows: Vec<Row>) -> Table {
    let mut builder = TableBuilder::new(vec![
        ("A", DataType::Int64),
        ("B", DataType::Float64),
        ("C", DataType::Categorical),
        ("D", DataType::Float64),
        ("B_y", DataType::Float64),
    ]);
    for (a, b, c, d, b_y) in rows {
        builder
            .push_row(vec![
                a.map_or(Value::Null, Value::Int64),
                b.map_or(Value::Null, Value::Float64),
                c.map_or(Value::Null, |s| Value::Categorical(s.to_string())),
                d.map_or(Value::Null, Value::Float64),
                b_y.map_or(Value::Null, Value::Float64),
            ])
            .unwrap();
    }
    builder.build().unwrap()
}

/// Inner merge of [`frame_a2`] and [`frame_b2`] on `A`
pub fn expected_inner() -> Table {
    expected_table(vec![
        (Some(3), Some(1.5), Some("x"), Some(100.0), Some(0.1)),
        (Some(3), Some(1.5), Some("x"), Some(400.0), Some(0.4)),
        (Some(3), Some(10.0), Some("z"), Some(100.0), Some(0.1)),
        (Some(3), Some(10.0), Some("z"), Some(400.0), Some(0.4)),
        (Some(5), Some(0.125), None, Some(200.5), None),
    ])
}

/// Left outer merge of [`frame_a2`] and [`frame_b2`] on `A`
pub fn expected_left_outer() -> Table {
    expected_table(vec![
        (Some(3), Some(1.5), Some("x"), Some(100.0), Some(0.1)),
        (Some(3), Some(1.5), Some("x"), Some(400.0), Some(0.4)),
        (Some(1), Some(2.25), Some("y"), None, None),
        (Some(7), Some(-0.5), Some("x"), None, None),
        (Some(3), Some(10.0), Some("z"), Some(100.0), Some(0.1)),
        (Some(3), Some(10.0), Some("z"), Some(400.0), Some(0.4)),
        (None, Some(4.0), Some("y"), None, None),
        (Some(5), Some(0.125), None, Some(200.5), None),
    ])
}

/// Right outer merge of [`frame_a2`] and [`frame_b2`] on `A`
pub fn expected_right_outer() -> Table {
    expected_table(vec![
        (Some(3), Some(1.5), Some("x"), Some(100.0), Some(0.1)),
        (Some(3), Some(10.0), Some("z"), Some(100.0), Some(0.1)),
        (Some(5), Some(0.125), None, Some(200.5), None),
        (Some(9), None, None, Some(300.25), Some(0.3)),
        (Some(3), Some(1.5), Some("x"), Some(400.0), Some(0.4)),
        (Some(3), Some(10.0), Some("z"), Some(400.0), Some(0.4)),
        (None, None, None, Some(500.0), Some(0.5)),
    ])
}

/// Random table with integer key `A` and a float payload column.
///
/// `hot` is the fraction of rows sharing key 0, `missing` the fraction of missing keys.
pub fn random_keyed_table(
    seed: u64,
    rows: usize,
    distinct: i64,
    hot: f64,
    missing: f64,
    payload: &str,
    chunk_rows: usize,
) -> Table {
    let mut rng = StdRng::seed_from_u64(seed);
    let keys = (0..rows)
        .map(|_| {
            if rng.random_bool(missing) {
                None
            } else if rng.random_bool(hot) {
                Some(0)
            } else {
                Some(rng.random_range(0..distinct))
            }
        })
        .collect();
    let values = (0..rows).map(|i| Some(i as f64 + 0.25)).collect();
    Table::with_chunk_rows(
        vec![Column::int64("A", keys), Column::float64(payload, values)],
        chunk_rows,
    )
    .unwrap()
}

pub fn keyed_table(keys: Vec<Option<i64>>, payload: &str, chunk_rows: usize) -> Table {
    let values = (0..keys.len()).map(|i| Some(i as f64 + 0.25)).collect();
    Table::with_chunk_rows(
        vec![Column::int64("A", keys), Column::float64(payload, values)],
        chunk_rows,
    )
    .unwrap()
}

fn int_key(table: &Table, key: &str, row: usize) -> Option<i64> {
    match table.value(row, key) {
        Some(Value::Int64(v)) => Some(v),
        _ => None,
    }
}

fn index_by_key(table: &Table, key: &str) -> HashMap<i64, Vec<usize>> {
    let mut index: HashMap<i64, Vec<usize>> = HashMap::new();
    for row in 0..table.row_count() {
        if let Some(k) = int_key(table, key, row) {
            index.entry(k).or_default().push(row);
        }
    }
    index
}

/// Nested-loop style merge on a single integer key column, used as the oracle.
///
/// Inner and left outer results follow left row order, right outer results follow right
/// row order. Ties are broken by the other side's row index.
pub fn reference_merge(left: &Table, right: &Table, key: &str, mode: JoinMode) -> Table {
    let mut pairs: Vec<(Option<usize>, Option<usize>)> = Vec::new();
    match mode {
        JoinMode::Inner | JoinMode::LeftOuter => {
            let index = index_by_key(right, key);
            for row in 0..left.row_count() {
                match int_key(left, key, row).and_then(|k| index.get(&k)) {
                    Some(matches) => pairs.extend(matches.iter().map(|r| (Some(row), Some(*r)))),
                    None if mode == JoinMode::LeftOuter => pairs.push((Some(row), None)),
                    None => {}
                }
            }
        }
        JoinMode::RightOuter => {
            let index = index_by_key(left, key);
            for row in 0..right.row_count() {
                match int_key(right, key, row).and_then(|k| index.get(&k)) {
                    Some(matches) => pairs.extend(matches.iter().map(|l| (Some(*l), Some(row)))),
                    None => pairs.push((None, Some(row))),
                }
            }
        }
    }

    let mut schema: Vec<(String, DataType)> = left
        .columns()
        .iter()
        .map(|c| (c.name().to_string(), c.data_type()))
        .collect();
    let mut right_columns = Vec::new();
    for column in right.columns().iter().filter(|c| c.name() != key) {
        let mut name = column.name().to_string();
        while schema.iter().any(|(n, _)| *n == name) {
            name.push_str("_y");
        }
        schema.push((name, column.data_type()));
        right_columns.push(column.name().to_string());
    }

    let mut builder = TableBuilder::new(schema);
    for (l, r) in pairs {
        let mut row: Vec<Value> = left
            .columns()
            .iter()
            .map(|c| match (l, r) {
                (Some(l), _) => c.value(l),
                (None, Some(r)) if c.name() == key => right.value(r, key).unwrap_or(Value::Null),
                _ => Value::Null,
            })
            .collect();
        for name in &right_columns {
            row.push(r.and_then(|r| right.value(r, name)).unwrap_or(Value::Null));
        }
        builder.push_row(row).unwrap();
    }
    builder.build().unwrap()
}

/// Rows rendered as text and sorted, for comparing results whose row order is unspecified
pub fn sorted_rows(table: &Table) -> Vec<String> {
    let mut rows: Vec<String> = (0..table.row_count())
        .map(|row| {
            table
                .row(row)
                .iter()
                .map(|v| format!("{:?}", v))
                .collect::<Vec<_>>()
                .join("|")
        })
        .collect();
    rows.sort();
    rows
}
