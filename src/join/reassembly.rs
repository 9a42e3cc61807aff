//! Row correspondence and output assembly
//!
//! Per-bucket matches are stitched in bucket order. Outer joins then re-sort the stitched
//! pairs by the kept side's row index, so every kept row lands at its original position
//! whatever bucket it was matched in.

use super::{BucketMatches, JoinMode, RowPair};
use crate::frame::{Column, ColumnBuilder, DataType, Table, DEFAULT_CHUNK_ROWS};
use crate::radix::{KeyPlan, RowRef};
use crate::Result;
use rayon::prelude::*;
use std::collections::HashSet;

/// Where an output column takes its cells from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputSource {
    Left(usize),
    Right(usize),
    /// Join key: the left cell, or the right cell for right-only rows
    Key { left: usize, right: usize },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputColumn {
    pub name: String,
    pub source: OutputSource,
}

pub struct Reassembler<'a> {
    left: &'a Table,
    right: &'a Table,
    plan: &'a KeyPlan,
    mode: JoinMode,
    suffix: &'a str,
}

impl<'a> Reassembler<'a> {
    pub fn new(
        left: &'a Table,
        right: &'a Table,
        plan: &'a KeyPlan,
        mode: JoinMode,
        suffix: &'a str,
    ) -> Self {
        Self {
            left,
            right,
            plan,
            mode,
            suffix,
        }
    }

    /// Output column layout: every left column, then the right columns that are not keys.
    pub fn output_columns(&self) -> Vec<OutputColumn> {
        let mut used: HashSet<String> = self.left.column_names().into_iter().collect();
        let mut columns: Vec<OutputColumn> = self
            .left
            .columns()
            .iter()
            .enumerate()
            .map(|(index, column)| OutputColumn {
                name: column.name().to_string(),
                source: match self.plan.is_left_key(index) {
                    Some(pair) => OutputSource::Key {
                        left: index,
                        right: pair.right_index,
                    },
                    None => OutputSource::Left(index),
                },
            })
            .collect();

        for (index, column) in self.right.columns().iter().enumerate() {
            if self.plan.is_right_key(index) {
                continue;
            }
            let mut name = column.name().to_string();
            while used.contains(&name) {
                name.push_str(self.suffix);
            }
            used.insert(name.clone());
            columns.push(OutputColumn {
                name,
                source: OutputSource::Right(index),
            });
        }
        columns
    }

    /// Final output row order.
    pub fn order(
        &self,
        mut matches: Vec<BucketMatches>,
        left_missing: &[RowRef],
        right_missing: &[RowRef],
    ) -> Vec<RowPair> {
        matches.sort_by_key(|m| m.bucket);
        let total = matches.iter().map(|m| m.pairs.len()).sum::<usize>()
            + left_missing.len()
            + right_missing.len();
        let mut pairs = Vec::with_capacity(total);
        for bucket in matches {
            pairs.extend(bucket.pairs);
        }

        match self.mode {
            JoinMode::Inner => {}
            JoinMode::LeftOuter => {
                pairs.extend(left_missing.iter().map(|row| RowPair::left_only(*row)));
                pairs.par_sort_unstable_by_key(|p| (p.left, p.right));
            }
            JoinMode::RightOuter => {
                pairs.extend(right_missing.iter().map(|row| RowPair::right_only(*row)));
                pairs.par_sort_unstable_by_key(|p| (p.right, p.left));
            }
        }
        pairs
    }

    /// Gather the output columns for `pairs`.
    pub fn materialize(&self, pairs: &[RowPair]) -> Result<Table> {
        let left_rows: Vec<Option<usize>> = pairs.iter().map(|p| p.left.map(|r| r as usize)).collect();
        let right_rows: Vec<Option<usize>> =
            pairs.iter().map(|p| p.right.map(|r| r as usize)).collect();
        let coalesce = left_rows.iter().any(Option::is_none);

        let columns = self
            .output_columns()
            .into_par_iter()
            .map(|output| -> Result<Column> {
                match output.source {
                    OutputSource::Left(index) => Ok(self.left.columns()[index].take(&left_rows)),
                    OutputSource::Right(index) => Ok(self.right.columns()[index]
                        .take(&right_rows)
                        .with_name(output.name)),
                    OutputSource::Key { left, .. } if !coalesce => {
                        Ok(self.left.columns()[left].take(&left_rows))
                    }
                    OutputSource::Key { left, right } => {
                        self.coalesce_key(&output.name, left, right, pairs)
                    }
                }
            })
            .collect::<Result<Vec<_>>>()?;

        let chunk_rows = match self.left.chunk_layout().chunk_count() {
            0 => DEFAULT_CHUNK_ROWS,
            _ => self.left.chunk_layout().chunk_rows(0).max(1),
        };
        Table::with_chunk_rows(columns, chunk_rows)
    }

    fn coalesce_key(&self, name: &str, left: usize, right: usize, pairs: &[RowPair]) -> Result<Column> {
        let left_column = &self.left.columns()[left];
        let right_column = &self.right.columns()[right];
        let data_type = match (left_column.data_type(), right_column.data_type()) {
            (l, r) if l != r && l.is_numeric() && r.is_numeric() => DataType::Float64,
            (l, _) => l,
        };

        let mut builder = ColumnBuilder::with_capacity(name, data_type, pairs.len());
        for pair in pairs {
            match (pair.left, pair.right) {
                (Some(row), _) => builder.push(left_column.value(row as usize))?,
                (None, Some(row)) => builder.push(right_column.value(row as usize))?,
                (None, None) => builder.push_null(),
            }
        }
        Ok(builder.finish())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Value;
    use crate::radix::KeyExtractor;

    fn tables() -> (Table, Table) {
        let left = Table::from_columns(vec![
            Column::int64("id", vec![Some(1), Some(2), Some(3)]),
            Column::float64("x", vec![Some(0.5), Some(1.5), Some(2.5)]),
        ])
        .unwrap();
        let right = Table::from_columns(vec![
            Column::float64("key", vec![Some(3.0), Some(4.0)]),
            Column::float64("x", vec![Some(30.0), Some(40.0)]),
            Column::string("tag", vec![Some("c"), Some("d")]),
        ])
        .unwrap();
        (left, right)
    }

    #[test]
    fn test_output_layout_and_suffix() {
        let (left, right) = tables();
        let plan = KeyExtractor::plan(&left, &right, &["id".into()], &["key".into()]).unwrap();
        let reassembler = Reassembler::new(&left, &right, &plan, JoinMode::Inner, "_y");

        let names: Vec<String> = reassembler.output_columns().into_iter().map(|c| c.name).collect();
        assert_eq!(names, vec!["id", "x", "x_y", "tag"]);
    }

    #[test]
    fn test_left_outer_order_restores_left_rows() {
        let (left, right) = tables();
        let plan = KeyExtractor::plan(&left, &right, &["id".into()], &["key".into()]).unwrap();
        let reassembler = Reassembler::new(&left, &right, &plan, JoinMode::LeftOuter, "_y");

        let matches = vec![
            BucketMatches {
                bucket: 1,
                pairs: vec![RowPair::left_only(0), RowPair::matched(2, 0)],
                matched: 1,
            },
            BucketMatches {
                bucket: 0,
                pairs: vec![RowPair::left_only(1)],
                matched: 0,
            },
        ];
        let pairs = reassembler.order(matches, &[], &[]);
        assert_eq!(
            pairs,
            vec![RowPair::left_only(0), RowPair::left_only(1), RowPair::matched(2, 0)]
        );

        let table = reassembler.materialize(&pairs).unwrap();
        assert_eq!(table.row_count(), 3);
        assert_eq!(table.value(0, "x_y"), Some(Value::Null));
        assert_eq!(table.value(2, "x_y"), Some(Value::Float64(30.0)));
        assert_eq!(table.value(1, "id"), Some(Value::Int64(2)));
        assert!(table.column("key").is_none());
    }

    #[test]
    fn test_right_outer_coalesces_keys() {
        let (left, right) = tables();
        let plan = KeyExtractor::plan(&left, &right, &["id".into()], &["key".into()]).unwrap();
        let reassembler = Reassembler::new(&left, &right, &plan, JoinMode::RightOuter, "_y");

        let pairs = reassembler.order(
            vec![BucketMatches {
                bucket: 0,
                pairs: vec![RowPair::matched(2, 0), RowPair::right_only(1)],
                matched: 1,
            }],
            &[],
            &[],
        );
        let table = reassembler.materialize(&pairs).unwrap();

        let id = table.column("id").unwrap();
        assert_eq!(id.data_type(), DataType::Float64);
        assert_eq!(table.value(0, "id"), Some(Value::Float64(3.0)));
        assert_eq!(table.value(1, "id"), Some(Value::Float64(4.0)));
        assert_eq!(table.value(1, "x"), Some(Value::Null));
        assert_eq!(table.value(1, "tag"), Some(Value::String("d".into())));
    }

    #[test]
    fn test_missing_key_rows_join_outer_results() {
        let (left, right) = tables();
        let plan = KeyExtractor::plan(&left, &right, &["id".into()], &["key".into()]).unwrap();

        let inner = Reassembler::new(&left, &right, &plan, JoinMode::Inner, "_y");
        assert!(inner.order(Vec::new(), &[1], &[0]).is_empty());

        let outer = Reassembler::new(&left, &right, &plan, JoinMode::RightOuter, "_y");
        assert_eq!(outer.order(Vec::new(), &[1], &[0]), vec![RowPair::right_only(0)]);
    }
}
