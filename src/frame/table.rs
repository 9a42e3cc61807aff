//! Immutable chunked tables

use super::{Column, ColumnBuilder, DataType, Value, DEFAULT_CHUNK_ROWS};
use crate::{Error, Result};
use std::collections::HashSet;
use std::ops::Range;
use std::sync::Arc;

/// Row boundaries of the chunks shared by every column of a table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkLayout {
    /// Chunk start offsets followed by the total row count
    boundaries: Vec<usize>,
}

impl ChunkLayout {
    /// Split `row_count` rows into chunks of at most `chunk_rows` rows.
    pub fn uniform(row_count: usize, chunk_rows: usize) -> Self {
        let chunk_rows = chunk_rows.max(1);
        let mut boundaries: Vec<usize> = (0..row_count).step_by(chunk_rows).collect();
        boundaries.push(row_count);
        Self { boundaries }
    }

    /// Build a layout from explicit chunk sizes.
    pub fn from_sizes(sizes: &[usize]) -> Self {
        let mut boundaries = Vec::with_capacity(sizes.len() + 1);
        let mut offset = 0;
        for size in sizes.iter().filter(|s| **s > 0) {
            boundaries.push(offset);
            offset += size;
        }
        boundaries.push(offset);
        Self { boundaries }
    }

    pub fn chunk_count(&self) -> usize {
        self.boundaries.len() - 1
    }

    pub fn row_count(&self) -> usize {
        self.boundaries.last().copied().unwrap_or(0)
    }

    pub fn chunk_range(&self, chunk: usize) -> Range<usize> {
        self.boundaries[chunk]..self.boundaries[chunk + 1]
    }

    pub fn chunk_rows(&self, chunk: usize) -> usize {
        self.boundaries[chunk + 1] - self.boundaries[chunk]
    }

    pub fn ranges(&self) -> impl Iterator<Item = Range<usize>> + '_ {
        self.boundaries.windows(2).map(|w| w[0]..w[1])
    }

    /// Chunk holding `row`
    pub fn chunk_of(&self, row: usize) -> Option<usize> {
        if row >= self.row_count() {
            return None;
        }
        match self.boundaries.binary_search(&row) {
            Ok(i) => Some(i),
            Err(i) => Some(i - 1),
        }
    }
}

/// Immutable column-oriented table split into row chunks
#[derive(Debug, Clone, PartialEq)]
pub struct Table {
    columns: Vec<Arc<Column>>,
    layout: ChunkLayout,
}

impl Table {
    /// Assemble a table from columns, chunked with [`DEFAULT_CHUNK_ROWS`].
    pub fn from_columns(columns: Vec<Column>) -> Result<Self> {
        Self::with_chunk_rows(columns, DEFAULT_CHUNK_ROWS)
    }

    pub fn with_chunk_rows(columns: Vec<Column>, chunk_rows: usize) -> Result<Self> {
        let row_count = columns.first().map(Column::len).unwrap_or(0);
        Self::with_layout(columns, ChunkLayout::uniform(row_count, chunk_rows))
    }

    pub fn with_layout(columns: Vec<Column>, layout: ChunkLayout) -> Result<Self> {
        let mut seen = HashSet::new();
        for column in &columns {
            if !seen.insert(column.name().to_string()) {
                return Err(Error::InvalidTable(format!(
                    "duplicate column name '{}'",
                    column.name()
                )));
            }
            if column.len() != layout.row_count() {
                return Err(Error::InvalidTable(format!(
                    "column '{}' has {} rows, expected {}",
                    column.name(),
                    column.len(),
                    layout.row_count()
                )));
            }
        }

        Ok(Self {
            columns: columns.into_iter().map(Arc::new).collect(),
            layout,
        })
    }

    /// A table sharing this table's storage under a different chunk layout.
    pub fn rechunk(&self, chunk_rows: usize) -> Self {
        Self {
            columns: self.columns.clone(),
            layout: ChunkLayout::uniform(self.row_count(), chunk_rows),
        }
    }

    pub fn row_count(&self) -> usize {
        self.layout.row_count()
    }

    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    pub fn chunk_layout(&self) -> &ChunkLayout {
        &self.layout
    }

    pub fn columns(&self) -> &[Arc<Column>] {
        &self.columns
    }

    pub fn column(&self, name: &str) -> Option<&Arc<Column>> {
        self.columns.iter().find(|c| c.name() == name)
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name() == name)
    }

    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name().to_string()).collect()
    }

    pub fn value(&self, row: usize, column: &str) -> Option<Value> {
        self.column(column).map(|c| c.value(row))
    }

    pub fn row(&self, row: usize) -> Vec<Value> {
        self.columns.iter().map(|c| c.value(row)).collect()
    }
}

/// Row-wise table construction
#[derive(Debug)]
pub struct TableBuilder {
    builders: Vec<ColumnBuilder>,
    chunk_rows: usize,
}

impl TableBuilder {
    pub fn new<S: Into<String>>(schema: Vec<(S, DataType)>) -> Self {
        Self {
            builders: schema
                .into_iter()
                .map(|(name, data_type)| ColumnBuilder::new(name, data_type))
                .collect(),
            chunk_rows: DEFAULT_CHUNK_ROWS,
        }
    }

    pub fn chunk_rows(mut self, chunk_rows: usize) -> Self {
        self.chunk_rows = chunk_rows;
        self
    }

    pub fn push_row(&mut self, row: Vec<Value>) -> Result<()> {
        if row.len() != self.builders.len() {
            return Err(Error::InvalidTable(format!(
                "row has {} values, table has {} columns",
                row.len(),
                self.builders.len()
            )));
        }
        for (builder, value) in self.builders.iter_mut().zip(row) {
            builder.push(value)?;
        }
        Ok(())
    }

    pub fn build(self) -> Result<Table> {
        let columns = self.builders.into_iter().map(ColumnBuilder::finish).collect();
        Table::with_chunk_rows(columns, self.chunk_rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uniform_layout() {
        let layout = ChunkLayout::uniform(10, 4);
        assert_eq!(layout.chunk_count(), 3);
        assert_eq!(layout.chunk_range(2), 8..10);
        assert_eq!(layout.chunk_of(7), Some(1));
        assert_eq!(layout.chunk_of(8), Some(2));
        assert_eq!(layout.chunk_of(10), None);
    }

    #[test]
    fn test_empty_layout() {
        let layout = ChunkLayout::uniform(0, 4);
        assert_eq!(layout.chunk_count(), 0);
        assert_eq!(layout.row_count(), 0);
    }

    #[test]
    fn test_from_sizes_skips_empty_chunks() {
        let layout = ChunkLayout::from_sizes(&[3, 0, 2]);
        assert_eq!(layout.chunk_count(), 2);
        assert_eq!(layout.chunk_range(1), 3..5);
    }

    #[test]
    fn test_rejects_ragged_columns() {
        let result = Table::from_columns(vec![
            Column::int64("a", vec![Some(1), Some(2)]),
            Column::int64("b", vec![Some(1)]),
        ]);
        assert!(matches!(result, Err(Error::InvalidTable(_))));
    }

    #[test]
    fn test_rejects_duplicate_names() {
        let result = Table::from_columns(vec![
            Column::int64("a", vec![Some(1)]),
            Column::float64("a", vec![Some(1.0)]),
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn test_builder_rows() {
        let mut builder =
            TableBuilder::new(vec![("id", DataType::Int64), ("name", DataType::String)])
                .chunk_rows(1);
        builder.push_row(vec![Value::Int64(1), "a".into()]).unwrap();
        builder.push_row(vec![Value::Null, "b".into()]).unwrap();
        let table = builder.build().unwrap();

        assert_eq!(table.row_count(), 2);
        assert_eq!(table.chunk_layout().chunk_count(), 2);
        assert_eq!(table.value(1, "id"), Some(Value::Null));
        assert_eq!(table.row(0), vec![Value::Int64(1), Value::String("a".into())]);
    }

    #[test]
    fn test_rechunk_shares_storage() {
        let table = Table::from_columns(vec![Column::int64("a", (0..9).map(Some).collect())])
            .unwrap();
        let rechunked = table.rechunk(4);
        assert_eq!(rechunked.chunk_layout().chunk_count(), 3);
        assert!(Arc::ptr_eq(&table.columns()[0], &rechunked.columns()[0]));
    }
}
