//! Typed column storage
//!
//! Each column keeps its cells in one contiguous typed vector plus a null mask
//! (`true` = missing). Missing floats are additionally stored as `NaN`, which is the
//! canonical missing marker for numeric data.

use super::{DataType, Value};
use crate::{Error, Result};
use std::collections::HashMap;
use std::sync::Arc;

/// Typed cell storage
#[derive(Debug, Clone)]
pub enum ColumnData {
    Int64(Vec<i64>),
    Float64(Vec<f64>),
    Bool(Vec<bool>),
    Timestamp(Vec<i64>),
    Categorical {
        codes: Vec<u32>,
        domain: Arc<Vec<String>>,
    },
    String(Vec<String>),
    Binary(Vec<Vec<u8>>),
}

impl ColumnData {
    pub fn data_type(&self) -> DataType {
        match self {
            ColumnData::Int64(_) => DataType::Int64,
            ColumnData::Float64(_) => DataType::Float64,
            ColumnData::Bool(_) => DataType::Bool,
            ColumnData::Timestamp(_) => DataType::Timestamp,
            ColumnData::Categorical { .. } => DataType::Categorical,
            ColumnData::String(_) => DataType::String,
            ColumnData::Binary(_) => DataType::Binary,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            ColumnData::Int64(v) | ColumnData::Timestamp(v) => v.len(),
            ColumnData::Float64(v) => v.len(),
            ColumnData::Bool(v) => v.len(),
            ColumnData::Categorical { codes, .. } => codes.len(),
            ColumnData::String(v) => v.len(),
            ColumnData::Binary(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// Floats compare by bit pattern so identical columns holding NaN are equal.
impl PartialEq for ColumnData {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (ColumnData::Int64(a), ColumnData::Int64(b))
            | (ColumnData::Timestamp(a), ColumnData::Timestamp(b)) => a == b,
            (ColumnData::Float64(a), ColumnData::Float64(b)) => {
                a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.to_bits() == y.to_bits())
            }
            (ColumnData::Bool(a), ColumnData::Bool(b)) => a == b,
            (
                ColumnData::Categorical { codes, domain },
                ColumnData::Categorical {
                    codes: other_codes,
                    domain: other_domain,
                },
            ) => codes == other_codes && domain == other_domain,
            (ColumnData::String(a), ColumnData::String(b)) => a == b,
            (ColumnData::Binary(a), ColumnData::Binary(b)) => a == b,
            _ => false,
        }
    }
}

/// A named column
#[derive(Debug, Clone, PartialEq)]
pub struct Column {
    name: String,
    data: ColumnData,
    null_mask: Vec<bool>,
}

impl Column {
    /// Create a column from raw storage. The null mask must match the data length.
    pub fn new(name: impl Into<String>, data: ColumnData, null_mask: Vec<bool>) -> Result<Self> {
        let name = name.into();
        if data.len() != null_mask.len() {
            return Err(Error::InvalidTable(format!(
                "column '{}' has {} cells but a null mask of {}",
                name,
                data.len(),
                null_mask.len()
            )));
        }
        if let ColumnData::Categorical { codes, domain } = &data {
            if let Some(code) = codes
                .iter()
                .zip(&null_mask)
                .find(|(code, null)| !**null && **code as usize >= domain.len())
                .map(|(code, _)| *code)
            {
                return Err(Error::InvalidTable(format!(
                    "column '{}' references category {} outside a domain of {}",
                    name,
                    code,
                    domain.len()
                )));
            }
        }

        let mut column = Self {
            name,
            data,
            null_mask,
        };
        column.normalize_missing();
        Ok(column)
    }

    pub fn int64(name: impl Into<String>, values: Vec<Option<i64>>) -> Self {
        let null_mask = values.iter().map(Option::is_none).collect();
        let data = values.into_iter().map(|v| v.unwrap_or(0)).collect();
        Self::from_parts(name, ColumnData::Int64(data), null_mask)
    }

    pub fn float64(name: impl Into<String>, values: Vec<Option<f64>>) -> Self {
        let null_mask = values.iter().map(|v| v.map_or(true, f64::is_nan)).collect();
        let data = values.into_iter().map(|v| v.unwrap_or(f64::NAN)).collect();
        Self::from_parts(name, ColumnData::Float64(data), null_mask)
    }

    pub fn boolean(name: impl Into<String>, values: Vec<Option<bool>>) -> Self {
        let null_mask = values.iter().map(Option::is_none).collect();
        let data = values.into_iter().map(|v| v.unwrap_or(false)).collect();
        Self::from_parts(name, ColumnData::Bool(data), null_mask)
    }

    pub fn timestamp(name: impl Into<String>, values: Vec<Option<i64>>) -> Self {
        let null_mask = values.iter().map(Option::is_none).collect();
        let data = values.into_iter().map(|v| v.unwrap_or(0)).collect();
        Self::from_parts(name, ColumnData::Timestamp(data), null_mask)
    }

    pub fn string(name: impl Into<String>, values: Vec<Option<&str>>) -> Self {
        let null_mask = values.iter().map(Option::is_none).collect();
        let data = values
            .into_iter()
            .map(|v| v.unwrap_or_default().to_string())
            .collect();
        Self::from_parts(name, ColumnData::String(data), null_mask)
    }

    pub fn binary(name: impl Into<String>, values: Vec<Option<Vec<u8>>>) -> Self {
        let null_mask = values.iter().map(Option::is_none).collect();
        let data = values.into_iter().map(Option::unwrap_or_default).collect();
        Self::from_parts(name, ColumnData::Binary(data), null_mask)
    }

    /// Dictionary-encode labels; the domain keeps first-seen order.
    pub fn categorical(name: impl Into<String>, labels: Vec<Option<&str>>) -> Self {
        let mut builder = ColumnBuilder::new(name, DataType::Categorical);
        for label in labels {
            match label {
                Some(l) => builder.push_label(l),
                None => builder.push_null(),
            }
        }
        builder.finish()
    }

    fn from_parts(name: impl Into<String>, data: ColumnData, null_mask: Vec<bool>) -> Self {
        Self {
            name: name.into(),
            data,
            null_mask,
        }
    }

    /// Floats flagged missing hold NaN, and NaN cells are flagged missing.
    fn normalize_missing(&mut self) {
        if let ColumnData::Float64(values) = &mut self.data {
            for (value, null) in values.iter_mut().zip(self.null_mask.iter_mut()) {
                if *null || value.is_nan() {
                    *null = true;
                    *value = f64::NAN;
                }
            }
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn data(&self) -> &ColumnData {
        &self.data
    }

    pub fn data_type(&self) -> DataType {
        self.data.data_type()
    }

    pub fn len(&self) -> usize {
        self.null_mask.len()
    }

    pub fn is_empty(&self) -> bool {
        self.null_mask.is_empty()
    }

    pub fn null_mask(&self) -> &[bool] {
        &self.null_mask
    }

    pub fn is_null(&self, row: usize) -> bool {
        self.null_mask.get(row).copied().unwrap_or(true)
    }

    pub fn null_count(&self) -> usize {
        self.null_mask.iter().filter(|n| **n).count()
    }

    /// Consume the column under a new name
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Category labels for categorical columns
    pub fn domain(&self) -> Option<&Arc<Vec<String>>> {
        match &self.data {
            ColumnData::Categorical { domain, .. } => Some(domain),
            _ => None,
        }
    }

    /// Read one cell. Out-of-range rows read as null.
    pub fn value(&self, row: usize) -> Value {
        if self.is_null(row) {
            return Value::Null;
        }
        match &self.data {
            ColumnData::Int64(v) => Value::Int64(v[row]),
            ColumnData::Float64(v) => Value::Float64(v[row]),
            ColumnData::Bool(v) => Value::Bool(v[row]),
            ColumnData::Timestamp(v) => Value::Timestamp(v[row]),
            ColumnData::Categorical { codes, domain } => {
                Value::Categorical(domain[codes[row] as usize].clone())
            }
            ColumnData::String(v) => Value::String(v[row].clone()),
            ColumnData::Binary(v) => Value::Binary(v[row].clone()),
        }
    }

    /// Gather rows by index; `None` produces a missing cell.
    pub fn take(&self, rows: &[Option<usize>]) -> Column {
        let null_mask: Vec<bool> = rows
            .iter()
            .map(|r| r.map_or(true, |r| self.null_mask[r]))
            .collect();

        let data = match &self.data {
            ColumnData::Int64(v) => ColumnData::Int64(gather(v, rows, 0)),
            ColumnData::Float64(v) => ColumnData::Float64(gather(v, rows, f64::NAN)),
            ColumnData::Bool(v) => ColumnData::Bool(gather(v, rows, false)),
            ColumnData::Timestamp(v) => ColumnData::Timestamp(gather(v, rows, 0)),
            ColumnData::Categorical { codes, domain } => ColumnData::Categorical {
                codes: gather(codes, rows, 0),
                domain: Arc::clone(domain),
            },
            ColumnData::String(v) => ColumnData::String(gather(v, rows, String::new())),
            ColumnData::Binary(v) => ColumnData::Binary(gather(v, rows, Vec::new())),
        };

        Column::from_parts(self.name.clone(), data, null_mask)
    }
}

fn gather<T: Clone>(values: &[T], rows: &[Option<usize>], missing: T) -> Vec<T> {
    rows.iter()
        .map(|r| match r {
            Some(r) => values[*r].clone(),
            None => missing.clone(),
        })
        .collect()
}

/// Incremental column construction with type checking
#[derive(Debug)]
pub struct ColumnBuilder {
    name: String,
    data_type: DataType,
    data: ColumnData,
    null_mask: Vec<bool>,
    category_codes: HashMap<String, u32>,
    domain: Vec<String>,
}

impl ColumnBuilder {
    pub fn new(name: impl Into<String>, data_type: DataType) -> Self {
        Self::with_capacity(name, data_type, 0)
    }

    pub fn with_capacity(name: impl Into<String>, data_type: DataType, capacity: usize) -> Self {
        let data = match data_type {
            DataType::Int64 => ColumnData::Int64(Vec::with_capacity(capacity)),
            DataType::Float64 => ColumnData::Float64(Vec::with_capacity(capacity)),
            DataType::Bool => ColumnData::Bool(Vec::with_capacity(capacity)),
            DataType::Timestamp => ColumnData::Timestamp(Vec::with_capacity(capacity)),
            DataType::Categorical => ColumnData::Categorical {
                codes: Vec::with_capacity(capacity),
                domain: Arc::new(Vec::new()),
            },
            DataType::String => ColumnData::String(Vec::with_capacity(capacity)),
            DataType::Binary => ColumnData::Binary(Vec::with_capacity(capacity)),
        };
        Self {
            name: name.into(),
            data_type,
            data,
            null_mask: Vec::with_capacity(capacity),
            category_codes: HashMap::new(),
            domain: Vec::new(),
        }
    }

    pub fn data_type(&self) -> DataType {
        self.data_type
    }

    pub fn len(&self) -> usize {
        self.null_mask.len()
    }

    pub fn is_empty(&self) -> bool {
        self.null_mask.is_empty()
    }

    pub fn push_null(&mut self) {
        match &mut self.data {
            ColumnData::Int64(v) | ColumnData::Timestamp(v) => v.push(0),
            ColumnData::Float64(v) => v.push(f64::NAN),
            ColumnData::Bool(v) => v.push(false),
            ColumnData::Categorical { codes, .. } => codes.push(0),
            ColumnData::String(v) => v.push(String::new()),
            ColumnData::Binary(v) => v.push(Vec::new()),
        }
        self.null_mask.push(true);
    }

    fn push_label(&mut self, label: &str) {
        let next = self.domain.len() as u32;
        let code = *self
            .category_codes
            .entry(label.to_string())
            .or_insert_with(|| {
                self.domain.push(label.to_string());
                next
            });
        if let ColumnData::Categorical { codes, .. } = &mut self.data {
            codes.push(code);
            self.null_mask.push(false);
        }
    }

    /// Append a value, widening integers into float columns and text into either textual type.
    pub fn push(&mut self, value: Value) -> Result<()> {
        if value.is_null() {
            self.push_null();
            return Ok(());
        }

        if self.data_type == DataType::Categorical {
            if let Some(label) = value.as_str() {
                self.push_label(label);
                return Ok(());
            }
        }

        match (&mut self.data, value) {
            (ColumnData::Int64(v), Value::Int64(x)) => v.push(x),
            (ColumnData::Float64(v), Value::Float64(x)) => v.push(x),
            (ColumnData::Float64(v), Value::Int64(x)) => v.push(x as f64),
            (ColumnData::Bool(v), Value::Bool(x)) => v.push(x),
            (ColumnData::Timestamp(v), Value::Timestamp(x)) => v.push(x),
            (ColumnData::Timestamp(v), Value::Int64(x)) => v.push(x),
            (ColumnData::String(v), Value::String(s))
            | (ColumnData::String(v), Value::Categorical(s)) => v.push(s),
            (ColumnData::Binary(v), Value::Binary(b)) => v.push(b),
            (_, other) => {
                return Err(Error::InvalidTable(format!(
                    "cannot append {:?} to {:?} column '{}'",
                    other.data_type(),
                    self.data_type,
                    self.name
                )));
            }
        }
        self.null_mask.push(false);
        Ok(())
    }

    pub fn finish(self) -> Column {
        let data = match self.data {
            ColumnData::Categorical { codes, .. } => ColumnData::Categorical {
                codes,
                domain: Arc::new(self.domain),
            },
            other => other,
        };
        let mut column = Column::from_parts(self.name, data, self.null_mask);
        column.normalize_missing();
        column
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_take_pads_missing() {
        let col = Column::float64("x", vec![Some(1.5), Some(2.5), None]);
        let taken = col.take(&[Some(1), None, Some(2), Some(0)]);

        assert_eq!(taken.len(), 4);
        assert_eq!(taken.value(0), Value::Float64(2.5));
        assert!(taken.is_null(1));
        assert!(taken.is_null(2));
        assert_eq!(taken.value(3), Value::Float64(1.5));
        match taken.data() {
            ColumnData::Float64(v) => assert!(v[1].is_nan()),
            other => panic!("unexpected storage {:?}", other),
        }
    }

    #[test]
    fn test_categorical_domain_first_seen() {
        let col = Column::categorical("c", vec![Some("b"), Some("a"), None, Some("b")]);
        let domain = col.domain().unwrap();
        assert_eq!(domain.as_slice(), &["b".to_string(), "a".to_string()]);
        assert_eq!(col.value(3), Value::Categorical("b".into()));
        assert_eq!(col.null_count(), 1);
    }

    #[test]
    fn test_builder_widens_ints_into_floats() {
        let mut builder = ColumnBuilder::new("f", DataType::Float64);
        builder.push(Value::Int64(2)).unwrap();
        builder.push(Value::Float64(f64::NAN)).unwrap();
        builder.push(Value::Null).unwrap();
        let col = builder.finish();

        assert_eq!(col.value(0), Value::Float64(2.0));
        assert_eq!(col.null_count(), 2);
    }

    #[test]
    fn test_builder_rejects_wrong_type() {
        let mut builder = ColumnBuilder::new("i", DataType::Int64);
        assert!(builder.push(Value::String("x".into())).is_err());
    }

    #[test]
    fn test_new_validates_categorical_codes() {
        let data = ColumnData::Categorical {
            codes: vec![0, 3],
            domain: Arc::new(vec!["a".into()]),
        };
        assert!(Column::new("c", data, vec![false, false]).is_err());
    }

    #[test]
    fn test_nan_normalized_to_missing() {
        let col = Column::new("f", ColumnData::Float64(vec![1.0, f64::NAN]), vec![false, false])
            .unwrap();
        assert!(col.is_null(1));
        assert!(!col.is_null(0));
    }
}
