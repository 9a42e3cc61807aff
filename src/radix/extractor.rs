//! Radix key extraction
//!
//! Every supported key type maps to a `u64` component:
//!
//! - integers and timestamps flip the sign bit, preserving signed order
//! - floats use the IEEE total-order trick (`-0.0` folded into `0.0`)
//! - mixed integer/float pairs both go through the float mapping
//! - booleans map to 0/1
//! - categorical and string keys map through a dictionary built over the labels of *both*
//!   tables, so equal labels get equal radices even when the two columns have different
//!   category domains
//!
//! Missing cells (nulls, `NaN`) are flagged per row. The flag behaves as an extra most
//! significant bit above the 64 radix bits, which is how the missing sentinel stays distinct
//! from every real value.

use super::RowRef;
use crate::error::Side;
use crate::frame::{Column, ColumnData, DataType, Table};
use crate::{Error, Result};
use rayon::prelude::*;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

/// Radix placeholder stored in every component of a row with a missing key
pub const MISSING_RADIX: u64 = u64::MAX;

const SIGN_BIT: u64 = 1 << 63;

/// How a key column pair is encoded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyEncoding {
    /// Two's complement integers with the sign bit flipped
    SignedInt,
    /// IEEE-754 doubles in total order
    Float,
    Bool,
    /// Ordinal in the merged label dictionary of both sides
    Dictionary,
}

/// A validated (left column, right column) key pair
#[derive(Debug, Clone)]
pub struct KeyPairPlan {
    pub left_name: String,
    pub right_name: String,
    pub left_index: usize,
    pub right_index: usize,
    pub encoding: KeyEncoding,
}

/// The validated key columns of a merge
#[derive(Debug, Clone)]
pub struct KeyPlan {
    pub pairs: Vec<KeyPairPlan>,
}

impl KeyPlan {
    pub fn width(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_left_key(&self, column: usize) -> Option<&KeyPairPlan> {
        self.pairs.iter().find(|p| p.left_index == column)
    }

    pub fn is_right_key(&self, column: usize) -> bool {
        self.pairs.iter().any(|p| p.right_index == column)
    }
}

/// Radix keys of every row of one table, stored row-major
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractedKeys {
    width: usize,
    radix: Vec<u64>,
    missing: Vec<bool>,
}

impl ExtractedKeys {
    pub fn len(&self) -> usize {
        self.missing.len()
    }

    pub fn is_empty(&self) -> bool {
        self.missing.is_empty()
    }

    /// Number of key components per row
    pub fn width(&self) -> usize {
        self.width
    }

    pub fn key(&self, row: RowRef) -> &[u64] {
        let start = row as usize * self.width;
        &self.radix[start..start + self.width]
    }

    pub fn is_missing(&self, row: RowRef) -> bool {
        self.missing[row as usize]
    }

    pub fn missing_count(&self) -> usize {
        self.missing.iter().filter(|m| **m).count()
    }

    /// Extract the radix digit of `bits` bits starting `depth * bits` bits below the most
    /// significant end of the composite key. Bits past the end of the key read as zero.
    pub fn digit(&self, row: RowRef, depth: usize, bits: u32) -> usize {
        radix_digit(self.key(row), depth, bits)
    }
}

pub(crate) fn radix_digit(key: &[u64], depth: usize, bits: u32) -> usize {
    let start = depth * bits as usize;
    let component = start / 64;
    let offset = start % 64;
    let hi = key.get(component).copied().unwrap_or(0) as u128;
    let lo = key.get(component + 1).copied().unwrap_or(0) as u128;
    let window = (hi << 64) | lo;
    let shift = 128 - offset - bits as usize;
    ((window >> shift) & ((1u128 << bits) - 1)) as usize
}

/// Order-preserving radix of a signed integer
pub fn int_radix(value: i64) -> u64 {
    (value as u64) ^ SIGN_BIT
}

/// Order-preserving radix of a float; `None` for NaN
pub fn float_radix(value: f64) -> Option<u64> {
    if value.is_nan() {
        return None;
    }
    let value = if value == 0.0 { 0.0 } else { value };
    let bits = value.to_bits();
    Some(if bits & SIGN_BIT != 0 {
        !bits
    } else {
        bits | SIGN_BIT
    })
}

/// One encoded key component for every row of a column
struct ComponentColumn {
    radix: Vec<u64>,
    missing: Vec<bool>,
}

pub struct KeyExtractor;

impl KeyExtractor {
    /// Resolve and validate the key columns before any work is scheduled.
    pub fn plan(left: &Table, right: &Table, by_x: &[String], by_y: &[String]) -> Result<KeyPlan> {
        if by_x.is_empty() {
            return Err(Error::InvalidRequest("at least one join key is required".into()));
        }
        if by_x.len() != by_y.len() {
            return Err(Error::InvalidRequest(format!(
                "by_x has {} columns but by_y has {}",
                by_x.len(),
                by_y.len()
            )));
        }

        let mut pairs = Vec::with_capacity(by_x.len());
        for (left_name, right_name) in by_x.iter().zip(by_y) {
            if pairs.iter().any(|p: &KeyPairPlan| &p.left_name == left_name) {
                return Err(Error::InvalidRequest(format!(
                    "left key column '{}' listed twice",
                    left_name
                )));
            }
            if pairs.iter().any(|p: &KeyPairPlan| &p.right_name == right_name) {
                return Err(Error::InvalidRequest(format!(
                    "right key column '{}' listed twice",
                    right_name
                )));
            }

            let left_index = left.column_index(left_name).ok_or_else(|| Error::ColumnNotFound {
                side: Side::Left,
                column: left_name.clone(),
            })?;
            let right_index =
                right
                    .column_index(right_name)
                    .ok_or_else(|| Error::ColumnNotFound {
                        side: Side::Right,
                        column: right_name.clone(),
                    })?;

            let left_type = left.columns()[left_index].data_type();
            let right_type = right.columns()[right_index].data_type();
            let encoding = Self::encoding_for(left_name, left_type, right_name, right_type)?;

            pairs.push(KeyPairPlan {
                left_name: left_name.clone(),
                right_name: right_name.clone(),
                left_index,
                right_index,
                encoding,
            });
        }

        Ok(KeyPlan { pairs })
    }

    fn encoding_for(
        left_name: &str,
        left_type: DataType,
        right_name: &str,
        right_type: DataType,
    ) -> Result<KeyEncoding> {
        for (name, data_type) in [(left_name, left_type), (right_name, right_type)] {
            if data_type == DataType::Binary {
                return Err(Error::UnsupportedKeyType {
                    column: name.to_string(),
                    data_type,
                });
            }
        }

        match (left_type, right_type) {
            (DataType::Int64, DataType::Int64) | (DataType::Timestamp, DataType::Timestamp) => {
                Ok(KeyEncoding::SignedInt)
            }
            (l, r) if l.is_numeric() && r.is_numeric() => Ok(KeyEncoding::Float),
            (DataType::Bool, DataType::Bool) => Ok(KeyEncoding::Bool),
            (l, r) if l.is_textual() && r.is_textual() => Ok(KeyEncoding::Dictionary),
            _ => Err(Error::TypeMismatch {
                left: left_name.to_string(),
                left_type,
                right: right_name.to_string(),
                right_type,
            }),
        }
    }

    /// Encode the key columns of both tables.
    pub fn extract(
        plan: &KeyPlan,
        left: &Table,
        right: &Table,
    ) -> Result<(Arc<ExtractedKeys>, Arc<ExtractedKeys>)> {
        for (side, table) in [(Side::Left, left), (Side::Right, right)] {
            if table.row_count() > RowRef::MAX as usize {
                return Err(Error::InvalidTable(format!(
                    "{} table has {} rows, more than a row reference can address",
                    side,
                    table.row_count()
                )));
            }
        }

        let mut left_components = Vec::with_capacity(plan.width());
        let mut right_components = Vec::with_capacity(plan.width());
        for pair in &plan.pairs {
            let left_column = &left.columns()[pair.left_index];
            let right_column = &right.columns()[pair.right_index];
            let (l, r) = match pair.encoding {
                KeyEncoding::Dictionary => encode_dictionary(left_column, right_column),
                encoding => (
                    encode_numeric(left_column, encoding),
                    encode_numeric(right_column, encoding),
                ),
            };
            left_components.push(l);
            right_components.push(r);
        }

        Ok((
            Arc::new(interleave(left.row_count(), left_components)),
            Arc::new(interleave(right.row_count(), right_components)),
        ))
    }
}

fn encode_numeric(column: &Column, encoding: KeyEncoding) -> ComponentColumn {
    let nulls = column.null_mask();
    let encoded: Vec<Option<u64>> = match (column.data(), encoding) {
        (ColumnData::Int64(v) | ColumnData::Timestamp(v), KeyEncoding::SignedInt) => v
            .par_iter()
            .zip(nulls.par_iter())
            .map(|(x, null)| (!null).then(|| int_radix(*x)))
            .collect(),
        // Integers paired with floats compare as f64, so values past 2^53 round together
        (ColumnData::Int64(v), KeyEncoding::Float) => v
            .par_iter()
            .zip(nulls.par_iter())
            .map(|(x, null)| if *null { None } else { float_radix(*x as f64) })
            .collect(),
        (ColumnData::Float64(v), KeyEncoding::Float) => v
            .par_iter()
            .zip(nulls.par_iter())
            .map(|(x, null)| if *null { None } else { float_radix(*x) })
            .collect(),
        (ColumnData::Bool(v), KeyEncoding::Bool) => v
            .par_iter()
            .zip(nulls.par_iter())
            .map(|(x, null)| (!null).then_some(*x as u64))
            .collect(),
        // The plan only pairs encodings with matching storage.
        _ => vec![None; column.len()],
    };

    ComponentColumn {
        missing: encoded.iter().map(Option::is_none).collect(),
        radix: encoded
            .into_iter()
            .map(|r| r.unwrap_or(MISSING_RADIX))
            .collect(),
    }
}

fn labels_of(column: &Column) -> Vec<&str> {
    match column.data() {
        ColumnData::Categorical { domain, .. } => domain.iter().map(String::as_str).collect(),
        ColumnData::String(values) => values
            .iter()
            .zip(column.null_mask())
            .filter(|(_, null)| !**null)
            .map(|(s, _)| s.as_str())
            .collect(),
        _ => Vec::new(),
    }
}

fn encode_dictionary(left: &Column, right: &Column) -> (ComponentColumn, ComponentColumn) {
    let labels: BTreeSet<&str> = labels_of(left)
        .into_iter()
        .chain(labels_of(right))
        .collect();
    let ordinals: HashMap<&str, u64> = labels
        .into_iter()
        .enumerate()
        .map(|(ordinal, label)| (label, ordinal as u64))
        .collect();

    (
        encode_with_dictionary(left, &ordinals),
        encode_with_dictionary(right, &ordinals),
    )
}

fn encode_with_dictionary(column: &Column, ordinals: &HashMap<&str, u64>) -> ComponentColumn {
    let nulls = column.null_mask();
    let encoded: Vec<Option<u64>> = match column.data() {
        ColumnData::Categorical { codes, domain } => {
            let by_code: Vec<Option<u64>> = domain
                .iter()
                .map(|label| ordinals.get(label.as_str()).copied())
                .collect();
            codes
                .par_iter()
                .zip(nulls.par_iter())
                .map(|(code, null)| {
                    if *null {
                        None
                    } else {
                        by_code.get(*code as usize).copied().flatten()
                    }
                })
                .collect()
        }
        ColumnData::String(values) => values
            .par_iter()
            .zip(nulls.par_iter())
            .map(|(s, null)| {
                if *null {
                    None
                } else {
                    ordinals.get(s.as_str()).copied()
                }
            })
            .collect(),
        _ => vec![None; column.len()],
    };

    ComponentColumn {
        missing: encoded.iter().map(Option::is_none).collect(),
        radix: encoded
            .into_iter()
            .map(|r| r.unwrap_or(MISSING_RADIX))
            .collect(),
    }
}

fn interleave(rows: usize, components: Vec<ComponentColumn>) -> ExtractedKeys {
    let width = components.len();
    let mut radix = vec![0u64; rows * width];
    radix
        .par_chunks_mut(width.max(1))
        .enumerate()
        .for_each(|(row, key)| {
            for (slot, component) in key.iter_mut().zip(&components) {
                *slot = component.radix[row];
            }
        });

    let missing = (0..rows)
        .into_par_iter()
        .map(|row| components.iter().any(|c| c.missing[row]))
        .collect();

    ExtractedKeys {
        width,
        radix,
        missing,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(columns: Vec<Column>) -> Table {
        Table::from_columns(columns).unwrap()
    }

    #[test]
    fn test_int_radix_preserves_order() {
        let values = [i64::MIN, -5, -1, 0, 1, 7, i64::MAX];
        let radices: Vec<u64> = values.iter().map(|v| int_radix(*v)).collect();
        assert!(radices.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_float_radix_preserves_order() {
        let values = [f64::NEG_INFINITY, -2.5, -0.0, 0.0, 1e-300, 3.0, f64::INFINITY];
        let radices: Vec<u64> = values.iter().map(|v| float_radix(*v).unwrap()).collect();
        assert!(radices.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(float_radix(-0.0), float_radix(0.0));
        assert_eq!(float_radix(f64::NAN), None);
    }

    #[test]
    fn test_digit_spans_components() {
        let key = [0xAB00_0000_0000_00CD_u64, 0xEF00_0000_0000_0000];
        assert_eq!(radix_digit(&key, 0, 8), 0xAB);
        assert_eq!(radix_digit(&key, 7, 8), 0xCD);
        assert_eq!(radix_digit(&key, 8, 8), 0xEF);
        // 12-bit digits straddle the component boundary at bit 60
        assert_eq!(radix_digit(&key, 5, 12), 0xDEF);
        assert_eq!(radix_digit(&key, 20, 8), 0);
    }

    #[test]
    fn test_dictionary_unifies_domains() {
        let left = table(vec![Column::categorical(
            "k",
            vec![Some("b"), Some("a"), None],
        )]);
        let right = table(vec![Column::categorical("k", vec![Some("a"), Some("c")])]);
        let plan = KeyExtractor::plan(&left, &right, &["k".into()], &["k".into()]).unwrap();
        let (l, r) = KeyExtractor::extract(&plan, &left, &right).unwrap();

        assert_eq!(l.key(1), r.key(0)); // "a"
        assert_ne!(l.key(0), r.key(1));
        assert!(l.is_missing(2));
        assert_eq!(l.missing_count(), 1);
        assert!(l.key(1)[0] < l.key(0)[0]);
    }

    #[test]
    fn test_string_and_categorical_are_comparable() {
        let left = table(vec![Column::string("k", vec![Some("x"), Some("y")])]);
        let right = table(vec![Column::categorical("id", vec![Some("y")])]);
        let plan = KeyExtractor::plan(&left, &right, &["k".into()], &["id".into()]).unwrap();
        let (l, r) = KeyExtractor::extract(&plan, &left, &right).unwrap();
        assert_eq!(l.key(1), r.key(0));
    }

    #[test]
    fn test_mixed_numeric_keys_match() {
        let left = table(vec![Column::int64("k", vec![Some(3), Some(-1)])]);
        let right = table(vec![Column::float64("k", vec![Some(-1.0), Some(3.5), None])]);
        let plan = KeyExtractor::plan(&left, &right, &["k".into()], &["k".into()]).unwrap();
        assert_eq!(plan.pairs[0].encoding, KeyEncoding::Float);

        let (l, r) = KeyExtractor::extract(&plan, &left, &right).unwrap();
        assert_eq!(l.key(1), r.key(0));
        assert_ne!(l.key(0), r.key(1));
        assert!(r.is_missing(2));
    }

    #[test]
    fn test_mixed_numeric_keys_compare_as_f64() {
        let big = 1i64 << 53;
        let left = table(vec![Column::int64("k", vec![Some(big + 1), Some(big + 2)])]);
        let right = table(vec![Column::float64("k", vec![Some(big as f64)])]);
        let plan = KeyExtractor::plan(&left, &right, &["k".into()], &["k".into()]).unwrap();

        let (l, r) = KeyExtractor::extract(&plan, &left, &right).unwrap();
        // 2^53 + 1 has no f64 of its own and rounds to 2^53; 2^53 + 2 is exact
        assert_eq!(l.key(0), r.key(0));
        assert_ne!(l.key(1), r.key(0));

        // Integer pairs keep full precision
        let right = table(vec![Column::int64("k", vec![Some(big)])]);
        let plan = KeyExtractor::plan(&left, &right, &["k".into()], &["k".into()]).unwrap();
        let (l, r) = KeyExtractor::extract(&plan, &left, &right).unwrap();
        assert_ne!(l.key(0), r.key(0));
    }

    #[test]
    fn test_rejects_binary_keys() {
        let left = table(vec![Column::binary("blob", vec![Some(vec![1])])]);
        let right = table(vec![Column::int64("blob", vec![Some(1)])]);
        let err = KeyExtractor::plan(&left, &right, &["blob".into()], &["blob".into()])
            .unwrap_err();
        assert!(matches!(err, Error::UnsupportedKeyType { .. }));
    }

    #[test]
    fn test_rejects_incompatible_types() {
        let left = table(vec![Column::int64("k", vec![Some(1)])]);
        let right = table(vec![Column::string("k", vec![Some("1")])]);
        let err = KeyExtractor::plan(&left, &right, &["k".into()], &["k".into()]).unwrap_err();
        assert!(matches!(err, Error::TypeMismatch { .. }));
    }

    #[test]
    fn test_rejects_missing_and_ragged_keys() {
        let left = table(vec![Column::int64("k", vec![Some(1)])]);
        let right = table(vec![Column::int64("k", vec![Some(1)])]);
        assert!(matches!(
            KeyExtractor::plan(&left, &right, &["nope".into()], &["k".into()]),
            Err(Error::ColumnNotFound {
                side: Side::Left,
                ..
            })
        ));
        assert!(matches!(
            KeyExtractor::plan(&left, &right, &["k".into()], &[]),
            Err(Error::InvalidRequest(_))
        ));
        assert!(matches!(
            KeyExtractor::plan(&left, &right, &[], &[]),
            Err(Error::InvalidRequest(_))
        ));
    }

    #[test]
    fn test_composite_keys_are_row_major() {
        let left = table(vec![
            Column::int64("a", vec![Some(1), Some(1)]),
            Column::boolean("b", vec![Some(false), None]),
        ]);
        let plan = KeyExtractor::plan(
            &left,
            &left,
            &["a".into(), "b".into()],
            &["a".into(), "b".into()],
        )
        .unwrap();
        let (keys, _) = KeyExtractor::extract(&plan, &left, &left).unwrap();

        assert_eq!(keys.width(), 2);
        assert_eq!(keys.key(0), &[int_radix(1), 0]);
        assert!(!keys.is_missing(0));
        assert!(keys.is_missing(1));
        assert_eq!(keys.key(1)[1], MISSING_RADIX);
    }
}
