//! Float-tolerant table comparison

use crate::frame::{Table, Value};
use crate::{Error, Result};

/// Whether two numeric cells agree within `rel_eps` relative or `abs_tol` absolute tolerance
pub fn numbers_close(expected: f64, actual: f64, rel_eps: f64, abs_tol: f64) -> bool {
    if expected == actual {
        return true;
    }
    let diff = (expected - actual).abs();
    diff <= abs_tol || diff <= rel_eps * expected.abs().max(actual.abs())
}

/// Compare two tables cell by cell.
///
/// Column names and order must match. Missing cells only equal missing cells; numeric cells
/// (integers and floats, in any mix) use [`numbers_close`]; all other cells compare exactly.
/// The first difference is returned as [`Error::Mismatch`].
pub fn compare_numeric_tables(
    expected: &Table,
    actual: &Table,
    rel_eps: f64,
    abs_tol: f64,
) -> Result<()> {
    if expected.column_names() != actual.column_names() {
        return Err(Error::Mismatch(format!(
            "columns differ: expected {:?}, got {:?}",
            expected.column_names(),
            actual.column_names()
        )));
    }
    if expected.row_count() != actual.row_count() {
        return Err(Error::Mismatch(format!(
            "row counts differ: expected {}, got {}",
            expected.row_count(),
            actual.row_count()
        )));
    }

    for (left, right) in expected.columns().iter().zip(actual.columns()) {
        for row in 0..expected.row_count() {
            let (e, a) = (left.value(row), right.value(row));
            let same = match (&e, &a) {
                (Value::Null, Value::Null) => true,
                (Value::Null, _) | (_, Value::Null) => false,
                (Value::Categorical(x) | Value::String(x), Value::Categorical(y) | Value::String(y)) => {
                    x == y
                }
                _ => match (e.as_f64(), a.as_f64()) {
                    (Some(x), Some(y)) if is_number(&e) && is_number(&a) => {
                        numbers_close(x, y, rel_eps, abs_tol)
                    }
                    _ => e == a,
                },
            };
            if !same {
                return Err(Error::Mismatch(format!(
                    "column '{}' row {}: expected {}, got {}",
                    left.name(),
                    row,
                    e,
                    a
                )));
            }
        }
    }
    Ok(())
}

fn is_number(value: &Value) -> bool {
    matches!(value, Value::Int64(_) | Value::Float64(_))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Column;

    fn table(values: Vec<Option<f64>>) -> Table {
        Table::from_columns(vec![
            Column::int64("id", (0..values.len() as i64).map(Some).collect()),
            Column::float64("x", values),
        ])
        .unwrap()
    }

    #[test]
    fn test_tolerances() {
        assert!(numbers_close(100.0, 100.009, 1e-4, 0.0));
        assert!(!numbers_close(100.0, 100.02, 1e-4, 0.0));
        assert!(numbers_close(0.0, 1e-11, 0.0, 1e-10));
        assert!(!numbers_close(0.0, 1e-9, 1e-4, 1e-10));
    }

    #[test]
    fn test_missing_cells_only_match_missing() {
        let expected = table(vec![Some(1.0), None]);
        compare_numeric_tables(&expected, &table(vec![Some(1.00001), None]), 1e-4, 1e-10).unwrap();

        let err = compare_numeric_tables(&expected, &table(vec![Some(1.0), Some(0.0)]), 1e-4, 1e-10)
            .unwrap_err();
        assert!(err.to_string().contains("column 'x' row 1"));
    }

    #[test]
    fn test_integer_and_float_columns_compare_numerically() {
        let ints = Table::from_columns(vec![Column::int64("a", vec![Some(3)])]).unwrap();
        let floats = Table::from_columns(vec![Column::float64("a", vec![Some(3.0)])]).unwrap();
        compare_numeric_tables(&ints, &floats, 1e-4, 1e-10).unwrap();
    }

    #[test]
    fn test_shape_mismatch() {
        let short = table(vec![Some(1.0)]);
        let long = table(vec![Some(1.0), Some(2.0)]);
        assert!(matches!(
            compare_numeric_tables(&short, &long, 1e-4, 1e-10),
            Err(Error::Mismatch(_))
        ));

        let renamed = Table::from_columns(vec![Column::float64("y", vec![Some(1.0)])]).unwrap();
        assert!(compare_numeric_tables(&short, &renamed, 1e-4, 1e-10).is_err());
    }

    #[test]
    fn test_text_compares_exactly() {
        let a = Table::from_columns(vec![Column::categorical("c", vec![Some("x")])]).unwrap();
        let b = Table::from_columns(vec![Column::string("c", vec![Some("x")])]).unwrap();
        let c = Table::from_columns(vec![Column::string("c", vec![Some("X")])]).unwrap();
        compare_numeric_tables(&a, &b, 0.0, 0.0).unwrap();
        assert!(compare_numeric_tables(&a, &c, 0.0, 0.0).is_err());
    }
}
