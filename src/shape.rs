//! Result shaping.
//!
//! Collapses a raw rectangular result set into the value shape a caller
//! expects from the query's cardinality:
//!
//! | rows | columns | result                        |
//! |------|---------|-------------------------------|
//! | 0    | any     | `None`                        |
//! | 1    | 1       | the single scalar             |
//! | 1    | >1      | one name→value mapping        |
//! | >1   | 1       | an ordered list of scalars    |
//! | >1   | >1      | an ordered list of mappings   |
//!
//! Zero rows and "this query conceptually returns nothing" are
//! indistinguishable by contract: both shape to [`QueryOutput::None`].

use std::collections::HashMap;

use serde_json::Value;

/// The shaped result of one query execution.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryOutput {
    /// No rows came back, or the execution soft-failed.
    None,
    /// Exactly one row with one column.
    Scalar(Value),
    /// Exactly one row with several columns.
    Row(HashMap<String, Value>),
    /// Several rows of a single column.
    Column(Vec<Value>),
    /// Several rows of several columns.
    Rows(Vec<HashMap<String, Value>>),
}

impl QueryOutput {
    /// Whether the execution produced no result.
    pub fn is_none(&self) -> bool {
        matches!(self, QueryOutput::None)
    }

    /// The scalar value, if the result was a single cell.
    pub fn as_scalar(&self) -> Option<&Value> {
        match self {
            QueryOutput::Scalar(value) => Some(value),
            _ => None,
        }
    }

    /// The single row mapping, if the result was one multi-column row.
    pub fn as_row(&self) -> Option<&HashMap<String, Value>> {
        match self {
            QueryOutput::Row(row) => Some(row),
            _ => None,
        }
    }

    /// The scalar list, if the result was a single-column set of rows.
    pub fn as_column(&self) -> Option<&[Value]> {
        match self {
            QueryOutput::Column(values) => Some(values),
            _ => None,
        }
    }

    /// The row mappings, if the result was a multi-row, multi-column set.
    pub fn as_rows(&self) -> Option<&[HashMap<String, Value>]> {
        match self {
            QueryOutput::Rows(rows) => Some(rows),
            _ => None,
        }
    }
}

fn zip_row(columns: &[String], row: Vec<Value>) -> HashMap<String, Value> {
    columns.iter().cloned().zip(row).collect()
}

fn first_cell(row: Vec<Value>) -> Value {
    row.into_iter().next().unwrap_or(Value::Null)
}

/// Shape a raw result set by its row and column cardinality.
///
/// Pure and deterministic; `columns` names the columns shared by every row.
pub fn shape(columns: &[String], rows: Vec<Vec<Value>>) -> QueryOutput {
    match (rows.len(), columns.len()) {
        (0, _) | (_, 0) => QueryOutput::None,
        (1, 1) => QueryOutput::Scalar(rows.into_iter().next().map(first_cell).unwrap_or(Value::Null)),
        (1, _) => match rows.into_iter().next() {
            Some(row) => QueryOutput::Row(zip_row(columns, row)),
            None => QueryOutput::None,
        },
        (_, 1) => QueryOutput::Column(rows.into_iter().map(first_cell).collect()),
        (_, _) => QueryOutput::Rows(
            rows.into_iter()
                .map(|row| zip_row(columns, row))
                .collect(),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn cols(names: &[&str]) -> Vec<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    #[test]
    fn test_empty_result_is_none() {
        assert_eq!(shape(&[], vec![]), QueryOutput::None);
        assert_eq!(shape(&cols(&["n"]), vec![]), QueryOutput::None);
    }

    #[test]
    fn test_single_cell_is_scalar() {
        let out = shape(&cols(&["n"]), vec![vec![json!(5)]]);
        assert_eq!(out, QueryOutput::Scalar(json!(5)));
        assert_eq!(out.as_scalar(), Some(&json!(5)));
    }

    #[test]
    fn test_single_column_is_scalar_list() {
        let out = shape(&cols(&["n"]), vec![vec![json!(1)], vec![json!(2)], vec![json!(3)]]);
        assert_eq!(out, QueryOutput::Column(vec![json!(1), json!(2), json!(3)]));
    }

    #[test]
    fn test_single_row_is_mapping() {
        let out = shape(&cols(&["a", "b"]), vec![vec![json!(1), json!("x")]]);
        let expected: HashMap<String, Value> =
            [("a".to_string(), json!(1)), ("b".to_string(), json!("x"))]
                .into_iter()
                .collect();
        assert_eq!(out, QueryOutput::Row(expected));
    }

    #[test]
    fn test_multi_row_is_mapping_list() {
        let out = shape(
            &cols(&["a", "b"]),
            vec![vec![json!(1), json!("x")], vec![json!(2), json!("y")]],
        );
        let expected = vec![
            [("a".to_string(), json!(1)), ("b".to_string(), json!("x"))]
                .into_iter()
                .collect::<HashMap<String, Value>>(),
            [("a".to_string(), json!(2)), ("b".to_string(), json!("y"))]
                .into_iter()
                .collect(),
        ];
        assert_eq!(out, QueryOutput::Rows(expected));
    }

    #[test]
    fn test_zero_columns_is_none() {
        // A rowset with no columns carries nothing to shape.
        assert_eq!(shape(&[], vec![vec![], vec![]]), QueryOutput::None);
    }
}
