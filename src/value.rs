//! Dynamic bind values and named query arguments.

use std::collections::HashMap;

/// Dynamic value type for query parameter bindings.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Json(serde_json::Value),
}

impl From<bool> for SqlValue {
    fn from(v: bool) -> Self {
        SqlValue::Bool(v)
    }
}

impl From<i32> for SqlValue {
    fn from(v: i32) -> Self {
        SqlValue::Int(v as i64)
    }
}

impl From<i64> for SqlValue {
    fn from(v: i64) -> Self {
        SqlValue::Int(v)
    }
}

impl From<f64> for SqlValue {
    fn from(v: f64) -> Self {
        SqlValue::Float(v)
    }
}

impl From<&str> for SqlValue {
    fn from(v: &str) -> Self {
        SqlValue::String(v.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(v: String) -> Self {
        SqlValue::String(v)
    }
}

impl From<serde_json::Value> for SqlValue {
    fn from(v: serde_json::Value) -> Self {
        SqlValue::Json(v)
    }
}

impl<T: Into<SqlValue>> From<Option<T>> for SqlValue {
    fn from(v: Option<T>) -> Self {
        match v {
            Some(inner) => inner.into(),
            None => SqlValue::Null,
        }
    }
}

/// Named arguments for a query execution.
///
/// A parameter declared in the template but absent from the arguments binds
/// to `SqlValue::Null` at execution time; it is never an error.
///
/// # Example
///
/// ```
/// use sqlhub::Args;
///
/// let args = Args::new().set("id", 7).set("name", "ada");
/// assert_eq!(args.len(), 2);
/// ```
#[derive(Debug, Clone, Default)]
pub struct Args(HashMap<String, SqlValue>);

impl Args {
    /// Create an empty argument map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a named argument, consuming and returning the map for chaining.
    pub fn set(mut self, name: impl Into<String>, value: impl Into<SqlValue>) -> Self {
        self.0.insert(name.into(), value.into());
        self
    }

    /// Look up an argument by parameter name.
    pub fn get(&self, name: &str) -> Option<&SqlValue> {
        self.0.get(name)
    }

    /// Number of arguments set.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether no arguments are set.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K: Into<String>, V: Into<SqlValue>> FromIterator<(K, V)> for Args {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}
