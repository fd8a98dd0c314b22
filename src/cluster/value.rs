//! Bound values, column types and result rows.

use std::cmp::Ordering;

use crate::error_handling::ClusterError;

use super::timeuuid::TimeUuid;

/// Column types used by the queue and store schemas.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    Text,
    TimeUuid,
    Int,
    BigInt,
    Boolean,
    Timestamp,
    Blob,
}

impl ColumnType {
    pub fn cql_name(&self) -> &'static str {
        match self {
            ColumnType::Text => "text",
            ColumnType::TimeUuid => "timeuuid",
            ColumnType::Int => "int",
            ColumnType::BigInt => "bigint",
            ColumnType::Boolean => "boolean",
            ColumnType::Timestamp => "timestamp",
            ColumnType::Blob => "blob",
        }
    }
}

/// A value bound to a statement or read from a row.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Value {
    Null,
    Text(String),
    TimeUuid(TimeUuid),
    Int(i32),
    BigInt(i64),
    Boolean(bool),
    /// Milliseconds since the Unix epoch.
    Timestamp(i64),
    Blob(Vec<u8>),
}

impl Value {
    pub fn column_type(&self) -> Option<ColumnType> {
        match self {
            Value::Null => None,
            Value::Text(_) => Some(ColumnType::Text),
            Value::TimeUuid(_) => Some(ColumnType::TimeUuid),
            Value::Int(_) => Some(ColumnType::Int),
            Value::BigInt(_) => Some(ColumnType::BigInt),
            Value::Boolean(_) => Some(ColumnType::Boolean),
            Value::Timestamp(_) => Some(ColumnType::Timestamp),
            Value::Blob(_) => Some(ColumnType::Blob),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Whether the value may be bound to a column of type `ty`. `Null` fits anywhere.
    pub fn fits(&self, ty: ColumnType) -> bool {
        self.column_type().map_or(true, |own| own == ty)
    }

    fn rank(&self) -> u8 {
        match self {
            Value::Null => 0,
            Value::Text(_) => 1,
            Value::TimeUuid(_) => 2,
            Value::Int(_) => 3,
            Value::BigInt(_) => 4,
            Value::Boolean(_) => 5,
            Value::Timestamp(_) => 6,
            Value::Blob(_) => 7,
        }
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::BigInt(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Boolean(v)
    }
}

impl From<TimeUuid> for Value {
    fn from(v: TimeUuid) -> Self {
        Value::TimeUuid(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Blob(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Value::Null, Into::into)
    }
}

/// Total order used for primary key sorting.
///
/// Values of the same type compare naturally (time UUIDs by timestamp first);
/// mixed types fall back to a fixed type rank so sorting never panics.
pub fn compare_values(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Text(x), Value::Text(y)) => x.cmp(y),
        (Value::TimeUuid(x), Value::TimeUuid(y)) => x.cmp(y),
        (Value::Int(x), Value::Int(y)) => x.cmp(y),
        (Value::BigInt(x), Value::BigInt(y)) => x.cmp(y),
        (Value::Boolean(x), Value::Boolean(y)) => x.cmp(y),
        (Value::Timestamp(x), Value::Timestamp(y)) => x.cmp(y),
        (Value::Blob(x), Value::Blob(y)) => x.cmp(y),
        _ => a.rank().cmp(&b.rank()),
    }
}

/// One result row: column names in projection order with their values.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Row {
    columns: Vec<(String, Value)>,
}

impl Row {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, name: impl Into<String>, value: Value) {
        self.columns.push((name.into(), value));
    }

    pub fn with(mut self, name: impl Into<String>, value: Value) -> Self {
        self.push(name, value);
        self
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.columns
            .iter()
            .find(|(column, _)| column == name)
            .map(|(_, value)| value)
    }

    pub fn columns(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.columns.iter().map(|(n, v)| (n.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    fn typed<T>(
        &self,
        name: &str,
        expected: ColumnType,
        extract: impl FnOnce(&Value) -> Option<T>,
    ) -> Result<Option<T>, ClusterError> {
        let value = self
            .get(name)
            .ok_or_else(|| ClusterError::Decoding(format!("column `{name}` not in result")))?;
        if value.is_null() {
            return Ok(None);
        }
        extract(value).map(Some).ok_or_else(|| {
            ClusterError::Decoding(format!(
                "column `{name}`: expected {}, got {:?}",
                expected.cql_name(),
                value.column_type().map(|t| t.cql_name())
            ))
        })
    }

    pub fn text(&self, name: &str) -> Result<Option<String>, ClusterError> {
        self.typed(name, ColumnType::Text, |v| match v {
            Value::Text(s) => Some(s.clone()),
            _ => None,
        })
    }

    pub fn time_uuid(&self, name: &str) -> Result<Option<TimeUuid>, ClusterError> {
        self.typed(name, ColumnType::TimeUuid, |v| match v {
            Value::TimeUuid(u) => Some(*u),
            _ => None,
        })
    }

    pub fn int(&self, name: &str) -> Result<Option<i32>, ClusterError> {
        self.typed(name, ColumnType::Int, |v| match v {
            Value::Int(i) => Some(*i),
            _ => None,
        })
    }

    pub fn bigint(&self, name: &str) -> Result<Option<i64>, ClusterError> {
        self.typed(name, ColumnType::BigInt, |v| match v {
            Value::BigInt(i) => Some(*i),
            _ => None,
        })
    }

    pub fn boolean(&self, name: &str) -> Result<Option<bool>, ClusterError> {
        self.typed(name, ColumnType::Boolean, |v| match v {
            Value::Boolean(b) => Some(*b),
            _ => None,
        })
    }

    pub fn timestamp(&self, name: &str) -> Result<Option<i64>, ClusterError> {
        self.typed(name, ColumnType::Timestamp, |v| match v {
            Value::Timestamp(ms) => Some(*ms),
            _ => None,
        })
    }

    pub fn blob(&self, name: &str) -> Result<Option<Vec<u8>>, ClusterError> {
        self.typed(name, ColumnType::Blob, |v| match v {
            Value::Blob(b) => Some(b.clone()),
            _ => None,
        })
    }
}
