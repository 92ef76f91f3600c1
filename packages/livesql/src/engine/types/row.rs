use super::value::Value;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use smol_str::SmolStr;

/// Separator used when deriving key strings from multiple column values.
pub const KEY_SEP: char = '\u{1f}';

/// Row identity. Derived from the declared source key for base rows, from
/// content for operator outputs; opaque to everything downstream.
pub type RowKey = SmolStr;

/// An ordered mapping from column name to scalar value. Column order is
/// insertion order and survives projection, which keeps emitted rows
/// readable and schema inference deterministic.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Row(pub IndexMap<SmolStr, Value>);

impl Row {
    pub fn new() -> Self {
        Row(IndexMap::new())
    }

    pub fn with_capacity(cap: usize) -> Self {
        Row(IndexMap::with_capacity(cap))
    }

    pub fn get(&self, column: &str) -> Option<&Value> {
        self.0.get(column)
    }

    pub fn set(&mut self, column: impl Into<SmolStr>, value: Value) {
        self.0.insert(column.into(), value);
    }

    pub fn columns(&self) -> impl Iterator<Item = &SmolStr> {
        self.0.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&SmolStr, &Value)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Content-derived identity for rows produced by projections, joins
    /// and set operations, where no declared key exists. Stable under
    /// reserialization: equal rows yield equal keys.
    pub fn content_key(&self) -> RowKey {
        let mut out = String::with_capacity(self.0.len() * 12);
        for (name, value) in &self.0 {
            out.push_str(name.as_str());
            out.push('=');
            out.push_str(value.key_repr().as_str());
            out.push(KEY_SEP);
        }
        SmolStr::new(out)
    }

    /// Key derived from the named columns, joined by `KEY_SEP`.
    pub fn key_of(&self, columns: &[SmolStr]) -> Option<RowKey> {
        let mut out = String::new();
        for (i, col) in columns.iter().enumerate() {
            let v = self.get(col.as_str())?;
            if i > 0 {
                out.push(KEY_SEP);
            }
            out.push_str(v.key_repr().as_str());
        }
        Some(SmolStr::new(out))
    }
}

impl FromIterator<(SmolStr, Value)> for Row {
    fn from_iter<T: IntoIterator<Item = (SmolStr, Value)>>(iter: T) -> Self {
        Row(iter.into_iter().collect())
    }
}

impl From<JsonValue> for Row {
    fn from(v: JsonValue) -> Self {
        match v {
            JsonValue::Object(obj) => Row(obj
                .into_iter()
                .map(|(k, v)| (SmolStr::from(k), Value::from(v)))
                .collect()),
            other => {
                let mut row = Row::new();
                row.set("value", Value::from(other));
                row
            }
        }
    }
}

impl From<Row> for JsonValue {
    fn from(row: Row) -> Self {
        JsonValue::Object(
            row.0
                .into_iter()
                .map(|(k, v)| (k.to_string(), v.into()))
                .collect(),
        )
    }
}
