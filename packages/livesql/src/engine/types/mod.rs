pub mod row;
pub mod value;
pub mod zset;

pub use row::{Row, RowKey, KEY_SEP};
pub use value::{compare_values, OrdValue, Value};
pub use zset::{FastMap, FastSet, Weight, ZSet};

use smol_str::SmolStr;

/// Column shape of a stream, inferred from the first pushed row or
/// declared via `CREATE TABLE`, and composed structurally for views.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Schema {
    pub columns: Vec<SmolStr>,
}

impl Schema {
    pub fn new(columns: impl IntoIterator<Item = impl Into<SmolStr>>) -> Self {
        Schema {
            columns: columns.into_iter().map(Into::into).collect(),
        }
    }

    pub fn from_row(row: &Row) -> Self {
        Schema {
            columns: row.columns().cloned().collect(),
        }
    }

    pub fn contains(&self, column: &str) -> bool {
        self.columns.iter().any(|c| c.as_str() == column)
    }
}
