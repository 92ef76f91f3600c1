//! livesql: an embedded incremental view-maintenance engine.
//!
//! Applications push row changes into named sources, register SQL views
//! over them, and receive the row-level deltas that keep each view's
//! integrated state equal to running its query over the current source
//! contents. No base table is ever re-scanned; every operator folds the
//! incoming change into its own state and emits its own change.

pub mod engine;
pub mod error;
pub mod logging;
pub mod sql;

pub use engine::circuit::{Circuit, StatefulOperator, StreamId};
pub use engine::runtime::Engine;
pub use engine::source::{KeySpec, SourceOptions};
pub use engine::types::{FastMap, FastSet, Row, RowKey, Schema, Value, Weight, ZSet};
pub use engine::view::{JoinModeSpec, ViewOptions};
pub use error::{EngineError, Result};
pub use sql::ast::{Expr, Query, Select, Statement};
