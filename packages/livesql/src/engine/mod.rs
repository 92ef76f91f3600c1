pub mod circuit;
pub mod coordinator;
pub mod eval;
pub mod external;
pub mod operators;
pub mod runtime;
pub mod source;
pub mod types;
pub mod view;

pub use circuit::{Circuit, StatefulOperator, StreamId};
pub use coordinator::Coordinator;
pub use runtime::{Engine, Registry, SubscriptionId};
pub use source::{KeySpec, Source, SourceOptions, SourceSnapshot};
pub use types::{FastMap, FastSet, Row, RowKey, Schema, Value, Weight, ZSet};
pub use view::{JoinModeSpec, Materialization, View, ViewOptions, ViewSnapshot};
