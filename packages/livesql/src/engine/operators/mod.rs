pub mod aggregate;
pub mod join;
pub mod linear;
pub mod subquery;
pub mod topk;
pub mod window;

pub use aggregate::{AggKind, AggSpec, AggregateOp};
pub use join::{JoinKind, JoinMode, JoinOp, JoinProjector};
pub use linear::{filter_delta, union_delta, DistinctOp, SetOp, SetOpKind};
pub use subquery::{ScalarApplyOp, SemiJoinKind, SemiJoinOp};
pub use topk::TopKOp;
pub use window::{WindowOp, WindowSpec};
