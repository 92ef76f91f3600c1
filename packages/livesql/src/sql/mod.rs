pub mod ast;
pub mod compile;

pub use ast::{
    AggFunc, BinaryOp, CreateTable, CreateView, Expr, Frame, FrameBound, Join, JoinKind,
    OrderByExpr, OrderTarget, Query, Select, SelectItem, SetExpr, SetOpKind, Statement, TableRef,
    TypeName, WindowExpr, WindowFunc,
};
pub use compile::{compile_query, CompileOptions, Compiled};
