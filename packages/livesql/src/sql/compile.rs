//! Compiles the normalized AST into a circuit, bottom-up: FROM and joins
//! first, then WHERE, aggregation, windows, projection, DISTINCT, set
//! operations, and finally ORDER BY / LIMIT. Column references resolve at
//! compile time so unknown and ambiguous names fail before any state is
//! built.

use crate::engine::circuit::{Circuit, StreamId};
use crate::engine::eval::{eval_expr, EvalCtx, FaultFlag};
use crate::engine::operators::{
    filter_delta, union_delta, AggKind, AggSpec, AggregateOp, DistinctOp, JoinMode, JoinOp,
    JoinProjector, ScalarApplyOp, SemiJoinKind, SemiJoinOp, SetOp, TopKOp, WindowOp, WindowSpec,
};
use crate::engine::operators::join::JoinKind as OpJoinKind;
use crate::engine::operators::linear::SetOpKind as OpSetOpKind;
use crate::engine::external::JoinSink;
use crate::engine::types::{FastMap, FastSet, Row, Schema, ZSet};
use crate::engine::view::JoinModeSpec;
use crate::error::{EngineError, Result};
use crate::sql::ast::{
    Expr, Join, JoinKind, OrderByExpr, OrderTarget, Query, Select, SelectItem, SetExpr, SetOpKind,
    TableRef, UnaryOp,
};
use smol_str::SmolStr;

pub struct CompileOptions<'a> {
    pub join_mode: JoinModeSpec,
    pub max_join_results: Option<usize>,
    pub sink_factory: Option<&'a (dyn Fn() -> Box<dyn JoinSink>)>,
}

impl Default for CompileOptions<'_> {
    fn default() -> Self {
        CompileOptions {
            join_mode: JoinModeSpec::Materialized,
            max_join_results: None,
            sink_factory: None,
        }
    }
}

pub struct Compiled {
    pub circuit: Circuit,
    pub schema: Schema,
}

pub fn compile_query(
    query: &Query,
    schemas: &FastMap<SmolStr, Schema>,
    known: &FastSet<SmolStr>,
    opts: &CompileOptions<'_>,
) -> Result<Compiled> {
    let mut compiler = Compiler {
        schemas,
        known,
        opts,
        circuit: Circuit::new(),
        ctes: Vec::new(),
    };
    let (stream, schema) = compiler.compile_query_inner(query)?;
    compiler.circuit.set_output(stream);
    Ok(Compiled {
        circuit: compiler.circuit,
        schema,
    })
}

#[derive(Clone)]
struct ScopeRel {
    alias: SmolStr,
    columns: Vec<SmolStr>,
}

/// The columns visible at one point in the pipeline. Rows from a single
/// relation carry bare column names; merged join rows carry
/// `alias.column`.
#[derive(Clone)]
struct Scope {
    rels: Vec<ScopeRel>,
    qualified: bool,
}

impl Scope {
    fn single(alias: SmolStr, columns: Vec<SmolStr>) -> Self {
        Scope {
            rels: vec![ScopeRel { alias, columns }],
            qualified: false,
        }
    }

    fn physical(&self, alias: &str, column: &str) -> SmolStr {
        if self.qualified {
            SmolStr::new(format!("{}.{}", alias, column))
        } else {
            SmolStr::new(column)
        }
    }

    fn resolve(&self, table: Option<&SmolStr>, name: &SmolStr) -> Result<SmolStr> {
        match table {
            Some(t) => {
                let rel = self
                    .rels
                    .iter()
                    .find(|r| r.alias == *t)
                    .ok_or_else(|| EngineError::compile(format!("unknown relation '{t}'")))?;
                if !rel.columns.iter().any(|c| c == name) {
                    return Err(EngineError::compile(format!("unknown column '{t}.{name}'")));
                }
                Ok(self.physical(t, name))
            }
            None => {
                let mut hits = self
                    .rels
                    .iter()
                    .filter(|r| r.columns.iter().any(|c| c == name));
                match (hits.next(), hits.next()) {
                    (Some(rel), None) => Ok(self.physical(&rel.alias, name)),
                    (Some(_), Some(_)) => {
                        Err(EngineError::compile(format!("ambiguous column '{name}'")))
                    }
                    _ => Err(EngineError::compile(format!("unknown column '{name}'"))),
                }
            }
        }
    }

    /// Can `name` (optionally qualified) be resolved here?
    fn covers(&self, table: Option<&SmolStr>, name: &SmolStr) -> bool {
        self.resolve(table, name).is_ok()
    }
}

#[derive(PartialEq, Clone, Copy)]
enum Side {
    Left,
    Right,
    Mixed,
}

struct Compiler<'a> {
    schemas: &'a FastMap<SmolStr, Schema>,
    known: &'a FastSet<SmolStr>,
    opts: &'a CompileOptions<'a>,
    circuit: Circuit,
    ctes: Vec<(SmolStr, StreamId, Schema)>,
}

impl<'a> Compiler<'a> {
    fn compile_query_inner(&mut self, query: &Query) -> Result<(StreamId, Schema)> {
        let cte_mark = self.ctes.len();
        for cte in &query.with {
            let (stream, schema) = self.compile_query_inner(&cte.query)?;
            self.ctes.push((cte.name.clone(), stream, schema));
        }
        let result = self.compile_set_expr(&query.body);
        self.ctes.truncate(cte_mark);
        result
    }

    fn compile_set_expr(&mut self, body: &SetExpr) -> Result<(StreamId, Schema)> {
        match body {
            SetExpr::Select(select) => self.compile_select(select),
            SetExpr::SetOp {
                op,
                all,
                left,
                right,
            } => {
                let (ls, lschema) = self.compile_set_expr(left)?;
                let (rs, rschema) = self.compile_set_expr(right)?;
                if lschema.columns.len() != rschema.columns.len() {
                    return Err(EngineError::compile(
                        "set operation arms have different column counts",
                    ));
                }
                // Row identity must be content-derived so equal rows from
                // the two arms land on one key.
                let ls = self.rekey_stage(ls);
                let rs = self.rekey_stage(rs);
                let combined = match op {
                    SetOpKind::Union => {
                        let unioned =
                            self.circuit.stateless([ls, rs], |ins: &[&ZSet]| union_delta(ins));
                        if *all {
                            unioned
                        } else {
                            self.circuit
                                .stateful([unioned], Box::new(DistinctOp::new()))
                        }
                    }
                    SetOpKind::Intersect => self.circuit.stateful(
                        [ls, rs],
                        Box::new(SetOp::new(OpSetOpKind::Intersect, *all)),
                    ),
                    SetOpKind::Except => self
                        .circuit
                        .stateful([ls, rs], Box::new(SetOp::new(OpSetOpKind::Except, *all))),
                };
                Ok((combined, lschema))
            }
        }
    }

    fn rekey_stage(&mut self, stream: StreamId) -> StreamId {
        self.circuit.stateless([stream], |ins: &[&ZSet]| {
            ins[0].map(|row| (row.content_key(), row.clone()))
        })
    }

    fn compile_relation(&mut self, tref: &TableRef) -> Result<(StreamId, Scope)> {
        match tref {
            TableRef::Table { name, alias } => {
                let alias = alias.clone().unwrap_or_else(|| name.clone());
                if let Some((_, stream, schema)) =
                    self.ctes.iter().rev().find(|(n, _, _)| n == name).cloned()
                {
                    return Ok((stream, Scope::single(alias, schema.columns)));
                }
                if let Some(schema) = self.schemas.get(name) {
                    let stream = self.circuit.input(name.clone());
                    return Ok((stream, Scope::single(alias, schema.columns.clone())));
                }
                if self.known.contains(name) {
                    return Err(EngineError::SchemaNotReady(name.to_string()));
                }
                Err(EngineError::compile(format!("unknown table '{name}'")))
            }
            TableRef::Derived { query, alias } => {
                let (stream, schema) = self.compile_query_inner(query)?;
                Ok((stream, Scope::single(alias.clone(), schema.columns)))
            }
        }
    }

    fn compile_select(&mut self, select: &Select) -> Result<(StreamId, Schema)> {
        let from = select
            .from
            .as_ref()
            .ok_or_else(|| EngineError::compile("SELECT requires a FROM clause"))?;
        let (mut stream, mut scope) = self.compile_relation(from)?;

        for join in &select.joins {
            (stream, scope) = self.compile_join(stream, scope, join)?;
        }

        // WHERE: plain conjuncts become one filter; subquery conjuncts
        // become semi-joins against their compiled sub-circuits.
        if let Some(filter) = &select.filter {
            let mut plain: Option<Expr> = None;
            for conjunct in filter.conjuncts() {
                if let Some(stage) = self.try_subquery_conjunct(conjunct, &scope)? {
                    let (kind, query) = stage;
                    let (sub, _) = self.compile_query_inner(&query)?;
                    stream = self
                        .circuit
                        .stateful([stream, sub], Box::new(SemiJoinOp::new(kind)));
                    continue;
                }
                if contains_subquery(conjunct) {
                    return Err(EngineError::compile(
                        "subqueries are only supported as top-level WHERE conjuncts",
                    ));
                }
                let resolved = self.resolve_expr(conjunct, &scope)?;
                plain = Some(match plain {
                    Some(acc) => Expr::and(acc, resolved),
                    None => resolved,
                });
            }
            if let Some(pred) = plain {
                let faults = FaultFlag::new("filter");
                stream = self.circuit.stateless([stream], move |ins: &[&ZSet]| {
                    filter_delta(ins[0], &pred, &faults)
                });
            }
        }

        let has_aggregates = !select.group_by.is_empty()
            || select.having.is_some()
            || select
                .items
                .iter()
                .any(|i| matches!(i, SelectItem::Expr { expr, .. } if contains_aggregate(expr)));

        let mut items = self.expand_items(&select.items, &scope)?;

        if has_aggregates {
            (stream, items) = self.compile_aggregation(stream, &scope, select, items)?;
        } else if items.iter().any(|(_, e)| contains_window(e)) || select.qualify.is_some() {
            (stream, items) = self.compile_windows(stream, select, items)?;
        }

        // Final projection, with scalar subqueries applied as a stateful
        // post-stage holding the latest sub-circuit value.
        let identity = !has_aggregates
            && select.qualify.is_none()
            && is_identity_projection(&select.items, &scope)
            && !select.distinct;
        let mut schema = Schema::new(items.iter().map(|(n, _)| n.clone()));
        if identity {
            schema = Schema::new(scope.rels[0].columns.clone());
        } else {
            let mut scalar_queries: Vec<Query> = Vec::new();
            let items_with_scalars: Vec<(SmolStr, Expr)> = items
                .iter()
                .map(|(n, e)| (n.clone(), extract_scalars(e, &mut scalar_queries)))
                .collect();
            if scalar_queries.is_empty() {
                let projection = items_with_scalars;
                let faults = FaultFlag::new("project");
                stream = self.circuit.stateless([stream], move |ins: &[&ZSet]| {
                    ins[0].map(|row| {
                        let ctx = EvalCtx {
                            row,
                            scalars: &[],
                            aggs: &[],
                            faults: Some(&faults),
                        };
                        let mut out = Row::with_capacity(projection.len());
                        for (name, expr) in &projection {
                            out.set(name.clone(), eval_expr(expr, &ctx));
                        }
                        (out.content_key(), out)
                    })
                });
            } else {
                let mut inputs = vec![stream];
                for q in &scalar_queries {
                    let (sub, _) = self.compile_query_inner(q)?;
                    inputs.push(sub);
                }
                stream = self.circuit.stateful(
                    inputs,
                    Box::new(ScalarApplyOp::new(
                        items_with_scalars,
                        scalar_queries.len(),
                    )),
                );
            }
        }

        if select.distinct {
            stream = self.circuit.stateful([stream], Box::new(DistinctOp::new()));
        }

        if select.limit.is_some() || select.offset.is_some() {
            let order = self.resolve_order_by(&select.order_by, &schema)?;
            let limit = select.limit.unwrap_or(usize::MAX);
            let offset = select.offset.unwrap_or(0);
            stream = self
                .circuit
                .stateful([stream], Box::new(TopKOp::new(order, limit, offset)));
        }

        Ok((stream, schema))
    }

    // --- joins ---------------------------------------------------------

    fn compile_join(
        &mut self,
        left_stream: StreamId,
        left_scope: Scope,
        join: &Join,
    ) -> Result<(StreamId, Scope)> {
        let (right_stream, right_scope) = self.compile_relation(&join.relation)?;
        let right_rel = right_scope.rels[0].clone();
        if left_scope.rels.iter().any(|r| r.alias == right_rel.alias) {
            return Err(EngineError::compile(format!(
                "duplicate relation alias '{}'",
                right_rel.alias
            )));
        }

        let mut merged = Scope {
            rels: left_scope.rels.clone(),
            qualified: true,
        };
        merged.rels.push(right_rel.clone());

        let (left_key, right_key, residual) = match (join.kind, &join.on) {
            (JoinKind::Cross, _) | (_, None) => (None, None, None),
            (_, Some(on)) => self.split_on(on, &left_scope, &right_scope, &merged)?,
        };

        let left_cols: Vec<SmolStr> = left_scope
            .rels
            .iter()
            .flat_map(|r| {
                r.columns
                    .iter()
                    .map(|c| left_scope.physical(&r.alias, c))
                    .collect::<Vec<_>>()
            })
            .collect();
        let projector = JoinProjector::qualify(
            left_scope.rels[0].alias.as_str(),
            &left_cols,
            right_rel.alias.as_str(),
            &right_rel.columns,
        );

        let kind = match join.kind {
            JoinKind::Inner => OpJoinKind::Inner,
            JoinKind::Left => OpJoinKind::Left,
            JoinKind::Right => OpJoinKind::Right,
            JoinKind::Full => OpJoinKind::Full,
            JoinKind::Cross => OpJoinKind::Cross,
        };
        let mode = match self.opts.join_mode {
            JoinModeSpec::AppendOnly => JoinMode::AppendOnly,
            JoinModeSpec::Materialized => JoinMode::Materialized {
                max_results: self.opts.max_join_results.unwrap_or(usize::MAX),
            },
            JoinModeSpec::External => {
                let factory = self.opts.sink_factory.ok_or_else(|| {
                    EngineError::compile("external join mode requires a sink factory")
                })?;
                let mut sink = factory();
                sink.init();
                JoinMode::External(sink)
            }
        };

        let op = JoinOp::new(kind, mode, left_key, right_key, residual, projector);
        let stream = self
            .circuit
            .stateful([left_stream, right_stream], Box::new(op));
        Ok((stream, merged))
    }

    /// Split an ON clause: the first equality conjunct whose sides fall
    /// cleanly on the two inputs becomes the hash key; everything else is
    /// residual, evaluated per candidate pair.
    fn split_on(
        &self,
        on: &Expr,
        left: &Scope,
        right: &Scope,
        merged: &Scope,
    ) -> Result<(Option<Expr>, Option<Expr>, Option<Expr>)> {
        let mut left_key = None;
        let mut right_key = None;
        let mut residual: Option<Expr> = None;

        for conjunct in on.conjuncts() {
            if left_key.is_none() {
                if let Expr::Binary {
                    left: l,
                    op: crate::sql::ast::BinaryOp::Eq,
                    right: r,
                } = conjunct
                {
                    let ls = self.expr_side(l, left, right)?;
                    let rs = self.expr_side(r, left, right)?;
                    match (ls, rs) {
                        (Side::Left, Side::Right) => {
                            left_key = Some(self.resolve_expr(l, left)?);
                            right_key = Some(self.resolve_expr(r, right)?);
                            continue;
                        }
                        (Side::Right, Side::Left) => {
                            left_key = Some(self.resolve_expr(r, left)?);
                            right_key = Some(self.resolve_expr(l, right)?);
                            continue;
                        }
                        _ => {}
                    }
                }
            }
            let resolved = self.resolve_expr(conjunct, merged)?;
            residual = Some(match residual {
                Some(acc) => Expr::and(acc, resolved),
                None => resolved,
            });
        }
        Ok((left_key, right_key, residual))
    }

    /// Which input the columns of an expression belong to.
    fn expr_side(&self, expr: &Expr, left: &Scope, right: &Scope) -> Result<Side> {
        let mut side: Option<Side> = None;
        let mut error: Option<EngineError> = None;
        visit_columns(expr, &mut |table, name| {
            let in_left = left.covers(table, name);
            let in_right = right.covers(table, name);
            let this = match (in_left, in_right) {
                (true, false) => Side::Left,
                (false, true) => Side::Right,
                (true, true) => {
                    error.get_or_insert(EngineError::compile(format!(
                        "ambiguous column '{name}' in join condition"
                    )));
                    return;
                }
                (false, false) => {
                    error.get_or_insert(EngineError::compile(format!(
                        "unknown column '{name}' in join condition"
                    )));
                    return;
                }
            };
            side = Some(match side {
                None => this,
                Some(s) if s == this => s,
                Some(_) => Side::Mixed,
            });
        });
        if let Some(e) = error {
            return Err(e);
        }
        Ok(side.unwrap_or(Side::Mixed))
    }

    // --- aggregation ---------------------------------------------------

    fn compile_aggregation(
        &mut self,
        stream: StreamId,
        scope: &Scope,
        select: &Select,
        items: Vec<(SmolStr, Expr)>,
    ) -> Result<(StreamId, Vec<(SmolStr, Expr)>)> {
        // Resolve the grouping expressions; they become __g{i} columns.
        let group_exprs: Vec<Expr> = select
            .group_by
            .iter()
            .map(|e| self.resolve_expr(e, scope))
            .collect::<Result<_>>()?;
        let group_by: Vec<(SmolStr, Expr)> = group_exprs
            .iter()
            .enumerate()
            .map(|(i, e)| (SmolStr::new(format!("__g{i}")), e.clone()))
            .collect();

        // Pull every aggregate out of the select items and HAVING into
        // __a{i} slots, deduplicating structurally equal calls.
        let mut specs: Vec<AggSpec> = Vec::new();
        let mut seen: Vec<Expr> = Vec::new();
        let rewritten_items: Vec<(SmolStr, Expr)> = items
            .iter()
            .map(|(n, e)| {
                let grouped = rewrite_group_refs(e, &group_exprs);
                Ok((
                    n.clone(),
                    self.rewrite_aggregates(&grouped, &mut specs, &mut seen)?,
                ))
            })
            .collect::<Result<_>>()?;
        let having = match &select.having {
            Some(h) => {
                let resolved = self.resolve_expr(h, scope)?;
                let grouped = rewrite_group_refs(&resolved, &group_exprs);
                Some(self.rewrite_aggregates(&grouped, &mut specs, &mut seen)?)
            }
            None => None,
        };

        let op = AggregateOp::new(group_by, specs, having);
        let stream = self.circuit.stateful([stream], Box::new(op));
        Ok((stream, rewritten_items))
    }

    /// Replace resolved `Aggregate` nodes with references to their output
    /// column, allocating accumulator slots as needed. The arguments are
    /// resolved against the pre-aggregation scope by the caller.
    fn rewrite_aggregates(
        &self,
        expr: &Expr,
        specs: &mut Vec<AggSpec>,
        seen: &mut Vec<Expr>,
    ) -> Result<Expr> {
        Ok(match expr {
            Expr::Aggregate(agg) => {
                let canonical = Expr::Aggregate(agg.clone());
                let slot = match seen.iter().position(|e| *e == canonical) {
                    Some(i) => i,
                    None => {
                        use crate::sql::ast::AggFunc;
                        let arg = agg.arg.as_deref().cloned();
                        let kind = match (agg.func, arg) {
                            (AggFunc::Count, None) => AggKind::CountStar,
                            (AggFunc::Count, Some(e)) => AggKind::Count {
                                expr: e,
                                distinct: agg.distinct,
                            },
                            (AggFunc::Sum, Some(e)) => AggKind::Sum {
                                expr: e,
                                distinct: agg.distinct,
                            },
                            (AggFunc::Avg, Some(e)) => AggKind::Avg {
                                expr: e,
                                distinct: agg.distinct,
                            },
                            (AggFunc::Min, Some(e)) => AggKind::Min { expr: e },
                            (AggFunc::Max, Some(e)) => AggKind::Max { expr: e },
                            _ => {
                                return Err(EngineError::compile(
                                    "aggregate function requires an argument",
                                ))
                            }
                        };
                        seen.push(canonical);
                        specs.push(AggSpec {
                            name: SmolStr::new(format!("__a{}", specs.len())),
                            kind,
                        });
                        specs.len() - 1
                    }
                };
                Expr::ColumnRef(SmolStr::new(format!("__a{slot}")))
            }
            other => map_children(other, &mut |child| {
                self.rewrite_aggregates(child, specs, seen)
            })?,
        })
    }

    // --- windows -------------------------------------------------------

    fn compile_windows(
        &mut self,
        stream: StreamId,
        select: &Select,
        items: Vec<(SmolStr, Expr)>,
    ) -> Result<(StreamId, Vec<(SmolStr, Expr)>)> {
        let mut specs: Vec<WindowSpec> = Vec::new();
        let mut partition: Option<Vec<Expr>> = None;
        let mut order: Option<Vec<(Expr, bool)>> = None;

        let mut rewritten: Vec<(SmolStr, Expr)> = Vec::new();
        for (name, expr) in &items {
            rewritten.push((
                name.clone(),
                self.rewrite_windows(expr, &mut specs, &mut partition, &mut order)?,
            ));
        }
        // QUALIFY may reference select aliases ("QUALIFY rnk <= 3").
        let qualify = match &select.qualify {
            Some(q) => {
                let rewritten_q = self.rewrite_windows(q, &mut specs, &mut partition, &mut order)?;
                Some(substitute_aliases(&rewritten_q, &rewritten))
            }
            None => None,
        };

        let mut stream = stream;
        if !specs.is_empty() {
            let op = WindowOp::new(
                partition.unwrap_or_default(),
                order.unwrap_or_default(),
                specs,
            );
            stream = self.circuit.stateful([stream], Box::new(op));
        }
        if let Some(pred) = qualify {
            let faults = FaultFlag::new("qualify");
            stream = self.circuit.stateless([stream], move |ins: &[&ZSet]| {
                filter_delta(ins[0], &pred, &faults)
            });
        }
        Ok((stream, rewritten))
    }

    fn rewrite_windows(
        &self,
        expr: &Expr,
        specs: &mut Vec<WindowSpec>,
        partition: &mut Option<Vec<Expr>>,
        order: &mut Option<Vec<(Expr, bool)>>,
    ) -> Result<Expr> {
        Ok(match expr {
            Expr::Window(w) => {
                match partition {
                    None => *partition = Some(w.partition_by.clone()),
                    Some(p) if *p == w.partition_by => {}
                    Some(_) => {
                        return Err(EngineError::compile(
                            "window functions must share one PARTITION BY",
                        ))
                    }
                }
                match order {
                    None => *order = Some(w.order_by.clone()),
                    Some(o) if *o == w.order_by => {}
                    Some(_) => {
                        return Err(EngineError::compile(
                            "window functions must share one ORDER BY",
                        ))
                    }
                }
                let name = SmolStr::new(format!("__w{}", specs.len()));
                specs.push(WindowSpec {
                    name: name.clone(),
                    func: w.func,
                    args: w.args.clone(),
                    frame: w.frame,
                });
                Expr::ColumnRef(name)
            }
            other => map_children(other, &mut |child| {
                self.rewrite_windows(child, specs, partition, order)
            })?,
        })
    }

    // --- projection & ordering -----------------------------------------

    fn expand_items(
        &self,
        items: &[SelectItem],
        scope: &Scope,
    ) -> Result<Vec<(SmolStr, Expr)>> {
        let mut out: Vec<(SmolStr, Expr)> = Vec::new();
        let mut push_unique = |out: &mut Vec<(SmolStr, Expr)>, name: SmolStr, expr: Expr| {
            // Wildcard collisions resolve left-wins; explicit items
            // override earlier wildcard columns.
            if !out.iter().any(|(n, _)| *n == name) {
                out.push((name, expr));
            }
        };
        for (idx, item) in items.iter().enumerate() {
            match item {
                SelectItem::Wildcard => {
                    for rel in &scope.rels {
                        for col in &rel.columns {
                            push_unique(
                                &mut out,
                                col.clone(),
                                Expr::ColumnRef(scope.physical(&rel.alias, col)),
                            );
                        }
                    }
                }
                SelectItem::QualifiedWildcard(t) => {
                    let rel = scope
                        .rels
                        .iter()
                        .find(|r| r.alias == *t)
                        .ok_or_else(|| EngineError::compile(format!("unknown relation '{t}'")))?;
                    for col in &rel.columns {
                        push_unique(
                            &mut out,
                            col.clone(),
                            Expr::ColumnRef(scope.physical(&rel.alias, col)),
                        );
                    }
                }
                SelectItem::Expr { expr, alias } => {
                    let resolved = self.resolve_expr(expr, scope)?;
                    let name = alias
                        .clone()
                        .unwrap_or_else(|| derived_name(expr, idx));
                    out.retain(|(n, _)| *n != name);
                    out.push((name, resolved));
                }
            }
        }
        Ok(out)
    }

    fn resolve_order_by(
        &self,
        order_by: &[OrderByExpr],
        schema: &Schema,
    ) -> Result<Vec<(Expr, bool)>> {
        let out_scope = Scope::single(SmolStr::new_static(""), schema.columns.clone());
        order_by
            .iter()
            .map(|o| {
                let expr = match &o.target {
                    OrderTarget::Ordinal(n) => {
                        let col = schema.columns.get(n.checked_sub(1).unwrap_or(usize::MAX)).ok_or_else(|| {
                            EngineError::compile(format!("ORDER BY ordinal {n} out of range"))
                        })?;
                        Expr::ColumnRef(col.clone())
                    }
                    OrderTarget::Expr(e) => self.resolve_expr(e, &out_scope)?,
                };
                Ok((expr, o.desc))
            })
            .collect()
    }

    // --- expression resolution -----------------------------------------

    /// Rewrite every column reference to the physical name it has in the
    /// rows flowing at this point. Subqueries stay untouched; they are
    /// compiled in their own scope.
    fn resolve_expr(&self, expr: &Expr, scope: &Scope) -> Result<Expr> {
        match expr {
            Expr::Column { table, name } => {
                scope.resolve(table.as_ref(), name).map(Expr::ColumnRef)
            }
            other => map_children(other, &mut |child| self.resolve_expr(child, scope)),
        }
    }

    /// WHERE conjuncts of the form `[NOT] x IN (subquery)` / `[NOT]
    /// EXISTS (subquery)` become semi-join stages.
    fn try_subquery_conjunct(
        &self,
        conjunct: &Expr,
        scope: &Scope,
    ) -> Result<Option<(SemiJoinKind, Query)>> {
        let (inner, flip) = match conjunct {
            Expr::Unary {
                op: UnaryOp::Not,
                expr,
            } => (expr.as_ref(), true),
            other => (other, false),
        };
        Ok(match inner {
            Expr::InSubquery {
                expr,
                query,
                negated,
            } => Some((
                SemiJoinKind::In {
                    expr: self.resolve_expr(expr, scope)?,
                    negated: *negated != flip,
                },
                (**query).clone(),
            )),
            Expr::Exists { query, negated } => Some((
                SemiJoinKind::Exists {
                    negated: *negated != flip,
                },
                (**query).clone(),
            )),
            _ => None,
        })
    }
}

/// Does any part of the tree reference a subquery?
fn contains_subquery(expr: &Expr) -> bool {
    let mut found = false;
    visit(expr, &mut |e| {
        if matches!(
            e,
            Expr::InSubquery { .. } | Expr::Exists { .. } | Expr::ScalarSubquery(_)
        ) {
            found = true;
        }
    });
    found
}

fn contains_aggregate(expr: &Expr) -> bool {
    let mut found = false;
    visit(expr, &mut |e| {
        if matches!(e, Expr::Aggregate(_)) {
            found = true;
        }
    });
    found
}

fn contains_window(expr: &Expr) -> bool {
    let mut found = false;
    visit(expr, &mut |e| {
        if matches!(e, Expr::Window(_)) {
            found = true;
        }
    });
    found
}

/// Replace bare column references that name a select item with that
/// item's expression.
fn substitute_aliases(expr: &Expr, items: &[(SmolStr, Expr)]) -> Expr {
    if let Expr::Column { table: None, name } = expr {
        if let Some((_, e)) = items.iter().find(|(n, _)| n == name) {
            return e.clone();
        }
    }
    map_children(expr, &mut |child| {
        Ok::<Expr, EngineError>(substitute_aliases(child, items))
    })
    .unwrap_or_else(|_| expr.clone())
}

/// Replace subexpressions structurally equal to a grouping expression
/// with its `__g{i}` output column.
fn rewrite_group_refs(expr: &Expr, groups: &[Expr]) -> Expr {
    if let Some(i) = groups.iter().position(|g| g == expr) {
        return Expr::ColumnRef(SmolStr::new(format!("__g{i}")));
    }
    map_children(expr, &mut |child| {
        Ok::<Expr, EngineError>(rewrite_group_refs(child, groups))
    })
    .unwrap_or_else(|_| expr.clone())
}

/// Pull scalar subqueries out into slots, rewriting to `ScalarRef`.
fn extract_scalars(expr: &Expr, queries: &mut Vec<Query>) -> Expr {
    if let Expr::ScalarSubquery(q) = expr {
        queries.push((**q).clone());
        return Expr::ScalarRef(queries.len() - 1);
    }
    map_children(expr, &mut |child| {
        Ok::<Expr, EngineError>(extract_scalars(child, queries))
    })
    .unwrap_or_else(|_| expr.clone())
}

fn is_identity_projection(items: &[SelectItem], scope: &Scope) -> bool {
    matches!(items, [SelectItem::Wildcard]) && scope.rels.len() == 1 && !scope.qualified
}

fn derived_name(expr: &Expr, idx: usize) -> SmolStr {
    match expr {
        Expr::Column { name, .. } => name.clone(),
        Expr::ColumnRef(name) => match name.rsplit_once('.') {
            Some((_, bare)) => SmolStr::new(bare),
            None => name.clone(),
        },
        Expr::Aggregate(agg) => SmolStr::new(format!("{:?}", agg.func).to_lowercase()),
        Expr::Function { name, .. } => SmolStr::new(name.to_lowercase()),
        Expr::Window(w) => SmolStr::new(format!("{:?}", w.func).to_lowercase()),
        _ => SmolStr::new(format!("col{}", idx + 1)),
    }
}

/// Visit every node of an expression tree.
fn visit(expr: &Expr, f: &mut impl FnMut(&Expr)) {
    f(expr);
    let mut recurse = |e: &Expr| visit(e, f);
    match expr {
        Expr::Unary { expr, .. } | Expr::Cast { expr, .. } => recurse(expr),
        Expr::Binary { left, right, .. } => {
            recurse(left);
            recurse(right);
        }
        Expr::IsNull { expr, .. } => recurse(expr),
        Expr::Between {
            expr, low, high, ..
        } => {
            recurse(expr);
            recurse(low);
            recurse(high);
        }
        Expr::InList { expr, list, .. } => {
            recurse(expr);
            list.iter().for_each(recurse);
        }
        Expr::InSubquery { expr, .. } => recurse(expr),
        Expr::Like { expr, pattern, .. } | Expr::Regexp { expr, pattern, .. } => {
            recurse(expr);
            recurse(pattern);
        }
        Expr::Case {
            operand,
            arms,
            otherwise,
        } => {
            if let Some(o) = operand {
                recurse(o);
            }
            for (w, t) in arms {
                recurse(w);
                recurse(t);
            }
            if let Some(e) = otherwise {
                recurse(e);
            }
        }
        Expr::Function { args, .. } => args.iter().for_each(recurse),
        Expr::Aggregate(agg) => {
            if let Some(a) = &agg.arg {
                recurse(a);
            }
        }
        Expr::Window(w) => {
            w.args.iter().for_each(&mut recurse);
            w.partition_by.iter().for_each(&mut recurse);
            for (e, _) in &w.order_by {
                recurse(e);
            }
        }
        Expr::Literal(_)
        | Expr::Column { .. }
        | Expr::ColumnRef(_)
        | Expr::AggRef(_)
        | Expr::ScalarRef(_)
        | Expr::Exists { .. }
        | Expr::ScalarSubquery(_) => {}
    }
}

/// Collect `(table, name)` of every column reference.
fn visit_columns(expr: &Expr, f: &mut impl FnMut(Option<&SmolStr>, &SmolStr)) {
    visit(expr, &mut |e| {
        if let Expr::Column { table, name } = e {
            f(table.as_ref(), name);
        }
    });
}

/// Rebuild a node with each direct child mapped through `f`; leaves pass
/// through unchanged.
fn map_children<E>(expr: &Expr, f: &mut impl FnMut(&Expr) -> std::result::Result<Expr, E>) -> std::result::Result<Expr, E> {
    Ok(match expr {
        Expr::Unary { op, expr } => Expr::Unary {
            op: *op,
            expr: Box::new(f(expr)?),
        },
        Expr::Binary { left, op, right } => Expr::Binary {
            left: Box::new(f(left)?),
            op: *op,
            right: Box::new(f(right)?),
        },
        Expr::IsNull { expr, negated } => Expr::IsNull {
            expr: Box::new(f(expr)?),
            negated: *negated,
        },
        Expr::Between {
            expr,
            low,
            high,
            negated,
        } => Expr::Between {
            expr: Box::new(f(expr)?),
            low: Box::new(f(low)?),
            high: Box::new(f(high)?),
            negated: *negated,
        },
        Expr::InList {
            expr,
            list,
            negated,
        } => Expr::InList {
            expr: Box::new(f(expr)?),
            list: list.iter().map(&mut *f).collect::<std::result::Result<_, E>>()?,
            negated: *negated,
        },
        Expr::InSubquery {
            expr,
            query,
            negated,
        } => Expr::InSubquery {
            expr: Box::new(f(expr)?),
            query: query.clone(),
            negated: *negated,
        },
        Expr::Like {
            expr,
            pattern,
            negated,
        } => Expr::Like {
            expr: Box::new(f(expr)?),
            pattern: Box::new(f(pattern)?),
            negated: *negated,
        },
        Expr::Regexp {
            expr,
            pattern,
            negated,
            case_insensitive,
        } => Expr::Regexp {
            expr: Box::new(f(expr)?),
            pattern: Box::new(f(pattern)?),
            negated: *negated,
            case_insensitive: *case_insensitive,
        },
        Expr::Case {
            operand,
            arms,
            otherwise,
        } => Expr::Case {
            operand: operand.as_ref().map(|o| f(o).map(Box::new)).transpose()?,
            arms: arms
                .iter()
                .map(|(w, t)| Ok((f(w)?, f(t)?)))
                .collect::<std::result::Result<_, E>>()?,
            otherwise: otherwise.as_ref().map(|o| f(o).map(Box::new)).transpose()?,
        },
        Expr::Cast { expr, ty } => Expr::Cast {
            expr: Box::new(f(expr)?),
            ty: *ty,
        },
        Expr::Function { name, args } => Expr::Function {
            name: name.clone(),
            args: args.iter().map(&mut *f).collect::<std::result::Result<_, E>>()?,
        },
        Expr::Aggregate(agg) => {
            let arg = match &agg.arg {
                Some(a) => Some(Box::new(f(a)?)),
                None => None,
            };
            Expr::Aggregate(crate::sql::ast::AggregateExpr {
                func: agg.func,
                arg,
                distinct: agg.distinct,
            })
        }
        Expr::Window(w) => {
            let mut w2 = (**w).clone();
            w2.args = w.args.iter().map(&mut *f).collect::<std::result::Result<_, E>>()?;
            w2.partition_by = w
                .partition_by
                .iter()
                .map(&mut *f)
                .collect::<std::result::Result<_, E>>()?;
            w2.order_by = w
                .order_by
                .iter()
                .map(|(e, d)| Ok((f(e)?, *d)))
                .collect::<std::result::Result<_, E>>()?;
            Expr::Window(Box::new(w2))
        }
        Expr::Literal(_)
        | Expr::Column { .. }
        | Expr::ColumnRef(_)
        | Expr::AggRef(_)
        | Expr::ScalarRef(_)
        | Expr::Exists { .. }
        | Expr::ScalarSubquery(_) => expr.clone(),
    })
}
