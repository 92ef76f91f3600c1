//! The engine: owns every source and view, the registry, and the
//! coordinator. All propagation runs on the caller's thread; views are
//! stepped in dependency-topological order so chained views observe
//! upstream deltas within the same round.

use super::coordinator::Coordinator;
use super::external::{RegistryGraph, RegistryNode};
use super::source::{KeySpec, Source, SourceOptions, SourceSnapshot};
use super::types::{FastMap, Row, RowKey, Schema, ZSet};
use super::view::{View, ViewOptions, ViewSnapshot};
use crate::debug_log;
use crate::error::{EngineError, Result};
use crate::sql::ast::{CreateTable, Query, Statement};
use smol_str::SmolStr;

pub type SubscriptionId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamKind {
    Source,
    View,
}

struct RegistryEntry {
    identity: String,
    name: SmolStr,
    kind: StreamKind,
    upstreams: Vec<SmolStr>,
    ready: bool,
}

/// Process-wide (per engine) record of live streams and their wiring;
/// the visualization consumer reads this, never writes.
#[derive(Default)]
pub struct Registry {
    entries: Vec<RegistryEntry>,
}

impl Registry {
    fn register(
        &mut self,
        identity: &str,
        name: &SmolStr,
        kind: StreamKind,
        upstreams: Vec<SmolStr>,
        ready: bool,
    ) {
        self.entries.retain(|e| !(e.name == *name && e.kind == kind));
        self.entries.push(RegistryEntry {
            identity: identity.to_string(),
            name: name.clone(),
            kind,
            upstreams,
            ready,
        });
    }

    fn unregister(&mut self, name: &SmolStr, kind: StreamKind) {
        self.entries.retain(|e| !(e.name == *name && e.kind == kind));
    }

    fn update(&mut self, name: &SmolStr, kind: StreamKind, identity: &str, upstreams: Vec<SmolStr>, ready: bool) {
        if let Some(e) = self
            .entries
            .iter_mut()
            .find(|e| e.name == *name && e.kind == kind)
        {
            e.identity = identity.to_string();
            e.upstreams = upstreams;
            e.ready = ready;
        }
    }

    pub fn graph(&self) -> RegistryGraph {
        let nodes = self
            .entries
            .iter()
            .map(|e| RegistryNode {
                identity: e.identity.clone(),
                name: e.name.to_string(),
                kind: match e.kind {
                    StreamKind::Source => "source".to_string(),
                    StreamKind::View => "view".to_string(),
                },
                ready: e.ready,
            })
            .collect();
        let edges = self
            .entries
            .iter()
            .flat_map(|e| {
                e.upstreams
                    .iter()
                    .map(|u| (u.to_string(), e.name.to_string()))
            })
            .collect();
        RegistryGraph { nodes, edges }
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum BatchFlush {
    /// Enqueue into batching views, never flush.
    Defer,
    /// Flush batches whose deadline has passed.
    Due,
    /// Flush everything pending.
    All,
}

type DeltaCallback = Box<dyn FnMut(&ZSet)>;

#[derive(Default)]
pub struct Engine {
    sources: FastMap<SmolStr, Source>,
    views: Vec<View>,
    topo: Vec<usize>,
    registry: Registry,
    coordinator: Coordinator,
    source_subs: FastMap<SmolStr, Vec<(SubscriptionId, DeltaCallback)>>,
    view_subs: FastMap<SmolStr, Vec<(SubscriptionId, DeltaCallback)>>,
    next_sub: SubscriptionId,
    now_ms: u64,
}

impl Engine {
    pub fn new() -> Self {
        Engine::default()
    }

    // --- sources -------------------------------------------------------

    pub fn create_source(
        &mut self,
        name: impl Into<SmolStr>,
        key: KeySpec,
        options: SourceOptions,
    ) -> Result<()> {
        let name = name.into();
        let source = Source::new(name.clone(), key, options)?;
        let recreated = self.sources.insert(name.clone(), source).is_some();
        let identity = self.sources[&name].identity().to_string();
        self.registry
            .register(&identity, &name, StreamKind::Source, Vec::new(), false);
        if recreated {
            debug_log!("source {} recreated, invalidating dependents", name);
            self.invalidate_dependents(&name);
        }
        Ok(())
    }

    /// `CREATE TABLE`: declares the stream and its row shape, so views
    /// can compile before the first push.
    pub fn define_table(
        &mut self,
        table: &CreateTable,
        key: KeySpec,
        options: SourceOptions,
    ) -> Result<()> {
        self.create_source(table.name.clone(), key, options)?;
        if let Some(source) = self.sources.get_mut(&table.name) {
            source.set_schema(Schema::new(table.columns.iter().map(|c| c.name.clone())));
        }
        self.mark_registry_ready(&table.name, StreamKind::Source);
        self.try_ready();
        Ok(())
    }

    /// Execute a normalized DDL statement. Tables get a default key of
    /// their `id` column (or the first declared column).
    pub fn execute(&mut self, stmt: &Statement) -> Result<()> {
        match stmt {
            Statement::CreateTable(t) => {
                let key_col = t
                    .columns
                    .iter()
                    .find(|c| c.name.as_str() == "id")
                    .or_else(|| t.columns.first())
                    .map(|c| c.name.clone())
                    .ok_or_else(|| EngineError::config("table declares no columns"))?;
                self.define_table(t, KeySpec::Column(key_col), SourceOptions::default())
            }
            Statement::CreateView(v) => {
                self.create_view(v.name.clone(), v.query.clone(), ViewOptions::default())
            }
        }
    }

    pub fn push(&mut self, source: &str, rows: Vec<Row>) -> Result<()> {
        let name = SmolStr::new(source);
        let s = self
            .sources
            .get_mut(&name)
            .ok_or_else(|| EngineError::UnknownStream(source.to_string()))?;
        let had_schema = s.schema().is_some();
        let deltas = s.push(rows);
        if !had_schema && s.schema().is_some() {
            self.mark_registry_ready(&name, StreamKind::Source);
        }
        for delta in deltas {
            self.notify_source_subs(&name, &delta);
            let mut round = FastMap::default();
            round.insert(name.clone(), delta);
            self.propagate(round, BatchFlush::Defer);
        }
        // Views waiting on this source's schema can compile and
        // back-load now, after the delta round.
        self.try_ready();
        Ok(())
    }

    pub fn push_json(&mut self, source: &str, rows: Vec<serde_json::Value>) -> Result<()> {
        self.push(source, rows.into_iter().map(Row::from).collect())
    }

    pub fn remove(&mut self, source: &str, keys: &[RowKey]) -> Result<()> {
        let name = SmolStr::new(source);
        let s = self
            .sources
            .get_mut(&name)
            .ok_or_else(|| EngineError::UnknownStream(source.to_string()))?;
        let delta = s.remove(keys);
        if !delta.is_empty() {
            self.notify_source_subs(&name, &delta);
            let mut round = FastMap::default();
            round.insert(name, delta);
            self.propagate(round, BatchFlush::Defer);
        }
        Ok(())
    }

    pub fn clear(&mut self, source: &str) -> Result<()> {
        let name = SmolStr::new(source);
        let s = self
            .sources
            .get_mut(&name)
            .ok_or_else(|| EngineError::UnknownStream(source.to_string()))?;
        let delta = s.clear();
        if !delta.is_empty() {
            self.notify_source_subs(&name, &delta);
            let mut round = FastMap::default();
            round.insert(name, delta);
            self.propagate(round, BatchFlush::Defer);
        }
        Ok(())
    }

    pub fn source_snapshot(&self, name: &str) -> Option<SourceSnapshot> {
        self.sources.get(name).map(|s| s.snapshot())
    }

    pub fn dispose_source(&mut self, name: &str) -> Result<()> {
        let name = SmolStr::new(name);
        self.sources
            .remove(&name)
            .ok_or_else(|| EngineError::UnknownStream(name.to_string()))?;
        self.registry.unregister(&name, StreamKind::Source);
        self.source_subs.remove(&name);
        self.invalidate_dependents(&name);
        Ok(())
    }

    // --- views ---------------------------------------------------------

    pub fn create_view(
        &mut self,
        name: impl Into<SmolStr>,
        sql: Query,
        options: ViewOptions,
    ) -> Result<()> {
        let name = name.into();
        let view = View::new(name.clone(), sql, options)?;
        if let Some(pos) = self.views.iter().position(|v| *v.name() == name) {
            self.views[pos].dispose();
            self.views.remove(pos);
            self.invalidate_dependents(&name);
        }
        self.registry
            .register(view.identity(), &name, StreamKind::View, Vec::new(), false);
        self.views.push(view);
        self.rebuild_topo();
        self.try_ready();
        Ok(())
    }

    pub fn view_ready(&self, name: &str) -> bool {
        self.view(name).map(|v| v.ready()).unwrap_or(false)
    }

    pub fn view_error(&self, name: &str) -> Option<String> {
        self.view(name).and_then(|v| v.last_error().map(String::from))
    }

    pub fn results(&self, name: &str) -> Result<Vec<Row>> {
        self.view(name)
            .map(|v| v.results())
            .ok_or_else(|| EngineError::UnknownStream(name.to_string()))
    }

    pub fn count(&self, name: &str) -> Result<usize> {
        self.view(name)
            .map(|v| v.count())
            .ok_or_else(|| EngineError::UnknownStream(name.to_string()))
    }

    pub fn view_snapshot(&self, name: &str) -> Option<ViewSnapshot> {
        self.view(name).map(|v| v.snapshot())
    }

    pub fn dispose_view(&mut self, name: &str) -> Result<()> {
        let name = SmolStr::new(name);
        let pos = self
            .views
            .iter()
            .position(|v| *v.name() == name)
            .ok_or_else(|| EngineError::UnknownStream(name.to_string()))?;
        self.views[pos].dispose();
        self.views.remove(pos);
        self.registry.unregister(&name, StreamKind::View);
        self.view_subs.remove(&name);
        self.rebuild_topo();
        self.invalidate_dependents(&name);
        Ok(())
    }

    fn view(&self, name: &str) -> Option<&View> {
        self.views.iter().find(|v| v.name().as_str() == name)
    }

    // --- subscriptions -------------------------------------------------

    pub fn subscribe_source(
        &mut self,
        name: &str,
        callback: impl FnMut(&ZSet) + 'static,
    ) -> Result<SubscriptionId> {
        if !self.sources.contains_key(name) {
            return Err(EngineError::UnknownStream(name.to_string()));
        }
        let id = self.next_sub;
        self.next_sub += 1;
        self.source_subs
            .entry(SmolStr::new(name))
            .or_default()
            .push((id, Box::new(callback)));
        Ok(id)
    }

    pub fn subscribe_view(
        &mut self,
        name: &str,
        callback: impl FnMut(&ZSet) + 'static,
    ) -> Result<SubscriptionId> {
        if self.view(name).is_none() {
            return Err(EngineError::UnknownStream(name.to_string()));
        }
        let id = self.next_sub;
        self.next_sub += 1;
        self.view_subs
            .entry(SmolStr::new(name))
            .or_default()
            .push((id, Box::new(callback)));
        Ok(id)
    }

    pub fn unsubscribe(&mut self, id: SubscriptionId) {
        for subs in self.source_subs.values_mut() {
            subs.retain(|(sub, _)| *sub != id);
        }
        for subs in self.view_subs.values_mut() {
            subs.retain(|(sub, _)| *sub != id);
        }
    }

    fn notify_source_subs(&mut self, name: &SmolStr, delta: &ZSet) {
        if let Some(subs) = self.source_subs.get_mut(name) {
            for (_, cb) in subs {
                cb(delta);
            }
        }
    }

    fn notify_view_subs(&mut self, name: &SmolStr, delta: &ZSet) {
        if let Some(subs) = self.view_subs.get_mut(name) {
            for (_, cb) in subs {
                cb(delta);
            }
        }
    }

    // --- coordinator ---------------------------------------------------

    pub fn coordinator(&mut self) -> &mut Coordinator {
        &mut self.coordinator
    }

    pub fn version(&self) -> u64 {
        self.coordinator.version()
    }

    /// Advance logical time: flush due batches, then let the coordinator
    /// broadcast if its throttle allows.
    pub fn pump(&mut self, now_ms: u64) {
        self.now_ms = now_ms;
        self.propagate(FastMap::default(), BatchFlush::Due);
        self.coordinator.pump(now_ms);
    }

    /// Drain every pending batch and broadcast immediately.
    pub fn flush(&mut self) {
        self.propagate(FastMap::default(), BatchFlush::All);
        if self.coordinator.is_dirty() {
            self.coordinator.broadcast(self.now_ms);
        }
    }

    pub fn registry_graph(&self) -> RegistryGraph {
        self.registry.graph()
    }

    // --- propagation ---------------------------------------------------

    fn known_streams(&self) -> super::types::FastSet<SmolStr> {
        let mut out = super::types::FastSet::default();
        for name in self.sources.keys() {
            out.insert(name.clone());
        }
        for view in &self.views {
            out.insert(view.name().clone());
        }
        out
    }

    fn schemas(&self) -> FastMap<SmolStr, Schema> {
        let mut out = FastMap::default();
        for (name, source) in &self.sources {
            if let Some(s) = source.schema() {
                out.insert(name.clone(), s.clone());
            }
        }
        for view in &self.views {
            if view.ready() {
                if let Some(s) = view.schema() {
                    out.insert(view.name().clone(), s.clone());
                }
            }
        }
        out
    }

    /// Compile every not-ready view whose upstream schemas are now
    /// available, back-loading it from integrated upstream state. Loops
    /// until a fixpoint so chains become ready in one call.
    fn try_ready(&mut self) {
        loop {
            let schemas = self.schemas();
            let known = self.known_streams();
            let mut progressed = false;
            let topo = self.topo.clone();
            for idx in topo {
                if self.views[idx].ready() {
                    continue;
                }
                if self.views[idx].try_compile(&schemas, &known).is_err() {
                    continue;
                }
                let inputs = self.backload_inputs(idx);
                let view = &mut self.views[idx];
                let out = view.step(&inputs);
                let name = view.name().clone();
                let identity = view.identity().to_string();
                let upstreams = view.upstreams().to_vec();
                debug_log!("view {} ready, back-loaded {} rows", name, view.count());
                self.registry
                    .update(&name, StreamKind::View, &identity, upstreams, true);
                if !out.is_empty() {
                    self.notify_view_subs(&name, &out);
                    self.coordinator.notify_change();
                }
                progressed = true;
                // The new upstream wiring may reorder propagation, and
                // the fresh schema can unblock other views.
                self.rebuild_topo();
                break;
            }
            if !progressed {
                break;
            }
        }
    }

    fn backload_inputs(&self, idx: usize) -> FastMap<SmolStr, ZSet> {
        let mut inputs = FastMap::default();
        for up in self.views[idx].upstreams() {
            let integrated = if let Some(source) = self.sources.get(up) {
                source.integrated()
            } else if let Some(view) = self.views.iter().find(|v| v.name() == up) {
                view.integrated()
            } else {
                ZSet::new()
            };
            if !integrated.is_empty() {
                inputs.insert(up.clone(), integrated);
            }
        }
        inputs
    }

    /// One propagation round: feed the seeded deltas (and any flushing
    /// batches) through the views in topological order, chaining view
    /// outputs into the same round.
    fn propagate(&mut self, mut round: FastMap<SmolStr, ZSet>, flush: BatchFlush) {
        let topo = self.topo.clone();
        let mut changed = false;
        for idx in topo {
            let now_ms = self.now_ms;
            let view = &mut self.views[idx];
            if !view.ready() {
                continue;
            }
            let mut inputs: FastMap<SmolStr, ZSet> = FastMap::default();
            for up in view.upstreams() {
                if let Some(d) = round.get(up) {
                    inputs.insert(up.clone(), d.clone());
                }
            }
            let batched = view.batch_interval_ms();
            let flushing = match flush {
                BatchFlush::Defer => false,
                BatchFlush::Due => view.batch_due(now_ms),
                BatchFlush::All => view.has_batch(),
            };
            if let Some(interval) = batched {
                if !flushing {
                    for (name, d) in &inputs {
                        view.enqueue(name, d, now_ms, interval);
                    }
                    continue;
                }
                if let Some(pending) = view.take_batch() {
                    // The queued deltas precede this round's.
                    for (name, d) in pending {
                        let slot = inputs.entry(name).or_default();
                        *slot = d.concat(slot);
                    }
                }
            }
            if inputs.is_empty() {
                continue;
            }
            let out = view.step(&inputs);
            if out.is_empty() {
                continue;
            }
            let name = view.name().clone();
            changed = true;
            self.notify_view_subs(&name, &out);
            match round.get_mut(&name) {
                Some(existing) => *existing = existing.concat(&out),
                None => {
                    round.insert(name, out);
                }
            }
        }
        if changed || !round.is_empty() {
            self.coordinator.notify_change();
        }
    }

    /// Views sorted by dependency depth; upstream views come first.
    fn rebuild_topo(&mut self) {
        fn depth_of(
            views: &[View],
            idx: usize,
            memo: &mut FastMap<usize, usize>,
            guard: usize,
        ) -> usize {
            if guard > views.len() {
                return 0;
            }
            if let Some(d) = memo.get(&idx) {
                return *d;
            }
            let mut depth = 0;
            for up in views[idx].upstreams() {
                if let Some(pos) = views.iter().position(|v| v.name() == up) {
                    depth = depth.max(1 + depth_of(views, pos, memo, guard + 1));
                }
            }
            memo.insert(idx, depth);
            depth
        }

        let mut memo = FastMap::default();
        let mut order: Vec<usize> = (0..self.views.len()).collect();
        order.sort_by_key(|idx| depth_of(&self.views, *idx, &mut memo, 0));
        self.topo = order;
    }

    /// Upstream recreated or removed: every transitively dependent view
    /// tears down, changes identity, and recompiles when possible.
    fn invalidate_dependents(&mut self, changed: &SmolStr) {
        let mut dirty: Vec<SmolStr> = vec![changed.clone()];
        let mut seen: Vec<usize> = Vec::new();
        while let Some(name) = dirty.pop() {
            for idx in 0..self.views.len() {
                if seen.contains(&idx) {
                    continue;
                }
                if self.views[idx].upstreams().iter().any(|u| *u == name) {
                    seen.push(idx);
                    dirty.push(self.views[idx].name().clone());
                }
            }
        }
        for idx in seen {
            self.views[idx].invalidate();
            let name = self.views[idx].name().clone();
            let identity = self.views[idx].identity().to_string();
            self.registry
                .update(&name, StreamKind::View, &identity, Vec::new(), false);
        }
        self.rebuild_topo();
        self.try_ready();
    }

    fn mark_registry_ready(&mut self, name: &SmolStr, kind: StreamKind) {
        if let Some(e) = self
            .registry
            .entries
            .iter_mut()
            .find(|e| e.name == *name && e.kind == kind)
        {
            e.ready = true;
        }
    }
}
