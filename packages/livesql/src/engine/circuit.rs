//! The compiled dataflow: a DAG of operators over delta streams.
//!
//! Nodes are appended bottom-up by the compiler, so node order is a
//! topological order and a step is a single in-order sweep. Every
//! operator fires exactly once per step; a step always runs to
//! completion.

use super::types::{FastMap, ZSet};
use crate::debug_log;
use smallvec::SmallVec;
use smol_str::SmolStr;

pub type StreamId = usize;

/// An operator that owns internal state across steps.
pub trait StatefulOperator {
    fn eval(&mut self, inputs: &[&ZSet]) -> ZSet;

    /// Drop all owned state (view disposal / rebuild).
    fn reset(&mut self);

    /// Operator-specific statistics for snapshots; None for most.
    fn stats(&self) -> Option<serde_json::Value> {
        None
    }
}

enum NodeKind {
    Input,
    Stateless(Box<dyn FnMut(&[&ZSet]) -> ZSet>),
    Stateful(Box<dyn StatefulOperator>),
}

struct Node {
    inputs: SmallVec<[StreamId; 2]>,
    kind: NodeKind,
}

#[derive(Default)]
pub struct Circuit {
    nodes: Vec<Node>,
    inputs: FastMap<SmolStr, StreamId>,
    output: Option<StreamId>,
    taps: Vec<(StreamId, Box<dyn FnMut(&ZSet)>)>,
}

impl Circuit {
    pub fn new() -> Self {
        Circuit::default()
    }

    /// Declare (or look up) a named input stream.
    pub fn input(&mut self, name: impl Into<SmolStr>) -> StreamId {
        let name = name.into();
        if let Some(id) = self.inputs.get(&name) {
            return *id;
        }
        let id = self.push_node(SmallVec::new(), NodeKind::Input);
        self.inputs.insert(name, id);
        id
    }

    pub fn input_names(&self) -> impl Iterator<Item = &SmolStr> {
        self.inputs.keys()
    }

    /// A pure function of its input deltas.
    pub fn stateless(
        &mut self,
        inputs: impl IntoIterator<Item = StreamId>,
        f: impl FnMut(&[&ZSet]) -> ZSet + 'static,
    ) -> StreamId {
        let inputs: SmallVec<[StreamId; 2]> = inputs.into_iter().collect();
        self.push_node(inputs, NodeKind::Stateless(Box::new(f)))
    }

    pub fn stateful(
        &mut self,
        inputs: impl IntoIterator<Item = StreamId>,
        op: Box<dyn StatefulOperator>,
    ) -> StreamId {
        let inputs: SmallVec<[StreamId; 2]> = inputs.into_iter().collect();
        self.push_node(inputs, NodeKind::Stateful(op))
    }

    fn push_node(&mut self, inputs: SmallVec<[StreamId; 2]>, kind: NodeKind) -> StreamId {
        let id = self.nodes.len();
        debug_assert!(inputs.iter().all(|i| *i < id), "circuit must stay acyclic");
        self.nodes.push(Node { inputs, kind });
        id
    }

    pub fn set_output(&mut self, id: StreamId) {
        self.output = Some(id);
    }

    pub fn output(&self) -> Option<StreamId> {
        self.output
    }

    /// Observe a stream's delta on every step.
    pub fn subscribe(&mut self, id: StreamId, callback: impl FnMut(&ZSet) + 'static) {
        self.taps.push((id, Box::new(callback)));
    }

    /// Propagate one set of input deltas through the whole DAG and return
    /// the output stream's delta. Missing inputs default to empty.
    pub fn step(&mut self, deltas: &FastMap<SmolStr, ZSet>) -> ZSet {
        let empty = ZSet::new();
        let mut out: Vec<ZSet> = Vec::with_capacity(self.nodes.len());

        for id in 0..self.nodes.len() {
            let delta = if matches!(self.nodes[id].kind, NodeKind::Input) {
                let name = self
                    .inputs
                    .iter()
                    .find(|(_, v)| **v == id)
                    .map(|(k, _)| k.clone());
                name.and_then(|n| deltas.get(&n).cloned()).unwrap_or_default()
            } else {
                let wires = self.nodes[id].inputs.clone();
                let ins: SmallVec<[&ZSet; 2]> = wires
                    .iter()
                    .map(|i| out.get(*i).unwrap_or(&empty))
                    .collect();
                match &mut self.nodes[id].kind {
                    NodeKind::Stateless(f) => f(&ins),
                    NodeKind::Stateful(op) => op.eval(&ins),
                    NodeKind::Input => ZSet::new(),
                }
            };
            out.push(delta);
        }

        for (id, cb) in &mut self.taps {
            if let Some(delta) = out.get(*id) {
                if !delta.is_empty() {
                    cb(delta);
                }
            }
        }

        let result = match self.output {
            Some(id) => out.into_iter().nth(id).unwrap_or_default(),
            None => ZSet::new(),
        };
        debug_log!(
            "circuit step: {} nodes, output {} entries",
            self.nodes.len(),
            result.len()
        );
        result
    }

    /// Clear all operator state.
    pub fn reset(&mut self) {
        for node in &mut self.nodes {
            if let NodeKind::Stateful(op) = &mut node.kind {
                op.reset();
            }
        }
    }

    pub fn operator_stats(&self) -> Vec<serde_json::Value> {
        self.nodes
            .iter()
            .filter_map(|n| match &n.kind {
                NodeKind::Stateful(op) => op.stats(),
                _ => None,
            })
            .collect()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }
}
