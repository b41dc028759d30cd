//! Plan model: the immutable DAG a run executes.
//!
//! A [`Plan`] arrives as opaque JSON (`nodes` + `edges`) and is validated
//! exactly once at run creation, producing a [`CompiledPlan`]: node ids
//! de-duplicated, edge endpoints resolved against declared nodes, pins
//! parsed, and the graph proven acyclic. After that the engine treats node
//! `params` and pin names as pass-through values; only the topology matters
//! to scheduling.
//!
//! Edge endpoints use the `"<node>[.<pin>]"` form. The pin component is
//! split at the first `.` and is otherwise opaque to the scheduler.

use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::fmt;
use thiserror::Error;

/// A unit of work within a plan. `params` are opaque to the engine and are
/// handed verbatim to the driver executing the node.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeSpec {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_ref: Option<String>,
    #[serde(default)]
    pub params: serde_json::Map<String, Value>,
}

/// Raw edge as declared in the plan JSON.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EdgeSpec {
    pub from: String,
    pub to: String,
}

/// A workflow plan: ordered node sequence plus edge set.
///
/// Node declaration order is significant: it is the stable tie-break used
/// when several nodes become ready in the same scheduling round.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Plan {
    pub nodes: Vec<NodeSpec>,
    #[serde(default)]
    pub edges: Vec<EdgeSpec>,
}

/// One side of an edge, parsed from `"<node>[.<pin>]"`.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub node: String,
    pub pin: Option<String>,
}

impl Endpoint {
    /// Split at the first `.`; an empty pin component is treated as absent.
    pub fn parse(raw: &str) -> Result<Self, PlanError> {
        let (node, pin) = match raw.split_once('.') {
            Some((node, pin)) => (node, if pin.is_empty() { None } else { Some(pin) }),
            None => (raw, None),
        };
        if node.is_empty() {
            return Err(PlanError::MalformedEndpoint {
                endpoint: raw.to_string(),
            });
        }
        Ok(Self {
            node: node.to_string(),
            pin: pin.map(str::to_string),
        })
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.pin {
            Some(pin) => write!(f, "{}.{pin}", self.node),
            None => f.write_str(&self.node),
        }
    }
}

/// A validated edge with both endpoints resolved.
#[derive(Clone, Debug)]
pub struct Edge {
    pub src: Endpoint,
    pub dst: Endpoint,
}

/// Validation failures surfaced at run creation.
#[derive(Debug, Error)]
pub enum PlanError {
    #[error("plan declares no nodes")]
    Empty,

    #[error("duplicate node id: {id}")]
    DuplicateNode { id: String },

    #[error("malformed edge endpoint: {endpoint:?}")]
    MalformedEndpoint { endpoint: String },

    #[error("edge references undeclared node: {endpoint}")]
    UnknownEndpoint { endpoint: String },

    // The terse message is part of the control-plane contract.
    #[error("cycle")]
    Cycle,
}

/// A plan that passed validation, with the adjacency needed by the
/// scheduler precomputed.
#[derive(Clone, Debug)]
pub struct CompiledPlan {
    nodes: Vec<NodeSpec>,
    index: FxHashMap<String, usize>,
    incoming: Vec<Vec<Edge>>,
    outgoing: Vec<Vec<usize>>,
    topo: Vec<usize>,
}

impl CompiledPlan {
    /// Validate `plan`: unique node ids, every edge endpoint declared,
    /// graph acyclic. Cycle detection is Kahn's algorithm with a min-heap
    /// on declaration index, so the returned topological order is
    /// deterministic for a given plan.
    pub fn compile(plan: &Plan) -> Result<Self, PlanError> {
        if plan.nodes.is_empty() {
            return Err(PlanError::Empty);
        }

        let mut index = FxHashMap::default();
        for (i, node) in plan.nodes.iter().enumerate() {
            if index.insert(node.id.clone(), i).is_some() {
                return Err(PlanError::DuplicateNode {
                    id: node.id.clone(),
                });
            }
        }

        let mut incoming: Vec<Vec<Edge>> = vec![Vec::new(); plan.nodes.len()];
        let mut outgoing: Vec<Vec<usize>> = vec![Vec::new(); plan.nodes.len()];
        for spec in &plan.edges {
            let src = Endpoint::parse(&spec.from)?;
            let dst = Endpoint::parse(&spec.to)?;
            let src_idx = *index
                .get(&src.node)
                .ok_or_else(|| PlanError::UnknownEndpoint {
                    endpoint: src.to_string(),
                })?;
            let dst_idx = *index
                .get(&dst.node)
                .ok_or_else(|| PlanError::UnknownEndpoint {
                    endpoint: dst.to_string(),
                })?;
            outgoing[src_idx].push(dst_idx);
            incoming[dst_idx].push(Edge { src, dst });
        }

        let topo = Self::topological_order(plan.nodes.len(), &outgoing)?;

        Ok(Self {
            nodes: plan.nodes.clone(),
            index,
            incoming,
            outgoing,
            topo,
        })
    }

    fn topological_order(count: usize, outgoing: &[Vec<usize>]) -> Result<Vec<usize>, PlanError> {
        let mut in_degree = vec![0usize; count];
        for targets in outgoing {
            for &t in targets {
                in_degree[t] += 1;
            }
        }

        // Min-heap on declaration index keeps ties deterministic.
        let mut ready: BinaryHeap<Reverse<usize>> = in_degree
            .iter()
            .enumerate()
            .filter(|(_, d)| **d == 0)
            .map(|(i, _)| Reverse(i))
            .collect();

        let mut order = Vec::with_capacity(count);
        while let Some(Reverse(node)) = ready.pop() {
            order.push(node);
            for &next in &outgoing[node] {
                in_degree[next] -= 1;
                if in_degree[next] == 0 {
                    ready.push(Reverse(next));
                }
            }
        }

        if order.len() != count {
            return Err(PlanError::Cycle);
        }
        Ok(order)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Nodes in declaration order.
    pub fn nodes(&self) -> impl Iterator<Item = &NodeSpec> {
        self.nodes.iter()
    }

    #[must_use]
    pub fn node(&self, id: &str) -> Option<&NodeSpec> {
        self.index.get(id).map(|&i| &self.nodes[i])
    }

    /// Incoming edges of `id`, in plan declaration order.
    #[must_use]
    pub fn incoming(&self, id: &str) -> &[Edge] {
        self.index
            .get(id)
            .map(|&i| self.incoming[i].as_slice())
            .unwrap_or(&[])
    }

    /// Node ids in deterministic topological order.
    pub fn topo_order(&self) -> impl Iterator<Item = &str> {
        self.topo.iter().map(|&i| self.nodes[i].id.as_str())
    }

    /// All nodes strictly downstream of `id` (transitive closure over
    /// outgoing edges). Used to cascade cancellation when an ancestor
    /// fails: none of these can ever satisfy their readiness condition.
    #[must_use]
    pub fn descendants(&self, id: &str) -> FxHashSet<String> {
        let mut out = FxHashSet::default();
        let Some(&start) = self.index.get(id) else {
            return out;
        };
        let mut stack = vec![start];
        let mut seen = vec![false; self.nodes.len()];
        seen[start] = true;
        while let Some(node) = stack.pop() {
            for &next in &self.outgoing[node] {
                if !seen[next] {
                    seen[next] = true;
                    out.insert(self.nodes[next].id.clone());
                    stack.push(next);
                }
            }
        }
        out
    }
}
