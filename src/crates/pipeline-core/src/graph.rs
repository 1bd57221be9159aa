//! Graph and edge model
//!
//! A [`Graph`] is an immutable set of [`UnitRef`]s connected by typed
//! [`Edge`]s, with one start unit. It is validated once, when it is built, and
//! never changes afterwards; the scheduler shares it through an `Arc`.
//!
//! # Edge kinds
//!
//! ```text
//! sequential   a ──▶ b                    one source, one target
//! parallel     a ──▶ {b, c, d}            one source, every target runs
//! join         {b, c, d} ──▶ e            several sources, wait for all or first
//! conditional  r ──▶ p1? x | p2? y | z    first matching predicate, else default
//! ```
//!
//! # Validation
//!
//! [`GraphBuilder::build`] fails with [`PipelineError::Validation`] before
//! anything runs when:
//!
//! - a unit id is declared twice, or the start unit is missing
//! - an edge names an undeclared unit, or repeats an id
//! - an edge has the wrong shape for its kind
//! - a conditional edge has no default target
//! - a join lists its own target among its sources (self-join)
//! - the start unit has an edge to itself, or any cycle exists
//! - a unit, or a join source, cannot be reached from the start unit
//!
//! Recursion is only possible through sub-pipeline units, which run a
//! separate graph with a child context.
//!
//! ```rust
//! use pipeline_core::graph::{Edge, GraphBuilder};
//! use pipeline_core::unit::UnitRef;
//! use pipeline_core::units::Passthrough;
//!
//! let mut builder = GraphBuilder::new("fan-out");
//! builder
//!     .add_unit(UnitRef::new("split", Passthrough))
//!     .add_unit(UnitRef::new("left", Passthrough))
//!     .add_unit(UnitRef::new("right", Passthrough))
//!     .add_unit(UnitRef::new("merge", Passthrough))
//!     .add_edge(Edge::parallel("split", ["left", "right"]))
//!     .add_edge(Edge::join(["left", "right"], "merge"))
//!     .set_start("split");
//!
//! let graph = builder.build().unwrap();
//! assert_eq!(graph.sinks(), vec!["merge"]);
//! assert_eq!(graph.topological_order(), vec!["split", "left", "right", "merge"]);
//! ```

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::content::ContentItem;
use crate::error::{PipelineError, Result};
use crate::unit::UnitRef;

/// Identifier of a unit, unique within one graph
pub type UnitId = String;

/// How a join edge decides it may proceed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WaitStrategy {
    /// Wait until every source reached a terminal state
    #[default]
    All,
    /// Proceed with the first source that completes, cancel the rest
    First,
}

impl fmt::Display for WaitStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WaitStrategy::All => f.write_str("all"),
            WaitStrategy::First => f.write_str("first"),
        }
    }
}

/// Labelled test over a content item, used by conditional edges
#[derive(Clone)]
pub struct Predicate {
    label: String,
    test: Arc<dyn Fn(&ContentItem) -> bool + Send + Sync>,
}

impl Predicate {
    pub fn new<F>(label: impl Into<String>, test: F) -> Self
    where
        F: Fn(&ContentItem) -> bool + Send + Sync + 'static,
    {
        Self {
            label: label.into(),
            test: Arc::new(test),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn matches(&self, item: &ContentItem) -> bool {
        (self.test)(item)
    }
}

impl fmt::Debug for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Predicate({})", self.label)
    }
}

/// One `(predicate, target)` pair of a conditional edge
#[derive(Debug, Clone)]
pub struct Branch {
    pub predicate: Predicate,
    pub target: UnitId,
}

impl Branch {
    pub fn new(predicate: Predicate, target: impl Into<UnitId>) -> Self {
        Self {
            predicate,
            target: target.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub enum EdgeKind {
    Sequential,
    Parallel,
    Join {
        wait: WaitStrategy,
        /// Overrides the run's default join timeout
        timeout: Option<Duration>,
    },
    Conditional {
        /// Evaluated left to right; the first match wins
        branches: Vec<Branch>,
        default: UnitId,
    },
}

impl EdgeKind {
    pub fn name(&self) -> &'static str {
        match self {
            EdgeKind::Sequential => "sequential",
            EdgeKind::Parallel => "parallel",
            EdgeKind::Join { .. } => "join",
            EdgeKind::Conditional { .. } => "conditional",
        }
    }
}

/// Typed connection between units
#[derive(Debug, Clone)]
pub struct Edge {
    pub from: Vec<UnitId>,
    /// Every unit the edge can deliver to. For conditional edges these are
    /// the distinct branch targets followed by the default.
    pub to: Vec<UnitId>,
    pub kind: EdgeKind,
}

impl Edge {
    pub fn sequential(from: impl Into<UnitId>, to: impl Into<UnitId>) -> Self {
        Self {
            from: vec![from.into()],
            to: vec![to.into()],
            kind: EdgeKind::Sequential,
        }
    }

    pub fn parallel<I, S>(from: impl Into<UnitId>, targets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<UnitId>,
    {
        Self {
            from: vec![from.into()],
            to: targets.into_iter().map(Into::into).collect(),
            kind: EdgeKind::Parallel,
        }
    }

    /// Join that waits for every source
    pub fn join<I, S>(sources: I, to: impl Into<UnitId>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<UnitId>,
    {
        Self {
            from: sources.into_iter().map(Into::into).collect(),
            to: vec![to.into()],
            kind: EdgeKind::Join {
                wait: WaitStrategy::All,
                timeout: None,
            },
        }
    }

    /// Join that proceeds with the first source to complete
    pub fn join_first<I, S>(sources: I, to: impl Into<UnitId>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<UnitId>,
    {
        Self::join(sources, to).with_wait(WaitStrategy::First)
    }

    pub fn conditional(from: impl Into<UnitId>, branches: Vec<Branch>, default: impl Into<UnitId>) -> Self {
        let default = default.into();
        let mut to: Vec<UnitId> = Vec::new();
        for target in branches.iter().map(|b| &b.target).chain(std::iter::once(&default)) {
            if !to.contains(target) {
                to.push(target.clone());
            }
        }
        Self {
            from: vec![from.into()],
            to,
            kind: EdgeKind::Conditional { branches, default },
        }
    }

    /// Sets the wait strategy of a join edge; no effect on other kinds
    pub fn with_wait(mut self, strategy: WaitStrategy) -> Self {
        if let EdgeKind::Join { wait, .. } = &mut self.kind {
            *wait = strategy;
        }
        self
    }

    /// Sets the timeout of a join edge; no effect on other kinds
    pub fn with_timeout(mut self, limit: Duration) -> Self {
        if let EdgeKind::Join { timeout, .. } = &mut self.kind {
            *timeout = Some(limit);
        }
        self
    }
}

impl fmt::Display for Edge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            EdgeKind::Sequential => write!(f, "{} -> {} (sequential)", self.from[0], self.to[0]),
            EdgeKind::Parallel => write!(f, "{} -> [{}] (parallel)", self.from[0], self.to.join(", ")),
            EdgeKind::Join { wait, timeout } => {
                write!(f, "[{}] -> {} (join {wait}", self.from.join(", "), self.to[0])?;
                if let Some(limit) = timeout {
                    write!(f, ", timeout {}ms", limit.as_millis())?;
                }
                f.write_str(")")
            }
            EdgeKind::Conditional { branches, default } => {
                write!(f, "{} -> ", self.from[0])?;
                for branch in branches {
                    write!(f, "{} ? {} | ", branch.predicate.label(), branch.target)?;
                }
                write!(f, "default {} (conditional)", default)
            }
        }
    }
}

struct GraphInner {
    name: String,
    units: Vec<UnitRef>,
    index: HashMap<UnitId, usize>,
    edges: Vec<Edge>,
    start: usize,
    inbound: Vec<Vec<usize>>,
    outbound: Vec<Vec<usize>>,
    order: Vec<usize>,
}

/// Validated, immutable pipeline graph
///
/// Cloning is cheap: clones share the same validated structure.
#[derive(Clone)]
pub struct Graph {
    inner: Arc<GraphInner>,
}

impl fmt::Debug for Graph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Graph")
            .field("name", &self.inner.name)
            .field("units", &self.inner.units.len())
            .field("edges", &self.inner.edges.len())
            .field("start", &self.start())
            .finish()
    }
}

impl Graph {
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn start(&self) -> &str {
        &self.inner.units[self.inner.start].id
    }

    /// Units in declaration order
    pub fn units(&self) -> &[UnitRef] {
        &self.inner.units
    }

    pub fn unit(&self, id: &str) -> Option<&UnitRef> {
        self.index_of(id).map(|i| &self.inner.units[i])
    }

    pub fn edges(&self) -> &[Edge] {
        &self.inner.edges
    }

    pub fn inbound_edges(&self, id: &str) -> Vec<&Edge> {
        self.index_of(id)
            .map(|i| self.inner.inbound[i].iter().map(|&e| &self.inner.edges[e]).collect())
            .unwrap_or_default()
    }

    pub fn outbound_edges(&self, id: &str) -> Vec<&Edge> {
        self.index_of(id)
            .map(|i| self.inner.outbound[i].iter().map(|&e| &self.inner.edges[e]).collect())
            .unwrap_or_default()
    }

    /// Units without outgoing edges, in declaration order. Their outputs are
    /// the outputs of a run.
    pub fn sinks(&self) -> Vec<&str> {
        self.inner
            .units
            .iter()
            .enumerate()
            .filter(|(i, _)| self.inner.outbound[*i].is_empty())
            .map(|(_, u)| u.id.as_str())
            .collect()
    }

    /// Units ordered so every edge points forward; ties keep declaration order
    pub fn topological_order(&self) -> Vec<&str> {
        self.inner
            .order
            .iter()
            .map(|&i| self.inner.units[i].id.as_str())
            .collect()
    }

    /// Human-readable outline of units and edges
    pub fn describe(&self) -> String {
        let mut out = format!("graph '{}' (start: {})\n", self.name(), self.start());
        out.push_str("units:\n");
        for unit in self.units() {
            let mut flags = Vec::new();
            if unit.policy.continue_on_error {
                flags.push("continue_on_error".to_string());
            }
            if let Some(retry) = &unit.policy.retry {
                flags.push(format!("retries={}", retry.max_retries));
            }
            if let Some(limit) = unit.policy.max_concurrency {
                flags.push(format!("max_concurrency={limit}"));
            }
            out.push_str(&format!("  {} [{}]", unit.id, unit.kind()));
            if !flags.is_empty() {
                out.push_str(&format!(" {}", flags.join(" ")));
            }
            out.push('\n');
        }
        out.push_str("edges:\n");
        for edge in self.edges() {
            out.push_str(&format!("  {edge}\n"));
        }
        out
    }

    pub(crate) fn index_of(&self, id: &str) -> Option<usize> {
        self.inner.index.get(id).copied()
    }

    pub(crate) fn start_index(&self) -> usize {
        self.inner.start
    }

    pub(crate) fn inbound_of(&self, unit: usize) -> &[usize] {
        &self.inner.inbound[unit]
    }

    pub(crate) fn outbound_of(&self, unit: usize) -> &[usize] {
        &self.inner.outbound[unit]
    }
}

/// Collects units and edges, then validates them into a [`Graph`]
#[derive(Default)]
pub struct GraphBuilder {
    name: String,
    units: Vec<UnitRef>,
    edges: Vec<Edge>,
    start: Option<UnitId>,
}

impl GraphBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn add_unit(&mut self, unit: UnitRef) -> &mut Self {
        self.units.push(unit);
        self
    }

    pub fn add_edge(&mut self, edge: Edge) -> &mut Self {
        self.edges.push(edge);
        self
    }

    pub fn set_start(&mut self, id: impl Into<UnitId>) -> &mut Self {
        self.start = Some(id.into());
        self
    }

    pub fn build(self) -> Result<Graph> {
        let start = self
            .start
            .ok_or_else(|| PipelineError::validation("no start unit set"))?;
        build_graph(self.name, self.units, self.edges, start)
    }
}

/// Validates units and edges into an immutable [`Graph`]
pub fn build_graph(
    name: impl Into<String>,
    units: Vec<UnitRef>,
    edges: Vec<Edge>,
    start: impl Into<UnitId>,
) -> Result<Graph> {
    let name = name.into();
    let start = start.into();

    let mut index = HashMap::with_capacity(units.len());
    for (i, unit) in units.iter().enumerate() {
        if unit.id.is_empty() {
            return Err(PipelineError::validation("unit id must not be empty"));
        }
        if index.insert(unit.id.clone(), i).is_some() {
            return Err(PipelineError::validation(format!("duplicate unit id '{}'", unit.id)));
        }
    }

    let start_idx = *index
        .get(&start)
        .ok_or_else(|| PipelineError::validation(format!("start unit '{start}' is not declared")))?;

    let mut inbound = vec![Vec::new(); units.len()];
    let mut outbound = vec![Vec::new(); units.len()];
    let mut adjacency: Vec<Vec<usize>> = vec![Vec::new(); units.len()];
    let mut connections = HashSet::new();

    for (e, edge) in edges.iter().enumerate() {
        check_shape(edge)?;

        let from = resolve(&index, &edge.from, edge)?;
        let to = resolve(&index, &edge.to, edge)?;

        if let EdgeKind::Join { .. } = edge.kind {
            if edge.from.contains(&edge.to[0]) {
                return Err(PipelineError::validation(format!(
                    "join into '{}' lists itself as a source",
                    edge.to[0]
                )));
            }
        }

        for &f in &from {
            for &t in &to {
                if f == start_idx && t == start_idx {
                    return Err(PipelineError::validation(format!(
                        "start unit '{start}' has an edge to itself"
                    )));
                }
                if !connections.insert((f, t)) {
                    return Err(PipelineError::validation(format!(
                        "units '{}' and '{}' are connected more than once",
                        units[f].id, units[t].id
                    )));
                }
                adjacency[f].push(t);
            }
            outbound[f].push(e);
        }
        for &t in &to {
            inbound[t].push(e);
        }
    }

    let order = topological_sort(&adjacency).map_err(|stuck| {
        let names: Vec<&str> = stuck.iter().map(|&i| units[i].id.as_str()).collect();
        PipelineError::validation(format!("cycle detected among units [{}]", names.join(", ")))
    })?;

    let reachable = reachable_from(start_idx, &adjacency, None);
    let unreachable: Vec<&str> = units
        .iter()
        .enumerate()
        .filter(|(i, _)| !reachable[*i])
        .map(|(_, u)| u.id.as_str())
        .collect();
    if !unreachable.is_empty() {
        return Err(PipelineError::validation(format!(
            "units not reachable from start '{start}': [{}]",
            unreachable.join(", ")
        )));
    }

    for edge in &edges {
        if let EdgeKind::Join { .. } = edge.kind {
            let target = index[&edge.to[0]];
            let seen = reachable_from(start_idx, &adjacency, Some(target));
            for source in &edge.from {
                if !seen[index[source]] {
                    return Err(PipelineError::validation(format!(
                        "join source '{source}' is only reachable through its target '{}'",
                        edge.to[0]
                    )));
                }
            }
        }
    }

    Ok(Graph {
        inner: Arc::new(GraphInner {
            name,
            units,
            index,
            edges,
            start: start_idx,
            inbound,
            outbound,
            order,
        }),
    })
}

fn check_shape(edge: &Edge) -> Result<()> {
    let kind = edge.kind.name();
    let invalid = |reason: &str| PipelineError::validation(format!("{kind} edge {reason}"));

    if let EdgeKind::Conditional { default, .. } = &edge.kind {
        if default.is_empty() {
            return Err(invalid(&format!(
                "from '{}' has no default target",
                edge.from.first().map(String::as_str).unwrap_or("?")
            )));
        }
    }
    if edge.from.iter().chain(&edge.to).any(String::is_empty) {
        return Err(invalid("references an empty unit id"));
    }
    if has_duplicates(&edge.from) {
        return Err(invalid(&format!("repeats a source in [{}]", edge.from.join(", "))));
    }

    match &edge.kind {
        EdgeKind::Sequential => {
            if edge.from.len() != 1 || edge.to.len() != 1 {
                return Err(invalid("must connect exactly one source to one target"));
            }
        }
        EdgeKind::Parallel => {
            if edge.from.len() != 1 || edge.to.is_empty() {
                return Err(invalid("must connect one source to at least one target"));
            }
            if has_duplicates(&edge.to) {
                return Err(invalid(&format!("repeats a target in [{}]", edge.to.join(", "))));
            }
        }
        EdgeKind::Join { .. } => {
            if edge.from.len() < 2 || edge.to.len() != 1 {
                return Err(invalid("must connect at least two sources to one target"));
            }
        }
        EdgeKind::Conditional { branches, default } => {
            if edge.from.len() != 1 {
                return Err(invalid("must have exactly one source"));
            }
            if branches.is_empty() {
                return Err(invalid(&format!("from '{}' has no branches", edge.from[0])));
            }
            let mut expected: Vec<&UnitId> = Vec::new();
            for target in branches.iter().map(|b| &b.target).chain(std::iter::once(default)) {
                if !expected.contains(&target) {
                    expected.push(target);
                }
            }
            if !expected.iter().copied().eq(edge.to.iter()) {
                return Err(invalid(&format!(
                    "from '{}' lists targets [{}] but routes to [{}]",
                    edge.from[0],
                    edge.to.join(", "),
                    expected.iter().map(|t| t.as_str()).collect::<Vec<_>>().join(", ")
                )));
            }
        }
    }
    Ok(())
}

fn has_duplicates(ids: &[UnitId]) -> bool {
    let mut seen = HashSet::with_capacity(ids.len());
    ids.iter().any(|id| !seen.insert(id))
}

fn resolve(index: &HashMap<UnitId, usize>, ids: &[UnitId], edge: &Edge) -> Result<Vec<usize>> {
    ids.iter()
        .map(|id| {
            index.get(id).copied().ok_or_else(|| {
                PipelineError::validation(format!("edge {edge} references unknown unit '{id}'"))
            })
        })
        .collect()
}

/// Kahn's algorithm; on failure returns the units left on a cycle
fn topological_sort(adjacency: &[Vec<usize>]) -> std::result::Result<Vec<usize>, Vec<usize>> {
    let mut in_degree = vec![0usize; adjacency.len()];
    for targets in adjacency {
        for &t in targets {
            in_degree[t] += 1;
        }
    }

    let mut ready: BTreeSet<usize> = (0..adjacency.len()).filter(|&i| in_degree[i] == 0).collect();
    let mut order = Vec::with_capacity(adjacency.len());
    while let Some(next) = ready.pop_first() {
        order.push(next);
        for &t in &adjacency[next] {
            in_degree[t] -= 1;
            if in_degree[t] == 0 {
                ready.insert(t);
            }
        }
    }

    if order.len() == adjacency.len() {
        Ok(order)
    } else {
        Err((0..adjacency.len()).filter(|&i| in_degree[i] > 0).collect())
    }
}

fn reachable_from(start: usize, adjacency: &[Vec<usize>], blocked: Option<usize>) -> Vec<bool> {
    let mut seen = vec![false; adjacency.len()];
    let mut queue = VecDeque::from([start]);
    seen[start] = true;
    while let Some(current) = queue.pop_front() {
        for &next in &adjacency[current] {
            if Some(next) == blocked || seen[next] {
                continue;
            }
            seen[next] = true;
            queue.push_back(next);
        }
    }
    seen
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::units::Passthrough;
    use serde_json::json;

    fn unit(id: &str) -> UnitRef {
        UnitRef::new(id, Passthrough)
    }

    fn units(ids: &[&str]) -> Vec<UnitRef> {
        ids.iter().map(|id| unit(id)).collect()
    }

    fn validation_message(result: Result<Graph>) -> String {
        match result {
            Err(PipelineError::Validation(message)) => message,
            Err(other) => panic!("expected validation error, got {other:?}"),
            Ok(_) => panic!("expected validation error, graph was built"),
        }
    }

    #[test]
    fn test_linear_graph() {
        let graph = build_graph(
            "linear",
            units(&["a", "b", "c"]),
            vec![Edge::sequential("a", "b"), Edge::sequential("b", "c")],
            "a",
        )
        .unwrap();

        assert_eq!(graph.name(), "linear");
        assert_eq!(graph.start(), "a");
        assert_eq!(graph.sinks(), vec!["c"]);
        assert_eq!(graph.inbound_edges("b").len(), 1);
        assert_eq!(graph.outbound_edges("c").len(), 0);
        assert!(graph.unit("missing").is_none());
    }

    #[test]
    fn test_rejects_unknown_unit() {
        let msg = validation_message(build_graph(
            "g",
            units(&["a", "b"]),
            vec![Edge::sequential("a", "ghost")],
            "a",
        ));
        assert!(msg.contains("unknown unit 'ghost'"), "{msg}");
    }

    #[test]
    fn test_rejects_cycle() {
        let msg = validation_message(build_graph(
            "g",
            units(&["a", "b", "c"]),
            vec![
                Edge::sequential("a", "b"),
                Edge::sequential("b", "c"),
                Edge::sequential("c", "b"),
            ],
            "a",
        ));
        assert!(msg.contains("cycle"), "{msg}");
        assert!(msg.contains('b') && msg.contains('c'));
    }

    #[test]
    fn test_rejects_start_self_edge() {
        let msg = validation_message(build_graph(
            "g",
            units(&["a"]),
            vec![Edge::sequential("a", "a")],
            "a",
        ));
        assert!(msg.contains("edge to itself"), "{msg}");
    }

    #[test]
    fn test_rejects_self_join() {
        let msg = validation_message(build_graph(
            "g",
            units(&["a", "b", "c"]),
            vec![Edge::parallel("a", ["b", "c"]), Edge::join(["b", "c"], "c")],
            "a",
        ));
        assert!(msg.contains("itself"), "{msg}");
    }

    #[test]
    fn test_rejects_conditional_without_default() {
        let edge = Edge::conditional(
            "r",
            vec![Branch::new(Predicate::new("always", |_| true), "x")],
            "",
        );
        let msg = validation_message(build_graph("g", units(&["r", "x"]), vec![edge], "r"));
        assert!(msg.contains("no default"), "{msg}");
    }

    #[test]
    fn test_rejects_conditional_routing_outside_its_targets() {
        let undeclared_default = Edge {
            from: vec!["r".into()],
            to: vec!["x".into()],
            kind: EdgeKind::Conditional {
                branches: vec![Branch::new(Predicate::new("never", |_| false), "x")],
                default: "ghost".into(),
            },
        };
        let msg = validation_message(build_graph("g", units(&["r", "x"]), vec![undeclared_default], "r"));
        assert!(msg.contains("routes to [x, ghost]"), "{msg}");

        let mut unknown_default = Edge::conditional(
            "r",
            vec![Branch::new(Predicate::new("never", |_| false), "x")],
            "ghost",
        );
        let msg = validation_message(build_graph(
            "g",
            units(&["r", "x"]),
            vec![unknown_default.clone()],
            "r",
        ));
        assert!(msg.contains("unknown unit 'ghost'"), "{msg}");

        unknown_default.to.reverse();
        let msg = validation_message(build_graph("g", units(&["r", "x", "ghost"]), vec![unknown_default], "r"));
        assert!(msg.contains("lists targets [ghost, x]"), "{msg}");
    }

    #[test]
    fn test_rejects_bad_shapes() {
        let edge = Edge {
            from: vec!["a".into(), "b".into()],
            to: vec!["c".into()],
            kind: EdgeKind::Sequential,
        };
        let msg = validation_message(build_graph("g", units(&["a", "b", "c"]), vec![edge], "a"));
        assert!(msg.contains("sequential edge"), "{msg}");

        let msg = validation_message(build_graph(
            "g",
            units(&["a", "b"]),
            vec![Edge::join(["a"], "b")],
            "a",
        ));
        assert!(msg.contains("at least two sources"), "{msg}");

        let msg = validation_message(build_graph(
            "g",
            units(&["a", "b"]),
            vec![Edge::parallel("a", ["b", "b"])],
            "a",
        ));
        assert!(msg.contains("repeats a target"), "{msg}");
    }

    #[test]
    fn test_rejects_duplicates_and_unreachable() {
        let msg = validation_message(build_graph("g", units(&["a", "a"]), vec![], "a"));
        assert!(msg.contains("duplicate unit id"), "{msg}");

        let msg = validation_message(build_graph("g", units(&["a", "b"]), vec![], "a"));
        assert!(msg.contains("not reachable"), "{msg}");

        let msg = validation_message(build_graph("g", units(&["a"]), vec![], "z"));
        assert!(msg.contains("start unit 'z'"), "{msg}");

        let msg = validation_message(build_graph(
            "g",
            units(&["a", "b"]),
            vec![Edge::sequential("a", "b"), Edge::parallel("a", ["b"])],
            "a",
        ));
        assert!(msg.contains("more than once"), "{msg}");
    }

    #[test]
    fn test_builder_requires_start() {
        let mut builder = GraphBuilder::new("g");
        builder.add_unit(unit("a"));
        let msg = validation_message(builder.build());
        assert!(msg.contains("no start unit"));
    }

    #[test]
    fn test_conditional_targets_and_predicates() {
        let edge = Edge::conditional(
            "r",
            vec![
                Branch::new(Predicate::new("is_pdf", |i| i.get("type") == Some(&json!("pdf"))), "pdf"),
                Branch::new(Predicate::new("is_doc", |i| i.get("type") == Some(&json!("doc"))), "pdf"),
            ],
            "other",
        );
        assert_eq!(edge.to, vec!["pdf".to_string(), "other".to_string()]);

        let graph = build_graph("g", units(&["r", "pdf", "other"]), vec![edge], "r").unwrap();
        let EdgeKind::Conditional { branches, .. } = &graph.edges()[0].kind else {
            panic!("expected conditional edge");
        };
        assert!(branches[0].predicate.matches(&ContentItem::from_value(json!({"type": "pdf"}))));
        assert!(!branches[1].predicate.matches(&ContentItem::from_value(json!({"type": "pdf"}))));
        assert!(graph.describe().contains("is_pdf ? pdf"));
    }

    #[test]
    fn test_describe_lists_edges() {
        let graph = build_graph(
            "diamond",
            units(&["a", "b", "c", "d"]),
            vec![
                Edge::parallel("a", ["b", "c"]),
                Edge::join_first(["b", "c"], "d").with_timeout(Duration::from_millis(250)),
            ],
            "a",
        )
        .unwrap();

        let text = graph.describe();
        assert!(text.contains("a -> [b, c] (parallel)"));
        assert!(text.contains("[b, c] -> d (join first, timeout 250ms)"));
        assert_eq!(graph.topological_order(), vec!["a", "b", "c", "d"]);
    }
}
