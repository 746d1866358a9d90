//! Module dependency graph.
//!
//! Adjacency lists addressed by [`ModuleId`]. HARD edges must stay acyclic;
//! SOFT edges never block initialization and may cycle freely. Only the
//! control thread mutates the graph, through [`DependencyGraph::declare`] and
//! [`DependencyGraph::reclassify`].

use crate::{
    error::GraphError,
    kernel::{ModuleId, ModuleState},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DependencyKind {
    /// Target must reach RUNNING before the source may initialize.
    Hard,
    /// Target only has to settle; the source decides what to do with it.
    Soft,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Edge {
    pub target: ModuleId,
    pub kind: DependencyKind,
}

/// Outcome of evaluating a module's dependencies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    Ready,
    /// Some target has not settled yet.
    Waiting(ModuleId),
    /// A HARD target can no longer reach RUNNING.
    Blocked(ModuleId),
}

#[derive(Debug, Default, Clone)]
pub struct DependencyGraph {
    edges: Vec<Vec<Edge>>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes room for `module`; edges may then be declared from it.
    pub fn add_node(&mut self, module: ModuleId) {
        if self.edges.len() <= module.index() {
            self.edges.resize_with(module.index() + 1, Vec::new);
        }
    }

    pub fn len(&self) -> usize {
        self.edges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }

    fn contains(&self, module: ModuleId) -> bool {
        module.index() < self.edges.len()
    }

    /// Adds an edge, or overwrites the kind of an existing one.
    ///
    /// Rejects an edge that would close a cycle among HARD edges.
    pub fn declare(
        &mut self,
        module: ModuleId,
        target: ModuleId,
        kind: DependencyKind,
    ) -> Result<(), GraphError> {
        for id in [module, target] {
            if !self.contains(id) {
                return Err(GraphError::UnknownModule(id));
            }
        }
        if module == target {
            return Err(GraphError::SelfDependency(module));
        }
        if kind == DependencyKind::Hard && self.hard_path(target, module) {
            return Err(GraphError::HardCycle {
                source_module: module,
                target,
            });
        }

        let edges = &mut self.edges[module.index()];
        match edges.iter_mut().find(|e| e.target == target) {
            Some(edge) => edge.kind = kind,
            None => edges.push(Edge { target, kind }),
        }
        Ok(())
    }

    /// Changes the kind of an existing edge.
    ///
    /// Returns false, changing nothing, when the edge does not exist or a
    /// promotion to HARD would close a cycle.
    pub fn reclassify(&mut self, module: ModuleId, target: ModuleId, kind: DependencyKind) -> bool {
        let exists = self
            .edges(module)
            .iter()
            .any(|e| e.target == target);
        if !exists {
            return false;
        }
        self.declare(module, target, kind).is_ok()
    }

    /// Drops every outgoing edge of `module`.
    pub fn clear(&mut self, module: ModuleId) {
        if let Some(edges) = self.edges.get_mut(module.index()) {
            edges.clear();
        }
    }

    pub fn edges(&self, module: ModuleId) -> &[Edge] {
        self.edges
            .get(module.index())
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn kind(&self, module: ModuleId, target: ModuleId) -> Option<DependencyKind> {
        self.edges(module)
            .iter()
            .find(|e| e.target == target)
            .map(|e| e.kind)
    }

    /// Evaluates `module`'s edges against the current lifecycle states.
    pub fn resolve(&self, module: ModuleId, state_of: impl Fn(ModuleId) -> ModuleState) -> Readiness {
        let mut waiting = None;

        for edge in self.edges(module) {
            let state = state_of(edge.target);
            match edge.kind {
                DependencyKind::Hard if state.is_running() => {}
                DependencyKind::Hard if state.can_still_run() => {
                    waiting.get_or_insert(edge.target);
                }
                DependencyKind::Hard => return Readiness::Blocked(edge.target),
                DependencyKind::Soft if !state.has_been_checked() => {
                    waiting.get_or_insert(edge.target);
                }
                DependencyKind::Soft => {}
            }
        }

        waiting.map_or(Readiness::Ready, Readiness::Waiting)
    }

    /// True iff every HARD target is RUNNING and every target was checked.
    pub fn is_satisfied(&self, module: ModuleId, state_of: impl Fn(ModuleId) -> ModuleState) -> bool {
        self.resolve(module, state_of) == Readiness::Ready
    }

    /// Initialization order: HARD targets before their sources, ties broken
    /// by registration index.
    pub fn init_order(&self) -> Vec<ModuleId> {
        let n = self.edges.len();
        let mut pending: Vec<usize> = self
            .edges
            .iter()
            .map(|edges| {
                edges
                    .iter()
                    .filter(|e| e.kind == DependencyKind::Hard)
                    .count()
            })
            .collect();
        let mut done = vec![false; n];
        let mut order = Vec::with_capacity(n);

        while order.len() < n {
            let Some(next) = (0..n).find(|&i| !done[i] && pending[i] == 0) else {
                break;
            };
            done[next] = true;
            order.push(ModuleId::new(next));

            for (idx, edges) in self.edges.iter().enumerate() {
                let hard_hits = edges
                    .iter()
                    .filter(|e| e.kind == DependencyKind::Hard && e.target.index() == next)
                    .count();
                pending[idx] -= hard_hits;
            }
        }

        order
    }

    fn hard_path(&self, from: ModuleId, to: ModuleId) -> bool {
        let mut seen = vec![false; self.edges.len()];
        let mut stack = vec![from];

        while let Some(node) = stack.pop() {
            if node == to {
                return true;
            }
            if std::mem::replace(&mut seen[node.index()], true) {
                continue;
            }
            stack.extend(
                self.edges(node)
                    .iter()
                    .filter(|e| e.kind == DependencyKind::Hard)
                    .map(|e| e.target),
            );
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    fn graph(n: usize) -> (DependencyGraph, Vec<ModuleId>) {
        let mut g = DependencyGraph::new();
        let ids: Vec<_> = (0..n).map(ModuleId::new).collect();
        for id in &ids {
            g.add_node(*id);
        }
        (g, ids)
    }

    #[test]
    fn declare_overwrites_existing_edge() {
        let (mut g, m) = graph(2);
        g.declare(m[0], m[1], DependencyKind::Hard).unwrap();
        g.declare(m[0], m[1], DependencyKind::Soft).unwrap();
        assert_eq!(g.edges(m[0]).len(), 1);
        assert_eq!(g.kind(m[0], m[1]), Some(DependencyKind::Soft));
    }

    #[test]
    fn hard_cycle_is_rejected() {
        let (mut g, m) = graph(3);
        g.declare(m[0], m[1], DependencyKind::Hard).unwrap();
        g.declare(m[1], m[2], DependencyKind::Hard).unwrap();

        let err = g.declare(m[2], m[0], DependencyKind::Hard).unwrap_err();
        assert_eq!(
            err,
            GraphError::HardCycle {
                source_module: m[2],
                target: m[0]
            }
        );
        assert!(g.edges(m[2]).is_empty());
    }

    #[test]
    fn soft_edges_may_cycle() {
        let (mut g, m) = graph(2);
        g.declare(m[0], m[1], DependencyKind::Hard).unwrap();
        g.declare(m[1], m[0], DependencyKind::Soft).unwrap();
        assert_eq!(g.kind(m[1], m[0]), Some(DependencyKind::Soft));
    }

    #[test]
    fn self_dependency_is_rejected() {
        let (mut g, m) = graph(1);
        assert_eq!(
            g.declare(m[0], m[0], DependencyKind::Soft),
            Err(GraphError::SelfDependency(m[0]))
        );
    }

    #[test]
    fn reclassify_requires_existing_edge() {
        let (mut g, m) = graph(2);
        assert!(!g.reclassify(m[0], m[1], DependencyKind::Soft));
        assert!(g.edges(m[0]).is_empty());

        g.declare(m[0], m[1], DependencyKind::Hard).unwrap();
        assert!(g.reclassify(m[0], m[1], DependencyKind::Soft));
        assert_eq!(g.kind(m[0], m[1]), Some(DependencyKind::Soft));
    }

    #[test]
    fn reclassify_refuses_cycle_closing_promotion() {
        let (mut g, m) = graph(2);
        g.declare(m[0], m[1], DependencyKind::Hard).unwrap();
        g.declare(m[1], m[0], DependencyKind::Soft).unwrap();

        assert!(!g.reclassify(m[1], m[0], DependencyKind::Hard));
        assert_eq!(g.kind(m[1], m[0]), Some(DependencyKind::Soft));
    }

    #[test]
    fn resolve_follows_edge_kinds() {
        let (mut g, m) = graph(3);
        g.declare(m[0], m[1], DependencyKind::Hard).unwrap();
        g.declare(m[0], m[2], DependencyKind::Soft).unwrap();

        let hard_target = m[1];
        let states = |running: ModuleState, soft: ModuleState| {
            move |id: ModuleId| if id == hard_target { running } else { soft }
        };

        assert_eq!(
            g.resolve(m[0], states(ModuleState::Checked, ModuleState::Checked)),
            Readiness::Waiting(m[1])
        );
        assert_eq!(
            g.resolve(m[0], states(ModuleState::Running, ModuleState::Registered)),
            Readiness::Waiting(m[2])
        );
        assert_eq!(
            g.resolve(m[0], states(ModuleState::Running, ModuleState::Disabled)),
            Readiness::Ready
        );
        assert_eq!(
            g.resolve(m[0], states(ModuleState::Disabled, ModuleState::Running)),
            Readiness::Blocked(m[1])
        );
        assert_eq!(
            g.resolve(m[0], states(ModuleState::Poisoned, ModuleState::Running)),
            Readiness::Blocked(m[1])
        );
        assert!(g.is_satisfied(m[0], states(ModuleState::Running, ModuleState::Running)));
    }

    #[test]
    fn init_order_puts_hard_targets_first() {
        let (mut g, m) = graph(4);
        g.declare(m[0], m[3], DependencyKind::Hard).unwrap();
        g.declare(m[3], m[2], DependencyKind::Hard).unwrap();
        g.declare(m[1], m[0], DependencyKind::Soft).unwrap();

        assert_eq!(g.init_order(), vec![m[1], m[2], m[3], m[0]]);
    }

    #[test]
    fn clear_drops_outgoing_edges_only() {
        let (mut g, m) = graph(3);
        g.declare(m[0], m[1], DependencyKind::Hard).unwrap();
        g.declare(m[2], m[0], DependencyKind::Soft).unwrap();

        g.clear(m[0]);
        assert!(g.edges(m[0]).is_empty());
        assert_eq!(g.kind(m[2], m[0]), Some(DependencyKind::Soft));
    }

    proptest! {
        #[test]
        fn hard_edges_never_cycle(edges in prop::collection::vec((0usize..6, 0usize..6, any::<bool>()), 0..40)) {
            let (mut g, m) = graph(6);
            for (from, to, hard) in edges {
                let kind = if hard { DependencyKind::Hard } else { DependencyKind::Soft };
                let _ = g.declare(m[from], m[to], kind);
            }

            let order = g.init_order();
            prop_assert_eq!(order.len(), 6);
            let position = |id: ModuleId| order.iter().position(|o| *o == id).unwrap();
            for source in &m {
                for edge in g.edges(*source).iter().filter(|e| e.kind == DependencyKind::Hard) {
                    prop_assert!(position(edge.target) < position(*source));
                }
            }
        }
    }
}
