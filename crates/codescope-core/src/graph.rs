//! Agent task graph and per-run node state machine.
//!
//! [`TaskGraph`] is the validated, immutable dependency graph for one
//! analysis run. [`RunState`] tracks every node through
//! `pending → ready → running → {done | failed}` and owns the failure
//! propagation rules, so scheduling order and short-circuiting can be
//! tested without any generation call.

use std::collections::{HashMap, VecDeque};

use serde_json::Value;

use crate::error::{FailureReason, InvalidTaskGraph};
use crate::roles::AgentRole;

/// Declaration of one node: its role, dependencies and retrieval queries.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeSpec {
    pub role: AgentRole,
    pub depends_on: Vec<AgentRole>,
    pub queries: Vec<String>,
}

impl NodeSpec {
    /// A node with the role's standard queries and the given dependencies.
    pub fn new(role: AgentRole, depends_on: Vec<AgentRole>) -> Self {
        Self {
            role,
            depends_on,
            queries: role.context_queries().iter().map(|q| q.to_string()).collect(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TaskGraph {
    nodes: Vec<NodeSpec>,
    positions: HashMap<AgentRole, usize>,
    dependents: Vec<Vec<usize>>,
}

impl TaskGraph {
    /// Validate and build a graph from explicit node specs.
    ///
    /// Fails when the graph is empty, declares a role twice, references a
    /// role that is not a node, or contains a cycle.
    pub fn new(nodes: Vec<NodeSpec>) -> Result<Self, InvalidTaskGraph> {
        if nodes.is_empty() {
            return Err(InvalidTaskGraph::Empty);
        }

        let mut positions = HashMap::new();
        for (i, node) in nodes.iter().enumerate() {
            if positions.insert(node.role, i).is_some() {
                return Err(InvalidTaskGraph::DuplicateRole(node.role));
            }
        }

        let mut dependents = vec![Vec::new(); nodes.len()];
        let mut indegree = vec![0usize; nodes.len()];
        for (i, node) in nodes.iter().enumerate() {
            for dep in &node.depends_on {
                let Some(&d) = positions.get(dep) else {
                    return Err(InvalidTaskGraph::UnknownDependency {
                        role: node.role,
                        dependency: *dep,
                    });
                };
                dependents[d].push(i);
                indegree[i] += 1;
            }
        }

        // Kahn's algorithm; whatever is never released sits on or behind a cycle.
        let mut queue: VecDeque<usize> = (0..nodes.len()).filter(|&i| indegree[i] == 0).collect();
        let mut visited = 0;
        while let Some(i) = queue.pop_front() {
            visited += 1;
            for &j in &dependents[i] {
                indegree[j] -= 1;
                if indegree[j] == 0 {
                    queue.push_back(j);
                }
            }
        }
        if visited != nodes.len() {
            let mut stuck: Vec<AgentRole> = (0..nodes.len())
                .filter(|&i| indegree[i] > 0)
                .map(|i| nodes[i].role)
                .collect();
            stuck.sort();
            return Err(InvalidTaskGraph::Cycle(stuck));
        }

        Ok(Self {
            nodes,
            positions,
            dependents,
        })
    }

    /// The standard graph for a set of requested roles.
    ///
    /// Includes every requested role plus the transitive closure of their
    /// dependencies. `qa`, when present, also waits for every writer
    /// (`sde`, `pm`) in the plan.
    pub fn plan(requested: &[AgentRole]) -> Result<Self, InvalidTaskGraph> {
        let mut included: Vec<AgentRole> = Vec::new();
        let mut stack: Vec<AgentRole> = requested.to_vec();
        while let Some(role) = stack.pop() {
            if included.contains(&role) {
                continue;
            }
            included.push(role);
            stack.extend(role.dependencies().iter().copied());
        }
        included.sort();

        let nodes = included
            .iter()
            .map(|&role| {
                let mut deps = role.dependencies().to_vec();
                if role == AgentRole::Qa {
                    deps.extend(
                        AgentRole::WRITERS
                            .iter()
                            .copied()
                            .filter(|w| included.contains(w)),
                    );
                }
                NodeSpec::new(role, deps)
            })
            .collect();
        Self::new(nodes)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn nodes(&self) -> &[NodeSpec] {
        &self.nodes
    }

    pub fn roles(&self) -> Vec<AgentRole> {
        self.nodes.iter().map(|n| n.role).collect()
    }

    pub fn node(&self, role: AgentRole) -> Option<&NodeSpec> {
        self.positions.get(&role).map(|&i| &self.nodes[i])
    }

    /// Every role that directly or transitively depends on `role`.
    pub fn transitive_dependents(&self, role: AgentRole) -> Vec<AgentRole> {
        let Some(&start) = self.positions.get(&role) else {
            return Vec::new();
        };
        let mut seen = vec![false; self.nodes.len()];
        let mut stack = self.dependents[start].clone();
        let mut out = Vec::new();
        while let Some(i) = stack.pop() {
            if seen[i] {
                continue;
            }
            seen[i] = true;
            out.push(self.nodes[i].role);
            stack.extend(self.dependents[i].iter().copied());
        }
        out.sort();
        out
    }
}

/// State of one node within a run.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeState {
    Pending,
    Ready,
    Running,
    Done(Value),
    Failed(FailureReason),
}

impl NodeState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, NodeState::Done(_) | NodeState::Failed(_))
    }

    pub fn label(&self) -> &'static str {
        match self {
            NodeState::Pending => "pending",
            NodeState::Ready => "ready",
            NodeState::Running => "running",
            NodeState::Done(_) => "done",
            NodeState::Failed(_) => "failed",
        }
    }
}

/// Mutable node states for one execution of a [`TaskGraph`].
#[derive(Debug)]
pub struct RunState<'g> {
    graph: &'g TaskGraph,
    states: Vec<NodeState>,
}

impl<'g> RunState<'g> {
    pub fn new(graph: &'g TaskGraph) -> Self {
        let mut run = Self {
            graph,
            states: vec![NodeState::Pending; graph.len()],
        };
        run.promote();
        run
    }

    /// A run that starts with some nodes already done, as when an earlier
    /// run is resumed. Roles that are not part of the graph are ignored.
    pub fn resume(graph: &'g TaskGraph, completed: impl IntoIterator<Item = (AgentRole, Value)>) -> Self {
        let mut states = vec![NodeState::Pending; graph.len()];
        for (role, output) in completed {
            if let Some(&i) = graph.positions.get(&role) {
                states[i] = NodeState::Done(output);
            }
        }
        let mut run = Self { graph, states };
        run.promote();
        run
    }

    pub fn graph(&self) -> &'g TaskGraph {
        self.graph
    }

    /// Move every pending node whose dependencies are all done to ready.
    fn promote(&mut self) {
        for (i, node) in self.graph.nodes.iter().enumerate() {
            if self.states[i] != NodeState::Pending {
                continue;
            }
            let all_done = node.depends_on.iter().all(|dep| {
                matches!(self.states[self.graph.positions[dep]], NodeState::Done(_))
            });
            if all_done {
                self.states[i] = NodeState::Ready;
            }
        }
    }

    /// Mark every ready node running and return them in graph order.
    pub fn start_ready(&mut self) -> Vec<AgentRole> {
        let mut started = Vec::new();
        for (i, state) in self.states.iter_mut().enumerate() {
            if *state == NodeState::Ready {
                *state = NodeState::Running;
                started.push(self.graph.nodes[i].role);
            }
        }
        started
    }

    /// Record a successful node. Returns false if the node was not running.
    pub fn complete(&mut self, role: AgentRole, output: Value) -> bool {
        let Some(&i) = self.graph.positions.get(&role) else {
            return false;
        };
        if self.states[i] != NodeState::Running {
            return false;
        }
        self.states[i] = NodeState::Done(output);
        self.promote();
        true
    }

    /// Record a failed node and fail its transitive dependents with
    /// [`FailureReason::UpstreamFailure`]. Returns the dependents that were
    /// failed by propagation.
    pub fn fail(&mut self, role: AgentRole, reason: FailureReason) -> Vec<AgentRole> {
        let Some(&i) = self.graph.positions.get(&role) else {
            return Vec::new();
        };
        if self.states[i].is_terminal() {
            return Vec::new();
        }
        self.states[i] = NodeState::Failed(reason);

        let mut propagated = Vec::new();
        for dependent in self.graph.transitive_dependents(role) {
            let j = self.graph.positions[&dependent];
            if !self.states[j].is_terminal() {
                self.states[j] = NodeState::Failed(FailureReason::UpstreamFailure { upstream: role });
                propagated.push(dependent);
            }
        }
        propagated
    }

    /// Fail every non-terminal node with [`FailureReason::Cancelled`].
    pub fn cancel(&mut self) -> Vec<AgentRole> {
        let mut cancelled = Vec::new();
        for (i, state) in self.states.iter_mut().enumerate() {
            if !state.is_terminal() {
                *state = NodeState::Failed(FailureReason::Cancelled);
                cancelled.push(self.graph.nodes[i].role);
            }
        }
        cancelled
    }

    pub fn state(&self, role: AgentRole) -> Option<&NodeState> {
        self.graph.positions.get(&role).map(|&i| &self.states[i])
    }

    pub fn output(&self, role: AgentRole) -> Option<&Value> {
        match self.state(role) {
            Some(NodeState::Done(v)) => Some(v),
            _ => None,
        }
    }

    pub fn terminal_count(&self) -> usize {
        self.states.iter().filter(|s| s.is_terminal()).count()
    }

    pub fn is_finished(&self) -> bool {
        self.states.iter().all(NodeState::is_terminal)
    }

    /// `(role, state)` for every node, in graph order.
    pub fn into_states(self) -> Vec<(AgentRole, NodeState)> {
        self.graph
            .nodes
            .iter()
            .map(|n| n.role)
            .zip(self.states)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use AgentRole::*;

    fn spec(role: AgentRole, deps: &[AgentRole]) -> NodeSpec {
        NodeSpec::new(role, deps.to_vec())
    }

    #[test]
    fn test_plan_includes_dependency_closure() {
        let graph = TaskGraph::plan(&[Sde]).unwrap();
        assert_eq!(graph.roles(), vec![Coordinator, Semantic, BestPractice, Sde]);
    }

    #[test]
    fn test_plan_qa_waits_for_writers() {
        let graph = TaskGraph::plan(&[Pm, Qa]).unwrap();
        assert_eq!(graph.node(Qa).unwrap().depends_on, vec![BestPractice, Pm]);
        assert!(graph.node(Sde).is_none());
    }

    #[test]
    fn test_empty_graph_rejected() {
        assert_eq!(TaskGraph::new(vec![]).unwrap_err(), InvalidTaskGraph::Empty);
        assert_eq!(TaskGraph::plan(&[]).unwrap_err(), InvalidTaskGraph::Empty);
    }

    #[test]
    fn test_duplicate_and_unknown_rejected() {
        let err = TaskGraph::new(vec![spec(Sde, &[]), spec(Sde, &[])]).unwrap_err();
        assert_eq!(err, InvalidTaskGraph::DuplicateRole(Sde));

        let err = TaskGraph::new(vec![spec(Pm, &[Sde])]).unwrap_err();
        assert_eq!(
            err,
            InvalidTaskGraph::UnknownDependency {
                role: Pm,
                dependency: Sde
            }
        );
    }

    #[test]
    fn test_cycle_detected() {
        let err = TaskGraph::new(vec![
            spec(Coordinator, &[]),
            spec(Sde, &[Pm]),
            spec(Pm, &[Sde]),
            spec(Qa, &[Pm]),
        ])
        .unwrap_err();
        assert_eq!(err, InvalidTaskGraph::Cycle(vec![Sde, Pm, Qa]));

        let err = TaskGraph::new(vec![spec(Sde, &[Sde])]).unwrap_err();
        assert_eq!(err, InvalidTaskGraph::Cycle(vec![Sde]));
    }

    #[test]
    fn test_state_machine_advances_in_dependency_order() {
        let graph = TaskGraph::new(vec![spec(Sde, &[]), spec(Pm, &[Sde]), spec(Qa, &[])]).unwrap();
        let mut run = RunState::new(&graph);
        assert_eq!(run.state(Pm), Some(&NodeState::Pending));

        let started = run.start_ready();
        assert_eq!(started, vec![Sde, Qa]);
        assert!(run.start_ready().is_empty());

        assert!(run.complete(Sde, json!({"ok": true})));
        assert_eq!(run.state(Pm), Some(&NodeState::Ready));
        assert_eq!(run.start_ready(), vec![Pm]);
        assert!(run.complete(Pm, json!({})));
        assert!(!run.is_finished());
        assert!(run.complete(Qa, json!({})));
        assert!(run.is_finished());
        assert_eq!(run.output(Sde), Some(&json!({"ok": true})));
    }

    #[test]
    fn test_complete_requires_running() {
        let graph = TaskGraph::new(vec![spec(Sde, &[])]).unwrap();
        let mut run = RunState::new(&graph);
        assert!(!run.complete(Sde, json!({})));
        run.start_ready();
        assert!(run.complete(Sde, json!({})));
        assert!(!run.complete(Sde, json!({})));
    }

    #[test]
    fn test_failure_propagates_to_transitive_dependents_only() {
        let graph = TaskGraph::new(vec![
            spec(Coordinator, &[]),
            spec(Sde, &[Coordinator]),
            spec(Pm, &[Sde]),
            spec(Qa, &[Pm]),
            spec(BestPractice, &[Coordinator]),
        ])
        .unwrap();
        let mut run = RunState::new(&graph);
        run.start_ready();
        run.complete(Coordinator, json!({}));
        assert_eq!(run.start_ready(), vec![Sde, BestPractice]);

        let propagated = run.fail(Sde, FailureReason::InvalidOutput { message: "no json".into() });
        assert_eq!(propagated, vec![Pm, Qa]);
        for role in [Pm, Qa] {
            assert_eq!(
                run.state(role),
                Some(&NodeState::Failed(FailureReason::UpstreamFailure { upstream: Sde }))
            );
        }
        // The sibling keeps running and can still complete.
        assert_eq!(run.state(BestPractice), Some(&NodeState::Running));
        assert!(run.complete(BestPractice, json!({})));
        assert!(run.is_finished());
    }

    #[test]
    fn test_cancel_fails_non_terminal_nodes() {
        let graph = TaskGraph::plan(&[Sde, Pm]).unwrap();
        let mut run = RunState::new(&graph);
        run.start_ready();
        run.complete(Coordinator, json!({}));
        let cancelled = run.cancel();
        assert_eq!(cancelled, vec![Semantic, BestPractice, Sde, Pm]);
        assert!(run.is_finished());
        assert!(matches!(run.state(Coordinator), Some(NodeState::Done(_))));
        assert_eq!(run.terminal_count(), graph.len());
    }

    #[test]
    fn test_resume_starts_after_completed_nodes() {
        let graph = TaskGraph::new(vec![
            spec(Coordinator, &[]),
            spec(Sde, &[Coordinator]),
            spec(Pm, &[Coordinator]),
            spec(Qa, &[Sde, Pm]),
        ])
        .unwrap();
        let mut run = RunState::resume(
            &graph,
            vec![(Coordinator, json!({"a": 1})), (Sde, json!({})), (Semantic, json!({}))],
        );
        assert_eq!(run.terminal_count(), 2);
        assert_eq!(run.start_ready(), vec![Pm]);
        assert_eq!(run.state(Qa), Some(&NodeState::Pending));
        assert!(run.complete(Pm, json!({})));
        assert_eq!(run.start_ready(), vec![Qa]);
        assert_eq!(run.output(Coordinator), Some(&json!({"a": 1})));
    }

    #[test]
    fn test_into_states_one_per_role() {
        let graph = TaskGraph::plan(&[Qa]).unwrap();
        let mut run = RunState::new(&graph);
        run.cancel();
        let states = run.into_states();
        assert_eq!(states.len(), graph.len());
        assert_eq!(states.last().unwrap().0, Qa);
    }
}
