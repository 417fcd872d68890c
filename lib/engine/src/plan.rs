//! DAG planning.
//!
//! The planner turns a runbook's dependency expressions into a concrete
//! edge set, validates the graph, and fixes a stable topological order
//! (declaration order breaks ties). It is pure with respect to variables:
//! `when` gates are evaluated by the engine at dispatch time, not here.

use opsrun_runbook::{DependsOn, EdgeCondition, NodeAction, NodeDescriptor, NodeId, Runbook};
use petgraph::graph::{DiGraph, NodeIndex};
use std::collections::HashMap;
use std::fmt;

/// A planned node: its materialized incoming edges.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanNode {
    /// The node id.
    pub id: NodeId,
    /// Declaration index in the runbook.
    pub index: usize,
    /// Incoming edges: upstream node and condition qualifier.
    pub deps: Vec<(NodeId, EdgeCondition)>,
}

/// A validated plan.
#[derive(Debug, Clone)]
pub struct Plan {
    nodes: Vec<PlanNode>,
    order: Vec<NodeId>,
    by_id: HashMap<NodeId, usize>,
}

impl Plan {
    /// All planned nodes, in declaration order.
    #[must_use]
    pub fn nodes(&self) -> &[PlanNode] {
        &self.nodes
    }

    /// Looks up a planned node.
    #[must_use]
    pub fn get(&self, id: &NodeId) -> Option<&PlanNode> {
        self.by_id.get(id).map(|&i| &self.nodes[i])
    }

    /// The stable topological order.
    #[must_use]
    pub fn order(&self) -> &[NodeId] {
        &self.order
    }

    /// Position of a node in the topological order.
    #[must_use]
    pub fn order_position(&self, id: &NodeId) -> usize {
        self.order.iter().position(|n| n == id).unwrap_or(usize::MAX)
    }
}

/// Errors from planning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlanError {
    /// A dependency references a node that does not exist.
    UnknownNode { node: String, reference: String },
    /// The graph contains a cycle; the path closes on its first element.
    Cycle { path: Vec<String> },
    /// A node is both critical and skip-requested.
    CriticalAndSkip { node: String },
    /// A node is missing a field its kind requires.
    MissingField { node: String, field: &'static str },
}

impl PlanError {
    /// Stable machine code for the CLI surface.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::UnknownNode { .. } => "unknown_node",
            Self::Cycle { .. } => "cycle",
            Self::CriticalAndSkip { .. } => "critical_and_skip",
            Self::MissingField { .. } => "missing_field",
        }
    }
}

impl fmt::Display for PlanError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownNode { node, reference } => {
                write!(f, "node '{node}' depends on unknown node '{reference}'")
            }
            Self::Cycle { path } => write!(f, "dependency cycle: {}", path.join(" -> ")),
            Self::CriticalAndSkip { node } => {
                write!(f, "node '{node}' is critical and cannot be skip-requested")
            }
            Self::MissingField { node, field } => {
                write!(f, "node '{node}' is missing required field '{field}'")
            }
        }
    }
}

impl std::error::Error for PlanError {}

/// Builds and validates a plan for a runbook.
///
/// # Errors
///
/// Returns a `PlanError` on unknown references, cycles, critical+skip
/// conflicts, or missing per-kind fields.
pub fn plan(runbook: &Runbook) -> Result<Plan, PlanError> {
    let mut nodes = Vec::with_capacity(runbook.nodes.len());

    for (index, node) in runbook.nodes.iter().enumerate() {
        validate_fields(node)?;
        if node.critical && node.skip {
            return Err(PlanError::CriticalAndSkip {
                node: node.id.to_string(),
            });
        }

        let deps = match &node.depends_on {
            // The first node has no implicit predecessor.
            DependsOn::Implicit | DependsOn::Previous => (index > 0)
                .then(|| vec![(runbook.nodes[index - 1].id.clone(), EdgeCondition::AnyTerminal)])
                .unwrap_or_default(),
            DependsOn::AllPrevious => runbook.nodes[..index]
                .iter()
                .map(|n| (n.id.clone(), EdgeCondition::AnyTerminal))
                .collect(),
            DependsOn::Explicit { refs } => {
                let mut deps = Vec::with_capacity(refs.len());
                for dep in refs {
                    if runbook.position(&dep.target).is_none() {
                        return Err(PlanError::UnknownNode {
                            node: node.id.to_string(),
                            reference: dep.target.to_string(),
                        });
                    }
                    deps.push((dep.target.clone(), dep.condition));
                }
                deps
            }
        };

        nodes.push(PlanNode {
            id: node.id.clone(),
            index,
            deps,
        });
    }

    detect_cycle(&nodes)?;
    let order = stable_topo_order(&nodes);

    let by_id = nodes
        .iter()
        .enumerate()
        .map(|(i, n)| (n.id.clone(), i))
        .collect();

    Ok(Plan {
        nodes,
        order,
        by_id,
    })
}

fn validate_fields(node: &NodeDescriptor) -> Result<(), PlanError> {
    let missing = |field| PlanError::MissingField {
        node: node.id.to_string(),
        field,
    };
    match &node.action {
        NodeAction::Manual { prompt } => {
            if prompt.trim().is_empty() {
                return Err(missing("prompt"));
            }
        }
        NodeAction::Command { command, .. } => {
            if command.trim().is_empty() {
                return Err(missing("command"));
            }
        }
        NodeAction::Function {
            plugin, function, ..
        } => {
            if plugin.trim().is_empty() {
                return Err(missing("plugin"));
            }
            if function.trim().is_empty() {
                return Err(missing("function"));
            }
        }
    }
    Ok(())
}

fn detect_cycle(nodes: &[PlanNode]) -> Result<(), PlanError> {
    let mut graph: DiGraph<usize, ()> = DiGraph::new();
    let mut indices: HashMap<&NodeId, NodeIndex> = HashMap::new();
    for (i, node) in nodes.iter().enumerate() {
        indices.insert(&node.id, graph.add_node(i));
    }
    for node in nodes {
        let target = indices[&node.id];
        for (dep, _) in &node.deps {
            graph.add_edge(indices[dep], target, ());
        }
    }

    for scc in petgraph::algo::tarjan_scc(&graph) {
        let is_cycle = scc.len() > 1
            || (scc.len() == 1 && graph.find_edge(scc[0], scc[0]).is_some());
        if is_cycle {
            // Report members in declaration order, closed on the first.
            let mut members: Vec<usize> = scc.iter().map(|&idx| graph[idx]).collect();
            members.sort_unstable();
            let mut path: Vec<String> =
                members.iter().map(|&i| nodes[i].id.to_string()).collect();
            path.push(path[0].clone());
            return Err(PlanError::Cycle { path });
        }
    }
    Ok(())
}

/// Kahn's algorithm; among ready nodes the lowest declaration index wins.
fn stable_topo_order(nodes: &[PlanNode]) -> Vec<NodeId> {
    let position: HashMap<&NodeId, usize> =
        nodes.iter().enumerate().map(|(i, n)| (&n.id, i)).collect();
    let mut indegree: Vec<usize> = nodes.iter().map(|n| n.deps.len()).collect();
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); nodes.len()];
    for (i, node) in nodes.iter().enumerate() {
        for (dep, _) in &node.deps {
            dependents[position[dep]].push(i);
        }
    }

    let mut order = Vec::with_capacity(nodes.len());
    let mut done = vec![false; nodes.len()];
    while order.len() < nodes.len() {
        let Some(next) = (0..nodes.len()).find(|&i| !done[i] && indegree[i] == 0) else {
            break; // unreachable after cycle detection
        };
        done[next] = true;
        order.push(nodes[next].id.clone());
        for &dependent in &dependents[next] {
            indegree[dependent] -= 1;
        }
    }
    order
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use opsrun_runbook::{
        DependencyRef, NodeDescriptor, Runbook, RunbookMeta,
    };
    use std::collections::BTreeMap;

    fn command_node(id: &str) -> NodeDescriptor {
        NodeDescriptor::new(
            id,
            NodeAction::Command {
                command: format!("run-{id}"),
                interactive: false,
            },
        )
    }

    fn runbook(nodes: Vec<NodeDescriptor>) -> Runbook {
        Runbook {
            name: "test".to_string(),
            meta: RunbookMeta {
                title: "Test".to_string(),
                description: None,
                version: "1".to_string(),
                author: None,
                created_at: Utc::now(),
            },
            variables: Vec::new(),
            nodes,
            plugin_config: BTreeMap::new(),
            digest: "0".repeat(64),
        }
    }

    fn dep(target: &str, condition: EdgeCondition) -> DependencyRef {
        DependencyRef {
            target: NodeId::new(target),
            condition,
        }
    }

    #[test]
    fn implicit_chain() {
        let rb = runbook(vec![command_node("a"), command_node("b"), command_node("c")]);
        let plan = plan(&rb).unwrap();

        assert!(plan.get(&NodeId::new("a")).unwrap().deps.is_empty());
        assert_eq!(
            plan.get(&NodeId::new("b")).unwrap().deps,
            vec![(NodeId::new("a"), EdgeCondition::AnyTerminal)]
        );
        assert_eq!(
            plan.order(),
            &[NodeId::new("a"), NodeId::new("b"), NodeId::new("c")]
        );
    }

    #[test]
    fn star_depends_on_all_declared_before() {
        let mut fanin = command_node("fanin");
        fanin.depends_on = DependsOn::AllPrevious;
        let mut b = command_node("b");
        b.depends_on = DependsOn::Explicit { refs: vec![] };
        let rb = runbook(vec![command_node("a"), b, fanin]);

        let plan = plan(&rb).unwrap();
        let deps = &plan.get(&NodeId::new("fanin")).unwrap().deps;
        assert_eq!(deps.len(), 2);
        assert!(deps.contains(&(NodeId::new("a"), EdgeCondition::AnyTerminal)));
        assert!(deps.contains(&(NodeId::new("b"), EdgeCondition::AnyTerminal)));
    }

    #[test]
    fn caret_on_first_node_means_no_deps() {
        let mut a = command_node("a");
        a.depends_on = DependsOn::Previous;
        let rb = runbook(vec![a]);
        let plan = plan(&rb).unwrap();
        assert!(plan.get(&NodeId::new("a")).unwrap().deps.is_empty());
    }

    #[test]
    fn unknown_reference_is_rejected() {
        let mut b = command_node("b");
        b.depends_on = DependsOn::explicit(vec![dep("ghost", EdgeCondition::AnyTerminal)]);
        let rb = runbook(vec![command_node("a"), b]);
        let err = plan(&rb).unwrap_err();
        assert_eq!(err.code(), "unknown_node");
    }

    #[test]
    fn two_node_cycle_reports_path() {
        let mut a = command_node("a");
        a.depends_on = DependsOn::explicit(vec![dep("b", EdgeCondition::AnyTerminal)]);
        let mut b = command_node("b");
        b.depends_on = DependsOn::explicit(vec![dep("a", EdgeCondition::AnyTerminal)]);
        let rb = runbook(vec![a, b]);

        let err = plan(&rb).unwrap_err();
        let PlanError::Cycle { path } = err else {
            panic!("expected cycle, got {err}");
        };
        assert_eq!(path, vec!["a", "b", "a"]);
    }

    #[test]
    fn self_dependency_is_a_cycle() {
        let mut a = command_node("a");
        a.depends_on = DependsOn::explicit(vec![dep("a", EdgeCondition::AnyTerminal)]);
        let rb = runbook(vec![a]);
        let err = plan(&rb).unwrap_err();
        assert_eq!(err.code(), "cycle");
    }

    #[test]
    fn critical_and_skip_is_rejected() {
        let mut a = command_node("a");
        a.critical = true;
        a.skip = true;
        let rb = runbook(vec![a]);
        let err = plan(&rb).unwrap_err();
        assert_eq!(err.code(), "critical_and_skip");
    }

    #[test]
    fn empty_command_is_rejected() {
        let mut a = command_node("a");
        a.action = NodeAction::Command {
            command: "   ".to_string(),
            interactive: false,
        };
        let rb = runbook(vec![a]);
        let err = plan(&rb).unwrap_err();
        assert!(matches!(
            err,
            PlanError::MissingField {
                field: "command",
                ..
            }
        ));
    }

    #[test]
    fn topo_order_breaks_ties_by_declaration() {
        // a; b and c both depend on a; d depends on b and c.
        let a = command_node("a");
        let mut b = command_node("b");
        b.depends_on = DependsOn::explicit(vec![dep("a", EdgeCondition::AnyTerminal)]);
        let mut c = command_node("c");
        c.depends_on = DependsOn::explicit(vec![dep("a", EdgeCondition::AnyTerminal)]);
        let mut d = command_node("d");
        d.depends_on = DependsOn::explicit(vec![
            dep("b", EdgeCondition::AnyTerminal),
            dep("c", EdgeCondition::AnyTerminal),
        ]);
        // Declare c before b to check the tiebreak follows declaration order.
        let rb = runbook(vec![a, c, b, d]);

        let plan = plan(&rb).unwrap();
        assert_eq!(
            plan.order(),
            &[
                NodeId::new("a"),
                NodeId::new("c"),
                NodeId::new("b"),
                NodeId::new("d")
            ]
        );
    }

    #[test]
    fn condition_qualifiers_are_preserved() {
        let build = command_node("build");
        let mut deploy = command_node("deploy");
        deploy.depends_on = DependsOn::explicit(vec![dep("build", EdgeCondition::Success)]);
        let mut rollback = command_node("rollback");
        rollback.depends_on = DependsOn::explicit(vec![dep("build", EdgeCondition::Failure)]);
        let rb = runbook(vec![build, deploy, rollback]);

        let plan = plan(&rb).unwrap();
        assert_eq!(
            plan.get(&NodeId::new("deploy")).unwrap().deps[0].1,
            EdgeCondition::Success
        );
        assert_eq!(
            plan.get(&NodeId::new("rollback")).unwrap().deps[0].1,
            EdgeCondition::Failure
        );
    }
}
