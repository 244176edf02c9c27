//! Dependency graph resolver: cycle detection and topological levels.
//!
//! Uses `petgraph` as the adjacency arena for step dependencies, keyed by
//! stable step keys. Cycle detection is a depth-first search with an explicit
//! recursion stack so the full offending path can be reported (`x -> y -> x`),
//! and Kahn's algorithm partitions the acyclic graph into execution levels:
//! batches of steps whose dependencies are all satisfied by earlier levels,
//! safe to run concurrently.

use std::collections::HashMap;

use petgraph::graph::{DiGraph, NodeIndex};
use weft_types::workflow::WorkflowDefinition;

use super::definition::WorkflowError;

// ---------------------------------------------------------------------------
// Graph types
// ---------------------------------------------------------------------------

/// A single step node with its forward and backward adjacency.
#[derive(Debug, Clone)]
pub struct StepNode {
    /// The step key.
    pub key: String,
    /// Step keys this step depends on.
    pub dependencies: Vec<String>,
    /// Step keys that depend on this step.
    pub dependents: Vec<String>,
}

/// Read-only dependency graph derived from a `WorkflowDefinition`.
///
/// Computed once per execution run and never mutated afterwards. If a cycle
/// exists, `build` fails and no levels or topological order are produced --
/// the graph is unusable for execution.
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    /// Node per step, keyed by step key.
    pub nodes: HashMap<String, StepNode>,
    /// Valid topological ordering of all step keys (concatenation of levels).
    pub topological_order: Vec<String>,
    /// Partition into levels: level *i* contains exactly the steps whose
    /// dependencies are all in levels `< i`.
    pub levels: Vec<Vec<String>>,
}

impl DependencyGraph {
    /// Build the dependency graph for a workflow.
    ///
    /// Fails with `WorkflowError::UnknownDependency` if a `dependencies`
    /// entry references a step key not declared in the workflow, and with
    /// `WorkflowError::Cycle` (carrying the full cycle path) if the graph is
    /// cyclic.
    pub fn build(def: &WorkflowDefinition) -> Result<Self, WorkflowError> {
        let key_to_pos: HashMap<&str, usize> = def
            .steps
            .iter()
            .enumerate()
            .map(|(i, s)| (s.key.as_str(), i))
            .collect();

        // Edge direction: dependency -> dependent.
        let mut graph = DiGraph::<&str, ()>::new();
        let node_indices: Vec<NodeIndex> = def
            .steps
            .iter()
            .map(|s| graph.add_node(s.key.as_str()))
            .collect();

        for step in &def.steps {
            let to = node_indices[key_to_pos[step.key.as_str()]];
            for dep in &step.dependencies {
                let from_pos = key_to_pos.get(dep.as_str()).ok_or_else(|| {
                    WorkflowError::UnknownDependency(format!(
                        "step '{}' depends on unknown step '{}'",
                        step.key, dep
                    ))
                })?;
                graph.add_edge(node_indices[*from_pos], to, ());
            }
        }

        if let Some(path) = find_cycle(&graph, &node_indices) {
            return Err(WorkflowError::Cycle {
                path: path.join(" -> "),
            });
        }

        let levels = kahn_levels(&graph, &node_indices);
        let topological_order: Vec<String> = levels.iter().flatten().cloned().collect();

        let mut nodes = HashMap::with_capacity(def.steps.len());
        for (i, step) in def.steps.iter().enumerate() {
            let dependents: Vec<String> = graph
                .neighbors(node_indices[i])
                .map(|n| graph[n].to_string())
                .collect();
            nodes.insert(
                step.key.clone(),
                StepNode {
                    key: step.key.clone(),
                    dependencies: step.dependencies.clone(),
                    dependents,
                },
            );
        }

        Ok(Self {
            nodes,
            topological_order,
            levels,
        })
    }

    /// The level index a step belongs to, if it exists.
    pub fn level_of(&self, key: &str) -> Option<usize> {
        self.levels
            .iter()
            .position(|level| level.iter().any(|k| k == key))
    }

    /// Total number of steps in the graph.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the graph contains no steps.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Cycle detection (DFS with explicit recursion stack)
// ---------------------------------------------------------------------------

/// Find the first cycle reachable in step-declaration order.
///
/// Returns the full cycle path including the repeated node, e.g.
/// `["x", "y", "x"]`, or `None` if the graph is acyclic.
fn find_cycle<'a>(graph: &DiGraph<&'a str, ()>, roots: &[NodeIndex]) -> Option<Vec<&'a str>> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Unvisited,
        OnStack,
        Done,
    }

    let mut marks = vec![Mark::Unvisited; graph.node_count()];
    let mut stack: Vec<NodeIndex> = Vec::new();

    fn visit<'a>(
        graph: &DiGraph<&'a str, ()>,
        node: NodeIndex,
        marks: &mut [Mark],
        stack: &mut Vec<NodeIndex>,
    ) -> Option<Vec<&'a str>> {
        marks[node.index()] = Mark::OnStack;
        stack.push(node);

        for next in graph.neighbors(node) {
            match marks[next.index()] {
                Mark::OnStack => {
                    // Cycle closed: slice the stack from the first occurrence
                    // of `next` and append it again to show the full loop.
                    let start = stack.iter().position(|&n| n == next).unwrap_or(0);
                    let mut path: Vec<&str> = stack[start..].iter().map(|&n| graph[n]).collect();
                    path.push(graph[next]);
                    return Some(path);
                }
                Mark::Unvisited => {
                    if let Some(path) = visit(graph, next, marks, stack) {
                        return Some(path);
                    }
                }
                Mark::Done => {}
            }
        }

        stack.pop();
        marks[node.index()] = Mark::Done;
        None
    }

    for &root in roots {
        if marks[root.index()] == Mark::Unvisited {
            if let Some(path) = visit(graph, root, &mut marks, &mut stack) {
                return Some(path);
            }
        }
    }
    None
}

// ---------------------------------------------------------------------------
// Level computation (Kahn's algorithm)
// ---------------------------------------------------------------------------

/// Partition an acyclic graph into levels via Kahn's algorithm.
///
/// Repeatedly collects all nodes whose in-degree is currently zero into the
/// next level, then decrements the in-degree of their dependents. Within a
/// level, steps keep their declaration order; no further ordering inside a
/// level is implied.
fn kahn_levels(graph: &DiGraph<&str, ()>, roots: &[NodeIndex]) -> Vec<Vec<String>> {
    let mut in_degree: Vec<usize> = roots
        .iter()
        .map(|&n| {
            graph
                .neighbors_directed(n, petgraph::Direction::Incoming)
                .count()
        })
        .collect();
    let mut placed = vec![false; roots.len()];
    let mut remaining = roots.len();
    let mut levels = Vec::new();

    while remaining > 0 {
        let ready: Vec<usize> = (0..roots.len())
            .filter(|&i| !placed[i] && in_degree[i] == 0)
            .collect();
        if ready.is_empty() {
            // Unreachable for acyclic graphs; cycle detection runs first.
            break;
        }

        let mut level = Vec::with_capacity(ready.len());
        for i in &ready {
            placed[*i] = true;
            remaining -= 1;
            level.push(graph[roots[*i]].to_string());
        }
        for i in &ready {
            for next in graph.neighbors(roots[*i]) {
                in_degree[next.index()] -= 1;
            }
        }
        levels.push(level);
    }

    levels
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
