//! Task dependency graph: cycle detection, topological order and parallel
//! waves.
//!
//! Uses `petgraph` to model parent edges as a directed graph. Topological
//! sort detects cycles, and depth-based grouping produces waves where every
//! task in a wave can run concurrently once the previous waves finish.

use std::collections::{HashMap, HashSet};

use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use taskloom_types::workflow::TaskSpec;

use super::definition::WorkflowError;

/// Build the graph with an edge from each parent to its child.
fn build_graph(tasks: &[TaskSpec]) -> Result<(DiGraph<&str, ()>, Vec<NodeIndex>), WorkflowError> {
    let name_to_idx: HashMap<&str, usize> = tasks
        .iter()
        .enumerate()
        .map(|(i, t)| (t.name.as_str(), i))
        .collect();

    let mut graph = DiGraph::<&str, ()>::new();
    let nodes: Vec<_> = tasks.iter().map(|t| graph.add_node(t.name.as_str())).collect();

    for (to_idx, task) in tasks.iter().enumerate() {
        for parent in &task.parents {
            let from_idx = name_to_idx.get(parent.as_str()).ok_or_else(|| {
                WorkflowError::UnknownParentReference {
                    task: task.name.clone(),
                    parent: parent.clone(),
                }
            })?;
            graph.add_edge(nodes[*from_idx], nodes[to_idx], ());
        }
    }

    Ok((graph, nodes))
}

fn sorted<'g>(graph: &DiGraph<&'g str, ()>) -> Result<Vec<NodeIndex>, WorkflowError> {
    toposort(graph, None).map_err(|cycle| {
        let name = graph[cycle.node_id()];
        WorkflowError::CycleDetected(format!("cycle detected involving task '{name}'"))
    })
}

// ---------------------------------------------------------------------------
// Validation and ordering
// ---------------------------------------------------------------------------

/// Validate that tasks form a DAG (no cycles, all parents exist).
pub fn validate_dag(tasks: &[TaskSpec]) -> Result<(), WorkflowError> {
    let (graph, _) = build_graph(tasks)?;
    sorted(&graph)?;
    Ok(())
}

/// Indices of `tasks` in a topological order (parents before children).
///
/// Ties keep declaration order where the graph allows it.
pub fn topological_order(tasks: &[TaskSpec]) -> Result<Vec<usize>, WorkflowError> {
    let (graph, _) = build_graph(tasks)?;
    // Fail on cycles first so the error names a task on the cycle.
    sorted(&graph)?;

    // Kahn's algorithm over declaration order for a stable result.
    let mut indegree: Vec<usize> = tasks.iter().map(|t| t.parents.len()).collect();
    let mut done = vec![false; tasks.len()];
    let mut order = Vec::with_capacity(tasks.len());
    while order.len() < tasks.len() {
        let Some(next) = (0..tasks.len()).find(|&i| !done[i] && indegree[i] == 0) else {
            return Err(WorkflowError::CycleDetected(
                "cycle detected while ordering tasks".to_string(),
            ));
        };
        done[next] = true;
        order.push(next);
        let name = tasks[next].name.as_str();
        for (i, task) in tasks.iter().enumerate() {
            let edges = task.parents.iter().filter(|p| p.as_str() == name).count();
            indegree[i] = indegree[i].saturating_sub(edges);
        }
    }
    Ok(order)
}

// ---------------------------------------------------------------------------
// Execution plan (wave computation)
// ---------------------------------------------------------------------------

/// Group tasks into parallel waves by depth.
///
/// Returns `Vec<Vec<&TaskSpec>>` where index 0 holds the root tasks.
pub fn build_execution_plan(tasks: &[TaskSpec]) -> Result<Vec<Vec<&TaskSpec>>, WorkflowError> {
    if tasks.is_empty() {
        return Ok(vec![]);
    }

    let by_name: HashMap<&str, &TaskSpec> = tasks.iter().map(|t| (t.name.as_str(), t)).collect();
    let (graph, _) = build_graph(tasks)?;
    let order = sorted(&graph)?;

    // Root tasks have depth 0.
    let mut depths: HashMap<&str, usize> = HashMap::new();
    for node in order {
        let name = graph[node];
        let task = by_name[name];
        let depth = task
            .parents
            .iter()
            .map(|p| depths.get(p.as_str()).copied().unwrap_or(0) + 1)
            .max()
            .unwrap_or(0);
        depths.insert(name, depth);
    }

    let max_depth = depths.values().copied().max().unwrap_or(0);
    let mut waves: Vec<Vec<&TaskSpec>> = vec![vec![]; max_depth + 1];
    for task in tasks {
        waves[depths[task.name.as_str()]].push(task);
    }

    Ok(waves)
}

// ---------------------------------------------------------------------------
// Transitive closure
// ---------------------------------------------------------------------------

/// All transitive parents of `name`, sorted. Empty if `name` is unknown.
pub fn ancestors<'a>(name: &str, tasks: &'a [TaskSpec]) -> Vec<&'a str> {
    let by_name: HashMap<&str, &TaskSpec> = tasks.iter().map(|t| (t.name.as_str(), t)).collect();

    let mut visited: HashSet<&'a str> = HashSet::new();
    let mut stack = vec![name];
    while let Some(current) = stack.pop() {
        if let Some(task) = by_name.get(current) {
            for parent in &task.parents {
                if visited.insert(parent.as_str()) {
                    stack.push(parent.as_str());
                }
            }
        }
    }

    let mut out: Vec<&str> = visited.into_iter().collect();
    out.sort_unstable();
    out
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
