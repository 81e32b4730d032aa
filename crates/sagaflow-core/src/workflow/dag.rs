//! Step tree flattening and dependency cycle detection.
//!
//! Step units nest (parallel branches, conditional cases), but step ids and
//! `dependsOn` edges are workflow-wide. This module flattens the tree and uses
//! `petgraph` to model the dependency edges as a directed graph whose
//! topological sort detects cycles before a run starts.

use std::collections::HashMap;

use petgraph::algo::toposort;
use petgraph::graph::DiGraph;
use sagaflow_types::workflow::{CompensationStep, StepUnit};

use super::definition::WorkflowError;

// ---------------------------------------------------------------------------
// Flattening
// ---------------------------------------------------------------------------

/// All units of a step tree in pre-order (a unit before its children).
pub fn flatten_steps(steps: &[StepUnit]) -> Vec<&StepUnit> {
    let mut out = Vec::new();
    flatten_into(steps, &mut out);
    out
}

fn flatten_into<'a>(steps: &'a [StepUnit], out: &mut Vec<&'a StepUnit>) {
    for unit in steps {
        out.push(unit);
        for child in unit.children() {
            flatten_into(child, out);
        }
    }
}

/// Index of every compensation unit by id, wherever it is declared.
pub fn compensation_index(steps: &[StepUnit]) -> HashMap<String, CompensationStep> {
    flatten_steps(steps)
        .into_iter()
        .filter_map(|unit| match unit {
            StepUnit::Compensation(comp) => Some((comp.id.clone(), comp.clone())),
            _ => None,
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Cycle detection
// ---------------------------------------------------------------------------

/// Verify that the `dependsOn` edges across the whole tree form a DAG.
///
/// Edges to unknown ids are ignored here; at run time such a dependency is
/// simply unmet. The first occurrence of a duplicated id wins.
pub fn check_acyclic(steps: &[StepUnit]) -> Result<(), WorkflowError> {
    let flat = flatten_steps(steps);

    let mut graph = DiGraph::<&str, ()>::new();
    let mut id_to_node = HashMap::new();
    for unit in &flat {
        id_to_node
            .entry(unit.id())
            .or_insert_with(|| graph.add_node(unit.id()));
    }

    // Edge from dependency -> dependent
    for unit in &flat {
        let to = id_to_node[unit.id()];
        for dep in unit.depends_on() {
            if let Some(&from) = id_to_node.get(dep.as_str()) {
                graph.add_edge(from, to, ());
            }
        }
    }

    toposort(&graph, None).map_err(|cycle| {
        let node_id = graph[cycle.node_id()];
        WorkflowError::CyclicDependency(format!("cycle detected involving step '{node_id}'"))
    })?;

    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
