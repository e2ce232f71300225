use flowcore::{Flow, GraphError};
use petgraph::algo::toposort;
use petgraph::graph::DiGraph;
use std::collections::HashMap;

/// Report structural problems of a flow.
///
/// Nothing here blocks execution: dangling ids are skipped at run time and
/// cycles are legal for flows that loop under guard scripts.
pub fn validate_flow(flow: &Flow) -> Vec<GraphError> {
    let mut errors = Vec::new();

    if flow.actions.is_empty() {
        errors.push(GraphError::Invalid("flow has no actions".to_string()));
        return errors;
    }

    let mut graph = DiGraph::<&str, ()>::new();
    let mut index = HashMap::new();
    for action in &flow.actions {
        if action.id.is_empty() {
            errors.push(GraphError::Invalid("action without id".to_string()));
            continue;
        }
        if index.contains_key(action.id.as_str()) {
            errors.push(GraphError::DuplicateAction(action.id.clone()));
            continue;
        }
        index.insert(action.id.as_str(), graph.add_node(action.id.as_str()));
    }

    for link in &flow.links {
        match (index.get(link.source_id.as_str()), index.get(link.target_id.as_str())) {
            (Some(source), Some(target)) => {
                if link.active {
                    graph.add_edge(*source, *target, ());
                }
            }
            (None, _) => errors.push(GraphError::ActionNotFound(link.source_id.clone())),
            (_, None) => errors.push(GraphError::ActionNotFound(link.target_id.clone())),
        }
        if link.source_id == link.target_id {
            errors.push(GraphError::InvalidLink(format!(
                "{} links to itself",
                link.source_id
            )));
        }
    }

    if flow.start_action_ids().is_empty() {
        errors.push(GraphError::Invalid("flow has no start action".to_string()));
    }

    if toposort(&graph, None).is_err() {
        errors.push(GraphError::CyclicDependency);
    }

    errors
}
