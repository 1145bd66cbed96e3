use std::collections::{BTreeSet, HashMap, HashSet};

use crate::types::AgentId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencyCycle {
    /// Walk from the starting agent; ends at the start again unless the
    /// depth limit cut the walk short.
    pub path: Vec<AgentId>,
    pub depth_limited: bool,
}

/// Depth-first walk of `start`'s dependencies.
///
/// Reports a cycle when the walk returns to `start`, or when it would go
/// deeper than `max_depth` edges. Agents that merely depend on a cycle they
/// are not part of are not reported; the members are.
pub fn find_cycle(
    start: &str,
    graph: &HashMap<AgentId, BTreeSet<AgentId>>,
    max_depth: usize,
) -> Option<DependencyCycle> {
    let mut path = vec![start.to_string()];
    let mut visited = HashSet::new();
    walk(start, start, graph, max_depth, &mut path, &mut visited)
}

fn walk(
    start: &str,
    node: &str,
    graph: &HashMap<AgentId, BTreeSet<AgentId>>,
    max_depth: usize,
    path: &mut Vec<AgentId>,
    visited: &mut HashSet<AgentId>,
) -> Option<DependencyCycle> {
    let deps = graph.get(node)?;

    for dep in deps {
        if dep == start {
            let mut cycle = path.clone();
            cycle.push(dep.clone());
            return Some(DependencyCycle {
                path: cycle,
                depth_limited: false,
            });
        }
        if path.contains(dep) || !visited.insert(dep.clone()) {
            continue;
        }
        if path.len() > max_depth {
            return Some(DependencyCycle {
                path: path.clone(),
                depth_limited: true,
            });
        }

        path.push(dep.clone());
        if let Some(cycle) = walk(start, dep, graph, max_depth, path, visited) {
            return Some(cycle);
        }
        path.pop();
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn graph(edges: &[(&str, &[&str])]) -> HashMap<AgentId, BTreeSet<AgentId>> {
        edges
            .iter()
            .map(|(node, deps)| {
                (
                    node.to_string(),
                    deps.iter().map(|d| d.to_string()).collect(),
                )
            })
            .collect()
    }

    #[test]
    fn test_acyclic_graph() {
        let g = graph(&[("a", &["b", "c"]), ("b", &["c"]), ("c", &[])]);
        assert!(find_cycle("a", &g, 10).is_none());
    }

    #[test]
    fn test_direct_cycle() {
        let g = graph(&[("a", &["b"]), ("b", &["a"])]);
        let cycle = find_cycle("a", &g, 10).unwrap();
        assert_eq!(cycle.path, vec!["a", "b", "a"]);
        assert!(!cycle.depth_limited);
    }

    #[test]
    fn test_self_dependency() {
        let g = graph(&[("a", &["a"])]);
        assert_eq!(find_cycle("a", &g, 10).unwrap().path, vec!["a", "a"]);
    }

    #[test]
    fn test_upstream_of_cycle_not_reported() {
        let g = graph(&[("a", &["b"]), ("b", &["c"]), ("c", &["b"])]);
        assert!(find_cycle("a", &g, 10).is_none());
        assert!(find_cycle("b", &g, 10).is_some());
    }

    #[test]
    fn test_depth_limit() {
        let names: Vec<String> = (0..13).map(|i| format!("n{}", i)).collect();
        let g: HashMap<AgentId, BTreeSet<AgentId>> = names
            .windows(2)
            .map(|w| (w[0].clone(), BTreeSet::from([w[1].clone()])))
            .collect();

        let cycle = find_cycle("n0", &g, 10).unwrap();
        assert!(cycle.depth_limited);
        assert_eq!(cycle.path.len(), 11);
    }

    #[test]
    fn test_unknown_dependency_terminates() {
        let g = graph(&[("a", &["ghost"])]);
        assert!(find_cycle("a", &g, 10).is_none());
    }
}
