//! Step dependency ordering.

use crate::errors::CycleDetectedError;
use indexmap::IndexMap;
use std::collections::HashSet;

/// Orders steps so every step comes after its dependencies.
///
/// Roots are visited in declaration order and each step's dependencies in
/// the order they were found, so the result is deterministic.
///
/// # Errors
///
/// Returns the first cycle found, with the step at which it closes and the
/// path around it.
pub fn topological_order(
    declared: &[String],
    dependencies: &IndexMap<String, Vec<String>>,
) -> Result<Vec<String>, CycleDetectedError> {
    let mut visited = HashSet::new();
    let mut in_stack = HashSet::new();
    let mut order = Vec::with_capacity(declared.len());
    let mut path = Vec::new();

    fn dfs(
        node: &str,
        dependencies: &IndexMap<String, Vec<String>>,
        visited: &mut HashSet<String>,
        in_stack: &mut HashSet<String>,
        order: &mut Vec<String>,
        path: &mut Vec<String>,
    ) -> Result<(), CycleDetectedError> {
        if in_stack.contains(node) {
            let start_idx = path.iter().position(|n| n == node).unwrap_or(0);
            let mut cycle_path: Vec<String> = path[start_idx..].to_vec();
            cycle_path.push(node.to_string());
            return Err(CycleDetectedError::new(node, cycle_path));
        }

        if visited.contains(node) {
            return Ok(());
        }

        visited.insert(node.to_string());
        in_stack.insert(node.to_string());
        path.push(node.to_string());

        if let Some(deps) = dependencies.get(node) {
            for dep in deps {
                dfs(dep, dependencies, visited, in_stack, order, path)?;
            }
        }

        in_stack.remove(node);
        path.pop();
        order.push(node.to_string());
        Ok(())
    }

    for node in declared {
        dfs(
            node,
            dependencies,
            &mut visited,
            &mut in_stack,
            &mut order,
            &mut path,
        )?;
    }

    Ok(order)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn graph(edges: &[(&str, &[&str])]) -> (Vec<String>, IndexMap<String, Vec<String>>) {
        let declared = edges.iter().map(|(n, _)| (*n).to_string()).collect();
        let deps = edges
            .iter()
            .map(|(n, d)| {
                (
                    (*n).to_string(),
                    d.iter().map(|s| (*s).to_string()).collect(),
                )
            })
            .collect();
        (declared, deps)
    }

    #[test]
    fn test_dependencies_come_first() {
        let (declared, deps) = graph(&[
            ("report", &["joined"]),
            ("orders", &[]),
            ("joined", &["orders", "customers"]),
            ("customers", &[]),
        ]);
        let order = topological_order(&declared, &deps).unwrap();

        assert_eq!(order, vec!["orders", "customers", "joined", "report"]);
        for (node, node_deps) in &deps {
            let at = order.iter().position(|n| n == node).unwrap();
            for dep in node_deps {
                assert!(order.iter().position(|n| n == dep).unwrap() < at);
            }
        }
    }

    #[test]
    fn test_independent_steps_keep_declaration_order() {
        let (declared, deps) = graph(&[("b", &[]), ("a", &[]), ("c", &[])]);
        assert_eq!(topological_order(&declared, &deps).unwrap(), vec!["b", "a", "c"]);
    }

    #[test]
    fn test_cycle_reports_path() {
        let (declared, deps) = graph(&[("a", &["c"]), ("b", &["a"]), ("c", &["b"])]);
        let err = topological_order(&declared, &deps).unwrap_err();

        assert_eq!(err.step, "a");
        assert_eq!(err.cycle_path, vec!["a", "c", "b", "a"]);
    }

    #[test]
    fn test_self_dependency_is_a_cycle() {
        let (declared, deps) = graph(&[("a", &["a"])]);
        let err = topological_order(&declared, &deps).unwrap_err();
        assert_eq!(err.cycle_path, vec!["a", "a"]);
    }
}
