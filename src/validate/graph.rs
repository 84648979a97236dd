//! Service dependency graph

use crate::spec::Spec;
use std::collections::{BTreeSet, HashMap};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mark {
    Unvisited,
    Visiting,
    Visited,
}

/// Adjacency over service indices, edges in declaration order
pub struct DependencyGraph<'a> {
    names: Vec<&'a str>,
    edges: Vec<Vec<usize>>,
}

impl<'a> DependencyGraph<'a> {
    /// Build the graph from a spec. Dependencies on unknown services are
    /// dropped; reference checking reports those separately.
    pub fn new(spec: &'a Spec) -> Self {
        let mut index: HashMap<&str, usize> = HashMap::new();
        let mut names = Vec::with_capacity(spec.services.len());
        for service in &spec.services {
            if !index.contains_key(service.name.as_str()) {
                index.insert(service.name.as_str(), names.len());
                names.push(service.name.as_str());
            }
        }

        let mut edges = vec![Vec::new(); names.len()];
        for service in &spec.services {
            let Some(&from) = index.get(service.name.as_str()) else {
                continue;
            };
            for dep in &service.depends_on {
                if let Some(&to) = index.get(dep.as_str()) {
                    if !edges[from].contains(&to) {
                        edges[from].push(to);
                    }
                }
            }
        }

        Self { names, edges }
    }

    /// Every distinct dependency cycle, members in discovery order.
    ///
    /// Depth-first with an explicit stack of (node, next edge) frames so
    /// deep chains do not grow the call stack.
    pub fn cycles(&self) -> Vec<Vec<String>> {
        let mut marks = vec![Mark::Unvisited; self.names.len()];
        let mut seen: Vec<BTreeSet<usize>> = Vec::new();
        let mut cycles = Vec::new();

        for root in 0..self.names.len() {
            if marks[root] != Mark::Unvisited {
                continue;
            }

            let mut stack: Vec<(usize, usize)> = vec![(root, 0)];
            marks[root] = Mark::Visiting;

            while let Some(frame) = stack.last_mut() {
                let (node, next_edge) = *frame;
                let Some(&next) = self.edges[node].get(next_edge) else {
                    marks[node] = Mark::Visited;
                    stack.pop();
                    continue;
                };
                frame.1 += 1;

                match marks[next] {
                    Mark::Unvisited => {
                        marks[next] = Mark::Visiting;
                        stack.push((next, 0));
                    }
                    Mark::Visiting => {
                        let start = stack.iter().position(|(n, _)| *n == next).unwrap_or(0);
                        let members: Vec<usize> = stack[start..].iter().map(|(n, _)| *n).collect();
                        let key: BTreeSet<usize> = members.iter().copied().collect();
                        if !seen.contains(&key) {
                            seen.push(key);
                            cycles.push(
                                members.iter().map(|&n| self.names[n].to_string()).collect(),
                            );
                        }
                    }
                    Mark::Visited => {}
                }
            }
        }

        cycles
    }

    /// Services ordered so each comes after its dependencies.
    ///
    /// Returns the offending cycle when no such order exists.
    pub fn start_order(&self) -> std::result::Result<Vec<String>, Vec<String>> {
        if let Some(cycle) = self.cycles().into_iter().next() {
            return Err(cycle);
        }

        let mut marks = vec![Mark::Unvisited; self.names.len()];
        let mut order = Vec::with_capacity(self.names.len());
        for root in 0..self.names.len() {
            if marks[root] != Mark::Unvisited {
                continue;
            }
            let mut stack: Vec<(usize, usize)> = vec![(root, 0)];
            marks[root] = Mark::Visiting;
            while let Some(frame) = stack.last_mut() {
                let (node, next_edge) = *frame;
                match self.edges[node].get(next_edge) {
                    Some(&next) => {
                        frame.1 += 1;
                        if marks[next] == Mark::Unvisited {
                            marks[next] = Mark::Visiting;
                            stack.push((next, 0));
                        }
                    }
                    None => {
                        marks[node] = Mark::Visited;
                        order.push(self.names[node].to_string());
                        stack.pop();
                    }
                }
            }
        }
        Ok(order)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spec::ServiceDef;

    fn chain(edges: &[(&str, &[&str])]) -> Spec {
        let mut spec = Spec::new();
        for (name, deps) in edges {
            let mut service = ServiceDef::new(name, "app:1");
            for dep in *deps {
                service = service.depends_on(dep);
            }
            spec = spec.with_service(service);
        }
        spec
    }

    #[test]
    fn test_start_order() {
        let spec = chain(&[("web", &["api"]), ("api", &["db"]), ("db", &[])]);
        let order = DependencyGraph::new(&spec).start_order().unwrap();
        assert_eq!(order, vec!["db", "api", "web"]);
    }

    #[test]
    fn test_two_node_cycle() {
        let spec = chain(&[("a", &["b"]), ("b", &["a"])]);
        let cycles = DependencyGraph::new(&spec).cycles();
        assert_eq!(cycles, vec![vec!["a".to_string(), "b".to_string()]]);
        assert!(DependencyGraph::new(&spec).start_order().is_err());
    }

    #[test]
    fn test_self_dependency() {
        let spec = chain(&[("a", &["a"])]);
        assert_eq!(DependencyGraph::new(&spec).cycles(), vec![vec!["a".to_string()]]);
    }

    #[test]
    fn test_cycle_reported_once() {
        let spec = chain(&[
            ("x", &["a"]),
            ("a", &["b"]),
            ("b", &["c"]),
            ("c", &["a"]),
            ("d", &["b"]),
        ]);
        let cycles = DependencyGraph::new(&spec).cycles();
        assert_eq!(cycles.len(), 1);
        assert_eq!(cycles[0], vec!["a", "b", "c"]);
    }

    #[test]
    fn test_deep_chain_does_not_recurse() {
        let names: Vec<String> = (0..5000).map(|i| format!("s{}", i)).collect();
        let mut spec = Spec::new();
        for (i, name) in names.iter().enumerate() {
            let mut service = ServiceDef::new(name, "app:1");
            if let Some(next) = names.get(i + 1) {
                service = service.depends_on(next);
            }
            spec = spec.with_service(service);
        }
        let graph = DependencyGraph::new(&spec);
        assert!(graph.cycles().is_empty());
        assert_eq!(graph.start_order().unwrap().first().map(String::as_str), Some("s4999"));
    }

    #[test]
    fn test_unknown_dependencies_ignored() {
        let spec = chain(&[("web", &["ghost"])]);
        assert!(DependencyGraph::new(&spec).cycles().is_empty());
    }
}
