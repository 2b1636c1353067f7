//! PRD dependency DAG: cycle detection and execution-level layering (§4.G).
//!
//! Nodes are PRD ids, edges are `relationships.dependsOn`. The technique is
//! the one the Loop Manager uses for loop dependency graphs — DFS with an
//! explicit recursion stack for cycle detection, Kahn-style layering for
//! execution order — generalized so a cycle reports the actual cycle path
//! rather than just "a cycle exists somewhere".

use std::collections::{HashMap, HashSet, VecDeque};

use thiserror::Error;

use crate::domain::{ExecutionLevel, Prd};

#[derive(Debug, Error)]
pub enum DagError {
    #[error("dependency cycle detected: {}", .0.join(" → "))]
    Cycle(Vec<String>),
    #[error("PRD {prd} depends on unknown PRD {dependency}")]
    UnknownDependency { prd: String, dependency: String },
}

/// Adjacency view over a set of PRDs, built once and reused by both the
/// cycle check and the layering pass.
pub struct PrdDag {
    edges: HashMap<String, Vec<String>>,
}

impl PrdDag {
    pub fn new(prds: &[Prd]) -> Self {
        let edges = prds
            .iter()
            .map(|p| (p.id.clone(), p.dependencies.iter().map(|d| d.id().to_string()).collect()))
            .collect();
        Self { edges }
    }

    /// Depth-first cycle check. On failure, the returned path is the actual
    /// cycle, e.g. `["A", "B", "C", "A"]` so it can be rendered as
    /// `A → B → C → A`.
    pub fn check_cycles(&self) -> Result<(), DagError> {
        for id in self.edges.keys() {
            for dep in &self.edges[id] {
                if !self.edges.contains_key(dep) {
                    return Err(DagError::UnknownDependency {
                        prd: id.clone(),
                        dependency: dep.clone(),
                    });
                }
            }
        }

        let mut visited = HashSet::new();
        let mut rec_stack = HashSet::new();
        let mut path = Vec::new();

        let mut ids: Vec<&String> = self.edges.keys().collect();
        ids.sort();
        for id in ids {
            if !visited.contains(id.as_str())
                && let Some(cycle) = self.dfs(id, &mut visited, &mut rec_stack, &mut path)
            {
                return Err(DagError::Cycle(cycle));
            }
        }
        Ok(())
    }

    fn dfs<'a>(
        &'a self,
        node: &'a str,
        visited: &mut HashSet<&'a str>,
        rec_stack: &mut HashSet<&'a str>,
        path: &mut Vec<String>,
    ) -> Option<Vec<String>> {
        visited.insert(node);
        rec_stack.insert(node);
        path.push(node.to_string());

        if let Some(deps) = self.edges.get(node) {
            for dep in deps {
                if !visited.contains(dep.as_str()) {
                    if let Some(cycle) = self.dfs(dep, visited, rec_stack, path) {
                        return Some(cycle);
                    }
                } else if rec_stack.contains(dep.as_str()) {
                    let start = path.iter().position(|n| n == dep).unwrap_or(0);
                    let mut cycle: Vec<String> = path[start..].to_vec();
                    cycle.push(dep.clone());
                    return Some(cycle);
                }
            }
        }

        rec_stack.remove(node);
        path.pop();
        None
    }

    /// Kahn-style layering: level 0 holds every PRD with no dependencies,
    /// level N holds PRDs whose dependencies all resolved in levels `< N`.
    /// Members of one level carry no ordering constraint among themselves,
    /// which is what lets the orchestrator dispatch them concurrently.
    pub fn execution_levels(&self) -> Result<Vec<ExecutionLevel>, DagError> {
        self.check_cycles()?;

        let mut indegree: HashMap<&str, usize> = self.edges.keys().map(|k| (k.as_str(), 0)).collect();
        let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
        for (id, deps) in &self.edges {
            *indegree.get_mut(id.as_str()).unwrap() += deps.len();
            for dep in deps {
                dependents.entry(dep.as_str()).or_default().push(id.as_str());
            }
        }

        let mut levels = Vec::new();
        let mut frontier: VecDeque<&str> = indegree
            .iter()
            .filter(|&(_, &deg)| deg == 0)
            .map(|(&id, _)| id)
            .collect();
        let mut frontier_vec: Vec<&str> = frontier.drain(..).collect();
        frontier_vec.sort();

        let mut remaining = indegree;
        while !frontier_vec.is_empty() {
            levels.push(frontier_vec.iter().map(|s| s.to_string()).collect());

            let mut next = Vec::new();
            for node in &frontier_vec {
                if let Some(deps) = dependents.get(node) {
                    for &dependent in deps {
                        let entry = remaining.get_mut(dependent).unwrap();
                        *entry -= 1;
                        if *entry == 0 {
                            next.push(dependent);
                        }
                    }
                }
            }
            next.sort();
            next.dedup();
            frontier_vec = next;
        }

        Ok(levels)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{PrdDependency, PrdStatus};

    fn prd(id: &str, deps: &[&str]) -> Prd {
        Prd {
            id: id.to_string(),
            version: "1.0".to_string(),
            status: PrdStatus::Ready,
            parent_prd: None,
            prd_sequence: None,
            dependencies: deps.iter().map(|d| PrdDependency::Id(d.to_string())).collect(),
            phases: Vec::new(),
            id_pattern: "TASK-{id}".to_string(),
            testing_dir: "tests".to_string(),
            config: None,
        }
    }

    #[test]
    fn linear_chain_layers_one_per_level() {
        let prds = vec![prd("A", &[]), prd("B", &["A"]), prd("C", &["B"])];
        let dag = PrdDag::new(&prds);
        let levels = dag.execution_levels().unwrap();
        assert_eq!(levels, vec![vec!["A".to_string()], vec!["B".to_string()], vec!["C".to_string()]]);
    }

    #[test]
    fn independent_prds_share_a_level() {
        let prds = vec![prd("A", &[]), prd("B", &[]), prd("C", &["A", "B"])];
        let dag = PrdDag::new(&prds);
        let levels = dag.execution_levels().unwrap();
        assert_eq!(levels[0], vec!["A".to_string(), "B".to_string()]);
        assert_eq!(levels[1], vec!["C".to_string()]);
    }

    #[test]
    fn cycle_is_reported_with_full_path() {
        let prds = vec![prd("A", &["C"]), prd("B", &["A"]), prd("C", &["B"])];
        let dag = PrdDag::new(&prds);
        let err = dag.check_cycles().unwrap_err();
        match err {
            DagError::Cycle(path) => {
                assert_eq!(path.first(), path.last());
                assert!(path.len() >= 2);
            }
            other => panic!("expected Cycle, got {other:?}"),
        }
    }

    #[test]
    fn unknown_dependency_is_reported() {
        let prds = vec![prd("A", &["GHOST"])];
        let dag = PrdDag::new(&prds);
        let err = dag.check_cycles().unwrap_err();
        assert!(matches!(err, DagError::UnknownDependency { .. }));
    }

    #[test]
    fn self_dependency_is_a_cycle() {
        let prds = vec![prd("A", &["A"])];
        let dag = PrdDag::new(&prds);
        assert!(dag.check_cycles().is_err());
    }

    proptest::proptest! {
        /// Every PRD with dependencies only on lower-indexed PRDs is acyclic
        /// by construction; for any such graph, every dependency must land
        /// in a strictly earlier level than its dependent.
        #[test]
        fn execution_levels_place_every_dependency_in_an_earlier_level(
            edge_bits in proptest::collection::vec(proptest::collection::vec(proptest::bool::ANY, 0..6), 1..8)
        ) {
            let n = edge_bits.len();
            let ids: Vec<String> = (0..n).map(|i| format!("P{i}")).collect();
            let prds: Vec<Prd> = (0..n)
                .map(|i| {
                    let deps: Vec<&str> = (0..i)
                        .filter(|&j| edge_bits[i].get(j).copied().unwrap_or(false))
                        .map(|j| ids[j].as_str())
                        .collect();
                    prd(&ids[i], &deps)
                })
                .collect();

            let dag = PrdDag::new(&prds);
            let levels = dag.execution_levels().unwrap();

            let mut level_of = std::collections::HashMap::new();
            for (idx, level) in levels.iter().enumerate() {
                for id in level {
                    level_of.insert(id.clone(), idx);
                }
            }

            for p in &prds {
                let my_level = level_of[&p.id];
                for dep in &p.dependencies {
                    let dep_level = level_of[dep.id()];
                    proptest::prop_assert!(dep_level < my_level);
                }
            }

            let total: usize = levels.iter().map(|l| l.len()).sum();
            proptest::prop_assert_eq!(total, n);
        }
    }
}
