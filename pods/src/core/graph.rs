//! Step dependency graph: validation, ordering, and cascade targets.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use crate::error::GraphError;

/// Validated DAG of workflow steps.
#[derive(Debug, Clone, Default)]
pub struct StepGraph {
    dependencies: BTreeMap<String, BTreeSet<String>>,
    dependents: BTreeMap<String, BTreeSet<String>>,
    order: Vec<String>,
}

impl StepGraph {
    /// Build from `(step_id, dependencies)` pairs.
    ///
    /// Rejects duplicate ids, dependencies on unknown steps, and cycles
    /// (including self-dependencies). A cycle error carries the cycle path.
    pub fn build<'a, I>(steps: I) -> Result<Self, GraphError>
    where
        I: IntoIterator<Item = (&'a str, &'a BTreeSet<String>)>,
    {
        let mut dependencies: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for (id, deps) in steps {
            if dependencies.insert(id.to_string(), deps.clone()).is_some() {
                return Err(GraphError::DuplicateStep(id.to_string()));
            }
        }

        let mut dependents: BTreeMap<String, BTreeSet<String>> = dependencies
            .keys()
            .map(|id| (id.clone(), BTreeSet::new()))
            .collect();
        for (id, deps) in &dependencies {
            for dep in deps {
                let Some(children) = dependents.get_mut(dep) else {
                    return Err(GraphError::UnknownDependency {
                        step: id.clone(),
                        dependency: dep.clone(),
                    });
                };
                children.insert(id.clone());
            }
        }

        if let Some(path) = find_cycle(&dependencies) {
            return Err(GraphError::Cycle { path });
        }

        let order = topological_order(&dependencies, &dependents);
        Ok(Self {
            dependencies,
            dependents,
            order,
        })
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn contains(&self, step_id: &str) -> bool {
        self.dependencies.contains_key(step_id)
    }

    pub fn dependencies(&self, step_id: &str) -> Option<&BTreeSet<String>> {
        self.dependencies.get(step_id)
    }

    /// Steps in dependency order; ties are broken by step id.
    pub fn topological_order(&self) -> &[String] {
        &self.order
    }

    /// Every step that depends on `step_id`, directly or transitively.
    pub fn transitive_dependents(&self, step_id: &str) -> BTreeSet<String> {
        let mut seen = BTreeSet::new();
        let mut queue: VecDeque<&str> = VecDeque::from([step_id]);
        while let Some(current) = queue.pop_front() {
            let Some(children) = self.dependents.get(current) else {
                continue;
            };
            for child in children {
                if seen.insert(child.clone()) {
                    queue.push_back(child);
                }
            }
        }
        seen
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Visiting,
    Done,
}

fn find_cycle(dependencies: &BTreeMap<String, BTreeSet<String>>) -> Option<Vec<String>> {
    let mut marks: BTreeMap<&str, Mark> = BTreeMap::new();
    let mut stack: Vec<&str> = Vec::new();
    for id in dependencies.keys() {
        if let Some(path) = visit(id, dependencies, &mut marks, &mut stack) {
            return Some(path);
        }
    }
    None
}

fn visit<'a>(
    id: &'a str,
    dependencies: &'a BTreeMap<String, BTreeSet<String>>,
    marks: &mut BTreeMap<&'a str, Mark>,
    stack: &mut Vec<&'a str>,
) -> Option<Vec<String>> {
    match marks.get(id) {
        Some(Mark::Done) => return None,
        Some(Mark::Visiting) => {
            let start = stack.iter().position(|entry| *entry == id).unwrap_or(0);
            let mut path: Vec<String> = stack[start..].iter().map(|s| (*s).to_string()).collect();
            path.push(id.to_string());
            return Some(path);
        }
        None => {}
    }

    marks.insert(id, Mark::Visiting);
    stack.push(id);
    if let Some(deps) = dependencies.get(id) {
        for dep in deps {
            if let Some(path) = visit(dep, dependencies, marks, stack) {
                return Some(path);
            }
        }
    }
    stack.pop();
    marks.insert(id, Mark::Done);
    None
}

fn topological_order(
    dependencies: &BTreeMap<String, BTreeSet<String>>,
    dependents: &BTreeMap<String, BTreeSet<String>>,
) -> Vec<String> {
    let mut remaining: BTreeMap<&str, usize> = dependencies
        .iter()
        .map(|(id, deps)| (id.as_str(), deps.len()))
        .collect();
    let mut ready: BTreeSet<&str> = remaining
        .iter()
        .filter(|(_, count)| **count == 0)
        .map(|(id, _)| *id)
        .collect();

    let mut order = Vec::with_capacity(dependencies.len());
    while let Some(id) = ready.pop_first() {
        order.push(id.to_string());
        for child in dependents.get(id).into_iter().flatten() {
            if let Some(count) = remaining.get_mut(child.as_str()) {
                *count -= 1;
                if *count == 0 {
                    ready.insert(child.as_str());
                }
            }
        }
    }
    order
}

#[cfg(test)]
mod tests {
    use super::*;

    fn deps(ids: &[&str]) -> BTreeSet<String> {
        ids.iter().map(|id| (*id).to_string()).collect()
    }

    fn build(steps: &[(&str, BTreeSet<String>)]) -> Result<StepGraph, GraphError> {
        StepGraph::build(steps.iter().map(|(id, d)| (*id, d)))
    }

    #[test]
    fn orders_dependencies_first() {
        let graph = build(&[
            ("c", deps(&["a"])),
            ("b", deps(&["a"])),
            ("a", deps(&[])),
            ("d", deps(&["b", "c"])),
        ])
        .expect("valid graph");
        assert_eq!(graph.topological_order(), ["a", "b", "c", "d"]);
    }

    #[test]
    fn transitive_dependents_follow_every_path() {
        let graph = build(&[
            ("a", deps(&[])),
            ("b", deps(&["a"])),
            ("c", deps(&["b"])),
            ("x", deps(&[])),
        ])
        .expect("valid graph");
        assert_eq!(graph.transitive_dependents("a"), deps(&["b", "c"]));
        assert!(graph.transitive_dependents("x").is_empty());
    }

    #[test]
    fn rejects_cycles_with_path() {
        let err = build(&[
            ("a", deps(&["c"])),
            ("b", deps(&["a"])),
            ("c", deps(&["b"])),
        ])
        .expect_err("cycle");
        let GraphError::Cycle { path } = err else {
            panic!("expected cycle error");
        };
        assert_eq!(path.first(), path.last());
        assert_eq!(path.len(), 4);
    }

    #[test]
    fn rejects_self_dependency() {
        let err = build(&[("a", deps(&["a"]))]).expect_err("self cycle");
        assert!(matches!(err, GraphError::Cycle { path } if path == ["a", "a"]));
    }

    #[test]
    fn rejects_duplicates_and_unknown_dependencies() {
        let dup = build(&[("a", deps(&[])), ("a", deps(&[]))]).expect_err("duplicate");
        assert!(matches!(dup, GraphError::DuplicateStep(id) if id == "a"));

        let dangling = build(&[("a", deps(&["ghost"]))]).expect_err("dangling");
        assert!(matches!(
            dangling,
            GraphError::UnknownDependency { step, dependency } if step == "a" && dependency == "ghost"
        ));
    }
}
