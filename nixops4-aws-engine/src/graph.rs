//! Ordering resources by their dependencies.

use crate::{registry::Registry, resource::ResourceRef};
use nixops4_aws_core::{ConfigurationError, Definition};
use nixops4_aws_state::ResourceRecord;
use std::collections::{BTreeMap, BTreeSet};

/// An acyclic "converge after" relation over resource names, with a total
/// order consistent with it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencyGraph {
    dependencies: BTreeMap<String, BTreeSet<String>>,
    order: Vec<String>,
}

impl DependencyGraph {
    /// Build the graph from each resource's dependencies. Dependencies on
    /// names that are not keys of `dependencies` are dropped.
    ///
    /// Fails with [`ConfigurationError::Cycle`] naming the resources of one cycle.
    pub fn new(
        mut dependencies: BTreeMap<String, BTreeSet<String>>,
    ) -> Result<Self, ConfigurationError> {
        let names: BTreeSet<String> = dependencies.keys().cloned().collect();
        for deps in dependencies.values_mut() {
            deps.retain(|d| names.contains(d));
        }
        let order = topological_order(&dependencies)
            .map_err(|cycle| ConfigurationError::Cycle { cycle })?;
        Ok(DependencyGraph {
            dependencies,
            order,
        })
    }

    /// The graph induced by [`ResourceRef::create_after`] over a deployment.
    pub fn from_definitions(
        registry: &Registry,
        definitions: &[Definition],
    ) -> Result<Self, ConfigurationError> {
        let mut dependencies = BTreeMap::new();
        for defn in definitions {
            let ty = registry.lookup(defn)?;
            dependencies.insert(defn.name.clone(), ty.create_after(definitions, defn));
        }
        Self::new(dependencies)
    }

    /// The graph over recorded resources, for destroying them.
    ///
    /// Resources that are still defined use their definition's dependencies;
    /// the others only have their type's `create_after_types`.
    pub fn from_records(
        registry: &Registry,
        records: &BTreeMap<String, ResourceRecord>,
        definitions: &[Definition],
    ) -> Result<Self, ConfigurationError> {
        let by_name: BTreeMap<&str, &Definition> =
            definitions.iter().map(|d| (d.name.as_str(), d)).collect();
        let mut dependencies = BTreeMap::new();
        for (name, record) in records {
            let deps = match by_name.get(name.as_str()) {
                Some(defn) => registry
                    .lookup(defn)
                    .map(|ty| ty.create_after(definitions, defn))?,
                None => {
                    let types = registry
                        .get(&record.type_tag)
                        .map(|ty| ty.create_after_types())
                        .unwrap_or_default();
                    records
                        .iter()
                        .filter(|(other, r)| {
                            *other != name && types.contains(&r.type_tag.as_str())
                        })
                        .map(|(other, _)| other.clone())
                        .collect()
                }
            };
            dependencies.insert(name.clone(), deps);
        }
        Self::new(dependencies)
    }

    /// Every resource, dependencies first.
    pub fn order(&self) -> &[String] {
        &self.order
    }

    /// Every resource, dependents first.
    pub fn reverse_order(&self) -> impl Iterator<Item = &String> {
        self.order.iter().rev()
    }

    pub fn dependencies(&self, name: &str) -> impl Iterator<Item = &String> {
        self.dependencies.get(name).into_iter().flatten()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.dependencies.contains_key(name)
    }
}

/// Kahn's algorithm; ties go to the smallest name. On failure, returns the
/// resources of one cycle.
fn topological_order(
    dependencies: &BTreeMap<String, BTreeSet<String>>,
) -> Result<Vec<String>, Vec<String>> {
    let mut remaining: BTreeMap<&str, usize> = dependencies
        .iter()
        .map(|(name, deps)| (name.as_str(), deps.len()))
        .collect();
    let mut dependents: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
    for (name, deps) in dependencies {
        for dep in deps {
            dependents.entry(dep.as_str()).or_default().push(name.as_str());
        }
    }

    let mut ready: BTreeSet<&str> = remaining
        .iter()
        .filter(|(_, n)| **n == 0)
        .map(|(name, _)| *name)
        .collect();
    let mut order = Vec::with_capacity(dependencies.len());
    while let Some(name) = ready.pop_first() {
        remaining.remove(name);
        order.push(name.to_owned());
        for dependent in dependents.get(name).into_iter().flatten() {
            if let Some(n) = remaining.get_mut(dependent) {
                *n -= 1;
                if *n == 0 {
                    ready.insert(*dependent);
                }
            }
        }
    }

    if remaining.is_empty() {
        Ok(order)
    } else {
        Err(find_cycle(dependencies, &remaining))
    }
}

/// Walk dependency edges among the unsorted nodes until one repeats. Every
/// unsorted node has an unsorted dependency, so the walk always closes.
fn find_cycle(
    dependencies: &BTreeMap<String, BTreeSet<String>>,
    remaining: &BTreeMap<&str, usize>,
) -> Vec<String> {
    let mut path: Vec<&str> = Vec::new();
    let mut position: BTreeMap<&str, usize> = BTreeMap::new();
    let mut current = remaining.keys().next().copied();
    while let Some(name) = current {
        if let Some(&start) = position.get(name) {
            return path[start..].iter().map(|s| s.to_string()).collect();
        }
        position.insert(name, path.len());
        path.push(name);
        current = dependencies
            .get(name)
            .into_iter()
            .flatten()
            .map(String::as_str)
            .find(|d| remaining.contains_key(d));
    }
    path.into_iter().map(str::to_owned).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{defn, TestType};
    use nixops4_aws_core::Reference;

    fn graph(edges: &[(&str, &[&str])]) -> Result<DependencyGraph, ConfigurationError> {
        DependencyGraph::new(
            edges
                .iter()
                .map(|(k, vs)| (k.to_string(), vs.iter().map(|v| v.to_string()).collect()))
                .collect(),
        )
    }

    #[test]
    fn dependencies_come_first() {
        let g = graph(&[
            ("route", &["rt", "igw"]),
            ("rt", &["vpc"]),
            ("igw", &["vpc"]),
            ("vpc", &[]),
            ("eip", &["outside"]),
        ])
        .unwrap();
        assert_eq!(g.order(), ["eip", "vpc", "igw", "rt", "route"]);
        assert_eq!(
            g.reverse_order().map(String::as_str).collect::<Vec<_>>(),
            vec!["route", "rt", "igw", "vpc", "eip"]
        );
        assert_eq!(g.dependencies("eip").count(), 0);
    }

    #[test]
    fn cycles_name_their_resources() {
        let err = graph(&[("a", &["b"]), ("b", &["a"]), ("c", &["a"])]).unwrap_err();
        assert_eq!(
            err,
            ConfigurationError::Cycle {
                cycle: vec!["a".to_owned(), "b".to_owned()]
            }
        );
        assert_eq!(
            err.to_string(),
            "dependency cycle between resources: a -> b -> a"
        );
    }

    #[test]
    fn references_and_create_after_types_induce_edges() {
        let mut registry = Registry::new();
        registry.register(TestType::new("net")).unwrap();
        registry
            .register(TestType {
                create_after: &["net"],
                ..TestType::new("table")
            })
            .unwrap();
        let definitions = vec![
            defn("t", "table"),
            defn("n1", "net"),
            defn("n2", "net").with("parent", Reference::new("n1", "net")),
        ];
        let g = DependencyGraph::from_definitions(&registry, &definitions).unwrap();
        assert_eq!(g.order(), ["n1", "n2", "t"]);
        assert_eq!(g.dependencies("t").collect::<Vec<_>>(), ["n1", "n2"]);
    }

    #[test]
    fn records_without_definitions_use_type_order() {
        let mut registry = Registry::new();
        registry.register(TestType::new("net")).unwrap();
        registry
            .register(TestType {
                create_after: &["net"],
                ..TestType::new("table")
            })
            .unwrap();
        let records = BTreeMap::from([
            ("a".to_owned(), ResourceRecord::new("table")),
            ("z".to_owned(), ResourceRecord::new("net")),
        ]);
        let g = DependencyGraph::from_records(&registry, &records, &[]).unwrap();
        assert_eq!(
            g.reverse_order().map(String::as_str).collect::<Vec<_>>(),
            vec!["a", "z"]
        );
    }
}
