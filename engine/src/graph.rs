//! Dependency ordering of record types.
//!
//! Every non-self belongs-to edge `child -> parent` means rows of `parent`
//! must be applied before rows of `child`. The graph is rebuilt per run from
//! live directive metadata and stored as a fixed type list plus adjacency by
//! index; nothing is removed from it while it is being walked.

use crate::{error::Result, DirectiveRegistry, Error, RecordType};
use std::collections::{BTreeSet, HashMap};

/// Directed dependency graph over a fixed set of record types.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencyGraph {
    types: Vec<RecordType>,
    /// `dependencies[i]` holds the indexes `types[i]` depends on.
    dependencies: Vec<Vec<usize>>,
}

impl DependencyGraph {
    /// Build from belongs-to edges of the given types. Edges to types outside
    /// the set, and self-associations, are ignored.
    pub fn build(registry: &DirectiveRegistry, types: &[RecordType]) -> Result<Self> {
        Self::build_with(registry, types, false)
    }

    /// Like [`build`](Self::build), but a type also inherits the dependencies
    /// of every type reachable through its included sync relations, since
    /// those rows travel nested inside it.
    pub fn build_strict(registry: &DirectiveRegistry, types: &[RecordType]) -> Result<Self> {
        Self::build_with(registry, types, true)
    }

    fn build_with(registry: &DirectiveRegistry, types: &[RecordType], strict: bool) -> Result<Self> {
        let index: HashMap<&str, usize> = types
            .iter()
            .enumerate()
            .map(|(i, t)| (t.as_str(), i))
            .collect();

        let mut dependencies = Vec::with_capacity(types.len());
        for (i, name) in types.iter().enumerate() {
            let mut sources = vec![name.clone()];
            if strict {
                for path in &registry.get(name)?.included_sync_relations {
                    sources.extend(registry.resolve_relation(name, path)?);
                }
            }

            let mut deps = BTreeSet::new();
            for source in &sources {
                let directive = registry.get(source)?;
                for (target, is_self) in directive.schema.belongs_to_edges(source) {
                    if is_self {
                        continue;
                    }
                    if let Some(&j) = index.get(target) {
                        if j != i {
                            deps.insert(j);
                        }
                    }
                }
            }
            dependencies.push(deps.into_iter().collect());
        }

        Ok(Self {
            types: types.to_vec(),
            dependencies,
        })
    }

    /// Build directly from an edge list. Mostly useful in tests.
    pub fn from_edges(types: &[&str], edges: &[(&str, &str)]) -> Self {
        let types: Vec<RecordType> = types.iter().map(|t| t.to_string()).collect();
        let index: HashMap<&str, usize> = types
            .iter()
            .enumerate()
            .map(|(i, t)| (t.as_str(), i))
            .collect();
        let mut dependencies = vec![BTreeSet::new(); types.len()];
        for (child, parent) in edges {
            if child == parent {
                continue;
            }
            if let (Some(&c), Some(&p)) = (index.get(child), index.get(parent)) {
                dependencies[c].insert(p);
            }
        }
        Self {
            dependencies: dependencies
                .into_iter()
                .map(|d| d.into_iter().collect())
                .collect(),
            types,
        }
    }

    pub fn types(&self) -> &[RecordType] {
        &self.types
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }

    /// Direct dependencies of a type.
    pub fn dependencies_of(&self, name: &str) -> Option<Vec<&str>> {
        let i = self.types.iter().position(|t| t == name)?;
        Some(
            self.dependencies[i]
                .iter()
                .map(|&j| self.types[j].as_str())
                .collect(),
        )
    }

    pub(crate) fn dependency_indexes(&self) -> &[Vec<usize>] {
        &self.dependencies
    }

    /// Reverse adjacency: for each type, the types that depend on it.
    pub(crate) fn dependents(&self) -> Vec<Vec<usize>> {
        let mut dependents = vec![Vec::new(); self.types.len()];
        for (child, deps) in self.dependencies.iter().enumerate() {
            for &parent in deps {
                dependents[parent].push(child);
            }
        }
        dependents
    }

    /// Build the cycle error for the types whose dependencies never cleared.
    pub(crate) fn cycle_error(&self, unresolved: &[usize], done: &[bool]) -> Error {
        let residual = unresolved
            .iter()
            .map(|&i| {
                let blocking = self.dependencies[i]
                    .iter()
                    .filter(|&&j| !done[j])
                    .map(|&j| self.types[j].clone())
                    .collect();
                (self.types[i].clone(), blocking)
            })
            .collect();
        Error::CyclicDependency { residual }
    }

    /// Topological order: repeatedly sweep the remaining types, moving any type
    /// with no unresolved dependency to the output. A sweep that moves nothing
    /// means a genuine cycle.
    pub fn sorted(&self) -> Result<Vec<RecordType>> {
        let mut done = vec![false; self.types.len()];
        let mut remaining: Vec<usize> = (0..self.types.len()).collect();
        let mut sorted = Vec::with_capacity(self.types.len());

        while !remaining.is_empty() {
            let before = remaining.len();
            remaining.retain(|&i| {
                let ready = self.dependencies[i].iter().all(|&j| done[j]);
                if ready {
                    done[i] = true;
                    sorted.push(self.types[i].clone());
                }
                !ready
            });

            if remaining.len() == before {
                return Err(self.cycle_error(&remaining, &done));
            }
        }

        Ok(sorted)
    }

    /// Map of type to its position in [`sorted`](Self::sorted).
    pub fn ranks(&self) -> Result<HashMap<RecordType, i32>> {
        Ok(self
            .sorted()?
            .into_iter()
            .enumerate()
            .map(|(rank, name)| (name, rank as i32))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{Association, FieldDef, FieldType};
    use crate::{ModelSchema, ModelSyncDirective, SyncDirection};

    fn model(name: &str, parents: &[&str]) -> ModelSyncDirective {
        let mut schema = ModelSchema::new(vec![FieldDef::new("id", FieldType::String)]);
        for parent in parents {
            schema = schema.with_association(Association::belongs_to(
                parent.to_lowercase(),
                *parent,
                format!("{}_id", parent.to_lowercase()),
            ));
        }
        ModelSyncDirective::new(name, name.to_lowercase(), SyncDirection::Bidirectional, schema)
    }

    fn names(registry: &DirectiveRegistry) -> Vec<RecordType> {
        registry.iter().map(|d| d.name.clone()).collect()
    }

    fn position(order: &[RecordType], name: &str) -> usize {
        order.iter().position(|t| t == name).unwrap()
    }

    #[test]
    fn parent_precedes_child() {
        let registry = DirectiveRegistry::new(vec![model("B", &["A"]), model("A", &[])]).unwrap();
        let graph = DependencyGraph::build(&registry, &names(&registry)).unwrap();
        assert_eq!(graph.sorted().unwrap(), vec!["A".to_string(), "B".to_string()]);
    }

    #[test]
    fn self_association_is_ignored() {
        let registry =
            DirectiveRegistry::new(vec![model("Location", &["Location", "Facility"]), model("Facility", &[])])
                .unwrap();
        let graph = DependencyGraph::build(&registry, &names(&registry)).unwrap();
        let order = graph.sorted().unwrap();
        assert!(position(&order, "Facility") < position(&order, "Location"));
    }

    #[test]
    fn diamond_orders_all_edges() {
        let registry = DirectiveRegistry::new(vec![
            model("LabTest", &["LabRequest", "ReferenceData"]),
            model("LabRequest", &["Encounter"]),
            model("Encounter", &["Patient", "Facility"]),
            model("Patient", &[]),
            model("Facility", &[]),
            model("ReferenceData", &[]),
        ])
        .unwrap();
        let graph = DependencyGraph::build(&registry, &names(&registry)).unwrap();
        let order = graph.sorted().unwrap();

        for directive in registry.iter() {
            for (parent, _) in directive.schema.belongs_to_edges(&directive.name) {
                assert!(position(&order, parent) < position(&order, &directive.name));
            }
        }
    }

    #[test]
    fn cycle_raises_with_residual() {
        let registry = DirectiveRegistry::new(vec![
            model("A", &["C"]),
            model("B", &["A"]),
            model("C", &["B"]),
            model("D", &[]),
        ])
        .unwrap();
        let graph = DependencyGraph::build(&registry, &names(&registry)).unwrap();

        match graph.sorted() {
            Err(Error::CyclicDependency { residual }) => {
                let stuck: Vec<&str> = residual.iter().map(|(t, _)| t.as_str()).collect();
                assert_eq!(stuck, vec!["A", "B", "C"]);
                assert_eq!(residual[0].1, vec!["C".to_string()]);
            }
            other => panic!("expected cycle, got {other:?}"),
        }
    }

    #[test]
    fn edges_outside_the_set_are_ignored() {
        let registry = DirectiveRegistry::new(vec![model("B", &["A"]), model("A", &[])]).unwrap();
        let graph = DependencyGraph::build(&registry, &["B".to_string()]).unwrap();
        assert_eq!(graph.sorted().unwrap(), vec!["B".to_string()]);
    }

    #[test]
    fn strict_inherits_nested_dependencies() {
        // Encounter embeds lab_requests, and lab requests belong to a Department.
        let encounter = ModelSyncDirective::new(
            "Encounter",
            "encounters",
            SyncDirection::Bidirectional,
            ModelSchema::default()
                .with_association(Association::has_many("lab_requests", "LabRequest", "encounter_id")),
        )
        .with_included_relation("lab_requests");
        let registry = DirectiveRegistry::new(vec![
            encounter,
            model("LabRequest", &["Encounter", "Department"]),
            model("Department", &[]),
        ])
        .unwrap();
        let types = names(&registry);

        let plain = DependencyGraph::build(&registry, &types).unwrap();
        assert_eq!(plain.dependencies_of("Encounter").unwrap(), Vec::<&str>::new());

        let strict = DependencyGraph::build_strict(&registry, &types).unwrap();
        assert_eq!(strict.dependencies_of("Encounter").unwrap(), vec!["Department"]);
        let order = strict.sorted().unwrap();
        assert!(position(&order, "Department") < position(&order, "Encounter"));
    }

    #[test]
    fn ranks_follow_sorted_order() {
        let graph = DependencyGraph::from_edges(&["B", "A"], &[("B", "A")]);
        let ranks = graph.ranks().unwrap();
        assert_eq!(ranks["A"], 0);
        assert_eq!(ranks["B"], 1);
    }
}
