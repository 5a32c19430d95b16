//! Dependency layering
//!
//! Turns a project's `depends_on` graph into batches of services that can be
//! acted on concurrently. Batch `n` only contains services whose dependencies
//! all live in batches `0..n`.

use super::project::Project;
use crate::error::ValidationError;
use std::collections::{BTreeMap, BTreeSet};

/// Ordered batches of service names
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationPlan {
    batches: Vec<Vec<String>>,
}

impl OperationPlan {
    /// Build the start plan for a project
    pub fn build(project: &Project) -> Result<Self, ValidationError> {
        let graph = project
            .services()
            .map(|s| (s.name.clone(), s.depends_on.clone()))
            .collect();
        Self::from_dependencies(&graph)
    }

    /// Layer an arbitrary dependency map (service -> dependencies).
    ///
    /// Every round places all services whose dependencies are already placed.
    /// A round that places nothing while services remain means a cycle; the
    /// error lists the unplaced services and no partial plan is returned.
    /// Dependencies missing from the map are reported as unknown.
    pub fn from_dependencies(
        graph: &BTreeMap<String, BTreeSet<String>>,
    ) -> Result<Self, ValidationError> {
        for (service, deps) in graph {
            if let Some(dep) = deps.iter().find(|d| !graph.contains_key(*d)) {
                return Err(ValidationError::UnknownDependency {
                    service: service.clone(),
                    dependency: dep.clone(),
                });
            }
        }

        let mut placed: BTreeSet<&str> = BTreeSet::new();
        let mut remaining: BTreeSet<&str> = graph.keys().map(String::as_str).collect();
        let mut batches = Vec::new();

        while !remaining.is_empty() {
            // BTreeSet iteration keeps each batch sorted by name
            let batch: Vec<&str> = remaining
                .iter()
                .copied()
                .filter(|name| graph[*name].iter().all(|d| placed.contains(d.as_str())))
                .collect();

            if batch.is_empty() {
                return Err(ValidationError::CycleDetected {
                    services: remaining.iter().map(|s| s.to_string()).collect(),
                });
            }

            for name in &batch {
                remaining.remove(name);
                placed.insert(*name);
            }
            batches.push(batch.into_iter().map(String::from).collect());
        }

        Ok(Self { batches })
    }

    /// Batches in start order
    pub fn batches(&self) -> &[Vec<String>] {
        &self.batches
    }

    /// Batches in teardown order (dependents first)
    pub fn reversed(&self) -> impl Iterator<Item = &Vec<String>> {
        self.batches.iter().rev()
    }

    /// Index of the batch containing `service`
    pub fn batch_of(&self, service: &str) -> Option<usize> {
        self.batches
            .iter()
            .position(|batch| batch.iter().any(|s| s == service))
    }

    /// All services in start order
    pub fn services(&self) -> impl Iterator<Item = &str> {
        self.batches.iter().flatten().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.batches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.batches.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compose::config::{ComposeConfig, ServiceConfig};
    use crate::compose::project::ProjectOptions;
    use crate::compose::ComposeParser;

    fn graph(edges: &[(&str, &[&str])]) -> BTreeMap<String, BTreeSet<String>> {
        edges
            .iter()
            .map(|(name, deps)| {
                (
                    name.to_string(),
                    deps.iter().map(|d| d.to_string()).collect(),
                )
            })
            .collect()
    }

    #[test]
    fn test_web_after_db() {
        let config = ComposeConfig::default()
            .with_service("web", ServiceConfig::new("nginx").depends_on(&["db"]))
            .with_service("db", ServiceConfig::new("postgres"));
        let project = Project::load(&config, &ProjectOptions::new()).unwrap();

        let plan = OperationPlan::build(&project).unwrap();
        assert_eq!(plan.batches(), &[vec!["db".to_string()], vec!["web".to_string()]]);
    }

    #[test]
    fn test_two_service_cycle() {
        let err = OperationPlan::from_dependencies(&graph(&[("a", &["b"]), ("b", &["a"])]))
            .unwrap_err();
        assert_eq!(
            err,
            ValidationError::CycleDetected {
                services: vec!["a".to_string(), "b".to_string()],
            }
        );
    }

    #[test]
    fn test_cycle_reports_only_unplaced() {
        let err = OperationPlan::from_dependencies(&graph(&[
            ("base", &[]),
            ("x", &["base", "z"]),
            ("y", &["x"]),
            ("z", &["y"]),
        ]))
        .unwrap_err();
        match err {
            ValidationError::CycleDetected { services } => {
                assert_eq!(services, vec!["x", "y", "z"]);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_self_dependency_is_cycle() {
        let err = OperationPlan::from_dependencies(&graph(&[("a", &["a"])])).unwrap_err();
        assert!(matches!(err, ValidationError::CycleDetected { .. }));
    }

    #[test]
    fn test_unknown_dependency() {
        let err = OperationPlan::from_dependencies(&graph(&[("a", &["ghost"])])).unwrap_err();
        assert!(matches!(err, ValidationError::UnknownDependency { .. }));
    }

    #[test]
    fn test_batches_sorted_and_layered() {
        let plan = OperationPlan::from_dependencies(&graph(&[
            ("web", &["api", "cache"]),
            ("api", &["db"]),
            ("worker", &["db", "cache"]),
            ("cache", &[]),
            ("db", &[]),
            ("proxy", &["web"]),
        ]))
        .unwrap();

        assert_eq!(
            plan.batches(),
            &[
                vec!["cache".to_string(), "db".to_string()],
                vec!["api".to_string(), "worker".to_string()],
                vec!["web".to_string()],
                vec!["proxy".to_string()],
            ]
        );
        assert_eq!(plan.batch_of("worker"), Some(1));
        assert_eq!(plan.reversed().next().unwrap(), &vec!["proxy".to_string()]);
    }

    #[test]
    fn test_every_service_after_its_dependencies() {
        // Deterministic pseudo-random DAGs: edges only point to lower indices
        let mut seed: u64 = 0x5eed;
        for round in 0..50 {
            let size = 2 + round % 12;
            let mut edges: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
            for i in 0..size {
                let mut deps = BTreeSet::new();
                for j in 0..i {
                    seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
                    if (seed >> 33) % 3 == 0 {
                        deps.insert(format!("s{j}"));
                    }
                }
                edges.insert(format!("s{i}"), deps);
            }

            let plan = OperationPlan::from_dependencies(&edges).unwrap();
            let placed: Vec<&str> = plan.services().collect();
            assert_eq!(placed.len(), edges.len());
            assert_eq!(placed.iter().collect::<BTreeSet<_>>().len(), edges.len());

            for (service, deps) in &edges {
                let own = plan.batch_of(service).unwrap();
                for dep in deps {
                    assert!(plan.batch_of(dep).unwrap() < own);
                }
            }
        }
    }

    #[test]
    fn test_three_tier_from_yaml() {
        let yaml = r#"
services:
  web:
    image: nginx
    depends_on:
      - api
  api:
    image: node
    depends_on:
      - db
  db:
    image: postgres
"#;

        let config = ComposeParser::parse_str(yaml).unwrap();
        let project = Project::load(&config, &ProjectOptions::new()).unwrap();
        let plan = OperationPlan::build(&project).unwrap();
        let order: Vec<&str> = plan.services().collect();
        assert_eq!(order, vec!["db", "api", "web"]);
    }
}
