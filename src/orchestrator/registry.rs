//! Handle registry
//!
//! Every container the orchestrator touches gets one entry holding its
//! handle behind an async mutex. A task must hold that mutex for the whole
//! of a state transition, so two operations never interleave on the same
//! container.

use crate::container::ContainerHandle;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

/// Shared, lockable handle
pub type SharedHandle = Arc<Mutex<ContainerHandle>>;

#[derive(Debug, Default)]
pub struct HandleRegistry {
    handles: RwLock<HashMap<String, SharedHandle>>,
}

impl HandleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Existing entry for the handle's container, or a new one seeded with it
    pub async fn entry(&self, handle: ContainerHandle) -> SharedHandle {
        if let Some(existing) = self.handles.read().await.get(&handle.id) {
            return existing.clone();
        }

        let mut handles = self.handles.write().await;
        handles
            .entry(handle.id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(handle)))
            .clone()
    }

    pub async fn get(&self, id: &str) -> Option<SharedHandle> {
        self.handles.read().await.get(id).cloned()
    }

    /// Forget a removed container
    pub async fn remove(&self, id: &str) -> Option<SharedHandle> {
        self.handles.write().await.remove(id)
    }

    /// Snapshot of the handles recorded for a project, sorted by name.
    ///
    /// Waits for any in-progress transition on those handles.
    pub async fn for_project(&self, project: &str) -> Vec<ContainerHandle> {
        let entries: Vec<SharedHandle> = self.handles.read().await.values().cloned().collect();

        let mut handles = Vec::new();
        for entry in entries {
            let handle = entry.lock().await;
            if handle.project == project {
                handles.push(handle.clone());
            }
        }
        handles.sort_by(|a, b| a.name.cmp(&b.name));
        handles
    }

    pub async fn len(&self) -> usize {
        self.handles.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.handles.read().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::ContainerState;

    fn handle(id: &str, project: &str) -> ContainerHandle {
        ContainerHandle {
            id: id.to_string(),
            name: format!("{}-web-{}", project, id),
            project: project.to_string(),
            service: "web".to_string(),
            state: ContainerState::Created,
        }
    }

    #[tokio::test]
    async fn test_entry_is_shared() {
        let registry = HandleRegistry::new();
        let first = registry.entry(handle("1", "p")).await;
        first.lock().await.state = ContainerState::Running;

        let second = registry.entry(handle("1", "p")).await;
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(second.lock().await.state, ContainerState::Running);
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn test_for_project_and_remove() {
        let registry = HandleRegistry::new();
        registry.entry(handle("2", "p")).await;
        registry.entry(handle("1", "p")).await;
        registry.entry(handle("3", "other")).await;

        let names: Vec<String> = registry
            .for_project("p")
            .await
            .into_iter()
            .map(|h| h.name)
            .collect();
        assert_eq!(names, vec!["p-web-1", "p-web-2"]);

        assert!(registry.remove("1").await.is_some());
        assert!(registry.get("1").await.is_none());
        assert!(registry.remove("1").await.is_none());
        assert_eq!(registry.len().await, 2);
    }
}
