//! Registry of workflow instances, one per project.
//!
//! The map is owned by the caller; there is no process-wide instance.
//! Instances are shared as `Arc`, so a deregistered instance stays usable by
//! whoever still holds it.

use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use thiserror::Error;
use tracing::info;

use crate::config::EngineConfig;
use crate::events::{EventEmitter, NullEmitter};
use crate::workflow::WorkflowInstance;

/// Errors from project registration.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProjectError {
    #[error("Project already registered: {0}")]
    AlreadyRegistered(String),

    #[error("Project not found: {0}")]
    NotFound(String),

    #[error("Invalid project id: {0:?}")]
    InvalidId(String),
}

/// Project id → workflow instance.
pub struct Projects {
    instances: RwLock<BTreeMap<String, Arc<WorkflowInstance>>>,
    config: EngineConfig,
    emitter: Arc<dyn EventEmitter>,
}

impl std::fmt::Debug for Projects {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Projects")
            .field("ids", &self.ids())
            .finish_non_exhaustive()
    }
}

impl Default for Projects {
    fn default() -> Self {
        Self::new(EngineConfig::default(), Arc::new(NullEmitter))
    }
}

impl Projects {
    /// Create an empty registry. New instances share `config` and `emitter`.
    pub fn new(config: EngineConfig, emitter: Arc<dyn EventEmitter>) -> Self {
        Self {
            instances: RwLock::new(BTreeMap::new()),
            config,
            emitter,
        }
    }

    /// Create a fresh instance for `project`.
    pub fn register(&self, project: &str) -> Result<Arc<WorkflowInstance>, ProjectError> {
        validate_id(project)?;
        let mut instances = self.write();
        if instances.contains_key(project) {
            return Err(ProjectError::AlreadyRegistered(project.to_string()));
        }
        let instance = Arc::new(WorkflowInstance::new(
            project,
            self.config.clone(),
            Arc::clone(&self.emitter),
        ));
        instances.insert(project.to_string(), Arc::clone(&instance));
        info!(project, "Registered project");
        Ok(instance)
    }

    /// Add an existing instance, e.g. one restored from a snapshot.
    pub fn insert(
        &self,
        instance: WorkflowInstance,
    ) -> Result<Arc<WorkflowInstance>, ProjectError> {
        let project = instance.project().to_string();
        validate_id(&project)?;
        let mut instances = self.write();
        if instances.contains_key(&project) {
            return Err(ProjectError::AlreadyRegistered(project));
        }
        let instance = Arc::new(instance);
        instances.insert(project, Arc::clone(&instance));
        Ok(instance)
    }

    /// Remove a project and return its instance.
    pub fn deregister(&self, project: &str) -> Result<Arc<WorkflowInstance>, ProjectError> {
        let removed = self
            .write()
            .remove(project)
            .ok_or_else(|| ProjectError::NotFound(project.to_string()))?;
        info!(project, "Deregistered project");
        Ok(removed)
    }

    /// Look up a project's instance.
    pub fn get(&self, project: &str) -> Result<Arc<WorkflowInstance>, ProjectError> {
        self.read()
            .get(project)
            .cloned()
            .ok_or_else(|| ProjectError::NotFound(project.to_string()))
    }

    /// Registered project ids, sorted.
    pub fn ids(&self) -> Vec<String> {
        self.read().keys().cloned().collect()
    }

    fn read(&self) -> RwLockReadGuard<'_, BTreeMap<String, Arc<WorkflowInstance>>> {
        self.instances.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, BTreeMap<String, Arc<WorkflowInstance>>> {
        self.instances.write().unwrap_or_else(PoisonError::into_inner)
    }
}

fn validate_id(project: &str) -> Result<(), ProjectError> {
    if project.trim().is_empty() || project.trim() != project {
        return Err(ProjectError::InvalidId(project.to_string()));
    }
    Ok(())
}
