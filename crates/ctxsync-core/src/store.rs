//! Project state persistence.
//!
//! The sync engine only reads project snapshots (to greet new connections)
//! and lists project names (for global observers). Writes come from request
//! handlers outside this crate.

use crate::error::StoreError;
use serde_json::Value;
use sled::{Db, Tree};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::RwLock;

/// Backend holding the authoritative per-project state.
pub trait ProjectStore: Send + Sync {
    /// Loads the snapshot of a project, if it exists.
    fn load_project(&self, project_name: &str) -> Result<Option<Value>, StoreError>;

    /// Replaces the snapshot of a project. Returns `true` once stored.
    fn save_project(&self, project_name: &str, data: &Value) -> Result<bool, StoreError>;

    /// Names of all stored projects, sorted.
    fn list_projects(&self) -> Result<Vec<String>, StoreError>;

    /// Removes a project. Returns `false` if it did not exist.
    fn delete_project(&self, project_name: &str) -> Result<bool, StoreError>;
}

/// Volatile store used when no storage path is configured.
#[derive(Debug, Default)]
pub struct MemoryProjectStore {
    projects: RwLock<BTreeMap<String, Value>>,
}

impl MemoryProjectStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ProjectStore for MemoryProjectStore {
    fn load_project(&self, project_name: &str) -> Result<Option<Value>, StoreError> {
        let projects = self.projects.read().unwrap_or_else(|e| e.into_inner());
        Ok(projects.get(project_name).cloned())
    }

    fn save_project(&self, project_name: &str, data: &Value) -> Result<bool, StoreError> {
        let mut projects = self.projects.write().unwrap_or_else(|e| e.into_inner());
        projects.insert(project_name.to_string(), data.clone());
        Ok(true)
    }

    fn list_projects(&self) -> Result<Vec<String>, StoreError> {
        let projects = self.projects.read().unwrap_or_else(|e| e.into_inner());
        Ok(projects.keys().cloned().collect())
    }

    fn delete_project(&self, project_name: &str) -> Result<bool, StoreError> {
        let mut projects = self.projects.write().unwrap_or_else(|e| e.into_inner());
        Ok(projects.remove(project_name).is_some())
    }
}

/// sled-backed store. Snapshots are kept as JSON under the project name.
pub struct SledProjectStore {
    _db: Db,
    projects: Tree,
}

impl SledProjectStore {
    /// Opens or creates a store at the specified path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let db = sled::open(path)?;
        let projects = db.open_tree("projects")?;
        Ok(Self { _db: db, projects })
    }
}

impl ProjectStore for SledProjectStore {
    fn load_project(&self, project_name: &str) -> Result<Option<Value>, StoreError> {
        match self.projects.get(project_name)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    fn save_project(&self, project_name: &str, data: &Value) -> Result<bool, StoreError> {
        let bytes = serde_json::to_vec(data)?;
        self.projects.insert(project_name, bytes)?;
        self.projects.flush()?;
        Ok(true)
    }

    fn list_projects(&self) -> Result<Vec<String>, StoreError> {
        self.projects
            .iter()
            .keys()
            .map(|key| -> Result<String, StoreError> {
                Ok(String::from_utf8_lossy(&key?).into_owned())
            })
            .collect()
    }

    fn delete_project(&self, project_name: &str) -> Result<bool, StoreError> {
        let existed = self.projects.remove(project_name)?.is_some();
        self.projects.flush()?;
        Ok(existed)
    }
}
