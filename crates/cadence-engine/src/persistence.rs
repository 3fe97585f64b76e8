//! Snapshot persistence for workflow instances.
//!
//! A snapshot holds everything needed to rebuild an instance: the workflow
//! state, sprint scope, live cycles and the full transition history. Files
//! are written atomically and carry a schema version.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::history::TransitionRecord;
use crate::state::WorkflowState;
use crate::tdd::TddCycle;

/// Current schema version for snapshots.
pub const CURRENT_SCHEMA_VERSION: u32 = 1;

/// Storage faults. These are never turned into denials.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Project not found: {0}")]
    NotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid snapshot data: {0}")]
    InvalidData(String),

    #[error("Unsupported schema version: {0} (max supported: {1})")]
    UnsupportedSchema(u32, u32),

    #[error("Invalid project ID: {0}")]
    InvalidId(String),

    #[error("History integrity check failed at record {sequence}: {reason}")]
    Integrity { sequence: u64, reason: String },
}

/// Serialized form of one workflow instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Schema version of this layout.
    pub schema_version: u32,
    /// Project id.
    pub project: String,
    /// Current workflow state.
    pub state: WorkflowState,
    /// Stories planned for the current sprint.
    #[serde(default)]
    pub planned_scope: Vec<String>,
    /// Story that blocked the sprint, while BLOCKED.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blocked_story: Option<String>,
    /// Live cycles, sorted by story id.
    #[serde(default)]
    pub cycles: Vec<TddCycle>,
    /// Full transition history, oldest first.
    #[serde(default)]
    pub history: Vec<TransitionRecord>,
}

impl Snapshot {
    /// Parse a snapshot, checking the schema version first.
    pub fn from_json(content: &str) -> Result<Self, StorageError> {
        let raw: serde_json::Value = serde_json::from_str(content)?;
        let version_u64 = raw
            .get("schema_version")
            .and_then(serde_json::Value::as_u64)
            .ok_or_else(|| StorageError::InvalidData("missing schema_version".to_string()))?;
        let version = u32::try_from(version_u64)
            .map_err(|_| StorageError::InvalidData("schema_version too large".to_string()))?;

        if version > CURRENT_SCHEMA_VERSION {
            return Err(StorageError::UnsupportedSchema(version, CURRENT_SCHEMA_VERSION));
        }

        // v1 is the only layout so far; no migrations.
        Ok(serde_json::from_value(raw)?)
    }

    /// Serialize as pretty JSON.
    pub fn to_json(&self) -> Result<String, StorageError> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// Where snapshots live.
pub trait SnapshotStore: Send + Sync {
    /// Save a snapshot, replacing any previous one for the project.
    fn save(&self, snapshot: &Snapshot) -> Result<(), StorageError>;

    /// Load the snapshot for `project`.
    fn load(&self, project: &str) -> Result<Snapshot, StorageError>;

    /// Whether a snapshot is stored for `project`, loadable or not.
    fn exists(&self, project: &str) -> bool;

    /// Delete the snapshot for `project`.
    fn delete(&self, project: &str) -> Result<(), StorageError>;

    /// Ids of every project with a loadable snapshot, sorted.
    fn list(&self) -> Result<Vec<String>, StorageError>;
}

/// Snapshot store on the local filesystem.
///
/// Layout: `<base>/projects/<project>/snapshot.json`.
#[derive(Debug, Clone)]
pub struct FileStore {
    base_path: PathBuf,
}

impl FileStore {
    /// Create a store, creating the projects directory if needed.
    pub fn new(base_path: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let base_path = base_path.into();
        fs::create_dir_all(base_path.join("projects"))?;
        Ok(Self { base_path })
    }

    /// Base directory of the store.
    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// Directory holding one project's files.
    pub fn project_dir(&self, project: &str) -> PathBuf {
        self.base_path.join("projects").join(project)
    }

    /// Validate a project ID for filesystem safety.
    pub fn validate_id(id: &str) -> Result<(), StorageError> {
        if id.is_empty() {
            return Err(StorageError::InvalidId("ID cannot be empty".to_string()));
        }

        if id.contains('/') || id.contains('\\') {
            return Err(StorageError::InvalidId(
                "ID cannot contain path separators".to_string(),
            ));
        }

        if id.contains("..") {
            return Err(StorageError::InvalidId(
                "ID cannot contain path traversal".to_string(),
            ));
        }

        for ch in id.chars() {
            if !ch.is_ascii_alphanumeric() && ch != '-' && ch != '_' {
                return Err(StorageError::InvalidId(format!(
                    "ID contains invalid character: {ch}"
                )));
            }
        }

        Ok(())
    }

    fn snapshot_path(&self, project: &str) -> PathBuf {
        self.project_dir(project).join("snapshot.json")
    }
}

impl SnapshotStore for FileStore {
    fn save(&self, snapshot: &Snapshot) -> Result<(), StorageError> {
        Self::validate_id(&snapshot.project)?;
        fs::create_dir_all(self.project_dir(&snapshot.project))?;

        let json = snapshot.to_json()?;
        atomic_write(&self.snapshot_path(&snapshot.project), json.as_bytes())?;
        debug!(project = %snapshot.project, records = snapshot.history.len(), "Saved snapshot");
        Ok(())
    }

    fn load(&self, project: &str) -> Result<Snapshot, StorageError> {
        Self::validate_id(project)?;

        let path = self.snapshot_path(project);
        if !path.exists() {
            return Err(StorageError::NotFound(project.to_string()));
        }

        let snapshot = Snapshot::from_json(&fs::read_to_string(&path)?)?;
        if snapshot.project != project {
            return Err(StorageError::InvalidData(format!(
                "snapshot for {} stored under {project}",
                snapshot.project
            )));
        }
        Ok(snapshot)
    }

    fn exists(&self, project: &str) -> bool {
        Self::validate_id(project).is_ok() && self.snapshot_path(project).exists()
    }

    fn delete(&self, project: &str) -> Result<(), StorageError> {
        Self::validate_id(project)?;

        let dir = self.project_dir(project);
        if !dir.exists() {
            return Err(StorageError::NotFound(project.to_string()));
        }
        fs::remove_dir_all(&dir)?;
        Ok(())
    }

    fn list(&self) -> Result<Vec<String>, StorageError> {
        let projects_dir = self.base_path.join("projects");
        if !projects_dir.exists() {
            return Ok(Vec::new());
        }

        let mut ids = Vec::new();
        for entry in fs::read_dir(&projects_dir)? {
            let path = entry?.path();
            if !path.is_dir() {
                continue;
            }
            let Some(id) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };

            match self.load(id) {
                Ok(_) => ids.push(id.to_string()),
                Err(e) => warn!(project = %id, error = %e, "Skipping unreadable snapshot"),
            }
        }

        ids.sort();
        Ok(ids)
    }
}

/// Write content atomically using temp file + fsync + rename.
fn atomic_write(path: &Path, content: &[u8]) -> std::io::Result<()> {
    // Unique temp filename from timestamp and process ID
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    let pid = std::process::id();

    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("file");
    let tmp_path = path.with_file_name(format!("{file_name}.{timestamp}.{pid}.tmp"));

    let result = (|| {
        let mut file = File::create(&tmp_path)?;
        file.write_all(content)?;
        file.sync_all()?;
        fs::rename(&tmp_path, path)?;
        Ok(())
    })();

    if result.is_err() {
        let _ = fs::remove_file(&tmp_path);
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::TddState;
    use tempfile::TempDir;

    fn setup_test_store() -> (TempDir, FileStore) {
        let temp = TempDir::new().unwrap();
        let store = FileStore::new(temp.path()).unwrap();
        (temp, store)
    }

    fn snapshot(project: &str) -> Snapshot {
        let mut cycle = TddCycle::new("AUTH-1");
        cycle.state = TddState::CodeGreen;
        Snapshot {
            schema_version: CURRENT_SCHEMA_VERSION,
            project: project.to_string(),
            state: WorkflowState::SprintActive,
            planned_scope: vec!["AUTH-1".to_string()],
            blocked_story: None,
            cycles: vec![cycle],
            history: Vec::new(),
        }
    }

    #[test]
    fn test_new_creates_projects_dir() {
        let temp = TempDir::new().unwrap();
        let _store = FileStore::new(temp.path()).unwrap();
        assert!(temp.path().join("projects").exists());
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let (temp, store) = setup_test_store();
        let original = snapshot("shop");

        store.save(&original).unwrap();
        assert!(temp.path().join("projects/shop/snapshot.json").exists());
        assert_eq!(store.load("shop").unwrap(), original);
        assert!(store.exists("shop"));
    }

    #[test]
    fn test_save_leaves_no_temp_files() {
        let (_temp, store) = setup_test_store();
        store.save(&snapshot("shop")).unwrap();
        store.save(&snapshot("shop")).unwrap();

        let names: Vec<String> = fs::read_dir(store.project_dir("shop"))
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["snapshot.json".to_string()]);
    }

    #[test]
    fn test_load_not_found() {
        let (_temp, store) = setup_test_store();
        assert!(matches!(store.load("nonexistent"), Err(StorageError::NotFound(_))));
        assert!(!store.exists("nonexistent"));
    }

    #[test]
    fn test_load_unsupported_schema() {
        let (_temp, store) = setup_test_store();
        let dir = store.project_dir("future");
        fs::create_dir_all(&dir).unwrap();
        fs::write(
            dir.join("snapshot.json"),
            r#"{"schema_version": 99, "project": "future", "state": "IDLE"}"#,
        )
        .unwrap();

        assert!(matches!(
            store.load("future"),
            Err(StorageError::UnsupportedSchema(99, CURRENT_SCHEMA_VERSION))
        ));
    }

    #[test]
    fn test_load_missing_schema_version() {
        let (_temp, store) = setup_test_store();
        let dir = store.project_dir("old");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("snapshot.json"), r#"{"project": "old", "state": "IDLE"}"#).unwrap();
        assert!(matches!(store.load("old"), Err(StorageError::InvalidData(_))));
    }

    #[test]
    fn test_load_corrupted_json() {
        let (_temp, store) = setup_test_store();
        let dir = store.project_dir("broken");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("snapshot.json"), "{ not json").unwrap();
        assert!(matches!(store.load("broken"), Err(StorageError::Json(_))));
        // A corrupt snapshot still occupies the project id.
        assert!(store.exists("broken"));
    }

    #[test]
    fn test_load_rejects_mismatched_project() {
        let (_temp, store) = setup_test_store();
        store.save(&snapshot("shop")).unwrap();
        fs::create_dir_all(store.project_dir("other")).unwrap();
        fs::copy(
            store.project_dir("shop").join("snapshot.json"),
            store.project_dir("other").join("snapshot.json"),
        )
        .unwrap();
        assert!(matches!(store.load("other"), Err(StorageError::InvalidData(_))));
    }

    #[test]
    fn test_delete() {
        let (_temp, store) = setup_test_store();
        store.save(&snapshot("shop")).unwrap();
        store.delete("shop").unwrap();
        assert!(!store.exists("shop"));
        assert!(matches!(store.delete("shop"), Err(StorageError::NotFound(_))));
    }

    #[test]
    fn test_list_skips_corrupted() {
        let (_temp, store) = setup_test_store();
        store.save(&snapshot("beta")).unwrap();
        store.save(&snapshot("alpha")).unwrap();
        let dir = store.project_dir("broken");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("snapshot.json"), "garbage").unwrap();

        assert_eq!(store.list().unwrap(), vec!["alpha".to_string(), "beta".to_string()]);
    }

    #[test]
    fn test_validate_id() {
        assert!(FileStore::validate_id("shop-2_a").is_ok());
        for bad in ["", "a/b", "a\\b", "..", "a..b", "sp ace", "dot.ted"] {
            assert!(FileStore::validate_id(bad).is_err(), "accepted {bad:?}");
        }
        let (_temp, store) = setup_test_store();
        assert!(matches!(
            store.save(&snapshot("../escape")),
            Err(StorageError::InvalidId(_))
        ));
    }
}
