//! Project persistence.
//!
//! The engine only needs two verbs from persistence: save the project after a run and
//! load it back so derived state is recomputed from what actually hit the disk.

use std::fs;
use std::path::Path;

use crate::error::{AppResult, DaqError};
use crate::project::Project;

/// Saves and reloads whole projects.
pub trait ProjectStore: Send + Sync {
    /// Persist the project at its `path`.
    fn save(&self, project: &Project) -> AppResult<()>;

    /// Load a project from `path`, recording the path on it.
    fn load(&self, path: &Path) -> AppResult<Project>;
}

/// Pretty-printed JSON files, one per project.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonProjectStore;

impl JsonProjectStore {
    /// JSON store.
    pub fn new() -> Self {
        Self
    }
}

impl ProjectStore for JsonProjectStore {
    fn save(&self, project: &Project) -> AppResult<()> {
        let path = project.path.as_ref().ok_or(DaqError::ProjectNotSaved)?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        // write then rename so a crash mid-save leaves the previous copy intact
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, project.to_json()?)?;
        fs::rename(&tmp, path)?;
        log::info!("Saved project to '{}'", path.display());
        Ok(())
    }

    fn load(&self, path: &Path) -> AppResult<Project> {
        let text = fs::read_to_string(path)?;
        let mut project = Project::from_json(&text)?;
        project.path = Some(path.to_path_buf());
        log::debug!(
            "Loaded project '{}' with {} tests",
            path.display(),
            project.tests.len()
        );
        Ok(project)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProjectDefaults;
    use crate::project::{Reading, Test};

    #[test]
    fn test_save_requires_path() {
        let project = Project::new(&ProjectDefaults::default());
        let result = JsonProjectStore::new().save(&project);
        assert!(matches!(result, Err(DaqError::ProjectNotSaved)));
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("well-7.json");
        let mut project = Project::new(&ProjectDefaults::default());
        project.path = Some(path.clone());
        let mut blank = Test::blank("Blank 1");
        blank.append_readings([Reading::new(0.0, 80, 90), Reading::new(0.05, 85, 95)]);
        project.tests.push(blank);

        let store = JsonProjectStore::new();
        store.save(&project).unwrap();
        let loaded = store.load(&path).unwrap();

        assert_eq!(loaded.path.as_deref(), Some(path.as_path()));
        assert_eq!(loaded.tests.len(), 1);
        assert_eq!(loaded.tests[0].readings().len(), 2);
        assert_eq!(loaded.tests[0].max_psi(), 90);
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[test]
    fn test_load_missing_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = JsonProjectStore::new().load(&dir.path().join("absent.json"));
        assert!(matches!(result, Err(DaqError::Io(_))));
    }
}
