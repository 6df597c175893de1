use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use atelier_error::AtelierError;

const PROJECTS_FILE: &str = "projects.json";

/// Identity of a workspace. Never destroyed by the core; only reordered by
/// recency of access.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub path: String,
    pub data_dir: String,
    pub last_accessed: DateTime<Utc>,
}

/// The persisted, recency-ordered list of known projects. The JSON file on
/// disk is the source of truth; every operation re-reads it under the lock so
/// concurrent registrations serialize into a consistent order.
pub struct ProjectRegistry {
    file: PathBuf,
    lock: Mutex<()>,
}

impl ProjectRegistry {
    /// Opens the registry in the platform data directory, or in
    /// `ATELIER_DATA_HOME` when set.
    pub fn open_default() -> Result<Self, AtelierError> {
        let base = match std::env::var_os("ATELIER_DATA_HOME") {
            Some(dir) => PathBuf::from(dir),
            None => dirs::data_dir()
                .map(|dir| dir.join("atelier"))
                .unwrap_or_else(|| PathBuf::from(".atelier")),
        };
        Self::open_at(&base)
    }

    pub fn open_at(base: &Path) -> Result<Self, AtelierError> {
        std::fs::create_dir_all(base).map_err(|err| AtelierError::Storage {
            message: format!("{}: {err}", base.display()),
        })?;
        Ok(Self {
            file: base.join(PROJECTS_FILE),
            lock: Mutex::new(()),
        })
    }

    /// All known projects, most recently accessed first.
    pub fn list(&self) -> Result<Vec<Project>, AtelierError> {
        let _guard = self.lock.lock().expect("registry lock poisoned");
        self.read_file()
    }

    pub fn find(&self, path: &str) -> Result<Option<Project>, AtelierError> {
        Ok(self.list()?.into_iter().find(|p| p.path == path))
    }

    /// Idempotent upsert: bumps `last_accessed` and moves the project to the
    /// front of the list.
    pub fn register(&self, path: &str, data_dir: &str) -> Result<Project, AtelierError> {
        let _guard = self.lock.lock().expect("registry lock poisoned");
        let mut projects = self.read_file()?;
        projects.retain(|p| p.path != path);

        let project = Project {
            path: path.to_string(),
            data_dir: data_dir.to_string(),
            last_accessed: Utc::now(),
        };
        projects.insert(0, project.clone());
        self.write_file(&projects)?;
        Ok(project)
    }

    /// Bumps recency for an already-registered project.
    pub fn touch(&self, path: &str) -> Result<(), AtelierError> {
        let _guard = self.lock.lock().expect("registry lock poisoned");
        let mut projects = self.read_file()?;
        let Some(index) = projects.iter().position(|p| p.path == path) else {
            return Ok(());
        };
        let mut project = projects.remove(index);
        project.last_accessed = Utc::now();
        projects.insert(0, project);
        self.write_file(&projects)
    }

    fn read_file(&self) -> Result<Vec<Project>, AtelierError> {
        match std::fs::read_to_string(&self.file) {
            Ok(raw) => serde_json::from_str(&raw).map_err(|err| AtelierError::Storage {
                message: format!("{}: {err}", self.file.display()),
            }),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(err) => Err(AtelierError::Storage {
                message: format!("{}: {err}", self.file.display()),
            }),
        }
    }

    fn write_file(&self, projects: &[Project]) -> Result<(), AtelierError> {
        let raw = serde_json::to_string_pretty(projects)?;
        let tmp = self.file.with_extension("json.tmp");
        std::fs::write(&tmp, raw).map_err(|err| AtelierError::Storage {
            message: format!("{}: {err}", tmp.display()),
        })?;
        std::fs::rename(&tmp, &self.file).map_err(|err| AtelierError::Storage {
            message: format!("{}: {err}", self.file.display()),
        })
    }
}

/// Default per-project data directory when registration omits one.
pub fn default_data_dir(project_path: &str) -> String {
    Path::new(project_path)
        .join(".atelier")
        .to_string_lossy()
        .to_string()
}
