//! Project record store.
//!
//! One directory per project under `projects_dir`:
//! - `project.json`: metadata (name, dependencies, environment status)
//! - `<entry>`: current entry script, always the latest revision
//! - `history.jsonl`: append-only revision/acceptance log
//! - `.venv/`: isolated environment, owned by the env manager
//!
//! Field ownership is by convention: the environment manager writes
//! `environment_status`, the correction loop appends and accepts revisions.

use chrono::{DateTime, Utc};
use forge_core::types::{EnvironmentStatus, Id, Revision, RevisionOrigin};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Metadata file name inside each project directory.
const PROJECT_META_FILE: &str = "project.json";

/// Append-only revision log inside each project directory.
const HISTORY_FILE: &str = "history.jsonl";

#[derive(Debug, Error)]
pub enum ProjectError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("invalid project name: {0}")]
    InvalidName(String),
    #[error("project already exists: {0}")]
    AlreadyExists(String),
    #[error("project not found: {0}")]
    NotFound(String),
    #[error("refusing to delete path outside projects dir: {0}")]
    OutsideProjectsDir(String),
    #[error("no revision at index {0}")]
    NoSuchRevision(usize),
}

pub type Result<T> = std::result::Result<T, ProjectError>;

/// A project with its loaded revision history.
#[derive(Debug, Clone)]
pub struct Project {
    pub name: String,
    pub root_path: PathBuf,
    /// Entry script path relative to `root_path`.
    pub entry_script: String,
    pub declared_dependencies: BTreeSet<String>,
    pub environment_status: EnvironmentStatus,
    pub revisions: Vec<Revision>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Project {
    /// Absolute path of the entry script.
    pub fn entry_script_path(&self) -> PathBuf {
        self.root_path.join(&self.entry_script)
    }

    /// Latest revision, if any.
    pub fn latest_revision(&self) -> Option<&Revision> {
        self.revisions.last()
    }
}

/// Shape of `project.json`. Revisions live in the history log, not here.
#[derive(Debug, Serialize, Deserialize)]
struct ProjectMeta {
    name: String,
    entry_script: String,
    dependencies: BTreeSet<String>,
    environment_status: EnvironmentStatus,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

/// One line of `history.jsonl`.
///
/// Acceptance is its own entry so the log stays strictly append-only.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "entry", rename_all = "snake_case")]
enum HistoryEntry {
    Revision(Revision),
    Accepted { revision_id: Id, at: DateTime<Utc> },
}

/// Filesystem-backed store for project records.
#[derive(Debug, Clone)]
pub struct ProjectStore {
    projects_dir: PathBuf,
    entry_script: String,
}

impl ProjectStore {
    pub fn new(projects_dir: impl Into<PathBuf>, entry_script: impl Into<String>) -> Self {
        Self {
            projects_dir: projects_dir.into(),
            entry_script: entry_script.into(),
        }
    }

    pub fn projects_dir(&self) -> &Path {
        &self.projects_dir
    }

    /// Sanitize a project name for filesystem use.
    ///
    /// Alphanumerics, `_`, `-`, and `.` pass through; everything else
    /// collapses to `_`. Empty results and `.`/`..` are rejected.
    pub fn sanitize_name(name: &str) -> Result<String> {
        let mut sanitized = String::with_capacity(name.len());
        let mut last_was_underscore = false;
        for c in name.chars() {
            if c.is_alphanumeric() || c == '-' || c == '.' {
                sanitized.push(c);
                last_was_underscore = false;
            } else if !last_was_underscore {
                sanitized.push('_');
                last_was_underscore = true;
            }
        }
        let sanitized = sanitized.trim_matches('_').to_string();
        if sanitized.is_empty() || sanitized == "." || sanitized == ".." {
            return Err(ProjectError::InvalidName(name.to_string()));
        }
        Ok(sanitized)
    }

    /// Absolute root directory for a (sanitized) project name.
    pub fn project_root(&self, name: &str) -> Result<PathBuf> {
        let safe = Self::sanitize_name(name)?;
        Ok(self.projects_dir.join(safe))
    }

    /// Create a new project with a seed entry script and empty history.
    pub fn create(&self, name: &str) -> Result<Project> {
        let safe = Self::sanitize_name(name)?;
        let root = self.projects_dir.join(&safe);
        if root.exists() {
            return Err(ProjectError::AlreadyExists(safe));
        }
        std::fs::create_dir_all(&root)?;

        let now = Utc::now();
        let mut project = Project {
            name: safe.clone(),
            root_path: root,
            entry_script: self.entry_script.clone(),
            declared_dependencies: BTreeSet::new(),
            environment_status: EnvironmentStatus::Absent,
            revisions: Vec::new(),
            created_at: now,
            updated_at: now,
        };

        let seed = format!("# Project: {safe}\n\nprint('Hello from project {safe}!')\n");
        self.append_revision(&mut project, Revision::new(seed, RevisionOrigin::Manual))?;
        self.save(&mut project)?;

        tracing::info!(project = %safe, root = %project.root_path.display(), "created project");
        Ok(project)
    }

    /// Load a project and replay its revision history.
    pub fn load(&self, name: &str) -> Result<Project> {
        let root = self.project_root(name)?;
        let meta_path = root.join(PROJECT_META_FILE);
        if !meta_path.exists() {
            return Err(ProjectError::NotFound(name.to_string()));
        }

        let meta: ProjectMeta = serde_json::from_str(&std::fs::read_to_string(&meta_path)?)?;
        let revisions = self.load_history(&root)?;

        Ok(Project {
            name: meta.name,
            root_path: root,
            entry_script: meta.entry_script,
            declared_dependencies: meta.dependencies,
            environment_status: meta.environment_status,
            revisions,
            created_at: meta.created_at,
            updated_at: meta.updated_at,
        })
    }

    /// Persist metadata, bumping `updated_at`.
    pub fn save(&self, project: &mut Project) -> Result<()> {
        project.updated_at = Utc::now();
        let meta = ProjectMeta {
            name: project.name.clone(),
            entry_script: project.entry_script.clone(),
            dependencies: project.declared_dependencies.clone(),
            environment_status: project.environment_status,
            created_at: project.created_at,
            updated_at: project.updated_at,
        };
        std::fs::create_dir_all(&project.root_path)?;
        let path = project.root_path.join(PROJECT_META_FILE);
        std::fs::write(&path, serde_json::to_string_pretty(&meta)?)?;
        Ok(())
    }

    /// List project names (directories containing a metadata file).
    pub fn list(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        if !self.projects_dir.is_dir() {
            return Ok(names);
        }
        for entry in std::fs::read_dir(&self.projects_dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.is_dir() && path.join(PROJECT_META_FILE).exists() {
                if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                    names.push(name.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }

    /// Delete a project directory permanently.
    ///
    /// Refuses paths that resolve outside `projects_dir` and refuses the
    /// projects dir itself.
    pub fn delete(&self, name: &str) -> Result<()> {
        let root = self.project_root(name)?;
        if !root.is_dir() {
            return Err(ProjectError::NotFound(name.to_string()));
        }

        let resolved = root.canonicalize()?;
        let base = self.projects_dir.canonicalize()?;
        if resolved == base || !resolved.starts_with(&base) {
            return Err(ProjectError::OutsideProjectsDir(
                resolved.display().to_string(),
            ));
        }

        std::fs::remove_dir_all(&resolved)?;
        tracing::info!(project = %name, "deleted project");
        Ok(())
    }

    /// Append a revision to the history log and rewrite the entry script.
    ///
    /// Keeps the invariant that the entry script on disk always equals the
    /// latest revision's source.
    pub fn append_revision(&self, project: &mut Project, revision: Revision) -> Result<()> {
        std::fs::create_dir_all(&project.root_path)?;
        self.append_history_entry(
            &project.root_path,
            &HistoryEntry::Revision(revision.clone()),
        )?;
        std::fs::write(project.entry_script_path(), &revision.source)?;
        project.revisions.push(revision);
        self.save(project)?;
        Ok(())
    }

    /// Mark the revision at `index` as accepted.
    pub fn mark_accepted(&self, project: &mut Project, index: usize) -> Result<()> {
        let revision_id = project
            .revisions
            .get(index)
            .map(|r| r.id.clone())
            .ok_or(ProjectError::NoSuchRevision(index))?;
        self.append_history_entry(
            &project.root_path,
            &HistoryEntry::Accepted {
                revision_id,
                at: Utc::now(),
            },
        )?;
        project.revisions[index].accepted = true;
        Ok(())
    }

    /// Record an environment status change.
    ///
    /// Called only by the environment manager.
    pub fn set_environment_status(
        &self,
        project: &mut Project,
        status: EnvironmentStatus,
    ) -> Result<()> {
        project.environment_status = status;
        self.save(project)
    }

    fn append_history_entry(&self, root: &Path, entry: &HistoryEntry) -> Result<()> {
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(root.join(HISTORY_FILE))?;
        let mut line = serde_json::to_string(entry)?;
        line.push('\n');
        file.write_all(line.as_bytes())?;
        Ok(())
    }

    fn load_history(&self, root: &Path) -> Result<Vec<Revision>> {
        let path = root.join(HISTORY_FILE);
        if !path.exists() {
            return Ok(Vec::new());
        }

        let mut revisions: Vec<Revision> = Vec::new();
        for line in std::fs::read_to_string(&path)?.lines() {
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            match serde_json::from_str::<HistoryEntry>(trimmed)? {
                HistoryEntry::Revision(revision) => revisions.push(revision),
                HistoryEntry::Accepted { revision_id, .. } => {
                    if let Some(revision) =
                        revisions.iter_mut().find(|r| r.id == revision_id)
                    {
                        revision.accepted = true;
                    }
                }
            }
        }
        Ok(revisions)
    }
}
