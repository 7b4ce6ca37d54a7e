//! Environment manager: one isolated `uv` virtual environment per project.
//!
//! Key responsibilities:
//! - Create the project venv (idempotent, indicator-file validated)
//! - Install declared dependencies via `uv pip install`
//! - Remove the venv on explicit request
//!
//! This component is the sole writer of `environment_status`. Side effects
//! are confined to the `.venv` directory under the project root.

use crate::project::{Project, ProjectStore};
use forge_core::types::EnvironmentStatus;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Venv directory name inside a project root.
const VENV_DIR: &str = ".venv";

/// File whose presence marks a materialized venv.
const VENV_INDICATOR: &str = "pyvenv.cfg";

#[derive(Debug, Error)]
pub enum EnvError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("uv not found: {0}")]
    UvNotFound(String),
    #[error("environment creation failed: {0}")]
    Creation(String),
    #[error("project store error: {0}")]
    Store(#[from] crate::project::ProjectError),
}

pub type Result<T> = std::result::Result<T, EnvError>;

/// Handle to a materialized environment.
#[derive(Debug, Clone)]
pub struct EnvHandle {
    pub venv_path: PathBuf,
    /// Interpreter bound to this environment.
    pub python: PathBuf,
}

/// Result of a dependency install attempt.
///
/// Install failure is data, not an error: the caller decides whether to
/// retry, substitute a package name, or fall back to a model fix.
#[derive(Debug, Clone)]
pub struct InstallOutcome {
    pub success: bool,
    /// Raw resolver/installer diagnostic text.
    pub log: String,
}

/// Manager for per-project isolated environments.
#[derive(Debug)]
pub struct EnvManager {
    uv_bin: PathBuf,
    store: ProjectStore,
}

impl EnvManager {
    pub fn new(uv_bin: impl Into<PathBuf>, store: ProjectStore) -> Self {
        Self {
            uv_bin: uv_bin.into(),
            store,
        }
    }

    /// Venv directory for a project root.
    pub fn venv_path(root: &Path) -> PathBuf {
        root.join(VENV_DIR)
    }

    /// Interpreter path inside a project's venv.
    pub fn python_path(root: &Path) -> PathBuf {
        let venv = Self::venv_path(root);
        if cfg!(windows) {
            venv.join("Scripts").join("python.exe")
        } else {
            venv.join("bin").join("python")
        }
    }

    fn indicator_path(root: &Path) -> PathBuf {
        Self::venv_path(root).join(VENV_INDICATOR)
    }

    fn handle(root: &Path) -> EnvHandle {
        EnvHandle {
            venv_path: Self::venv_path(root),
            python: Self::python_path(root),
        }
    }

    /// Ensure the project's environment exists. Idempotent: an existing,
    /// Ready environment is returned without side effects.
    pub async fn ensure(&self, project: &mut Project) -> Result<EnvHandle> {
        let root = project.root_path.clone();
        let indicator = Self::indicator_path(&root);

        if indicator.exists() && project.environment_status == EnvironmentStatus::Ready {
            debug!(project = %project.name, "environment already ready");
            return Ok(Self::handle(&root));
        }

        if project.environment_status == EnvironmentStatus::Ready && !indicator.exists() {
            // Metadata and disk disagree; recreate below.
            warn!(project = %project.name, "environment indicator missing, marking stale");
            self.store
                .set_environment_status(project, EnvironmentStatus::Stale)?;
        }

        self.store
            .set_environment_status(project, EnvironmentStatus::Creating)?;
        info!(
            project = %project.name,
            venv = %Self::venv_path(&root).display(),
            "creating environment"
        );

        let venv_path = Self::venv_path(&root);
        let result = self
            .run_uv(
                &["venv", &venv_path.to_string_lossy(), "--seed"],
                &root,
                None,
            )
            .await;

        match result {
            Ok((0, _)) if indicator.exists() => {
                self.store
                    .set_environment_status(project, EnvironmentStatus::Ready)?;
                info!(project = %project.name, "environment ready");
                Ok(Self::handle(&root))
            }
            Ok((code, log)) => {
                self.store
                    .set_environment_status(project, EnvironmentStatus::Failed)?;
                Err(EnvError::Creation(format!(
                    "uv venv exited with code {code}: {log}"
                )))
            }
            Err(e) => {
                self.store
                    .set_environment_status(project, EnvironmentStatus::Failed)?;
                Err(e)
            }
        }
    }

    /// Install the union of declared dependencies and `names` into the
    /// project environment. On full success, merges `names` into the
    /// declared set; on failure, the set is left untouched and the raw
    /// installer log is returned for the caller to act on.
    pub async fn install(
        &self,
        project: &mut Project,
        names: &BTreeSet<String>,
    ) -> Result<InstallOutcome> {
        let mut wanted: BTreeSet<String> = project.declared_dependencies.clone();
        wanted.extend(names.iter().cloned());

        if wanted.is_empty() {
            return Ok(InstallOutcome {
                success: true,
                log: "no dependencies to install".to_string(),
            });
        }

        let root = project.root_path.clone();
        let venv_path = Self::venv_path(&root);

        let mut args: Vec<String> = vec!["pip".to_string(), "install".to_string()];
        args.extend(wanted.iter().cloned());
        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();

        info!(
            project = %project.name,
            packages = ?wanted,
            "installing dependencies"
        );

        let (code, log) = self
            .run_uv(&arg_refs, &root, Some(("VIRTUAL_ENV", &venv_path)))
            .await?;

        if code == 0 {
            project
                .declared_dependencies
                .extend(names.iter().cloned());
            self.store.save(project)?;
            Ok(InstallOutcome { success: true, log })
        } else {
            warn!(project = %project.name, exit_code = code, "dependency install failed");
            Ok(InstallOutcome {
                success: false,
                log,
            })
        }
    }

    /// Delete the environment directory and mark the project Absent.
    ///
    /// Explicit user request (recreate) or irrecoverable corruption only;
    /// never called automatically by the loop.
    pub async fn remove(&self, project: &mut Project) -> Result<()> {
        let venv_path = Self::venv_path(&project.root_path);
        if venv_path.exists() {
            tokio::fs::remove_dir_all(&venv_path).await?;
        }
        self.store
            .set_environment_status(project, EnvironmentStatus::Absent)?;
        info!(project = %project.name, "environment removed");
        Ok(())
    }

    /// Run the uv binary with the given args, returning exit code and
    /// combined output.
    async fn run_uv(
        &self,
        args: &[&str],
        cwd: &Path,
        env: Option<(&str, &Path)>,
    ) -> Result<(i32, String)> {
        let mut cmd = Command::new(&self.uv_bin);
        cmd.args(args)
            .current_dir(cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some((key, value)) = env {
            cmd.env(key, value);
        }

        debug!(uv = %self.uv_bin.display(), ?args, cwd = %cwd.display(), "running uv");

        let output = cmd.output().await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                EnvError::UvNotFound(self.uv_bin.display().to_string())
            } else {
                EnvError::Io(e)
            }
        })?;

        let exit_code = output.status.code().unwrap_or(-1);
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        let log = if stderr.is_empty() {
            stdout.to_string()
        } else if stdout.is_empty() {
            stderr.to_string()
        } else {
            format!("{stdout}\n{stderr}")
        };

        Ok((exit_code, log))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn make_store(dir: &TempDir) -> ProjectStore {
        ProjectStore::new(dir.path().join("projects"), "main.py")
    }

    /// Write an executable stub standing in for the uv binary.
    #[cfg(unix)]
    fn write_stub(dir: &Path, name: &str, body: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{body}")).unwrap();
        let mut perms = std::fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&path, perms).unwrap();
        path
    }

    /// Stub uv that materializes the venv indicator on `uv venv`.
    #[cfg(unix)]
    fn write_fake_uv(dir: &Path) -> PathBuf {
        write_stub(
            dir,
            "uv",
            r#"
if [ "$1" = "venv" ]; then
    mkdir -p "$2/bin"
    touch "$2/pyvenv.cfg"
    exit 0
fi
exit 0
"#,
        )
    }

    #[test]
    fn python_path_is_inside_venv() {
        let root = Path::new("/projects/demo");
        let python = EnvManager::python_path(root);
        assert!(python.starts_with("/projects/demo/.venv"));
        #[cfg(unix)]
        assert!(python.ends_with("bin/python"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn ensure_creates_environment_and_sets_ready() {
        let dir = TempDir::new().unwrap();
        let store = make_store(&dir);
        let mut project = store.create("demo").unwrap();
        let uv = write_fake_uv(dir.path());
        let manager = EnvManager::new(uv, store.clone());

        let handle = manager.ensure(&mut project).await.unwrap();
        assert_eq!(project.environment_status, EnvironmentStatus::Ready);
        assert!(handle.venv_path.join("pyvenv.cfg").exists());

        // The saved status survives a reload.
        let loaded = store.load("demo").unwrap();
        assert_eq!(loaded.environment_status, EnvironmentStatus::Ready);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn ensure_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let store = make_store(&dir);
        let mut project = store.create("demo").unwrap();

        // Stub that counts invocations so we can detect re-creation.
        let counter = dir.path().join("calls");
        std::fs::write(&counter, "").unwrap();
        let uv = write_stub(
            dir.path(),
            "uv",
            &format!(
                r#"
echo x >> "{counter}"
if [ "$1" = "venv" ]; then
    mkdir -p "$2/bin"
    touch "$2/pyvenv.cfg"
fi
exit 0
"#,
                counter = counter.display()
            ),
        );
        let manager = EnvManager::new(uv, store);

        manager.ensure(&mut project).await.unwrap();
        manager.ensure(&mut project).await.unwrap();

        let calls = std::fs::read_to_string(&counter).unwrap();
        assert_eq!(calls.lines().count(), 1, "second ensure must not re-create");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn ensure_failure_surfaces_diagnostic_and_sets_failed() {
        let dir = TempDir::new().unwrap();
        let store = make_store(&dir);
        let mut project = store.create("demo").unwrap();
        let uv = write_stub(dir.path(), "uv", "echo 'disk full' >&2\nexit 2");
        let manager = EnvManager::new(uv, store);

        let result = manager.ensure(&mut project).await;
        match result {
            Err(EnvError::Creation(log)) => assert!(log.contains("disk full")),
            other => panic!("expected Creation error, got {other:?}"),
        }
        assert_eq!(project.environment_status, EnvironmentStatus::Failed);
    }

    #[tokio::test]
    async fn ensure_missing_uv_is_reported() {
        let dir = TempDir::new().unwrap();
        let store = make_store(&dir);
        let mut project = store.create("demo").unwrap();
        let manager = EnvManager::new("nonexistent_uv_binary_xyz", store);

        let result = manager.ensure(&mut project).await;
        assert!(matches!(result, Err(EnvError::UvNotFound(_))));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn install_success_merges_declared_dependencies() {
        let dir = TempDir::new().unwrap();
        let store = make_store(&dir);
        let mut project = store.create("demo").unwrap();
        let uv = write_fake_uv(dir.path());
        let manager = EnvManager::new(uv, store.clone());
        manager.ensure(&mut project).await.unwrap();

        let names: BTreeSet<String> = ["requests".to_string()].into();
        let outcome = manager.install(&mut project, &names).await.unwrap();
        assert!(outcome.success);
        assert!(project.declared_dependencies.contains("requests"));

        let loaded = store.load("demo").unwrap();
        assert!(loaded.declared_dependencies.contains("requests"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn install_failure_leaves_dependencies_untouched() {
        let dir = TempDir::new().unwrap();
        let store = make_store(&dir);
        let mut project = store.create("demo").unwrap();
        let uv = write_stub(
            dir.path(),
            "uv",
            r#"
if [ "$1" = "pip" ]; then
    echo "No solution found for not-a-package" >&2
    exit 1
fi
exit 0
"#,
        );
        let manager = EnvManager::new(uv, store);

        let names: BTreeSet<String> = ["not-a-package".to_string()].into();
        let outcome = manager.install(&mut project, &names).await.unwrap();
        assert!(!outcome.success);
        assert!(outcome.log.contains("No solution found"));
        assert!(project.declared_dependencies.is_empty());
    }

    #[tokio::test]
    async fn install_with_nothing_to_do_succeeds() {
        let dir = TempDir::new().unwrap();
        let store = make_store(&dir);
        let mut project = store.create("demo").unwrap();
        let manager = EnvManager::new("uv-never-invoked", store);

        let outcome = manager
            .install(&mut project, &BTreeSet::new())
            .await
            .unwrap();
        assert!(outcome.success);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn remove_deletes_venv_and_resets_status() {
        let dir = TempDir::new().unwrap();
        let store = make_store(&dir);
        let mut project = store.create("demo").unwrap();
        let uv = write_fake_uv(dir.path());
        let manager = EnvManager::new(uv, store);

        let handle = manager.ensure(&mut project).await.unwrap();
        assert!(handle.venv_path.exists());

        manager.remove(&mut project).await.unwrap();
        assert!(!handle.venv_path.exists());
        assert_eq!(project.environment_status, EnvironmentStatus::Absent);
    }
}
