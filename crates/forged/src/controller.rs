//! Correction loop controller.
//!
//! Drives the run → classify → recover cycle for one project as an explicit
//! state machine, decoupled from any presentation concern. Progress is
//! published on an event channel; the loop never waits on a consumer.
//!
//! Recovery policy:
//! - missing dependency → resolve package name, install, re-run the same
//!   code (no model call)
//! - install failure, runtime error, timeout, unknown → request corrected
//!   code from the model backend
//! - bounded by a fixed budget of re-entries into Running
//! - cancellation wins over any in-progress recovery and is reported as a
//!   state, not an error

use crate::backend::{BackendError, ChatMessage, GenerateRequest, ModelBackend};
use crate::env::{EnvError, EnvManager};
use crate::project::{Project, ProjectError, ProjectStore};
use crate::runner::{Runner, RunnerError};
use forge_core::diagnose::Classifier;
use forge_core::events::{
    BuildFinishedPayload, FixRequestedPayload, InstallFinishedPayload, LoopEvent,
    RevisionAppendedPayload, RunFinishedPayload, StateChangedPayload,
};
use forge_core::prompt;
use forge_core::types::{LoopState, Revision, RevisionOrigin};
use std::collections::{BTreeSet, HashSet};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Revisions included as conversational context in fix requests.
const HISTORY_MAX_REVISIONS: usize = 6;

#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("a build is already in flight for project {0}")]
    BuildInFlight(String),
    #[error("project error: {0}")]
    Project(#[from] ProjectError),
    #[error("environment error: {0}")]
    Env(#[from] EnvError),
    #[error("failed to install declared dependencies: {0}")]
    SetupInstall(String),
    #[error("runner error: {0}")]
    Runner(#[from] RunnerError),
    #[error("model backend error: {0}")]
    Backend(#[from] BackendError),
    #[error("retry budget exhausted after {attempts} attempts: {last_failure}")]
    Exhausted { attempts: u32, last_failure: String },
}

pub type Result<T> = std::result::Result<T, ControllerError>;

/// Controller tuning knobs.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Maximum re-entries into Running per build invocation.
    pub max_fix_attempts: u32,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self { max_fix_attempts: 3 }
    }
}

/// Terminal summary of one build invocation.
#[derive(Debug, Clone)]
pub struct BuildReport {
    pub project: String,
    pub state: LoopState,
    /// Re-entries into Running that occurred.
    pub attempts: u32,
    /// Index of the accepted revision, when the build succeeded.
    pub accepted_revision: Option<usize>,
}

/// The correction loop controller.
pub struct Controller {
    store: ProjectStore,
    env: EnvManager,
    runner: Runner,
    backend: Arc<dyn ModelBackend>,
    classifier: Classifier,
    config: ControllerConfig,
    events: UnboundedSender<LoopEvent>,
    /// Projects with a build in flight; at most one loop per project.
    in_flight: Mutex<HashSet<String>>,
}

impl std::fmt::Debug for Controller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Controller")
            .field("backend", &self.backend.name())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Removes the project from the in-flight registry on scope exit, so the
/// slot frees on every return path.
struct FlightGuard<'a> {
    registry: &'a Mutex<HashSet<String>>,
    name: String,
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        if let Ok(mut registry) = self.registry.lock() {
            registry.remove(&self.name);
        }
    }
}

impl Controller {
    pub fn new(
        store: ProjectStore,
        env: EnvManager,
        runner: Runner,
        backend: Arc<dyn ModelBackend>,
        config: ControllerConfig,
        events: UnboundedSender<LoopEvent>,
    ) -> Self {
        Self {
            store,
            env,
            runner,
            backend,
            classifier: Classifier::default(),
            config,
            events,
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    /// Build (or fix) a project: ensure its environment, run the entry
    /// script, and iterate on failures until success, budget exhaustion,
    /// or cancellation.
    ///
    /// `user_prompt` triggers a fresh generation before the first run;
    /// without it the current entry script is executed as-is.
    pub async fn build(
        &self,
        project_name: &str,
        user_prompt: Option<&str>,
        cancel: CancellationToken,
    ) -> Result<BuildReport> {
        let _guard = self.claim(project_name)?;
        let mut project = self.store.load(project_name)?;

        let mut state = LoopState::Idle;
        let mut attempts = 0u32;

        self.transition(&project.name, &mut state, LoopState::EnsuringEnvironment, attempts);
        if cancel.is_cancelled() {
            return Ok(self.finish_cancelled(&project, state, attempts));
        }

        // Environment failures are terminal and surfaced verbatim.
        let env_handle = self.env.ensure(&mut project).await?;
        let declared_install = self.env.install(&mut project, &BTreeSet::new()).await?;
        if !declared_install.success {
            return Err(ControllerError::SetupInstall(declared_install.log));
        }

        if let Some(request) = user_prompt {
            self.transition(&project.name, &mut state, LoopState::RequestingFix, attempts);
            if cancel.is_cancelled() {
                return Ok(self.finish_cancelled(&project, state, attempts));
            }

            let deps: Vec<String> = project.declared_dependencies.iter().cloned().collect();
            let generate = GenerateRequest {
                prompt: prompt::build_generate_prompt(request, &deps),
                current_source: None,
                history: Vec::new(),
            };
            let source = match self.backend.generate(&generate, &cancel).await {
                Ok(source) => source,
                Err(BackendError::Cancelled) => {
                    return Ok(self.finish_cancelled(&project, state, attempts));
                }
                Err(e) => return Err(e.into()),
            };
            self.append_revision(
                &mut project,
                prompt::extract_code(&source),
                RevisionOrigin::Prompt {
                    prompt: request.to_string(),
                },
            )?;
        }

        loop {
            if cancel.is_cancelled() {
                return Ok(self.finish_cancelled(&project, state, attempts));
            }
            self.transition(&project.name, &mut state, LoopState::Running, attempts);

            let outcome = self
                .runner
                .run(
                    &project.name,
                    &env_handle.python,
                    &project.entry_script_path(),
                    &project.root_path,
                    cancel.clone(),
                    &self.events,
                )
                .await?;

            let _ = self.events.send(LoopEvent::RunFinished(RunFinishedPayload {
                project: project.name.clone(),
                exit_code: outcome.exit_code,
                duration_ms: outcome.duration_ms,
                timed_out: outcome.timed_out,
            }));

            // User-directed aborts are not failures: no classification, no
            // retry accounting, record left at the last run revision.
            if outcome.cancelled {
                return Ok(self.finish_cancelled(&project, state, attempts));
            }

            if outcome.is_success() {
                self.transition(&project.name, &mut state, LoopState::Succeeded, attempts);
                let accepted = project.revisions.len().saturating_sub(1);
                self.store.mark_accepted(&mut project, accepted)?;
                info!(project = %project.name, attempts, "build succeeded");
                self.emit_finished(&project.name, state, attempts);
                return Ok(BuildReport {
                    project: project.name.clone(),
                    state,
                    attempts,
                    accepted_revision: Some(accepted),
                });
            }

            self.transition(&project.name, &mut state, LoopState::Classifying, attempts);
            let diagnosis = self.classifier.classify(&outcome);
            info!(
                project = %project.name,
                category = diagnosis.category.as_str(),
                detail = %diagnosis.detail,
                "run failed"
            );

            if attempts >= self.config.max_fix_attempts {
                self.transition(&project.name, &mut state, LoopState::Exhausted, attempts);
                self.emit_finished(&project.name, state, attempts);
                return Err(ControllerError::Exhausted {
                    attempts,
                    last_failure: diagnosis.summary(),
                });
            }
            attempts += 1;

            // Cheap, deterministic path first: install the missing package
            // and re-run the same code without a new model call.
            let mut install_failure: Option<String> = None;
            if let Some(module) = diagnosis.suggested_dependency.clone() {
                self.transition(
                    &project.name,
                    &mut state,
                    LoopState::InstallingDependency,
                    attempts,
                );
                if cancel.is_cancelled() {
                    return Ok(self.finish_cancelled(&project, state, attempts));
                }

                let package = match self
                    .backend
                    .resolve_package(&module, &diagnosis.detail, &cancel)
                    .await
                {
                    Ok(Some(package)) => package,
                    Ok(None) => {
                        debug!(module = %module, "backend declined to name a package; using module name");
                        module.clone()
                    }
                    Err(BackendError::Cancelled) => {
                        return Ok(self.finish_cancelled(&project, state, attempts));
                    }
                    Err(e) => {
                        warn!(error = %e, "package resolution failed; using module name");
                        module.clone()
                    }
                };

                let names: BTreeSet<String> = [package.clone()].into();
                let install = self.env.install(&mut project, &names).await?;
                let _ = self
                    .events
                    .send(LoopEvent::InstallFinished(InstallFinishedPayload {
                        project: project.name.clone(),
                        packages: vec![package],
                        success: install.success,
                    }));

                if install.success {
                    continue;
                }
                // Fall through to a model fix with the installer log as
                // additional context.
                install_failure = Some(install.log);
            }

            self.transition(&project.name, &mut state, LoopState::RequestingFix, attempts);
            if cancel.is_cancelled() {
                return Ok(self.finish_cancelled(&project, state, attempts));
            }
            let _ = self.events.send(LoopEvent::FixRequested(FixRequestedPayload {
                project: project.name.clone(),
                category: diagnosis.category,
                detail: diagnosis.detail.clone(),
            }));

            let request = GenerateRequest {
                prompt: prompt::build_fix_prompt(&diagnosis, install_failure.as_deref()),
                current_source: project.latest_revision().map(|r| r.source.clone()),
                history: history_messages(&project),
            };
            let source = match self.backend.generate(&request, &cancel).await {
                Ok(source) => source,
                Err(BackendError::Cancelled) => {
                    return Ok(self.finish_cancelled(&project, state, attempts));
                }
                Err(e) => return Err(e.into()),
            };

            self.append_revision(
                &mut project,
                prompt::extract_code(&source),
                RevisionOrigin::Fix {
                    diagnosis: diagnosis.summary(),
                },
            )?;
        }
    }

    /// Claim the per-project build slot.
    fn claim(&self, project_name: &str) -> Result<FlightGuard<'_>> {
        let mut registry = self
            .in_flight
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if !registry.insert(project_name.to_string()) {
            return Err(ControllerError::BuildInFlight(project_name.to_string()));
        }
        Ok(FlightGuard {
            registry: &self.in_flight,
            name: project_name.to_string(),
        })
    }

    fn transition(&self, project: &str, state: &mut LoopState, to: LoopState, attempts: u32) {
        let from = *state;
        *state = to;
        debug!(project = %project, from = from.as_str(), to = to.as_str(), "state transition");
        let _ = self.events.send(LoopEvent::StateChanged(StateChangedPayload {
            project: project.to_string(),
            from,
            to,
            attempt: attempts,
        }));
    }

    fn finish_cancelled(
        &self,
        project: &Project,
        mut state: LoopState,
        attempts: u32,
    ) -> BuildReport {
        self.transition(&project.name, &mut state, LoopState::Cancelled, attempts);
        info!(project = %project.name, "build cancelled");
        self.emit_finished(&project.name, state, attempts);
        BuildReport {
            project: project.name.clone(),
            state,
            attempts,
            accepted_revision: None,
        }
    }

    fn emit_finished(&self, project: &str, state: LoopState, attempts: u32) {
        let _ = self.events.send(LoopEvent::BuildFinished(BuildFinishedPayload {
            project: project.to_string(),
            state,
            attempts,
        }));
    }

    fn append_revision(
        &self,
        project: &mut Project,
        source: String,
        origin: RevisionOrigin,
    ) -> Result<()> {
        let revision = Revision::new(source, origin);
        let revision_id = revision.id.clone();
        self.store.append_revision(project, revision)?;
        let _ = self
            .events
            .send(LoopEvent::RevisionAppended(RevisionAppendedPayload {
                project: project.name.clone(),
                revision_id,
            }));
        Ok(())
    }
}

/// Turn recent revision history into conversational context for the model.
fn history_messages(project: &Project) -> Vec<ChatMessage> {
    let start = project
        .revisions
        .len()
        .saturating_sub(HISTORY_MAX_REVISIONS);
    let mut messages = Vec::new();
    for revision in &project.revisions[start..] {
        match &revision.origin {
            RevisionOrigin::Prompt { prompt } => {
                messages.push(ChatMessage::user(prompt.clone()));
                messages.push(ChatMessage::assistant(revision.source.clone()));
            }
            RevisionOrigin::Fix { diagnosis } => {
                messages.push(ChatMessage::user(format!(
                    "The previous version failed: {diagnosis}. Provide a corrected version."
                )));
                messages.push(ChatMessage::assistant(revision.source.clone()));
            }
            RevisionOrigin::Manual => {}
        }
    }
    messages
}
