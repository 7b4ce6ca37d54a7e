//! forged - prompt-to-project build engine
//!
//! Library components for the engine: project store, environment manager,
//! process runner, model backend, and the correction loop controller.

pub mod backend;
pub mod controller;
pub mod env;
pub mod project;
pub mod runner;

use std::sync::Arc;

use backend::ModelBackend;
use controller::{Controller, ControllerConfig};
use env::EnvManager;
use forge_core::{Config, LoopEvent};
use project::ProjectStore;
use runner::{Runner, RunnerConfig};
use tokio::sync::mpsc::UnboundedSender;

/// Wire a controller and its components from an engine config.
pub fn build_controller(
    config: &Config,
    backend: Arc<dyn ModelBackend>,
    events: UnboundedSender<LoopEvent>,
) -> Controller {
    let store = ProjectStore::new(config.projects_dir.clone(), config.entry_script.clone());
    let env = EnvManager::new(config.uv_bin.clone(), store.clone());
    let runner = Runner::new(RunnerConfig {
        timeout_sec: config.run_timeout_sec,
    });
    let controller_config = ControllerConfig {
        max_fix_attempts: config.max_fix_attempts,
    };
    Controller::new(store, env, runner, backend, controller_config, events)
}
