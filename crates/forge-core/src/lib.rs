pub mod config;
pub mod diagnose;
pub mod events;
pub mod prompt;
pub mod types;

pub use config::Config;
pub use diagnose::{Classifier, Diagnosis, DiagnosisCategory};
pub use events::LoopEvent;
pub use types::*;
