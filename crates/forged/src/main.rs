//! forged - prompt-to-project build engine
//!
//! Main entry point for the CLI binary.

use mimalloc::MiMalloc;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

use clap::{Parser, Subcommand};
use eyre::WrapErr;
use forge_core::events::{LogStream, LoopEvent};
use forge_core::Config;
use forged::backend::{BackendConfig, HttpBackend};
use forged::env::EnvManager;
use forged::project::ProjectStore;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

/// Default config file location relative to the working directory.
const DEFAULT_CONFIG_PATH: &str = ".forge/config";

#[derive(Parser)]
#[command(name = "forged", about = "Prompt-to-project build engine", version)]
struct Cli {
    /// Path to a config file (key=value format)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the projects directory
    #[arg(long)]
    projects_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create a new project with a seed entry script
    New { name: String },
    /// List existing projects
    List,
    /// Delete a project and its environment permanently
    Delete { name: String },
    /// Remove and recreate a project's environment
    RecreateEnv { name: String },
    /// Build or fix a project: run it and auto-correct failures
    Build {
        name: String,
        /// Natural-language request; generates fresh code before the run
        #[arg(short, long)]
        prompt: Option<String>,
        /// Override the retry budget
        #[arg(long)]
        max_attempts: Option<u32>,
    },
}

fn load_config(cli: &Cli) -> eyre::Result<Config> {
    let mut config = match &cli.config {
        Some(path) => Config::from_file(path)
            .wrap_err_with(|| format!("loading config from {}", path.display()))?,
        None => {
            let default_path = PathBuf::from(DEFAULT_CONFIG_PATH);
            if default_path.exists() {
                Config::from_file(&default_path)
                    .wrap_err_with(|| format!("loading config from {DEFAULT_CONFIG_PATH}"))?
            } else {
                Config::default()
            }
        }
    };

    if let Some(dir) = &cli.projects_dir {
        config.projects_dir.clone_from(dir);
    }
    let cwd = std::env::current_dir().wrap_err("resolving working directory")?;
    config.resolve_paths(&cwd);
    Ok(config)
}

fn main() -> eyre::Result<()> {
    let cli = Cli::parse();

    fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = load_config(&cli)?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .wrap_err("failed to create tokio runtime")?;

    runtime.block_on(run_command(cli, config))
}

async fn run_command(cli: Cli, config: Config) -> eyre::Result<()> {
    let store = ProjectStore::new(config.projects_dir.clone(), config.entry_script.clone());

    match cli.command {
        Command::New { name } => {
            let project = store.create(&name)?;
            println!("created project '{}' at {}", project.name, project.root_path.display());
        }
        Command::List => {
            let names = store.list()?;
            if names.is_empty() {
                println!("no projects in {}", store.projects_dir().display());
            } else {
                for name in names {
                    println!("{name}");
                }
            }
        }
        Command::Delete { name } => {
            store.delete(&name)?;
            println!("deleted project '{name}'");
        }
        Command::RecreateEnv { name } => {
            let env = EnvManager::new(config.uv_bin.clone(), store.clone());
            let mut project = store.load(&name)?;
            env.remove(&mut project).await?;
            env.ensure(&mut project).await?;
            println!("recreated environment for '{name}'");
        }
        Command::Build {
            name,
            prompt,
            max_attempts,
        } => {
            let mut config = config;
            if let Some(budget) = max_attempts {
                config.max_fix_attempts = budget;
            }

            let backend = Arc::new(HttpBackend::new(BackendConfig::from_config(&config)));
            let (events_tx, mut events_rx) = tokio::sync::mpsc::unbounded_channel();
            let controller = forged::build_controller(&config, backend, events_tx);

            // Reference presentation consumer: print live log lines.
            let printer = tokio::spawn(async move {
                while let Some(event) = events_rx.recv().await {
                    match event {
                        LoopEvent::LogLine(payload) => match payload.stream {
                            LogStream::Stdout => println!("{}", payload.line),
                            LogStream::Stderr => eprintln!("{}", payload.line),
                            LogStream::Status => info!("{}", payload.line),
                        },
                        LoopEvent::StateChanged(payload) => {
                            info!(
                                project = %payload.project,
                                state = payload.to.as_str(),
                                attempt = payload.attempt,
                                "state"
                            );
                        }
                        _ => {}
                    }
                }
            });

            let cancel = CancellationToken::new();
            let ctrl_c_cancel = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("interrupt received, cancelling build");
                    ctrl_c_cancel.cancel();
                }
            });

            let report = controller.build(&name, prompt.as_deref(), cancel).await?;
            printer.abort();

            println!(
                "build finished: {} (attempts: {})",
                report.state.as_str(),
                report.attempts
            );
        }
    }

    Ok(())
}
