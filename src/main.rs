use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};

use conductor::config::Config;
use conductor::orchestration::{replay_file, DetachedWorker};
use conductor::process::{FunctionRegistry, InMemoryProcessRegistry};
use conductor::store::InMemoryTaskStore;
use conductor::{Collaborators, Error, Result, RuntimeEngine};

/// Conductor - event-driven runtime for multi-agent task trees
#[derive(Parser, Debug)]
#[command(name = "conductor")]
#[command(version, about, long_about = None)]
#[command(after_help = "ENVIRONMENT:\n    CONDUCTOR_DEBUG=1     Enable debug logging (alternative to --debug)\n    CONDUCTOR_LOG=<filter>  Override the log filter")]
pub struct Cli {
    /// Enable debug logging (writes to ~/.conductor/conductor.log)
    #[arg(short = 'd', long)]
    pub debug: bool,

    /// Configuration file (defaults to ~/.conductor/conductor.toml)
    #[arg(short = 'c', long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Rebuild task state from an event log and print it as JSON
    Replay {
        /// Event log written by a previous run
        log: PathBuf,

        /// Extra process templates used by the recorded run
        #[arg(long)]
        processes: Option<PathBuf>,
    },

    /// Validate the configuration and the tools it declares
    CheckConfig,

    /// Load a directory of process templates and report problems
    CheckProcesses {
        /// Directory of *.toml / *.json templates
        dir: PathBuf,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    conductor::log::init(cli.debug);

    let config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };

    match cli.command {
        Command::Replay { log, processes } => run_replay(config, &log, processes.as_deref()),
        Command::CheckConfig => run_check_config(config),
        Command::CheckProcesses { dir } => run_check_processes(&dir),
    }
}

/// Built-ins, `extra`, then `runtime.process_dir` (loaded and watched).
fn collaborators(config: &Config, extra: Option<&Path>) -> Result<Collaborators> {
    let registry = InMemoryProcessRegistry::with_builtins()?;
    if let Some(dir) = extra {
        let loaded = registry.load_dir(dir)?;
        tracing::info!(dir = %dir.display(), count = loaded.len(), "loaded processes");
    }
    Collaborators::from_config(config, registry, Arc::new(DetachedWorker))
}

fn run_replay(config: Config, log: &Path, processes: Option<&Path>) -> Result<()> {
    let mut collaborators = collaborators(&config, processes)?;
    let store = Arc::new(InMemoryTaskStore::new());
    collaborators.store = store.clone();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(async {
        let outcome = replay_file(log, config, collaborators).await?;
        eprintln!(
            "Replayed {} events (last {})",
            outcome.events, outcome.last_event
        );
        println!("{}", store.snapshot().await?);
        Ok::<(), Error>(())
    })
}

fn run_check_config(config: Config) -> Result<()> {
    let collaborators = collaborators(&config, None)?;
    let tools = config.tools.len();
    let agents = config.agents.len();
    let default_process = config.runtime.default_process.clone();

    // Engine construction runs the same validation as startup.
    RuntimeEngine::new(config, collaborators)?;

    println!("Configuration OK");
    println!("  agents:          {}", agents);
    println!("  tools:           {}", tools);
    println!("  default process: {}", default_process);
    Ok(())
}

fn run_check_processes(dir: &Path) -> Result<()> {
    let registry = InMemoryProcessRegistry::new();
    let loaded = registry.load_dir(dir)?;
    let missing = registry.missing_functions(&FunctionRegistry::builtin());

    for name in &loaded {
        println!("  ok  {}", name);
    }
    for (process, function) in &missing {
        println!("  !!  {} calls unknown function '{}'", process, function);
    }

    if missing.is_empty() {
        println!("{} process(es) loaded", loaded.len());
        Ok(())
    } else {
        Err(Error::Validation(format!(
            "{} unknown function reference(s)",
            missing.len()
        )))
    }
}
