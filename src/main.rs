//! Phasegate CLI
//!
//! Phase-gated delivery orchestration: every phase advance is backed by a
//! recorded gate execution.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use phasegate::workflow::{FileStateStore, PhaseController, StateStore};
use phasegate::{report, Config, Error, Result};

#[derive(Parser)]
#[command(name = "phasegate")]
#[command(author, version, about = "Phase-gated delivery orchestration")]
#[command(propagate_version = true)]
struct Cli {
    /// Project root the orchestration state belongs to
    #[arg(long, global = true, env = "PHASEGATE_ROOT")]
    project_root: Option<PathBuf>,

    /// Configuration file path
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a phase's gate if the previous phase passed
    RunPhase {
        /// Phase number
        phase: u32,
    },

    /// Check whether a phase may be entered
    CanProceed {
        /// Phase number
        phase: u32,
    },

    /// Check that every blocking phase has a passing gate result
    VerifyGates {
        /// Print the verdict as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show orchestration state
    Status {
        /// Print the raw state document
        #[arg(long)]
        json: bool,
    },

    /// List every recorded gate execution
    History {
        /// Only show one phase
        #[arg(long)]
        phase: Option<u32>,
    },

    /// Print the full output of a phase's latest gate execution
    ShowOutput {
        /// Phase number
        phase: u32,
    },

    /// Archive the current state and start over
    Reset {
        /// Skip the confirmation prompt
        #[arg(long)]
        yes: bool,
    },

    /// Write the default configuration to .phasegate/config.toml
    Init {
        /// Force overwrite existing config
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Initialize tracing
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if cli.verbose {
            EnvFilter::new("debug")
        } else {
            EnvFilter::new("info")
        }
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            error!("{}", e);
            eprintln!("error: {}", e);
            ExitCode::from(2)
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let root = project_root(cli.project_root.as_deref())?;

    if let Commands::Init { force } = cli.command {
        match phasegate::config::init(&root, force)? {
            Some(path) => info!("Created default config at {}", path.display()),
            None => eprintln!("Config already exists. Use --force to overwrite."),
        }
        return Ok(ExitCode::SUCCESS);
    }

    let config = Config::load(cli.config.as_deref(), &root)?;
    let store: Arc<dyn StateStore> = Arc::new(FileStateStore::new(&root, &config));
    let controller = PhaseController::from_config(&config, store.clone())?;

    let code = match cli.command {
        Commands::RunPhase { phase } => {
            let outcome = controller.run_phase(phase).await?;
            println!("{}", report::outcome(phase, &outcome, controller.phases()));
            exit_code(outcome.passed())
        }

        Commands::CanProceed { phase } => {
            let transition = controller.can_advance_to(phase)?;
            println!("{}", report::transition(phase, &transition));
            exit_code(transition.is_allowed())
        }

        Commands::VerifyGates { json } => {
            let verification = controller.verify_all_blocking_phases_passed();
            let all_passed = verification.all_passed();
            if json {
                let value = serde_json::json!({
                    "all_passed": all_passed,
                    "phases": &verification.phases,
                });
                println!("{}", serde_json::to_string_pretty(&value)?);
            } else {
                println!("{}", report::verification(&verification));
            }
            exit_code(all_passed)
        }

        Commands::Status { json } => {
            let state = store.load();
            if json {
                println!("{}", serde_json::to_string_pretty(&state)?);
            } else {
                println!("{}", report::status(&state, controller.phases()));
            }
            ExitCode::SUCCESS
        }

        Commands::History { phase } => {
            if let Some(phase) = phase {
                controller.phases().get(phase)?;
            }
            println!("{}", report::history(&store.load(), phase));
            ExitCode::SUCCESS
        }

        Commands::ShowOutput { phase } => {
            controller.phases().get(phase)?;
            match store.load().latest(phase) {
                Some(result) => {
                    let read = store.read_output(result);
                    println!("{}", report::output(result, &read));
                    ExitCode::SUCCESS
                }
                None => {
                    println!("No gate result recorded for phase {}", phase);
                    ExitCode::FAILURE
                }
            }
        }

        Commands::Reset { yes } => {
            if !yes && !confirm_reset(&root)? {
                println!("Reset cancelled");
                return Ok(ExitCode::FAILURE);
            }
            let state = store.reset()?;
            println!(
                "Orchestration state reset; new run started at {}",
                state.started_at.to_rfc3339()
            );
            ExitCode::SUCCESS
        }

        Commands::Init { .. } => ExitCode::SUCCESS,
    };

    Ok(code)
}

fn exit_code(success: bool) -> ExitCode {
    if success {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

/// Resolve the project root to an absolute path
fn project_root(root: Option<&Path>) -> Result<PathBuf> {
    let root = match root {
        Some(root) => root.to_path_buf(),
        None => std::env::current_dir()?,
    };
    std::fs::canonicalize(&root).map_err(|e| {
        Error::Config(format!(
            "Project root {} is not accessible: {}",
            root.display(),
            e
        ))
    })
}

/// Ask on the terminal before discarding the current run
fn confirm_reset(root: &Path) -> Result<bool> {
    print!(
        "Reset orchestration state for {}? The current state is archived and a new run starts. [y/N] ",
        root.display()
    );
    std::io::stdout().flush()?;

    let mut input = String::new();
    std::io::stdin().read_line(&mut input)?;
    Ok(matches!(input.trim().to_lowercase().as_str(), "y" | "yes"))
}
