use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use stepwise::config::Config;
use stepwise::llm;
use stepwise::memory::KnowledgeStore;
use stepwise::orchestrator::{OrchestratorAgent, PlanEvent};
use stepwise::project::WorkspaceContext;
use stepwise::workers;

#[derive(Parser)]
#[command(name = "stepwise")]
#[command(about = "AI coding assistant that plans requests and runs them step by step", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Plan and execute a single request
    Run {
        /// The request, in plain language
        request: String,
        /// Path to the project directory (default: current directory)
        #[arg(short, long, default_value = ".")]
        path: PathBuf,
        /// Extra context to pass to the planner
        #[arg(short, long)]
        context: Option<String>,
        /// Print the generated plan before executing it
        #[arg(long)]
        show_plan: bool,
    },
    /// Generate a plan without executing it (prints JSON)
    Plan {
        /// The request, in plain language
        request: String,
        /// Path to the project directory (default: current directory)
        #[arg(short, long, default_value = ".")]
        path: PathBuf,
    },
    /// Start an interactive session; every line is a new request
    Chat {
        /// Path to the project directory (default: current directory)
        #[arg(short, long, default_value = ".")]
        path: PathBuf,
    },
    /// Configure stepwise
    Config {
        /// Show current configuration
        #[arg(short, long)]
        show: bool,
        /// Set API key
        #[arg(long)]
        api_key: Option<String>,
        /// Set model
        #[arg(long)]
        model: Option<String>,
    },
    /// Initialize the project knowledge store
    Init {
        /// Path to initialize (default: current directory)
        #[arg(default_value = ".")]
        path: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "stepwise=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            request,
            path,
            context,
            show_plan,
        } => {
            run_request(path, &request, context.as_deref(), show_plan).await?;
        }
        Commands::Plan { request, path } => {
            print_plan(path, &request).await?;
        }
        Commands::Chat { path } => {
            run_chat(path).await?;
        }
        Commands::Config {
            show,
            api_key,
            model,
        } => {
            handle_config(show, api_key, model)?;
        }
        Commands::Init { path } => {
            init_project(path).await?;
        }
    }

    Ok(())
}

/// Wire the LLM client, workers and ambient context for a project
fn build_orchestrator(config: &Config, project_path: &Path) -> Result<OrchestratorAgent> {
    let client = llm::create_client(config)?;
    let registry = workers::default_registry(client.clone(), config, project_path);
    let store = KnowledgeStore::new(project_path, &config.memory.directory);
    let ambient = Arc::new(WorkspaceContext::new(project_path.to_path_buf(), store));

    Ok(OrchestratorAgent::new(
        config.orchestrator.clone(),
        client,
        registry,
        ambient,
    ))
}

/// Print plan events to stderr as they arrive
fn spawn_progress_printer() -> mpsc::UnboundedSender<PlanEvent> {
    let (tx, mut rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            match event {
                PlanEvent::PlanCreated {
                    task_category,
                    total_steps,
                    ..
                } => eprintln!("Plan ({}): {} steps", task_category, total_steps),
                PlanEvent::StepStarted {
                    step_id,
                    agent,
                    description,
                    ..
                } => eprintln!("  [{}] {}: {}", step_id, agent, description),
                PlanEvent::StepCompleted {
                    step_id, success, ..
                } => {
                    if !success {
                        eprintln!("  [{}] failed", step_id);
                    }
                }
                PlanEvent::CheckpointFired {
                    file_path, success, ..
                } => eprintln!(
                    "  memory: {} {}",
                    file_path,
                    if success { "updated" } else { "not updated" }
                ),
                PlanEvent::PlanCompleted {
                    executed_steps,
                    truncated,
                    ..
                } => eprintln!(
                    "Done: {} steps executed{}",
                    executed_steps,
                    if truncated { " (truncated)" } else { "" }
                ),
            }
        }
    });
    tx
}

async fn run_request(
    project_path: PathBuf,
    request: &str,
    additional_context: Option<&str>,
    show_plan: bool,
) -> Result<()> {
    let canonical_path = project_path.canonicalize()?;
    let config = Config::load()?;
    let mut orchestrator =
        build_orchestrator(&config, &canonical_path)?.with_events(spawn_progress_printer());

    let plan = orchestrator.create_plan(request, additional_context).await?;
    if show_plan {
        println!("{}\n", serde_json::to_string_pretty(&plan)?);
    }

    let answer = orchestrator.execute_plan().await;
    println!("{}", answer);

    Ok(())
}

async fn print_plan(project_path: PathBuf, request: &str) -> Result<()> {
    let canonical_path = project_path.canonicalize()?;
    let config = Config::load()?;
    let mut orchestrator = build_orchestrator(&config, &canonical_path)?;

    let plan = orchestrator.create_plan(request, None).await?;
    println!("{}", serde_json::to_string_pretty(&plan)?);

    Ok(())
}

async fn run_chat(project_path: PathBuf) -> Result<()> {
    let canonical_path = project_path.canonicalize()?;
    let config = Config::load()?;
    let mut orchestrator =
        build_orchestrator(&config, &canonical_path)?.with_events(spawn_progress_printer());

    println!("stepwise - plans your request, then runs it step by step");
    println!("Project: {}", canonical_path.display());
    println!("Type 'exit' or 'quit' to end the session\n");

    loop {
        print!("\n> ");
        io::stdout().flush()?;

        let mut input = String::new();
        if io::stdin().read_line(&mut input)? == 0 {
            break;
        }

        let input = input.trim();

        if input.is_empty() {
            continue;
        }

        if input == "exit" || input == "quit" {
            println!("Goodbye!");
            break;
        }

        match orchestrator.handle_request(input, None).await {
            Ok(answer) => println!("\n{}", answer),
            Err(e) => eprintln!("Error: {:#}", e),
        }
    }

    Ok(())
}

fn handle_config(show: bool, api_key: Option<String>, model: Option<String>) -> Result<()> {
    let mut config = Config::load()?;

    if show {
        println!("Current configuration:");
        println!("{}", toml::to_string_pretty(&config)?);
        return Ok(());
    }

    let mut changed = false;

    if let Some(key) = api_key {
        config.llm.api_key = Some(key);
        changed = true;
        println!("API key updated");
    }

    if let Some(m) = model {
        config.llm.model = m;
        changed = true;
        println!("Model updated");
    }

    if changed {
        config.save()?;
        println!("Configuration saved to: {:?}", Config::config_path()?);
    } else {
        println!("No changes made. Use --show to view current configuration.");
    }

    Ok(())
}

async fn init_project(path: PathBuf) -> Result<()> {
    tokio::fs::create_dir_all(&path)
        .await
        .with_context(|| format!("Failed to create {}", path.display()))?;
    let config = Config::load()?;
    let store = KnowledgeStore::new(&path, &config.memory.directory);

    if store.init().await? {
        println!("✓ Initialized knowledge store at: {}", store.root().display());
    } else {
        println!("Knowledge store already exists at: {}", store.root().display());
    }
    println!("\nNext steps:");
    println!("  1. Configure your API key: stepwise config --api-key YOUR_API_KEY");
    println!("  2. Run a request: stepwise run \"explain the build\" --path {}", path.display());

    Ok(())
}
