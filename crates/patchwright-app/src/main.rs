//! patchwright - an AI coding agent for React + TypeScript projects
//!
//! Turns a request into validated edits: plan, write SEARCH/REPLACE changes, type-check,
//! repair, and optionally have every step reviewed.

use anyhow::Result;
use clap::Parser;
use patchwright_adapters::config::{self, Config, Workflow};
use patchwright_adapters::keyring;
use patchwright_adapters::run_log::RunLog;
use patchwright_adapters::validator::TypeScriptValidator;
use patchwright_adapters::workspace::Workspace;
use patchwright_core::ModelInvoker;
use patchwright_engine::llm::{AgentRole, ClientSettings, OpenRouterClient};
use patchwright_engine::orchestrator::Agents;
use patchwright_engine::tools::StdinPrompter;
use patchwright_engine::{Orchestrator, RequestReport};
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(
    name = "patchwright",
    about = "AI coding agent that plans, edits and type-checks a React + TypeScript project",
    version
)]
struct Args {
    /// Project to work on (defaults to current directory)
    #[arg(long, env = "PROJECT_ROOT", default_value = ".")]
    project_root: PathBuf,

    /// direct, planned or reviewed (overrides config)
    #[arg(long, value_parser = parse_workflow)]
    workflow: Option<Workflow>,

    /// Don't echo streamed model output
    #[arg(short, long)]
    quiet: bool,

    /// Set up OpenRouter API key
    #[arg(long)]
    setup: bool,

    /// Run a single request and exit
    #[arg(long, value_name = "REQUEST")]
    once: Option<String>,
}

fn parse_workflow(value: &str) -> Result<Workflow, String> {
    Workflow::parse(value)
        .ok_or_else(|| format!("unknown workflow '{}' (expected direct, planned or reviewed)", value))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.setup {
        return setup_api_key();
    }

    let root = args
        .project_root
        .canonicalize()
        .map_err(|e| anyhow::anyhow!("Project root {}: {}", args.project_root.display(), e))?;
    let mut config = Config::resolve(&root)?;
    if let Some(workflow) = args.workflow {
        config.workflow = workflow;
    }

    let Some(api_key) = config.get_api_key() else {
        eprintln!("  ! No API key configured.");
        eprintln!("  ! Run `patchwright --setup` or set OPENROUTER_API_KEY.");
        return Err(anyhow::anyhow!("Missing API key"));
    };

    let mut orchestrator = build_orchestrator(&root, config, api_key, !args.quiet)?;
    eprintln!(
        "  + {} · workflow: {}",
        root.display(),
        orchestrator.workflow().as_str()
    );
    if let Some(dir) = orchestrator.run_log().dir() {
        eprintln!("  + Run log: {}", dir.display());
    }

    if let Some(request) = args.once {
        let report = orchestrator.handle_user_request(&request).await;
        print_report(&report);
        if !report.is_success() {
            std::process::exit(1);
        }
        return Ok(());
    }

    run_interactive(&mut orchestrator).await
}

fn build_orchestrator(
    root: &Path,
    config: Config,
    api_key: String,
    echo: bool,
) -> Result<Orchestrator> {
    let client = |role: AgentRole| -> Result<Arc<dyn ModelInvoker>> {
        let settings = ClientSettings::from_config(&config, role, api_key.clone()).with_echo(echo);
        Ok(Arc::new(OpenRouterClient::new(settings)?))
    };
    let agents = Agents {
        planner: client(AgentRole::Planner)?,
        coder: client(AgentRole::Coder)?,
        reviewer: client(AgentRole::Reviewer)?,
    };

    let workspace = Workspace::new(root)?;
    let validator = TypeScriptValidator::new(
        root,
        Duration::from_secs(config.validator_timeout_secs),
    )
    .with_check_command(config.check_command.clone());
    let run_log = if config.log_runs {
        RunLog::create(root).unwrap_or_else(|e| {
            eprintln!("  ! Run logging disabled: {}", e);
            RunLog::disabled()
        })
    } else {
        RunLog::disabled()
    };

    Ok(Orchestrator::new(
        config,
        workspace,
        agents,
        Arc::new(validator),
        Arc::new(StdinPrompter),
        run_log,
    ))
}

/// Prompt loop. Ctrl-C cancels the request in flight; `exit` or EOF ends the session.
async fn run_interactive(orchestrator: &mut Orchestrator) -> Result<()> {
    eprintln!("  Type a request, or `exit` to quit.");
    let stdin = io::stdin();
    loop {
        print!("\n>>> ");
        io::stdout()
            .flush()
            .map_err(|e| anyhow::anyhow!("Failed to write prompt: {}", e))?;

        let mut line = String::new();
        let read = stdin
            .lock()
            .read_line(&mut line)
            .map_err(|e| anyhow::anyhow!("Failed to read input: {}", e))?;
        if read == 0 {
            println!();
            return Ok(());
        }
        let request = line.trim();
        if request.is_empty() {
            continue;
        }
        if matches!(request.to_ascii_lowercase().as_str(), "exit" | "quit") {
            return Ok(());
        }

        tokio::select! {
            report = orchestrator.handle_user_request(request) => print_report(&report),
            _ = tokio::signal::ctrl_c() => {
                println!();
                eprintln!("  ! Request cancelled. Changes already written stay on disk.");
            }
        }
    }
}

fn print_report(report: &RequestReport) {
    println!();
    if report.is_success() {
        println!(
            "  + {}",
            report.reason.as_deref().unwrap_or("Request completed.")
        );
        return;
    }
    println!(
        "  Reason: {}",
        report.reason.as_deref().unwrap_or("Unknown failure")
    );
    if let Some(details) = &report.details {
        println!("  Details: {}", details);
    }
}

/// Set up the API key interactively
fn setup_api_key() -> Result<()> {
    config::setup_api_key_interactive().map_err(|e| anyhow::anyhow!("{}", e))?;

    let config = Config::load();
    match config.get_api_key() {
        Some(_) => {
            println!("  + API key verified and ready to use!");
        }
        None => {
            eprintln!();
            eprintln!("  ! Warning: API key was saved but cannot be read back.");
            eprintln!(
                "  ! This may be due to {} access issues.",
                keyring::credentials_store_label()
            );
            eprintln!();
            eprintln!("  Workaround: Set the OPENROUTER_API_KEY environment variable:");
            eprintln!("    export OPENROUTER_API_KEY=\"your-key-here\"");
            eprintln!();
            return Err(anyhow::anyhow!("API key verification failed"));
        }
    }

    Ok(())
}
