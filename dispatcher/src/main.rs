//! Dispatcher CLI.
//!
//! `.dispatcher/` in the repository root holds everything the engine owns:
//! the state file, the single-writer lock, the command queue, and per-session
//! logs. Every subcommand resolves paths from `--root` and exits with the
//! stable codes in [`dispatcher::exit_codes`].

use std::path::PathBuf;

use anyhow::{Context, Result, anyhow};
use clap::{Parser, Subcommand};

use dispatcher::agents::{InteractiveRequest, adapter_for, agent_names};
use dispatcher::commands::{self, AddOptions};
use dispatcher::core::plan::{Plan, WorkerRef, todo_display};
use dispatcher::dispatch::{Dispatcher, RegistryResolver};
use dispatcher::exit_codes;
use dispatcher::io::config::load_config;
use dispatcher::io::init::{DispatcherPaths, InitOptions, init_dispatcher};
use dispatcher::io::lock::LockHeldError;
use dispatcher::io::plan_doc::MarkdownPlanParser;
use dispatcher::io::review::GhReviewProvider;
use dispatcher::io::worktree::GitWorktreeProvider;
use dispatcher::logging;

#[derive(Parser)]
#[command(
    name = "dispatcher",
    version,
    about = "Orchestrates autonomous coding-agent workers over markdown plans"
)]
struct Cli {
    /// Repository root containing `.dispatcher/`.
    #[arg(long, default_value = ".", global = true)]
    root: PathBuf,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create `.dispatcher/` scaffolding.
    Init {
        /// Overwrite existing dispatcher-owned files.
        #[arg(short, long)]
        force: bool,
    },
    /// Accept a plan document and register it as queued.
    Add {
        /// Path to the plan markdown file.
        plan_file: PathBuf,
        /// Plan id (defaults to the file stem).
        #[arg(long)]
        id: Option<String>,
        /// Agent to run this plan (defaults to the configured default).
        #[arg(long)]
        agent: Option<String>,
        /// Base branch for the plan's worktree.
        #[arg(long)]
        base: Option<String>,
    },
    /// Run the control loop until interrupted.
    Run,
    /// Run exactly one cycle and exit.
    Once,
    /// Show every tracked plan.
    Status,
    /// Block a plan, keeping it from being dispatched.
    Block { plan_id: String },
    /// Clear a blocked plan back to active.
    Unblock { plan_id: String },
    /// Resume a paused plan.
    Resume { plan_id: String },
    /// Queue an advisory stop for a plan.
    Stop { plan_id: String },
    /// Forcibly terminate a plan's live worker and pause the plan.
    Kill { plan_id: String },
    /// Queue a review trigger for a plan awaiting review.
    Review { plan_id: String },
    /// Mark a plan done.
    Done { plan_id: String },
    /// Remove a done plan from the state file.
    Archive { plan_id: String },
    /// Attach read-only to a plan's live session.
    Attach { plan_id: String },
    /// Open the plan's agent interactively in its worktree.
    Interactive {
        plan_id: String,
        /// Initial prompt, where the agent supports one.
        #[arg(long)]
        prompt: Option<String>,
        #[arg(long)]
        model: Option<String>,
    },
    /// List the registered agent integrations.
    Agents,
}

fn main() {
    logging::init();
    if let Err(err) = run() {
        eprintln!("{err:#}");
        let code = if err.downcast_ref::<LockHeldError>().is_some() {
            exit_codes::LOCK_HELD
        } else {
            exit_codes::INVALID
        };
        std::process::exit(code);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    let paths = DispatcherPaths::new(&cli.root);
    match cli.command {
        Command::Init { force } => {
            init_dispatcher(&cli.root, &InitOptions { force })?;
            println!("initialized {}", paths.dispatcher_dir.display());
            Ok(())
        }
        Command::Add {
            plan_file,
            id,
            agent,
            base,
        } => {
            let config = load_config(&paths.config_path)?;
            let plan = commands::add_plan(
                &paths,
                &MarkdownPlanParser,
                &GitWorktreeProvider,
                &plan_file,
                &config.default_agent,
                &config.base_branch,
                &AddOptions {
                    id,
                    agent,
                    base_branch: base,
                },
            )?;
            println!("added plan '{}' on branch {}", plan.id, plan.branch);
            Ok(())
        }
        Command::Run => with_dispatcher(&cli.root, |d| d.run_loop()),
        Command::Once => with_dispatcher(&cli.root, |d| {
            let outcome = d.cycle()?;
            println!(
                "{} plans, {} commands, {} promoted, {} launched, {} completed",
                outcome.plans,
                outcome.commands_applied,
                outcome.promoted,
                outcome.launched,
                outcome.completed
            );
            Ok(())
        }),
        Command::Status => cmd_status(&paths),
        Command::Block { plan_id } => commands::block(&paths, &plan_id),
        Command::Unblock { plan_id } => commands::unblock(&paths, &plan_id),
        Command::Resume { plan_id } => commands::resume(&paths, &plan_id),
        Command::Stop { plan_id } => commands::stop(&paths, &plan_id),
        Command::Kill { plan_id } => with_dispatcher(&cli.root, |d| {
            commands::kill(&paths, d.sessions(), &plan_id)
        }),
        Command::Review { plan_id } => commands::review(&paths, &plan_id),
        Command::Done { plan_id } => commands::done(&paths, &plan_id),
        Command::Archive { plan_id } => {
            let plan = commands::archive(&paths, &plan_id)?;
            println!(
                "archived '{}'; worktree {} left in place",
                plan.id,
                plan.worktree.display()
            );
            Ok(())
        }
        Command::Attach { plan_id } => with_dispatcher(&cli.root, |d| {
            d.sessions()
                .attach_read_only(&plan_id)
                .with_context(|| format!("attach to session '{plan_id}'"))
        }),
        Command::Interactive {
            plan_id,
            prompt,
            model,
        } => cmd_interactive(&paths, &plan_id, prompt, model),
        Command::Agents => {
            for name in agent_names() {
                println!("{name}");
            }
            Ok(())
        }
    }
}

fn with_dispatcher(root: &std::path::Path, f: impl FnOnce(&Dispatcher) -> Result<()>) -> Result<()> {
    let paths = DispatcherPaths::new(root);
    let config = load_config(&paths.config_path)?;
    let parser = MarkdownPlanParser;
    let review = GhReviewProvider;
    let resolver = RegistryResolver;
    let dispatcher = Dispatcher::new(root, config, &parser, &review, &resolver);
    f(&dispatcher)
}

fn cmd_status(paths: &DispatcherPaths) -> Result<()> {
    let state = commands::snapshot(paths)?;
    if state.plans.is_empty() {
        println!("no plans");
        return Ok(());
    }
    for plan in state.plans.values() {
        println!("{}", format_plan(plan));
        if let Some(err) = &plan.last_error {
            println!("    last error: {err}");
        }
    }
    Ok(())
}

fn format_plan(plan: &Plan) -> String {
    let worker = match &plan.worker {
        Some(WorkerRef::Session(id)) => format!("session {id}"),
        Some(WorkerRef::Process(pid)) => format!("pid {pid}"),
        None => "idle".to_string(),
    };
    let blocked = if plan.blocked { " [blocked]" } else { "" };
    format!(
        "{}  {}{}  {}  retries {}  {}",
        plan.id,
        plan.status,
        blocked,
        todo_display(plan.current_todo),
        plan.retry_count,
        worker
    )
}

fn cmd_interactive(
    paths: &DispatcherPaths,
    plan_id: &str,
    prompt: Option<String>,
    model: Option<String>,
) -> Result<()> {
    let state = commands::snapshot(paths)?;
    let plan = state
        .plans
        .get(plan_id)
        .ok_or_else(|| anyhow!("no such plan '{plan_id}'"))?;
    let adapter = adapter_for(&plan.agent)?;
    adapter.interactive(&InteractiveRequest {
        workdir: plan.worktree.clone(),
        prompt,
        model,
    })
}
