//! # foundry
//!
//! Terminal client for the human-in-the-loop workflow service: start a run,
//! watch the agents work, approve or send back the artifact, and pick up an
//! interrupted session after a restart.

#![deny(unsafe_code)]

mod render;

use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, info};

use foundry_client::{
    ClearReason, HttpStreamTransport, HttpWorkflowApi, Negotiation, ReconnectPolicy,
    ResumeOutcome, SessionController, SessionUpdate, WorkflowApi,
};
use foundry_core::{ClientError, ConnectionState, Milestone, WorkflowEvent};
use foundry_settings::FoundrySettings;
use foundry_store::{Database, SessionStore};
use foundry_telemetry::{init_telemetry, parse_level, TelemetryConfig};

/// Client for the multi-agent review workflow.
#[derive(Parser, Debug)]
#[command(name = "foundry", about = "Human-in-the-loop workflow client")]
struct Cli {
    /// Base URL of the workflow service (overrides settings).
    #[arg(long, global = true)]
    server: Option<String>,

    /// Path to the session database (overrides settings).
    #[arg(long, global = true)]
    store: Option<PathBuf>,

    /// Settings file to load instead of `~/.foundry/settings.json`.
    #[arg(long, global = true)]
    settings: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start a new workflow run and watch it.
    Start {
        /// What the workflow should produce.
        #[arg(required = true, num_args = 1..)]
        query: Vec<String>,

        /// Write the final artifact here once the run completes.
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Resume the interrupted session, if any.
    Resume {
        /// Resume without asking.
        #[arg(long)]
        yes: bool,

        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Forget the stored session.
    Discard,
    /// Show the stored session and what the service knows about it.
    Status,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    let settings = load_settings(&cli)?;

    let _telemetry = init_telemetry(TelemetryConfig {
        log_level: parse_level(&settings.logging.level).unwrap_or(tracing::Level::WARN),
        module_levels: Vec::new(),
        json: settings.logging.json,
    });
    debug!(?settings, "settings loaded");

    let db = Database::open(&settings.store.path)
        .with_context(|| format!("Failed to open session store: {}", settings.store.path.display()))?;
    let store = SessionStore::new(db);

    let server = &settings.server;
    let api = Arc::new(
        HttpWorkflowApi::new(
            server.base_url.clone(),
            server.connect_timeout(),
            server.request_timeout(),
        )
        .context("Failed to build HTTP client")?,
    );
    let transport = Arc::new(
        HttpStreamTransport::new(server.base_url.clone(), server.connect_timeout())
            .context("Failed to build HTTP client")?,
    );
    let policy = ReconnectPolicy {
        max_attempts: settings.stream.max_reconnect_attempts,
        base_delay: std::time::Duration::from_millis(settings.stream.base_delay_ms),
        max_delay: std::time::Duration::from_millis(settings.stream.max_delay_ms),
    };

    info!(server = %server.base_url, "foundry client ready");

    match cli.command {
        Command::Start { query, output } => {
            let mut controller = SessionController::new(api, transport, policy, store);
            let negotiation = controller.check_for_interrupted().await;
            if let Some(notice) = replacement_notice(&negotiation) {
                println!("{notice}");
            }
            let query = query.join(" ");
            let thread_id = controller.start(&query).await.context("Failed to start workflow")?;
            println!("Started session {thread_id}");
            watch(&mut controller, output.as_deref()).await
        }
        Command::Resume { yes, output } => {
            let mut controller = SessionController::new(api, transport, policy, store);
            resume(&mut controller, yes, output.as_deref()).await
        }
        Command::Discard => {
            store.clear().context("Failed to clear session store")?;
            println!("Stored session discarded.");
            Ok(ExitCode::SUCCESS)
        }
        Command::Status => status(&store, &*api).await,
    }
}

fn load_settings(cli: &Cli) -> Result<FoundrySettings> {
    let mut settings = match &cli.settings {
        Some(path) => foundry_settings::load_settings_from_path(path)
            .with_context(|| format!("Failed to load settings: {}", path.display()))?,
        None => foundry_settings::load_settings().with_context(|| {
            format!(
                "Failed to load settings: {}",
                foundry_settings::settings_path().display()
            )
        })?,
    };
    if let Some(server) = &cli.server {
        settings.server.base_url = server.trim_end_matches('/').to_string();
    }
    if let Some(store) = &cli.store {
        settings.store.path = store.clone();
    }
    Ok(settings)
}

async fn resume(
    controller: &mut SessionController,
    yes: bool,
    output: Option<&Path>,
) -> Result<ExitCode> {
    let saved = match controller.check_for_interrupted().await {
        Negotiation::NoSession => {
            println!("No interrupted session.");
            return Ok(ExitCode::SUCCESS);
        }
        Negotiation::Cleared { thread_id, reason } => {
            let why = match reason {
                ClearReason::NotFound => "the service no longer knows it".to_string(),
                ClearReason::Completed => "it already finished".to_string(),
                ClearReason::CheckFailed(e) => format!("its status could not be checked ({e})"),
            };
            println!("Forgot stored session {thread_id}: {why}.");
            return Ok(ExitCode::SUCCESS);
        }
        Negotiation::Prompt(saved) => saved,
    };

    println!("Interrupted session {}: \"{}\"", saved.thread_id, saved.query);
    if !yes && !confirm("Resume it? [y/N] ").await? {
        controller.discard();
        println!("Session discarded.");
        return Ok(ExitCode::SUCCESS);
    }

    match controller.resume(saved).await {
        Ok(ResumeOutcome::Resumed(thread_id)) => {
            println!("Resumed session {thread_id}");
            watch(controller, output).await
        }
        Ok(ResumeOutcome::AlreadyCompleted(thread_id)) => {
            println!("Session {thread_id} had already completed.");
            Ok(ExitCode::SUCCESS)
        }
        Err(e) => {
            eprintln!("Resume failed: {e}. The session is kept; try again later.");
            Ok(ExitCode::FAILURE)
        }
    }
}

/// What `start` tells the user about a stored session it is about to replace.
fn replacement_notice(negotiation: &Negotiation) -> Option<String> {
    match negotiation {
        Negotiation::Prompt(saved) => Some(format!(
            "Replacing interrupted session {} (\"{}\"). Use `foundry resume` to continue it instead.",
            saved.thread_id, saved.query
        )),
        Negotiation::NoSession | Negotiation::Cleared { .. } => None,
    }
}

async fn status(store: &SessionStore, api: &dyn WorkflowApi) -> Result<ExitCode> {
    let Some(saved) = store.load().context("Failed to read session store")? else {
        println!("No stored session.");
        return Ok(ExitCode::SUCCESS);
    };
    println!("session: {}\nquery:   {}", saved.thread_id, saved.query);
    match api.check_thread(&saved.thread_id).await {
        Ok(check) if !check.exists => println!("service: unknown thread"),
        Ok(check) => {
            let state = if check.completed { "completed" } else { "resumable" };
            println!("service: {state}");
            if let Some(status) = &check.status {
                println!("stage:   {status}");
            }
            if let Some(next) = &check.next_node {
                println!("next:    {next}");
            }
        }
        Err(e) => println!("service: unreachable ({e})"),
    }
    Ok(ExitCode::SUCCESS)
}

enum Input {
    Approve,
    Revise(String),
    Status,
    Detach,
    Help,
    Unknown(String),
}

fn parse_input(line: &str) -> Option<Input> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    let (head, rest) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
    Some(match head.to_lowercase().as_str() {
        "approve" | "a" => Input::Approve,
        "revise" | "r" => Input::Revise(rest.trim().to_string()),
        "status" | "s" => Input::Status,
        "detach" | "quit" | "q" => Input::Detach,
        "help" | "?" => Input::Help,
        _ => Input::Unknown(line.to_string()),
    })
}

/// Follow the active session until it finishes, fails, or the user detaches.
async fn watch(controller: &mut SessionController, output: Option<&Path>) -> Result<ExitCode> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;

    loop {
        tokio::select! {
            update = controller.next_update() => {
                if let Some(code) = on_update(controller, update, output)? {
                    return Ok(code);
                }
            }
            line = lines.next_line(), if stdin_open => {
                match line.context("Failed to read stdin")? {
                    Some(line) => {
                        if let Some(code) = on_input(controller, &line).await {
                            return Ok(code);
                        }
                    }
                    None => stdin_open = false,
                }
            }
            _ = tokio::signal::ctrl_c() => {
                controller.detach();
                println!("\nDetached. Run `foundry resume` to continue.");
                return Ok(ExitCode::SUCCESS);
            }
        }
    }
}

fn on_update(
    controller: &SessionController,
    update: SessionUpdate,
    output: Option<&Path>,
) -> Result<Option<ExitCode>> {
    let (event, milestone) = match update {
        SessionUpdate::Event { event, milestone } => (event, milestone),
        SessionUpdate::Connection(state) => {
            debug!(%state, "connection state changed");
            return Ok(None);
        }
        SessionUpdate::Stale => return Ok(None),
    };

    if let Some(line) = render::format_event(&event) {
        println!("{line}");
    }

    let state = controller.state();
    match milestone {
        Some(Milestone::Paused) => {
            print!("{}", render::format_artifact(state.artifact()));
            println!("{}", render::review_help(state.session_status()));
        }
        Some(Milestone::Completed) => {
            print!("{}", render::format_artifact(state.artifact()));
            if let Some(path) = output {
                std::fs::write(path, state.artifact())
                    .with_context(|| format!("Failed to write artifact: {}", path.display()))?;
                println!("Artifact written to {}", path.display());
            }
            println!("Workflow complete.");
            return Ok(Some(ExitCode::SUCCESS));
        }
        Some(Milestone::Rejected) => {
            println!("Workflow rejected the request.");
            return Ok(Some(ExitCode::from(2)));
        }
        None => {}
    }

    if *controller.connection() == ConnectionState::Failed
        && event == WorkflowEvent::connection_failed()
    {
        eprintln!("Lost the event stream. Run `foundry resume` to reconnect.");
        return Ok(Some(ExitCode::FAILURE));
    }
    Ok(None)
}

async fn on_input(controller: &mut SessionController, line: &str) -> Option<ExitCode> {
    match parse_input(line)? {
        Input::Approve => match controller.approve().await {
            Ok(ack) => {
                println!("Approved.");
                if let Some(path) = ack.saved_to {
                    println!("Service saved the artifact to {path}");
                }
            }
            Err(e) => report(&e),
        },
        Input::Revise(feedback) => match controller.request_revision(&feedback).await {
            Ok(_) => println!("Revision requested."),
            Err(e) => report(&e),
        },
        Input::Status => print!("{}", render::format_summary(controller.state())),
        Input::Detach => {
            controller.detach();
            println!("Detached. Run `foundry resume` to continue.");
            return Some(ExitCode::SUCCESS);
        }
        Input::Help => println!("{}", render::review_help(controller.state().session_status())),
        Input::Unknown(text) => println!("Unknown command {text:?}. Type `help`."),
    }
    None
}

fn report(err: &ClientError) {
    debug!(error = %err, error_kind = err.error_kind(), "command rejected");
    match err {
        ClientError::InvalidInput(msg) | ClientError::InvalidState(msg) => println!("{msg}"),
        other if other.is_retryable() => println!("{other} (try again)"),
        other => println!("{other}"),
    }
}

async fn confirm(prompt: &str) -> Result<bool> {
    print!("{prompt}");
    std::io::stdout().flush().context("Failed to flush stdout")?;
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let answer = lines.next_line().await.context("Failed to read stdin")?;
    Ok(matches!(
        answer.as_deref().map(str::trim).map(str::to_lowercase).as_deref(),
        Some("y" | "yes")
    ))
}
