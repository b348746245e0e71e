use std::io::{self, BufRead, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{CommandFactory, Parser, Subcommand};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use sift_core::config::AppConfig;
use sift_core::state::PipelineState;
use sift_core::traits::ResourceService;
use sift_core::types::{
    ConversationTurn, ExecutionContext, ExecutionReport, PipelineEvent, RequestId,
};
use sift_engine::{
    BudgetDecision, ConfirmationDecision, JsonlRecordSink, Orchestrator, OrchestratorBuilder,
    RequestOutcome, Response, TracingRecordSink,
};
use sift_strategies::{HttpResourceClient, UnconfiguredResources};

#[derive(Parser)]
#[command(name = "sift", version, about = "Answers questions about your mail and calendar")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "sift.toml")]
    config: PathBuf,

    /// Approve plans that need confirmation without asking
    #[arg(short, long, global = true)]
    yes: bool,

    /// IANA timezone the user is in
    #[arg(long, env = "SIFT_TIMEZONE", global = true)]
    timezone: Option<String>,

    /// Bearer token forwarded to the resource gateway
    #[arg(long, env = "SIFT_AUTH_TOKEN", hide_env_values = true, global = true)]
    auth_token: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Answer a single question and exit
    Run {
        /// The question (read from stdin when empty)
        #[arg(trailing_var_arg = true)]
        query: Vec<String>,
    },
    /// Show the plan for a question without running it
    Plan {
        #[arg(trailing_var_arg = true)]
        query: Vec<String>,
    },
    /// Start interactive REPL mode
    Repl,
    /// Show current configuration
    Config,
    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("sift=info,warn")),
        )
        .with_target(false)
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();

    if let Some(Commands::Completions { shell }) = &cli.command {
        let mut cmd = Cli::command();
        clap_complete::generate(*shell, &mut cmd, "sift", &mut io::stdout());
        return Ok(());
    }

    let config = load_config(&cli.config)?;

    if let Some(Commands::Config) = &cli.command {
        let mut shown = config.clone();
        if shown.model.api_key.is_some() {
            shown.model.api_key = Some("********".into());
        }
        println!("{}", toml::to_string_pretty(&shown)?);
        return Ok(());
    }

    let orchestrator = build_orchestrator(&config)?;
    let session = Session {
        orchestrator: &orchestrator,
        timezone: cli.timezone.clone(),
        auth_token: cli.auth_token.clone(),
        auto_approve: cli.yes,
    };

    match cli.command {
        Some(Commands::Run { query }) => {
            let query = query_or_stdin(query)?;
            let response = session.answer(&query, &[], None).await?;
            println!("{}", response.text);
            if response.state == PipelineState::Failed {
                std::process::exit(1);
            }
        }
        Some(Commands::Plan { query }) => {
            let query = query_or_stdin(query)?;
            session.show_plan(&query).await?;
        }
        Some(Commands::Repl) | None => run_repl(&session).await?,
        Some(Commands::Config) | Some(Commands::Completions { .. }) => {
            unreachable!("handled before the pipeline is built")
        }
    }

    Ok(())
}

/// `path` if it exists, then `~/.sift/config.toml`, then a minimal config
/// built from `ANTHROPIC_API_KEY`.
fn load_config(path: &Path) -> anyhow::Result<AppConfig> {
    if path.exists() {
        info!(path = %path.display(), "Loading config");
        return Ok(AppConfig::load(path)?);
    }
    if let Some(home) = dirs_home().map(|h| h.join(".sift").join("config.toml")) {
        if home.exists() {
            info!(path = %home.display(), "Loading config from home directory");
            return Ok(AppConfig::load(&home)?);
        }
    }
    if std::env::var("ANTHROPIC_API_KEY").is_err() {
        anyhow::bail!(
            "No config file found at {}. Set ANTHROPIC_API_KEY or create sift.toml (see sift.toml.example).",
            path.display()
        );
    }
    eprintln!("Warning: no config file found, using ANTHROPIC_API_KEY with defaults.");
    Ok(AppConfig::parse(
        "[model]\nprovider = \"anthropic\"\nmodel_id = \"claude-sonnet-4-20250514\"\napi_key = \"${ANTHROPIC_API_KEY}\"\n",
    )?)
}

fn build_orchestrator(config: &AppConfig) -> anyhow::Result<Orchestrator> {
    let inference = sift_llm::build_inference(config)?;
    let resources: Arc<dyn ResourceService> = match config.resources {
        Some(ref resources) => Arc::new(HttpResourceClient::new(resources)?),
        None => {
            warn!("No [resources] section configured; every lookup will fail");
            Arc::new(UnconfiguredResources)
        }
    };

    let mut builder = OrchestratorBuilder::new(config.clone(), inference, resources)
        .with_sink(Arc::new(TracingRecordSink));
    if let Some(dir) = config.record_dir() {
        info!(dir = %dir.display(), "Writing execution records");
        builder = builder.with_sink(Arc::new(JsonlRecordSink::new(dir)));
    }
    Ok(builder.build())
}

struct Session<'a> {
    orchestrator: &'a Orchestrator,
    timezone: Option<String>,
    auth_token: Option<String>,
    auto_approve: bool,
}

impl Session<'_> {
    fn context(&self) -> ExecutionContext {
        let mut ctx = ExecutionContext::new(chrono::Utc::now());
        if let Some(ref tz) = self.timezone {
            ctx = ctx.with_timezone(tz.clone());
        }
        if let Some(ref token) = self.auth_token {
            ctx = ctx.with_authorization(token.clone());
        }
        ctx
    }

    /// Run one request to completion, asking for confirmation when the plan
    /// needs it. Ctrl-C cancels the request and keeps whatever finished.
    async fn answer(
        &self,
        query: &str,
        history: &[ConversationTurn],
        prior: Option<&ExecutionReport>,
    ) -> anyhow::Result<Response> {
        let ctx = self.context();
        let cancel = CancellationToken::new();
        let signal = watch_ctrl_c(cancel.clone());
        let progress = print_progress(self.orchestrator, ctx.request_id.clone());

        let mut outcome = match prior {
            Some(prior) => {
                self.orchestrator
                    .follow_up(query, history, ctx, prior, cancel.clone())
                    .await
            }
            None => {
                self.orchestrator
                    .process_request(query, history, ctx, cancel.clone())
                    .await
            }
        };

        let response = loop {
            match outcome {
                Ok(RequestOutcome::Answered(response)) => break Ok(response),
                Ok(RequestOutcome::AwaitingConfirmation(pending)) => {
                    eprintln!("\n{}", pending.summary());
                    let decision = if self.auto_approve || ask("Go ahead?").await? {
                        ConfirmationDecision::Approved
                    } else {
                        ConfirmationDecision::Rejected
                    };
                    outcome = self
                        .orchestrator
                        .resume(pending, decision, cancel.clone())
                        .await;
                }
                Err(e) => break Err(e),
            }
        };

        signal.abort();
        progress.abort();
        Ok(response?)
    }

    async fn show_plan(&self, query: &str) -> anyhow::Result<()> {
        let (graph, decision) = self
            .orchestrator
            .plan(query, &[], &self.context())
            .await?;
        println!("{}", graph.summary());
        match decision {
            BudgetDecision::Proceed => println!("Budget: within limits"),
            BudgetDecision::NeedsConfirmation(reasons) => {
                println!("Budget: needs confirmation ({})", reasons.join("; "))
            }
            BudgetDecision::Reject(reason) => println!("Budget: rejected ({})", reason),
        }
        Ok(())
    }
}

fn watch_ctrl_c(cancel: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\n[cancelling, keeping what has finished]");
            cancel.cancel();
        }
    })
}

/// Print stage progress for one request to stderr.
fn print_progress(orchestrator: &Orchestrator, request_id: RequestId) -> JoinHandle<()> {
    let mut rx = orchestrator.events().subscribe();
    tokio::spawn(async move {
        while let Ok(event) = rx.recv().await {
            match event {
                PipelineEvent::StateChanged { request_id: id, to, .. } if id == request_id => {
                    if to == PipelineState::Executing || to == PipelineState::Synthesizing {
                        eprintln!("[{}]", to);
                    }
                }
                PipelineEvent::StageStarted { request_id: id, stage, nodes } if id == request_id => {
                    eprintln!("[stage {}: {} step(s)]", stage, nodes);
                }
                PipelineEvent::NodeFinished {
                    request_id: id,
                    node_id,
                    success,
                    elapsed_ms,
                } if id == request_id => {
                    let mark = if success { "ok" } else { "FAILED" };
                    eprintln!("[{}: {} in {}ms]", node_id, mark, elapsed_ms);
                }
                _ => {}
            }
        }
    })
}

async fn ask(prompt: &str) -> anyhow::Result<bool> {
    let prompt = prompt.to_string();
    let approved = tokio::task::spawn_blocking(move || {
        dialoguer::Confirm::new()
            .with_prompt(prompt)
            .default(false)
            .interact()
    })
    .await??;
    Ok(approved)
}

fn query_or_stdin(words: Vec<String>) -> anyhow::Result<String> {
    let query = words.join(" ");
    if !query.trim().is_empty() {
        return Ok(query);
    }
    let mut input = String::new();
    io::stdin().read_to_string(&mut input)?;
    let input = input.trim().to_string();
    if input.is_empty() {
        anyhow::bail!("No question given");
    }
    Ok(input)
}

async fn run_repl(session: &Session<'_>) -> anyhow::Result<()> {
    println!("sift v{}", env!("CARGO_PKG_VERSION"));
    println!("Strategies: {}", session.orchestrator.registry().list().join(", "));
    println!("Type /help for commands, /quit to exit.\n");

    let stdin = io::stdin();
    let mut stdout = io::stdout();
    let mut history: Vec<ConversationTurn> = Vec::new();
    let mut last_report: Option<ExecutionReport> = None;

    loop {
        print!("> ");
        stdout.flush()?;

        let mut input = String::new();
        if stdin.lock().read_line(&mut input)? == 0 {
            break;
        }
        let input = input.trim();
        if input.is_empty() {
            continue;
        }

        let (command, rest) = input.split_once(' ').unwrap_or((input, ""));
        let rest = rest.trim();
        let (query, prior) = match command {
            "/quit" | "/exit" | "/q" => break,
            "/help" => {
                println!("  /plan <question>   show the plan without running it");
                println!("  /more <question>   follow up using the previous answer's findings");
                println!("  /clear             forget the conversation so far");
                println!("  /quit              exit");
                continue;
            }
            "/clear" => {
                history.clear();
                last_report = None;
                println!("Conversation cleared.");
                continue;
            }
            "/plan" if !rest.is_empty() => {
                if let Err(e) = session.show_plan(rest).await {
                    eprintln!("Error: {}", e);
                }
                continue;
            }
            "/more" if !rest.is_empty() => match last_report {
                Some(ref report) => (rest, Some(report)),
                None => {
                    println!("Nothing to follow up on yet.");
                    continue;
                }
            },
            cmd if cmd.starts_with('/') => {
                println!("Unknown command: {} (try /help)", cmd);
                continue;
            }
            _ => (input, None),
        };

        match session.answer(query, &history, prior).await {
            Ok(response) => {
                println!("\n{}\n", response.text);
                history.push(ConversationTurn::user(query));
                history.push(ConversationTurn::assistant(response.text.clone()));
                if let Some(report) = response.report {
                    last_report = Some(report);
                }
            }
            Err(e) => eprintln!("Error: {}", e),
        }
    }

    println!("Goodbye!");
    Ok(())
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}
