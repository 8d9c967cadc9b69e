use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use snkr::chat::{self, provide_followups, ChatParticipant};
use snkr::constants;
use snkr::{ChatCommand, ChatOutcome, ChatRequest, ChatResult, ModelSelector, OllamaProvider, TerminalStream, Workspace};

// Define the command-line interface structure using clap
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Workspace folder holding pyproject.toml or requirements.txt (defaults to the current directory).
    #[arg(long, global = true)]
    workspace: Vec<PathBuf>,

    /// Base URL of the Ollama server.
    #[arg(long, global = true, env = "OLLAMA_URL")]
    ollama_url: Option<String>,

    /// Model family to select, e.g. `llama3.2`.
    #[arg(long, global = true, env = "SNKR_CHAT_MODEL")]
    model: Option<String>,

    /// Model vendor to select from.
    #[arg(long, global = true, env = "SNKR_MODEL_VENDOR")]
    vendor: Option<String>,

    /// Prompt budget in tokens for templated prompts.
    #[arg(long, global = true, env = "SNKR_MAX_INPUT_TOKENS")]
    max_input_tokens: Option<usize>,
}

// Define the available subcommands
#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Answer using the dependency versions from the workspace manifest.
    Poetry {
        #[arg(required = true, help = "Question to send along with the dependency list.")]
        prompt: Vec<String>,
    },
    /// Like `poetry`, but built from the prompt template and fitted to the model's input budget.
    #[command(name = "poetryprompt")]
    PoetryPrompt {
        #[arg(required = true, help = "Question to send along with the dependency list.")]
        prompt: Vec<String>,
    },
    /// Have the model list the workspace dependencies as "dependency": "version" pairs.
    List,
    /// Ask without a command: a Michael Jordan quote tied to a computer science concept.
    Ask {
        #[arg(required = true, help = "Topic or question.")]
        prompt: Vec<String>,
    },
    /// Engage in a text-based chat session; prefix a line with /poetry, /poetryprompt or /list.
    Chat,
}

impl Commands {
    fn into_request(self) -> Option<ChatRequest> {
        let request = match self {
            Commands::Poetry { prompt } => ChatRequest::new(ChatCommand::Poetry, prompt.join(" ")),
            Commands::PoetryPrompt { prompt } => ChatRequest::new(ChatCommand::PoetryPrompt, prompt.join(" ")),
            Commands::List => ChatRequest::new(ChatCommand::List, ""),
            Commands::Ask { prompt } => ChatRequest::new(ChatCommand::Default, prompt.join(" ")),
            Commands::Chat => return None,
        };
        Some(request)
    }
}

fn print_followups(result: Option<&ChatResult>, invoke_prefix: &str) {
    for followup in provide_followups(result) {
        eprintln!("Follow-up: {} ({}{})", followup.label, invoke_prefix, followup.command);
    }
}

fn print_outcome(result: &ChatResult) {
    if result.outcome == ChatOutcome::NoModel {
        eprintln!("No matching language model is available. Is Ollama running with the configured model pulled?");
    }
}

/// Routes Ctrl-C to the token of the turn in flight. With no turn running, Ctrl-C exits.
#[derive(Clone)]
struct Interrupts {
    current: Arc<Mutex<CancellationToken>>,
}

impl Interrupts {
    fn install() -> Self {
        let idle = CancellationToken::new();
        idle.cancel();
        let current = Arc::new(Mutex::new(idle));

        let watched = current.clone();
        tokio::spawn(async move {
            while tokio::signal::ctrl_c().await.is_ok() {
                let token = match watched.lock() {
                    Ok(token) => token.clone(),
                    Err(_) => std::process::exit(130),
                };
                if token.is_cancelled() {
                    warn!("Interrupted with no request in flight, exiting");
                    std::process::exit(130);
                }
                info!("Ctrl-C received, cancelling request...");
                token.cancel();
            }
        });

        Self { current }
    }

    /// Fresh token for the next turn; the caller cancels it when the turn ends.
    fn begin_turn(&self) -> CancellationToken {
        let token = CancellationToken::new();
        if let Ok(mut current) = self.current.lock() {
            *current = token.clone();
        }
        token
    }
}

/// Run one turn; Ctrl-C cancels the model call.
async fn run_turn(participant: &ChatParticipant, request: ChatRequest, interrupts: &Interrupts) -> Result<()> {
    let cancel = interrupts.begin_turn();
    let mut stream = TerminalStream::stdout();
    let result = participant.handle(&request, &mut stream, cancel.clone()).await;
    cancel.cancel();
    stream.finish();

    match result {
        Ok(result) => {
            print_outcome(&result);
            print_followups(Some(&result), "snkr ");
            Ok(())
        }
        Err(e) => {
            print_followups(None, "snkr ");
            Err(e).context("Chat request failed")
        }
    }
}

// The main entry point of the application, using tokio's async runtime
#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (for OLLAMA_URL and model settings)
    dotenvy::dotenv().ok();

    // Logs go to stderr so stdout carries only the model's answer.
    // Reads log level from RUST_LOG environment variable (e.g., RUST_LOG=info,snkr=debug)
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    // Parse command-line arguments
    let cli = Cli::parse();

    info!("snkr starting with command: {:?}", cli.command);

    let workspace = if cli.workspace.is_empty() {
        Workspace::single(std::env::current_dir().context("Failed to resolve the current directory")?)
    } else {
        Workspace::new(cli.workspace)
    };

    let mut provider = OllamaProvider::new(cli.ollama_url.unwrap_or_else(|| constants::OLLAMA_URL.clone()));
    if let Some(max_input_tokens) = cli.max_input_tokens {
        provider = provider.with_max_input_tokens(max_input_tokens);
    }
    let selector = ModelSelector::new(
        cli.vendor.unwrap_or_else(|| constants::SNKR_MODEL_VENDOR.clone()),
        cli.model.unwrap_or_else(|| constants::SNKR_CHAT_MODEL.clone()),
    );
    let participant = ChatParticipant::new(workspace, Arc::new(provider), selector);
    let interrupts = Interrupts::install();

    match cli.command.into_request() {
        Some(request) => run_turn(&participant, request, &interrupts).await?,
        None => {
            let stdin = std::io::stdin();
            let begin_turn = || interrupts.begin_turn();
            chat::run_chat(&participant, stdin.lock(), begin_turn, TerminalStream::stdout, |stream, result| {
                stream.finish();
                match result {
                    Ok(result) => {
                        print_outcome(result);
                        print_followups(Some(result), "/");
                    }
                    Err(e) => {
                        eprintln!("Error: {}", e);
                        print_followups(None, "/");
                    }
                }
            })
            .await
            .context("Chat session failed")?;
        }
    }

    Ok(())
}
