mod flows;

use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use futures::StreamExt;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use gatehouse_core::config::{AppConfig, ModelConfig, RetryConfig};
use gatehouse_core::instance::InstanceStatus;
use gatehouse_core::traits::LlmClient;
use gatehouse_core::types::ResponderStatus;
use gatehouse_engine::{Capabilities, FlowEngine, PublicStep, StreamEvent};
use gatehouse_store::SqliteInstanceStore;
use gatehouse_tools::ToolRegistry;

#[derive(Parser)]
#[command(name = "gatehouse", version, about = "Guarded LLM flow orchestration")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "gatehouse.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP/SSE gateway
    Serve,
    /// Check flow definition files without running them
    Validate {
        /// JSON definition files
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
    /// Send one message through a flow and print the steps
    Run {
        /// Flow definition id
        #[arg(short, long)]
        flow: String,
        /// Confirm every tool call without asking
        #[arg(short = 'y', long)]
        yes: bool,
        /// The message (read from stdin when omitted)
        #[arg(trailing_var_arg = true)]
        message: Vec<String>,
    },
    /// Show current configuration
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("gatehouse=info,warn")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli.config)?;

    if let Commands::Config = cli.command {
        println!("{}", toml::to_string_pretty(&config)?);
        return Ok(());
    }

    let engine = build_engine(&config)?;

    if let Some(dir) = config.flows_dir() {
        let registered = flows::register_dir(&engine, &dir).await?;
        info!(dir = %dir.display(), count = registered, "Registered flows");
    }

    match cli.command {
        Commands::Config => {}
        Commands::Validate { files } => {
            let mut failed = 0;
            for path in &files {
                match flows::validate_file(&engine, path) {
                    Ok(id) => println!("ok      {} ({})", path.display(), id),
                    Err(e) => {
                        failed += 1;
                        println!("invalid {}: {}", path.display(), e);
                    }
                }
            }
            if failed > 0 {
                anyhow::bail!("{} of {} definitions are invalid", failed, files.len());
            }
        }
        Commands::Run { flow, yes, message } => {
            let text = if message.is_empty() {
                io::stdin()
                    .lock()
                    .lines()
                    .map_while(|l| l.ok())
                    .collect::<Vec<_>>()
                    .join("\n")
            } else {
                message.join(" ")
            };
            let result = run_once(&engine, &flow, &text, yes).await;
            engine.shutdown().await;
            result?;
        }
        Commands::Serve => {
            let server = gatehouse_gateway::GatewayServer::new(config.gateway.clone(), engine.clone());
            let cancel = tokio_util::sync::CancellationToken::new();
            let cancel_clone = cancel.clone();

            // Graceful shutdown on Ctrl-C
            tokio::spawn(async move {
                tokio::signal::ctrl_c().await.ok();
                info!("Shutting down gateway...");
                cancel_clone.cancel();
            });

            server.run(cancel).await?;
            engine.shutdown().await;
        }
    }

    Ok(())
}

fn load_config(path: &Path) -> anyhow::Result<AppConfig> {
    if path.exists() {
        return Ok(AppConfig::load(path)?);
    }
    let home_config = gatehouse_core::config::expand_home("~/.gatehouse/config.toml");
    if home_config.exists() {
        info!(path = %home_config.display(), "Loading config from home directory");
        return Ok(AppConfig::load(&home_config)?);
    }
    eprintln!("Warning: no config file found. Using OPENAI_API_KEY / GATEHOUSE_MODEL.");
    eprintln!("See gatehouse.toml.example for reference.");
    env_config()
}

/// Minimal config from environment variables.
fn env_config() -> anyhow::Result<AppConfig> {
    let model_id = std::env::var("GATEHOUSE_MODEL").unwrap_or_else(|_| "gpt-4o-mini".into());
    let mut model = ModelConfig::new(model_id);
    model.api_key = std::env::var("OPENAI_API_KEY").ok();
    model.base_url = std::env::var("GATEHOUSE_BASE_URL").ok();
    Ok(AppConfig {
        engine: Default::default(),
        model,
        fallback_models: vec![],
        store: Default::default(),
        gateway: Default::default(),
        tools: Default::default(),
        library: Default::default(),
        flows_dir: None,
    })
}

fn build_engine(config: &AppConfig) -> anyhow::Result<FlowEngine> {
    let store_path = config.store_path();
    let store = Arc::new(SqliteInstanceStore::open(&store_path)?);
    info!(path = %store_path.display(), "Opened instance store");

    let tools = ToolRegistry::with_builtins().with_timeout_floor(config.tools.timeout_secs);

    // LLM client with retry and fallback chain
    let primary_llm = gatehouse_llm::create_client(&config.model);
    let llm: Arc<dyn LlmClient> = if !config.fallback_models.is_empty() || config.model.retry.is_some() {
        let retry_config = config.model.retry.clone().unwrap_or_else(RetryConfig::default);
        let fallbacks: Vec<_> = config
            .fallback_models
            .iter()
            .map(|mc| (mc.clone(), gatehouse_llm::create_client(mc)))
            .collect();
        Arc::new(gatehouse_llm::RetryingClient::new(primary_llm, fallbacks, retry_config))
    } else {
        Arc::from(primary_llm)
    };

    let library = config.library.load_texts()?;
    let caps = Capabilities::new(llm, config.model.clone(), Arc::new(tools))
        .with_library(Arc::new(library));
    Ok(FlowEngine::new(config.engine.clone(), caps, store))
}

/// Drive one message to a stopping point, asking about tool calls on the terminal.
async fn run_once(engine: &FlowEngine, flow: &str, text: &str, auto_confirm: bool) -> anyhow::Result<()> {
    if text.trim().is_empty() {
        anyhow::bail!("empty message");
    }
    let info = engine.create_instance(flow).await?;
    let id = info.id;
    let mut stream = engine.send(&id, text).await?;

    loop {
        let mut at_line_start = true;
        while let Some(event) = stream.next().await {
            match event {
                StreamEvent::PartialOutput(p) => {
                    print!("{}", p.delta);
                    at_line_start = p.delta.ends_with('\n');
                    io::stdout().flush().ok();
                }
                StreamEvent::CompleteStep(step) => {
                    if !at_line_start {
                        println!();
                        at_line_start = true;
                    }
                    if let Some(decision) = step.decision {
                        eprintln!("[{}] {}", step.agent_id, decision);
                    }
                    if let Some(text) = unstreamed_response(&step) {
                        println!("{}", text);
                    }
                    if let Some(status) = step.next_status {
                        eprintln!("[{}] {}", step.agent_id, status);
                    }
                }
                StreamEvent::Error(e) => eprintln!("error: {}", e.message),
            }
        }

        let info = engine.instance_info(&id).await?;
        if info.status != InstanceStatus::AwaitingToolConfirmation {
            eprintln!("[{}] {}", id, info.status);
            return Ok(());
        }

        for pending in info.pending {
            let approve = auto_confirm || ask(&format!(
                "Run tool `{}` with {}? [y/N] ",
                pending.tool_name, pending.tool_input
            ))?;
            if approve {
                let outcome = engine.confirm(&id, &pending.id).await?;
                eprintln!("[{}] {}", outcome.tool_name, outcome.result);
            } else {
                engine.deny(&id, &pending.id).await?;
                warn!(tool = %pending.tool_name, "Tool call denied");
            }
        }
        stream = engine.resume(&id).await?;
    }
}

/// Response text that never went out as partial output: evaluator replies and
/// the description of a tool call waiting for confirmation.
fn unstreamed_response(step: &PublicStep) -> Option<&str> {
    if step.response.is_empty() {
        return None;
    }
    let parked = step.next_status == Some(ResponderStatus::AwaitingToolConfirmation);
    (step.decision.is_some() || parked).then_some(step.response.as_str())
}

fn ask(prompt: &str) -> anyhow::Result<bool> {
    eprint!("{}", prompt);
    io::stderr().flush()?;
    let mut answer = String::new();
    io::stdin().lock().read_line(&mut answer)?;
    Ok(matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes"))
}
