use std::io::Write;
use std::path::PathBuf;

use anyhow::{Context, Result};
use bostadsrag::app::App;
use bostadsrag::chat::server::{self, AppState};
use bostadsrag::chat::stream::{self, StreamEvent};
use bostadsrag::chat::{ChatError, Message};
use bostadsrag::config::Config;
use bostadsrag::ingest;
use bostadsrag::mcp::server::McpServer;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "bostadsrag", version, about = "Retrieval-augmented housing market assistant")]
struct Cli {
    /// Path to the JSON config file
    #[arg(short, long, default_value = "config.json")]
    config: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Serve the chat endpoint over HTTP
    Serve,
    /// Serve the retrieval tools over MCP stdio
    Mcp,
    /// Ask one question and stream the answer to the terminal
    Ask { question: String },
    /// Chunk, embed and store a text document
    Ingest {
        #[arg(long)]
        domain: String,
        #[arg(long)]
        file: PathBuf,
    },
    /// Load a JSON Lines record export
    Load {
        #[arg(long)]
        domain: String,
        #[arg(long)]
        file: PathBuf,
        /// Field of `data` to embed
        #[arg(long)]
        embed_field: Option<String>,
    },
    /// Print the tool descriptors as JSON
    Tools,
}

#[tokio::main]
async fn main() -> Result<()> {
    // stderr keeps stdout free for the MCP transport
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = Config::load(&cli.config)?;

    match cli.command {
        Command::Tools => {
            let descriptors = bostadsrag::tools::descriptors();
            println!("{}", serde_json::to_string_pretty(&descriptors)?);
            Ok(())
        }
        Command::Serve => serve(App::build(config)?).await,
        Command::Mcp => McpServer::new(App::build(config)?.dispatcher).start().await,
        Command::Ask { question } => ask(App::build(config)?, question).await,
        Command::Ingest { domain, file } => {
            let app = App::build(config)?;
            let text = std::fs::read_to_string(&file)
                .with_context(|| format!("failed to read {}", file.display()))?;
            let source = file.to_string_lossy().replace('\\', "/");
            let n = ingest::ingest_document(&app.store, &app.embeddings, &domain, &source, &text).await?;
            info!("{n} chunks stored in {domain}");
            Ok(())
        }
        Command::Load {
            domain,
            file,
            embed_field,
        } => {
            let app = App::build(config)?;
            let reader = std::io::BufReader::new(
                std::fs::File::open(&file).with_context(|| format!("failed to open {}", file.display()))?,
            );
            let n = ingest::load_records(&app.store, &app.embeddings, &domain, reader, embed_field.as_deref())
                .await?;
            info!("{n} records stored in {domain}");
            Ok(())
        }
    }
}

async fn serve(app: App) -> Result<()> {
    let state = AppState::new(app.orchestrator()?, app.config.orchestration.channel_capacity);
    let listener = tokio::net::TcpListener::bind(&app.config.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", app.config.listen_addr))?;

    server::serve(listener, state, async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("failed to listen for ctrl-c: {e}");
            std::future::pending::<()>().await;
        }
        info!("shutting down");
    })
    .await
    .context("chat server failed")
}

async fn ask(app: App, question: String) -> Result<()> {
    let orchestrator = app.orchestrator()?;
    let cancel = CancellationToken::new();
    let (sink, mut rx) = stream::channel(app.config.orchestration.channel_capacity, cancel.clone());

    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            interrupt.cancel();
        }
    });

    let run = tokio::spawn(async move { orchestrator.run(vec![Message::user(question)], sink).await });

    let mut stdout = std::io::stdout();
    while let Some(event) = rx.recv().await {
        match event {
            StreamEvent::TextDelta { text } => {
                print!("{text}");
                stdout.flush()?;
            }
            StreamEvent::TextReset => {
                println!();
                eprintln!("[svaret avbröts]");
            }
            StreamEvent::ToolCall { step, tool, arguments, .. } => {
                eprintln!("[steg {step}] {tool} {arguments}");
            }
            StreamEvent::ToolResult {
                tool,
                result_count,
                error,
                ..
            } => match error {
                Some(e) => eprintln!("  {tool}: fel: {e}"),
                None => eprintln!("  {tool}: {result_count} träffar"),
            },
            StreamEvent::Finish { .. } => println!(),
        }
    }

    match run.await.context("chat task failed")? {
        Ok(_) => Ok(()),
        Err(ChatError::Cancelled(_)) => {
            info!("interrupted");
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}
