mod config;
mod error;

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use futures::StreamExt;
use mcp::Session;
use runtime::api::{ChatRequest, ChatResponse, StreamEvent};
use runtime::{AnthropicAuth, AnthropicBackend, Engine, McpToolHost, Message};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use config::Config;
use error::{Error, Result};

type ChatEngine = Engine<AnthropicBackend, McpToolHost>;

#[derive(Parser)]
#[command(name = "chatline")]
#[command(about = "Chat with a model that can use a local tool server", long_about = None)]
#[command(version)]
struct Cli {
    /// Config file (defaults to ./chatline.toml when present)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start an interactive chat
    Chat {
        /// Print the reply as it is generated (tools are not run)
        #[arg(long)]
        stream: bool,
    },
    /// Answer JSON chat requests read line by line from stdin
    Serve {
        /// Reply with chunk/end/error events instead of one response
        #[arg(long)]
        stream: bool,
    },
    /// List the tools the server offers
    Tools,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run().await {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::discover(cli.config.as_deref())?;

    let command = cli.command.unwrap_or(Commands::Chat { stream: false });
    // Fail on bad credentials before launching anything.
    let auth = match command {
        Commands::Tools => None,
        _ => Some(config.auth()?),
    };

    let session = Arc::new(Session::start(config.server.to_server_config()).await?);
    info!(server = %session.name(), "tool server ready");

    let result = match (auth, command) {
        (Some(auth), Commands::Chat { stream }) => {
            let engine = build_engine(&config, auth, &session);
            cmd_chat(&engine, &config.backend.model, stream).await
        }
        (Some(auth), Commands::Serve { stream }) => {
            cmd_serve(&build_engine(&config, auth, &session), stream).await
        }
        _ => cmd_tools(&session).await,
    };

    if let Err(e) = session.stop().await {
        warn!("failed to stop tool server: {e}");
    }
    result
}

fn build_engine(config: &Config, auth: AnthropicAuth, session: &Arc<Session>) -> ChatEngine {
    let backend = AnthropicBackend::builder(auth, &config.backend.model)
        .max_tokens(config.backend.max_tokens)
        .build();
    Engine::with_config(
        backend,
        McpToolHost::new(session.clone()),
        config.engine.to_engine_config(),
    )
}

async fn cmd_tools(session: &Session) -> Result<()> {
    let tools = session.list_tools().await?;
    if tools.is_empty() {
        println!("No tools offered by {}.", session.name());
        return Ok(());
    }

    for tool in tools {
        let summary = tool.description.lines().next().unwrap_or_default();
        println!("{:<28}  {summary}", tool.name);
    }
    Ok(())
}

async fn cmd_chat(engine: &ChatEngine, model: &str, stream: bool) -> Result<()> {
    println!("chatline v{}", env!("CARGO_PKG_VERSION"));
    println!("Model: {model}");
    println!(
        "Tools: {}",
        engine.tools().session().list_tools().await?.len()
    );
    println!("Type 'quit' or Ctrl+D to exit. Ctrl+C cancels a reply.\n");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut history: Vec<Message> = Vec::new();

    loop {
        print!("> ");
        std::io::stdout().flush()?;

        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = tokio::signal::ctrl_c() => None,
        };
        let Some(line) = line else {
            break;
        };

        let input = line.trim();
        if input.is_empty() {
            continue;
        }
        if input == "quit" || input == "exit" {
            break;
        }

        let reply = if stream {
            stream_turn(engine, &history, input).await
        } else {
            turn(engine, &history, input).await
        };

        match reply {
            Ok(text) => {
                history.push(Message::user(input));
                history.push(Message::assistant(text));
            }
            Err(Error::Runtime(runtime::Error::Cancelled)) => println!("\n(cancelled)\n"),
            Err(e) if e.is_recoverable() => eprintln!("Error: {e}\n"),
            Err(e) => return Err(e),
        }
    }

    println!("\nBye.");
    Ok(())
}

/// Run one turn, printing the final answer.
async fn turn(engine: &ChatEngine, history: &[Message], input: &str) -> Result<String> {
    let cancel = CancellationToken::new();
    let watcher = cancel_on_ctrl_c(cancel.clone());
    let result = engine.chat_until_cancelled(history, input, &cancel).await;
    watcher.abort();

    let text = result?;
    println!("\n{text}\n");
    Ok(text)
}

/// Stream one model reply to stdout as it arrives.
async fn stream_turn(engine: &ChatEngine, history: &[Message], input: &str) -> Result<String> {
    let cancel = CancellationToken::new();
    let watcher = cancel_on_ctrl_c(cancel.clone());
    let outcome = cancel
        .run_until_cancelled(async {
            let mut chunks = engine.chat_stream(history, input).await?;
            let mut text = String::new();
            println!();
            while let Some(chunk) = chunks.next().await {
                let chunk = chunk?;
                print!("{chunk}");
                std::io::stdout().flush()?;
                text.push_str(&chunk);
            }
            println!("\n");
            Ok::<_, Error>(text)
        })
        .await;
    watcher.abort();

    outcome.unwrap_or(Err(runtime::Error::Cancelled.into()))
}

fn cancel_on_ctrl_c(cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel.cancel();
        }
    })
}

/// One `ChatRequest` per stdin line; replies go to stdout as JSON lines.
async fn cmd_serve(engine: &ChatEngine, stream: bool) -> Result<()> {
    let mut input = BufReader::new(tokio::io::stdin());
    let mut output = tokio::io::stdout();
    info!(stream, "serving chat requests on stdio");

    loop {
        let request: ChatRequest = match mcp::transport::read_frame(&mut input).await {
            Ok(Some(request)) => request,
            Ok(None) => break,
            Err(mcp::Error::InvalidResponse(reason)) => {
                warn!("rejected request: {reason}");
                let message = format!("invalid request: {reason}");
                if stream {
                    let event = StreamEvent::Error { message };
                    mcp::transport::write_frame(&mut output, &event).await?;
                } else {
                    let response = ChatResponse {
                        response: format!("Chat error: {message}"),
                        success: false,
                    };
                    mcp::transport::write_frame(&mut output, &response).await?;
                }
                continue;
            }
            Err(e) => return Err(e.into()),
        };

        if stream {
            let mut sink = Box::pin(futures::sink::unfold(
                &mut output,
                |out, event: StreamEvent| async move {
                    mcp::transport::write_frame(&mut *out, &event).await?;
                    Ok::<_, Error>(out)
                },
            ));
            runtime::api::handle_chat_stream(engine, &request, &mut sink).await?;
        } else {
            let response = runtime::api::handle_chat(engine, &request).await;
            mcp::transport::write_frame(&mut output, &response).await?;
        }
    }

    Ok(())
}
