//! Command-line entrypoint: one-shot chat exchanges and status inspection
//! over the connection broker.

use std::error::Error;
use std::io::Write;
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use llmlink::api::{ChatMessage, ChatRequest};
use llmlink::broker::assembler::{AssemblerEvent, StreamAssembler};
use llmlink::broker::ConnectionBroker;
use llmlink::core::config::Config;

#[derive(Parser)]
#[command(name = "llmlink")]
#[command(about = "Resilient streaming connections to local and cloud LLM backends")]
#[command(
    long_about = "llmlink maintains a chat connection across multiple backends: a local \
service, a cloud relay, and an optional public tunnel. It probes candidates \
concurrently, fails over automatically with exponential backoff, and keeps \
streaming responses ordered.\n\n\
Environment Variables:\n\
  LLMLINK_AUTH_TOKEN   Bearer token for the cloud relay and public tunnel\n\
  RUST_LOG             Log filter (e.g. llmlink=debug)"
)]
struct Args {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Path to config.toml (defaults to the platform config directory)
    #[arg(short = 'c', long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Model to request
    #[arg(short = 'm', long, global = true, default_value = "llama3")]
    model: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Send one prompt and stream the reply (default)
    Chat {
        /// The prompt to send
        prompt: Vec<String>,
    },
    /// Connect, probe all candidates, and print the resulting status
    Status,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let config = match &args.config {
        Some(path) => Config::load_from_path(path)?,
        None => Config::load()?,
    };
    let auth_token = std::env::var("LLMLINK_AUTH_TOKEN").ok();
    let broker = ConnectionBroker::from_config(&config, auth_token);

    match args.command.unwrap_or(Commands::Chat { prompt: Vec::new() }) {
        Commands::Status => {
            let snapshot = broker.connect().await;
            println!("{}", serde_json::to_string_pretty(&snapshot)?);
            broker.disconnect().await;
            Ok(())
        }
        Commands::Chat { prompt } => {
            let prompt = prompt.join(" ");
            if prompt.is_empty() {
                eprintln!("❌ No prompt given. Usage: llmlink chat <prompt>");
                std::process::exit(2);
            }

            let snapshot = broker.connect().await;
            let Some(active) = snapshot.active else {
                for status in &snapshot.transports {
                    if let Some(error) = &status.error {
                        eprintln!("{} {}: {}", error.icon, status.transport, error.user_message);
                        eprintln!("   {}", error.guidance);
                    }
                }
                std::process::exit(1);
            };
            eprintln!("connected via {active}");

            let request = ChatRequest::new(
                args.model,
                vec![ChatMessage {
                    role: "user".to_string(),
                    content: prompt,
                }],
            );
            let mut chunks = match broker.send_message("cli", request).await {
                Ok(chunks) => chunks,
                Err(error) => {
                    eprintln!("{} {}", error.icon, error.user_message);
                    std::process::exit(1);
                }
            };

            let mut assembler = StreamAssembler::new();
            let mut stdout = std::io::stdout();
            while let Some(message) = chunks.recv().await {
                match assembler.ingest(&message) {
                    Some(AssemblerEvent::Appended(chunk)) => {
                        print!("{chunk}");
                        stdout.flush()?;
                    }
                    Some(AssemblerEvent::Completed(_)) => {
                        println!();
                        break;
                    }
                    Some(AssemblerEvent::Errored(error)) => {
                        eprintln!("\n❌ {error}");
                        broker.disconnect().await;
                        std::process::exit(1);
                    }
                    None => {}
                }
            }

            broker.disconnect().await;
            Ok(())
        }
    }
}
