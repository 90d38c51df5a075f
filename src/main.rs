//! pi-relay - chat with the pi coding agent from the terminal.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::Mutex;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use pi_relay::config::{ConfigLoader, RelayConfig};
use pi_relay::display;
use pi_relay::relay::{PromptOutcome, SessionPool, TerminalPrompter};
use pi_relay::rpc::{ImageContent, RpcCommand};

/// Chat id used for the terminal front-end.
const CHAT_ID: &str = "terminal";

#[derive(Parser)]
#[command(
    name = "pi-relay",
    about = "Relay chat messages to the pi coding agent over RPC",
    version
)]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Path to a config file (defaults to ./.pi-relay.toml, then the user config dir)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Chat interactively; each stdin line is one message.
    Chat {
        /// Print reply text as it streams in.
        #[arg(long)]
        stream: bool,
    },
    /// Send a single prompt and print the reply.
    Prompt {
        /// The message to send.
        text: String,
        /// Attach an image (repeatable).
        #[arg(long = "image", value_name = "PATH")]
        images: Vec<PathBuf>,
        /// Seconds to wait for the reply.
        #[arg(long)]
        timeout: Option<u64>,
    },
}

fn init_tracing(verbosity: u8, configured: &str) {
    let level = match verbosity {
        0 => configured,
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();
}

fn load_config(path: Option<PathBuf>) -> Result<RelayConfig, pi_relay::config::ConfigError> {
    let loader = path.map_or_else(ConfigLoader::new, ConfigLoader::with_path);
    let mut config = loader.load()?;
    config.apply_env();
    Ok(config)
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match load_config(cli.config) {
        Ok(config) => config,
        Err(e) => {
            display::print_error(&e.to_string());
            return ExitCode::FAILURE;
        }
    };
    init_tracing(cli.verbose, &config.log_level);

    tracing::info!(
        binary = %config.agent.binary,
        provider = %config.agent.provider,
        model = ?config.agent.model,
        "Starting pi relay"
    );

    match cli.command {
        Commands::Chat { stream } => run_chat(config, stream).await,
        Commands::Prompt {
            text,
            images,
            timeout,
        } => run_prompt(config, text, images, timeout).await,
    }
}

async fn run_chat(config: RelayConfig, stream: bool) -> ExitCode {
    let input = Arc::new(Mutex::new(BufReader::new(tokio::io::stdin()).lines()));
    let prompter = TerminalPrompter::new(Arc::clone(&input), config.relay.raw_output);

    let provider = config.agent.provider.clone();
    let model = config.agent.model.clone();
    let pool = SessionPool::new(config)
        .with_prompter(Arc::new(prompter))
        .with_client_setup(move |chat, client| {
            display::print_session_start(chat, client.pid(), &provider, model.as_deref());
            if stream {
                client.on_text_delta(|delta| async move {
                    display::print_text(&delta);
                    Ok(())
                });
            }
        });
    let pool = Arc::new(pool);

    // Ctrl-C cancels the reply in flight; with nothing in flight it exits.
    let signal_pool = Arc::clone(&pool);
    tokio::spawn(async move {
        while tokio::signal::ctrl_c().await.is_ok() {
            if !signal_pool.cancel(CHAT_ID).await {
                signal_pool.stop_all().await;
                std::process::exit(130);
            }
        }
    });

    display::print_info("Type a message, or /start, /new, /stop, /quit.");

    loop {
        let line = { input.lock().await.next_line().await };
        let line = match line {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                display::print_error(&format!("Failed to read input: {e}"));
                break;
            }
        };

        match line.trim() {
            "" => {}
            "/quit" => break,
            "/start" => match pool.ensure_started(CHAT_ID).await {
                Ok(()) => display::print_info(
                    "Hello! Send me a message and I will pass it to the agent.",
                ),
                Err(e) => display::print_error(&format!("Sorry, I encountered an error: {e}")),
            },
            "/new" => match pool.new_session(CHAT_ID).await {
                Ok(true) => display::print_info("Started a new session."),
                Ok(false) => display::print_error("The agent did not confirm the new session."),
                Err(e) => display::print_error(&format!("Sorry, I encountered an error: {e}")),
            },
            "/stop" => match pool.stop(CHAT_ID).await {
                Ok(true) => display::print_session_end(CHAT_ID),
                Ok(false) => display::print_info("No agent is running."),
                Err(e) => display::print_error(&format!("Failed to stop the agent: {e}")),
            },
            text => {
                display::print_typing();
                match pool.prompt(CHAT_ID, RpcCommand::prompt(text)).await {
                    Ok(PromptOutcome::Completed(_)) if stream => println!(),
                    Ok(outcome) => display::print_reply(&outcome.into_display_text()),
                    Err(e) => {
                        display::print_error(&format!("Sorry, I encountered an error: {e}"));
                    }
                }
            }
        }
    }

    pool.stop_all().await;
    ExitCode::SUCCESS
}

async fn run_prompt(
    mut config: RelayConfig,
    text: String,
    images: Vec<PathBuf>,
    timeout: Option<u64>,
) -> ExitCode {
    let mut attachments = Vec::with_capacity(images.len());
    for path in &images {
        match ImageContent::load(path).await {
            Ok(image) => attachments.push(image),
            Err(e) => {
                display::print_error(&format!("Failed to read image {}: {e}", path.display()));
                return ExitCode::FAILURE;
            }
        }
    }

    if let Some(secs) = timeout {
        config.relay.prompt_timeout_secs = secs;
    }

    let pool = SessionPool::new(config);
    let result = pool
        .prompt(CHAT_ID, RpcCommand::prompt(text).with_images(attachments))
        .await;
    pool.stop_all().await;

    match result {
        Ok(outcome) => {
            let completed = outcome.is_completed();
            display::print_reply(&outcome.into_display_text());
            if completed {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            }
        }
        Err(e) => {
            display::print_error(&format!("Sorry, I encountered an error: {e}"));
            ExitCode::FAILURE
        }
    }
}
