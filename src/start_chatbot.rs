//! Startup helpers for the chatbot binaries.

use std::process::ExitCode;

use anyhow::Context as _;

use crate::chat::core::config::ChatConfig;
use crate::chat::core::ids::ConversationId;
use crate::chat::engine::chatbot::Chatbot;
use crate::server::{self, AppState};
use crate::shell::Shell;

/// Initialise `tracing` once: `RUST_LOG` respected, `info` by default.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .try_init();
}

/// Run the interactive shell on stdin and stdout.
///
/// An optional first argument resumes that conversation.
///
/// # Returns
/// `ExitCode::SUCCESS` at end of input or `quit`, `1` on failure.
#[must_use]
pub fn run_shell() -> ExitCode {
    init_tracing();
    exit_code(block_on(shell_main()))
}

/// Run the HTTP server until Ctrl-C.
///
/// # Returns
/// `ExitCode::SUCCESS` on graceful shutdown, `1` on failure.
#[must_use]
pub fn run_server() -> ExitCode {
    init_tracing();
    tracing::info!("Starting chatbot server v{}", env!("CARGO_PKG_VERSION"));
    exit_code(block_on(server_main()))
}

async fn shell_main() -> anyhow::Result<()> {
    let config = ChatConfig::from_env().context("failed to read configuration")?;
    let conversation_id = std::env::args()
        .nth(1)
        .map(|arg| arg.parse::<ConversationId>())
        .transpose()
        .context("conversation id must be an integer")?;

    let chatbot = Chatbot::from_config(config, conversation_id)
        .await
        .context("failed to open chatbot")?;
    tracing::info!(
        conversation_id = %chatbot.conversation_id(),
        "Shell ready, type `%gpt help` for commands"
    );

    let stdin = tokio::io::BufReader::new(tokio::io::stdin());
    let mut stdout = tokio::io::stdout();
    Shell::new(chatbot)
        .run(stdin, &mut stdout)
        .await
        .context("shell I/O failed")
}

async fn server_main() -> anyhow::Result<()> {
    let config = ChatConfig::from_env().context("failed to read configuration")?;
    let state = AppState::from_config(config)
        .await
        .context("failed to create state")?;
    server::run_server_with_shutdown(state, get_port(), shutdown_signal())
        .await
        .context("server error")
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "Failed to listen for Ctrl-C");
        return;
    }
    tracing::info!("Shutdown requested");
}

fn block_on<F>(future: F) -> anyhow::Result<()>
where
    F: std::future::Future<Output = anyhow::Result<()>>,
{
    let runtime = tokio::runtime::Runtime::new().context("failed to create runtime")?;
    runtime.block_on(future)
}

fn exit_code(result: anyhow::Result<()>) -> ExitCode {
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!("{err:#}");
            ExitCode::from(1)
        }
    }
}

/// Configured server port: `CHATBOT_PORT`, or [`server::DEFAULT_PORT`].
#[must_use]
pub fn get_port() -> u16 {
    std::env::var("CHATBOT_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(server::DEFAULT_PORT)
}
