#![forbid(unsafe_code)]

//! `agent-duplex`: drive a stream-json CLI from the command line.
//!
//! Starts one session, submits every `--prompt` concurrently (they are
//! answered one turn at a time, in submission order), prints each reply,
//! and finally the conversation id the subprocess reported.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use futures_util::future::join_all;
use serde_json::Value;
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use agent_duplex::protocol::control::{ControlHandler, ControlRequest, PermissionDecision};
use agent_duplex::{close_session, get_session_id, send_message, start_session};
use agent_duplex::{AppError, Result, SessionConfig};

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "agent-duplex", about = "Stream-json CLI session driver", version, long_about = None)]
struct Cli {
    /// Path to a TOML session configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override the executable to launch.
    #[arg(long)]
    executable: Option<String>,

    /// Log output format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Approve every tool permission request instead of denying it.
    #[arg(long)]
    allow_tools: bool,

    /// Prompt to send; repeat for several turns.
    #[arg(long = "prompt", required = true)]
    prompts: Vec<String>,
}

fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(args.log_format)?;

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::Config(format!("failed to build tokio runtime: {err}")))?
        .block_on(run(args))
}

async fn run(args: Cli) -> Result<()> {
    let mut config = match &args.config {
        Some(path) => SessionConfig::load_from_path(path)?,
        None => {
            let mut config = SessionConfig::default();
            config.validate()?;
            config
        }
    };
    if let Some(executable) = args.executable {
        config.executable = executable;
    }
    info!(executable = %config.executable, "configuration loaded");

    let handler: Option<Arc<dyn ControlHandler>> = if args.allow_tools {
        Some(Arc::new(allow_all))
    } else {
        None
    };
    let session = start_session(&config, handler)?;

    let turns = args.prompts.iter().map(|prompt| {
        let session = session.clone();
        async move { send_message(&session, prompt).await?.collect_text().await }
    });
    let replies = join_all(turns).await;

    let mut failed = 0usize;
    for (index, reply) in replies.into_iter().enumerate() {
        match reply {
            Ok(text) => println!("[{}] {text}", index + 1),
            Err(err) => {
                failed += 1;
                warn!(turn = index + 1, %err, "turn failed");
                println!("[{}] error: {err}", index + 1);
            }
        }
    }

    if let Some(id) = get_session_id(&session) {
        println!("session: {id}");
    }
    close_session(&session).await?;

    if failed > 0 {
        return Err(AppError::Session(format!("{failed} turn(s) failed")));
    }
    Ok(())
}

async fn allow_all(request: ControlRequest) -> Result<Value> {
    match request {
        ControlRequest::CanUseTool { tool_name, .. } => {
            info!(tool_name, "approving tool use");
            Ok(PermissionDecision::allow().into_value())
        }
        ControlRequest::HookCallback { .. } => Ok(serde_json::json!({})),
        other => Err(AppError::Control(format!(
            "unsupported control request '{}'",
            other.subtype()
        ))),
    }
}

fn init_tracing(log_format: LogFormat) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr);

    match log_format {
        LogFormat::Text => subscriber
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
        LogFormat::Json => subscriber
            .json()
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
    }

    Ok(())
}
