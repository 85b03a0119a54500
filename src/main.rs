//! Command-line entry point for the browser agent.
//!
//! Runs the agent against a recorded transcript so the orchestration loop can
//! be exercised without a live model or browser.

use std::path::PathBuf;

use agent_core::{AgentRuntime, RuntimeConfig, Transcript};
use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, EnvFilter};

/// Command-line arguments for the browser agent
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Enable debug logging
    #[arg(short, long, default_value_t = false)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Replay a recorded transcript and print the agent result as JSON
    Replay {
        /// Transcript file with model turns and tool outcomes
        #[arg(short, long)]
        transcript: PathBuf,

        /// Prompt to run; defaults to the prompt stored in the transcript
        #[arg(short, long)]
        prompt: Option<String>,

        /// Runtime config file (agent and subagent settings)
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let filter = if args.debug {
        EnvFilter::new("debug,ai_agent=debug,agent_core=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    fmt().with_env_filter(filter).with_writer(std::io::stderr).init();

    match args.command {
        Commands::Replay {
            transcript,
            prompt,
            config,
        } => replay(transcript, prompt, config).await,
    }
}

async fn replay(
    transcript_path: PathBuf,
    prompt: Option<String>,
    config_path: Option<PathBuf>,
) -> anyhow::Result<()> {
    let transcript = Transcript::from_json_file(&transcript_path)?;
    let config = match config_path {
        Some(path) => RuntimeConfig::from_json_file(path)?,
        None => RuntimeConfig::default(),
    };
    let prompt = prompt
        .or_else(|| transcript.prompt.clone())
        .context("no prompt given and the transcript does not record one")?;
    let context = transcript.context.clone();

    tracing::info!(transcript = ?transcript_path, turns = transcript.turns.len(), "replaying transcript");
    let (sessions, tools) = transcript.into_collaborators();
    let runtime = AgentRuntime::builder(sessions, tools)
        .with_config(config)
        .build()?;

    let result = runtime.run(&prompt, context).await?;
    runtime.dispose().await;

    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}
