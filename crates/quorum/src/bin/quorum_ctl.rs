//! Operational CLI for the quorum core.
//!
//! Quick checks against a running remote agent and the local sandbox
//! layer, without going through the API surface.

use std::io::Write;

use anyhow::Result;
use clap::{Parser, Subcommand};
use futures::StreamExt;

use quorum::sandbox::{ContainerCli, Sandbox, container_name_for};
use quorum::{Config, SessionOrchestrator};

#[derive(Parser)]
#[command(
    name = "quorum-ctl",
    about = "Operational checks for the quorum agent relay",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Round-trip a health check to the remote agent.
    Health,
    /// Send one message through a user session and stream the reply.
    Send {
        #[arg(long, env = "QUORUM_USER")]
        user: String,
        /// Message text; prefix with '!' to run a sandboxed shell command.
        message: String,
        /// Workspace directory mounted read-only into the sandbox.
        #[arg(long)]
        workdir: Option<std::path::PathBuf>,
    },
    /// Show the user's sandbox status.
    SandboxInfo {
        #[arg(long, env = "QUORUM_USER")]
        user: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let config = Config::from_env();

    match cli.command {
        Commands::Health => {
            let orchestrator = SessionOrchestrator::from_config(config);
            let health = orchestrator.health().await?;
            println!("remote agent: {}", health.status);
        }
        Commands::Send {
            user,
            message,
            workdir,
        } => {
            let orchestrator = SessionOrchestrator::from_config(config);
            orchestrator.start();

            let session_id = orchestrator
                .create_user_session(&user, None, workdir.as_deref())
                .await?;
            let mut stream = orchestrator
                .send_message_streaming(&user, &session_id, &message)
                .await?;

            while let Some(item) = stream.next().await {
                match item {
                    Ok(chunk) => {
                        print!("{chunk}");
                        std::io::stdout().flush().ok();
                    }
                    Err(err) => {
                        eprintln!();
                        return Err(err.into());
                    }
                }
            }
            println!();
            orchestrator.shutdown().await;
        }
        Commands::SandboxInfo { user } => {
            let name = container_name_for(&user);
            let workspace = config
                .sandbox
                .workspace_root
                .join(name.trim_start_matches("sandbox-"));
            let sandbox = Sandbox::new(
                ContainerCli::detect()?,
                &user,
                workspace,
                config.sandbox.image.clone(),
                config.sandbox.limits.clone(),
            )?;
            println!("{}", serde_json::to_string_pretty(&sandbox.info().await)?);
        }
    }

    Ok(())
}
