//! Outrider agent daemon.
//!
//! Usage:
//!     outrider-agent --config /etc/outrider/agent.yaml

use clap::Parser;
use outrider_agent::config::AgentConfig;
use outrider_agent::supervisor::{Agent, RunOutcome};
use outrider_logging::{init_logging, LogSettings};
use outrider_protocol::error::AgentError;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "outrider-agent", about = "Outrider remote-execution agent")]
struct Args {
    /// Path to the agent configuration file (YAML)
    #[arg(long, short = 'c', env = "OUTRIDER_CONFIG")]
    config: Option<PathBuf>,

    /// Override the agent identity
    #[arg(long)]
    id: Option<String>,

    /// Override the controller address
    #[arg(long)]
    master: Option<String>,

    /// Mirror the full log filter to stderr
    #[arg(long, short = 'v')]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    init_logging(LogSettings::new("outrider-agent", args.verbose))?;

    let mut config = match AgentConfig::load(args.config.as_deref()) {
        Ok(config) => config,
        Err(err) => {
            error!("{}", err);
            std::process::exit(AgentError::EX_CONFIG);
        }
    };
    if let Some(id) = args.id {
        config.id = id;
    }
    if let Some(master) = args.master {
        config.master = serde_json::Value::String(master);
    }
    if let Err(err) = config.validate() {
        error!("{}", err);
        std::process::exit(AgentError::EX_CONFIG);
    }

    info!("Starting Outrider agent");
    info!("  Id: {}", config.id);
    info!("  Controller(s): {:?}", config.master_list());
    info!("  Cache: {}", config.cachedir().display());

    // Lost-controller restarts re-enter the whole connect cycle; a
    // clean signal exits.
    loop {
        let mut agent = match Agent::new(config.clone()) {
            Ok(agent) => agent,
            Err(err @ AgentError::ConfigFatal(_)) => {
                error!("{}", err);
                std::process::exit(AgentError::EX_CONFIG);
            }
            Err(err) => return Err(err.into()),
        };
        match agent.run().await {
            Ok(RunOutcome::Shutdown) => break,
            Ok(RunOutcome::Restart) => {
                info!("Restarting after controller loss");
            }
            Err(AgentError::NoController) => {
                error!("No controller reachable; retrying shortly");
            }
            Err(err @ AgentError::ConfigFatal(_)) => {
                error!("{}", err);
                std::process::exit(AgentError::EX_CONFIG);
            }
            Err(err) => {
                error!("Agent stopped with error: {}", err);
            }
        }
        tokio::time::sleep(Duration::from_secs(config.acceptance_wait_time.max(1))).await;
    }

    Ok(())
}
