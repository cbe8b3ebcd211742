use std::path::PathBuf;

use clap::{Parser, Subcommand};

use cloud_nightmare::config::ScenarioConfig;
use cloud_nightmare::scenario::Scenario;

#[derive(Parser)]
#[command(name = "cloud-nightmare")]
#[command(version)]
#[command(about = "Scripted AWS account compromise demo", long_about = None)]
struct Cli {
    /// Scenario config file (YAML); defaults apply when omitted
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check the rollout outputs and probe the seeded data resources
    ValidateRollout,
    /// Run the full attack chain against the live account
    LaunchAttack {
        /// Rehearse the drain phases against in-memory stores instead
        #[arg(long)]
        offline: bool,
        /// Skip the narrative pauses between phases
        #[arg(long)]
        no_delay: bool,
    },
    /// Print the rollout outputs
    ShowResources,
    /// Delete attack users, MFA devices and local artifacts
    CleanUp,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("cloud_nightmare=info".parse()?),
        )
        .init();

    let cli = Cli::parse();
    let mut cfg = ScenarioConfig::load(cli.config.as_deref())?;

    match cli.command {
        Commands::ValidateRollout => Scenario::new(cfg).validate_rollout().await?,
        Commands::LaunchAttack { offline, no_delay } => {
            if no_delay {
                cfg.skip_pacing();
            }
            let scenario = Scenario::new(cfg);
            if offline {
                scenario.launch_offline().await?;
            } else {
                scenario.launch_attack().await?;
            }
        }
        Commands::ShowResources => Scenario::new(cfg).show_resources().await?,
        Commands::CleanUp => Scenario::new(cfg).clean_up().await?,
    }
    Ok(())
}
