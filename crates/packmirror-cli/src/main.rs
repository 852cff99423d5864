use anyhow::Result;
use clap::{Parser, Subcommand};
use packmirror_sync::{CronLoop, MirrorEngine, SyncConfig};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "packmirror")]
#[command(about = "Mirrors package manifests and archives into an object store")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one cycle on the cron schedule until interrupted.
    Run,
    /// Run a single cycle and exit.
    Sync,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = SyncConfig::from_env();
    let engine = MirrorEngine::new(config.clone())?;

    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received; finishing current item and stopping");
            signal_cancel.cancel();
        }
    });

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            let cron = CronLoop::new(&config.schedule)?;
            info!(
                schedule = %config.schedule,
                next = %cron.next_occurrence(),
                "starting mirror loop"
            );
            let engine = std::sync::Arc::new(engine);
            let work_cancel = cancel.clone();
            cron.run(cancel.clone(), move || {
                let engine = engine.clone();
                let token = work_cancel.clone();
                async move { engine.run_cycle(&token).await }
            })
            .await;
        }
        Commands::Sync => {
            let summary = engine.run_cycle(&cancel).await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
    }

    Ok(())
}
