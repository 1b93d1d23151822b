use anyhow::Result;
use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "tgrank-cli")]
#[command(about = "Telegram channel rating aggregator")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one fetch cycle and produce a ranked snapshot.
    Run,
    /// Serve the ranked snapshot as a web page.
    Serve,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            let summary = tgrank_rank::run_once_from_env().await?;
            println!(
                "run complete: run_id={} members={} citation={} ranked={} notified={} persisted={} reports={}",
                summary.run_id,
                summary.members_drafts,
                summary.citation_drafts,
                summary.ranked_channels,
                summary.notifications_sent,
                summary.persisted,
                summary.reports_dir
            );
        }
        Commands::Serve => {
            tgrank_web::serve_from_env().await?;
        }
    }

    Ok(())
}
